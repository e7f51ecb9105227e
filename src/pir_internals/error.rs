use std::{error::Error, fmt::Display};

#[derive(Debug, PartialEq)]
pub enum PianoPIRError {
    // Row codec
    InvalidEntryShape,
    VectorDimensionMismatch,
    EncodedRowTooWide,
    DecodeSizeMismatch,
    StringTooLongForFixedRow(usize),
    MismatchedFixedRowLength,
    InvalidFixedRowLengthByte,

    // PIR
    DatabaseShapeMismatch,
    MalformedQueryVector,
    IndexOutOfRange,
    HintMiss,
    HintExhausted,

    // Batch wrapper
    InvalidBatchSize,

    // Router
    MalformedDocId(String),
    DocIdOutOfRange(u64),
    UnknownDigest,

    // Persistence
    FailedToReadBins(String),
    FailedToWriteBins(String),
    FailedToWriteResults(String),
}

impl Display for PianoPIRError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidEntryShape => write!(f, "Entry shape must have a positive vector dimension, a positive row capacity and a byte width divisible by 8."),
            Self::VectorDimensionMismatch => write!(f, "Every vector in an entry must have exactly the declared dimension."),
            Self::EncodedRowTooWide => write!(f, "An entry can hold at most the declared maximum number of vectors."),
            Self::DecodeSizeMismatch => write!(f, "Entry word count is not a whole number of vector rows."),
            Self::StringTooLongForFixedRow(len) => write!(f, "A fixed-width row can carry at most 255 bytes, got {} bytes.", len),
            Self::MismatchedFixedRowLength => write!(f, "All fixed-width rows must have the same length."),
            Self::InvalidFixedRowLengthByte => write!(f, "Fixed-width row length byte exceeds the payload size."),

            Self::DatabaseShapeMismatch => write!(f, "Database word count must equal entry count times words per entry."),
            Self::MalformedQueryVector => write!(f, "A query vector must carry exactly one in-range index per chunk."),
            Self::IndexOutOfRange => write!(f, "Requested entry index lies outside the database."),
            Self::HintMiss => write!(f, "No fresh hint covers the queried chunk offset."),
            Self::HintExhausted => write!(f, "Hint budget is spent; the hint table must be regenerated."),

            Self::InvalidBatchSize => write!(f, "Batch size must allow at least one non-empty partition."),

            Self::MalformedDocId(cell) => write!(f, "Bin cell '{}' is not a decimal document id.", cell),
            Self::DocIdOutOfRange(id) => write!(f, "Document id {} has no row in the embedding matrix.", id),
            Self::UnknownDigest => write!(f, "Decoded vector digest has no document id mapping."),

            Self::FailedToReadBins(e) => write!(f, "Reading the bin file failed with: {}", e),
            Self::FailedToWriteBins(e) => write!(f, "Writing the bin file failed with: {}", e),
            Self::FailedToWriteResults(e) => write!(f, "Writing the results file failed with: {}", e),
        }
    }
}

impl Error for PianoPIRError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        None
    }
}
