//! Packing of fixed-width embedding entries into 64-bit words and back.
//!
//! A database entry holds up to `max_row_size` vectors of `dim` f32s; shorter
//! entries are padded with all-zero vectors. Each f32 is serialized as 4
//! little-endian bytes and the entry's byte string is reinterpreted as
//! little-endian u64 words, which is the representation the PIR arithmetic
//! operates on.

use crate::pir_internals::{
    branch_opt_util,
    error::PianoPIRError,
    params::{CONTENT_DIGEST_BYTE_LEN, WORD_BYTE_LEN},
};
use sha2::{Digest, Sha256};

const F32_BYTE_LEN: usize = 4;

/// Byte width of one entry: `dim * 4 * max_row_size`.
#[inline]
pub const fn entry_byte_len(dim: usize, max_row_size: usize) -> usize {
    dim * F32_BYTE_LEN * max_row_size
}

fn validate_entry_shape(dim: usize, max_row_size: usize) -> Result<(), PianoPIRError> {
    if branch_opt_util::unlikely(dim == 0 || max_row_size == 0 || entry_byte_len(dim, max_row_size) % WORD_BYTE_LEN != 0) {
        return Err(PianoPIRError::InvalidEntryShape);
    }
    Ok(())
}

/// Encodes one entry: up to `max_row_size` vectors of exactly `dim` f32s,
/// zero-padded to the full entry width and packed into words.
///
/// # Arguments
///
/// * `row` - The vectors stored in this entry.
/// * `dim` - The vector dimension.
/// * `max_row_size` - The number of vector slots per entry.
///
/// # Returns
///
/// A Result holding `dim * 4 * max_row_size / 8` words, or an error if the
/// shape is invalid, the row is too wide, or any vector has the wrong
/// dimension.
pub fn encode_row(row: &[Vec<f32>], dim: usize, max_row_size: usize) -> Result<Vec<u64>, PianoPIRError> {
    validate_entry_shape(dim, max_row_size)?;
    if branch_opt_util::unlikely(row.len() > max_row_size) {
        return Err(PianoPIRError::EncodedRowTooWide);
    }

    let byte_len = entry_byte_len(dim, max_row_size);
    let mut bytes = vec![0u8; byte_len];

    for (vec_idx, vector) in row.iter().enumerate() {
        if branch_opt_util::unlikely(vector.len() != dim) {
            return Err(PianoPIRError::VectorDimensionMismatch);
        }

        let vec_offset = vec_idx * dim * F32_BYTE_LEN;
        for (elem_idx, &value) in vector.iter().enumerate() {
            let at = vec_offset + elem_idx * F32_BYTE_LEN;
            bytes[at..at + F32_BYTE_LEN].copy_from_slice(&value.to_bits().to_le_bytes());
        }
    }

    let words = bytes
        .chunks_exact(WORD_BYTE_LEN)
        .map(|window| {
            let mut word = [0u8; WORD_BYTE_LEN];
            word.copy_from_slice(window);
            u64::from_le_bytes(word)
        })
        .collect();

    Ok(words)
}

/// Encodes a whole database of entries; the result has
/// `rows.len() * dim * 4 * max_row_size / 8` words.
pub fn encode_db(rows: &[Vec<Vec<f32>>], dim: usize, max_row_size: usize) -> Result<Vec<u64>, PianoPIRError> {
    validate_entry_shape(dim, max_row_size)?;

    let entry_words = entry_byte_len(dim, max_row_size) / WORD_BYTE_LEN;
    let mut words = Vec::with_capacity(rows.len() * entry_words);

    for row in rows {
        words.extend(encode_row(row, dim, max_row_size)?);
    }

    Ok(words)
}

/// Decodes one entry back into its vectors, padding included. The row count
/// is inferred from the entry width and must divide evenly.
pub fn decode_entry(entry: &[u64], dim: usize) -> Result<Vec<Vec<f32>>, PianoPIRError> {
    if branch_opt_util::unlikely(dim == 0 || entry.is_empty()) {
        return Err(PianoPIRError::DecodeSizeMismatch);
    }

    let byte_len = entry.len() * WORD_BYTE_LEN;
    let bytes_per_row = dim * F32_BYTE_LEN;
    if branch_opt_util::unlikely(byte_len % bytes_per_row != 0) {
        return Err(PianoPIRError::DecodeSizeMismatch);
    }

    let mut bytes = Vec::with_capacity(byte_len);
    for &word in entry {
        bytes.extend_from_slice(&word.to_le_bytes());
    }

    let rows = bytes
        .chunks_exact(bytes_per_row)
        .map(|row_bytes| {
            row_bytes
                .chunks_exact(F32_BYTE_LEN)
                .map(|window| {
                    let mut bits = [0u8; F32_BYTE_LEN];
                    bits.copy_from_slice(window);
                    f32::from_bits(u32::from_le_bytes(bits))
                })
                .collect()
        })
        .collect();

    Ok(rows)
}

/// Drops every all-zero vector, order-preserving. All-zero payload vectors
/// are indistinguishable from padding and are dropped with it.
pub fn trim_zero_rows(rows: Vec<Vec<f32>>) -> Vec<Vec<f32>> {
    rows.into_iter().filter(|row| row.iter().any(|&x| x != 0.0)).collect()
}

/// SHA-256 over the little-endian f32 bits of a vector: a stable identity
/// independent of where the vector is stored.
pub fn content_address(vector: &[f32]) -> [u8; CONTENT_DIGEST_BYTE_LEN] {
    let mut bytes = Vec::with_capacity(vector.len() * F32_BYTE_LEN);
    for &value in vector {
        bytes.extend_from_slice(&value.to_bits().to_le_bytes());
    }

    Sha256::digest(&bytes).into()
}

/// Packs strings into equal-width byte rows of shape
/// `[length byte | payload | zero padding]`. Strings longer than 255 bytes
/// are rejected.
///
/// # Returns
///
/// The rows and the shared row width (1 + longest payload).
pub fn fixed_rows_from_strings(strings: &[String]) -> Result<(Vec<Vec<u8>>, usize), PianoPIRError> {
    let mut max_payload = 0;
    for s in strings {
        if branch_opt_util::unlikely(s.len() > u8::MAX as usize) {
            return Err(PianoPIRError::StringTooLongForFixedRow(s.len()));
        }
        max_payload = max_payload.max(s.len());
    }

    let row_size = 1 + max_payload;
    let rows = strings
        .iter()
        .map(|s| {
            let mut row = vec![0u8; row_size];
            row[0] = s.len() as u8;
            row[1..1 + s.len()].copy_from_slice(s.as_bytes());
            row
        })
        .collect();

    Ok((rows, row_size))
}

/// Reverses [`fixed_rows_from_strings`]; every row must share one width and
/// carry a length byte no larger than its payload.
pub fn strings_from_fixed_rows(rows: &[Vec<u8>]) -> Result<Vec<String>, PianoPIRError> {
    let Some(first) = rows.first() else {
        return Ok(Vec::new());
    };
    let row_size = first.len();

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        if branch_opt_util::unlikely(row.len() != row_size) {
            return Err(PianoPIRError::MismatchedFixedRowLength);
        }

        let payload_len = row[0] as usize;
        if branch_opt_util::unlikely(payload_len > row_size - 1) {
            return Err(PianoPIRError::InvalidFixedRowLengthByte);
        }

        out.push(String::from_utf8_lossy(&row[1..1 + payload_len]).into_owned());
    }

    Ok(out)
}
