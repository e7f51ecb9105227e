//! Token-to-bin assignment over an external lexical index, and the bin
//! file's on-disk form.
//!
//! A bin is one database entry: the union of the top-scoring document ids of
//! every vocabulary term that hashes into it. Terms are placed with
//! `choices` independent hashes so hot terms spread their load.

use crate::codec::fixed_rows_from_strings;
use crate::pir_internals::{error::PianoPIRError, prf::hash_token_choice};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use tracing::debug;

/// Capability offered by the inverted-index collaborator. Only used while
/// building the database, never on the query path.
pub trait LexicalIndex {
    /// Top-`k` documents for a single-term query, best first.
    fn search_top_k(&self, term: &str, k: usize) -> Vec<(String, f32)>;

    /// Every document id known to the index.
    fn iter_all_docs(&self) -> Box<dyn Iterator<Item = String> + '_>;
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BinConfig {
    /// Documents kept per term.
    pub top_k: usize,
    /// Independent hash placements per term.
    pub choices: u32,
    /// Bin count; also the PIR database size.
    pub max_bins: u64,
    /// Terms with this many hits or fewer are dropped.
    pub threshold: usize,
}

/// Assigns every vocabulary term's top documents to `choices` bins. Bin
/// contents are deduplicated and sorted, so the same index and vocabulary
/// always produce the same bin file.
pub fn build_unigram_bins<I, V>(index: &I, vocab: V, config: &BinConfig) -> Vec<Vec<String>>
where
    I: LexicalIndex + ?Sized,
    V: IntoIterator,
    V::Item: AsRef<str>,
{
    let mut bins: Vec<BTreeSet<String>> = (0..config.max_bins).map(|_| BTreeSet::new()).collect();

    let mut kept_terms = 0u64;
    let mut dropped_terms = 0u64;

    for term in vocab {
        let term = term.as_ref();
        let hits = index.search_top_k(term, config.top_k);
        if hits.len() <= config.threshold {
            dropped_terms += 1;
            continue;
        }
        kept_terms += 1;

        let doc_ids: Vec<String> = hits.into_iter().map(|(doc_id, _)| doc_id).collect();
        for choice in 0..config.choices {
            let bin = (hash_token_choice(term, choice) % config.max_bins) as usize;
            bins[bin].extend(doc_ids.iter().cloned());
        }
    }

    debug!(kept_terms, dropped_terms, bins = bins.len(), "unigram binning done");

    bins.into_iter().map(|set| set.into_iter().collect()).collect()
}

/// Streams every document id out of the index into equal-width byte rows, a
/// payload shape the word packer accepts directly.
pub fn doc_id_rows<I>(index: &I) -> Result<(Vec<Vec<u8>>, usize), PianoPIRError>
where
    I: LexicalIndex + ?Sized,
{
    let doc_ids: Vec<String> = index.iter_all_docs().collect();
    fixed_rows_from_strings(&doc_ids)
}

/// Writes bins as CSV, one row per bin, one document id per cell. Rows are
/// ragged; an empty bin becomes a single empty cell.
pub fn write_bins_csv<P: AsRef<Path>>(path: P, bins: &[Vec<String>]) -> Result<(), PianoPIRError> {
    let mut writer = csv::WriterBuilder::new()
        .flexible(true)
        .from_path(path)
        .map_err(|e| PianoPIRError::FailedToWriteBins(e.to_string()))?;

    for bin in bins {
        if bin.is_empty() {
            writer.write_record([""]).map_err(|e| PianoPIRError::FailedToWriteBins(e.to_string()))?;
        } else {
            writer.write_record(bin).map_err(|e| PianoPIRError::FailedToWriteBins(e.to_string()))?;
        }
    }

    writer.flush().map_err(|e| PianoPIRError::FailedToWriteBins(e.to_string()))
}

/// Reads a bin file written by [`write_bins_csv`]. Empty cells are skipped,
/// so empty bins come back empty.
pub fn read_bins_csv<P: AsRef<Path>>(path: P) -> Result<Vec<Vec<String>>, PianoPIRError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(path)
        .map_err(|e| PianoPIRError::FailedToReadBins(e.to_string()))?;

    let mut bins = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| PianoPIRError::FailedToReadBins(e.to_string()))?;
        bins.push(record.iter().filter(|cell| !cell.is_empty()).map(str::to_string).collect());
    }

    Ok(bins)
}
