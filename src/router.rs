//! Query-time routing: text to bin indices, bin entries back to document
//! ids.
//!
//! Query tokens address bins through the same token-choice hash that placed
//! them at indexing time. Retrieved entries decode to embedding vectors, and
//! each vector's content address looks its document id up in a table built
//! from the embedding matrix, so ids never travel through the PIR channel.

use crate::analyzer::{Analyzer, EnglishAnalyzer};
use crate::batch::SimpleBatchPianoPir;
use crate::codec::{content_address, decode_entry, encode_db, entry_byte_len, trim_zero_rows};
use crate::pir_internals::{
    error::PianoPIRError,
    params::{CONTENT_DIGEST_BYTE_LEN, SEED_BYTE_LEN, WORD_BYTE_LEN},
    prf::hash_token_choice,
};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing::{debug, warn};

#[derive(Clone, Debug, Serialize)]
pub struct RouterConfig {
    /// Embedding dimension.
    pub dim: usize,
    /// Hash placements probed per token.
    pub choices: u32,
    /// Indices the batch layer is sized for per query.
    pub batch_size: u64,
    /// Per-query hint-miss budget, in log2.
    pub failure_prob_log2: u64,
}

/// Private retrieval front end over a materialized bin database.
pub struct QueryRouter<A: Analyzer = EnglishAnalyzer> {
    config: RouterConfig,
    bin_num: u64,
    max_row_size: usize,
    batch: SimpleBatchPianoPir,
    doc_id_by_digest: HashMap<[u8; CONTENT_DIGEST_BYTE_LEN], usize>,
    analyzer: A,
}

impl QueryRouter<EnglishAnalyzer> {
    /// Materializes `bins` into a packed database, preprocesses the batch
    /// PIR over it and indexes the embedding matrix by content address.
    /// Document ids in bin cells are decimal row indices into `embeddings`.
    pub fn build(bins: &[Vec<String>], embeddings: &[Vec<f32>], config: RouterConfig) -> Result<QueryRouter<EnglishAnalyzer>, PianoPIRError> {
        QueryRouter::with_analyzer(EnglishAnalyzer::new(), bins, embeddings, config)
    }
}

impl<A: Analyzer> QueryRouter<A> {
    /// Same as [`QueryRouter::build`] with a caller-chosen analyzer. The
    /// analyzer must be the one the vocabulary was produced with.
    pub fn with_analyzer(analyzer: A, bins: &[Vec<String>], embeddings: &[Vec<f32>], config: RouterConfig) -> Result<QueryRouter<A>, PianoPIRError> {
        let (batch, max_row_size) = materialize(bins, embeddings, &config, None)?;

        let doc_id_by_digest = embeddings.iter().enumerate().map(|(doc_id, vector)| (content_address(vector), doc_id)).collect();

        Ok(QueryRouter {
            config,
            bin_num: bins.len() as u64,
            max_row_size,
            batch,
            doc_id_by_digest,
            analyzer,
        })
    }

    /// Deterministic seeded variant for reproducible runs.
    pub fn with_analyzer_seeded(
        analyzer: A,
        bins: &[Vec<String>],
        embeddings: &[Vec<f32>],
        config: RouterConfig,
        seed: [u8; SEED_BYTE_LEN],
    ) -> Result<QueryRouter<A>, PianoPIRError> {
        let (batch, max_row_size) = materialize(bins, embeddings, &config, Some(seed))?;

        let doc_id_by_digest = embeddings.iter().enumerate().map(|(doc_id, vector)| (content_address(vector), doc_id)).collect();

        Ok(QueryRouter {
            config,
            bin_num: bins.len() as u64,
            max_row_size,
            batch,
            doc_id_by_digest,
            analyzer,
        })
    }

    /// Bin indices addressed by `text`: every analyzed token probed at every
    /// choice. A pure function of the text for a fixed router.
    pub fn make_indices(&self, text: &str) -> Vec<u64> {
        self.analyzer
            .analyze(text)
            .iter()
            .flat_map(|token| (0..self.config.choices).map(move |choice| hash_token_choice(&token.term, choice) % self.bin_num))
            .collect()
    }

    /// Privately fetches every bin `text` addresses and decodes the document
    /// ids found there, in entry row order. Vectors whose digest is unknown
    /// are logged and skipped.
    pub fn search(&mut self, text: &str) -> Result<Vec<String>, PianoPIRError> {
        let indices = self.make_indices(text);
        if indices.is_empty() {
            return Ok(Vec::new());
        }

        let responses = self.batch.query(&indices)?;

        let mut doc_ids = Vec::new();
        for entry in &responses {
            let rows = decode_entry(entry, self.config.dim)?;
            for vector in trim_zero_rows(rows) {
                match self.doc_id_by_digest.get(&content_address(&vector)) {
                    Some(&doc_id) => doc_ids.push(doc_id.to_string()),
                    None => warn!("{}", PianoPIRError::UnknownDigest),
                }
            }
        }

        Ok(doc_ids)
    }

    /// Runs a query stream, rotating hint tables between queries whenever
    /// the batch budget is spent. Keys of the result map are query ids.
    pub fn search_all(&mut self, queries: &[(String, String)]) -> Result<BTreeMap<String, Vec<String>>, PianoPIRError> {
        let mut results = BTreeMap::new();

        for (query_id, text) in queries {
            results.insert(query_id.clone(), self.search(text)?);

            if self.batch.finished_batch_num() >= self.batch.support_batch_num() {
                debug!(query_id = %query_id, "batch budget spent, rotating");
                self.batch.preprocessing();
            }
        }

        Ok(results)
    }

    #[inline]
    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    #[inline]
    pub fn bin_num(&self) -> u64 {
        self.bin_num
    }

    /// Vector slots per entry after word alignment.
    #[inline]
    pub fn max_row_size(&self) -> usize {
        self.max_row_size
    }

    #[inline]
    pub fn batch(&self) -> &SimpleBatchPianoPir {
        &self.batch
    }
}

// Resolves bin cells against the embedding matrix, packs the database and
// stands the batch PIR up over it.
fn materialize(
    bins: &[Vec<String>],
    embeddings: &[Vec<f32>],
    config: &RouterConfig,
    seed: Option<[u8; SEED_BYTE_LEN]>,
) -> Result<(SimpleBatchPianoPir, usize), PianoPIRError> {
    let mut max_row_size = bins.iter().map(Vec::len).max().unwrap_or(0).max(1);
    // Entries must pack into whole words.
    while entry_byte_len(config.dim, max_row_size) % WORD_BYTE_LEN != 0 {
        max_row_size += 1;
    }

    let mut rows = Vec::with_capacity(bins.len());
    let mut padded_slots = 0usize;
    for bin in bins {
        let mut row = Vec::with_capacity(max_row_size);
        for cell in bin {
            let doc_id: u64 = cell.parse().map_err(|_| PianoPIRError::MalformedDocId(cell.clone()))?;
            let vector = embeddings.get(doc_id as usize).ok_or(PianoPIRError::DocIdOutOfRange(doc_id))?;
            row.push(vector.clone());
        }
        padded_slots += max_row_size - row.len();
        rows.push(row);
    }

    let entry_bytes = entry_byte_len(config.dim, max_row_size) as u64;
    debug!(
        bins = bins.len(),
        max_row_size,
        entry_bytes,
        padded_slots,
        db_mb = (bins.len() as u64 * entry_bytes) as f64 / 1024.0 / 1024.0,
        "materializing bin database"
    );

    let raw_db = encode_db(&rows, config.dim, max_row_size)?;

    let mut batch = match seed {
        Some(seed) => SimpleBatchPianoPir::new_seeded(bins.len() as u64, entry_bytes, config.batch_size, raw_db, config.failure_prob_log2, seed)?,
        None => SimpleBatchPianoPir::new(bins.len() as u64, entry_bytes, config.batch_size, raw_db, config.failure_prob_log2)?,
    };
    batch.preprocessing();

    Ok((batch, max_row_size))
}

/// Writes results as an indented JSON object mapping each query id to its
/// ordered document-id list.
pub fn write_results_json<P: AsRef<Path>>(path: P, results: &BTreeMap<String, Vec<String>>) -> Result<(), PianoPIRError> {
    let file = File::create(path).map_err(|e| PianoPIRError::FailedToWriteResults(e.to_string()))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, results).map_err(|e| PianoPIRError::FailedToWriteResults(e.to_string()))?;
    writer.flush().map_err(|e| PianoPIRError::FailedToWriteResults(e.to_string()))
}

#[cfg(test)]
mod test {
    use super::*;

    fn axis_embeddings(n: usize, dim: usize) -> Vec<Vec<f32>> {
        (0..n)
            .map(|i| {
                let mut v = vec![0.0f32; dim];
                v[i % dim] = (i + 1) as f32;
                v
            })
            .collect()
    }

    fn toy_router() -> QueryRouter<EnglishAnalyzer> {
        // "alpha" hashes to bin 0 and "beta" to bin 1 at two bins.
        let bins = vec![vec!["0".to_string()], vec!["1".to_string()]];
        let embeddings = axis_embeddings(2, 2);
        let config = RouterConfig {
            dim: 2,
            choices: 1,
            batch_size: 2,
            failure_prob_log2: 8,
        };
        QueryRouter::with_analyzer_seeded(EnglishAnalyzer::new(), &bins, &embeddings, config, [11u8; 32]).unwrap()
    }

    #[test]
    fn make_indices_is_pure_and_bounded() {
        let router = toy_router();

        let a = router.make_indices("alpha beta alpha");
        let b = router.make_indices("alpha beta alpha");
        assert_eq!(a, b);
        assert_eq!(a.len(), 3);
        assert!(a.iter().all(|&i| i < 2));
    }

    #[test]
    fn single_term_query_returns_its_bin_contents() {
        let mut router = toy_router();
        assert_eq!(router.search("alpha").unwrap(), vec!["0"]);
        assert_eq!(router.search("beta").unwrap(), vec!["1"]);
    }

    #[test]
    fn query_with_no_tokens_returns_nothing() {
        let mut router = toy_router();
        assert_eq!(router.search("... the ...").unwrap(), Vec::<String>::new());
    }

    #[test]
    fn malformed_and_dangling_bin_cells_fail_the_build() {
        let embeddings = axis_embeddings(2, 2);
        let config = RouterConfig {
            dim: 2,
            choices: 1,
            batch_size: 2,
            failure_prob_log2: 8,
        };

        let bad = vec![vec!["zero".to_string()], vec![]];
        assert!(matches!(
            QueryRouter::build(&bad, &embeddings, config.clone()),
            Err(PianoPIRError::MalformedDocId(_))
        ));

        let dangling = vec![vec!["7".to_string()], vec![]];
        assert!(matches!(
            QueryRouter::build(&dangling, &embeddings, config),
            Err(PianoPIRError::DocIdOutOfRange(7))
        ));
    }

    #[test]
    fn row_capacity_rounds_up_to_word_alignment() {
        // dim 3: 12 bytes per vector, so capacity must be even.
        let bins = vec![vec!["0".to_string()], vec!["1".to_string()], vec![], vec![]];
        let embeddings = axis_embeddings(2, 3);
        let config = RouterConfig {
            dim: 3,
            choices: 1,
            batch_size: 2,
            failure_prob_log2: 8,
        };

        let router = QueryRouter::with_analyzer_seeded(EnglishAnalyzer::new(), &bins, &embeddings, config, [12u8; 32]).unwrap();
        assert_eq!(router.max_row_size(), 2);
    }

    #[test]
    fn search_all_writes_an_indented_results_object() {
        let mut router = toy_router();

        let queries = vec![
            ("q1".to_string(), "alpha".to_string()),
            ("q2".to_string(), "beta".to_string()),
        ];
        let results = router.search_all(&queries).unwrap();
        assert_eq!(results["q1"], vec!["0"]);
        assert_eq!(results["q2"], vec!["1"]);

        let path = std::env::temp_dir().join(format!("piano-pir-results-{}.json", std::process::id()));
        write_results_json(&path, &results).unwrap();
        let raw = std::fs::read_to_string(&path).unwrap();
        std::fs::remove_file(&path).ok();

        let parsed: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed["q1"][0], "0");
        assert!(raw.contains("\n  \"q1\""));
    }
}
