//! Batch PIR over a partitioned database.
//!
//! The database is sharded into `batch_size / REAL_QUERY_PER_PARTITION`
//! partitions, each served by its own independent [`PianoPir`] instance. A
//! batch of global indices is routed into per-partition buckets, every
//! partition answers the same fixed number of queries per batch (short
//! buckets are padded with dummies), and responses line up positionally with
//! the input. When the hint budget of the partitions runs low the wrapper
//! regenerates every hint table in parallel.

use crate::piano::{DbWords, PianoPir};
use crate::pir_internals::{
    branch_opt_util,
    error::PianoPIRError,
    params::{DEFAULT_VALUE, QUERY_PER_PARTITION, REAL_QUERY_PER_PARTITION, SEED_BYTE_LEN, WORD_BYTE_LEN},
};
use rand::prelude::*;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use serde::Serialize;
use std::time::Instant;
use tracing::{debug, warn};

#[derive(Clone, Debug, Serialize)]
pub struct BatchConfig {
    pub db_entry_byte_num: u64,
    pub db_entry_words: u64,
    pub db_size: u64,
    pub batch_size: u64,
    pub partition_num: u64,
    pub partition_size: u64,
    pub failure_prob_log2: u64,
}

/// Cost figures recorded on every preprocessing pass.
#[derive(Clone, Debug, Default, Serialize)]
pub struct BatchStats {
    pub support_batch_num: u64,
    pub local_storage: u64,
    pub preprocessing_time: f64,
    pub comm_cost_per_batch_online: u64,
    pub comm_cost_per_batch_offline: u64,
}

pub struct SimpleBatchPianoPir {
    config: BatchConfig,
    sub_pir: Vec<PianoPir>,
    finished_batch_num: u64,
    queries_made_in_partition: u64,
    stats: BatchStats,
}

impl SimpleBatchPianoPir {
    /// Shards `raw_db` into independent partitions, each with its own keys.
    ///
    /// # Arguments
    ///
    /// * `db_size` - Total entry count.
    /// * `db_entry_byte_num` - Bytes per entry; must be divisible by 8.
    /// * `batch_size` - Indices per batch the caller intends to send.
    /// * `raw_db` - The packed word array, `db_size * db_entry_byte_num / 8` long.
    /// * `failure_prob_log2` - Per-query hint-miss budget, in log2.
    pub fn new(
        db_size: u64,
        db_entry_byte_num: u64,
        batch_size: u64,
        raw_db: Vec<u64>,
        failure_prob_log2: u64,
    ) -> Result<SimpleBatchPianoPir, PianoPIRError> {
        let mut seed = [0u8; SEED_BYTE_LEN];
        ChaCha8Rng::from_os_rng().fill_bytes(&mut seed);
        SimpleBatchPianoPir::new_seeded(db_size, db_entry_byte_num, batch_size, raw_db, failure_prob_log2, seed)
    }

    /// Same as [`SimpleBatchPianoPir::new`] with an explicit master seed;
    /// every partition derives its own key stream from it.
    pub fn new_seeded(
        db_size: u64,
        db_entry_byte_num: u64,
        batch_size: u64,
        raw_db: Vec<u64>,
        failure_prob_log2: u64,
        seed: [u8; SEED_BYTE_LEN],
    ) -> Result<SimpleBatchPianoPir, PianoPIRError> {
        if branch_opt_util::unlikely(db_entry_byte_num == 0 || db_entry_byte_num % WORD_BYTE_LEN as u64 != 0) {
            return Err(PianoPIRError::InvalidEntryShape);
        }
        let db_entry_words = db_entry_byte_num / WORD_BYTE_LEN as u64;
        if branch_opt_util::unlikely(raw_db.len() as u64 != db_size * db_entry_words) {
            return Err(PianoPIRError::DatabaseShapeMismatch);
        }

        let partition_num = batch_size / REAL_QUERY_PER_PARTITION;
        if branch_opt_util::unlikely(partition_num == 0) {
            return Err(PianoPIRError::InvalidBatchSize);
        }
        let partition_size = db_size.div_ceil(partition_num);
        // Every partition must own at least one entry.
        if branch_opt_util::unlikely((partition_num - 1) * partition_size >= db_size) {
            return Err(PianoPIRError::InvalidBatchSize);
        }

        let config = BatchConfig {
            db_entry_byte_num,
            db_entry_words,
            db_size,
            batch_size,
            partition_num,
            partition_size,
            failure_prob_log2,
        };

        let db = DbWords::from_vec(raw_db);
        let mut seed_rng = ChaCha8Rng::from_seed(seed);

        let mut sub_pir = Vec::with_capacity(partition_num as usize);
        for i in 0..partition_num {
            let start = i * partition_size;
            let end = ((i + 1) * partition_size).min(db_size);
            debug!(partition = i, start, end, "partition layout");

            let mut sub_seed = [0u8; SEED_BYTE_LEN];
            seed_rng.fill_bytes(&mut sub_seed);

            let words = db.slice((start * db_entry_words) as usize, ((end - start) * db_entry_words) as usize);
            sub_pir.push(PianoPir::new_seeded(end - start, db_entry_byte_num, words, failure_prob_log2, sub_seed)?);
        }

        Ok(SimpleBatchPianoPir {
            config,
            sub_pir,
            finished_batch_num: 0,
            queries_made_in_partition: 0,
            stats: BatchStats::default(),
        })
    }

    /// Logs the derived layout and amortized cost figures at debug level.
    pub fn print_info(&self) {
        let db_bytes = self.config.db_size * self.config.db_entry_byte_num;
        let max_query = self.sub_pir[0].max_query_num() / QUERY_PER_PARTITION;

        debug!(
            db_mb = db_bytes as f64 / 1024.0 / 1024.0,
            db_size = self.config.db_size,
            entry_bytes = self.config.db_entry_byte_num,
            batch_size = self.config.batch_size,
            partition_num = self.config.partition_num,
            partition_size = self.config.partition_size,
            failure_prob_log2 = self.config.failure_prob_log2,
            "batch layout"
        );
        debug!(
            supported_batches = max_query,
            max_query_per_chunk = self.sub_pir[0].max_query_per_chunk(),
            storage_mb = self.local_storage_size() as f64 / 1024.0 / 1024.0,
            online_kb_per_batch = self.comm_cost_per_batch_online() as f64 / 1024.0,
            amortized_offline_kb = db_bytes as f64 / max_query.max(1) as f64 / 1024.0,
            "batch cost"
        );
    }

    /// Regenerates every partition's hint table in parallel and resets the
    /// batch counters.
    pub fn preprocessing(&mut self) {
        self.print_info();

        self.finished_batch_num = 0;
        self.queries_made_in_partition = 0;

        let started = Instant::now();
        self.sub_pir.par_iter_mut().for_each(|sub| sub.preprocessing());
        let elapsed = started.elapsed().as_secs_f64();

        debug!(seconds = elapsed, "preprocessing finished");
        self.record_stats(elapsed);
    }

    /// Zero-cost stand-in for [`SimpleBatchPianoPir::preprocessing`]:
    /// allocates hint state without scanning, for benchmarking the online
    /// path alone.
    pub fn dummy_preprocessing(&mut self) {
        self.print_info();

        self.finished_batch_num = 0;
        self.queries_made_in_partition = 0;
        for sub in self.sub_pir.iter_mut() {
            sub.dummy_preprocessing();
        }

        debug!("skipping offline scan");
        self.record_stats(0.0);
    }

    fn record_stats(&mut self, preprocessing_time: f64) {
        let support_batch_num = self.sub_pir[0].max_query_num() / QUERY_PER_PARTITION;
        let db_bytes = self.config.db_size * self.config.db_entry_byte_num;

        self.stats = BatchStats {
            support_batch_num,
            local_storage: self.local_storage_size(),
            preprocessing_time,
            comm_cost_per_batch_online: self.comm_cost_per_batch_online(),
            comm_cost_per_batch_offline: db_bytes / support_batch_num.max(1),
        };
    }

    /// Answers a batch of global indices. `response[k]` decodes the entry at
    /// `indices[k]`; repeated indices are answered independently. An index
    /// equal to [`DEFAULT_VALUE`] is a caller-side dummy sentinel and yields
    /// a zero response at its position, as does any real slot beyond the
    /// per-partition budget of this batch.
    pub fn query(&mut self, indices: &[u64]) -> Result<Vec<Vec<u64>>, PianoPIRError> {
        let query_num_to_make = (indices.len() as u64).div_ceil(self.config.partition_num).max(2);

        // Rotate up front if this batch would overrun the hint budget.
        let threshold = self.sub_pir[0].max_query_num().saturating_sub(2);
        if self.queries_made_in_partition + query_num_to_make > threshold {
            debug!(
                made = self.queries_made_in_partition,
                batch_cost = query_num_to_make,
                "hint budget low, rotating before batch"
            );
            self.preprocessing();
        }

        let mut buckets: Vec<Vec<(usize, u64)>> = vec![Vec::new(); self.config.partition_num as usize];
        for (position, &global) in indices.iter().enumerate() {
            if global == DEFAULT_VALUE {
                continue;
            }
            if branch_opt_util::unlikely(global >= self.config.db_size) {
                return Err(PianoPIRError::IndexOutOfRange);
            }
            let partition = global / self.config.partition_size;
            let local = global - partition * self.config.partition_size;
            buckets[partition as usize].push((position, local));
        }

        let mut responses = vec![vec![0u64; self.config.db_entry_words as usize]; indices.len()];
        for (partition, bucket) in buckets.iter().enumerate() {
            let real_num = bucket.len().min(query_num_to_make as usize);
            if branch_opt_util::unlikely(bucket.len() > real_num) {
                warn!(partition, dropped = bucket.len() - real_num, "bucket over batch budget, dropping slots");
            }

            for &(position, local) in &bucket[..real_num] {
                responses[position] = self.query_partition(partition, local)?;
            }
            for _ in real_num..query_num_to_make as usize {
                self.sub_pir[partition].query(0, false)?;
            }
        }

        if self.queries_made_in_partition + query_num_to_make >= threshold {
            debug!(
                finished_batches = self.finished_batch_num,
                queries_in_partition = self.queries_made_in_partition,
                "hint budget spent, rotating"
            );
            self.preprocessing();
        } else {
            self.finished_batch_num += indices.len() as u64 / self.config.batch_size;
            self.queries_made_in_partition += query_num_to_make;
        }

        Ok(responses)
    }

    // A hint miss is expected about once in 2^failure_prob_log2 queries:
    // regenerate this partition's table and retry once.
    fn query_partition(&mut self, partition: usize, local: u64) -> Result<Vec<u64>, PianoPIRError> {
        match self.sub_pir[partition].query(local, true) {
            Err(PianoPIRError::HintMiss) => {
                warn!(partition, local, "hint miss, regenerating partition hints");
                self.sub_pir[partition].preprocessing();
                self.sub_pir[partition].query(local, true)
            }
            other => other,
        }
    }

    #[inline]
    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    #[inline]
    pub fn stats(&self) -> &BatchStats {
        &self.stats
    }

    #[inline]
    pub fn finished_batch_num(&self) -> u64 {
        self.finished_batch_num
    }

    #[inline]
    pub fn queries_made_in_partition(&self) -> u64 {
        self.queries_made_in_partition
    }

    /// Batches the current hint tables can serve before rotation.
    #[inline]
    pub fn support_batch_num(&self) -> u64 {
        self.stats.support_batch_num
    }

    /// Client-side hint state across all partitions, in bytes.
    pub fn local_storage_size(&self) -> u64 {
        self.sub_pir.iter().map(|sub| sub.local_storage_size()).sum()
    }

    /// Online bytes exchanged for one full batch.
    pub fn comm_cost_per_batch_online(&self) -> u64 {
        self.sub_pir.iter().map(|sub| sub.comm_cost_per_query() * QUERY_PER_PARTITION).sum()
    }

    pub fn comm_cost_per_batch_offline(&self) -> u64 {
        self.stats.comm_cost_per_batch_offline
    }

    pub fn preprocessing_time(&self) -> f64 {
        self.stats.preprocessing_time
    }

    #[cfg(test)]
    pub(crate) fn sub_pir(&self) -> &[PianoPir] {
        &self.sub_pir
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn word_batch(db_size: u64, batch_size: u64, seed: u8) -> SimpleBatchPianoPir {
        let raw_db: Vec<u64> = (0..db_size).map(|i| i << 8 | 0xa5).collect();
        let mut batch = SimpleBatchPianoPir::new_seeded(db_size, 8, batch_size, raw_db, 8, [seed; 32]).unwrap();
        batch.preprocessing();
        batch
    }

    #[test]
    fn construction_rejects_bad_shapes() {
        assert!(matches!(
            SimpleBatchPianoPir::new_seeded(16, 8, 4, vec![0; 15], 8, [0; 32]),
            Err(PianoPIRError::DatabaseShapeMismatch)
        ));
        assert!(matches!(
            SimpleBatchPianoPir::new_seeded(16, 8, 1, vec![0; 16], 8, [0; 32]),
            Err(PianoPIRError::InvalidBatchSize)
        ));
        assert!(matches!(
            SimpleBatchPianoPir::new_seeded(2, 8, 64, vec![0; 2], 8, [0; 32]),
            Err(PianoPIRError::InvalidBatchSize)
        ));
    }

    #[test]
    fn every_index_decodes_to_its_raw_entry() {
        let mut batch = word_batch(16, 4, 1);

        // Two partitions of 8: draw two indices from each per batch.
        for base in (0..8).step_by(2) {
            let indices = [base, base + 1, base + 8, base + 9];
            let responses = batch.query(&indices).unwrap();
            assert_eq!(responses.len(), indices.len());
            for (k, &g) in indices.iter().enumerate() {
                assert_eq!(responses[k], vec![g << 8 | 0xa5], "index {}", g);
            }
        }
    }

    #[test]
    fn short_last_partition_is_addressed_by_its_own_size() {
        // 10 entries over 3 partitions of ceil(10/3) = 4: the last holds 2.
        let mut batch = word_batch(10, 6, 2);
        assert_eq!(batch.config().partition_num, 3);
        assert_eq!(batch.config().partition_size, 4);

        let responses = batch.query(&[8, 9]).unwrap();
        assert_eq!(responses[0], vec![8u64 << 8 | 0xa5]);
        assert_eq!(responses[1], vec![9u64 << 8 | 0xa5]);
    }

    #[test]
    fn repeated_indices_are_answered_independently() {
        let mut batch = word_batch(16, 4, 3);

        let responses = batch.query(&[5, 5, 8, 9]).unwrap();
        assert_eq!(responses[0], vec![5u64 << 8 | 0xa5]);
        assert_eq!(responses[1], vec![5u64 << 8 | 0xa5]);
        assert_eq!(responses[2], vec![8u64 << 8 | 0xa5]);
        assert_eq!(responses[3], vec![9u64 << 8 | 0xa5]);
    }

    #[test]
    fn sentinel_indices_yield_zero_responses() {
        let mut batch = word_batch(16, 4, 4);

        let responses = batch.query(&[DEFAULT_VALUE, 3, DEFAULT_VALUE, 7]).unwrap();
        assert_eq!(responses[0], vec![0u64]);
        assert_eq!(responses[1], vec![3u64 << 8 | 0xa5]);
        assert_eq!(responses[2], vec![0u64]);
        assert_eq!(responses[3], vec![7u64 << 8 | 0xa5]);
    }

    #[test]
    fn out_of_range_index_fails_the_batch() {
        let mut batch = word_batch(16, 4, 5);
        assert_eq!(batch.query(&[16, 0]), Err(PianoPIRError::IndexOutOfRange));
    }

    #[test]
    fn over_budget_bucket_slots_fall_back_to_zero() {
        let mut batch = word_batch(16, 4, 6);

        // Four hits in one partition against a per-batch budget of two.
        let responses = batch.query(&[0, 1, 2, 3]).unwrap();
        assert_eq!(responses[0], vec![0u64 << 8 | 0xa5]);
        assert_eq!(responses[1], vec![1u64 << 8 | 0xa5]);
        assert_eq!(responses[2], vec![0u64]);
        assert_eq!(responses[3], vec![0u64]);
    }

    #[test]
    fn counters_advance_and_reset_around_rotation() {
        let mut batch = word_batch(16, 4, 7);
        let budget = batch.sub_pir()[0].max_query_num();
        assert!(batch.support_batch_num() > 0);

        let mut saw_reset = false;
        let mut previous = 0u64;
        for round in 0..4 * budget {
            let base = (round % 4) * 2;
            let indices = [base, base + 1, base + 8, base + 9];
            let responses = batch.query(&indices).unwrap();
            for (k, &g) in indices.iter().enumerate() {
                assert_eq!(responses[k], vec![g << 8 | 0xa5]);
            }

            let now = batch.queries_made_in_partition();
            assert!(now <= budget.saturating_sub(2));
            if now < previous {
                saw_reset = true;
            }
            previous = now;
        }
        assert!(saw_reset);
    }
}
