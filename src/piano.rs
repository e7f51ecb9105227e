//! Single-database PIR with offline hint preprocessing and sublinear online
//! cost.
//!
//! The client streams the database once offline and keeps a table of hint
//! rows, each a pseudorandom set holding one entry per chunk together with
//! the XOR of those entries. An online query spends one hint: the set is sent
//! with its target-chunk slot swapped for a pre-sampled uniform offset, the
//! server answers with one XOR over the requested column, and the client
//! cancels everything it already knows. The spent row is refreshed in place
//! from a per-chunk spare pool, so the table serves a bounded number of
//! queries before the offline pass must run again.

use crate::pir_internals::{
    branch_opt_util,
    error::PianoPIRError,
    hints::{xor_words, BackupHint, PrimaryHint, Replacement},
    params::{BACKUP_SLACK_FACTOR, SEED_BYTE_LEN, WORD_BYTE_LEN},
    prf::SetKey,
};
use rand::prelude::*;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use std::sync::Arc;
use tracing::debug;

/// Derived shape and capacity parameters of one PIR instance.
#[derive(Clone, Debug)]
pub struct PianoConfig {
    pub db_size: u64,
    pub entry_byte_len: u64,
    pub entry_words: usize,
    pub chunk_size: u64,
    pub chunk_num: u64,
    pub primary_hint_num: u64,
    pub max_query_num: u64,
    pub max_query_per_chunk: u64,
    pub failure_prob_log2: u64,
}

impl PianoConfig {
    /// Derives chunk layout and hint budgets for a database of `db_size`
    /// entries of `entry_byte_len` bytes each.
    ///
    /// Chunks are `ceil(sqrt(db_size))` entries wide. The primary table holds
    /// `chunk_size * failure_prob_log2 * ln 2` rows, putting the chance that
    /// no row covers a queried offset at about `2^-failure_prob_log2`. Each
    /// chunk gets a spare pool three times its expected share of the query
    /// budget.
    pub fn derive(db_size: u64, entry_byte_len: u64, failure_prob_log2: u64) -> Result<PianoConfig, PianoPIRError> {
        if branch_opt_util::unlikely(db_size == 0 || entry_byte_len == 0 || entry_byte_len % WORD_BYTE_LEN as u64 != 0) {
            return Err(PianoPIRError::InvalidEntryShape);
        }

        let chunk_size = (db_size as f64).sqrt().ceil() as u64;
        let chunk_num = db_size.div_ceil(chunk_size);

        let primary_hint_num = (((chunk_size * failure_prob_log2) as f64) * std::f64::consts::LN_2).ceil() as u64;
        let primary_hint_num = primary_hint_num.max(1);

        let max_query_num = primary_hint_num;
        let max_query_per_chunk = (BACKUP_SLACK_FACTOR * max_query_num).div_ceil(chunk_num).max(2);

        Ok(PianoConfig {
            db_size,
            entry_byte_len,
            entry_words: (entry_byte_len / WORD_BYTE_LEN as u64) as usize,
            chunk_size,
            chunk_num,
            primary_hint_num,
            max_query_num,
            max_query_per_chunk,
            failure_prob_log2,
        })
    }

    /// Entry count of `chunk`; the trailing chunk may be short.
    #[inline]
    pub fn chunk_entry_count(&self, chunk: u64) -> u64 {
        (self.db_size - chunk * self.chunk_size).min(self.chunk_size)
    }
}

/// A window into a shared word array. Partitions of one database all view the
/// same allocation; slicing never copies.
#[derive(Clone)]
pub struct DbWords {
    words: Arc<[u64]>,
    start: usize,
    len: usize,
}

impl DbWords {
    pub fn from_vec(words: Vec<u64>) -> DbWords {
        let len = words.len();
        DbWords {
            words: Arc::from(words),
            start: 0,
            len,
        }
    }

    /// Sub-window of `len` words starting at `start`, relative to this view.
    pub fn slice(&self, start: usize, len: usize) -> DbWords {
        debug_assert!(start + len <= self.len);
        DbWords {
            words: Arc::clone(&self.words),
            start: self.start + start,
            len,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    fn as_slice(&self) -> &[u64] {
        &self.words[self.start..self.start + self.len]
    }
}

impl From<Vec<u64>> for DbWords {
    fn from(words: Vec<u64>) -> DbWords {
        DbWords::from_vec(words)
    }
}

/// Server half: the immutable word array and the streaming/XOR primitives the
/// protocol needs. Stateless across queries.
pub struct PianoServer {
    config: PianoConfig,
    db: DbWords,
    #[cfg(test)]
    pub(crate) recorded_queries: std::cell::RefCell<Vec<Vec<u64>>>,
}

impl PianoServer {
    fn new(config: PianoConfig, db: DbWords) -> Result<PianoServer, PianoPIRError> {
        if branch_opt_util::unlikely(db.len() as u64 != config.db_size * config.entry_words as u64) {
            return Err(PianoPIRError::DatabaseShapeMismatch);
        }

        Ok(PianoServer {
            config,
            db,
            #[cfg(test)]
            recorded_queries: std::cell::RefCell::new(Vec::new()),
        })
    }

    /// Answers one query vector: the word-wise XOR of the addressed entries.
    /// The vector must hold exactly one index per chunk, each inside its
    /// chunk's range.
    pub fn answer(&self, query: &[u64]) -> Result<Vec<u64>, PianoPIRError> {
        if branch_opt_util::unlikely(query.len() as u64 != self.config.chunk_num) {
            return Err(PianoPIRError::MalformedQueryVector);
        }

        let mut response = vec![0u64; self.config.entry_words];
        for (chunk, &index) in query.iter().enumerate() {
            let chunk = chunk as u64;
            let chunk_start = chunk * self.config.chunk_size;
            if branch_opt_util::unlikely(index < chunk_start || index >= chunk_start + self.config.chunk_entry_count(chunk)) {
                return Err(PianoPIRError::MalformedQueryVector);
            }
            xor_words(&mut response, self.entry(index));
        }

        #[cfg(test)]
        self.recorded_queries.borrow_mut().push(query.to_vec());

        Ok(response)
    }

    /// Direct read of one entry, skipping the PIR math. Testing and debugging
    /// only.
    pub fn non_private_query(&self, index: u64) -> Result<Vec<u64>, PianoPIRError> {
        if branch_opt_util::unlikely(index >= self.config.db_size) {
            return Err(PianoPIRError::IndexOutOfRange);
        }
        Ok(self.entry(index).to_vec())
    }

    #[inline]
    fn entry(&self, index: u64) -> &[u64] {
        let at = index as usize * self.config.entry_words;
        &self.db.as_slice()[at..at + self.config.entry_words]
    }

    /// Contiguous words of one chunk, the unit of the offline streaming scan.
    fn chunk_entries(&self, chunk: u64) -> &[u64] {
        let start = (chunk * self.config.chunk_size) as usize * self.config.entry_words;
        let len = self.config.chunk_entry_count(chunk) as usize * self.config.entry_words;
        &self.db.as_slice()[start..start + len]
    }
}

/// Client half: hint tables, spare pools and the query logic.
pub struct PianoClient {
    config: PianoConfig,
    rng: ChaCha8Rng,
    hints: Vec<PrimaryHint>,
    backups: Vec<Vec<BackupHint>>,
    replacements: Vec<Vec<Replacement>>,
    finished_query_num: u64,
}

impl PianoClient {
    fn new(config: PianoConfig, rng: ChaCha8Rng) -> PianoClient {
        PianoClient {
            config,
            rng,
            hints: Vec::new(),
            backups: Vec::new(),
            replacements: Vec::new(),
            finished_query_num: 0,
        }
    }

    fn allocate_tables(&mut self) {
        let entry_words = self.config.entry_words;

        self.hints = (0..self.config.primary_hint_num)
            .map(|_| PrimaryHint::fresh(SetKey::random(&mut self.rng), entry_words))
            .collect();

        self.backups = (0..self.config.chunk_num)
            .map(|_| {
                (0..self.config.max_query_per_chunk)
                    .map(|_| BackupHint::fresh(SetKey::random(&mut self.rng), entry_words))
                    .collect()
            })
            .collect();

        self.replacements = (0..self.config.chunk_num)
            .map(|chunk| {
                let count = self.config.chunk_entry_count(chunk);
                (0..self.config.max_query_per_chunk)
                    .map(|_| Replacement {
                        offset: self.rng.random_range(0..count),
                        value: vec![0u64; entry_words],
                    })
                    .collect()
            })
            .collect();

        self.finished_query_num = 0;
    }

    /// One end-to-end streaming pass over the database: folds every chunk
    /// into the primary rows and the other chunks' spare pools, and captures
    /// the replacement values.
    fn preprocessing(&mut self, server: &PianoServer) {
        self.allocate_tables();

        let entry_words = self.config.entry_words;

        for chunk in 0..self.config.chunk_num {
            let words = server.chunk_entries(chunk);
            let count = self.config.chunk_entry_count(chunk);

            self.hints.par_iter_mut().for_each(|hint| {
                let offset = hint.key.offset(chunk, count) as usize;
                xor_words(&mut hint.acc, &words[offset * entry_words..(offset + 1) * entry_words]);
            });

            self.backups.par_iter_mut().enumerate().for_each(|(group, pool)| {
                if group as u64 == chunk {
                    return;
                }
                for backup in pool.iter_mut() {
                    let offset = backup.key.offset(chunk, count) as usize;
                    xor_words(&mut backup.acc, &words[offset * entry_words..(offset + 1) * entry_words]);
                }
            });

            for replacement in self.replacements[chunk as usize].iter_mut() {
                let offset = replacement.offset as usize;
                replacement.value.copy_from_slice(&words[offset * entry_words..(offset + 1) * entry_words]);
            }
        }
    }

    /// Allocates zeroed hint state without touching the database. Queries
    /// keep their shape and cost but answer garbage; meant for benchmarking
    /// the online math alone.
    fn dummy_preprocessing(&mut self) {
        self.allocate_tables();
    }

    fn query(&mut self, server: &PianoServer, local_index: u64, real: bool) -> Result<Vec<u64>, PianoPIRError> {
        if !real {
            let query: Vec<u64> = (0..self.config.chunk_num)
                .map(|chunk| chunk * self.config.chunk_size + self.rng.random_range(0..self.config.chunk_entry_count(chunk)))
                .collect();
            server.answer(&query)?;
            return Ok(vec![0u64; self.config.entry_words]);
        }

        if branch_opt_util::unlikely(local_index >= self.config.db_size) {
            return Err(PianoPIRError::IndexOutOfRange);
        }
        if branch_opt_util::unlikely(self.finished_query_num >= self.config.max_query_num) {
            return Err(PianoPIRError::HintExhausted);
        }

        let target_chunk = local_index / self.config.chunk_size;
        let target_offset = local_index % self.config.chunk_size;
        let target_count = self.config.chunk_entry_count(target_chunk);

        let hint_pos = self
            .hints
            .iter()
            .position(|hint| hint.offset_at(target_chunk, target_count) == target_offset)
            .ok_or(PianoPIRError::HintMiss)?;

        let replacement = self.replacements[target_chunk as usize].pop().ok_or(PianoPIRError::HintExhausted)?;
        let backup = self.backups[target_chunk as usize].pop().ok_or(PianoPIRError::HintExhausted)?;

        let query: Vec<u64> = (0..self.config.chunk_num)
            .map(|chunk| {
                let offset = if chunk == target_chunk {
                    replacement.offset
                } else {
                    self.hints[hint_pos].offset_at(chunk, self.config.chunk_entry_count(chunk))
                };
                chunk * self.config.chunk_size + offset
            })
            .collect();

        let mut value = server.answer(&query)?;
        xor_words(&mut value, &self.hints[hint_pos].acc);
        xor_words(&mut value, &replacement.value);

        // Promote the spare: its accumulator misses only the target chunk,
        // and the recovered entry fills that gap. The refreshed row keeps
        // covering the queried offset.
        let mut acc = backup.acc;
        xor_words(&mut acc, &value);
        self.hints[hint_pos] = PrimaryHint {
            key: backup.key,
            acc,
            programmed: Some((target_chunk, target_offset)),
        };

        self.finished_query_num += 1;
        Ok(value)
    }

    fn storage_bytes(&self) -> u64 {
        let entry_bytes = self.config.entry_byte_len;
        let hint_bytes = self.hints.len() as u64 * entry_bytes;
        let backup_bytes: u64 = self.backups.iter().map(|pool| pool.len() as u64 * entry_bytes).sum();
        let replacement_bytes: u64 = self.replacements.iter().map(|pool| pool.len() as u64 * (entry_bytes + WORD_BYTE_LEN as u64)).sum();
        hint_bytes + backup_bytes + replacement_bytes
    }
}

/// In-process pairing of one server and one client over the same database
/// window.
pub struct PianoPir {
    server: PianoServer,
    client: PianoClient,
}

impl PianoPir {
    /// Builds an instance over `db`, drawing the client seed from the OS.
    ///
    /// # Arguments
    ///
    /// * `db_size` - Number of entries in the database window.
    /// * `entry_byte_len` - Bytes per entry; must be divisible by 8.
    /// * `db` - The word array; its length must be `db_size * entry_byte_len / 8`.
    /// * `failure_prob_log2` - Target log2 of the per-query hint-miss probability.
    pub fn new(db_size: u64, entry_byte_len: u64, db: DbWords, failure_prob_log2: u64) -> Result<PianoPir, PianoPIRError> {
        let mut seed = [0u8; SEED_BYTE_LEN];
        ChaCha8Rng::from_os_rng().fill_bytes(&mut seed);
        PianoPir::new_seeded(db_size, entry_byte_len, db, failure_prob_log2, seed)
    }

    /// Same as [`PianoPir::new`] with an explicit client seed, for
    /// reproducible runs.
    pub fn new_seeded(
        db_size: u64,
        entry_byte_len: u64,
        db: DbWords,
        failure_prob_log2: u64,
        seed: [u8; SEED_BYTE_LEN],
    ) -> Result<PianoPir, PianoPIRError> {
        let config = PianoConfig::derive(db_size, entry_byte_len, failure_prob_log2)?;
        let server = PianoServer::new(config.clone(), db)?;
        let client = PianoClient::new(config, ChaCha8Rng::from_seed(seed));

        Ok(PianoPir { server, client })
    }

    /// Runs the offline phase, replacing any previous hint state.
    pub fn preprocessing(&mut self) {
        debug!(
            db_size = self.server.config.db_size,
            chunk_size = self.server.config.chunk_size,
            chunk_num = self.server.config.chunk_num,
            primary_hint_num = self.server.config.primary_hint_num,
            "hint preprocessing"
        );
        self.client.preprocessing(&self.server);
    }

    /// Allocates zeroed hint state without scanning the database.
    pub fn dummy_preprocessing(&mut self) {
        self.client.dummy_preprocessing();
    }

    /// One online query. With `real = false` the server sees an
    /// indistinguishable uniform query vector, no hint is spent and the
    /// zeroed result is meant to be discarded.
    pub fn query(&mut self, local_index: u64, real: bool) -> Result<Vec<u64>, PianoPIRError> {
        self.client.query(&self.server, local_index, real)
    }

    /// Direct read of one entry, skipping the PIR math.
    pub fn non_private_query(&self, index: u64) -> Result<Vec<u64>, PianoPIRError> {
        self.server.non_private_query(index)
    }

    #[inline]
    pub fn config(&self) -> &PianoConfig {
        &self.server.config
    }

    /// Real queries this hint table can still absorb before the next offline
    /// pass.
    #[inline]
    pub fn max_query_num(&self) -> u64 {
        self.server.config.max_query_num
    }

    #[inline]
    pub fn max_query_per_chunk(&self) -> u64 {
        self.server.config.max_query_per_chunk
    }

    #[inline]
    pub fn finished_query_num(&self) -> u64 {
        self.client.finished_query_num
    }

    /// Client-side hint state in bytes.
    pub fn local_storage_size(&self) -> u64 {
        self.client.storage_bytes()
    }

    /// Online bytes exchanged per query: one index per chunk up, one entry
    /// down.
    pub fn comm_cost_per_query(&self) -> u64 {
        (self.server.config.chunk_num + self.server.config.entry_words as u64) * WORD_BYTE_LEN as u64
    }

    #[cfg(test)]
    pub(crate) fn take_recorded_queries(&self) -> Vec<Vec<u64>> {
        self.server.recorded_queries.borrow_mut().drain(..).collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn word_db(db_size: u64) -> DbWords {
        // One word per entry, value tied to the index.
        DbWords::from_vec((0..db_size).map(|i| i * 0x9e37_79b9 + 1).collect())
    }

    fn seeded(db_size: u64, failure_prob_log2: u64, seed: u8) -> PianoPir {
        let mut pir = PianoPir::new_seeded(db_size, 8, word_db(db_size), failure_prob_log2, [seed; 32]).unwrap();
        pir.preprocessing();
        pir
    }

    #[test]
    fn config_derivation_covers_short_last_chunk() {
        let config = PianoConfig::derive(10, 8, 8).unwrap();
        assert_eq!(config.chunk_size, 4);
        assert_eq!(config.chunk_num, 3);
        assert_eq!(config.chunk_entry_count(0), 4);
        assert_eq!(config.chunk_entry_count(2), 2);
    }

    #[test]
    fn construction_rejects_bad_shapes() {
        assert_eq!(
            PianoPir::new_seeded(4, 8, DbWords::from_vec(vec![0; 3]), 8, [0; 32]).map(|_| ()),
            Err(PianoPIRError::DatabaseShapeMismatch)
        );
        assert_eq!(
            PianoPir::new_seeded(4, 12, DbWords::from_vec(vec![0; 6]), 8, [0; 32]).map(|_| ()),
            Err(PianoPIRError::InvalidEntryShape)
        );
        assert_eq!(
            PianoPir::new_seeded(0, 8, DbWords::from_vec(Vec::new()), 8, [0; 32]).map(|_| ()),
            Err(PianoPIRError::InvalidEntryShape)
        );
    }

    #[test]
    fn non_private_query_reads_raw_entries() {
        let pir = seeded(16, 8, 1);
        for i in 0..16 {
            assert_eq!(pir.non_private_query(i).unwrap(), vec![i * 0x9e37_79b9 + 1]);
        }
        assert_eq!(pir.non_private_query(16), Err(PianoPIRError::IndexOutOfRange));
    }

    #[test]
    fn every_index_of_a_tiny_db_is_recovered() {
        let mut pir = seeded(16, 8, 2);
        for i in 0..16 {
            let got = match pir.query(i, true) {
                Ok(words) => words,
                Err(PianoPIRError::HintMiss) => {
                    pir.preprocessing();
                    pir.query(i, true).unwrap()
                }
                Err(e) => panic!("query {} failed: {}", i, e),
            };
            assert_eq!(got, pir.non_private_query(i).unwrap(), "index {}", i);
        }
    }

    #[test]
    fn repeated_queries_to_one_index_stay_correct() {
        let mut pir = seeded(64, 8, 3);
        let want = pir.non_private_query(5).unwrap();

        for _ in 0..32 {
            match pir.query(5, true) {
                Ok(words) => assert_eq!(words, want),
                Err(PianoPIRError::HintMiss) | Err(PianoPIRError::HintExhausted) => pir.preprocessing(),
                Err(e) => panic!("unexpected error: {}", e),
            }
        }
    }

    #[test]
    fn wide_entries_round_trip_through_queries() {
        let entry_words = 4usize;
        let db_size = 9u64;
        let words: Vec<u64> = (0..db_size * entry_words as u64).map(|i| i.wrapping_mul(0xdead_beef_cafe)).collect();

        let mut pir = PianoPir::new_seeded(db_size, 32, DbWords::from_vec(words), 8, [4; 32]).unwrap();
        pir.preprocessing();

        for i in 0..db_size {
            let got = match pir.query(i, true) {
                Ok(words) => words,
                Err(PianoPIRError::HintMiss) => {
                    pir.preprocessing();
                    pir.query(i, true).unwrap()
                }
                Err(e) => panic!("query {} failed: {}", i, e),
            };
            assert_eq!(got, pir.non_private_query(i).unwrap());
        }
    }

    #[test]
    fn real_queries_run_out_at_the_declared_budget() {
        let mut pir = seeded(16, 8, 5);
        let budget = pir.max_query_num();

        let mut served = 0;
        while served < budget {
            match pir.query(served % 16, true) {
                Ok(_) => served += 1,
                Err(PianoPIRError::HintMiss) | Err(PianoPIRError::HintExhausted) => break,
                Err(e) => panic!("unexpected error: {}", e),
            }
        }
        // The counter is capped even if per-chunk pools emptied earlier.
        assert!(pir.finished_query_num() <= budget);
        if pir.finished_query_num() == budget {
            assert_eq!(pir.query(0, true), Err(PianoPIRError::HintExhausted));
        }
    }

    #[test]
    fn dummy_queries_spend_no_hints() {
        let mut pir = seeded(16, 8, 6);
        for _ in 0..100 {
            let words = pir.query(0, false).unwrap();
            assert_eq!(words, vec![0u64]);
        }
        assert_eq!(pir.finished_query_num(), 0);
    }

    #[test]
    fn answer_enforces_one_in_range_index_per_chunk() {
        let pir = seeded(16, 8, 7);
        // 16 entries -> 4 chunks of 4.
        assert_eq!(pir.server.answer(&[0, 4, 8]), Err(PianoPIRError::MalformedQueryVector));
        // Slot 0 must address chunk 0.
        assert_eq!(pir.server.answer(&[4, 4, 8, 12]), Err(PianoPIRError::MalformedQueryVector));

        let response = pir.server.answer(&[1, 5, 9, 13]).unwrap();
        let want = [1u64, 5, 9, 13]
            .iter()
            .fold(0u64, |acc, &i| acc ^ (i * 0x9e37_79b9 + 1));
        assert_eq!(response, vec![want]);
    }

    #[test]
    fn query_vectors_look_uniform_in_every_chunk_slot() {
        const ROUNDS: usize = 1000;

        let mut pir = seeded(64, 8, 8);
        pir.take_recorded_queries();

        let mut real_offsets: Vec<Vec<u64>> = vec![Vec::new(); 8];
        let mut served = 0;
        while served < ROUNDS {
            match pir.query(0, true) {
                Ok(_) => served += 1,
                Err(PianoPIRError::HintMiss) | Err(PianoPIRError::HintExhausted) => {
                    pir.preprocessing();
                    continue;
                }
                Err(e) => panic!("unexpected error: {}", e),
            }
        }
        for query in pir.take_recorded_queries() {
            for (chunk, &index) in query.iter().enumerate() {
                real_offsets[chunk].push(index - chunk as u64 * 8);
            }
        }

        let mut dummy_offsets: Vec<Vec<u64>> = vec![Vec::new(); 8];
        for _ in 0..ROUNDS {
            pir.query(0, false).unwrap();
        }
        for query in pir.take_recorded_queries() {
            for (chunk, &index) in query.iter().enumerate() {
                dummy_offsets[chunk].push(index - chunk as u64 * 8);
            }
        }

        for offsets in real_offsets.iter().chain(dummy_offsets.iter()) {
            assert!(offsets.len() >= ROUNDS);
            assert!(ks_distance_from_uniform(offsets, 8) < 0.1);
        }
    }

    // Kolmogorov-Smirnov distance between the empirical distribution of
    // `samples` and the uniform distribution on [0, domain).
    fn ks_distance_from_uniform(samples: &[u64], domain: u64) -> f64 {
        let n = samples.len() as f64;
        let mut counts = vec![0u64; domain as usize];
        for &s in samples {
            counts[s as usize] += 1;
        }

        let mut cumulative = 0u64;
        let mut worst: f64 = 0.0;
        for (value, &count) in counts.iter().enumerate() {
            cumulative += count;
            let empirical = cumulative as f64 / n;
            let uniform = (value as f64 + 1.0) / domain as f64;
            worst = worst.max((empirical - uniform).abs());
        }
        worst
    }
}
