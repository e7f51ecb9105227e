//! PianoPIR: single-server **P**rivate **I**nformation **R**etrieval with offline hint preprocessing, wrapped for batched lexical retrieval over binned embedding databases.
//!
//! This crate implements a Piano-style PIR client/server pair with sublinear online cost. The client streams the database once offline, keeping compact
//! pseudorandom hint tables; afterwards each retrieval costs the server one XOR over a single column of the database, and the server learns nothing about
//! which entry was fetched. On top of the primitive sits a batch wrapper that shards the database into independent partitions and answers whole batches of
//! indices with per-partition query counts that are identical across batches, and a query router that turns query text into bin indices and decodes the
//! retrieved embedding entries back into document identifiers.
//!
//! ## Features
//!
//! * **Private retrieval with sublinear online cost:** one full-column XOR per query after a single offline scan; consumed hints are refreshed in place
//!   from per-chunk spare pools.
//! * **Batch indistinguishability:** every partition answers the same number of queries per batch, short buckets padded with dummy queries the server
//!   cannot tell from real ones.
//! * **Lexical routing:** deterministic analysis and token-choice hashing map query text onto bins, and content addressing maps retrieved vectors back to
//!   document ids without the ids ever crossing the PIR channel.
//! * **Error handling:** comprehensive error reporting across packing, querying, batching and routing.
//!
//! ## Usage
//!
//! Add this crate as a dependency to your `Cargo.toml`:
//!
//! ```toml
//! [dependencies]
//! piano-pir = "0.1.0"
//! ```
//!
//! Then, you can use it in your code:
//!
//! ```rust
//! use piano_pir::batch::SimpleBatchPianoPir;
//!
//! fn main() {
//!     // Toy database: 16 entries of one 64-bit word each.
//!     let raw_db: Vec<u64> = (0..16u64).map(|i| i + 100).collect();
//!
//!     let mut pir = SimpleBatchPianoPir::new(16, 8, 4, raw_db, 8).expect("batch setup failed");
//!     pir.preprocessing();
//!
//!     // Fetch four entries, two per partition; responses align with the input.
//!     let responses = pir.query(&[0, 1, 8, 9]).expect("batch query failed");
//!     assert_eq!(responses[0], vec![100]);
//!     assert_eq!(responses[3], vec![109]);
//! }
//! ```
//!
//! ## Modules
//!
//! * `piano`: the PIR primitive, offline hint construction, online queries, hint refresh.
//! * `batch`: the partitioned batch wrapper with dummy padding and hint-budget rotation.
//! * `codec`: packing of fixed-width embedding entries into 64-bit words and back, and content addressing.
//! * `router`: query text to bin indices, retrieved entries to document ids, results persistence.
//! * `bins`: token-to-bin assignment over an external lexical index, bin file persistence.
//! * `analyzer`: the deterministic English analysis pipeline shared by indexing and querying.

pub use pir_internals::error::PianoPIRError;
pub use pir_internals::params::{DEFAULT_VALUE, QUERY_PER_PARTITION, REAL_QUERY_PER_PARTITION, SEED_BYTE_LEN};

pub mod analyzer;
pub mod batch;
pub mod bins;
pub mod codec;
pub mod piano;
pub mod router;

mod pir_internals;

mod test_e2e;
