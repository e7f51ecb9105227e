use divan;
use piano_pir::batch::SimpleBatchPianoPir;
use rand::prelude::*;
use rand_chacha::ChaCha8Rng;
use std::time::Duration;

fn main() {
    divan::main();
}

fn generate_random_db(rng: &mut ChaCha8Rng, db_size: u64, entry_byte_len: u64) -> Vec<u64> {
    let word_count = (db_size * entry_byte_len / 8) as usize;
    (0..word_count).map(|_| rng.next_u64()).collect()
}

#[derive(Debug)]
struct DBConfig {
    db_size: u64,
    entry_byte_len: u64,
    batch_size: u64,
    failure_prob_log2: u64,
}

const ARGS: &[DBConfig] = &[DBConfig {
    db_size: 1u64 << 14,
    entry_byte_len: 64,
    batch_size: 32,
    failure_prob_log2: 8,
}];

#[divan::bench(args = ARGS, max_time = Duration::from_secs(300), skip_ext_time = true)]
fn batch_query(bencher: divan::Bencher, db_config: &DBConfig) {
    let mut rng = ChaCha8Rng::from_os_rng();
    let raw_db = generate_random_db(&mut rng, db_config.db_size, db_config.entry_byte_len);

    let mut pir = SimpleBatchPianoPir::new(
        db_config.db_size,
        db_config.entry_byte_len,
        db_config.batch_size,
        raw_db,
        db_config.failure_prob_log2,
    )
    .unwrap();
    pir.preprocessing();

    bencher
        .with_inputs(|| {
            (0..db_config.batch_size)
                .map(|_| rng.random_range(0..db_config.db_size))
                .collect::<Vec<u64>>()
        })
        .bench_local_refs(|indices| pir.query(indices).unwrap());
}
