pub const REAL_QUERY_PER_PARTITION: u64 = 2;
pub const QUERY_PER_PARTITION: u64 = 2;
pub const DEFAULT_VALUE: u64 = 0xdead_beef;
pub const SET_KEY_BYTE_LEN: usize = 16;
pub const SEED_BYTE_LEN: usize = 32;
pub const CONTENT_DIGEST_BYTE_LEN: usize = 32;
pub const WORD_BYTE_LEN: usize = 8;
pub const BACKUP_SLACK_FACTOR: u64 = 3;
