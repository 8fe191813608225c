pub const PIECE_SIZE: usize = 256 * 1024;

pub const UNCHOKE_SLOTS: usize = 4;
pub const CHOKE_REFRESH_SECS: u64 = 30;

pub const FETCH_TIMEOUT_SECS: u64 = 10;
pub const REGISTRY_TIMEOUT_SECS: u64 = 10;

pub const MAX_CONSECUTIVE_FAILURES: u32 = 3;

pub const QUORUM_RETRY_SECS: u64 = 5;
pub const ELIGIBILITY_GRACE_MILLIS: u64 = 500;
pub const MAX_RETRY_BACKOFF_SECS: f64 = 8.0;

pub const HASH_LEN: usize = 20;
pub const COMPACT_ADDR_LEN: usize = 6;
