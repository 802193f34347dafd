pub mod config;
pub mod engine;
pub mod error;
pub mod formula;
pub mod logger;
pub mod pricing;
pub mod replay;
pub mod report;
pub mod state;
pub mod storage;
pub mod usage;

use sha2::{Digest, Sha256};

/// Current time in milliseconds since the Unix epoch
pub fn current_timestamp() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Calculate SHA256 digest
pub fn sha256_digest(data: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().to_vec()
}
