pub mod analysis;
pub mod app;
pub mod call;
pub mod config;
pub mod error;
pub mod event;
pub mod gateway;
pub mod handler;
pub mod insight;
pub mod storage;
pub mod utils;
pub mod version;

pub use error::{Error, Result};

/// Unique id the telephony provider returns when a call is placed; the
/// natural key for deduplicating call records.
pub type ProviderCallId = String;

// get timestamp in milliseconds
pub fn get_timestamp() -> u64 {
    let now = std::time::SystemTime::now();
    now.duration_since(std::time::UNIX_EPOCH)
        .expect("Time went backwards")
        .as_millis() as u64
}
