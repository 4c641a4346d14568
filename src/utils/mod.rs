pub mod fsops;
pub mod retry;

pub use fsops::{ensure_dir, write_atomic};
pub use retry::{backoff_delay, with_retry, DEFAULT_MAX_ATTEMPTS};
