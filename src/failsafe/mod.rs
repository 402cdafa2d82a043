//! Failsafe mechanisms: retry with backoff

mod retry;

pub use retry::{RetryMode, RetryPolicy, with_retry};
