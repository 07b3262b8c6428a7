//! Quota-aware pool of API keys for a rate-limited downstream service
//!
//! Holds a fixed set of interchangeable API keys, hands them out round-robin,
//! tracks per-key daily quota usage, and retries failed calls on another key.
//! The pool is an owned value shared through `Arc`; nothing here is global.
//!
//! Key lifecycle within one UTC day:
//! 1. Keys load at startup, all usable
//! 2. `KeyPool::next` selects keys round-robin, skipping exhausted ones
//! 3. Successful calls add their quota units; at the soft ceiling the key is exhausted
//! 4. A downstream quota signal exhausts the key immediately
//! 5. Consecutive non-quota failures past the threshold exhaust the key
//! 6. The first selection after UTC midnight (or the reset ticker) clears everything

pub mod error;
pub mod executor;
pub mod pool;
pub mod quota;
pub mod record;
pub mod reset;
pub mod status;

#[cfg(test)]
pub(crate) mod test_support;

pub use error::{Error, ExecutorError, Result};
pub use executor::{ExecuteOptions, RequestExecutor, Response};
pub use pool::{Clock, KeyPool, SelectedKey, SystemClock};
pub use quota::{FatalScope, Failure, Outcome, QuotaPolicy, classify_response, classify_transport};
pub use record::KeyRecord;
pub use reset::spawn_reset_task;
pub use status::{KeySnapshot, PoolHealth, PoolSnapshot, StatusReporter};
