//! Shared types for the quota gateway workspace

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::Secret;
