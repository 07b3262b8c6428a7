//! Downstream service abstraction
//!
//! Defines the `Downstream` trait that decouples the key pool's retry logic from
//! the HTTP transport. `HttpDownstream` issues real requests with reqwest; tests
//! substitute scripted implementations of the same trait.
//!
//! A downstream never interprets response bodies. It reports the raw status and
//! body of whatever came back, or a `TransportError` when nothing did. Deciding
//! whether a 403 means "quota exceeded" or "bad key" belongs to the caller.

pub mod http;

pub use http::{CredentialLocation, HttpDownstream};

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;

/// One logical call against the downstream service.
///
/// `endpoint` is a path relative to the downstream base URL (e.g. `search`),
/// `params` are sent as query parameters. The credential is attached per
/// attempt by the downstream implementation, never stored here.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DownstreamRequest {
    pub endpoint: String,
    pub params: BTreeMap<String, String>,
}

impl DownstreamRequest {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            params: BTreeMap::new(),
        }
    }

    /// Builder-style parameter insertion.
    pub fn param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }
}

/// Status and body of a completed downstream exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    pub status: u16,
    pub body: String,
}

impl RawResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Network-level failures where no HTTP response was received.
///
/// Messages never include the request URL, which may carry the credential as a
/// query parameter.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("downstream timed out: {0}")]
    Timeout(String),

    #[error("downstream connection failed: {0}")]
    Connect(String),

    #[error("downstream request failed: {0}")]
    Other(String),
}

/// Result alias for downstream calls.
pub type Result<T> = std::result::Result<T, TransportError>;

/// Abstraction over the rate-limited third-party service.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility (`Arc<dyn Downstream>`).
pub trait Downstream: Send + Sync {
    /// Identifier for logging (e.g. "http")
    fn id(&self) -> &str;

    /// Issue one request with `credential` attached.
    ///
    /// Implementations must bound the call with a timeout and map the expiry to
    /// `TransportError::Timeout`.
    fn call<'a>(
        &'a self,
        request: &'a DownstreamRequest,
        credential: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<RawResponse>> + Send + 'a>>;
}
