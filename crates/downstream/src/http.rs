//! reqwest-backed downstream
//!
//! Sends `GET {base_url}/{endpoint}?{params}` with the credential attached as a
//! query parameter or header. Bodies are returned verbatim, including on 4xx/5xx.

use crate::{Downstream, DownstreamRequest, RawResponse, Result, TransportError};
use reqwest::header::{HeaderName, HeaderValue};
use serde::Deserialize;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tracing::{debug, instrument};

/// Where the downstream expects the API key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialLocation {
    /// `?{name}={key}`
    #[default]
    Query,
    /// `{name}: {key}`
    Header,
}

/// HTTP downstream with a per-request timeout.
pub struct HttpDownstream {
    client: reqwest::Client,
    base_url: String,
    location: CredentialLocation,
    credential_name: String,
    timeout: Duration,
}

impl HttpDownstream {
    pub fn new(
        client: reqwest::Client,
        base_url: impl Into<String>,
        location: CredentialLocation,
        credential_name: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            location,
            credential_name: credential_name.into(),
            timeout,
        }
    }

    fn url_for(&self, endpoint: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            endpoint.trim_start_matches('/')
        )
    }

    #[instrument(skip_all, fields(endpoint = %request.endpoint))]
    async fn send(&self, request: &DownstreamRequest, credential: &str) -> Result<RawResponse> {
        let mut builder = self
            .client
            .get(self.url_for(&request.endpoint))
            .query(&request.params)
            .timeout(self.timeout);

        builder = match self.location {
            CredentialLocation::Query => {
                builder.query(&[(self.credential_name.as_str(), credential)])
            }
            CredentialLocation::Header => {
                let name = HeaderName::from_bytes(self.credential_name.as_bytes())
                    .map_err(|e| TransportError::Other(format!("invalid credential header: {e}")))?;
                let mut value = HeaderValue::from_str(credential).map_err(|_| {
                    TransportError::Other("credential is not a valid header value".into())
                })?;
                value.set_sensitive(true);
                builder.header(name, value)
            }
        };

        let response = builder.send().await.map_err(map_reqwest_error)?;
        let status = response.status().as_u16();
        let body = response.text().await.map_err(map_reqwest_error)?;
        debug!(status, bytes = body.len(), "downstream responded");
        Ok(RawResponse { status, body })
    }
}

impl Downstream for HttpDownstream {
    fn id(&self) -> &str {
        "http"
    }

    fn call<'a>(
        &'a self,
        request: &'a DownstreamRequest,
        credential: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<RawResponse>> + Send + 'a>> {
        Box::pin(self.send(request, credential))
    }
}

/// Map a reqwest error to a transport error, dropping the URL so a query-string
/// credential never reaches logs.
fn map_reqwest_error(error: reqwest::Error) -> TransportError {
    let error = error.without_url();
    if error.is_timeout() {
        TransportError::Timeout(error.to_string())
    } else if error.is_connect() {
        TransportError::Connect(error.to_string())
    } else {
        TransportError::Other(error.to_string())
    }
}
