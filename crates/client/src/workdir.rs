//! One-shot working-directory request.
//!
//! The remote host serves its current working directory as a raw string
//! body on a sibling HTTP resource (conventionally `/pwd`). The request is
//! independent of the persistent connection and never touches the pumps.

use std::time::Duration;

use protocol::error::{ProtocolError, Result};
use reqwest::Client;
use url::Url;

/// HTTP client for the working-directory resource.
#[derive(Debug, Clone)]
pub struct WorkingDirectoryClient {
    http: Client,
    url: Url,
}

impl WorkingDirectoryClient {
    /// Creates a client for `url`; every request is bounded by `timeout`.
    pub fn new(url: Url, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProtocolError::RequestFailed(e.to_string()))?;
        Ok(Self { http, url })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Fetches the remote working directory.
    ///
    /// The body is returned as-is; no trimming is applied.
    pub async fn fetch(&self) -> Result<String> {
        tracing::debug!(url = %self.url, "Requesting working directory");

        let resp = self
            .http
            .get(self.url.clone())
            .send()
            .await
            .map_err(request_error)?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ProtocolError::RequestStatus {
                status: status.as_u16(),
                body,
            });
        }

        resp.text().await.map_err(request_error)
    }
}

fn request_error(err: reqwest::Error) -> ProtocolError {
    if err.is_timeout() {
        ProtocolError::Timeout(err.to_string())
    } else if err.is_connect() {
        ProtocolError::HandshakeFailed(err.to_string())
    } else {
        ProtocolError::RequestFailed(err.to_string())
    }
}
