//! HTTP multi-search transport.
//!
//! POSTs the newline-delimited payload produced by
//! [`metafetch_core::msearch::encode`] to `<endpoint>/_msearch` and decodes the
//! `{"responses": [...]}` envelope. The call races the abort token, so an
//! abandoned batch stops waiting on the network as soon as the token fires.

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use metafetch_core::msearch;
use metafetch_core::{ItemResponse, WireRequest};

use super::{TransportClient, TransportError};

const NDJSON: &str = "application/x-ndjson";

/// `reqwest`-backed [`TransportClient`] speaking the multi-search protocol.
#[derive(Debug, Clone)]
pub struct MsearchTransport {
    client: reqwest::Client,
    url: String,
}

impl MsearchTransport {
    /// Creates a transport for the backend rooted at `endpoint`
    /// (for example `http://localhost:9200`).
    #[must_use]
    pub fn new(endpoint: &str) -> Self {
        Self::with_client(reqwest::Client::new(), endpoint)
    }

    /// Creates a transport reusing an existing client (connection pool,
    /// default headers, TLS settings).
    #[must_use]
    pub fn with_client(client: reqwest::Client, endpoint: &str) -> Self {
        Self {
            client,
            url: format!("{}/_msearch", endpoint.trim_end_matches('/')),
        }
    }

    /// Full URL the batches are posted to.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    async fn post(&self, payload: String) -> Result<Vec<ItemResponse>, TransportError> {
        let response = self
            .client
            .post(&self.url)
            .header(CONTENT_TYPE, NDJSON)
            .body(payload)
            .send()
            .await
            .map_err(|e| TransportError::Request(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| TransportError::Request(e.to_string()))?;

        if !status.is_success() {
            return Err(TransportError::Status {
                status: status.as_u16(),
                body,
            });
        }

        msearch::decode(&body).map_err(|e| TransportError::Malformed(e.0))
    }
}

#[async_trait]
impl TransportClient for MsearchTransport {
    async fn submit_batch(
        &self,
        requests: &[WireRequest],
        abort: CancellationToken,
    ) -> Result<Vec<ItemResponse>, TransportError> {
        let payload =
            msearch::encode(requests).map_err(|e| TransportError::InvalidPayload(e.to_string()))?;
        debug!(url = %self.url, items = requests.len(), "posting multi-search batch");

        tokio::select! {
            biased;
            () = abort.cancelled() => Err(TransportError::Aborted),
            result = self.post(payload) => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_is_rooted_at_endpoint() {
        assert_eq!(
            MsearchTransport::new("http://localhost:9200/").url(),
            "http://localhost:9200/_msearch"
        );
        assert_eq!(
            MsearchTransport::new("http://es:9200/prefix").url(),
            "http://es:9200/prefix/_msearch"
        );
    }

    #[tokio::test]
    async fn aborted_token_short_circuits_the_call() {
        // Port 9 (discard) on a non-routable address: the call would hang or
        // fail, but the pre-cancelled token must win the race.
        let transport = MsearchTransport::new("http://10.255.255.1:9");
        let token = CancellationToken::new();
        token.cancel();
        let err = transport
            .submit_batch(&[WireRequest::new("a", "{}")], token)
            .await
            .unwrap_err();
        assert_eq!(err, TransportError::Aborted);
    }

    #[tokio::test]
    async fn unencodable_body_fails_before_any_io() {
        let transport = MsearchTransport::new("http://10.255.255.1:9");
        let err = transport
            .submit_batch(&[WireRequest::new("a", "{not json")], CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::InvalidPayload(_)));
        assert!(!err.is_retryable());
    }
}
