//! Streaming HTTP transport
//!
//! The session only needs two things from the network layer: the response
//! status, and the body as a sequence of byte chunks. Dropping the body
//! aborts the transfer, which is how cancellation releases the connection.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt, TryStreamExt};
use thiserror::Error;
use url::Url;

/// Errors raised while opening or reading a stream.
#[derive(Error, Debug)]
pub enum TransportError {
    /// HTTP client error (connect, TLS, mid-body failure).
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// I/O error from a non-HTTP source such as a replay file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Any other transport failure.
    #[error("{0}")]
    Other(String),
}

/// Boxed stream of body chunks
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<Bytes, TransportError>> + Send>>;

/// Status and body of an opened stream request
pub struct StreamResponse {
    /// HTTP status code
    pub status: u16,
    /// Response body; drop it to abort the transfer
    pub body: ChunkStream,
}

impl StreamResponse {
    /// Response with the given status and body
    pub fn new(status: u16, body: ChunkStream) -> Self {
        Self { status, body }
    }

    /// Response with no body, e.g. a 401
    pub fn empty(status: u16) -> Self {
        Self::new(status, futures::stream::empty().boxed())
    }

    /// Whether the status is 2xx
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

impl std::fmt::Debug for StreamResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamResponse")
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

/// Issues authenticated streaming GET requests.
#[async_trait]
pub trait StreamTransport: Send + Sync {
    /// Send `GET url` with `Authorization: Bearer {token}`.
    ///
    /// Non-2xx statuses are returned as a normal response; only failures to
    /// get any response at all are errors.
    async fn open(&self, url: &Url, token: &str) -> Result<StreamResponse, TransportError>;
}

/// `reqwest`-backed transport
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    /// Build a client with the given connect timeout.
    ///
    /// No overall request timeout is set since the body never ends on its own.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Http`] if the TLS backend cannot be initialised.
    pub fn new(connect_timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()?;
        Ok(Self { client })
    }

    /// Use an existing client
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl StreamTransport for HttpTransport {
    async fn open(&self, url: &Url, token: &str) -> Result<StreamResponse, TransportError> {
        let response = self
            .client
            .get(url.clone())
            .bearer_auth(token)
            .send()
            .await?;

        let status = response.status().as_u16();
        log::debug!("GET {} -> {}", url, status);

        let body = response.bytes_stream().map_err(TransportError::from).boxed();
        Ok(StreamResponse::new(status, body))
    }
}
