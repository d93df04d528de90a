//! Scripted collaborators for session and controller tests
//!
//! [`ScriptedTransport`] answers each request with the next queued
//! [`ScriptedResponse`] and counts how many requests and response bodies are
//! still alive, so tests can assert that a cancelled transfer was actually
//! dropped.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use futures::channel::mpsc;
use futures::StreamExt;
use url::Url;

use crate::credentials::CredentialProvider;
use crate::transport::{ChunkStream, StreamResponse, StreamTransport, TransportError};

/// What happens after the scripted chunks of a body
#[derive(Debug, Clone)]
pub enum BodyEnd {
    /// Body ends normally
    Eof,
    /// Body stays open forever
    Hang,
    /// Body fails with a transport error
    Fail(String),
}

/// One scripted answer to a stream request
#[derive(Debug)]
pub enum ScriptedResponse {
    /// Status with an empty body
    Status(u16),
    /// Status with fixed chunks
    Body {
        /// HTTP status
        status: u16,
        /// Chunks delivered immediately
        chunks: Vec<Bytes>,
        /// Behaviour after the last chunk
        end: BodyEnd,
    },
    /// 200 with chunks pushed by the test; dropping the sender ends the body
    Live(mpsc::UnboundedReceiver<Bytes>),
    /// Request fails without a response
    Error(String),
    /// Request never completes
    Unanswered,
}

impl ScriptedResponse {
    /// 200 with fixed chunks
    pub fn ok(chunks: Vec<Bytes>, end: BodyEnd) -> Self {
        Self::Body {
            status: 200,
            chunks,
            end,
        }
    }

    /// 200 whose chunks are pushed through the returned sender
    pub fn live() -> (mpsc::UnboundedSender<Bytes>, Self) {
        let (tx, rx) = mpsc::unbounded();
        (tx, Self::Live(rx))
    }
}

/// Tracks a request or response body until it is dropped
struct BodyGuard(Arc<AtomicUsize>);

impl BodyGuard {
    fn new(open: &Arc<AtomicUsize>) -> Self {
        open.fetch_add(1, Ordering::AcqRel);
        Self(Arc::clone(open))
    }
}

impl Drop for BodyGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Transport that replays a fixed script of responses
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    responses: Mutex<VecDeque<ScriptedResponse>>,
    requests: Mutex<Vec<(Url, String)>>,
    open_bodies: Arc<AtomicUsize>,
    in_flight: Arc<AtomicUsize>,
}

impl ScriptedTransport {
    /// Transport answering requests with `responses` in order
    pub fn new(responses: impl IntoIterator<Item = ScriptedResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into_iter().collect()),
            ..Self::default()
        }
    }

    /// Queue another response
    pub fn push(&self, response: ScriptedResponse) {
        self.responses
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push_back(response);
    }

    /// Number of requests received
    pub fn request_count(&self) -> usize {
        self.requests().len()
    }

    /// Bearer tokens in request order
    pub fn tokens(&self) -> Vec<String> {
        self.requests().into_iter().map(|(_, token)| token).collect()
    }

    /// URLs in request order
    pub fn urls(&self) -> Vec<Url> {
        self.requests().into_iter().map(|(url, _)| url).collect()
    }

    /// Response bodies handed out and not yet dropped
    pub fn open_bodies(&self) -> usize {
        self.open_bodies.load(Ordering::Acquire)
    }

    /// Requests still waiting for a response
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    fn requests(&self) -> Vec<(Url, String)> {
        self.requests
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    fn guarded(&self, body: ChunkStream) -> ChunkStream {
        let guard = BodyGuard::new(&self.open_bodies);
        body.map(move |item| {
            let _alive = &guard;
            item
        })
        .boxed()
    }
}

#[async_trait]
impl StreamTransport for ScriptedTransport {
    async fn open(&self, url: &Url, token: &str) -> Result<StreamResponse, TransportError> {
        self.requests
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push((url.clone(), token.to_string()));

        let next = self
            .responses
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .pop_front();

        let (status, body): (u16, ChunkStream) = match next {
            None => return Err(TransportError::Other("no scripted response left".to_string())),
            Some(ScriptedResponse::Error(message)) => return Err(TransportError::Other(message)),
            Some(ScriptedResponse::Unanswered) => {
                let _pending = BodyGuard::new(&self.in_flight);
                return futures::future::pending().await;
            }
            Some(ScriptedResponse::Status(status)) => (status, futures::stream::empty().boxed()),
            Some(ScriptedResponse::Live(rx)) => (200, rx.map(Ok).boxed()),
            Some(ScriptedResponse::Body {
                status,
                chunks,
                end,
            }) => {
                let head = futures::stream::iter(chunks.into_iter().map(Ok));
                let body = match end {
                    BodyEnd::Eof => head.boxed(),
                    BodyEnd::Hang => head.chain(futures::stream::pending()).boxed(),
                    BodyEnd::Fail(message) => head
                        .chain(futures::stream::once(async move {
                            Err(TransportError::Other(message))
                        }))
                        .boxed(),
                };
                (status, body)
            }
        };

        Ok(StreamResponse::new(status, self.guarded(body)))
    }
}

/// Credential provider with scripted answers
#[derive(Debug, Default)]
pub struct ScriptedCredentials {
    tokens: Mutex<VecDeque<Option<String>>>,
    fallback: Option<String>,
    stall: bool,
    calls: AtomicUsize,
}

impl ScriptedCredentials {
    /// Always returns `token`
    pub fn always(token: &str) -> Self {
        Self {
            fallback: Some(token.to_string()),
            ..Self::default()
        }
    }

    /// Returns `tokens` in order, then `None`
    pub fn sequence<'a>(tokens: impl IntoIterator<Item = Option<&'a str>>) -> Self {
        Self {
            tokens: Mutex::new(tokens.into_iter().map(|t| t.map(str::to_string)).collect()),
            ..Self::default()
        }
    }

    /// Never answers
    pub fn never() -> Self {
        Self {
            stall: true,
            ..Self::default()
        }
    }

    /// Number of times a token was requested
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Acquire)
    }
}

#[async_trait]
impl CredentialProvider for ScriptedCredentials {
    async fn get_valid_token(&self) -> Option<String> {
        self.calls.fetch_add(1, Ordering::AcqRel);
        if self.stall {
            futures::future::pending::<()>().await;
        }
        let scripted = self
            .tokens
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .pop_front();
        scripted.unwrap_or_else(|| self.fallback.clone())
    }
}
