//! Cooperative HTTP transport for the page runtime.
//!
//! The page thread never blocks on sockets directly: it issues requests
//! through a [`Transport`] and drives I/O by calling [`Transport::tick`],
//! which polls for progress and hands back the header/data/done/error
//! events that arrived since the last call. All events are dispatched
//! synchronously on the caller's thread.

use std::time::Duration;

use bytes::Bytes;
use url::Url;

pub mod buffer;
pub mod client;
pub mod testing;

pub use buffer::{BufferPool, PooledBuf, DEFAULT_POOL_BUFFERS};
pub use client::HttpClient;

/// Identifier of one in-flight (or completed) request.
pub type RequestId = u64;

/// What a request is fetching, used for referer/accept decisions and
/// for idle accounting.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ResourceType {
    /// A top-level or frame navigation.
    Document,
    /// A classic script or module fetch.
    Script,
    /// A subframe document.
    Frame,
    /// Anything else.
    Other,
}

/// A request handed to the transport. Headers are plain pairs; the
/// transport does not consult a cookie jar (that collaborator lives
/// outside this crate).
#[derive(Clone, Debug)]
pub struct FetchRequest {
    pub url: Url,
    pub method: reqwest::Method,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
    pub resource_type: ResourceType,
}

impl FetchRequest {
    /// A plain GET for the given URL.
    #[inline]
    pub fn get(url: Url, resource_type: ResourceType) -> Self {
        Self {
            url,
            method: reqwest::Method::GET,
            headers: Vec::new(),
            body: None,
            resource_type,
        }
    }

    /// Append a request header.
    #[inline]
    #[must_use]
    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_owned(), value.to_owned()));
        self
    }
}

/// One transport event, delivered from [`Transport::tick`].
#[derive(Clone, Debug)]
pub struct FetchEvent {
    pub request: RequestId,
    pub kind: FetchEventKind,
}

/// The four callbacks of the transport contract, reified as data so the
/// caller routes them on its own thread.
#[derive(Clone, Debug)]
pub enum FetchEventKind {
    /// Response headers arrived. `final_url` reflects any redirects.
    Header {
        status: u16,
        final_url: Url,
        content_type: Option<String>,
    },
    /// One body chunk.
    Data(Bytes),
    /// The body is complete.
    Done,
    /// Transport failure (DNS, TLS, connection, abort).
    Failed(String),
}

/// Non-blocking HTTP client contract consumed by the page runtime.
pub trait Transport {
    /// Start a request and return its id. The request makes progress
    /// only while [`Transport::tick`] is being called.
    fn request(&mut self, req: FetchRequest) -> RequestId;

    /// Poll for progress, waiting at most `wait`, and return every event
    /// that became available.
    fn tick(&mut self, wait: Duration) -> Vec<FetchEvent>;

    /// Abort an in-flight request. A `Failed` event is still delivered
    /// so the caller's accounting stays balanced.
    fn abort(&mut self, id: RequestId);

    /// Number of requests started but not yet done/failed.
    fn in_flight(&self) -> usize;

    /// Reserve a request id without issuing a request (used for
    /// navigations that never hit the network, e.g. `about:blank`).
    fn next_request_id(&mut self) -> RequestId;
}
