//! Scripted transport for deterministic tests.
//!
//! Responses are registered up front keyed by URL path (or full URL)
//! and released after a configurable number of `tick` calls, so tests
//! control completion order without touching the network or the clock.

use std::collections::VecDeque;
use std::time::Duration;

use bytes::Bytes;
use url::Url;

use crate::{FetchEvent, FetchEventKind, FetchRequest, RequestId, Transport};

/// A canned response.
#[derive(Clone, Debug)]
pub struct ScriptedResponse {
    pub status: u16,
    pub body: Vec<u8>,
    pub content_type: Option<String>,
    /// Ticks that must elapse after the request is issued before the
    /// response is delivered. 0 delivers on the next tick.
    pub delay_ticks: u64,
    /// Overrides the response URL, simulating a redirect chain.
    pub final_url: Option<Url>,
    /// Deliver a transport failure instead of a response.
    pub fail: Option<String>,
}

impl ScriptedResponse {
    #[inline]
    pub fn ok(body: &str) -> Self {
        Self {
            status: 200,
            body: body.as_bytes().to_vec(),
            content_type: Some("text/html".to_owned()),
            delay_ticks: 0,
            final_url: None,
            fail: None,
        }
    }

    #[inline]
    pub fn script(body: &str) -> Self {
        Self {
            content_type: Some("text/javascript".to_owned()),
            ..Self::ok(body)
        }
    }

    #[inline]
    pub fn status(status: u16) -> Self {
        Self {
            status,
            ..Self::ok("")
        }
    }

    #[inline]
    pub fn error(message: &str) -> Self {
        Self {
            fail: Some(message.to_owned()),
            ..Self::ok("")
        }
    }

    /// Delay delivery by the given number of ticks.
    #[inline]
    #[must_use]
    pub fn after_ticks(mut self, ticks: u64) -> Self {
        self.delay_ticks = ticks;
        self
    }

    /// Report a different final URL (redirected response).
    #[inline]
    #[must_use]
    pub fn redirected_to(mut self, url: Url) -> Self {
        self.final_url = Some(url);
        self
    }

    #[inline]
    #[must_use]
    pub fn with_content_type(mut self, value: &str) -> Self {
        self.content_type = Some(value.to_owned());
        self
    }
}

struct Pending {
    id: RequestId,
    url: Url,
    response: ScriptedResponse,
    due_tick: u64,
}

/// Transport whose responses come from a script instead of sockets.
#[derive(Default)]
pub struct ScriptedTransport {
    routes: Vec<(String, ScriptedResponse)>,
    pending: VecDeque<Pending>,
    /// Every request issued, in order, for assertions.
    pub issued: Vec<(RequestId, FetchRequest)>,
    tick_count: u64,
    next_id: RequestId,
}

impl ScriptedTransport {
    #[inline]
    pub fn new() -> Self {
        Self {
            next_id: 1,
            ..Self::default()
        }
    }

    /// Register a response for any request whose URL contains `pattern`.
    /// First matching registration wins.
    pub fn route(&mut self, pattern: &str, response: ScriptedResponse) {
        self.routes.push((pattern.to_owned(), response));
    }

    fn lookup(&self, url: &Url) -> ScriptedResponse {
        let target = url.as_str();
        self.routes
            .iter()
            .find(|(pattern, _)| target.contains(pattern.as_str()))
            .map(|(_, resp)| resp.clone())
            .unwrap_or_else(|| ScriptedResponse::status(404))
    }

    /// URLs of every issued request, for ordering assertions.
    pub fn requested_urls(&self) -> Vec<String> {
        self.issued
            .iter()
            .map(|(_, req)| req.url.as_str().to_owned())
            .collect()
    }
}

impl Transport for ScriptedTransport {
    fn request(&mut self, req: FetchRequest) -> RequestId {
        let id = self.next_id;
        self.next_id += 1;
        let response = self.lookup(&req.url);
        self.pending.push_back(Pending {
            id,
            url: req.url.clone(),
            due_tick: self.tick_count + response.delay_ticks,
            response,
        });
        self.issued.push((id, req));
        id
    }

    fn tick(&mut self, _wait: Duration) -> Vec<FetchEvent> {
        self.tick_count += 1;
        let now = self.tick_count;
        let mut due: Vec<Pending> = Vec::new();
        self.pending.retain_mut(|p| {
            if p.due_tick < now {
                due.push(Pending {
                    id: p.id,
                    url: p.url.clone(),
                    response: p.response.clone(),
                    due_tick: p.due_tick,
                });
                false
            } else {
                true
            }
        });
        due.sort_by_key(|p| (p.due_tick, p.id));

        let mut events = Vec::new();
        for p in due {
            if let Some(message) = p.response.fail {
                events.push(FetchEvent {
                    request: p.id,
                    kind: FetchEventKind::Failed(message),
                });
                continue;
            }
            events.push(FetchEvent {
                request: p.id,
                kind: FetchEventKind::Header {
                    status: p.response.status,
                    final_url: p.response.final_url.unwrap_or(p.url),
                    content_type: p.response.content_type,
                },
            });
            if !p.response.body.is_empty() {
                events.push(FetchEvent {
                    request: p.id,
                    kind: FetchEventKind::Data(Bytes::from(p.response.body)),
                });
            }
            events.push(FetchEvent {
                request: p.id,
                kind: FetchEventKind::Done,
            });
        }
        events
    }

    fn abort(&mut self, id: RequestId) {
        self.pending.retain(|p| p.id != id);
    }

    fn in_flight(&self) -> usize {
        self.pending.len()
    }

    fn next_request_id(&mut self) -> RequestId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ResourceType;

    fn url(s: &str) -> Url {
        Url::parse(s).expect("test url")
    }

    #[test]
    fn delivers_in_delay_order() {
        let mut transport = ScriptedTransport::new();
        transport.route("/slow", ScriptedResponse::script("slow").after_ticks(3));
        transport.route("/fast", ScriptedResponse::script("fast"));

        let slow = transport.request(FetchRequest::get(
            url("http://t/slow"),
            ResourceType::Script,
        ));
        let fast = transport.request(FetchRequest::get(
            url("http://t/fast"),
            ResourceType::Script,
        ));
        assert_eq!(transport.in_flight(), 2);

        let first = transport.tick(Duration::ZERO);
        assert!(first.iter().all(|ev| ev.request == fast));
        assert_eq!(transport.in_flight(), 1);

        let mut done = Vec::new();
        for _ in 0..4 {
            done.extend(transport.tick(Duration::ZERO));
        }
        assert!(done.iter().any(|ev| ev.request == slow));
        assert_eq!(transport.in_flight(), 0);
    }

    #[test]
    fn unrouted_requests_get_404() {
        let mut transport = ScriptedTransport::new();
        let id = transport.request(FetchRequest::get(
            url("http://t/missing"),
            ResourceType::Document,
        ));
        let events = transport.tick(Duration::ZERO);
        assert!(events.iter().any(|ev| {
            ev.request == id
                && matches!(ev.kind, FetchEventKind::Header { status: 404, .. })
        }));
    }
}
