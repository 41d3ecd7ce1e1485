//! Notification bus.
//!
//! Pages broadcast lifecycle events to whoever subscribed (a session,
//! a CDP layer, tests). Sending with no receivers is fine and ignored.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::sync::broadcast;

pub type PageId = u64;

/// Common payload carried by every page event.
#[derive(Clone, Debug, Serialize)]
pub struct EventPayload {
    pub page_id: PageId,
    pub request_id: u64,
    pub url: String,
    pub timestamp_ms: u64,
}

impl EventPayload {
    pub fn new(page_id: PageId, request_id: u64, url: &str) -> Self {
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        Self {
            page_id,
            request_id,
            url: url.to_owned(),
            timestamp_ms,
        }
    }
}

#[derive(Clone, Debug)]
pub enum PageEvent {
    /// A navigation was requested and is starting.
    Navigate(EventPayload),
    /// The navigation's document finished loading.
    Navigated(EventPayload),
    /// ≤2 transfers in flight continuously for the idle threshold.
    NetworkAlmostIdle(EventPayload),
    /// 0 transfers in flight continuously for the idle threshold.
    NetworkIdle(EventPayload),
    /// A subframe page was created.
    FrameCreated {
        payload: EventPayload,
        frame_id: PageId,
    },
}

impl PageEvent {
    pub fn payload(&self) -> &EventPayload {
        match self {
            Self::Navigate(p)
            | Self::Navigated(p)
            | Self::NetworkAlmostIdle(p)
            | Self::NetworkIdle(p)
            | Self::FrameCreated { payload: p, .. } => p,
        }
    }
}

/// Cloneable sender half of the bus.
#[derive(Clone)]
pub struct Notifier {
    tx: broadcast::Sender<PageEvent>,
}

impl Notifier {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self { tx }
    }

    #[inline]
    pub fn subscribe(&self) -> broadcast::Receiver<PageEvent> {
        self.tx.subscribe()
    }

    /// Emit an event, ignoring it if there are no listeners.
    #[inline]
    pub fn emit(&self, event: PageEvent) {
        drop(self.tx.send(event));
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}
