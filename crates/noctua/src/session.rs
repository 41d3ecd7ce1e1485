//! Session: the factory for pages.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use anyhow::Result;
use js::{HostSignals, StubEngine};
use log::info;
use net::HttpClient;
use page::{EngineFactory, Notifier, Page, PageConfig, PageEvent, PageId, SharedTransport};

/// Owns what pages share: the transport, the engine factory, the
/// notification bus and the page-id space. Frames created by a page
/// draw from the same id space.
pub struct Session {
    transport: SharedTransport,
    engine_factory: EngineFactory,
    notifier: Notifier,
    config: PageConfig,
    next_page_id: Rc<Cell<PageId>>,
}

impl Session {
    /// A session backed by the real HTTP client and the stub engine.
    /// Embedders with a JS engine plug in their own factory via
    /// [`Session::with_parts`].
    ///
    /// # Errors
    /// Returns an error if the HTTP client cannot initialize.
    pub fn new(config: PageConfig) -> Result<Self> {
        let transport: SharedTransport = Rc::new(RefCell::new(HttpClient::new()?));
        Ok(Self::with_parts(transport, stub_engine_factory(), config))
    }

    /// Assemble a session from explicit collaborators (tests use a
    /// scripted transport here).
    pub fn with_parts(
        transport: SharedTransport,
        engine_factory: EngineFactory,
        config: PageConfig,
    ) -> Self {
        Self {
            transport,
            engine_factory,
            notifier: Notifier::new(),
            config,
            next_page_id: Rc::new(Cell::new(1)),
        }
    }

    /// Subscribe to lifecycle events of every page in the session.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<PageEvent> {
        self.notifier.subscribe()
    }

    /// Create a fresh top-level page.
    pub fn create_page(&self) -> Page {
        let id = self.next_page_id.get();
        self.next_page_id.set(id + 1);
        info!("session: created page {id}");
        Page::new(
            id,
            None,
            Rc::clone(&self.transport),
            Rc::clone(&self.engine_factory),
            self.notifier.clone(),
            self.config.clone(),
            Rc::clone(&self.next_page_id),
        )
    }
}

/// One stub engine context per document.
pub fn stub_engine_factory() -> EngineFactory {
    Rc::new(|| {
        let signals = HostSignals::shared();
        let engine: page::SharedEngine =
            Rc::new(RefCell::new(StubEngine::new(Rc::clone(&signals))));
        (engine, signals)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use net::testing::ScriptedTransport;

    #[test]
    fn pages_get_unique_ids() {
        let transport: SharedTransport = Rc::new(RefCell::new(ScriptedTransport::new()));
        let session =
            Session::with_parts(transport, stub_engine_factory(), PageConfig::default());
        let a = session.create_page();
        let b = session.create_page();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn blank_navigation_completes_without_http() {
        let transport = Rc::new(RefCell::new(ScriptedTransport::new()));
        let shared: SharedTransport = transport.clone();
        let session = Session::with_parts(shared, stub_engine_factory(), PageConfig::default());
        let mut page = session.create_page();
        page.navigate("about:blank").expect("blank navigation");
        page.wait_until_complete().expect("completes");
        assert!(page.is_complete());
        assert!(transport.borrow().issued.is_empty(), "no HTTP for about:blank");
    }
}
