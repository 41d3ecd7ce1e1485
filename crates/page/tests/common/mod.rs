//! Shared fixture: a page wired to a scripted transport and stub
//! engines, with handles to every engine/signal context created (one
//! per navigation, plus one per frame).

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use js::{GlobalValue, HostSignals, StubEngine};
use net::testing::ScriptedTransport;
use page::{EngineFactory, Notifier, Page, PageConfig, SharedEngine, SharedTransport};

pub struct Harness {
    pub page: Page,
    pub transport: Rc<RefCell<ScriptedTransport>>,
    pub engines: Rc<RefCell<Vec<Rc<RefCell<StubEngine>>>>>,
    pub signals: Rc<RefCell<Vec<Rc<RefCell<HostSignals>>>>>,
}

impl Harness {
    /// The engine context of the most recent document.
    pub fn engine(&self) -> Rc<RefCell<StubEngine>> {
        Rc::clone(self.engines.borrow().last().expect("an engine exists"))
    }

    /// Evaluated script URLs of the current document, in order.
    pub fn evaluated_urls(&self) -> Vec<String> {
        self.engine().borrow().evaluated_urls()
    }

    /// A global set by script in the current document.
    pub fn global(&self, name: &str) -> Option<GlobalValue> {
        self.signals
            .borrow()
            .last()
            .and_then(|signals| signals.borrow().globals.get(name).cloned())
    }
}

pub fn harness() -> Harness {
    harness_with(PageConfig::default())
}

pub fn harness_with(config: PageConfig) -> Harness {
    let _ = env_logger::builder().is_test(true).try_init();
    let transport = Rc::new(RefCell::new(ScriptedTransport::new()));
    let engines: Rc<RefCell<Vec<Rc<RefCell<StubEngine>>>>> = Rc::default();
    let signals: Rc<RefCell<Vec<Rc<RefCell<HostSignals>>>>> = Rc::default();

    let factory: EngineFactory = {
        let engines = Rc::clone(&engines);
        let signals_list = Rc::clone(&signals);
        Rc::new(move || {
            let signals = HostSignals::shared();
            let stub = Rc::new(RefCell::new(StubEngine::new(Rc::clone(&signals))));
            engines.borrow_mut().push(Rc::clone(&stub));
            signals_list.borrow_mut().push(Rc::clone(&signals));
            let engine: SharedEngine = stub;
            (engine, signals)
        })
    };

    let shared: SharedTransport = transport.clone();
    let page = Page::new(
        1,
        None,
        shared,
        factory,
        Notifier::new(),
        config,
        Rc::new(Cell::new(2)),
    );
    Harness {
        page,
        transport,
        engines,
        signals,
    }
}
