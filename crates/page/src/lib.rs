//! The core page runtime: one [`Page`] drives one document's
//! lifecycle, coordinating the parser, scripts, events, observers and
//! the cooperative scheduler on a single thread.

use std::cell::RefCell;
use std::rc::Rc;

pub mod custom;
pub mod idle;
pub mod notify;
pub mod observers;
pub mod page;
pub mod scheduler;
pub mod script;
pub mod window;

pub use custom::{CustomElementDefinition, CustomElementRegistry};
pub use idle::{IdleNotification, ALMOST_IDLE_MAX_INFLIGHT, IDLE_THRESHOLD};
pub use notify::{EventPayload, Notifier, PageEvent, PageId};
pub use observers::{
    IntersectionRecord, MutationObserverOptions, MutationRecord, ObserverId, PerformanceEntry,
    MAX_MUTATION_DEPTH,
};
pub use page::{LoadState, Page, PageConfig};
pub use scheduler::{ScheduledTask, Scheduler, TaskHandle};
pub use script::{ScriptKind, ScriptManager, ScriptMode, ScriptState};
pub use window::Window;

/// The transport handle shared by a page tree (frames fetch through
/// their root's client).
pub type SharedTransport = Rc<RefCell<dyn net::Transport>>;

/// A page's JS engine context.
pub type SharedEngine = Rc<RefCell<dyn js::JsEngine>>;

/// Creates a fresh engine context plus its host-signal channel; called
/// once per document (navigations replace the context).
pub type EngineFactory = Rc<dyn Fn() -> (SharedEngine, Rc<RefCell<js::HostSignals>>)>;
