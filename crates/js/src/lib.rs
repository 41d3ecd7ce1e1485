//! Engine-agnostic JavaScript facade.
//!
//! This crate centralizes the interface the page runtime expects from a
//! JavaScript engine so engines can be swapped (a V8-class embedding in
//! production, [`StubEngine`] in tests). The engine calls back into the
//! runtime only through [`HostSignals`], never by holding a reference to
//! page state.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use anyhow::Result;
use net::PooledBuf;
use url::Url;

pub mod stub;
pub use stub::{EvaluatedScript, StubEngine};

/// A minimal interface for evaluating JavaScript in a per-page engine.
/// Keep this trait small so engines can be swapped.
pub trait JsEngine {
    /// Evaluate a classic script.
    ///
    /// # Errors
    /// Returns an error if compilation or execution throws.
    fn eval_script(&mut self, source: &str, url: &str) -> Result<()>;

    /// Evaluate an ES module. `cacheable` hints that the compiled form
    /// may be retained keyed by `url`.
    ///
    /// # Errors
    /// Returns an error if compilation or evaluation throws.
    fn eval_module(&mut self, source: &str, url: &str, cacheable: bool) -> Result<()>;

    /// Drain the engine's microtask queue until idle.
    ///
    /// # Errors
    /// Returns an error if a microtask throws uncatchably.
    fn run_microtasks(&mut self) -> Result<()>;
}

/// Where a navigation request raised from script came from; the page
/// resolves races between competing requests by this class.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum NavigationSource {
    /// Followed link / anchor default action.
    Anchor,
    /// `location = ...` and friends.
    Script,
    /// Form submission.
    Form,
}

/// A navigation raised while script was running. It must not preempt
/// the running script; the host applies it after control returns.
#[derive(Clone, Debug)]
pub struct NavigationRequest {
    pub url: String,
    pub source: NavigationSource,
}

/// A value a script stored on the global object. Only the shapes the
/// stub interpreter understands; a real engine keeps its own globals.
#[derive(Clone, Debug, PartialEq)]
pub enum GlobalValue {
    Number(f64),
    Text(String),
    Bool(bool),
}

/// Side-channel the engine uses to signal the host. Shared single-
/// threaded via `Rc<RefCell<..>>`; the page drains it after every
/// evaluation.
#[derive(Default)]
pub struct HostSignals {
    /// Navigations requested by script, in request order.
    pub navigations: Vec<NavigationRequest>,
    /// Globals assigned by script (stub engine only; used by tests).
    pub globals: HashMap<String, GlobalValue>,
}

impl HostSignals {
    #[inline]
    pub fn shared() -> Rc<RefCell<Self>> {
        Rc::new(RefCell::new(Self::default()))
    }
}

/// The body of a fetched ES module, handed to the engine's dynamic
/// import continuation. The buffer is shared with the module map so
/// racing importers see the same bytes; the pool gets it back when the
/// last holder drops.
pub struct ModuleSource {
    url: Url,
    buf: Rc<PooledBuf>,
}

impl ModuleSource {
    #[inline]
    pub fn new(url: Url, buf: Rc<PooledBuf>) -> Self {
        Self { url, buf }
    }

    #[inline]
    pub fn url(&self) -> &Url {
        &self.url
    }

    #[inline]
    pub fn source(&self) -> std::borrow::Cow<'_, str> {
        self.buf.as_text()
    }
}
