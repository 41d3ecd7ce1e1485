//! Script fetching, ordering and evaluation.
//!
//! Four lists by execution mode: `normal` (blocking, document order),
//! `deferred` (after parsing, document order), `async` (own completion
//! order) and `ready` (completed async work awaiting evaluation),
//! plus a by-URL module map coalescing static import fetches.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use dom::NodeId;
use js::ModuleSource;
use log::{debug, warn};
use net::{BufferPool, FetchEvent, FetchEventKind, FetchRequest, PooledBuf, RequestId, ResourceType};
use url::Url;

use crate::{SharedEngine, SharedTransport};

/// Upper bound on busy-wait iterations for blocking fetches; a stuck
/// transport must not hang the page forever.
const MAX_WAIT_TICKS: u32 = 100_000;

const WAIT_TICK: Duration = Duration::from_millis(5);

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ScriptKind {
    Classic,
    Module,
    ImportMap,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ScriptMode {
    /// Parser-blocking, strict document order.
    Normal,
    /// After parsing, strict document order.
    Defer,
    /// Whenever its own fetch lands.
    Async,
    /// Static module import (module map).
    Import,
    /// Dynamic module import (module map + continuation).
    ImportAsync,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ScriptState {
    PendingFetch,
    Fetching,
    Fetched,
    Evaluating,
    Evaluated,
    Errored,
    Disposed,
}

pub enum ScriptSource {
    Inline(String),
    Remote(Option<PooledBuf>),
}

pub struct Script {
    pub kind: ScriptKind,
    pub mode: ScriptMode,
    pub url: Url,
    pub element: Option<NodeId>,
    pub source: ScriptSource,
    pub status: u16,
    pub complete: bool,
    pub state: ScriptState,
}

type ScriptRef = Rc<RefCell<Script>>;

/// What `add_from_element` decided, so the caller knows whether it
/// must spin on the fetch (the single permitted busy-wait lives with
/// the caller of a parser-blocking remote script).
pub enum AddOutcome {
    /// nomodule, unknown type, or shut down.
    Skipped,
    /// Inline classic with nothing pending; already evaluated.
    EvaluatedInline,
    /// Parked in one of the mode lists.
    Queued(ScriptMode),
    /// Parser-blocking remote script; pump the transport until
    /// `Script::complete`, then call [`ScriptManager::evaluate`].
    Blocking(ScriptRef),
}

/// Element-side facts needed to classify a `<script>`.
pub struct ScriptElementInfo {
    pub node: NodeId,
    pub src: Option<String>,
    pub async_attr: bool,
    pub defer_attr: bool,
    pub type_attr: Option<String>,
    pub nomodule: bool,
    pub inline_source: String,
    pub parser_inserted: bool,
}

/// Evaluation/error results the page turns into element events.
#[derive(Clone, Debug)]
pub enum ScriptOutcome {
    Evaluated { element: Option<NodeId>, url: Url },
    Errored {
        element: Option<NodeId>,
        url: Url,
        status: u16,
    },
}

/// Progress report from one [`ScriptManager::evaluate`] pass.
#[derive(Copy, Clone, Debug, Default)]
pub struct EvaluateStatus {
    /// Normal and deferred lists are drained (the DOMContentLoaded
    /// point for the page).
    pub static_and_deferred_done: bool,
    /// Everything is drained, including async and imports.
    pub all_done: bool,
}

enum ImportState {
    Loading { waiters: u32 },
    Done(Rc<PooledBuf>),
    Failed(u16),
}

type DynamicCallback = Box<dyn FnOnce(Result<ModuleSource>)>;

struct ImportEntry {
    mode: ScriptMode,
    state: ImportState,
    callbacks: Vec<DynamicCallback>,
}

enum ReadyItem {
    Script(ScriptRef),
    DynamicImport {
        url: Url,
        callback: DynamicCallback,
        result: Result<Rc<PooledBuf>, u16>,
    },
}

enum PendingFetch {
    Script(ScriptRef),
    Import(Url),
}

pub struct ScriptManager {
    base_url: Url,
    transport: SharedTransport,
    engine: SharedEngine,
    pool: BufferPool,

    normal: VecDeque<ScriptRef>,
    deferred: VecDeque<ScriptRef>,
    async_list: Vec<ScriptRef>,
    ready: VecDeque<ReadyItem>,

    imports: HashMap<Url, ImportEntry>,
    import_buffers: HashMap<Url, PooledBuf>,
    import_map: HashMap<String, Url>,
    by_request: HashMap<RequestId, PendingFetch>,

    /// The element whose script is evaluating right now
    /// (`document.currentScript`).
    pub current_script: Option<NodeId>,

    outcomes: Vec<ScriptOutcome>,
    orphan_events: Vec<FetchEvent>,

    evaluating: bool,
    static_done: bool,
    pending_dynamic: usize,
    inline_counter: u64,
    shutdown: bool,
}

impl ScriptManager {
    pub fn new(base_url: Url, transport: SharedTransport, engine: SharedEngine) -> Self {
        Self {
            base_url,
            transport,
            engine,
            pool: BufferPool::default(),
            normal: VecDeque::new(),
            deferred: VecDeque::new(),
            async_list: Vec::new(),
            ready: VecDeque::new(),
            imports: HashMap::new(),
            import_buffers: HashMap::new(),
            import_map: HashMap::new(),
            by_request: HashMap::new(),
            current_script: None,
            outcomes: Vec::new(),
            orphan_events: Vec::new(),
            evaluating: false,
            static_done: false,
            pending_dynamic: 0,
            inline_counter: 0,
            shutdown: false,
        }
    }

    #[inline]
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// The parser finished; deferred scripts may run from now on.
    pub fn mark_static_done(&mut self) {
        self.static_done = true;
    }

    #[inline]
    pub fn static_done(&self) -> bool {
        self.static_done
    }

    /// True once every list is drained and nothing is outstanding.
    pub fn is_idle(&self) -> bool {
        self.static_done
            && self.normal.is_empty()
            && self.deferred.is_empty()
            && self.async_list.is_empty()
            && self.ready.is_empty()
            && self.pending_dynamic == 0
    }

    /// Element events owed to the page (load/error on script elements).
    pub fn take_outcomes(&mut self) -> Vec<ScriptOutcome> {
        std::mem::take(&mut self.outcomes)
    }

    /// Transport events seen during an internal wait loop that belong
    /// to someone else; the page must re-route them.
    pub fn take_orphan_events(&mut self) -> Vec<FetchEvent> {
        std::mem::take(&mut self.orphan_events)
    }

    /// Stop all script work: abort fetches, drop every list.
    pub fn shutdown(&mut self) {
        self.shutdown = true;
        let ids: Vec<RequestId> = self.by_request.keys().copied().collect();
        for id in ids {
            self.transport.borrow_mut().abort(id);
        }
        self.by_request.clear();
        self.normal.clear();
        self.deferred.clear();
        self.async_list.clear();
        self.ready.clear();
    }

    // ── Classification & intake ─────────────────────────────────────

    /// Handle a `<script>` element on first encounter.
    pub fn add_from_element(&mut self, info: ScriptElementInfo) -> AddOutcome {
        if self.shutdown || info.nomodule {
            return AddOutcome::Skipped;
        }
        let kind = match classify_type(info.type_attr.as_deref()) {
            Some(kind) => kind,
            None => {
                debug!(
                    "ScriptManager: skipping unsupported type {:?}",
                    info.type_attr
                );
                return AddOutcome::Skipped;
            }
        };

        match info.src {
            None => self.add_inline(kind, &info),
            Some(ref src) => self.add_remote(kind, src, &info),
        }
    }

    fn add_inline(&mut self, kind: ScriptKind, info: &ScriptElementInfo) -> AddOutcome {
        self.inline_counter += 1;
        let mut url = self.base_url.clone();
        url.set_fragment(Some(&format!("inline-{}", self.inline_counter)));
        let script = Rc::new(RefCell::new(Script {
            kind,
            mode: ScriptMode::Normal,
            url,
            element: Some(info.node),
            source: ScriptSource::Inline(info.inline_source.clone()),
            status: 200,
            complete: true,
            state: ScriptState::Fetched,
        }));

        match kind {
            ScriptKind::Classic => {
                if self.normal.is_empty() {
                    self.eval_now(&script);
                    AddOutcome::EvaluatedInline
                } else {
                    self.normal.push_back(script);
                    AddOutcome::Queued(ScriptMode::Normal)
                }
            }
            // Inline modules and import maps wait for the parser.
            ScriptKind::Module | ScriptKind::ImportMap => {
                script.borrow_mut().mode = ScriptMode::Defer;
                self.deferred.push_back(script);
                AddOutcome::Queued(ScriptMode::Defer)
            }
        }
    }

    fn add_remote(&mut self, kind: ScriptKind, src: &str, info: &ScriptElementInfo) -> AddOutcome {
        let url = match self.base_url.join(src) {
            Ok(url) => url,
            Err(err) => {
                warn!("ScriptManager: bad script src {src:?}: {err}");
                self.outcomes.push(ScriptOutcome::Errored {
                    element: Some(info.node),
                    url: self.base_url.clone(),
                    status: 0,
                });
                return AddOutcome::Skipped;
            }
        };

        let mode = if info.async_attr {
            ScriptMode::Async
        } else if info.defer_attr || kind == ScriptKind::Module {
            ScriptMode::Defer
        } else if info.parser_inserted {
            ScriptMode::Normal
        } else {
            // Dynamically-inserted scripts default to async.
            ScriptMode::Async
        };

        let script = Rc::new(RefCell::new(Script {
            kind,
            mode,
            url: url.clone(),
            element: Some(info.node),
            source: ScriptSource::Remote(None),
            status: 0,
            complete: false,
            state: ScriptState::PendingFetch,
        }));
        self.start_fetch(&script);

        match mode {
            ScriptMode::Normal => {
                self.normal.push_back(Rc::clone(&script));
                AddOutcome::Blocking(script)
            }
            ScriptMode::Defer => {
                self.deferred.push_back(script);
                AddOutcome::Queued(ScriptMode::Defer)
            }
            _ => {
                self.async_list.push(script);
                AddOutcome::Queued(ScriptMode::Async)
            }
        }
    }

    fn start_fetch(&mut self, script: &ScriptRef) {
        let url = script.borrow().url.clone();
        let request = FetchRequest::get(url, ResourceType::Script)
            .header("Referer", self.base_url.as_str());
        let id = self.transport.borrow_mut().request(request);
        script.borrow_mut().state = ScriptState::Fetching;
        self.by_request.insert(id, PendingFetch::Script(Rc::clone(script)));
    }

    // ── Fetch event routing ─────────────────────────────────────────

    /// Feed one transport event. Returns false when the request is not
    /// one of ours.
    pub fn handle_fetch_event(&mut self, ev: &FetchEvent) -> bool {
        let routed = match self.by_request.get(&ev.request) {
            Some(PendingFetch::Script(script)) => PendingFetch::Script(Rc::clone(script)),
            Some(PendingFetch::Import(url)) => PendingFetch::Import(url.clone()),
            None => return false,
        };
        match routed {
            PendingFetch::Script(script) => self.script_fetch_event(&script, ev),
            PendingFetch::Import(url) => self.import_fetch_event(&url, ev),
        }
        if matches!(ev.kind, FetchEventKind::Done | FetchEventKind::Failed(_)) {
            self.by_request.remove(&ev.request);
        }
        true
    }

    fn script_fetch_event(&mut self, script: &ScriptRef, ev: &FetchEvent) {
        match &ev.kind {
            FetchEventKind::Header { status, .. } => {
                script.borrow_mut().status = *status;
                if !(200..300).contains(status) {
                    warn!(
                        "ScriptManager: {} failed with status {status}",
                        script.borrow().url
                    );
                    self.fail_script(script, *status);
                }
            }
            FetchEventKind::Data(bytes) => {
                let mut script = script.borrow_mut();
                if script.state == ScriptState::Errored {
                    return;
                }
                if let ScriptSource::Remote(buf) = &mut script.source {
                    buf.get_or_insert_with(|| self.pool.acquire())
                        .extend_from_slice(bytes);
                }
            }
            FetchEventKind::Done => {
                {
                    let mut script = script.borrow_mut();
                    if script.state == ScriptState::Errored {
                        return;
                    }
                    script.complete = true;
                    script.state = ScriptState::Fetched;
                }
                if script.borrow().mode == ScriptMode::Async {
                    self.async_list.retain(|s| !Rc::ptr_eq(s, script));
                    self.ready.push_back(ReadyItem::Script(Rc::clone(script)));
                }
            }
            FetchEventKind::Failed(message) => {
                warn!(
                    "ScriptManager: fetch of {} failed: {message}",
                    script.borrow().url
                );
                self.fail_script(script, 0);
            }
        }
    }

    /// Error in a non-blocking mode removes the script from its list;
    /// in blocking mode control returns to the waiting caller with
    /// `complete = true, status = 0`.
    fn fail_script(&mut self, script: &ScriptRef, status: u16) {
        let (mode, element, url) = {
            let mut s = script.borrow_mut();
            s.state = ScriptState::Errored;
            s.complete = true;
            s.status = status;
            (s.mode, s.element, s.url.clone())
        };
        match mode {
            ScriptMode::Normal => {
                self.normal.retain(|s| !Rc::ptr_eq(s, script));
            }
            ScriptMode::Defer => {
                self.deferred.retain(|s| !Rc::ptr_eq(s, script));
            }
            _ => {
                self.async_list.retain(|s| !Rc::ptr_eq(s, script));
            }
        }
        self.outcomes.push(ScriptOutcome::Errored {
            element,
            url,
            status,
        });
    }

    // ── Evaluation ──────────────────────────────────────────────────

    /// The evaluation loop. Reentrancy-guarded: a nested call (script
    /// adding a script) is a no-op and the outer pass picks the new
    /// work up.
    pub fn evaluate(&mut self) -> EvaluateStatus {
        if self.evaluating || self.shutdown {
            return EvaluateStatus::default();
        }
        self.evaluating = true;

        // 1. Ready work: completed async scripts and dynamic imports.
        while let Some(item) = self.ready.pop_front() {
            match item {
                ReadyItem::Script(script) => self.eval_now(&script),
                ReadyItem::DynamicImport {
                    url,
                    callback,
                    result,
                } => {
                    self.pending_dynamic = self.pending_dynamic.saturating_sub(1);
                    match result {
                        Ok(buf) => callback(Ok(ModuleSource::new(url, buf))),
                        Err(status) => {
                            callback(Err(anyhow!("import of {url} failed with status {status}")));
                        }
                    }
                }
            }
        }

        // 2. Nothing below runs until the parser is done feeding us.
        if !self.static_done {
            self.evaluating = false;
            return EvaluateStatus::default();
        }

        // 3. Normal scripts, strictly in document order; an incomplete
        // head blocks the rest.
        while self
            .normal
            .front()
            .is_some_and(|s| s.borrow().complete)
        {
            if let Some(script) = self.normal.pop_front() {
                self.eval_now(&script);
            }
        }

        // 4. Deferred scripts, in document order, after normals drain.
        if self.normal.is_empty() {
            while self
                .deferred
                .front()
                .is_some_and(|s| s.borrow().complete)
            {
                if let Some(script) = self.deferred.pop_front() {
                    self.eval_now(&script);
                }
            }
        }

        self.evaluating = false;
        let static_and_deferred_done = self.normal.is_empty() && self.deferred.is_empty();
        EvaluateStatus {
            static_and_deferred_done,
            all_done: static_and_deferred_done && self.is_idle(),
        }
    }

    fn eval_now(&mut self, script: &ScriptRef) {
        let (kind, element, url, source) = {
            let mut s = script.borrow_mut();
            if s.state == ScriptState::Errored || s.state == ScriptState::Disposed {
                return;
            }
            s.state = ScriptState::Evaluating;
            let source = match &s.source {
                ScriptSource::Inline(text) => text.clone(),
                ScriptSource::Remote(Some(buf)) => buf.as_text().into_owned(),
                ScriptSource::Remote(None) => String::new(),
            };
            (s.kind, s.element, s.url.clone(), source)
        };

        self.current_script = element;
        let result = match kind {
            ScriptKind::Classic => self.engine.borrow_mut().eval_script(&source, url.as_str()),
            ScriptKind::Module => self
                .engine
                .borrow_mut()
                .eval_module(&source, url.as_str(), true),
            ScriptKind::ImportMap => self.install_import_map(&source),
        };
        self.current_script = None;

        let mut s = script.borrow_mut();
        match result {
            Ok(()) => {
                s.state = ScriptState::Evaluated;
                self.outcomes.push(ScriptOutcome::Evaluated { element, url });
            }
            Err(err) => {
                warn!("ScriptManager: evaluation of {url} threw: {err}");
                s.state = ScriptState::Errored;
                self.outcomes.push(ScriptOutcome::Errored {
                    element,
                    url,
                    status: s.status,
                });
            }
        }
        s.source = ScriptSource::Remote(None);
        s.state = match s.state {
            ScriptState::Evaluated => ScriptState::Disposed,
            other => other,
        };
    }

    // ── Import map & module graph ───────────────────────────────────

    /// Parse an import-map body and install its mappings. Keys are
    /// unresolved specifiers; values resolve against the document URL.
    pub fn install_import_map(&mut self, source: &str) -> Result<()> {
        let value: serde_json::Value = serde_json::from_str(source)?;
        let imports = value
            .get("imports")
            .and_then(serde_json::Value::as_object)
            .ok_or_else(|| anyhow!("import map has no imports object"))?;
        for (specifier, target) in imports {
            let Some(target) = target.as_str() else {
                continue;
            };
            match self.base_url.join(target) {
                Ok(url) => {
                    self.import_map.insert(specifier.clone(), url);
                }
                Err(err) => warn!("import map: bad target {target:?}: {err}"),
            }
        }
        Ok(())
    }

    /// Resolve a module specifier: import map first, URL join second.
    pub fn resolve_specifier(&self, base: &Url, specifier: &str) -> Result<Url> {
        if let Some(mapped) = self.import_map.get(specifier) {
            return Ok(mapped.clone());
        }
        base.join(specifier)
            .map_err(|err| anyhow!("cannot resolve {specifier:?}: {err}"))
    }

    /// Start fetching a static import, coalescing by URL.
    pub fn preload_import(&mut self, url: &Url) {
        if self.shutdown || self.imports.contains_key(url) {
            return;
        }
        let request = FetchRequest::get(url.clone(), ResourceType::Script)
            .header("Referer", self.base_url.as_str());
        let id = self.transport.borrow_mut().request(request);
        self.by_request.insert(id, PendingFetch::Import(url.clone()));
        self.imports.insert(
            url.clone(),
            ImportEntry {
                mode: ScriptMode::Import,
                state: ImportState::Loading { waiters: 0 },
                callbacks: Vec::new(),
            },
        );
    }

    /// Block until a static import is available. This pumps the
    /// transport; events for other requests are stashed for the page
    /// to re-route.
    ///
    /// # Errors
    /// Returns an error when the fetch failed or the wait gave up.
    pub fn wait_for_import(&mut self, url: &Url) -> Result<Rc<PooledBuf>> {
        self.preload_import(url);
        if let Some(ImportEntry { state: ImportState::Loading { waiters }, .. }) =
            self.imports.get_mut(url)
        {
            *waiters += 1;
            debug!("ScriptManager: waiting for import {url} ({waiters} waiters)");
        }

        let mut ticks = 0u32;
        loop {
            match self.imports.get(url).map(|e| &e.state) {
                Some(ImportState::Done(buf)) => return Ok(Rc::clone(buf)),
                Some(ImportState::Failed(status)) => {
                    return Err(anyhow!("import of {url} failed with status {status}"));
                }
                Some(ImportState::Loading { .. }) => {}
                None => return Err(anyhow!("import of {url} was dropped")),
            }
            ticks += 1;
            if ticks > MAX_WAIT_TICKS {
                return Err(anyhow!("timed out waiting for import of {url}"));
            }
            let events = self.transport.borrow_mut().tick(WAIT_TICK);
            for ev in events {
                if !self.handle_fetch_event(&ev) {
                    self.orphan_events.push(ev);
                }
            }
        }
    }

    /// Fetch a dynamic import; `callback` runs from the evaluation
    /// loop with the module source or the error.
    pub fn get_async_import(&mut self, url: &Url, callback: DynamicCallback) {
        self.pending_dynamic += 1;
        if !self.imports.contains_key(url) {
            self.preload_import(url);
            if let Some(entry) = self.imports.get_mut(url) {
                entry.mode = ScriptMode::ImportAsync;
                entry.callbacks.push(callback);
            } else {
                // Shutdown: fail straight into the ready queue.
                self.ready.push_back(ReadyItem::DynamicImport {
                    url: url.clone(),
                    callback,
                    result: Err(0),
                });
            }
            return;
        }
        let settled = match self.imports.get(url).map(|e| &e.state) {
            Some(ImportState::Done(buf)) => Some(Ok(Rc::clone(buf))),
            Some(ImportState::Failed(status)) => Some(Err(*status)),
            _ => None,
        };
        match settled {
            Some(result) => self.ready.push_back(ReadyItem::DynamicImport {
                url: url.clone(),
                callback,
                result,
            }),
            None => {
                if let Some(entry) = self.imports.get_mut(url) {
                    entry.callbacks.push(callback);
                }
            }
        }
    }

    fn import_fetch_event(&mut self, url: &Url, ev: &FetchEvent) {
        let Some(entry) = self.imports.get_mut(url) else {
            return;
        };
        match &ev.kind {
            FetchEventKind::Header { status, .. } => {
                if !(200..300).contains(status) {
                    entry.state = ImportState::Failed(*status);
                    let callbacks = std::mem::take(&mut entry.callbacks);
                    let status = *status;
                    for callback in callbacks {
                        self.ready.push_back(ReadyItem::DynamicImport {
                            url: url.clone(),
                            callback,
                            result: Err(status),
                        });
                    }
                }
            }
            FetchEventKind::Data(bytes) => {
                if let ImportState::Loading { .. } = entry.state {
                    // Accumulate into a pooled buffer kept alongside.
                    let buf = self
                        .import_buffers
                        .entry(url.clone())
                        .or_insert_with(|| self.pool.acquire());
                    buf.extend_from_slice(bytes);
                }
            }
            FetchEventKind::Done => {
                if let ImportState::Loading { .. } = entry.state {
                    debug!("ScriptManager: import {url} ready ({:?})", entry.mode);
                    let buf = self
                        .import_buffers
                        .remove(url)
                        .unwrap_or_else(|| self.pool.acquire());
                    let buf = Rc::new(buf);
                    entry.state = ImportState::Done(Rc::clone(&buf));
                    let callbacks = std::mem::take(&mut entry.callbacks);
                    for callback in callbacks {
                        self.ready.push_back(ReadyItem::DynamicImport {
                            url: url.clone(),
                            callback,
                            result: Ok(Rc::clone(&buf)),
                        });
                    }
                }
            }
            FetchEventKind::Failed(message) => {
                warn!("ScriptManager: import fetch of {url} failed: {message}");
                entry.state = ImportState::Failed(0);
                let callbacks = std::mem::take(&mut entry.callbacks);
                for callback in callbacks {
                    self.ready.push_back(ReadyItem::DynamicImport {
                        url: url.clone(),
                        callback,
                        result: Err(0),
                    });
                }
            }
        }
    }

    /// Evaluate a parser-blocking script in place, outside the main
    /// loop (which refuses to drain `normal` until parsing finishes).
    pub fn evaluate_blocking(&mut self, script: &ScriptRef) {
        self.normal.retain(|s| !Rc::ptr_eq(s, script));
        if script.borrow().state != ScriptState::Errored {
            self.eval_now(script);
        }
    }

    /// Busy-wait until `script.complete`, pumping the transport. The
    /// deliberate busy-wait for parser-blocking `<script src>`; do not
    /// generalize it.
    pub fn wait_for_blocking(&mut self, script: &ScriptRef) {
        let mut ticks = 0u32;
        while !script.borrow().complete {
            ticks += 1;
            if ticks > MAX_WAIT_TICKS {
                warn!(
                    "ScriptManager: giving up on blocking fetch of {}",
                    script.borrow().url
                );
                self.fail_script(script, 0);
                return;
            }
            let events = self.transport.borrow_mut().tick(WAIT_TICK);
            for ev in events {
                if !self.handle_fetch_event(&ev) {
                    self.orphan_events.push(ev);
                }
            }
        }
    }
}

fn classify_type(type_attr: Option<&str>) -> Option<ScriptKind> {
    match type_attr.map(str::trim) {
        None | Some("" | "text/javascript" | "application/javascript") => {
            Some(ScriptKind::Classic)
        }
        Some("module") => Some(ScriptKind::Module),
        Some("importmap") => Some(ScriptKind::ImportMap),
        Some(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dom::{DomTree, ElementData, Namespace};
    use js::{HostSignals, StubEngine};
    use net::testing::{ScriptedResponse, ScriptedTransport};
    use net::Transport;

    struct Fixture {
        manager: ScriptManager,
        transport: Rc<RefCell<ScriptedTransport>>,
        engine: Rc<RefCell<StubEngine>>,
        tree: DomTree,
    }

    fn fixture() -> Fixture {
        let transport = Rc::new(RefCell::new(ScriptedTransport::new()));
        let signals = HostSignals::shared();
        let engine = Rc::new(RefCell::new(StubEngine::new(signals)));
        let shared_transport: SharedTransport = transport.clone();
        let shared_engine: SharedEngine = engine.clone();
        let base = Url::parse("http://t/").expect("base url");
        Fixture {
            manager: ScriptManager::new(base, shared_transport, shared_engine),
            transport,
            engine,
            tree: DomTree::new(),
        }
    }

    fn element(fixture: &mut Fixture) -> NodeId {
        fixture
            .tree
            .create_element(ElementData::new(Namespace::Html, "script"))
    }

    fn remote(node: NodeId, src: &str, async_attr: bool, defer_attr: bool) -> ScriptElementInfo {
        ScriptElementInfo {
            node,
            src: Some(src.to_owned()),
            async_attr,
            defer_attr,
            type_attr: None,
            nomodule: false,
            inline_source: String::new(),
            parser_inserted: true,
        }
    }

    fn inline(node: NodeId, source: &str) -> ScriptElementInfo {
        ScriptElementInfo {
            node,
            src: None,
            async_attr: false,
            defer_attr: false,
            type_attr: None,
            nomodule: false,
            inline_source: source.to_owned(),
            parser_inserted: true,
        }
    }

    fn pump(fixture: &mut Fixture, rounds: u32) {
        for _ in 0..rounds {
            let events = fixture.transport.borrow_mut().tick(Duration::ZERO);
            for ev in events {
                fixture.manager.handle_fetch_event(&ev);
            }
            fixture.manager.evaluate();
        }
    }

    #[test]
    fn inline_classic_evaluates_immediately() {
        let mut fixture = fixture();
        let node = element(&mut fixture);
        let outcome = fixture.manager.add_from_element(inline(node, "window.x = 1;"));
        assert!(matches!(outcome, AddOutcome::EvaluatedInline));
        assert_eq!(fixture.engine.borrow().evaluated.len(), 1);
    }

    #[test]
    fn nomodule_and_unknown_types_skip() {
        let mut fixture = fixture();
        let node = element(&mut fixture);
        let mut info = inline(node, "x");
        info.nomodule = true;
        assert!(matches!(
            fixture.manager.add_from_element(info),
            AddOutcome::Skipped
        ));
        let mut info = inline(node, "x");
        info.type_attr = Some("text/template".to_owned());
        assert!(matches!(
            fixture.manager.add_from_element(info),
            AddOutcome::Skipped
        ));
        assert!(fixture.engine.borrow().evaluated.is_empty());
    }

    #[test]
    fn deferred_scripts_run_in_document_order() {
        let mut fixture = fixture();
        fixture
            .transport
            .borrow_mut()
            .route("/a.js", ScriptedResponse::script("window.a = 1;").after_ticks(3));
        fixture
            .transport
            .borrow_mut()
            .route("/b.js", ScriptedResponse::script("window.b = 1;"));

        let a = element(&mut fixture);
        let b = element(&mut fixture);
        fixture.manager.add_from_element(remote(a, "/a.js", false, true));
        fixture.manager.add_from_element(remote(b, "/b.js", false, true));
        fixture.manager.mark_static_done();

        pump(&mut fixture, 2);
        // b responded first but must wait behind a.
        assert!(fixture.engine.borrow().evaluated.is_empty());

        pump(&mut fixture, 4);
        assert_eq!(
            fixture.engine.borrow().evaluated_urls(),
            ["http://t/a.js", "http://t/b.js"]
        );
        assert!(fixture.manager.is_idle());
    }

    #[test]
    fn async_scripts_run_in_completion_order() {
        let mut fixture = fixture();
        fixture
            .transport
            .borrow_mut()
            .route("/slow.js", ScriptedResponse::script("1").after_ticks(4));
        fixture
            .transport
            .borrow_mut()
            .route("/fast.js", ScriptedResponse::script("1"));

        let slow = element(&mut fixture);
        let fast = element(&mut fixture);
        fixture.manager.add_from_element(remote(slow, "/slow.js", true, false));
        fixture.manager.add_from_element(remote(fast, "/fast.js", true, false));
        fixture.manager.mark_static_done();

        pump(&mut fixture, 8);
        assert_eq!(
            fixture.engine.borrow().evaluated_urls(),
            ["http://t/fast.js", "http://t/slow.js"]
        );
    }

    #[test]
    fn blocking_script_waits_and_evaluates_in_place() {
        let mut fixture = fixture();
        fixture
            .transport
            .borrow_mut()
            .route("/sync.js", ScriptedResponse::script("window.s = 1;").after_ticks(2));
        let node = element(&mut fixture);
        let outcome = fixture.manager.add_from_element(remote(node, "/sync.js", false, false));
        let AddOutcome::Blocking(script) = outcome else {
            panic!("parser-inserted plain remote script must block");
        };
        fixture.manager.wait_for_blocking(&script);
        assert!(script.borrow().complete);
        fixture.manager.evaluate_blocking(&script);
        assert_eq!(fixture.engine.borrow().evaluated_urls(), ["http://t/sync.js"]);
    }

    #[test]
    fn bad_status_errors_the_script() {
        let mut fixture = fixture();
        fixture
            .transport
            .borrow_mut()
            .route("/gone.js", ScriptedResponse::status(404));
        let node = element(&mut fixture);
        fixture.manager.add_from_element(remote(node, "/gone.js", false, true));
        fixture.manager.mark_static_done();
        pump(&mut fixture, 3);

        let outcomes = fixture.manager.take_outcomes();
        assert!(outcomes.iter().any(|o| matches!(
            o,
            ScriptOutcome::Errored { status: 404, .. }
        )));
        assert!(fixture.manager.is_idle());
        assert!(fixture.engine.borrow().evaluated.is_empty());
    }

    #[test]
    fn evaluation_error_reports_on_element() {
        let mut fixture = fixture();
        fixture.engine.borrow_mut().fail_matching("/boom.js");
        fixture
            .transport
            .borrow_mut()
            .route("/boom.js", ScriptedResponse::script("x"));
        let node = element(&mut fixture);
        fixture.manager.add_from_element(remote(node, "/boom.js", false, true));
        fixture.manager.mark_static_done();
        pump(&mut fixture, 3);

        let outcomes = fixture.manager.take_outcomes();
        assert!(outcomes
            .iter()
            .any(|o| matches!(o, ScriptOutcome::Errored { .. })));
    }

    #[test]
    fn import_map_wins_over_url_join() {
        let mut fixture = fixture();
        fixture
            .manager
            .install_import_map(r#"{"imports":{"lib":"/vendor/lib.js"}}"#)
            .expect("valid import map");
        let base = Url::parse("http://t/app/").expect("url");
        assert_eq!(
            fixture.manager.resolve_specifier(&base, "lib").expect("mapped").as_str(),
            "http://t/vendor/lib.js"
        );
        assert_eq!(
            fixture
                .manager
                .resolve_specifier(&base, "./util.js")
                .expect("joined")
                .as_str(),
            "http://t/app/util.js"
        );
    }

    #[test]
    fn static_imports_coalesce_and_wait() {
        let mut fixture = fixture();
        fixture
            .transport
            .borrow_mut()
            .route("/mod.js", ScriptedResponse::script("export {}").after_ticks(1));
        let url = Url::parse("http://t/mod.js").expect("url");
        fixture.manager.preload_import(&url);
        fixture.manager.preload_import(&url);
        assert_eq!(fixture.transport.borrow().issued.len(), 1, "deduped by URL");

        let buf = fixture.manager.wait_for_import(&url).expect("import body");
        assert_eq!(buf.as_text(), "export {}");
        // A second wait resolves instantly from the module map.
        let again = fixture.manager.wait_for_import(&url).expect("cached");
        assert_eq!(again.as_text(), "export {}");
    }

    #[test]
    fn dynamic_import_invokes_callback_from_evaluate() {
        let mut fixture = fixture();
        fixture
            .transport
            .borrow_mut()
            .route("/dyn.js", ScriptedResponse::script("sideEffect()"));
        let url = Url::parse("http://t/dyn.js").expect("url");
        let seen = Rc::new(RefCell::new(None));
        let seen_cb = Rc::clone(&seen);
        fixture.manager.get_async_import(
            &url,
            Box::new(move |result| {
                *seen_cb.borrow_mut() = Some(result.map(|m| m.source().into_owned()));
            }),
        );
        fixture.manager.mark_static_done();
        pump(&mut fixture, 3);
        assert_eq!(
            seen.borrow().as_ref().and_then(|r| r.as_ref().ok()).map(String::as_str),
            Some("sideEffect()")
        );
        assert!(fixture.manager.is_idle());
    }
}
