//! The page orchestrator.
//!
//! One `Page` drives one document: it issues the navigation request,
//! feeds the response into the parser, coordinates scripts and
//! observers, dispatches the load-state events and reports lifecycle
//! notifications. Child pages (iframes) share the transport and the
//! notification bus but own their load state; a frame's completion
//! decrements the parent's pending-loads counter, which is what keeps
//! a frame's `load` ahead of its parent's.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use dom::{
    atom, Document, DomError, DomTree, ElementData, ElementKind, Event, EventManager,
    EventTarget, ListenerFn, ListenerOptions, Namespace, NodeId, ReadyState,
};
use html::{ContentKind, ParseHooks, ParseMode};
use js::NavigationSource;
use log::{debug, error, info, warn};
use net::{FetchEvent, FetchEventKind, FetchRequest, RequestId, ResourceType};
use url::Url;

use crate::custom::{CustomElementDefinition, CustomElementRegistry};
use crate::idle::{IdleNotification, ALMOST_IDLE_MAX_INFLIGHT, IDLE_THRESHOLD};
use crate::notify::{EventPayload, Notifier, PageEvent, PageId};
use crate::observers::{
    deliver_mutations_with_limit, IntersectionCallback, IntersectionObservers,
    MutationCallback, MutationObserverOptions, MutationObservers, MutationRecord, ObserverId,
    PerformanceCallback, PerformanceTimeline, SlotchangeQueue,
};
use crate::scheduler::Scheduler;
use crate::script::{
    AddOutcome, ScriptElementInfo, ScriptManager, ScriptOutcome,
};
use crate::window::Window;
use crate::{EngineFactory, SharedEngine, SharedTransport};

/// Page-level load state; `Load` may be skipped by async-only pages.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LoadState {
    Waiting,
    Parsing,
    Load,
    Complete,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum ParseState {
    NotParsing,
    Document(ParseMode),
    Fragment,
}

#[derive(Clone)]
pub struct PageConfig {
    pub idle_threshold: Duration,
    pub tick_wait: Duration,
    pub load_timeout: Duration,
}

impl Default for PageConfig {
    fn default() -> Self {
        Self {
            idle_threshold: IDLE_THRESHOLD,
            tick_wait: Duration::from_millis(10),
            load_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug)]
struct QueuedNavigation {
    url: String,
    source: NavigationSource,
}

enum Microtask {
    DeliverMutations,
    CheckIntersections,
    DeliverIntersections,
    DeliverSlotchange,
}

#[derive(Copy, Clone, Debug)]
enum Task {
    Timer(u64),
    DeliverPerformance,
}

struct TimerEntry {
    source: String,
    interval: Option<Duration>,
}

pub struct Page {
    tree: DomTree,
    core: PageCore,
}

struct PageCore {
    id: PageId,
    parent: Option<PageId>,
    config: PageConfig,

    window: Window,
    doc: Document,
    events: EventManager,
    scheduler: Scheduler<Task>,
    scripts: ScriptManager,

    transport: SharedTransport,
    engine: SharedEngine,
    signals: Rc<RefCell<js::HostSignals>>,
    engine_factory: EngineFactory,
    notifier: Notifier,
    next_page_id: Rc<std::cell::Cell<PageId>>,

    url: Url,
    nav_request: Option<RequestId>,
    nav_req_id: RequestId,
    nav_content_type: Option<String>,
    nav_buffer: Vec<u8>,
    content_kind: Option<ContentKind>,
    nav_start: Instant,

    queued_navigation: Option<QueuedNavigation>,
    pending_loads: u32,
    load_state: LoadState,
    parse_state: ParseState,
    dcl_fired: bool,
    complete_fired: bool,
    scripts_counted: bool,
    completion_seen_by_parent: bool,

    idle: IdleNotification,
    almost_idle: IdleNotification,

    mutation: MutationObservers,
    intersection: IntersectionObservers,
    performance: PerformanceTimeline,
    slots: SlotchangeQueue,
    microtasks: VecDeque<Microtask>,

    custom: CustomElementRegistry,
    timers: HashMap<u64, TimerEntry>,
    next_timer: u64,
    queued_load_events: Vec<NodeId>,

    frames: Vec<Page>,
}

impl Page {
    pub fn new(
        id: PageId,
        parent: Option<PageId>,
        transport: SharedTransport,
        engine_factory: EngineFactory,
        notifier: Notifier,
        config: PageConfig,
        next_page_id: Rc<std::cell::Cell<PageId>>,
    ) -> Self {
        let (engine, signals) = engine_factory();
        let url = Url::parse("about:blank").unwrap_or_else(|_| {
            // about:blank always parses; keep the fallback total anyway.
            Url::parse("data:,").expect("data URL parses")
        });
        let scripts = ScriptManager::new(url.clone(), Rc::clone(&transport), Rc::clone(&engine));
        Self {
            tree: DomTree::new(),
            core: PageCore {
                id,
                parent,
                idle: IdleNotification::new(0, config.idle_threshold),
                almost_idle: IdleNotification::new(
                    ALMOST_IDLE_MAX_INFLIGHT,
                    config.idle_threshold,
                ),
                config,
                window: Window::new(),
                doc: Document::new(None),
                events: EventManager::new(),
                scheduler: Scheduler::new(),
                scripts,
                transport,
                engine,
                signals,
                engine_factory,
                notifier,
                next_page_id,
                url,
                nav_request: None,
                nav_req_id: 0,
                nav_content_type: None,
                nav_buffer: Vec::new(),
                content_kind: None,
                nav_start: Instant::now(),
                queued_navigation: None,
                pending_loads: 0,
                load_state: LoadState::Waiting,
                parse_state: ParseState::NotParsing,
                dcl_fired: false,
                complete_fired: false,
                scripts_counted: false,
                completion_seen_by_parent: false,
                mutation: MutationObservers::default(),
                intersection: IntersectionObservers::default(),
                performance: PerformanceTimeline::default(),
                slots: SlotchangeQueue::default(),
                microtasks: VecDeque::new(),
                custom: CustomElementRegistry::default(),
                timers: HashMap::new(),
                next_timer: 0,
                queued_load_events: Vec::new(),
                frames: Vec::new(),
            },
        }
    }

    // ── Accessors ───────────────────────────────────────────────────

    #[inline]
    pub fn id(&self) -> PageId {
        self.core.id
    }

    /// The parent page when this page is a frame.
    #[inline]
    pub fn parent_id(&self) -> Option<PageId> {
        self.core.parent
    }

    #[inline]
    pub fn window(&self) -> &crate::window::Window {
        &self.core.window
    }

    #[inline]
    pub fn tree(&self) -> &DomTree {
        &self.tree
    }

    #[inline]
    pub fn document(&self) -> &Document {
        &self.core.doc
    }

    /// The canonical URL (post-redirect), `document.URL`.
    #[inline]
    pub fn document_url(&self) -> &Url {
        &self.core.url
    }

    #[inline]
    pub fn load_state(&self) -> LoadState {
        self.core.load_state
    }

    #[inline]
    pub fn ready_state(&self) -> ReadyState {
        self.core.doc.ready_state
    }

    #[inline]
    pub fn pending_loads(&self) -> u32 {
        self.core.pending_loads
    }

    #[inline]
    pub fn is_complete(&self) -> bool {
        self.core.complete_fired
    }

    #[inline]
    pub fn frames(&self) -> &[Page] {
        &self.core.frames
    }

    #[inline]
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<PageEvent> {
        self.core.notifier.subscribe()
    }

    /// `document.currentScript`.
    #[inline]
    pub fn current_script(&self) -> Option<NodeId> {
        self.core.scripts.current_script
    }

    pub fn serialize(&self) -> String {
        dom::serialize_children(&self.tree, self.tree.root())
    }

    pub fn to_json(&self) -> serde_json::Value {
        dom::node_to_json(&self.tree, self.tree.root())
    }

    pub fn performance_entries(&self) -> Vec<String> {
        self.core
            .performance
            .entries()
            .iter()
            .map(|e| e.name.clone())
            .collect()
    }

    // ── Navigation & the loop ───────────────────────────────────────

    /// Start a navigation, cancelling any current one.
    ///
    /// # Errors
    /// Returns an error for unparseable URLs.
    pub fn navigate(&mut self, url: &str) -> Result<()> {
        let url = Url::parse(url).map_err(|err| anyhow!("bad navigation url {url:?}: {err}"))?;
        self.core.start_navigation(&mut self.tree, url);
        Ok(())
    }

    /// One cooperative iteration: pump the transport, route events,
    /// run due tasks, evaluate scripts, drain microtasks, sweep frames
    /// and apply any queued navigation. Returns false once the page is
    /// complete with nothing queued.
    pub fn pump(&mut self) -> bool {
        let now = Instant::now();
        let wait = self
            .core
            .scheduler
            .ms_until_next(now)
            .map(Duration::from_millis)
            .unwrap_or(self.core.config.tick_wait)
            .min(self.core.config.tick_wait);
        let events = self.core.transport.borrow_mut().tick(wait);
        for ev in events {
            self.core.route_fetch_event(&mut self.tree, &ev);
        }
        self.pump_local();
        !self.core.is_settled()
    }

    /// Everything `pump` does except the transport tick; used for
    /// child frames, which share the parent's transport.
    fn pump_local(&mut self) {
        let now = Instant::now();
        self.core.run_scheduled(&mut self.tree, now);
        let status = self.core.scripts.evaluate();
        self.core.after_evaluate(&mut self.tree, status);
        self.core.drain_microtasks(&mut self.tree);
        for child in &mut self.core.frames {
            child.pump_local();
        }
        self.core.sweep_frames(&mut self.tree);
        self.core.apply_queued_navigation(&mut self.tree);
        self.core.poll_idle(Instant::now());
    }

    /// Pump until the document completes (including queued
    /// navigations), or time out.
    ///
    /// # Errors
    /// Returns an error when the timeout elapses first.
    pub fn wait_until_complete(&mut self) -> Result<()> {
        let deadline = Instant::now() + self.core.config.load_timeout;
        loop {
            let busy = self.pump();
            if !busy {
                return Ok(());
            }
            if Instant::now() > deadline {
                return Err(anyhow!("page load timed out at {}", self.core.url));
            }
        }
    }

    /// Keep pumping for a fixed duration (idle detection, timers).
    pub fn pump_for(&mut self, duration: Duration) {
        let deadline = Instant::now() + duration;
        while Instant::now() < deadline {
            self.pump();
        }
    }

    /// Queue a navigation on behalf of a default action or script.
    /// Competing requests resolve by `form > script > anchor`; within
    /// a class the last writer wins.
    pub fn queue_navigation(&mut self, url: &str, source: NavigationSource) {
        self.core.queue_navigation(url, source);
    }

    fn route_event(&mut self, ev: &FetchEvent) -> bool {
        self.core.route_fetch_event(&mut self.tree, ev)
    }

    // ── DOM API (script-facing) ─────────────────────────────────────

    /// `createElementNS`: namespace dispatch, tag dispatch, custom
    /// element handling. The element starts detached.
    pub fn create_element_ns(
        &mut self,
        ns_uri: &str,
        name: &str,
        attrs: &[(String, String)],
    ) -> NodeId {
        self.core.build_element(&mut self.tree, ns_uri, name, attrs)
    }

    /// Append `child` to `parent`, with observer records and id/slot
    /// bookkeeping.
    ///
    /// # Errors
    /// Propagates hierarchy errors from the tree.
    pub fn append_node(&mut self, parent: NodeId, child: NodeId) -> Result<(), DomError> {
        self.tree.append_child(parent, child)?;
        let impact = self.core.doc.subtree_inserted(&self.tree, child);
        self.core.schedule_slotchanges(impact.slots);
        self.core.note_mutation(
            &self.tree,
            MutationRecord::child_list(parent, vec![child], Vec::new()),
        );
        Ok(())
    }

    /// Remove a node from its parent; side tables and listeners for
    /// the subtree are dropped.
    ///
    /// # Errors
    /// `NotFound` for stale ids.
    pub fn remove_node(&mut self, node: NodeId) -> Result<(), DomError> {
        let parent = self.tree.parent(node).ok_or(DomError::NotFound)?;
        let impact = self.core.doc.subtree_removed(&self.tree, node);
        let descendants: Vec<NodeId> = self.tree.descendants(node).collect();
        for n in &descendants {
            self.core.events.clear_target(EventTarget::Node(*n));
            self.core.custom.forget_node(*n);
        }
        self.tree.detach(node);
        self.core.schedule_slotchanges(impact.slots);
        self.core.note_mutation(
            &self.tree,
            MutationRecord::child_list(parent, Vec::new(), vec![node]),
        );
        Ok(())
    }

    /// Set an attribute. Setting the current value again is a no-op:
    /// no record, no change callbacks.
    ///
    /// # Errors
    /// `NotSupported` when the node is not an element.
    pub fn set_attribute(&mut self, node: NodeId, name: &str, value: &str) -> Result<(), DomError> {
        let name_lower = name.to_ascii_lowercase();
        let name_atom = atom(&name_lower);
        let current = self
            .tree
            .element(node)
            .ok_or(DomError::NotSupported("attributes require an element"))?
            .attrs
            .get(name_atom)
            .map(str::to_owned);
        if current.as_deref() == Some(value) {
            return Ok(());
        }
        let old = self.tree.set_attr(node, name_atom, value.to_owned())?;
        self.core
            .attribute_changed(&mut self.tree, node, &name_lower, old, Some(value.to_owned()));
        Ok(())
    }

    /// Remove an attribute if present.
    ///
    /// # Errors
    /// `NotSupported` when the node is not an element.
    pub fn remove_attribute(&mut self, node: NodeId, name: &str) -> Result<(), DomError> {
        let name_lower = name.to_ascii_lowercase();
        let name_atom = atom(&name_lower);
        let old = self.tree.remove_attr(node, name_atom)?;
        if old.is_some() {
            self.core
                .attribute_changed(&mut self.tree, node, &name_lower, old, None);
        }
        Ok(())
    }

    /// Replace a text node's data.
    ///
    /// # Errors
    /// `NotSupported` for nodes without character data.
    pub fn set_text(&mut self, node: NodeId, text: &str) -> Result<(), DomError> {
        let old = self.tree.set_character_data(node, text)?;
        self.core
            .note_mutation(&self.tree, MutationRecord::character_data(node, old));
        Ok(())
    }

    /// Parse markup as the node's children (`innerHTML` assignment
    /// semantics): records are emitted, scripts are not executed.
    pub fn parse_html_as_children(&mut self, node: NodeId, html_src: &str) -> Vec<NodeId> {
        let context = self
            .tree
            .element(node)
            .map_or_else(|| "body".to_owned(), |e| e.local_name().to_owned());
        let saved = self.core.parse_state;
        self.core.parse_state = ParseState::Fragment;
        let children =
            html::parse_fragment_into(&mut self.tree, &mut self.core, node, &context, html_src);
        self.core.parse_state = saved;
        for child in &children {
            let impact = self.core.doc.subtree_inserted(&self.tree, *child);
            self.core.schedule_slotchanges(impact.slots);
        }
        if !children.is_empty() {
            self.core.note_mutation(
                &self.tree,
                MutationRecord::child_list(node, children.clone(), Vec::new()),
            );
        }
        children
    }

    pub fn get_element_by_id(&self, id: &str) -> Option<NodeId> {
        self.core.doc.element_by_id(self.tree.root(), id)
    }

    /// Attach a shadow root to `host`.
    ///
    /// # Errors
    /// See [`Document::attach_shadow`].
    pub fn attach_shadow(&mut self, host: NodeId) -> Result<NodeId, DomError> {
        self.core.doc.attach_shadow(&mut self.tree, host)
    }

    // ── Events ──────────────────────────────────────────────────────

    pub fn add_event_listener(
        &mut self,
        target: EventTarget,
        ty: &str,
        options: ListenerOptions,
        callback: Rc<ListenerFn>,
    ) -> dom::ListenerId {
        self.core.events.add_listener(target, ty, options, callback)
    }

    pub fn remove_event_listener(&mut self, target: EventTarget, id: dom::ListenerId) {
        self.core.events.remove_listener(target, id);
    }

    /// Dispatch a (script-constructed) event; returns false when a
    /// listener prevented the default.
    pub fn dispatch_event(&mut self, target: EventTarget, event: &mut Event) -> bool {
        self.core.events.dispatch(&self.tree, target, event)
    }

    /// Simulate a user click: trusted event, then the anchor default
    /// action (queue an anchor-sourced navigation) unless prevented.
    pub fn click(&mut self, node: NodeId) {
        let proceed = self.core.dispatch_trusted(&mut self.tree, node, "click", true, true);
        if !proceed {
            return;
        }
        let href = self
            .tree
            .element(node)
            .filter(|e| e.kind == ElementKind::Anchor)
            .and_then(|e| e.attrs.get(atom("href")))
            .map(str::to_owned);
        if let Some(href) = href {
            self.core.queue_navigation(&href, NavigationSource::Anchor);
        }
    }

    /// Evaluate a script in the page context, then apply its effects
    /// (queued navigations, microtasks).
    ///
    /// # Errors
    /// Propagates evaluation errors.
    pub fn evaluate_script(&mut self, source: &str, url: &str) -> Result<()> {
        let result = self.core.engine.borrow_mut().eval_script(source, url);
        self.core.drain_signals();
        let _ = self.core.engine.borrow_mut().run_microtasks();
        self.core.drain_microtasks(&mut self.tree);
        result
    }

    // ── Timers ──────────────────────────────────────────────────────

    /// `setTimeout`-shaped: evaluate `source` after `delay`.
    pub fn set_timeout(&mut self, source: &str, delay: Duration) -> u64 {
        self.core.add_timer(source, delay, None)
    }

    /// `setInterval`-shaped: evaluate `source` every `period`.
    pub fn set_interval(&mut self, source: &str, period: Duration) -> u64 {
        self.core.add_timer(source, period, Some(period))
    }

    pub fn clear_timer(&mut self, id: u64) {
        self.core.timers.remove(&id);
    }

    // ── Observers ───────────────────────────────────────────────────

    pub fn observe_mutations(
        &mut self,
        target: NodeId,
        options: MutationObserverOptions,
        callback: MutationCallback,
    ) -> ObserverId {
        self.core.mutation.observe(target, options, callback)
    }

    pub fn disconnect_mutations(&mut self, id: ObserverId) {
        self.core.mutation.disconnect(id);
    }

    pub fn observe_intersections(&mut self, callback: IntersectionCallback) -> ObserverId {
        self.core.intersection.observe(callback)
    }

    pub fn observe_intersection_target(&mut self, id: ObserverId, target: NodeId) {
        self.core.intersection.add_target(id, target);
        self.core.schedule_intersection_check(&self.tree);
    }

    pub fn observe_performance(&mut self, callback: PerformanceCallback) -> ObserverId {
        self.core.performance.observe(callback)
    }

    // ── Custom elements ─────────────────────────────────────────────

    /// Register a custom element definition and upgrade any matching
    /// elements created before it arrived.
    pub fn define_custom_element(&mut self, definition: CustomElementDefinition) {
        let name = definition.name.clone();
        self.core.custom.define(definition);
        let pending = self.core.custom.take_pending(&name);
        for node in pending {
            self.core.upgrade_custom(&mut self.tree, node, &name);
        }
    }

    // ── Script-manager passthroughs (engine hooks) ──────────────────

    /// Module specifier resolution for the engine.
    ///
    /// # Errors
    /// When the specifier is neither mapped nor joinable.
    pub fn resolve_specifier(&self, base: &Url, specifier: &str) -> Result<Url> {
        self.core.scripts.resolve_specifier(base, specifier)
    }

    pub fn preload_import(&mut self, url: &Url) {
        self.core.scripts.preload_import(url);
    }

    /// # Errors
    /// When the import fetch failed.
    pub fn wait_for_import(&mut self, url: &Url) -> Result<Rc<net::PooledBuf>> {
        let result = self.core.scripts.wait_for_import(url);
        let orphans = self.core.scripts.take_orphan_events();
        for ev in orphans {
            self.core.route_fetch_event(&mut self.tree, &ev);
        }
        result
    }

    pub fn get_async_import(
        &mut self,
        url: &Url,
        callback: Box<dyn FnOnce(Result<js::ModuleSource>)>,
    ) {
        self.core.scripts.get_async_import(url, callback);
    }
}

impl PageCore {
    // ── Navigation ──────────────────────────────────────────────────

    fn start_navigation(&mut self, tree: &mut DomTree, url: Url) {
        info!("page {}: navigate to {url}", self.id);
        if let Some(req) = self.nav_request.take() {
            self.transport.borrow_mut().abort(req);
        }
        self.scripts.shutdown();

        // The page arena dies with the old document.
        *tree = DomTree::new();
        self.doc = Document::new(Some(url.clone()));
        self.events = EventManager::new();
        self.scheduler = Scheduler::new();
        self.mutation = MutationObservers::default();
        self.intersection = IntersectionObservers::default();
        self.performance = PerformanceTimeline::default();
        self.slots = SlotchangeQueue::default();
        self.microtasks.clear();
        self.timers.clear();
        self.frames.clear();
        self.queued_load_events.clear();
        self.queued_navigation = None;
        self.custom = CustomElementRegistry::default();

        self.dcl_fired = false;
        self.complete_fired = false;
        self.scripts_counted = false;
        self.completion_seen_by_parent = false;
        self.pending_loads = 1; // scripts
        self.load_state = LoadState::Parsing;
        self.parse_state = ParseState::NotParsing;
        self.idle = IdleNotification::new(0, self.config.idle_threshold);
        self.almost_idle =
            IdleNotification::new(ALMOST_IDLE_MAX_INFLIGHT, self.config.idle_threshold);
        self.nav_buffer.clear();
        self.nav_content_type = None;
        self.content_kind = None;
        self.nav_start = Instant::now();

        self.url = url.clone();
        self.window.location = Some(url.clone());

        // Fresh JS context per document.
        let (engine, signals) = (self.engine_factory)();
        self.engine = engine;
        self.signals = signals;
        self.scripts =
            ScriptManager::new(url.clone(), Rc::clone(&self.transport), Rc::clone(&self.engine));
        self.performance.mark("navigationStart", "navigation", 0);

        if url.scheme() == "about" {
            // No HTTP for about: documents.
            self.nav_req_id = self.transport.borrow_mut().next_request_id();
            self.emit(PageEvent::Navigate);
            self.parse_document(tree, "");
            self.finish_document_parse(tree);
            return;
        }

        let request = FetchRequest::get(url, ResourceType::Document);
        let req = self.transport.borrow_mut().request(request);
        self.nav_request = Some(req);
        self.nav_req_id = req;
        self.emit(PageEvent::Navigate);
    }

    fn route_fetch_event(&mut self, tree: &mut DomTree, ev: &FetchEvent) -> bool {
        if self.scripts.handle_fetch_event(ev) {
            return true;
        }
        if self.nav_request == Some(ev.request) {
            self.handle_nav_event(tree, ev);
            return true;
        }
        for child in &mut self.frames {
            if child.route_event(ev) {
                return true;
            }
        }
        false
    }

    fn handle_nav_event(&mut self, tree: &mut DomTree, ev: &FetchEvent) {
        match &ev.kind {
            FetchEventKind::Header {
                status,
                final_url,
                content_type,
            } => {
                debug!("page {}: headers {status} from {final_url}", self.id);
                if *final_url != self.url {
                    // Redirected: the final URL is the canonical one.
                    self.url = final_url.clone();
                    self.window.location = Some(final_url.clone());
                    self.doc.location = Some(final_url.clone());
                }
                self.nav_content_type = content_type.clone();
            }
            FetchEventKind::Data(bytes) => {
                if self.content_kind.is_none() {
                    self.content_kind =
                        Some(html::sniff(bytes, self.nav_content_type.as_deref()));
                }
                self.nav_buffer.extend_from_slice(bytes);
            }
            FetchEventKind::Done => {
                self.nav_request = None;
                let kind = self.content_kind.take().unwrap_or_else(|| {
                    html::sniff(&self.nav_buffer, self.nav_content_type.as_deref())
                });
                let buffer = std::mem::take(&mut self.nav_buffer);
                let source = html::wrap_for_parser(kind, &buffer, &self.url);
                self.parse_document(tree, &source);
                self.finish_document_parse(tree);
            }
            FetchEventKind::Failed(message) => {
                warn!("page {}: navigation failed: {message}", self.id);
                self.nav_request = None;
                let source = error_page(&self.url, message);
                self.parse_document(tree, &source);
                self.finish_document_parse(tree);
            }
        }
    }

    fn parse_document(&mut self, tree: &mut DomTree, source: &str) {
        self.parse_state = ParseState::Document(ParseMode::Document);
        html::parse_document_into(tree, self, source);
        self.parse_state = ParseState::NotParsing;
        // Ids for the whole document, now that the tree is final.
        let impact = self.doc.subtree_inserted(tree, tree.root());
        self.schedule_slotchanges(impact.slots);
    }

    fn finish_document_parse(&mut self, tree: &mut DomTree) {
        self.scripts.mark_static_done();
        let status = self.scripts.evaluate();
        self.after_evaluate(tree, status);
        self.emit(PageEvent::Navigated);
        self.schedule_intersection_check(tree);
    }

    // ── Load-state machine ──────────────────────────────────────────

    /// `DOMContentLoaded`; idempotent, at most once per page lifetime.
    fn document_is_loaded(&mut self, tree: &mut DomTree) {
        if self.dcl_fired {
            return;
        }
        self.dcl_fired = true;
        self.load_state = LoadState::Load;
        self.doc.ready_state = ReadyState::Interactive;
        self.mark_performance("domContentLoaded");
        info!("page {}: DOMContentLoaded", self.id);
        let root = tree.root();
        let mut event = Event::trusted("DOMContentLoaded", true, false);
        self.events.dispatch(tree, EventTarget::Node(root), &mut event);
    }

    /// Window `load` and `pageshow`; idempotent. Runs queued element
    /// `load`s first, then notifies the parent page if this is a frame.
    fn document_is_complete(&mut self, tree: &mut DomTree) {
        if self.complete_fired {
            return;
        }
        self.complete_fired = true;
        // DOMContentLoaded always precedes load, even on pages that
        // skipped the Load state.
        self.document_is_loaded(tree);

        for node in std::mem::take(&mut self.queued_load_events) {
            self.dispatch_trusted(tree, node, "load", false, false);
        }

        self.doc.ready_state = ReadyState::Complete;
        self.load_state = LoadState::Complete;
        self.mark_performance("load");
        info!("page {}: load complete ({})", self.id, self.url);

        // Window load: dispatched on the window (its listeners see the
        // target phase) while event.target reads the document. A body
        // onload attribute belongs to the window, so it is injected
        // there too.
        let body_onload = tree
            .descendants(tree.root())
            .find(|&n| {
                tree.element(n)
                    .is_some_and(|e| e.kind == ElementKind::Body)
            })
            .and_then(|body| self.inline_listener(tree, body, "load"));
        let root = tree.root();
        let mut load = Event::trusted("load", false, false);
        load.target = Some(EventTarget::Node(root));
        self.events
            .dispatch_with_inline(tree, EventTarget::Window, &mut load, body_onload, true);

        let mut pageshow = Event::trusted("pageshow", false, false);
        self.events
            .dispatch(tree, EventTarget::Window, &mut pageshow);
    }

    fn dec_pending_loads(&mut self, tree: &mut DomTree) {
        self.pending_loads = self.pending_loads.saturating_sub(1);
        debug!("page {}: pending loads -> {}", self.id, self.pending_loads);
        if self.pending_loads == 0 {
            self.document_is_complete(tree);
        }
    }

    fn scripts_done(&mut self, tree: &mut DomTree) {
        if self.scripts_counted {
            return;
        }
        self.scripts_counted = true;
        self.dec_pending_loads(tree);
    }

    fn after_evaluate(&mut self, tree: &mut DomTree, status: crate::script::EvaluateStatus) {
        self.drain_script_outcomes(tree);
        self.drain_signals();
        if self.scripts.static_done() && status.static_and_deferred_done {
            self.document_is_loaded(tree);
        }
        if status.all_done {
            self.scripts_done(tree);
        }
    }

    // ── Element creation (§ createElementNS) ────────────────────────

    fn build_element(
        &mut self,
        tree: &mut DomTree,
        ns_uri: &str,
        name: &str,
        attrs: &[(String, String)],
    ) -> NodeId {
        let ns = Namespace::from_uri(ns_uri);
        // Namespace is fixed before any attribute lands.
        let data = ElementData::new(ns, name);
        let tag = data.local_name().to_owned();
        let node = tree.create_element(data);
        for (attr_name, value) in attrs {
            self.apply_parse_attribute(tree, node, attr_name, value);
        }

        if ns == Namespace::Html {
            if tag.contains('-') {
                match self.custom.get(&tag).cloned() {
                    Some(definition) => self.construct_custom(tree, node, &definition),
                    None => self.custom.remember_undefined(&tag, node),
                }
            } else if let Some(is_name) = attrs
                .iter()
                .find(|(n, _)| n.eq_ignore_ascii_case("is"))
                .map(|(_, v)| v.clone())
            {
                // Customized built-in: the definition must extend this
                // exact tag.
                let definition = self
                    .custom
                    .get(&is_name)
                    .filter(|d| d.extends.as_deref() == Some(tag.as_str()))
                    .cloned();
                if let Some(definition) = definition {
                    self.construct_custom(tree, node, &definition);
                }
            }
        }
        node
    }

    fn apply_parse_attribute(&mut self, tree: &mut DomTree, node: NodeId, name: &str, value: &str) {
        let lower = name.to_ascii_lowercase();
        if let Some(element) = tree.element_mut(node) {
            element.attrs.set(atom(&lower), value.to_owned());
        }
        if let Some(event) = lower.strip_prefix("on") {
            self.doc.set_inline_handler(node, event, value.to_owned());
        }
    }

    fn construct_custom(
        &mut self,
        tree: &mut DomTree,
        node: NodeId,
        definition: &CustomElementDefinition,
    ) {
        let previous = self.custom.begin_upgrade(node);
        let construct = format!("customElements.__construct({});", quote(&definition.name));
        if let Err(err) = self
            .engine
            .borrow_mut()
            .eval_script(&construct, "noctua://custom-elements")
        {
            warn!("custom element {} constructor threw: {err}", definition.name);
        }
        self.custom.end_upgrade(previous);
        if let Some(element) = tree.element_mut(node) {
            element.kind = ElementKind::Custom;
        }
        // Replay attributeChangedCallback for attributes that already
        // exist.
        let existing: Vec<(String, String)> = tree
            .element(node)
            .map(|e| {
                e.attrs
                    .pairs()
                    .filter(|(n, _)| definition.observed_attributes.iter().any(|o| o == n))
                    .map(|(n, v)| (n.to_owned(), v.to_owned()))
                    .collect()
            })
            .unwrap_or_default();
        for (attr_name, value) in existing {
            self.invoke_attribute_changed(&definition.name, &attr_name, None, Some(&value));
        }
    }

    fn upgrade_custom(&mut self, tree: &mut DomTree, node: NodeId, name: &str) {
        if let Some(definition) = self.custom.get(name).cloned() {
            self.construct_custom(tree, node, &definition);
        }
    }

    fn invoke_attribute_changed(
        &mut self,
        name: &str,
        attribute: &str,
        old: Option<&str>,
        new: Option<&str>,
    ) {
        let script = format!(
            "customElements.__attributeChanged({}, {}, {}, {});",
            quote(name),
            quote(attribute),
            quote_opt(old),
            quote_opt(new),
        );
        if let Err(err) = self
            .engine
            .borrow_mut()
            .eval_script(&script, "noctua://custom-elements")
        {
            warn!("attributeChangedCallback for {name} threw: {err}");
        }
    }

    // ── Attribute change dispatch ───────────────────────────────────

    fn attribute_changed(
        &mut self,
        tree: &mut DomTree,
        node: NodeId,
        name: &str,
        old: Option<String>,
        new: Option<String>,
    ) {
        match name {
            "id" => {
                if let Some(old_id) = old.as_deref() {
                    self.doc.unregister_id(tree, node, old_id);
                }
                if let Some(new_id) = new.as_deref() {
                    self.doc.register_id(tree, node, new_id);
                }
            }
            "slot" => {
                let old_slot = self.doc.assigned_slot(node);
                let changed = self.doc.assign_slot(tree, node);
                let mut affected: Vec<NodeId> = old_slot.into_iter().collect();
                affected.extend(changed);
                self.schedule_slotchanges(affected);
            }
            "name" => {
                // A slot rename reassigns its host's children.
                if tree
                    .element(node)
                    .is_some_and(|e| e.kind == ElementKind::Slot)
                {
                    self.reassign_host_slots(tree, node);
                }
            }
            _ => {}
        }
        if let Some(event) = name.strip_prefix("on") {
            match new.as_deref() {
                Some(source) => self.doc.set_inline_handler(node, event, source.to_owned()),
                None => self.doc.remove_inline_handler(node, event),
            }
        }
        // Custom elements observe their declared attributes.
        let custom_name = tree
            .element(node)
            .filter(|e| e.kind == ElementKind::Custom)
            .map(|e| e.local_name().to_owned());
        if let Some(custom_name) = custom_name {
            if self.custom.observes(&custom_name, name) {
                self.invoke_attribute_changed(&custom_name, name, old.as_deref(), new.as_deref());
            }
        }
        self.note_mutation(tree, MutationRecord::attribute(node, name, old));
    }

    fn reassign_host_slots(&mut self, tree: &DomTree, slot: NodeId) {
        let shadow_root = tree
            .ancestors(slot)
            .find(|&a| self.doc.shadow_host(a).is_some());
        let Some(shadow_root) = shadow_root else {
            return;
        };
        let Some(host) = self.doc.shadow_host(shadow_root) else {
            return;
        };
        let mut affected = vec![slot];
        let children: Vec<NodeId> = tree.children(host).collect();
        for child in children {
            let old = self.doc.assigned_slot(child);
            affected.extend(old);
            affected.extend(self.doc.assign_slot(tree, child));
        }
        self.schedule_slotchanges(affected);
    }

    // ── Parser callbacks ────────────────────────────────────────────

    fn element_built(&mut self, tree: &mut DomTree, node: NodeId) {
        let kind = match tree.element(node) {
            Some(element) => element.kind,
            None => return,
        };
        // Register this element's id and slot as soon as its subtree
        // is complete; descendants registered themselves already.
        let id_value = tree
            .element(node)
            .and_then(|e| e.attrs.get(atom("id")))
            .map(str::to_owned);
        if let Some(id) = id_value {
            self.doc.register_id(tree, node, &id);
        }
        let slot = self.doc.assign_slot(tree, node);
        self.schedule_slotchanges(slot.into_iter().collect());

        match kind {
            ElementKind::Script => {
                if matches!(self.parse_state, ParseState::Document(_)) {
                    self.handle_script_element(tree, node, true);
                }
                // Fragment parsing never executes scripts.
            }
            ElementKind::Iframe => {
                if matches!(self.parse_state, ParseState::Document(_)) {
                    self.handle_iframe(tree, node);
                }
            }
            ElementKind::Image => {
                // No renderer: images "load" as soon as the document
                // settles, before the window load event.
                self.queued_load_events.push(node);
            }
            _ => {}
        }
    }

    fn handle_script_element(&mut self, tree: &mut DomTree, node: NodeId, parser_inserted: bool) {
        let Some(element) = tree.element(node) else {
            return;
        };
        let attrs = &element.attrs;
        let info = ScriptElementInfo {
            node,
            src: attrs.get(atom("src")).map(str::to_owned),
            async_attr: attrs.contains(atom("async")),
            defer_attr: attrs.contains(atom("defer")),
            type_attr: attrs.get(atom("type")).map(str::to_owned),
            nomodule: attrs.contains(atom("nomodule")),
            inline_source: tree.text_content(node),
            parser_inserted,
        };
        match self.scripts.add_from_element(info) {
            AddOutcome::Blocking(script) => {
                // The one deliberate busy-wait: parser-blocking
                // <script src> pumps the transport until fetched, then
                // evaluates in place.
                self.scripts.wait_for_blocking(&script);
                let orphans = self.scripts.take_orphan_events();
                for ev in orphans {
                    self.route_fetch_event(tree, &ev);
                }
                self.scripts.evaluate_blocking(&script);
                self.drain_script_outcomes(tree);
                self.drain_signals();
            }
            AddOutcome::EvaluatedInline => {
                self.drain_script_outcomes(tree);
                self.drain_signals();
            }
            AddOutcome::Queued(_) | AddOutcome::Skipped => {}
        }
    }

    fn handle_iframe(&mut self, tree: &mut DomTree, node: NodeId) {
        let src = tree
            .element(node)
            .and_then(|e| e.attrs.get(atom("src")))
            .map(str::to_owned);
        let target = match src.as_deref() {
            None | Some("") => Url::parse("about:blank").ok(),
            Some(src) => self.url.join(src).ok().or_else(|| Url::parse(src).ok()),
        };
        let Some(target) = target else {
            warn!("page {}: iframe with unresolvable src {src:?}", self.id);
            return;
        };

        self.pending_loads += 1;
        let frame_id = self.next_page_id.get();
        self.next_page_id.set(frame_id + 1);
        let mut child = Page::new(
            frame_id,
            Some(self.id),
            Rc::clone(&self.transport),
            Rc::clone(&self.engine_factory),
            self.notifier.clone(),
            self.config.clone(),
            Rc::clone(&self.next_page_id),
        );
        self.notifier.emit(PageEvent::FrameCreated {
            payload: EventPayload::new(self.id, self.nav_req_id, self.url.as_str()),
            frame_id,
        });
        if let Err(err) = child.navigate(target.as_str()) {
            warn!("page {}: iframe navigation failed: {err}", self.id);
        }
        self.frames.push(child);
    }

    /// Count completions of child frames against the pending-loads
    /// counter, once each.
    fn sweep_frames(&mut self, tree: &mut DomTree) {
        let mut newly_complete = 0;
        for child in &mut self.frames {
            if child.core.complete_fired && !child.core.completion_seen_by_parent {
                child.core.completion_seen_by_parent = true;
                newly_complete += 1;
            }
        }
        for _ in 0..newly_complete {
            self.dec_pending_loads(tree);
        }
    }

    // ── Scripts → page effects ──────────────────────────────────────

    fn drain_script_outcomes(&mut self, tree: &mut DomTree) {
        for outcome in self.scripts.take_outcomes() {
            match outcome {
                ScriptOutcome::Evaluated { element, url } => {
                    debug!("page {}: evaluated {url}", self.id);
                    if let Some(node) = element {
                        // External scripts fire load after evaluation.
                        let is_remote = tree
                            .element(node)
                            .is_some_and(|e| e.attrs.contains(atom("src")));
                        if is_remote {
                            self.dispatch_trusted(tree, node, "load", false, false);
                        }
                    }
                }
                ScriptOutcome::Errored { element, url, status } => {
                    warn!(
                        "page {}: script {url} errored (status {status})",
                        self.id
                    );
                    if let Some(node) = element {
                        self.dispatch_trusted(tree, node, "error", false, false);
                    }
                }
            }
        }
    }

    fn drain_signals(&mut self) {
        let navigations: Vec<js::NavigationRequest> =
            self.signals.borrow_mut().navigations.drain(..).collect();
        for nav in navigations {
            self.queue_navigation(&nav.url, nav.source);
        }
    }

    /// Record a navigation request. It never preempts running script;
    /// [`PageCore::apply_queued_navigation`] acts on it from the loop.
    fn queue_navigation(&mut self, url: &str, source: NavigationSource) {
        match &self.queued_navigation {
            Some(current) if source < current.source => {
                debug!(
                    "page {}: dropping {source:?} navigation, {:?} already queued",
                    self.id, current.source
                );
            }
            _ => {
                self.queued_navigation = Some(QueuedNavigation {
                    url: url.to_owned(),
                    source,
                });
            }
        }
    }

    fn apply_queued_navigation(&mut self, tree: &mut DomTree) {
        if self.parse_state != ParseState::NotParsing {
            return;
        }
        let Some(queued) = self.queued_navigation.take() else {
            return;
        };
        let resolved = Url::parse(&queued.url)
            .ok()
            .or_else(|| self.url.join(&queued.url).ok());
        match resolved {
            Some(url) => self.start_navigation(tree, url),
            None => warn!(
                "page {}: dropping unresolvable queued navigation {:?}",
                self.id, queued.url
            ),
        }
    }

    // ── Scheduler & microtasks ──────────────────────────────────────

    fn add_timer(&mut self, source: &str, delay: Duration, interval: Option<Duration>) -> u64 {
        self.next_timer += 1;
        let id = self.next_timer;
        self.timers.insert(
            id,
            TimerEntry {
                source: source.to_owned(),
                interval,
            },
        );
        self.scheduler.add(Task::Timer(id), delay, "timer", false);
        id
    }

    fn run_scheduled(&mut self, tree: &mut DomTree, now: Instant) {
        for task in self.scheduler.take_due(now) {
            match task.payload {
                Task::Timer(id) => {
                    let Some(entry) = self.timers.get(&id) else {
                        continue; // cleared
                    };
                    let source = entry.source.clone();
                    let interval = entry.interval;
                    if let Err(err) = self
                        .engine
                        .borrow_mut()
                        .eval_script(&source, "noctua://timer")
                    {
                        warn!("page {}: timer threw: {err}", self.id);
                        // A failing task removes itself.
                        self.timers.remove(&id);
                        continue;
                    }
                    self.drain_signals();
                    if let Some(period) = interval {
                        self.scheduler.add(Task::Timer(id), period, "timer", false);
                    } else {
                        self.timers.remove(&id);
                    }
                }
                Task::DeliverPerformance => {
                    for (callback, batch) in self.performance.take_batches() {
                        callback(&batch);
                    }
                }
            }
        }
        let status = self.scripts.evaluate();
        self.after_evaluate(tree, status);
    }

    fn drain_microtasks(&mut self, tree: &mut DomTree) {
        while let Some(task) = self.microtasks.pop_front() {
            match task {
                Microtask::DeliverMutations => {
                    let abandoned =
                        deliver_mutations_with_limit(&mut self.mutation, |_, callback, batch| {
                            callback(batch);
                        });
                    if abandoned {
                        error!(
                            "page {}: mutation delivery exceeded depth limit, abandoned",
                            self.id
                        );
                    }
                }
                Microtask::CheckIntersections => {
                    if self.intersection.check(tree, tree.version()) {
                        self.microtasks.push_back(Microtask::DeliverIntersections);
                    }
                }
                Microtask::DeliverIntersections => {
                    for (callback, batch) in self.intersection.take_batches() {
                        callback(&batch);
                    }
                }
                Microtask::DeliverSlotchange => {
                    let slots = self.slots.take();
                    for slot in slots {
                        self.dispatch_trusted(tree, slot, "slotchange", true, false);
                    }
                }
            }
        }
        if let Err(err) = self.engine.borrow_mut().run_microtasks() {
            warn!("page {}: microtask checkpoint threw: {err}", self.id);
        }
    }

    // ── Observer plumbing ───────────────────────────────────────────

    fn records_suppressed(&self) -> bool {
        matches!(self.parse_state, ParseState::Document(_))
    }

    fn note_mutation(&mut self, tree: &DomTree, record: MutationRecord) {
        if !self.records_suppressed() && self.mutation.record(tree, &record) {
            self.microtasks.push_back(Microtask::DeliverMutations);
        }
        self.schedule_intersection_check(tree);
    }

    fn schedule_intersection_check(&mut self, tree: &DomTree) {
        if self.intersection.needs_check(tree.version()) {
            self.microtasks.push_back(Microtask::CheckIntersections);
        }
    }

    fn schedule_slotchanges(&mut self, slots: Vec<NodeId>) {
        for slot in slots {
            if self.slots.enqueue(slot) {
                self.microtasks.push_back(Microtask::DeliverSlotchange);
            }
        }
    }

    fn mark_performance(&mut self, name: &str) {
        let elapsed = self.nav_start.elapsed().as_millis() as u64;
        if self.performance.mark(name, "navigation", elapsed) {
            self.scheduler.add(
                Task::DeliverPerformance,
                Duration::ZERO,
                "performance-delivery",
                true,
            );
        }
    }

    // ── Event helpers ───────────────────────────────────────────────

    /// Dispatch a trusted event on an element, with its inline
    /// `on<type>` handler injected at the target. Returns false when
    /// the default was prevented.
    fn dispatch_trusted(
        &mut self,
        tree: &mut DomTree,
        node: NodeId,
        ty: &str,
        bubbles: bool,
        cancelable: bool,
    ) -> bool {
        let inline = self.inline_listener(tree, node, ty);
        let mut event = Event::trusted(ty, bubbles, cancelable);
        self.events
            .dispatch_with_inline(tree, EventTarget::Node(node), &mut event, inline, true)
    }

    /// Resolve an `on<event>` attribute (or side-table entry) into a
    /// synthetic listener that evaluates it through the engine.
    fn inline_listener(
        &self,
        tree: &DomTree,
        node: NodeId,
        ty: &str,
    ) -> Option<Rc<ListenerFn>> {
        let source = tree
            .element(node)
            .and_then(|e| e.attrs.get(atom(&format!("on{ty}"))))
            .map(str::to_owned)
            .or_else(|| self.doc.inline_handler(node, ty).map(str::to_owned))?;
        let engine = Rc::clone(&self.engine);
        let url = format!("{}#on{ty}", self.url);
        Some(Rc::new(move |_event: &mut Event| {
            if let Err(err) = engine.borrow_mut().eval_script(&source, &url) {
                warn!("inline {url} handler threw: {err}");
            }
        }))
    }

    // ── Idle & notifications ────────────────────────────────────────

    fn poll_idle(&mut self, now: Instant) {
        let in_flight = self.transport.borrow().in_flight();
        if self.idle.poll(in_flight, now) {
            self.emit(PageEvent::NetworkIdle);
        }
        if self.almost_idle.poll(in_flight, now) {
            self.emit(PageEvent::NetworkAlmostIdle);
        }
    }

    fn emit(&self, build: impl FnOnce(EventPayload) -> PageEvent) {
        let payload = EventPayload::new(self.id, self.nav_req_id, self.url.as_str());
        self.notifier.emit(build(payload));
    }

    fn is_settled(&self) -> bool {
        self.complete_fired
            && self.queued_navigation.is_none()
            && self.frames.iter().all(|f| f.core.is_settled())
    }
}

impl ParseHooks for PageCore {
    fn create_element(
        &mut self,
        tree: &mut DomTree,
        ns_uri: &str,
        name: &str,
        attrs: &[(String, String)],
    ) -> NodeId {
        self.build_element(tree, ns_uri, name, attrs)
    }

    fn node_complete(&mut self, tree: &mut DomTree, node: NodeId) {
        self.element_built(tree, node);
    }
}

fn error_page(url: &Url, message: &str) -> String {
    let mut escaped = String::new();
    for c in message.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            _ => escaped.push(c),
        }
    }
    format!(
        "<html><head><title>Error</title></head><body><h1>Unable to load {url}</h1><p>{escaped}</p></body></html>"
    )
}

fn quote(value: &str) -> String {
    serde_json::Value::String(value.to_owned()).to_string()
}

fn quote_opt(value: Option<&str>) -> String {
    value.map_or_else(|| "null".to_owned(), quote)
}
