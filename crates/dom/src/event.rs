//! DOM event dispatch.
//!
//! Implements capture → target → bubble delivery over the ancestor
//! path. Listener callbacks are type-erased closures; in production
//! they trampoline into the JS engine, in tests they capture cells.
//! The listener list for each node is snapshotted before invocation so
//! callbacks may add or remove listeners mid-flight.

use std::collections::HashMap;
use std::rc::Rc;

use indextree::NodeId;

use crate::tree::DomTree;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EventPhase {
    None,
    Capturing,
    AtTarget,
    Bubbling,
}

/// Anything an event can be dispatched on.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum EventTarget {
    Window,
    Node(NodeId),
}

#[derive(Clone, Debug)]
pub struct Event {
    ty: String,
    bubbles: bool,
    cancelable: bool,
    trusted: bool,
    pub target: Option<EventTarget>,
    pub current_target: Option<EventTarget>,
    pub phase: EventPhase,
    default_prevented: bool,
    propagation_stopped: bool,
    immediate_stopped: bool,
}

impl Event {
    /// A script-constructed (untrusted) event.
    pub fn new(ty: &str, bubbles: bool, cancelable: bool) -> Self {
        Self {
            ty: ty.to_owned(),
            bubbles,
            cancelable,
            trusted: false,
            target: None,
            current_target: None,
            phase: EventPhase::None,
            default_prevented: false,
            propagation_stopped: false,
            immediate_stopped: false,
        }
    }

    /// An engine-created event; `isTrusted` observes this flag.
    pub fn trusted(ty: &str, bubbles: bool, cancelable: bool) -> Self {
        Self {
            trusted: true,
            ..Self::new(ty, bubbles, cancelable)
        }
    }

    #[inline]
    pub fn event_type(&self) -> &str {
        &self.ty
    }

    #[inline]
    pub fn bubbles(&self) -> bool {
        self.bubbles
    }

    #[inline]
    pub fn is_trusted(&self) -> bool {
        self.trusted
    }

    #[inline]
    pub fn default_prevented(&self) -> bool {
        self.default_prevented
    }

    pub fn prevent_default(&mut self) {
        if self.cancelable {
            self.default_prevented = true;
        }
    }

    /// Skip remaining nodes on the path; listeners already queued on
    /// the current node still run.
    pub fn stop_propagation(&mut self) {
        self.propagation_stopped = true;
    }

    /// Skip everything, including the rest of the current node.
    pub fn stop_immediate_propagation(&mut self) {
        self.propagation_stopped = true;
        self.immediate_stopped = true;
    }
}

pub type ListenerFn = dyn Fn(&mut Event);

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Listener {
    id: ListenerId,
    ty: String,
    capture: bool,
    once: bool,
    callback: Rc<ListenerFn>,
}

/// Options mirroring `addEventListener`'s.
#[derive(Copy, Clone, Debug, Default)]
pub struct ListenerOptions {
    pub capture: bool,
    pub once: bool,
}

#[derive(Default)]
pub struct EventManager {
    listeners: HashMap<EventTarget, Vec<Listener>>,
    next_id: u64,
}

impl EventManager {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_listener(
        &mut self,
        target: EventTarget,
        ty: &str,
        options: ListenerOptions,
        callback: Rc<ListenerFn>,
    ) -> ListenerId {
        self.next_id += 1;
        let id = ListenerId(self.next_id);
        self.listeners.entry(target).or_default().push(Listener {
            id,
            ty: ty.to_owned(),
            capture: options.capture,
            once: options.once,
            callback,
        });
        id
    }

    pub fn remove_listener(&mut self, target: EventTarget, id: ListenerId) {
        if let Some(list) = self.listeners.get_mut(&target) {
            list.retain(|l| l.id != id);
        }
    }

    /// Drop every listener for a node (its element was removed).
    pub fn clear_target(&mut self, target: EventTarget) {
        self.listeners.remove(&target);
    }

    /// Full dispatch. Returns true unless a listener called
    /// `preventDefault` on a cancelable event.
    pub fn dispatch(&mut self, tree: &DomTree, target: EventTarget, event: &mut Event) -> bool {
        self.dispatch_with_inline(tree, target, event, None, true)
    }

    /// Dispatch with a synthetic listener (a resolved inline handler)
    /// injected at the target position. With `inject_target == false`
    /// the synthetic listener runs on the Window instead — the window
    /// `load` case, where the event targets the Document but the
    /// handler lives on the Window.
    pub fn dispatch_with_inline(
        &mut self,
        tree: &DomTree,
        target: EventTarget,
        event: &mut Event,
        inline: Option<Rc<ListenerFn>>,
        inject_target: bool,
    ) -> bool {
        let path = self.event_path(tree, target);
        // The window-load case presets target to the document while
        // dispatching on the window; respect a preset target.
        if event.target.is_none() {
            event.target = Some(target);
        }

        // Capture phase, root → target.
        event.phase = EventPhase::Capturing;
        for &node in path.iter().rev() {
            if event.propagation_stopped {
                break;
            }
            self.invoke(node, event, Phase::Capture);
        }

        // Target phase.
        if !event.propagation_stopped {
            event.phase = EventPhase::AtTarget;
            if inject_target {
                if let Some(inline) = inline.as_ref() {
                    event.current_target = Some(target);
                    inline(event);
                }
            }
            if !event.immediate_stopped {
                self.invoke(target, event, Phase::Target);
            }
        }

        // Bubble phase, target → root.
        if event.bubbles {
            event.phase = EventPhase::Bubbling;
            for &node in &path {
                if event.propagation_stopped {
                    break;
                }
                self.invoke(node, event, Phase::Bubble);
            }
        }

        // Window-injected handler runs after listeners on the window.
        if !inject_target && !event.immediate_stopped {
            if let Some(inline) = inline {
                event.phase = EventPhase::Bubbling;
                event.current_target = Some(EventTarget::Window);
                inline(event);
            }
        }

        event.phase = EventPhase::None;
        event.current_target = None;
        !event.default_prevented()
    }

    /// The propagation path above `target`, nearest first. Reaching
    /// the document extends the path to the Window.
    fn event_path(&self, tree: &DomTree, target: EventTarget) -> Vec<EventTarget> {
        let mut path = Vec::new();
        match target {
            EventTarget::Window => {}
            EventTarget::Node(node) => {
                let mut reached_document = node == tree.root();
                for ancestor in tree.ancestors(node).skip(1) {
                    path.push(EventTarget::Node(ancestor));
                    if ancestor == tree.root() {
                        reached_document = true;
                    }
                }
                if reached_document {
                    path.push(EventTarget::Window);
                }
            }
        }
        path
    }

    fn invoke(&mut self, target: EventTarget, event: &mut Event, phase: Phase) {
        let snapshot: Vec<(ListenerId, bool, Rc<ListenerFn>)> = match self.listeners.get(&target) {
            Some(list) => list
                .iter()
                .filter(|l| l.ty == event.event_type() && phase.wants(l.capture))
                .map(|l| (l.id, l.once, Rc::clone(&l.callback)))
                .collect(),
            None => return,
        };
        for (id, once, callback) in snapshot {
            if event.immediate_stopped {
                break;
            }
            event.current_target = Some(target);
            callback(event);
            if once {
                self.remove_listener(target, id);
            }
        }
    }
}

#[derive(Copy, Clone)]
enum Phase {
    Capture,
    Target,
    Bubble,
}

impl Phase {
    #[inline]
    fn wants(self, capture_listener: bool) -> bool {
        match self {
            Self::Capture => capture_listener,
            Self::Target => true,
            Self::Bubble => !capture_listener,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{ElementData, Namespace};
    use std::cell::RefCell;

    fn setup() -> (DomTree, NodeId, NodeId) {
        let mut tree = DomTree::new();
        let body = tree.create_element(ElementData::new(Namespace::Html, "body"));
        let button = tree.create_element(ElementData::new(Namespace::Html, "button"));
        tree.append_child(tree.root(), body).unwrap();
        tree.append_child(body, button).unwrap();
        (tree, body, button)
    }

    fn log_listener(log: &Rc<RefCell<Vec<&'static str>>>, tag: &'static str) -> Rc<ListenerFn> {
        let log = Rc::clone(log);
        Rc::new(move |_ev: &mut Event| log.borrow_mut().push(tag))
    }

    #[test]
    fn capture_then_target_then_bubble() {
        let (tree, body, button) = setup();
        let mut events = EventManager::new();
        let log = Rc::new(RefCell::new(Vec::new()));

        events.add_listener(
            EventTarget::Node(body),
            "click",
            ListenerOptions {
                capture: true,
                once: false,
            },
            log_listener(&log, "body-capture"),
        );
        events.add_listener(
            EventTarget::Node(button),
            "click",
            ListenerOptions::default(),
            log_listener(&log, "button"),
        );
        events.add_listener(
            EventTarget::Node(body),
            "click",
            ListenerOptions::default(),
            log_listener(&log, "body-bubble"),
        );

        let mut event = Event::trusted("click", true, true);
        events.dispatch(&tree, EventTarget::Node(button), &mut event);
        assert_eq!(
            *log.borrow(),
            vec!["body-capture", "button", "body-bubble"]
        );
    }

    #[test]
    fn stop_propagation_skips_remaining_nodes() {
        let (tree, body, button) = setup();
        let mut events = EventManager::new();
        let log = Rc::new(RefCell::new(Vec::new()));

        let stopper = {
            let log = Rc::clone(&log);
            Rc::new(move |ev: &mut Event| {
                log.borrow_mut().push("button");
                ev.stop_propagation();
            })
        };
        events.add_listener(
            EventTarget::Node(button),
            "click",
            ListenerOptions::default(),
            stopper,
        );
        events.add_listener(
            EventTarget::Node(body),
            "click",
            ListenerOptions::default(),
            log_listener(&log, "body"),
        );

        let mut event = Event::trusted("click", true, true);
        events.dispatch(&tree, EventTarget::Node(button), &mut event);
        assert_eq!(*log.borrow(), vec!["button"]);
    }

    #[test]
    fn stop_immediate_skips_same_node_listeners() {
        let (tree, _, button) = setup();
        let mut events = EventManager::new();
        let log = Rc::new(RefCell::new(Vec::new()));

        let stopper = {
            let log = Rc::clone(&log);
            Rc::new(move |ev: &mut Event| {
                log.borrow_mut().push("first");
                ev.stop_immediate_propagation();
            })
        };
        events.add_listener(
            EventTarget::Node(button),
            "click",
            ListenerOptions::default(),
            stopper,
        );
        events.add_listener(
            EventTarget::Node(button),
            "click",
            ListenerOptions::default(),
            log_listener(&log, "second"),
        );

        let mut event = Event::trusted("click", true, true);
        events.dispatch(&tree, EventTarget::Node(button), &mut event);
        assert_eq!(*log.borrow(), vec!["first"]);
    }

    #[test]
    fn non_bubbling_event_stays_at_target() {
        let (tree, body, button) = setup();
        let mut events = EventManager::new();
        let log = Rc::new(RefCell::new(Vec::new()));

        events.add_listener(
            EventTarget::Node(body),
            "load",
            ListenerOptions::default(),
            log_listener(&log, "body"),
        );
        events.add_listener(
            EventTarget::Node(button),
            "load",
            ListenerOptions::default(),
            log_listener(&log, "button"),
        );

        let mut event = Event::trusted("load", false, false);
        events.dispatch(&tree, EventTarget::Node(button), &mut event);
        assert_eq!(*log.borrow(), vec!["button"]);
    }

    #[test]
    fn prevent_default_respects_cancelable() {
        let (tree, _, button) = setup();
        let mut events = EventManager::new();
        let preventer: Rc<ListenerFn> = Rc::new(|ev: &mut Event| ev.prevent_default());
        events.add_listener(
            EventTarget::Node(button),
            "click",
            ListenerOptions::default(),
            Rc::clone(&preventer),
        );

        let mut cancelable = Event::trusted("click", true, true);
        assert!(!events.dispatch(&tree, EventTarget::Node(button), &mut cancelable));

        let mut rigid = Event::trusted("click", true, false);
        assert!(events.dispatch(&tree, EventTarget::Node(button), &mut rigid));
    }

    #[test]
    fn document_events_reach_window() {
        let (tree, _, _) = setup();
        let mut events = EventManager::new();
        let log = Rc::new(RefCell::new(Vec::new()));
        events.add_listener(
            EventTarget::Window,
            "click",
            ListenerOptions::default(),
            log_listener(&log, "window"),
        );
        let mut event = Event::trusted("click", true, true);
        events.dispatch(&tree, EventTarget::Node(tree.root()), &mut event);
        assert_eq!(*log.borrow(), vec!["window"]);
    }

    #[test]
    fn once_listener_fires_once() {
        let (tree, _, button) = setup();
        let mut events = EventManager::new();
        let log = Rc::new(RefCell::new(Vec::new()));
        events.add_listener(
            EventTarget::Node(button),
            "click",
            ListenerOptions {
                capture: false,
                once: true,
            },
            log_listener(&log, "once"),
        );
        let mut first = Event::trusted("click", true, true);
        events.dispatch(&tree, EventTarget::Node(button), &mut first);
        let mut second = Event::trusted("click", true, true);
        events.dispatch(&tree, EventTarget::Node(button), &mut second);
        assert_eq!(*log.borrow(), vec!["once"]);
    }
}
