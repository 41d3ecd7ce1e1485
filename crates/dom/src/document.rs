//! Per-document state and lazily-attached per-element side data.
//!
//! Most elements never need a shadow root, slot assignment, scroll
//! position or materialized attribute nodes, so that state lives in
//! pointer-keyed maps here instead of inline on every element.

use std::collections::{HashMap, HashSet};

use indextree::NodeId;
use log::debug;
use url::Url;

use crate::atoms::{atom, resolve, Atom};
use crate::error::DomError;
use crate::node::NodeKind;
use crate::tree::DomTree;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum ReadyState {
    #[default]
    Loading,
    Interactive,
    Complete,
}

impl ReadyState {
    #[inline]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Loading => "loading",
            Self::Interactive => "interactive",
            Self::Complete => "complete",
        }
    }
}

/// Slots affected by an insertion/removal/attribute change, for
/// slotchange scheduling by the caller.
#[derive(Debug, Default)]
pub struct SlotImpact {
    pub slots: Vec<NodeId>,
}

impl SlotImpact {
    fn add(&mut self, slot: Option<NodeId>) {
        if let Some(slot) = slot {
            if !self.slots.contains(&slot) {
                self.slots.push(slot);
            }
        }
    }
}

#[derive(Default)]
pub struct Document {
    pub ready_state: ReadyState,
    pub location: Option<Url>,
    pub active_element: Option<NodeId>,
    /// The script element currently being evaluated, if any.
    pub current_script: Option<NodeId>,

    /// id → element, per scope root (document node or shadow root).
    id_scopes: HashMap<NodeId, HashMap<String, NodeId>>,
    /// ids seen on removed elements, for mutation-observer consumers.
    removed_ids: HashSet<String>,

    /// host element → shadow root (a detached fragment node).
    shadow_roots: HashMap<NodeId, NodeId>,
    /// shadow root → host element.
    shadow_hosts: HashMap<NodeId, NodeId>,
    /// slottable element → assigned slot element.
    slot_assignments: HashMap<NodeId, NodeId>,

    /// Inline `on<event>` handler sources per (element, event type).
    inline_handlers: HashMap<(NodeId, Atom), String>,
    /// Identity of materialized attribute nodes per (element, name).
    attr_nodes: HashMap<(NodeId, Atom), u64>,
    next_attr_node: u64,
    /// Scroll positions for the few elements that scroll.
    scroll_positions: HashMap<NodeId, (f64, f64)>,
}

impl Document {
    pub fn new(location: Option<Url>) -> Self {
        Self {
            location,
            ..Self::default()
        }
    }

    // ── Id maps ─────────────────────────────────────────────────────

    /// The root owning `node`'s id scope: the nearest enclosing shadow
    /// root, or the tree root.
    pub fn scope_root(&self, tree: &DomTree, node: NodeId) -> NodeId {
        for ancestor in tree.ancestors(node) {
            if self.shadow_hosts.contains_key(&ancestor) {
                return ancestor;
            }
        }
        tree.root()
    }

    /// Register an element under its id. On collision the element that
    /// is earlier in document order keeps the slot.
    pub fn register_id(&mut self, tree: &DomTree, element: NodeId, id: &str) {
        if id.is_empty() {
            return;
        }
        let scope = self.scope_root(tree, element);
        let map = self.id_scopes.entry(scope).or_default();
        match map.get(id) {
            Some(&existing) if existing != element => {
                if tree.precedes(element, existing) {
                    map.insert(id.to_owned(), element);
                }
            }
            Some(_) => {}
            None => {
                map.insert(id.to_owned(), element);
            }
        }
    }

    /// Drop an element's id registration; if another element in the
    /// scope carries the same id, the earliest of them takes over.
    pub fn unregister_id(&mut self, tree: &DomTree, element: NodeId, id: &str) {
        let scope = self.scope_root(tree, element);
        let Some(map) = self.id_scopes.get_mut(&scope) else {
            return;
        };
        if map.get(id) != Some(&element) {
            return;
        }
        map.remove(id);
        self.removed_ids.insert(id.to_owned());
        // Descendants iterate in document order, so the first match is
        // the new earliest holder.
        let id_atom = atom("id");
        let successor = tree.descendants(scope).find(|&n| {
            n != element
                && tree
                    .element(n)
                    .and_then(|e| e.attrs.get(id_atom))
                    .is_some_and(|v| v == id)
        });
        if let Some(successor) = successor {
            map.insert(id.to_owned(), successor);
        }
    }

    #[inline]
    pub fn element_by_id(&self, scope: NodeId, id: &str) -> Option<NodeId> {
        self.id_scopes.get(&scope)?.get(id).copied()
    }

    #[inline]
    pub fn was_id_removed(&self, id: &str) -> bool {
        self.removed_ids.contains(id)
    }

    #[inline]
    pub fn take_removed_ids(&mut self) -> HashSet<String> {
        std::mem::take(&mut self.removed_ids)
    }

    // ── Subtree bookkeeping ─────────────────────────────────────────

    /// Register ids and slot assignments for a newly-connected subtree.
    pub fn subtree_inserted(&mut self, tree: &DomTree, node: NodeId) -> SlotImpact {
        let id_atom = atom("id");
        let mut impact = SlotImpact::default();
        let nodes: Vec<NodeId> = tree.descendants(node).collect();
        for n in nodes {
            if let Some(element) = tree.element(n) {
                if let Some(id) = element.attrs.get(id_atom) {
                    let id = id.to_owned();
                    self.register_id(tree, n, &id);
                }
            }
            impact.add(self.assign_slot(tree, n));
        }
        impact
    }

    /// Unregister a subtree that is about to be (or was) disconnected.
    pub fn subtree_removed(&mut self, tree: &DomTree, node: NodeId) -> SlotImpact {
        let id_atom = atom("id");
        let mut impact = SlotImpact::default();
        let nodes: Vec<NodeId> = tree.descendants(node).collect();
        for n in nodes {
            if let Some(element) = tree.element(n) {
                if let Some(id) = element.attrs.get(id_atom) {
                    let id = id.to_owned();
                    self.unregister_id(tree, n, &id);
                }
            }
            impact.add(self.slot_assignments.remove(&n));
            self.drop_side_entries(n);
            if self.active_element == Some(n) {
                self.active_element = None;
            }
        }
        impact
    }

    fn drop_side_entries(&mut self, node: NodeId) {
        self.inline_handlers.retain(|(n, _), _| *n != node);
        self.attr_nodes.retain(|(n, _), _| *n != node);
        self.scroll_positions.remove(&node);
    }

    // ── Shadow DOM ──────────────────────────────────────────────────

    /// Attach a shadow root to `host`. The root is a detached fragment
    /// node owned by the same arena.
    ///
    /// # Errors
    /// `NotSupported` when the host already has a shadow root or is
    /// not an element.
    pub fn attach_shadow(&mut self, tree: &mut DomTree, host: NodeId) -> Result<NodeId, DomError> {
        if tree.element(host).is_none() {
            return Err(DomError::NotSupported("shadow host must be an element"));
        }
        if self.shadow_roots.contains_key(&host) {
            return Err(DomError::NotSupported("host already has a shadow root"));
        }
        let root = tree.create_node(NodeKind::DocumentFragment);
        self.shadow_roots.insert(host, root);
        self.shadow_hosts.insert(root, host);
        debug!("Document: attached shadow root to {host:?}");
        Ok(root)
    }

    #[inline]
    pub fn shadow_root(&self, host: NodeId) -> Option<NodeId> {
        self.shadow_roots.get(&host).copied()
    }

    #[inline]
    pub fn shadow_host(&self, root: NodeId) -> Option<NodeId> {
        self.shadow_hosts.get(&root).copied()
    }

    /// Recompute the slot assignment for one slottable. Returns the
    /// slot(s) whose assigned set changed.
    pub fn assign_slot(&mut self, tree: &DomTree, node: NodeId) -> Option<NodeId> {
        let parent = tree.parent(node)?;
        let shadow = self.shadow_root(parent)?;
        let slot_attr = atom("slot");
        let wanted = tree
            .element(node)
            .and_then(|e| e.attrs.get(slot_attr))
            .unwrap_or("");
        let slot = self.find_slot(tree, shadow, wanted);
        let old = match slot {
            Some(slot) => self.slot_assignments.insert(node, slot),
            None => self.slot_assignments.remove(&node),
        };
        if old == slot {
            None
        } else {
            slot.or(old)
        }
    }

    /// Find the first `<slot>` under a shadow root whose `name`
    /// matches (empty name is the default slot).
    pub fn find_slot(&self, tree: &DomTree, shadow_root: NodeId, name: &str) -> Option<NodeId> {
        let name_attr = atom("name");
        tree.descendants(shadow_root).find(|&n| {
            tree.element(n).is_some_and(|e| {
                resolve(e.tag) == "slot" && e.attrs.get(name_attr).unwrap_or("") == name
            })
        })
    }

    #[inline]
    pub fn assigned_slot(&self, node: NodeId) -> Option<NodeId> {
        self.slot_assignments.get(&node).copied()
    }

    /// Elements currently assigned to `slot`, in document order.
    pub fn assigned_nodes(&self, tree: &DomTree, slot: NodeId) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = self
            .slot_assignments
            .iter()
            .filter(|(_, s)| **s == slot)
            .map(|(n, _)| *n)
            .collect();
        nodes.sort_by(|a, b| {
            if tree.precedes(*a, *b) {
                std::cmp::Ordering::Less
            } else {
                std::cmp::Ordering::Greater
            }
        });
        nodes
    }

    // ── Misc side tables ────────────────────────────────────────────

    pub fn set_inline_handler(&mut self, node: NodeId, event: &str, source: String) {
        self.inline_handlers.insert((node, atom(event)), source);
    }

    #[inline]
    pub fn inline_handler(&self, node: NodeId, event: &str) -> Option<&str> {
        existing(event).and_then(|a| self.inline_handlers.get(&(node, a)).map(String::as_str))
    }

    pub fn remove_inline_handler(&mut self, node: NodeId, event: &str) {
        if let Some(a) = existing(event) {
            self.inline_handlers.remove(&(node, a));
        }
    }

    /// Stable identity for the attribute node of (element, name); the
    /// same slot always yields the same id.
    pub fn attr_node_id(&mut self, element: NodeId, name: Atom) -> u64 {
        if let Some(&id) = self.attr_nodes.get(&(element, name)) {
            return id;
        }
        self.next_attr_node += 1;
        let id = self.next_attr_node;
        self.attr_nodes.insert((element, name), id);
        id
    }

    #[inline]
    pub fn set_scroll_position(&mut self, element: NodeId, x: f64, y: f64) {
        self.scroll_positions.insert(element, (x, y));
    }

    #[inline]
    pub fn scroll_position(&self, element: NodeId) -> (f64, f64) {
        self.scroll_positions.get(&element).copied().unwrap_or((0.0, 0.0))
    }
}

#[inline]
fn existing(s: &str) -> Option<Atom> {
    crate::atoms::existing_atom(s)
}
