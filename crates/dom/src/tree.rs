//! The per-page node tree.
//!
//! Nodes live in an [`indextree::Arena`] owned by the tree; the arena
//! is the page arena of the runtime and is dropped as a unit when the
//! page navigates. Parent/child/sibling links are maintained only
//! through the methods here, which keeps `parent.children` and
//! `child.parent` in agreement at all times. Detached nodes stay in
//! the arena until the tree is dropped.

use indextree::{Arena, NodeId};

use crate::atoms::Atom;
use crate::error::DomError;
use crate::node::{DomNode, ElementData, NodeKind};

pub struct DomTree {
    arena: Arena<DomNode>,
    root: NodeId,
    version: u64,
}

impl DomTree {
    /// A fresh tree holding only the document node.
    pub fn new() -> Self {
        let mut arena = Arena::new();
        let root = arena.new_node(DomNode::new(NodeKind::Document));
        Self {
            arena,
            root,
            version: 0,
        }
    }

    #[inline]
    pub fn root(&self) -> NodeId {
        self.root
    }

    /// Monotonic counter bumped on every structural or data mutation.
    #[inline]
    pub fn version(&self) -> u64 {
        self.version
    }

    #[inline]
    pub fn node_count(&self) -> usize {
        self.arena.count()
    }

    // ── Creation ────────────────────────────────────────────────────

    pub fn create_node(&mut self, kind: NodeKind) -> NodeId {
        self.arena.new_node(DomNode::new(kind))
    }

    #[inline]
    pub fn create_element(&mut self, data: ElementData) -> NodeId {
        self.create_node(NodeKind::Element(data))
    }

    #[inline]
    pub fn create_text(&mut self, data: &str) -> NodeId {
        self.create_node(NodeKind::Text {
            data: data.to_owned(),
        })
    }

    // ── Access ──────────────────────────────────────────────────────

    #[inline]
    pub fn kind(&self, id: NodeId) -> Option<&NodeKind> {
        self.arena.get(id).map(|n| &n.get().kind)
    }

    #[inline]
    pub fn kind_mut(&mut self, id: NodeId) -> Option<&mut NodeKind> {
        self.arena.get_mut(id).map(|n| &mut n.get_mut().kind)
    }

    #[inline]
    pub fn element(&self, id: NodeId) -> Option<&ElementData> {
        self.kind(id).and_then(NodeKind::as_element)
    }

    #[inline]
    pub fn element_mut(&mut self, id: NodeId) -> Option<&mut ElementData> {
        match self.kind_mut(id) {
            Some(NodeKind::Element(data)) => Some(data),
            _ => None,
        }
    }

    #[inline]
    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.arena.get(id).and_then(indextree::Node::parent)
    }

    #[inline]
    pub fn first_child(&self, id: NodeId) -> Option<NodeId> {
        self.arena.get(id).and_then(indextree::Node::first_child)
    }

    #[inline]
    pub fn last_child(&self, id: NodeId) -> Option<NodeId> {
        self.arena.get(id).and_then(indextree::Node::last_child)
    }

    #[inline]
    pub fn next_sibling(&self, id: NodeId) -> Option<NodeId> {
        self.arena.get(id).and_then(indextree::Node::next_sibling)
    }

    #[inline]
    pub fn prev_sibling(&self, id: NodeId) -> Option<NodeId> {
        self.arena
            .get(id)
            .and_then(indextree::Node::previous_sibling)
    }

    #[inline]
    pub fn children(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        id.children(&self.arena)
    }

    #[inline]
    pub fn child_count(&self, id: NodeId) -> usize {
        id.children(&self.arena).count()
    }

    /// Ancestor chain starting at `id` itself, ending at its root.
    #[inline]
    pub fn ancestors(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        id.ancestors(&self.arena)
    }

    /// `id` and every node below it, in document order.
    #[inline]
    pub fn descendants(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        id.descendants(&self.arena)
    }

    /// Whether the node is reachable from the document node.
    #[inline]
    pub fn is_connected(&self, id: NodeId) -> bool {
        self.ancestors(id).any(|a| a == self.root)
    }

    /// Concatenated data of all text descendants.
    pub fn text_content(&self, id: NodeId) -> String {
        let mut out = String::new();
        for node in self.descendants(id) {
            if let Some(NodeKind::Text { data }) = self.kind(node) {
                out.push_str(data);
            }
        }
        out
    }

    // ── Mutation ────────────────────────────────────────────────────

    /// Append `child` as the last child of `parent`, detaching it from
    /// any previous parent first.
    ///
    /// # Errors
    /// `HierarchyRequest` when the move would create a cycle or target
    /// a non-container node; `NotFound` for stale ids.
    pub fn append_child(&mut self, parent: NodeId, child: NodeId) -> Result<(), DomError> {
        self.check_insertable(parent, child)?;
        child.detach(&mut self.arena);
        parent
            .checked_append(child, &mut self.arena)
            .map_err(|_| DomError::HierarchyRequest("append would create a cycle"))?;
        self.version += 1;
        Ok(())
    }

    /// Insert `child` immediately before `sibling`.
    ///
    /// # Errors
    /// `HierarchyRequest` when `sibling` is detached or the move would
    /// create a cycle; `NotFound` for stale ids.
    pub fn insert_before(&mut self, sibling: NodeId, child: NodeId) -> Result<(), DomError> {
        let parent = self
            .parent(sibling)
            .ok_or(DomError::HierarchyRequest("anchor has no parent"))?;
        self.check_insertable(parent, child)?;
        child.detach(&mut self.arena);
        sibling
            .checked_insert_before(child, &mut self.arena)
            .map_err(|_| DomError::HierarchyRequest("insert would create a cycle"))?;
        self.version += 1;
        Ok(())
    }

    /// Detach a node from its parent. The node and its subtree remain
    /// alive (arena-owned) but disconnected.
    pub fn detach(&mut self, id: NodeId) {
        id.detach(&mut self.arena);
        self.version += 1;
    }

    /// Move every child of `from` to the end of `to`'s child list.
    pub fn reparent_children(&mut self, from: NodeId, to: NodeId) -> Result<(), DomError> {
        let children: Vec<NodeId> = self.children(from).collect();
        for child in children {
            self.append_child(to, child)?;
        }
        Ok(())
    }

    /// Append text under `parent`, concatenating into the last child
    /// when it is already a text node. Returns the text node used.
    pub fn append_text(&mut self, parent: NodeId, text: &str) -> Result<NodeId, DomError> {
        if let Some(last) = self.last_child(parent) {
            if let Some(NodeKind::Text { data }) = self.kind_mut(last) {
                data.push_str(text);
                self.version += 1;
                return Ok(last);
            }
        }
        let node = self.create_text(text);
        self.append_child(parent, node)?;
        Ok(node)
    }

    /// Replace the data of a text-bearing node.
    pub fn set_character_data(&mut self, id: NodeId, text: &str) -> Result<String, DomError> {
        match self.kind_mut(id) {
            Some(
                NodeKind::Text { data }
                | NodeKind::Comment { data }
                | NodeKind::CdataSection { data }
                | NodeKind::ProcessingInstruction { data, .. },
            ) => {
                let old = std::mem::replace(data, text.to_owned());
                self.version += 1;
                Ok(old)
            }
            Some(_) => Err(DomError::NotSupported("node carries no character data")),
            None => Err(DomError::NotFound),
        }
    }

    /// Set an attribute through the tree so the version advances.
    /// Returns the previous value.
    ///
    /// # Errors
    /// `NotSupported` when the node is not an element.
    pub fn set_attr(
        &mut self,
        id: NodeId,
        name: Atom,
        value: String,
    ) -> Result<Option<String>, DomError> {
        let element = self
            .element_mut(id)
            .ok_or(DomError::NotSupported("attributes require an element"))?;
        let old = element.attrs.set(name, value);
        self.version += 1;
        Ok(old)
    }

    /// Remove an attribute, returning its previous value.
    ///
    /// # Errors
    /// `NotSupported` when the node is not an element.
    pub fn remove_attr(&mut self, id: NodeId, name: Atom) -> Result<Option<String>, DomError> {
        let element = self
            .element_mut(id)
            .ok_or(DomError::NotSupported("attributes require an element"))?;
        let old = element.attrs.remove(name);
        if old.is_some() {
            self.version += 1;
        }
        Ok(old)
    }

    fn check_insertable(&self, parent: NodeId, child: NodeId) -> Result<(), DomError> {
        let parent_kind = self.kind(parent).ok_or(DomError::NotFound)?;
        self.kind(child).ok_or(DomError::NotFound)?;
        if child == self.root {
            return Err(DomError::HierarchyRequest("document cannot be a child"));
        }
        match parent_kind {
            NodeKind::Document | NodeKind::DocumentFragment | NodeKind::Element(_) => Ok(()),
            _ => Err(DomError::HierarchyRequest("parent cannot hold children")),
        }
    }

    // ── Ordering ────────────────────────────────────────────────────

    /// True when `a` comes before `b` in document order (an ancestor
    /// precedes its descendants). Nodes in disconnected subtrees are
    /// unordered; this returns false for them and for `a == b`.
    pub fn precedes(&self, a: NodeId, b: NodeId) -> bool {
        if a == b {
            return false;
        }
        let mut chain_a: Vec<NodeId> = self.ancestors(a).collect();
        let mut chain_b: Vec<NodeId> = self.ancestors(b).collect();
        chain_a.reverse();
        chain_b.reverse();
        if chain_a[0] != chain_b[0] {
            return false;
        }
        let mut idx = 0;
        while idx < chain_a.len() && idx < chain_b.len() && chain_a[idx] == chain_b[idx] {
            idx += 1;
        }
        if idx == chain_a.len() {
            // a is an ancestor of b.
            return true;
        }
        if idx == chain_b.len() {
            return false;
        }
        let fork_a = chain_a[idx];
        let fork_b = chain_b[idx];
        for child in self.children(chain_a[idx - 1]) {
            if child == fork_a {
                return true;
            }
            if child == fork_b {
                return false;
            }
        }
        false
    }
}

impl Default for DomTree {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}
