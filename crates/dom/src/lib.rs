//! Arena-owned DOM tree for the page runtime.
//!
//! One [`DomTree`] holds every node of one document; the arena is
//! dropped whole when its page navigates, so nodes never need
//! individual destructors. Rarely-used per-element state lives in
//! pointer-keyed side tables on [`Document`] rather than inline on
//! elements.

pub mod atoms;
pub mod attr;
pub mod document;
pub mod error;
pub mod event;
pub mod node;
pub mod printing;
pub mod tree;

pub use atoms::{atom, resolve, Atom};
pub use attr::{AttrEntry, AttrList};
pub use document::{Document, ReadyState, SlotImpact};
pub use error::DomError;
pub use event::{
    Event, EventManager, EventPhase, EventTarget, ListenerFn, ListenerId, ListenerOptions,
};
pub use node::{DomNode, ElementData, ElementKind, Namespace, NodeKind};
pub use printing::{node_to_json, serialize_children, serialize_node};
pub use tree::DomTree;

/// Stable node handle; valid for the lifetime of its tree's arena.
pub type NodeId = indextree::NodeId;
