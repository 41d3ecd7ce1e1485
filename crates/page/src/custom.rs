//! Custom element registry.
//!
//! Hyphenated HTML tag names route through here at element creation.
//! Defined names construct through the JS engine immediately;
//! undefined ones are remembered and upgraded when (if) a definition
//! arrives. Constructor and callback invocations are synthesized as
//! engine evaluations against the runtime's custom-elements shim.

use std::collections::HashMap;

use dom::NodeId;

#[derive(Clone, Debug)]
pub struct CustomElementDefinition {
    pub name: String,
    /// Attributes whose changes replay through
    /// `attributeChangedCallback`.
    pub observed_attributes: Vec<String>,
    /// Built-in tag this definition extends (`is="..."`), if any.
    pub extends: Option<String>,
}

#[derive(Default)]
pub struct CustomElementRegistry {
    definitions: HashMap<String, CustomElementDefinition>,
    /// Elements created before their definition, awaiting upgrade.
    undefined: Vec<(String, NodeId)>,
    /// The element currently being upgraded; saved and restored
    /// around nested constructions.
    upgrading: Option<NodeId>,
}

impl CustomElementRegistry {
    pub fn define(&mut self, definition: CustomElementDefinition) {
        self.definitions.insert(definition.name.clone(), definition);
    }

    #[inline]
    pub fn get(&self, name: &str) -> Option<&CustomElementDefinition> {
        self.definitions.get(name)
    }

    pub fn observes(&self, name: &str, attribute: &str) -> bool {
        self.get(name)
            .is_some_and(|d| d.observed_attributes.iter().any(|a| a == attribute))
    }

    /// Remember an element whose definition has not arrived yet.
    pub fn remember_undefined(&mut self, name: &str, node: NodeId) {
        self.undefined.push((name.to_owned(), node));
    }

    /// Pull the elements waiting on `name`, in creation order.
    pub fn take_pending(&mut self, name: &str) -> Vec<NodeId> {
        let mut taken = Vec::new();
        self.undefined.retain(|(n, node)| {
            if n == name {
                taken.push(*node);
                false
            } else {
                true
            }
        });
        taken
    }

    pub fn forget_node(&mut self, node: NodeId) {
        self.undefined.retain(|(_, n)| *n != node);
    }

    /// Swap in the element under construction, returning the previous
    /// holder for restoration.
    #[inline]
    pub fn begin_upgrade(&mut self, node: NodeId) -> Option<NodeId> {
        self.upgrading.replace(node)
    }

    #[inline]
    pub fn end_upgrade(&mut self, previous: Option<NodeId>) {
        self.upgrading = previous;
    }

    #[inline]
    pub fn upgrading(&self) -> Option<NodeId> {
        self.upgrading
    }
}
