//! TreeSink implementation that writes directly into our DOM.

use std::borrow::Cow;
use std::collections::{HashMap, HashSet};

use dom::node::NodeKind;
use dom::{DomTree, ElementData, Namespace, NodeId};
use html5ever::tendril::{StrTendril, TendrilSink};
use html5ever::tree_builder::{ElementFlags, NextParserState, NodeOrText, QuirksMode, TreeSink};
use html5ever::{
    expanded_name, local_name, namespace_url, ns, parse_document, parse_fragment, Attribute,
    ExpandedName, LocalName, ParseOpts, QualName,
};
use log::{debug, warn};

static EXPANDED_HTML_DIV: ExpandedName = expanded_name!(html "div");

/// Page-side callbacks the driver invokes while building the tree.
pub trait ParseHooks {
    /// Materialize a start tag. The implementation owns namespace and
    /// custom-element dispatch and must populate the attributes.
    fn create_element(
        &mut self,
        tree: &mut DomTree,
        ns_uri: &str,
        name: &str,
        attrs: &[(String, String)],
    ) -> NodeId;

    /// A subtree finished parsing (its element was popped). Script and
    /// iframe elements become ready for their loaders here.
    fn node_complete(&mut self, tree: &mut DomTree, node: NodeId);
}

/// Hooks that build plain elements and ignore completion; used by
/// tests and fragment parsing without a page.
#[derive(Default)]
pub struct NoopHooks;

impl ParseHooks for NoopHooks {
    fn create_element(
        &mut self,
        tree: &mut DomTree,
        ns_uri: &str,
        name: &str,
        attrs: &[(String, String)],
    ) -> NodeId {
        let mut data = ElementData::new(Namespace::from_uri(ns_uri), name);
        for (name, value) in attrs {
            data.attrs.set(dom::atom(name), value.clone());
        }
        tree.create_element(data)
    }

    fn node_complete(&mut self, _tree: &mut DomTree, _node: NodeId) {}
}

/// TreeSink writing into a [`DomTree`] through [`ParseHooks`].
pub struct PageSink<'a, H: ParseHooks> {
    tree: &'a mut DomTree,
    hooks: &'a mut H,
    /// Where "the document" lives for this parse: the tree root for a
    /// document parse, a detached fragment node for a fragment parse.
    document: NodeId,
    names: HashMap<NodeId, QualName>,
    template_contents: HashMap<NodeId, NodeId>,
    completed: HashSet<NodeId>,
}

impl<'a, H: ParseHooks> PageSink<'a, H> {
    fn new(tree: &'a mut DomTree, hooks: &'a mut H, document: NodeId) -> Self {
        Self {
            tree,
            hooks,
            document,
            names: HashMap::new(),
            template_contents: HashMap::new(),
            completed: HashSet::new(),
        }
    }

    fn complete(&mut self, node: NodeId) {
        if self.completed.insert(node) {
            self.hooks.node_complete(self.tree, node);
        }
    }

    fn append_node_or_text(&mut self, parent: NodeId, child: NodeOrText<NodeId>) {
        match child {
            NodeOrText::AppendNode(node) => {
                if let Err(err) = self.tree.append_child(parent, node) {
                    warn!("parser append failed: {err}");
                }
            }
            NodeOrText::AppendText(text) => {
                if let Err(err) = self.tree.append_text(parent, &text) {
                    warn!("parser text append failed: {err}");
                }
            }
        }
    }
}

impl<'a, H: ParseHooks> TreeSink for PageSink<'a, H> {
    type Handle = NodeId;
    type Output = ();

    fn finish(self) -> Self::Output {}

    fn parse_error(&mut self, msg: Cow<'static, str>) {
        // Lenient by design; bad HTML is never fatal.
        debug!("parse error: {msg}");
    }

    fn get_document(&mut self) -> Self::Handle {
        self.document
    }

    fn elem_name<'b>(&'b self, target: &'b Self::Handle) -> ExpandedName<'b> {
        self.names
            .get(target)
            .map_or(EXPANDED_HTML_DIV, QualName::expanded)
    }

    fn create_element(
        &mut self,
        name: QualName,
        attrs: Vec<Attribute>,
        flags: ElementFlags,
    ) -> Self::Handle {
        let pairs: Vec<(String, String)> = attrs
            .iter()
            .map(|a| (a.name.local.to_string(), a.value.to_string()))
            .collect();
        let id = self
            .hooks
            .create_element(self.tree, &name.ns, &name.local, &pairs);
        if flags.template {
            let contents = self.tree.create_node(NodeKind::DocumentFragment);
            self.template_contents.insert(id, contents);
        }
        self.names.insert(id, name);
        id
    }

    fn create_comment(&mut self, text: StrTendril) -> Self::Handle {
        self.tree.create_node(NodeKind::Comment {
            data: text.to_string(),
        })
    }

    fn create_pi(&mut self, target: StrTendril, data: StrTendril) -> Self::Handle {
        self.tree.create_node(NodeKind::ProcessingInstruction {
            target: target.to_string(),
            data: data.to_string(),
        })
    }

    fn append(&mut self, parent: &Self::Handle, child: NodeOrText<Self::Handle>) {
        self.append_node_or_text(*parent, child);
    }

    fn append_based_on_parent_node(
        &mut self,
        element: &Self::Handle,
        prev_element: &Self::Handle,
        child: NodeOrText<Self::Handle>,
    ) {
        if self.tree.parent(*element).is_some() {
            self.append_before_sibling(element, child);
        } else {
            self.append_node_or_text(*prev_element, child);
        }
    }

    fn append_doctype_to_document(
        &mut self,
        _name: StrTendril,
        _public_id: StrTendril,
        _system_id: StrTendril,
    ) {
        // The doctype only matters for quirks mode, which we ignore.
    }

    fn mark_script_already_started(&mut self, _node: &Self::Handle) {}

    fn pop(&mut self, node: &Self::Handle) {
        self.complete(*node);
    }

    fn get_template_contents(&mut self, target: &Self::Handle) -> Self::Handle {
        self.template_contents.get(target).copied().unwrap_or(*target)
    }

    fn same_node(&self, x: &Self::Handle, y: &Self::Handle) -> bool {
        x == y
    }

    fn set_quirks_mode(&mut self, _mode: QuirksMode) {}

    fn append_before_sibling(&mut self, sibling: &Self::Handle, new_node: NodeOrText<Self::Handle>) {
        match new_node {
            NodeOrText::AppendNode(node) => {
                if let Err(err) = self.tree.insert_before(*sibling, node) {
                    warn!("parser insert failed: {err}");
                }
            }
            NodeOrText::AppendText(text) => {
                // Concatenate into an adjacent text sibling when one exists.
                if let Some(prev) = self.tree.prev_sibling(*sibling) {
                    if let Some(NodeKind::Text { .. }) = self.tree.kind(prev) {
                        if let Err(err) = self.tree.set_character_data(
                            prev,
                            &format!("{}{}", self.tree.text_content(prev), text),
                        ) {
                            warn!("parser text merge failed: {err}");
                        }
                        return;
                    }
                }
                let node = self.tree.create_text(&text);
                if let Err(err) = self.tree.insert_before(*sibling, node) {
                    warn!("parser insert failed: {err}");
                }
            }
        }
    }

    fn add_attrs_if_missing(&mut self, target: &Self::Handle, attrs: Vec<Attribute>) {
        if let Some(element) = self.tree.element_mut(*target) {
            for attr in attrs {
                let name = dom::atom(&attr.name.local.to_ascii_lowercase());
                if !element.attrs.contains(name) {
                    element.attrs.set(name, attr.value.to_string());
                }
            }
        }
    }

    fn remove_from_parent(&mut self, target: &Self::Handle) {
        self.tree.detach(*target);
    }

    fn reparent_children(&mut self, node: &Self::Handle, new_parent: &Self::Handle) {
        if let Err(err) = self.tree.reparent_children(*node, *new_parent) {
            warn!("parser reparent failed: {err}");
        }
    }

    fn is_mathml_annotation_xml_integration_point(&self, _handle: &Self::Handle) -> bool {
        false
    }

    fn complete_script(&mut self, node: &Self::Handle) -> NextParserState {
        self.complete(*node);
        NextParserState::Continue
    }
}

/// Parse a full document's bytes into the tree. The tree builder
/// synthesizes html/head/body even for empty input.
pub fn parse_document_into<H: ParseHooks>(tree: &mut DomTree, hooks: &mut H, input: &str) {
    let root = tree.root();
    let sink = PageSink::new(tree, hooks, root);
    let parser = parse_document(sink, ParseOpts::default());
    parser.one(StrTendril::from(input));
}

/// Parse markup in the context of `parent` and append the resulting
/// nodes as its children (innerHTML semantics). Returns the inserted
/// top-level nodes in order. Scripts inside the fragment are built but
/// never executed; the page's parse mode governs that in
/// [`ParseHooks::node_complete`].
pub fn parse_fragment_into<H: ParseHooks>(
    tree: &mut DomTree,
    hooks: &mut H,
    parent: NodeId,
    context_tag: &str,
    input: &str,
) -> Vec<NodeId> {
    let staging = tree.create_node(NodeKind::DocumentFragment);
    let sink = PageSink::new(tree, hooks, staging);
    let context = QualName::new(None, ns!(html), LocalName::from(context_tag));
    let parser = parse_fragment(sink, ParseOpts::default(), context, Vec::new());
    parser.one(StrTendril::from(input));

    // The fragment algorithm parks results under a synthesized html
    // element; move them to their real parent.
    let wrapper = tree.first_child(staging).unwrap_or(staging);
    let children: Vec<NodeId> = tree.children(wrapper).collect();
    for child in &children {
        if let Err(err) = tree.append_child(parent, *child) {
            warn!("fragment adoption failed: {err}");
        }
    }
    tree.detach(staging);
    children
}

#[cfg(test)]
mod tests {
    use super::*;
    use dom::serialize_children;

    #[test]
    fn empty_input_still_produces_html_head_body() {
        let mut tree = DomTree::new();
        let mut hooks = NoopHooks;
        parse_document_into(&mut tree, &mut hooks, "");
        assert_eq!(
            serialize_children(&tree, tree.root()),
            "<html><head></head><body></body></html>"
        );
    }

    #[test]
    fn document_round_trip() {
        let mut tree = DomTree::new();
        let mut hooks = NoopHooks;
        parse_document_into(
            &mut tree,
            &mut hooks,
            "<html><body><p class=\"x\">hi <b>there</b></p></body></html>",
        );
        assert_eq!(
            serialize_children(&tree, tree.root()),
            "<html><head></head><body><p class=\"x\">hi <b>there</b></p></body></html>"
        );
    }

    #[test]
    fn fragment_parse_appends_children() {
        let mut tree = DomTree::new();
        let mut hooks = NoopHooks;
        parse_document_into(&mut tree, &mut hooks, "<html><body><div id=\"d\"></div></body></html>");
        let div = tree
            .descendants(tree.root())
            .find(|&n| tree.element(n).is_some_and(|e| e.local_name() == "div"))
            .expect("div exists");

        let inserted = parse_fragment_into(&mut tree, &mut hooks, div, "div", "<span>a</span>b");
        assert_eq!(inserted.len(), 2);
        assert_eq!(serialize_children(&tree, div), "<span>a</span>b");
    }

    #[test]
    fn node_complete_fires_for_each_element() {
        struct Counting {
            completed: Vec<String>,
        }
        impl ParseHooks for Counting {
            fn create_element(
                &mut self,
                tree: &mut DomTree,
                ns_uri: &str,
                name: &str,
                attrs: &[(String, String)],
            ) -> NodeId {
                NoopHooks.create_element(tree, ns_uri, name, attrs)
            }
            fn node_complete(&mut self, tree: &mut DomTree, node: NodeId) {
                if let Some(element) = tree.element(node) {
                    self.completed.push(element.local_name().to_owned());
                }
            }
        }

        let mut tree = DomTree::new();
        let mut hooks = Counting {
            completed: Vec::new(),
        };
        parse_document_into(
            &mut tree,
            &mut hooks,
            "<html><body><script>1</script><iframe></iframe></body></html>",
        );
        assert!(hooks.completed.iter().any(|t| t == "script"));
        assert!(hooks.completed.iter().any(|t| t == "iframe"));
    }
}
