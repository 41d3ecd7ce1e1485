//! DOM serialization: HTML text and a deterministic JSON snapshot for
//! test comparisons.

use indextree::NodeId;
use serde_json::{json, Value};

use crate::node::NodeKind;
use crate::tree::DomTree;

/// Elements that never have children or an end tag.
const VOID_ELEMENTS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta",
    "source", "track", "wbr",
];

/// Serialize a node including its own tag.
pub fn serialize_node(tree: &DomTree, id: NodeId) -> String {
    let mut out = String::new();
    write_node(tree, id, &mut out);
    out
}

/// Serialize only the children of a node (innerHTML semantics).
pub fn serialize_children(tree: &DomTree, id: NodeId) -> String {
    let mut out = String::new();
    for child in tree.children(id) {
        write_node(tree, child, &mut out);
    }
    out
}

fn write_node(tree: &DomTree, id: NodeId, out: &mut String) {
    let Some(kind) = tree.kind(id) else {
        return;
    };
    match kind {
        NodeKind::Document | NodeKind::DocumentFragment => {
            for child in tree.children(id) {
                write_node(tree, child, out);
            }
        }
        NodeKind::Element(data) => {
            out.push('<');
            out.push_str(data.local_name());
            for (name, value) in data.attrs.pairs() {
                out.push(' ');
                out.push_str(name);
                out.push_str("=\"");
                escape_into(value, true, out);
                out.push('"');
            }
            out.push('>');
            if VOID_ELEMENTS.contains(&data.local_name()) {
                return;
            }
            for child in tree.children(id) {
                write_node(tree, child, out);
            }
            out.push_str("</");
            out.push_str(data.local_name());
            out.push('>');
        }
        NodeKind::Text { data } => escape_into(data, false, out),
        NodeKind::CdataSection { data } => {
            out.push_str("<![CDATA[");
            out.push_str(data);
            out.push_str("]]>");
        }
        NodeKind::Comment { data } => {
            out.push_str("<!--");
            out.push_str(data);
            out.push_str("-->");
        }
        NodeKind::ProcessingInstruction { target, data } => {
            out.push_str("<?");
            out.push_str(target);
            out.push(' ');
            out.push_str(data);
            out.push('>');
        }
    }
}

fn escape_into(text: &str, attribute: bool, out: &mut String) {
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' if !attribute => out.push_str("&lt;"),
            '>' if !attribute => out.push_str("&gt;"),
            '"' if attribute => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
}

/// Deterministic JSON form of a subtree. Schema:
/// - Document: `{ "type": "document", "children": [..] }`
/// - Element: `{ "type": "element", "tag": "div", "attrs": {..}, "children": [..] }`
/// - Text: `{ "type": "text", "text": ".." }`
pub fn node_to_json(tree: &DomTree, id: NodeId) -> Value {
    let Some(kind) = tree.kind(id) else {
        return Value::Null;
    };
    match kind {
        NodeKind::Document | NodeKind::DocumentFragment => json!({
            "type": "document",
            "children": children_json(tree, id),
        }),
        NodeKind::Element(data) => {
            let mut attrs = serde_json::Map::new();
            for (name, value) in data.attrs.pairs() {
                attrs.insert(name.to_owned(), Value::String(value.to_owned()));
            }
            json!({
                "type": "element",
                "tag": data.local_name(),
                "attrs": attrs,
                "children": children_json(tree, id),
            })
        }
        NodeKind::Text { data } => json!({ "type": "text", "text": data }),
        NodeKind::Comment { data } => json!({ "type": "comment", "text": data }),
        NodeKind::CdataSection { data } => json!({ "type": "cdata", "text": data }),
        NodeKind::ProcessingInstruction { target, data } => json!({
            "type": "pi", "target": target, "text": data,
        }),
    }
}

fn children_json(tree: &DomTree, id: NodeId) -> Vec<Value> {
    tree.children(id).map(|c| node_to_json(tree, c)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::atom;
    use crate::node::{ElementData, Namespace};

    #[test]
    fn serializes_elements_attrs_and_text() {
        let mut tree = DomTree::new();
        let mut data = ElementData::new(Namespace::Html, "a");
        data.attrs.set(atom("href"), "/x?a=1&b=2".to_owned());
        let a = tree.create_element(data);
        tree.append_child(tree.root(), a).unwrap();
        tree.append_text(a, "1 < 2").unwrap();
        assert_eq!(
            serialize_children(&tree, tree.root()),
            "<a href=\"/x?a=1&amp;b=2\">1 &lt; 2</a>"
        );
    }

    #[test]
    fn void_elements_have_no_end_tag() {
        let mut tree = DomTree::new();
        let img = tree.create_element(ElementData::new(Namespace::Html, "img"));
        tree.append_child(tree.root(), img).unwrap();
        assert_eq!(serialize_children(&tree, tree.root()), "<img>");
    }

    #[test]
    fn json_snapshot_shape() {
        let mut tree = DomTree::new();
        let div = tree.create_element(ElementData::new(Namespace::Html, "div"));
        tree.append_child(tree.root(), div).unwrap();
        tree.append_text(div, "hi").unwrap();
        let value = node_to_json(&tree, tree.root());
        assert_eq!(value["type"], "document");
        assert_eq!(value["children"][0]["tag"], "div");
        assert_eq!(value["children"][0]["children"][0]["text"], "hi");
    }
}
