//! Node and element data.
//!
//! Node kind and element kind are tagged variants rather than trait
//! objects; the handful of polymorphic operations (built callbacks,
//! attribute-change hooks) dispatch on the tag in the page layer.

use crate::atoms::{atom, resolve, Atom};
use crate::attr::AttrList;

pub const HTML_NS: &str = "http://www.w3.org/1999/xhtml";
pub const SVG_NS: &str = "http://www.w3.org/2000/svg";
pub const MATHML_NS: &str = "http://www.w3.org/1998/Math/MathML";

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Namespace {
    Html,
    Svg,
    MathMl,
    Other(Atom),
}

impl Namespace {
    #[inline]
    pub fn from_uri(uri: &str) -> Self {
        match uri {
            HTML_NS | "" => Self::Html,
            SVG_NS => Self::Svg,
            MATHML_NS => Self::MathMl,
            other => Self::Other(atom(other)),
        }
    }

    #[inline]
    pub fn uri(&self) -> &'static str {
        match self {
            Self::Html => HTML_NS,
            Self::Svg => SVG_NS,
            Self::MathMl => MATHML_NS,
            Self::Other(a) => resolve(*a),
        }
    }
}

/// Element classification driving "built" behavior. Only kinds the
/// runtime treats specially get their own tag; the rest are `Other`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ElementKind {
    Anchor,
    Body,
    Form,
    Head,
    Html,
    Iframe,
    Image,
    Input,
    Link,
    Script,
    Slot,
    Style,
    Template,
    Title,
    /// SVG-namespace element.
    Svg,
    /// Non-HTML, non-SVG namespace.
    Unknown,
    /// Hyphenated name with no registered definition yet.
    CustomPending,
    /// Upgraded custom element.
    Custom,
    /// Ordinary HTML element.
    Other,
}

impl ElementKind {
    /// Classify by namespace and lowercased tag name. Custom-element
    /// upgrade (pending → custom) is the registry's job, not ours.
    pub fn classify(ns: Namespace, tag: &str) -> Self {
        match ns {
            Namespace::Svg => return Self::Svg,
            Namespace::MathMl | Namespace::Other(_) => return Self::Unknown,
            Namespace::Html => {}
        }
        if tag.contains('-') {
            return Self::CustomPending;
        }
        match tag {
            "a" => Self::Anchor,
            "body" => Self::Body,
            "form" => Self::Form,
            "head" => Self::Head,
            "html" => Self::Html,
            "iframe" => Self::Iframe,
            "img" => Self::Image,
            "input" => Self::Input,
            "link" => Self::Link,
            "script" => Self::Script,
            "slot" => Self::Slot,
            "style" => Self::Style,
            "template" => Self::Template,
            "title" => Self::Title,
            _ => Self::Other,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ElementData {
    pub ns: Namespace,
    pub kind: ElementKind,
    /// Interned lowercased tag.
    pub tag: Atom,
    /// Tag name as written in the source.
    pub tag_name: String,
    pub attrs: AttrList,
}

impl ElementData {
    /// Build element data with the namespace fixed before any
    /// attribute is populated.
    pub fn new(ns: Namespace, name: &str) -> Self {
        let lower = name.to_ascii_lowercase();
        Self {
            ns,
            kind: ElementKind::classify(ns, &lower),
            tag: atom(&lower),
            tag_name: name.to_owned(),
            attrs: AttrList::new(),
        }
    }

    #[inline]
    pub fn local_name(&self) -> &'static str {
        resolve(self.tag)
    }
}

#[derive(Clone, Debug)]
pub enum NodeKind {
    Document,
    DocumentFragment,
    Element(ElementData),
    Text { data: String },
    Comment { data: String },
    CdataSection { data: String },
    ProcessingInstruction { target: String, data: String },
}

impl NodeKind {
    #[inline]
    pub fn is_element(&self) -> bool {
        matches!(self, Self::Element(_))
    }

    #[inline]
    pub fn is_text(&self) -> bool {
        matches!(self, Self::Text { .. })
    }

    #[inline]
    pub fn as_element(&self) -> Option<&ElementData> {
        match self {
            Self::Element(data) => Some(data),
            _ => None,
        }
    }
}

/// One arena-owned node.
#[derive(Clone, Debug)]
pub struct DomNode {
    pub kind: NodeKind,
}

impl DomNode {
    #[inline]
    pub fn new(kind: NodeKind) -> Self {
        Self { kind }
    }
}
