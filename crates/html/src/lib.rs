//! HTML parser driver.
//!
//! The tokenizer and tree builder are html5ever's; this crate owns the
//! [`TreeSink`](html5ever::tree_builder::TreeSink) that writes into a
//! [`dom::DomTree`] and calls back into the page for element creation
//! and node completion.

pub mod mime;
pub mod sink;

pub use mime::{sniff, wrap_for_parser, ContentKind};
pub use sink::{parse_document_into, parse_fragment_into, NoopHooks, ParseHooks};

/// How the parser is being driven, which controls whether mutation
/// records are emitted and whether scripts inside the parsed content
/// execute. The page consults its current mode from the hooks.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ParseMode {
    /// Initial navigation: mutation records are suppressed until the
    /// parse ends; scripts execute.
    Document,
    /// `innerHTML` and similar: mutation records are emitted; scripts
    /// do NOT execute.
    Fragment,
    /// `document.write`: like Document, but the parse may re-enter.
    DocumentWrite,
}
