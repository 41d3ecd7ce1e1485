//! Process-wide string interning.
//!
//! Tag and attribute names are interned once and shared immutably
//! across every page; per-page strings (text data, attribute values)
//! stay owned by their tree.

use lasso::{Spur, ThreadedRodeo};
use once_cell::sync::Lazy;

/// An interned name.
pub type Atom = Spur;

static INTERNER: Lazy<ThreadedRodeo> = Lazy::new(ThreadedRodeo::default);

/// Intern `s`, returning its atom.
#[inline]
pub fn atom(s: &str) -> Atom {
    INTERNER.get_or_intern(s)
}

/// Look up an atom without interning.
#[inline]
pub fn existing_atom(s: &str) -> Option<Atom> {
    INTERNER.get(s)
}

/// Resolve an atom back to its string.
#[inline]
pub fn resolve(a: Atom) -> &'static str {
    INTERNER.resolve(&a)
}
