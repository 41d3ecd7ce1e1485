//! Ordered attribute storage.
//!
//! Attributes are an ordered (name, value) sequence with interned-name
//! lookup; N is almost always tiny, so the list is inline up to four
//! entries and lookup is a linear scan.

use smallvec::SmallVec;

use crate::atoms::{resolve, Atom};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AttrEntry {
    pub name: Atom,
    pub value: String,
}

/// Ordered attribute list for one element.
#[derive(Clone, Debug, Default)]
pub struct AttrList {
    entries: SmallVec<[AttrEntry; 4]>,
}

impl AttrList {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[inline]
    pub fn contains(&self, name: Atom) -> bool {
        self.entries.iter().any(|e| e.name == name)
    }

    #[inline]
    pub fn get(&self, name: Atom) -> Option<&str> {
        self.entries
            .iter()
            .find(|e| e.name == name)
            .map(|e| e.value.as_str())
    }

    /// Set an attribute, returning the previous value when one existed.
    /// Order of existing entries is preserved; new names append.
    pub fn set(&mut self, name: Atom, value: String) -> Option<String> {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.name == name) {
            return Some(std::mem::replace(&mut entry.value, value));
        }
        self.entries.push(AttrEntry { name, value });
        None
    }

    /// Remove an attribute, returning its value when present.
    pub fn remove(&mut self, name: Atom) -> Option<String> {
        let idx = self.entries.iter().position(|e| e.name == name)?;
        Some(self.entries.remove(idx).value)
    }

    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = &AttrEntry> {
        self.entries.iter()
    }

    /// Iterate as (name-str, value) pairs, in attribute order.
    #[inline]
    pub fn pairs(&self) -> impl Iterator<Item = (&'static str, &str)> + '_ {
        self.entries
            .iter()
            .map(|e| (resolve(e.name), e.value.as_str()))
    }
}
