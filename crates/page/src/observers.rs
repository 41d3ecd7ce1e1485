//! Observer subsystems: mutation, intersection, slotchange and
//! performance.
//!
//! All four follow the same schedule-deliver pattern: records
//! accumulate into per-observer queues, a single "delivery scheduled"
//! flag per kind debounces scheduling, and delivery happens from the
//! page's microtask drain (mutation/intersection/slotchange) or from
//! the low-priority scheduler (performance).

use std::collections::HashMap;
use std::rc::Rc;

use dom::{atom, DomTree, NodeId};
use log::debug;

/// Nesting depth after which mutation delivery is abandoned; delivery
/// that keeps mutating forever must not hang the page.
pub const MAX_MUTATION_DEPTH: u32 = 100;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

// ── Mutation ────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MutationKind {
    ChildList,
    Attributes,
    CharacterData,
}

#[derive(Clone, Debug)]
pub struct MutationRecord {
    pub kind: MutationKind,
    pub target: NodeId,
    pub added: Vec<NodeId>,
    pub removed: Vec<NodeId>,
    pub attribute_name: Option<String>,
    pub old_value: Option<String>,
}

impl MutationRecord {
    pub fn child_list(target: NodeId, added: Vec<NodeId>, removed: Vec<NodeId>) -> Self {
        Self {
            kind: MutationKind::ChildList,
            target,
            added,
            removed,
            attribute_name: None,
            old_value: None,
        }
    }

    pub fn attribute(target: NodeId, name: &str, old_value: Option<String>) -> Self {
        Self {
            kind: MutationKind::Attributes,
            target,
            added: Vec::new(),
            removed: Vec::new(),
            attribute_name: Some(name.to_owned()),
            old_value,
        }
    }

    pub fn character_data(target: NodeId, old_value: String) -> Self {
        Self {
            kind: MutationKind::CharacterData,
            target,
            added: Vec::new(),
            removed: Vec::new(),
            attribute_name: None,
            old_value: Some(old_value),
        }
    }
}

#[derive(Copy, Clone, Debug, Default)]
pub struct MutationObserverOptions {
    pub subtree: bool,
    pub child_list: bool,
    pub attributes: bool,
    pub character_data: bool,
}

pub type MutationCallback = Rc<dyn Fn(&[MutationRecord])>;

struct MutationEntry {
    id: ObserverId,
    target: NodeId,
    options: MutationObserverOptions,
    callback: MutationCallback,
    queue: Vec<MutationRecord>,
}

#[derive(Default)]
pub struct MutationObservers {
    entries: Vec<MutationEntry>,
    next_id: u64,
    delivery_scheduled: bool,
}

impl MutationObservers {
    pub fn observe(
        &mut self,
        target: NodeId,
        options: MutationObserverOptions,
        callback: MutationCallback,
    ) -> ObserverId {
        self.next_id += 1;
        let id = ObserverId(self.next_id);
        self.entries.push(MutationEntry {
            id,
            target,
            options,
            callback,
            queue: Vec::new(),
        });
        id
    }

    pub fn disconnect(&mut self, id: ObserverId) {
        self.entries.retain(|e| e.id != id);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Queue a record with every interested observer. Returns true
    /// when delivery needs to be scheduled (it was not already).
    pub fn record(&mut self, tree: &DomTree, record: &MutationRecord) -> bool {
        let mut queued = false;
        for entry in &mut self.entries {
            let wants_kind = match record.kind {
                MutationKind::ChildList => entry.options.child_list,
                MutationKind::Attributes => entry.options.attributes,
                MutationKind::CharacterData => entry.options.character_data,
            };
            if !wants_kind {
                continue;
            }
            let in_scope = entry.target == record.target
                || (entry.options.subtree
                    && tree.ancestors(record.target).any(|a| a == entry.target));
            if in_scope {
                entry.queue.push(record.clone());
                queued = true;
            }
        }
        if queued && !self.delivery_scheduled {
            self.delivery_scheduled = true;
            return true;
        }
        false
    }

    /// Take the pending batches for delivery. Records within a batch
    /// keep the order in which the mutations occurred.
    pub fn take_batches(&mut self) -> Vec<(MutationCallback, Vec<MutationRecord>)> {
        self.delivery_scheduled = false;
        self.entries
            .iter_mut()
            .filter(|e| !e.queue.is_empty())
            .map(|e| (Rc::clone(&e.callback), std::mem::take(&mut e.queue)))
            .collect()
    }
}

/// Deliver mutation batches, looping while callbacks queue more work,
/// up to [`MAX_MUTATION_DEPTH`] nested rounds. Returns true when the
/// limit was hit and delivery abandoned. The callback receives the
/// observer set back so it can record follow-on mutations (that is
/// exactly the reentrancy the limit bounds).
pub fn deliver_mutations_with_limit<F>(observers: &mut MutationObservers, mut invoke: F) -> bool
where
    F: FnMut(&mut MutationObservers, &MutationCallback, &[MutationRecord]),
{
    let mut depth = 0u32;
    loop {
        let batches = observers.take_batches();
        if batches.is_empty() {
            return false;
        }
        depth += 1;
        if depth > MAX_MUTATION_DEPTH {
            return true;
        }
        for (callback, batch) in batches {
            invoke(observers, &callback, &batch);
        }
    }
}

// ── Intersection ────────────────────────────────────────────────────

#[derive(Clone, Debug)]
pub struct IntersectionRecord {
    pub target: NodeId,
    pub is_intersecting: bool,
}

pub type IntersectionCallback = Rc<dyn Fn(&[IntersectionRecord])>;

struct IntersectionEntry {
    id: ObserverId,
    targets: Vec<NodeId>,
    last: HashMap<NodeId, bool>,
    callback: IntersectionCallback,
    pending: Vec<IntersectionRecord>,
}

#[derive(Default)]
pub struct IntersectionObservers {
    entries: Vec<IntersectionEntry>,
    next_id: u64,
    check_scheduled: bool,
    delivery_scheduled: bool,
    checked_version: u64,
}

impl IntersectionObservers {
    pub fn observe(&mut self, callback: IntersectionCallback) -> ObserverId {
        self.next_id += 1;
        let id = ObserverId(self.next_id);
        self.entries.push(IntersectionEntry {
            id,
            targets: Vec::new(),
            last: HashMap::new(),
            callback,
            pending: Vec::new(),
        });
        id
    }

    pub fn add_target(&mut self, id: ObserverId, target: NodeId) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.id == id) {
            if !entry.targets.contains(&target) {
                entry.targets.push(target);
            }
        }
    }

    pub fn disconnect(&mut self, id: ObserverId) {
        self.entries.retain(|e| e.id != id);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether a visibility recheck is warranted for this tree version.
    pub fn needs_check(&mut self, version: u64) -> bool {
        if self.entries.is_empty() || self.check_scheduled || version == self.checked_version {
            return false;
        }
        self.check_scheduled = true;
        true
    }

    /// Recompute visibility for every observed target. Without a
    /// layout engine, "intersecting" means connected and not inside a
    /// `hidden` subtree. Returns true when delivery should be
    /// scheduled.
    pub fn check(&mut self, tree: &DomTree, version: u64) -> bool {
        self.check_scheduled = false;
        self.checked_version = version;
        let hidden = atom("hidden");
        let mut changed = false;
        for entry in &mut self.entries {
            for &target in &entry.targets {
                let visible = tree.is_connected(target)
                    && !tree.ancestors(target).any(|a| {
                        tree.element(a).is_some_and(|e| e.attrs.contains(hidden))
                    });
                if entry.last.get(&target).copied() != Some(visible) {
                    entry.last.insert(target, visible);
                    entry.pending.push(IntersectionRecord {
                        target,
                        is_intersecting: visible,
                    });
                    changed = true;
                }
            }
        }
        if changed && !self.delivery_scheduled {
            self.delivery_scheduled = true;
            return true;
        }
        false
    }

    /// Batches in reverse observer order, so `disconnect` during a
    /// callback cannot skip a later entry.
    pub fn take_batches(&mut self) -> Vec<(IntersectionCallback, Vec<IntersectionRecord>)> {
        self.delivery_scheduled = false;
        self.entries
            .iter_mut()
            .rev()
            .filter(|e| !e.pending.is_empty())
            .map(|e| (Rc::clone(&e.callback), std::mem::take(&mut e.pending)))
            .collect()
    }
}

// ── Slotchange ──────────────────────────────────────────────────────

/// Slots with a pending slotchange. Collection is cleared before the
/// events dispatch, so changes made during delivery land in the next
/// cycle.
#[derive(Default)]
pub struct SlotchangeQueue {
    pending: Vec<NodeId>,
    scheduled: bool,
}

impl SlotchangeQueue {
    /// Returns true when delivery should be scheduled.
    pub fn enqueue(&mut self, slot: NodeId) -> bool {
        if !self.pending.contains(&slot) {
            self.pending.push(slot);
        }
        if self.scheduled {
            return false;
        }
        self.scheduled = true;
        true
    }

    pub fn take(&mut self) -> Vec<NodeId> {
        self.scheduled = false;
        std::mem::take(&mut self.pending)
    }
}

// ── Performance ─────────────────────────────────────────────────────

#[derive(Clone, Debug)]
pub struct PerformanceEntry {
    pub name: String,
    pub entry_type: String,
    /// Milliseconds since navigation start.
    pub start_time_ms: u64,
}

pub type PerformanceCallback = Rc<dyn Fn(&[PerformanceEntry])>;

struct PerformanceObserver {
    id: ObserverId,
    callback: PerformanceCallback,
    pending: Vec<PerformanceEntry>,
}

#[derive(Default)]
pub struct PerformanceTimeline {
    entries: Vec<PerformanceEntry>,
    observers: Vec<PerformanceObserver>,
    next_id: u64,
    delivery_scheduled: bool,
}

impl PerformanceTimeline {
    /// Record an entry. Returns true when a low-priority delivery task
    /// should be scheduled.
    pub fn mark(&mut self, name: &str, entry_type: &str, start_time_ms: u64) -> bool {
        let entry = PerformanceEntry {
            name: name.to_owned(),
            entry_type: entry_type.to_owned(),
            start_time_ms,
        };
        debug!("performance: {entry_type} '{name}' at {start_time_ms}ms");
        for observer in &mut self.observers {
            observer.pending.push(entry.clone());
        }
        self.entries.push(entry);
        if !self.observers.is_empty() && !self.delivery_scheduled {
            self.delivery_scheduled = true;
            return true;
        }
        false
    }

    pub fn observe(&mut self, callback: PerformanceCallback) -> ObserverId {
        self.next_id += 1;
        let id = ObserverId(self.next_id);
        self.observers.push(PerformanceObserver {
            id,
            callback,
            pending: Vec::new(),
        });
        id
    }

    pub fn disconnect(&mut self, id: ObserverId) {
        self.observers.retain(|o| o.id != id);
    }

    pub fn entries(&self) -> &[PerformanceEntry] {
        &self.entries
    }

    pub fn take_batches(&mut self) -> Vec<(PerformanceCallback, Vec<PerformanceEntry>)> {
        self.delivery_scheduled = false;
        self.observers
            .iter_mut()
            .filter(|o| !o.pending.is_empty())
            .map(|o| (Rc::clone(&o.callback), std::mem::take(&mut o.pending)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dom::{ElementData, Namespace};
    use std::cell::RefCell;

    fn tree_with_div() -> (DomTree, NodeId, NodeId) {
        let mut tree = DomTree::new();
        let body = tree.create_element(ElementData::new(Namespace::Html, "body"));
        let div = tree.create_element(ElementData::new(Namespace::Html, "div"));
        tree.append_child(tree.root(), body).unwrap();
        tree.append_child(body, div).unwrap();
        (tree, body, div)
    }

    #[test]
    fn subtree_observers_see_descendant_mutations() {
        let (tree, body, div) = tree_with_div();
        let mut observers = MutationObservers::default();
        let seen = Rc::new(RefCell::new(0usize));
        let seen_cb = Rc::clone(&seen);
        observers.observe(
            body,
            MutationObserverOptions {
                subtree: true,
                child_list: true,
                ..Default::default()
            },
            Rc::new(move |records| *seen_cb.borrow_mut() += records.len()),
        );

        let schedule = observers.record(&tree, &MutationRecord::child_list(div, vec![], vec![]));
        assert!(schedule, "first record schedules delivery");
        let again = observers.record(&tree, &MutationRecord::child_list(div, vec![], vec![]));
        assert!(!again, "debounced while a delivery is scheduled");

        for (callback, batch) in observers.take_batches() {
            callback(&batch);
        }
        assert_eq!(*seen.borrow(), 2);
    }

    #[test]
    fn non_matching_kinds_are_ignored() {
        let (tree, body, div) = tree_with_div();
        let mut observers = MutationObservers::default();
        observers.observe(
            body,
            MutationObserverOptions {
                subtree: true,
                attributes: true,
                ..Default::default()
            },
            Rc::new(|_| {}),
        );
        let schedule = observers.record(&tree, &MutationRecord::child_list(div, vec![], vec![]));
        assert!(!schedule);
        assert!(observers.take_batches().is_empty());
    }

    #[test]
    fn intersection_tracks_hidden_flag() {
        let (mut tree, body, div) = tree_with_div();
        let mut observers = IntersectionObservers::default();
        let id = observers.observe(Rc::new(|_| {}));
        observers.add_target(id, div);

        assert!(observers.check(&tree, tree.version()));
        let batches = observers.take_batches();
        assert!(batches[0].1[0].is_intersecting);

        if let Some(element) = tree.element_mut(body) {
            element.attrs.set(atom("hidden"), String::new());
        }
        assert!(observers.check(&tree, tree.version()));
        let batches = observers.take_batches();
        assert!(!batches[0].1[0].is_intersecting);

        // No change: nothing pending.
        assert!(!observers.check(&tree, tree.version()));
    }

    #[test]
    fn slotchange_clears_before_dispatch() {
        let (_, _, div) = tree_with_div();
        let mut queue = SlotchangeQueue::default();
        assert!(queue.enqueue(div));
        assert!(!queue.enqueue(div), "deduplicated and debounced");
        let taken = queue.take();
        assert_eq!(taken, vec![div]);
        assert!(queue.take().is_empty());
        // After a take, scheduling starts over.
        assert!(queue.enqueue(div));
    }

    #[test]
    fn runaway_mutation_delivery_is_abandoned() {
        let (tree, body, div) = tree_with_div();
        let mut observers = MutationObservers::default();
        observers.observe(
            body,
            MutationObserverOptions {
                subtree: true,
                child_list: true,
                ..Default::default()
            },
            Rc::new(|_| {}),
        );
        observers.record(&tree, &MutationRecord::child_list(div, vec![], vec![]));

        let rounds = Rc::new(RefCell::new(0u32));
        let rounds_cb = Rc::clone(&rounds);
        // Every delivered batch records another mutation: unbounded
        // reentrancy, which the depth limit must cut off.
        let abandoned = deliver_mutations_with_limit(&mut observers, |observers, _, _| {
            *rounds_cb.borrow_mut() += 1;
            observers.record(&tree, &MutationRecord::child_list(div, vec![], vec![]));
        });
        assert!(abandoned);
        assert_eq!(*rounds.borrow(), MAX_MUTATION_DEPTH);
    }

    #[test]
    fn finite_mutation_delivery_completes() {
        let (tree, body, div) = tree_with_div();
        let mut observers = MutationObservers::default();
        observers.observe(
            body,
            MutationObserverOptions {
                subtree: true,
                child_list: true,
                ..Default::default()
            },
            Rc::new(|_| {}),
        );
        observers.record(&tree, &MutationRecord::child_list(div, vec![], vec![]));
        let delivered = Rc::new(RefCell::new(0u32));
        let delivered_cb = Rc::clone(&delivered);
        let abandoned = deliver_mutations_with_limit(&mut observers, |_, _, batch| {
            *delivered_cb.borrow_mut() += batch.len() as u32;
        });
        assert!(!abandoned);
        assert_eq!(*delivered.borrow(), 1);
    }

    #[test]
    fn performance_marks_reach_observers() {
        let mut timeline = PerformanceTimeline::default();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let seen_cb = Rc::clone(&seen);
        timeline.observe(Rc::new(move |entries: &[PerformanceEntry]| {
            seen_cb
                .borrow_mut()
                .extend(entries.iter().map(|e| e.name.clone()));
        }));
        assert!(timeline.mark("navigationStart", "navigation", 0));
        assert!(!timeline.mark("domContentLoaded", "navigation", 12));
        for (callback, batch) in timeline.take_batches() {
            callback(&batch);
        }
        assert_eq!(*seen.borrow(), vec!["navigationStart", "domContentLoaded"]);
        assert_eq!(timeline.entries().len(), 2);
    }
}
