//! Structural change tracking per entity class.
//!
//! A change set records which entities of a class were added or removed on
//! the client since the last full save. It decides whether a present entity
//! is sent as a create or an update, and which deletes are sent at all.

use crate::{Document, DocumentSchema, EntityClass, EntityId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Added and removed ids for one class.
///
/// The two lists are always disjoint. Order is insertion order, which is also
/// the order removal operations are emitted in. Re-adding a removed id and
/// removing it again moves it to the end of `removed_ids`, so compare with
/// [`same_ids`](Self::same_ids) when only membership matters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeSet {
    pub added_ids: Vec<EntityId>,
    pub removed_ids: Vec<EntityId>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.added_ids.is_empty() && self.removed_ids.is_empty()
    }

    pub fn is_added(&self, id: &str) -> bool {
        self.added_ids.iter().any(|a| a == id)
    }

    pub fn is_removed(&self, id: &str) -> bool {
        self.removed_ids.iter().any(|r| r == id)
    }

    /// Whether both sets hold the same ids, whatever their order.
    pub fn same_ids(&self, other: &ChangeSet) -> bool {
        fn sorted(ids: &[EntityId]) -> Vec<&EntityId> {
            let mut ids: Vec<_> = ids.iter().collect();
            ids.sort();
            ids
        }
        sorted(&self.added_ids) == sorted(&other.added_ids)
            && sorted(&self.removed_ids) == sorted(&other.removed_ids)
    }

    /// Whether no id is both added and removed.
    pub fn is_disjoint(&self) -> bool {
        !self.added_ids.iter().any(|id| self.is_removed(id))
    }

    pub(crate) fn add(&mut self, id: &str) {
        if let Some(index) = self.removed_ids.iter().position(|r| r == id) {
            // Re-attached after a removal: it still exists remotely.
            self.removed_ids.remove(index);
            return;
        }
        if !self.is_added(id) {
            self.added_ids.push(id.to_string());
        }
    }

    pub(crate) fn remove(&mut self, id: &str) {
        if let Some(index) = self.added_ids.iter().position(|a| a == id) {
            // Never existed remotely.
            self.added_ids.remove(index);
            return;
        }
        if !self.is_removed(id) {
            self.removed_ids.push(id.to_string());
        }
    }
}

/// Change sets for every class of a document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChangeTracker {
    sets: BTreeMap<EntityClass, ChangeSet>,
}

impl ChangeTracker {
    /// Create an empty tracker, the state of a freshly loaded document.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a tracker for a new document: every pre-populated entity of a
    /// tracked class is marked added, so the first save creates it.
    pub fn for_new_document(schema: &DocumentSchema, document: &Document) -> Self {
        let mut tracker = Self::new();
        for class in schema.tracked_classes() {
            for id in document.ids_of_class(&class) {
                tracker.register_addition(&class, &id);
            }
        }
        tracker
    }

    /// Record that an entity was added on the client.
    pub fn register_addition(&mut self, class: &str, id: &str) {
        self.sets.entry(class.to_string()).or_default().add(id);
    }

    /// Record that an entity was removed on the client.
    ///
    /// Removing an entity that was only added locally cancels the addition.
    pub fn register_removal(&mut self, class: &str, id: &str) {
        self.sets.entry(class.to_string()).or_default().remove(id);
    }

    /// The change set for a class (empty when nothing was recorded).
    pub fn change_set(&self, class: &str) -> ChangeSet {
        self.sets.get(class).cloned().unwrap_or_default()
    }

    /// Borrow the change set for a class, if any was recorded.
    pub fn get(&self, class: &str) -> Option<&ChangeSet> {
        self.sets.get(class)
    }

    pub fn is_added(&self, class: &str, id: &str) -> bool {
        self.sets.get(class).is_some_and(|s| s.is_added(id))
    }

    pub(crate) fn set_mut(&mut self, class: &str) -> &mut ChangeSet {
        self.sets.entry(class.to_string()).or_default()
    }

    /// Iterate over all recorded classes.
    pub fn iter(&self) -> impl Iterator<Item = (&EntityClass, &ChangeSet)> {
        self.sets.iter()
    }

    /// Whether no class has any recorded change.
    pub fn is_empty(&self) -> bool {
        self.sets.values().all(ChangeSet::is_empty)
    }

    /// Whether every change set is disjoint.
    pub fn is_consistent(&self) -> bool {
        self.sets.values().all(ChangeSet::is_disjoint)
    }

    /// Forget all changes. Done after a successful full save.
    pub fn clear(&mut self) {
        self.sets.clear();
    }
}
