//! Folding server-side structural changes back into the change tracker.
//!
//! The server may add or remove entities while it recalculates. After a dry
//! run those changes only exist in the merged document, so the tracker is
//! recomputed from the difference between the request's base snapshot and
//! the merged result. Nested classes are flattened across their parents.

use crate::{ChangeTracker, Document, DocumentSchema};
use std::collections::BTreeSet;

/// Recompute change sets after a merge.
///
/// Starts from `prior`, the tracker in effect when the request was built.
/// Classes the schema does not track are carried over unchanged.
pub fn recompute(
    schema: &DocumentSchema,
    original: &Document,
    merged: &Document,
    prior: &ChangeTracker,
) -> ChangeTracker {
    let mut tracker = prior.clone();

    for class in schema.tracked_classes() {
        let before = original.ids_of_class(&class);
        let after = merged.ids_of_class(&class);
        let before_set: BTreeSet<&str> = before.iter().map(String::as_str).collect();
        let after_set: BTreeSet<&str> = after.iter().map(String::as_str).collect();

        let set = tracker.set_mut(&class);

        // Server-created
        for id in after.iter().filter(|id| !before_set.contains(id.as_str())) {
            set.add(id);
        }

        // Server-removed
        for id in before.iter().filter(|id| !after_set.contains(id.as_str())) {
            set.remove(id);
        }
    }

    tracker
}
