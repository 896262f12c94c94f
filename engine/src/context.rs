//! Per-document reconciliation state.
//!
//! The context bundles the live document, its change sets and the staleness
//! guard for one edited document. It is created per document and passed
//! explicitly, so two documents never share state.
//!
//! A round trip goes through three calls:
//!
//! ```text
//! prepare(kind) -> send batch -> apply_response(replacement)
//!                             \-> fail(errors) / abort()
//! ```
//!
//! Nothing is mutated between `prepare` and the response except by user
//! edits, and `apply_response` commits only after every fallible step
//! succeeded.

use crate::{
    delta, diagnostics, error::Result, ApiError, BatchBuilder, BatchOptions, ChangeTracker,
    Document, DocumentSchema, Entity, EntityClass, EntityError, EntityId, Error, FieldPath,
    MergeOptions, OperationBatch, Reference, ReplacementMerger, RoundTrip, RoundTripKind,
    RoundTripPhase, Settlement, SpecialError, StalenessGuard, Timestamp,
};

/// What an edit means for recalculation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditEffect {
    /// A field changed. Recalculation may be throttled.
    Field,
    /// A collection changed. A new round trip must supersede any outstanding
    /// one, otherwise its response cannot account for the edit.
    Structural,
}

impl EditEffect {
    pub fn is_structural(self) -> bool {
        matches!(self, EditEffect::Structural)
    }
}

/// A round trip ready to be sent.
#[derive(Debug, Clone)]
pub struct PreparedRoundTrip {
    pub round_trip: RoundTrip,
    pub batch: OperationBatch,
    original: Document,
    prior_changes: ChangeTracker,
    preserve_classes: Vec<EntityClass>,
}

impl PreparedRoundTrip {
    pub fn kind(&self) -> RoundTripKind {
        self.round_trip.kind
    }

    /// The document as it was when the batch was built.
    pub fn original(&self) -> &Document {
        &self.original
    }
}

/// Summary of an applied response.
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedResponse {
    pub round_trip: RoundTrip,
    /// Fields where a user edit displaced a recalculated value
    pub overridden: Vec<FieldPath>,
    /// Children added while the request was in flight and left out
    pub skipped_additions: Vec<EntityId>,
}

/// Result of handing a response to the context.
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    Applied(AppliedResponse),
    /// A newer round trip was issued. Nothing was touched.
    Superseded,
}

/// Result of reporting a failed round trip.
#[derive(Debug, Clone, PartialEq)]
pub enum FailureOutcome {
    /// Errors were resolved and recorded on the context
    Recorded(Vec<EntityError>),
    /// A newer round trip was issued. The errors were dropped.
    Superseded,
}

/// Merged state waiting to be committed.
struct Reconciled {
    document: Document,
    changes: ChangeTracker,
    overridden: Vec<FieldPath>,
    skipped_additions: Vec<EntityId>,
}

/// Reconciliation state for one edited document.
#[derive(Debug, Clone)]
pub struct ReconciliationContext {
    schema: DocumentSchema,
    document: Document,
    changes: ChangeTracker,
    guard: StalenessGuard,
    is_new: bool,
    internal_errors: Vec<EntityError>,
    special_errors: Vec<EntityError>,
    displayed_errors: Vec<EntityError>,
}

impl ReconciliationContext {
    /// Start editing a document that has never been saved. Every entity it
    /// already contains is marked added.
    pub fn new_document(schema: DocumentSchema, document: Document) -> Result<Self> {
        let changes = ChangeTracker::for_new_document(&schema, &document);
        Self::build(schema, document, changes, true)
    }

    /// Start editing a document loaded from the server.
    pub fn loaded(schema: DocumentSchema, document: Document) -> Result<Self> {
        Self::build(schema, document, ChangeTracker::new(), false)
    }

    pub(crate) fn build(
        schema: DocumentSchema,
        document: Document,
        changes: ChangeTracker,
        is_new: bool,
    ) -> Result<Self> {
        schema.validate()?;
        schema.validate_document(&document)?;

        Ok(Self {
            schema,
            document,
            changes,
            guard: StalenessGuard::new(),
            is_new,
            internal_errors: Vec::new(),
            special_errors: Vec::new(),
            displayed_errors: Vec::new(),
        })
    }

    pub fn schema(&self) -> &DocumentSchema {
        &self.schema
    }

    pub fn document(&self) -> &Document {
        &self.document
    }

    pub fn changes(&self) -> &ChangeTracker {
        &self.changes
    }

    pub fn guard(&self) -> &StalenessGuard {
        &self.guard
    }

    /// Whether the root has never been saved.
    pub fn is_new(&self) -> bool {
        self.is_new
    }

    /// Whether a full save is awaiting its response.
    pub fn save_in_progress(&self) -> bool {
        self.guard.save_in_progress()
    }

    /// Errors from the latest relevant round trip of any kind.
    pub fn internal_errors(&self) -> &[EntityError] {
        &self.internal_errors
    }

    /// Document-level errors such as version conflicts.
    pub fn special_errors(&self) -> &[EntityError] {
        &self.special_errors
    }

    /// Errors from the latest failed full save, for display.
    pub fn displayed_errors(&self) -> &[EntityError] {
        &self.displayed_errors
    }

    /// Whether the deferred collection is saved with the next round trip.
    pub fn deferred_enabled(&self) -> bool {
        match &self.schema.deferred {
            None => false,
            Some(deferred) => match &deferred.enabled_by {
                None => true,
                Some(flag) => self.document.root.scalar(flag) == Some(&serde_json::Value::Bool(true)),
            },
        }
    }

    // ---- edits ----

    /// Set a declared scalar on any entity.
    pub fn set_scalar(
        &mut self,
        entity_id: &str,
        field: &str,
        value: serde_json::Value,
    ) -> Result<EditEffect> {
        let entity = self.entity_for_edit(entity_id)?;
        if !self.schema.entity(&entity.class)?.has_scalar(field) {
            return Err(Error::UnknownField {
                class: entity.class.clone(),
                field: field.to_string(),
            });
        }

        self.entity_mut(entity_id)?
            .scalars
            .insert(field.to_string(), value);
        Ok(EditEffect::Field)
    }

    /// Set or clear a declared reference on any entity.
    ///
    /// Changing a reference clears the references declared as depending on
    /// it.
    pub fn set_reference(
        &mut self,
        entity_id: &str,
        field: &str,
        reference: Option<Reference>,
    ) -> Result<EditEffect> {
        let entity = self.entity_for_edit(entity_id)?;
        let declaration = self.schema.entity(&entity.class)?;
        if !declaration.has_reference(field) {
            return Err(Error::UnknownField {
                class: entity.class.clone(),
                field: field.to_string(),
            });
        }
        let changed = entity.reference(field) != reference.as_ref();
        let dependents = declaration.dependents_of(field).to_vec();

        let entity = self.entity_mut(entity_id)?;
        entity.references.insert(field.to_string(), reference);
        if changed {
            for dependent in dependents {
                entity.references.insert(dependent, None);
            }
        }
        Ok(EditEffect::Field)
    }

    /// Append a child (and its nested children) to a collection and mark the
    /// whole subtree added.
    pub fn insert_child(
        &mut self,
        parent_id: &str,
        collection: &str,
        child: Entity,
    ) -> Result<EditEffect> {
        let parent = self.entity_for_edit(parent_id)?;
        let def = self
            .schema
            .entity(&parent.class)?
            .get_collection(collection)
            .ok_or_else(|| Error::UnknownCollection {
                class: parent.class.clone(),
                collection: collection.to_string(),
            })?;
        if child.class != def.class {
            return Err(Error::ClassMismatch {
                collection: collection.to_string(),
                expected: def.class.clone(),
                got: child.class,
            });
        }

        let subtree = child.subtree_ids();
        if let Some((_, id)) = subtree.iter().find(|(_, id)| self.document.contains(id)) {
            return Err(Error::DuplicateEntity(id.clone()));
        }

        let mut document = self.document.clone();
        document
            .find_mut(parent_id)
            .ok_or_else(|| Error::EntityNotFound(parent_id.to_string()))?
            .collections
            .entry(collection.to_string())
            .or_default()
            .push(child);
        self.schema.validate_document(&document)?;

        self.document = document;
        for (class, id) in &subtree {
            self.changes.register_addition(class, id);
        }
        Ok(EditEffect::Structural)
    }

    /// Remove a child from a collection and mark its whole subtree removed.
    ///
    /// Always a structural edit.
    pub fn remove_child(
        &mut self,
        parent_id: &str,
        collection: &str,
        child_id: &str,
    ) -> Result<EditEffect> {
        self.detach_child(parent_id, collection, child_id)?;
        Ok(EditEffect::Structural)
    }

    /// Like [`remove_child`](Self::remove_child), returning the detached subtree.
    pub fn detach_child(
        &mut self,
        parent_id: &str,
        collection: &str,
        child_id: &str,
    ) -> Result<Entity> {
        let parent = self.entity_for_edit(parent_id)?;
        if self
            .schema
            .entity(&parent.class)?
            .get_collection(collection)
            .is_none()
        {
            return Err(Error::UnknownCollection {
                class: parent.class.clone(),
                collection: collection.to_string(),
            });
        }

        let parent = self.entity_mut(parent_id)?;
        let children = parent
            .collections
            .get_mut(collection)
            .ok_or_else(|| Error::EntityNotFound(child_id.to_string()))?;
        let index = children
            .iter()
            .position(|c| c.id == child_id)
            .ok_or_else(|| Error::EntityNotFound(child_id.to_string()))?;
        let removed = children.remove(index);

        for (class, id) in removed.subtree_ids() {
            self.changes.register_removal(&class, &id);
        }
        Ok(removed)
    }

    fn entity_for_edit(&self, entity_id: &str) -> Result<&Entity> {
        self.document
            .find(entity_id)
            .ok_or_else(|| Error::EntityNotFound(entity_id.to_string()))
    }

    fn entity_mut(&mut self, entity_id: &str) -> Result<&mut Entity> {
        self.document
            .find_mut(entity_id)
            .ok_or_else(|| Error::EntityNotFound(entity_id.to_string()))
    }

    // ---- round trips ----

    /// Build the batch for a new round trip and issue it.
    ///
    /// Fails with [`Error::SaveInProgress`] for recalculations while a full
    /// save is outstanding.
    pub fn prepare(&mut self, kind: RoundTripKind, now: Timestamp) -> Result<PreparedRoundTrip> {
        let preserve_classes = if kind.is_dry_run() {
            self.schema.dry_run_excluded.clone()
        } else {
            Vec::new()
        };
        let options = BatchOptions {
            root_is_new: self.is_new,
            include_deferred: self.deferred_enabled(),
            exclude_classes: preserve_classes.clone(),
        };
        let batch = BatchBuilder::new(&self.schema).build(&self.document, &self.changes, &options)?;

        let round_trip = self.guard.issue(kind, now)?;

        Ok(PreparedRoundTrip {
            round_trip,
            batch,
            original: self.document.clone(),
            prior_changes: self.changes.clone(),
            preserve_classes,
        })
    }

    /// Whether a prepared round trip's response would still be applied.
    pub fn is_relevant(&self, prepared: &PreparedRoundTrip) -> bool {
        self.guard.is_relevant(&prepared.round_trip)
    }

    /// Apply the server's replacement document.
    ///
    /// Stale responses are discarded without touching anything. Errors leave
    /// the live state as it was and settle the round trip as failed.
    pub fn apply_response(
        &mut self,
        prepared: PreparedRoundTrip,
        replacement: Document,
    ) -> Result<ApplyOutcome> {
        if !self.guard.is_relevant(&prepared.round_trip) {
            self.guard.settle(&prepared.round_trip, Settlement::Applied)?;
            return Ok(ApplyOutcome::Superseded);
        }

        let reconciled = match self.reconcile(&prepared, replacement) {
            Ok(reconciled) => reconciled,
            Err(err) => {
                self.guard.settle(&prepared.round_trip, Settlement::Failed)?;
                return Err(err);
            }
        };
        self.guard.settle(&prepared.round_trip, Settlement::Applied)?;

        self.document = reconciled.document;
        self.changes = reconciled.changes;
        if !prepared.kind().is_dry_run() {
            self.is_new = false;
        }
        self.clear_errors();

        Ok(ApplyOutcome::Applied(AppliedResponse {
            round_trip: prepared.round_trip,
            overridden: reconciled.overridden,
            skipped_additions: reconciled.skipped_additions,
        }))
    }

    fn reconcile(&self, prepared: &PreparedRoundTrip, replacement: Document) -> Result<Reconciled> {
        let options = MergeOptions::preserving(prepared.preserve_classes.iter().cloned());
        let outcome = ReplacementMerger::new(&self.schema).merge(
            &prepared.original,
            &self.document,
            replacement,
            &options,
        )?;
        self.schema.validate_document(&outcome.document)?;

        let changes = if prepared.kind().is_dry_run() {
            delta::recompute(
                &self.schema,
                &prepared.original,
                &outcome.document,
                &prepared.prior_changes,
            )
        } else {
            // Everything tracked has been persisted.
            ChangeTracker::new()
        };

        Ok(Reconciled {
            document: outcome.document,
            changes,
            overridden: outcome.overridden,
            skipped_additions: outcome.skipped_additions,
        })
    }

    /// Record validation errors returned for a round trip.
    ///
    /// All errors become internal errors. Only full saves update the
    /// displayed errors, so recalculations never show errors for fields the
    /// user is still filling in.
    pub fn fail(
        &mut self,
        prepared: &PreparedRoundTrip,
        errors: &[ApiError],
    ) -> Result<FailureOutcome> {
        if self.guard.settle(&prepared.round_trip, Settlement::Failed)? == RoundTripPhase::Superseded {
            return Ok(FailureOutcome::Superseded);
        }

        let resolved = diagnostics::resolve_errors(errors, &prepared.batch);
        self.internal_errors = resolved.clone();
        self.special_errors = resolved
            .iter()
            .filter(|e| e.special.is_some())
            .cloned()
            .collect();
        if !prepared.kind().is_dry_run() {
            self.displayed_errors = resolved
                .iter()
                .filter(|e| e.special.is_none())
                .cloned()
                .collect();
        }

        Ok(FailureOutcome::Recorded(resolved))
    }

    /// Settle a round trip that failed without a usable response.
    ///
    /// Returns whether it was still relevant. Relevant failures clear the
    /// recorded errors, since they no longer describe the document.
    pub fn abort(&mut self, prepared: &PreparedRoundTrip) -> Result<bool> {
        let phase = self.guard.settle(&prepared.round_trip, Settlement::Failed)?;
        if phase == RoundTripPhase::Superseded {
            return Ok(false);
        }
        self.clear_errors();
        Ok(true)
    }

    /// Forget a round trip whose response will never arrive.
    ///
    /// Used when the caller gives up on the request. Recorded errors are
    /// kept, and a withdrawn full save no longer blocks recalculations.
    pub fn release(&mut self, round_trip: &RoundTrip) -> bool {
        self.guard.withdraw(round_trip)
    }

    /// Whether the latest errors include a version conflict.
    pub fn has_version_conflict(&self) -> bool {
        self.special_errors
            .iter()
            .any(|e| e.special == Some(SpecialError::OptimisticLocking))
    }

    fn clear_errors(&mut self) {
        self.internal_errors.clear();
        self.special_errors.clear();
        self.displayed_errors.clear();
    }

    /// Replace the whole state. Responses to anything issued before are
    /// dropped as stale.
    pub fn reset(&mut self, document: Document, is_new: bool) -> Result<()> {
        self.schema.validate_document(&document)?;

        self.changes = if is_new {
            ChangeTracker::for_new_document(&self.schema, &document)
        } else {
            ChangeTracker::new()
        };
        self.document = document;
        self.is_new = is_new;
        self.guard.reset();
        self.clear_errors();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CollectionDef, EntitySchema, OperationKind};
    use serde_json::json;

    fn test_schema() -> DocumentSchema {
        DocumentSchema::new(
            EntitySchema::new("Order", "orders")
                .scalars(["reference", "total", "isTemplate"])
                .references(["customer", "contact"])
                .dependents("customer", ["contact"])
                .collection(CollectionDef::new("rows", "Row").with_inverse("order"))
                .collection(CollectionDef::new("deviations", "Deviation").with_inverse("order"))
                .collection(CollectionDef::new("schedules", "Entry")),
        )
        .with_entity(
            EntitySchema::new("Row", "rows")
                .scalars(["amount"])
                .collection(CollectionDef::new("parts", "Part").with_inverse("row")),
        )
        .with_entity(EntitySchema::new("Part", "parts").scalars(["size"]))
        .with_entity(EntitySchema::new("Deviation", "deviations").scalars(["note"]))
        .with_deferred(EntitySchema::new("Entry", "entries"), Some("isTemplate"))
        .excluding_from_dry_runs("Deviation")
    }

    fn row(id: &str) -> Entity {
        Entity::new(id, "Row").with_scalar("amount", json!(1))
    }

    fn loaded(rows: &[&str]) -> ReconciliationContext {
        let mut root = Entity::new("o1", "Order").with_scalar("total", json!(0));
        for id in rows {
            root = root.with_child("rows", row(id));
        }
        ReconciliationContext::loaded(test_schema(), Document::new(root)).unwrap()
    }

    #[test]
    fn new_document_marks_everything_added() {
        let doc = Document::new(
            Entity::new("o1", "Order")
                .with_child("rows", row("r1").with_child("parts", Entity::new("p1", "Part"))),
        );
        let ctx = ReconciliationContext::new_document(test_schema(), doc).unwrap();
        assert!(ctx.is_new());
        assert!(ctx.changes().is_added("Row", "r1"));
        assert!(ctx.changes().is_added("Part", "p1"));
    }

    #[test]
    fn invalid_document_is_rejected() {
        let doc = Document::new(Entity::new("o1", "Order").with_child("rows", Entity::new("x", "Part")));
        assert!(matches!(
            ReconciliationContext::loaded(test_schema(), doc),
            Err(Error::ClassMismatch { .. })
        ));
    }

    #[test]
    fn field_edits() {
        let mut ctx = loaded(&["r1"]);
        assert_eq!(ctx.set_scalar("r1", "amount", json!(5)), Ok(EditEffect::Field));
        assert_eq!(ctx.document().find("r1").unwrap().scalar("amount"), Some(&json!(5)));

        assert!(matches!(
            ctx.set_scalar("r1", "nope", json!(1)),
            Err(Error::UnknownField { .. })
        ));
        assert!(matches!(
            ctx.set_scalar("zz", "amount", json!(1)),
            Err(Error::EntityNotFound(_))
        ));
        assert!(ctx.changes().is_empty());
    }

    #[test]
    fn changing_a_reference_clears_its_dependents() {
        let mut ctx = loaded(&[]);
        ctx.set_reference("o1", "customer", Some(Reference::new("customers", "c1")))
            .unwrap();
        ctx.set_reference("o1", "contact", Some(Reference::new("contacts", "k1")))
            .unwrap();

        // Same value: dependents stay.
        ctx.set_reference("o1", "customer", Some(Reference::new("customers", "c1")))
            .unwrap();
        assert!(ctx.document().root.reference("contact").is_some());

        ctx.set_reference("o1", "customer", Some(Reference::new("customers", "c2")))
            .unwrap();
        assert!(ctx.document().root.reference("contact").is_none());
    }

    #[test]
    fn structural_edits_track_subtrees() {
        let mut ctx = loaded(&["r1"]);
        let effect = ctx
            .insert_child(
                "o1",
                "rows",
                row("r2").with_child("parts", Entity::new("p2", "Part")),
            )
            .unwrap();
        assert!(effect.is_structural());
        assert!(ctx.changes().is_added("Row", "r2"));
        assert!(ctx.changes().is_added("Part", "p2"));

        // Removing a fresh subtree cancels it out.
        assert_eq!(ctx.remove_child("o1", "rows", "r2"), Ok(EditEffect::Structural));
        assert!(ctx.changes().is_empty());

        let removed = ctx.detach_child("o1", "rows", "r1").unwrap();
        assert_eq!(removed.id, "r1");
        assert_eq!(ctx.changes().change_set("Row").removed_ids, vec!["r1"]);
    }

    #[test]
    fn insert_rejects_bad_children() {
        let mut ctx = loaded(&["r1"]);
        assert!(matches!(
            ctx.insert_child("o1", "rows", row("r1")),
            Err(Error::DuplicateEntity(id)) if id == "r1"
        ));
        assert!(matches!(
            ctx.insert_child("o1", "rows", Entity::new("p9", "Part")),
            Err(Error::ClassMismatch { .. })
        ));
        assert!(matches!(
            ctx.insert_child("o1", "rows", row("r9").with_child("bogus", Entity::new("b", "Part"))),
            Err(Error::UnknownCollection { .. })
        ));
        assert!(ctx.changes().is_empty());
        assert_eq!(ctx.document().entity_count(), 2);
    }

    #[test]
    fn dry_run_merges_and_recomputes() {
        let mut ctx = loaded(&["a", "b"]);
        ctx.remove_child("o1", "rows", "a").unwrap();

        let prepared = ctx.prepare(RoundTripKind::DryRun, 1).unwrap();
        assert!(prepared
            .batch
            .operations
            .iter()
            .any(|op| op.kind() == OperationKind::Delete && op.id() == "a"));

        // User keeps typing while the request is in flight.
        ctx.set_scalar("b", "amount", json!(42)).unwrap();

        let replacement = Document::new(
            Entity::new("o1", "Order")
                .with_scalar("total", json!(99))
                .with_child("rows", row("b"))
                .with_child("rows", row("c")),
        );
        let outcome = ctx.apply_response(prepared, replacement).unwrap();
        assert!(matches!(outcome, ApplyOutcome::Applied(_)));

        let doc = ctx.document();
        assert_eq!(doc.ids_of_class("Row"), vec!["b", "c"]);
        assert_eq!(doc.root.scalar("total"), Some(&json!(99)));
        assert_eq!(doc.find("b").unwrap().scalar("amount"), Some(&json!(42)));

        let set = ctx.changes().change_set("Row");
        assert_eq!(set.added_ids, vec!["c"]);
        assert_eq!(set.removed_ids, vec!["a"]);
    }

    #[test]
    fn full_save_clears_tracking() {
        let doc = Document::new(Entity::new("o1", "Order").with_child("rows", row("r1")));
        let mut ctx = ReconciliationContext::new_document(test_schema(), doc.clone()).unwrap();

        let prepared = ctx.prepare(RoundTripKind::FullSave, 1).unwrap();
        assert_eq!(prepared.batch.operations[0].kind(), OperationKind::Create);
        assert!(ctx.save_in_progress());
        assert_eq!(ctx.prepare(RoundTripKind::DryRun, 2).unwrap_err(), Error::SaveInProgress);

        ctx.apply_response(prepared, doc).unwrap();
        assert!(!ctx.is_new());
        assert!(ctx.changes().is_empty());
        assert!(!ctx.save_in_progress());
    }

    #[test]
    fn stale_response_touches_nothing() {
        let mut ctx = loaded(&["r1"]);
        let first = ctx.prepare(RoundTripKind::DryRun, 1).unwrap();
        let second = ctx.prepare(RoundTripKind::DryRun, 2).unwrap();

        let newer = Document::new(Entity::new("o1", "Order").with_scalar("total", json!(2)).with_child("rows", row("r1")));
        let older = Document::new(Entity::new("o1", "Order").with_scalar("total", json!(1)));

        assert!(matches!(ctx.apply_response(second, newer), Ok(ApplyOutcome::Applied(_))));
        assert_eq!(ctx.apply_response(first, older), Ok(ApplyOutcome::Superseded));
        assert_eq!(ctx.document().root.scalar("total"), Some(&json!(2)));
        assert!(ctx.document().contains("r1"));
    }

    #[test]
    fn failed_merge_leaves_state_untouched() {
        let mut ctx = loaded(&["r1"]);
        let before = ctx.document().clone();
        let prepared = ctx.prepare(RoundTripKind::DryRun, 1).unwrap();

        let wrong_root = Document::new(Entity::new("o2", "Order"));
        assert!(matches!(
            ctx.apply_response(prepared, wrong_root),
            Err(Error::RootMismatch { .. })
        ));
        assert_eq!(ctx.document(), &before);
        assert_eq!(ctx.guard().outstanding(), 0);
    }

    #[test]
    fn dry_runs_skip_excluded_classes_and_preserve_them() {
        let mut ctx = loaded(&[]);
        ctx.insert_child("o1", "deviations", Entity::new("d1", "Deviation"))
            .unwrap();

        let dry = ctx.prepare(RoundTripKind::DryRun, 1).unwrap();
        assert!(dry.batch.classes.iter().all(|c| c != "Deviation"));

        // The server never saw d1, so it is not in the replacement.
        let replacement = Document::new(Entity::new("o1", "Order").with_scalar("total", json!(3)));
        ctx.apply_response(dry, replacement).unwrap();
        assert!(ctx.document().contains("d1"));
        assert!(ctx.changes().is_added("Deviation", "d1"));

        let save = ctx.prepare(RoundTripKind::FullSave, 2).unwrap();
        assert!(save
            .batch
            .operations
            .iter()
            .any(|op| op.id() == "d1" && op.kind() == OperationKind::Create));
    }

    #[test]
    fn deferred_collection_follows_flag() {
        let mut ctx = loaded(&[]);
        ctx.insert_child("o1", "schedules", Entity::new("e1", "Entry"))
            .unwrap();
        assert!(!ctx.deferred_enabled());
        let prepared = ctx.prepare(RoundTripKind::DryRun, 1).unwrap();
        assert!(prepared.batch.classes.iter().all(|c| c != "Entry"));

        ctx.set_scalar("o1", "isTemplate", json!(true)).unwrap();
        assert!(ctx.deferred_enabled());
        let prepared = ctx.prepare(RoundTripKind::DryRun, 2).unwrap();
        assert_eq!(prepared.batch.classes.last().map(String::as_str), Some("Order"));
        assert!(prepared.batch.classes.iter().any(|c| c == "Entry"));
    }

    #[test]
    fn validation_errors_are_recorded_by_kind() {
        let mut ctx = loaded(&["r1"]);
        let pointer = "/atomic:operations/1/data/attributes/amount";

        let dry = ctx.prepare(RoundTripKind::DryRun, 1).unwrap();
        let outcome = ctx
            .fail(&dry, &[ApiError::with_detail("bad amount").at(pointer)])
            .unwrap();
        let FailureOutcome::Recorded(errors) = outcome else {
            panic!("expected recorded errors");
        };
        assert!(errors[0].is_for_field("r1", "amount"));
        assert_eq!(ctx.internal_errors().len(), 1);
        assert!(ctx.displayed_errors().is_empty());

        let save = ctx.prepare(RoundTripKind::FullSave, 2).unwrap();
        let locking = ApiError {
            code: Some(diagnostics::OPTIMISTIC_LOCKING.into()),
            ..Default::default()
        };
        ctx.fail(&save, &[ApiError::with_detail("bad amount").at(pointer), locking])
            .unwrap();
        assert_eq!(ctx.internal_errors().len(), 2);
        assert_eq!(ctx.displayed_errors().len(), 1);
        assert!(ctx.has_version_conflict());
        assert!(!ctx.save_in_progress());
    }

    #[test]
    fn stale_failures_are_silent() {
        let mut ctx = loaded(&["r1"]);
        let first = ctx.prepare(RoundTripKind::DryRun, 1).unwrap();
        let _second = ctx.prepare(RoundTripKind::DryRun, 2).unwrap();

        assert_eq!(
            ctx.fail(&first, &[ApiError::with_detail("late")]),
            Ok(FailureOutcome::Superseded)
        );
        assert!(ctx.internal_errors().is_empty());
        assert_eq!(ctx.abort(&first), Ok(false));
    }

    #[test]
    fn released_save_stops_blocking_recalculations() {
        let mut ctx = loaded(&["r1"]);
        let save = ctx.prepare(RoundTripKind::FullSave, 1).unwrap();
        assert_eq!(ctx.prepare(RoundTripKind::DryRun, 2).unwrap_err(), Error::SaveInProgress);

        assert!(ctx.release(&save.round_trip));
        assert!(!ctx.save_in_progress());
        assert!(!ctx.release(&save.round_trip));

        let dry_run = ctx.prepare(RoundTripKind::DryRun, 3).unwrap();
        assert!(ctx.is_relevant(&dry_run));
    }

    #[test]
    fn reset_drops_everything_in_flight() {
        let mut ctx = loaded(&["r1"]);
        ctx.remove_child("o1", "rows", "r1").unwrap();
        let prepared = ctx.prepare(RoundTripKind::FullSave, 1).unwrap();

        let blank = Document::new(Entity::new("o1", "Order").with_child("rows", row("n1")));
        ctx.reset(blank.clone(), true).unwrap();
        assert!(ctx.is_new());
        assert!(ctx.changes().is_added("Row", "n1"));
        assert!(!ctx.save_in_progress());

        assert_eq!(ctx.apply_response(prepared, blank), Ok(ApplyOutcome::Superseded));
    }
}
