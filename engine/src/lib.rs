//! # Draftline Engine
//!
//! Optimistic reconciliation of documents that a server recalculates while
//! the user keeps editing them.
//!
//! The user edits a deeply nested document (an order with stops, rows,
//! goods and packages). Every edit is sent to a remote engine, which
//! recalculates derived values and may add or remove nested entities on its
//! own. Responses arrive asynchronously and out of order. This crate keeps
//! the local document consistent under that traffic and produces the
//! dependency-ordered operation batch for every round trip.
//!
//! ## Design Principles
//!
//! - **No IO**: the engine never touches the network; callers send batches
//! - **Deterministic**: same inputs, same batch, same merge
//! - **Explicit state**: one [`ReconciliationContext`] per edited document
//!
//! ## Core Concepts
//!
//! ### Change tracking
//!
//! A [`ChangeTracker`] records which entities of each class were added or
//! removed locally since the last full save. It decides create vs update and
//! which deletes are sent.
//!
//! ### Three-way merge
//!
//! The [`ReplacementMerger`] reconciles the request's base snapshot, the
//! live document and the server's replacement. User edits made while the
//! request was in flight win; everything else takes the server's value.
//!
//! ### Operation batches
//!
//! The [`BatchBuilder`] emits JSON:API atomic operations: root first,
//! saves in dependency order, removals in reverse, then the deferred
//! collection with a second root update.
//!
//! ### Staleness
//!
//! The [`StalenessGuard`] stamps every round trip from one sequence and drops
//! responses that a newer request has superseded.
//!
//! ## Quick Start
//!
//! ```rust
//! use draftline_engine::{
//!     CollectionDef, Document, DocumentSchema, Entity, EntitySchema, ApplyOutcome,
//!     ReconciliationContext, RoundTripKind,
//! };
//! use serde_json::json;
//!
//! // 1. Declare the document shape
//! let schema = DocumentSchema::new(
//!     EntitySchema::new("Order", "orders")
//!         .scalars(["total"])
//!         .collection(CollectionDef::new("rows", "Row").with_inverse("order")),
//! )
//! .with_entity(EntitySchema::new("Row", "rows").scalars(["amount"]));
//!
//! // 2. Start editing a loaded document
//! let doc = Document::new(Entity::new("order-1", "Order"));
//! let mut ctx = ReconciliationContext::loaded(schema, doc).unwrap();
//! ctx.insert_child("order-1", "rows", Entity::new("row-1", "Row")).unwrap();
//!
//! // 3. Build the request
//! let prepared = ctx.prepare(RoundTripKind::DryRun, 1_706_745_600_000).unwrap();
//! assert_eq!(prepared.batch.len(), 2);
//!
//! // 4. Apply the server's recalculated document
//! let replacement = Document::new(
//!     Entity::new("order-1", "Order")
//!         .with_scalar("total", json!(10))
//!         .with_child("rows", Entity::new("row-1", "Row").with_scalar("amount", json!(10))),
//! );
//! let outcome = ctx.apply_response(prepared, replacement).unwrap();
//! assert!(matches!(outcome, ApplyOutcome::Applied(_)));
//! assert_eq!(ctx.document().root.scalar("total"), Some(&json!(10)));
//! ```
//!
//! ## Persistence
//!
//! Use [`ReconciliationContext::snapshot`] and
//! [`ReconciliationContext::restore`] with [`ContextSnapshot`] to keep an
//! unsaved draft. Snapshots serialize to JSON with deterministic ordering.

pub mod batch;
pub mod changes;
pub mod context;
pub mod delta;
pub mod diagnostics;
pub mod document;
pub mod error;
pub mod merge;
pub mod presets;
pub mod schema;
pub mod snapshot;
pub mod staleness;

// Re-export main types at crate root
pub use batch::{
    BatchBuilder, BatchOptions, Operation, OperationBatch, OperationKind, Relationship,
    RelationshipData, Resource, ResourceIdentifier,
};
pub use changes::{ChangeSet, ChangeTracker};
pub use context::{
    AppliedResponse, ApplyOutcome, EditEffect, FailureOutcome, PreparedRoundTrip,
    ReconciliationContext,
};
pub use diagnostics::{resolve_errors, ApiError, EntityError, ErrorSource, SpecialError};
pub use document::{Document, Entity, Reference};
pub use error::{Error, Result};
pub use merge::{FieldPath, MergeOptions, MergeOutcome, ReplacementMerger};
pub use schema::{CollectionDef, DeferredCollection, DocumentSchema, EntitySchema};
pub use snapshot::{ContextSnapshot, SNAPSHOT_FORMAT_VERSION};
pub use staleness::{RoundTrip, RoundTripKind, RoundTripPhase, Settlement, StalenessGuard};

/// Type aliases for clarity
pub type EntityId = String;
pub type EntityClass = String;
pub type Version = String;
pub type Timestamp = u64;
