//! Snapshots of an unsaved draft.
//!
//! A snapshot captures what is needed to resume editing later: the document,
//! its change sets and whether the root was ever saved. Round trips in flight
//! are not part of it; their responses are meaningless after a restore.
//! Everything keyed is a `BTreeMap`, so serialization is deterministic.

use crate::{
    error::Result, ChangeTracker, Document, DocumentSchema, EntityClass, Error,
    ReconciliationContext,
};
use serde::{Deserialize, Serialize};

/// Version of the snapshot format for future compatibility.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// A point-in-time snapshot of one context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextSnapshot {
    /// Snapshot format version
    pub format_version: u32,
    /// Root class the snapshot was taken for
    pub root_class: EntityClass,
    /// Whether the root has never been saved
    pub is_new: bool,
    /// The live document
    pub document: Document,
    /// Change sets by class
    pub changes: ChangeTracker,
}

impl ContextSnapshot {
    /// Snapshot a context.
    pub fn capture(context: &ReconciliationContext) -> Self {
        Self {
            format_version: SNAPSHOT_FORMAT_VERSION,
            root_class: context.schema().root_class.clone(),
            is_new: context.is_new(),
            document: context.document().clone(),
            changes: context.changes().clone(),
        }
    }

    /// Check the snapshot against a schema.
    pub fn validate(&self, schema: &DocumentSchema) -> Result<()> {
        if self.root_class != schema.root_class {
            return Err(Error::InvalidSnapshot(format!(
                "snapshot is for root class {}, schema expects {}",
                self.root_class, schema.root_class
            )));
        }
        if !self.changes.is_consistent() {
            return Err(Error::InvalidSnapshot(
                "an id is both added and removed".into(),
            ));
        }
        schema.validate_document(&self.document)
    }

    /// Serialize to JSON with deterministic ordering.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }

    /// Serialize to pretty JSON with deterministic ordering.
    pub fn to_json_pretty(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }

    /// Deserialize from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        let snapshot: Self =
            serde_json::from_str(json).map_err(|e| Error::InvalidSnapshot(e.to_string()))?;

        if snapshot.format_version > SNAPSHOT_FORMAT_VERSION {
            return Err(Error::InvalidSnapshot(format!(
                "unsupported snapshot format version: {} (max supported: {})",
                snapshot.format_version, SNAPSHOT_FORMAT_VERSION
            )));
        }

        Ok(snapshot)
    }
}

impl ReconciliationContext {
    /// Export the resumable state.
    pub fn snapshot(&self) -> ContextSnapshot {
        ContextSnapshot::capture(self)
    }

    /// Rebuild a context from a snapshot. The guard starts fresh.
    pub fn restore(schema: DocumentSchema, snapshot: ContextSnapshot) -> Result<Self> {
        snapshot.validate(&schema)?;
        Self::build(schema, snapshot.document, snapshot.changes, snapshot.is_new)
    }
}
