//! Three-way merge of a server replacement into the live document.
//!
//! While a round trip is in flight the user keeps editing. When the response
//! arrives there are three versions of the document:
//!
//! - `original`: the state the request was built from
//! - `current`: the live state, possibly edited since
//! - `replacement`: the server's recalculated state
//!
//! # Algorithm
//!
//! Starting from `replacement`, for every entity present in all three
//! versions (matched by id, never by position):
//!
//! 1. Scalars and references the user changed since the request
//!    (`current != original`) take the user's value.
//! 2. Everything else keeps the server's value.
//! 3. Collections recurse into matched children. Children the server dropped
//!    stay dropped, children the server added are kept untouched.
//!
//! A user edit always beats a server value computed in the same round. The
//! edited field triggers its own round trip, which recomputes it correctly.

use crate::{
    error::Result, Document, DocumentSchema, Entity, EntityClass, EntityId, Error,
};
use serde::{Deserialize, Serialize};

/// Options for one merge.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeOptions {
    /// Collections of these classes are taken from `original` instead of the
    /// replacement, because the server never received them.
    pub preserve_classes: Vec<EntityClass>,
}

impl MergeOptions {
    pub fn preserving(classes: impl IntoIterator<Item = EntityClass>) -> Self {
        Self {
            preserve_classes: classes.into_iter().collect(),
        }
    }

    fn preserves(&self, class: &str) -> bool {
        self.preserve_classes.iter().any(|c| c == class)
    }
}

/// A field on a specific entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldPath {
    pub entity_id: EntityId,
    pub field: String,
}

/// Result of a merge.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    /// The merged document
    pub document: Document,
    /// Fields where the server recalculated a value but the user's edit won
    pub overridden: Vec<FieldPath>,
    /// Children added by the user while the request was in flight. They are
    /// not part of the merged document.
    pub skipped_additions: Vec<EntityId>,
}

/// Merges server replacements using a schema declaration.
#[derive(Debug, Clone, Copy)]
pub struct ReplacementMerger<'a> {
    schema: &'a DocumentSchema,
}

impl<'a> ReplacementMerger<'a> {
    /// Create a merger for a schema.
    pub fn new(schema: &'a DocumentSchema) -> Self {
        Self { schema }
    }

    /// Merge `replacement` against `current` using `original` as the base.
    pub fn merge(
        &self,
        original: &Document,
        current: &Document,
        replacement: Document,
        options: &MergeOptions,
    ) -> Result<MergeOutcome> {
        for other in [current.id(), replacement.id()] {
            if other != original.id() {
                return Err(Error::RootMismatch {
                    expected: original.id().clone(),
                    actual: other.clone(),
                });
            }
        }

        let mut outcome = MergeOutcome {
            document: replacement,
            overridden: Vec::new(),
            skipped_additions: Vec::new(),
        };

        let mut root = std::mem::replace(
            &mut outcome.document.root,
            Entity::new(String::new(), String::new()),
        );
        let merged = self.merge_entity(&original.root, &current.root, &mut root, options, &mut outcome);
        outcome.document.root = root;
        merged?;

        Ok(outcome)
    }

    fn merge_entity(
        &self,
        original: &Entity,
        current: &Entity,
        replacement: &mut Entity,
        options: &MergeOptions,
        outcome: &mut MergeOutcome,
    ) -> Result<()> {
        let declaration = self.schema.entity(&current.class)?;

        for field in &declaration.scalar_fields {
            let before = original.scalars.get(field);
            let edited = current.scalars.get(field);
            if before == edited {
                continue;
            }
            let server = replacement.scalars.get(field);
            if server != before && server != edited {
                outcome.overridden.push(FieldPath {
                    entity_id: current.id.clone(),
                    field: field.clone(),
                });
            }
            match edited {
                Some(value) => {
                    replacement.scalars.insert(field.clone(), value.clone());
                }
                None => {
                    replacement.scalars.remove(field);
                }
            }
        }

        for field in &declaration.reference_fields {
            let before = original.references.get(field);
            let edited = current.references.get(field);
            if before == edited {
                continue;
            }
            let server = replacement.references.get(field);
            if server != before && server != edited {
                outcome.overridden.push(FieldPath {
                    entity_id: current.id.clone(),
                    field: field.clone(),
                });
            }
            match edited {
                Some(value) => {
                    replacement.references.insert(field.clone(), value.clone());
                }
                None => {
                    replacement.references.remove(field);
                }
            }
        }

        for def in &declaration.collections {
            if options.preserves(&def.class) {
                replacement
                    .collections
                    .insert(def.name.clone(), original.children(&def.name).to_vec());
            }

            for current_child in current.children(&def.name) {
                let Some(original_child) = original.child(&def.name, &current_child.id) else {
                    // Added during the round trip. A structural edit triggers
                    // its own round trip, so this only happens if that
                    // contract was broken.
                    outcome.skipped_additions.push(current_child.id.clone());
                    continue;
                };

                let Some(replacement_child) = replacement
                    .collections
                    .get_mut(&def.name)
                    .and_then(|children| children.iter_mut().find(|c| c.id == current_child.id))
                else {
                    // Removed by the server.
                    continue;
                };

                self.merge_entity(original_child, current_child, replacement_child, options, outcome)?;
            }
        }

        Ok(())
    }
}
