//! Mapping server validation errors back to entities.
//!
//! Errors are reported per operation through JSON pointers such as
//! `/atomic:operations/3/data/attributes/weight`. The operation index is
//! resolved against the batch that was sent, which is why batch order has to
//! be reproducible.

use crate::{EntityClass, EntityId, OperationBatch};
use serde::{Deserialize, Serialize};

/// Error code the server uses when auto-planning is impossible.
pub const AUTO_PLAN_NOT_POSSIBLE: &str = "auto-plan-not-possible";
/// Error code for a version conflict on the root.
pub const OPTIMISTIC_LOCKING: &str = "optimistic-locking";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pointer: Option<String>,
}

/// One error object as returned by the endpoints.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiError {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<ErrorSource>,
}

impl ApiError {
    pub fn with_detail(detail: impl Into<String>) -> Self {
        Self {
            detail: Some(detail.into()),
            ..Default::default()
        }
    }

    pub fn at(mut self, pointer: impl Into<String>) -> Self {
        self.source = Some(ErrorSource {
            pointer: Some(pointer.into()),
        });
        self
    }

    /// Human-readable message: detail, then title, then code.
    pub fn message(&self) -> String {
        self.detail
            .as_deref()
            .or(self.title.as_deref())
            .or(self.code.as_deref())
            .unwrap_or("Unknown error")
            .to_string()
    }

    fn pointer(&self) -> Option<&str> {
        self.source.as_ref()?.pointer.as_deref()
    }
}

/// Errors that concern the whole document rather than one field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SpecialError {
    AutoPlanNotPossible,
    OptimisticLocking,
}

/// An error resolved against the batch it was reported for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityError {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class: Option<EntityClass>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<EntityId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub special: Option<SpecialError>,
    pub message: String,
}

impl EntityError {
    pub fn is_for(&self, entity_id: &str) -> bool {
        self.entity_id.as_deref() == Some(entity_id)
    }

    pub fn is_for_field(&self, entity_id: &str, field: &str) -> bool {
        self.is_for(entity_id) && self.field.as_deref() == Some(field)
    }
}

/// The parts of an error pointer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PointerParts {
    pub operation_index: Option<usize>,
    pub field: Option<String>,
}

/// Parse an error pointer.
///
/// Accepted shapes:
///
/// - `/data/attributes/<field>`
/// - `/data/relationships/<field>/data`
/// - `/atomic:operations/<n>/data/attributes/<field>`
/// - `/atomic:operations/<n>/data/relationships/<field>/data`
/// - `/atomic:operations/<n>/<snake_case>_id`, which names a relationship
///   and is normalized to camelCase without the suffix
pub fn parse_pointer(pointer: &str) -> Option<PointerParts> {
    let rest = pointer.strip_prefix('/')?;
    let mut segments: Vec<&str> = rest.split('/').collect();

    let mut operation_index = None;
    if segments.first() == Some(&"atomic:operations") {
        operation_index = Some(segments.get(1)?.parse::<usize>().ok()?);
        segments.drain(..2);
    }

    let field = match segments.as_slice() {
        ["data", "attributes" | "relationships", field, ..] if !field.is_empty() => {
            Some(field.to_string())
        }
        [field, ..] if !field.is_empty() => Some(match field.strip_suffix("_id") {
            Some(base) => camelize(base),
            None => field.to_string(),
        }),
        _ => None,
    };

    Some(PointerParts {
        operation_index,
        field,
    })
}

fn camelize(snake: &str) -> String {
    let mut out = String::with_capacity(snake.len());
    let mut upper = false;
    for c in snake.chars() {
        if c == '_' {
            upper = true;
        } else if upper {
            out.extend(c.to_uppercase());
            upper = false;
        } else {
            out.push(c);
        }
    }
    out
}

/// Resolve endpoint errors against the batch that produced them.
pub fn resolve_errors(errors: &[ApiError], batch: &OperationBatch) -> Vec<EntityError> {
    errors.iter().map(|error| resolve(error, batch)).collect()
}

fn resolve(error: &ApiError, batch: &OperationBatch) -> EntityError {
    let special = match error.code.as_deref() {
        Some(AUTO_PLAN_NOT_POSSIBLE) => Some(SpecialError::AutoPlanNotPossible),
        Some(OPTIMISTIC_LOCKING) => Some(SpecialError::OptimisticLocking),
        _ => None,
    };

    let mut resolved = EntityError {
        class: None,
        resource_type: None,
        entity_id: None,
        field: None,
        code: error.code.clone(),
        special,
        message: error.message(),
    };

    let Some(parts) = error.pointer().and_then(parse_pointer) else {
        return resolved;
    };

    if let Some(index) = parts.operation_index {
        if let Some((class, id)) = batch.target(index) {
            resolved.class = Some(class.clone());
            resolved.entity_id = Some(id.clone());
            resolved.resource_type = batch
                .operations
                .get(index)
                .map(|op| op.resource_type().to_string());
        }
    }
    resolved.field = parts.field;

    resolved
}
