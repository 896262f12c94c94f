//! Dependency-ordered operation batches.
//!
//! A save or recalculation sends the whole document as one ordered list of
//! JSON:API atomic operations. The server runs them sequentially and checks
//! foreign keys at every step, so the order is part of the contract:
//!
//! 1. The root (create or update). Newly added deferred entities are left
//!    out of its payload because they do not exist yet.
//! 2. Every present entity, class by class in dependency order.
//! 3. Removals, class by class in reverse dependency order.
//! 4. Optionally the deferred collection, then a second root update that
//!    links it. The second update carries no version token.
//!
//! Validation errors come back indexed by operation, so the same inputs must
//! always produce the same list.

use crate::{
    error::Result, ChangeTracker, CollectionDef, Document, DocumentSchema, Entity, EntityClass,
    EntityId,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Identity of a resource on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceIdentifier {
    #[serde(rename = "type")]
    pub kind: String,
    pub id: EntityId,
}

impl ResourceIdentifier {
    pub fn new(kind: impl Into<String>, id: impl Into<EntityId>) -> Self {
        Self {
            kind: kind.into(),
            id: id.into(),
        }
    }
}

/// Relationship data: a single link or a list of links.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RelationshipData {
    ToMany(Vec<ResourceIdentifier>),
    ToOne(Option<ResourceIdentifier>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    pub data: RelationshipData,
}

impl Relationship {
    pub fn to_one(target: Option<ResourceIdentifier>) -> Self {
        Self {
            data: RelationshipData::ToOne(target),
        }
    }

    pub fn to_many(targets: Vec<ResourceIdentifier>) -> Self {
        Self {
            data: RelationshipData::ToMany(targets),
        }
    }

    /// Ids of every linked resource.
    pub fn ids(&self) -> Vec<&str> {
        match &self.data {
            RelationshipData::ToOne(target) => target.iter().map(|t| t.id.as_str()).collect(),
            RelationshipData::ToMany(targets) => targets.iter().map(|t| t.id.as_str()).collect(),
        }
    }
}

/// A full resource payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    #[serde(rename = "type")]
    pub kind: String,
    pub id: EntityId,
    #[serde(default)]
    pub attributes: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub relationships: BTreeMap<String, Relationship>,
}

impl Resource {
    pub fn identifier(&self) -> ResourceIdentifier {
        ResourceIdentifier::new(self.kind.clone(), self.id.clone())
    }
}

/// What an operation does to its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
}

/// One atomic operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum Operation {
    Add {
        data: Resource,
    },
    Update {
        data: Resource,
    },
    Remove {
        #[serde(rename = "ref")]
        target: ResourceIdentifier,
    },
}

impl Operation {
    /// Get the operation kind.
    pub fn kind(&self) -> OperationKind {
        match self {
            Operation::Add { .. } => OperationKind::Create,
            Operation::Update { .. } => OperationKind::Update,
            Operation::Remove { .. } => OperationKind::Delete,
        }
    }

    /// Get the resource type this operation targets.
    pub fn resource_type(&self) -> &str {
        match self {
            Operation::Add { data } | Operation::Update { data } => &data.kind,
            Operation::Remove { target } => &target.kind,
        }
    }

    /// Get the id this operation targets.
    pub fn id(&self) -> &EntityId {
        match self {
            Operation::Add { data } | Operation::Update { data } => &data.id,
            Operation::Remove { target } => &target.id,
        }
    }

    /// Get the payload, if any. Removals carry none.
    pub fn payload(&self) -> Option<&Resource> {
        match self {
            Operation::Add { data } | Operation::Update { data } => Some(data),
            Operation::Remove { .. } => None,
        }
    }
}

/// An ordered batch plus the bookkeeping needed to read its results.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationBatch {
    /// Operations in send order
    pub operations: Vec<Operation>,
    /// Entity class of each operation, parallel to `operations`
    pub classes: Vec<EntityClass>,
    /// Index of the first root operation, whose result holds the new root
    pub root_index: usize,
}

impl OperationBatch {
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Entity class and id targeted by the operation at `index`.
    pub fn target(&self, index: usize) -> Option<(&EntityClass, &EntityId)> {
        let op = self.operations.get(index)?;
        let class = self.classes.get(index)?;
        Some((class, op.id()))
    }

    fn push(&mut self, class: &str, operation: Operation) {
        self.classes.push(class.to_string());
        self.operations.push(operation);
    }
}

/// Options for one batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOptions {
    /// The root has never been saved
    pub root_is_new: bool,
    /// Save the deferred collection and re-link it with a second root update
    pub include_deferred: bool,
    /// Classes left out entirely (neither saved nor removed)
    pub exclude_classes: Vec<EntityClass>,
}

/// Builds operation batches from a document and its change sets.
#[derive(Debug, Clone, Copy)]
pub struct BatchBuilder<'a> {
    schema: &'a DocumentSchema,
}

/// A present entity together with the collection and owner it hangs off.
struct Placed<'d> {
    entity: &'d Entity,
    owner: &'d Entity,
    def: &'d CollectionDef,
}

impl<'a> BatchBuilder<'a> {
    pub fn new(schema: &'a DocumentSchema) -> Self {
        Self { schema }
    }

    /// Build the batch.
    pub fn build(
        &self,
        document: &Document,
        tracker: &ChangeTracker,
        options: &BatchOptions,
    ) -> Result<OperationBatch> {
        let mut batch = OperationBatch {
            operations: Vec::new(),
            classes: Vec::new(),
            root_index: 0,
        };

        let mut placed = BTreeMap::new();
        self.place_into(&document.root, &mut placed)?;
        let excluded = |class: &str| options.exclude_classes.iter().any(|c| c == class);
        let root_class = document.root.class.as_str();

        // 1. Root, without deferred entities that do not exist yet
        let first_root = self.root_resource(&document.root, tracker, false, true)?;
        batch.root_index = batch.len();
        batch.push(
            root_class,
            if options.root_is_new {
                Operation::Add { data: first_root }
            } else {
                Operation::Update { data: first_root }
            },
        );

        // 2. Saves in dependency order
        for class in &self.schema.dependency_order {
            if excluded(class) {
                continue;
            }
            for item in placed.get(class.as_str()).into_iter().flatten() {
                let op = self.save_operation(item, tracker)?;
                batch.push(class, op);
            }
        }

        // 3. Removals in reverse dependency order
        for class in self.schema.dependency_order.iter().rev() {
            if excluded(class) {
                continue;
            }
            let kind = self.schema.resource_type(class)?;
            if let Some(set) = tracker.get(class) {
                for id in &set.removed_ids {
                    batch.push(
                        class,
                        Operation::Remove {
                            target: ResourceIdentifier::new(kind, id.clone()),
                        },
                    );
                }
            }
        }

        // 4. Deferred collection, then re-link it on the root
        if options.include_deferred {
            if let Some(deferred) = &self.schema.deferred {
                for item in placed.get(deferred.class.as_str()).into_iter().flatten() {
                    let op = self.save_operation(item, tracker)?;
                    batch.push(&deferred.class, op);
                }
                // Removed deferred entities are only unlinked, never deleted.
                let second_root = self.root_resource(&document.root, tracker, true, false)?;
                batch.push(root_class, Operation::Update { data: second_root });
            }
        }

        Ok(batch)
    }

    /// Group every non-root entity by class, in document order.
    fn place_into<'d>(
        &self,
        owner: &'d Entity,
        placed: &mut BTreeMap<&'d str, Vec<Placed<'d>>>,
    ) -> Result<()>
    where
        'a: 'd,
    {
        let declaration = self.schema.entity(&owner.class)?;
        for def in &declaration.collections {
            for child in owner.children(&def.name) {
                placed.entry(def.class.as_str()).or_default().push(Placed {
                    entity: child,
                    owner,
                    def,
                });
                self.place_into(child, placed)?;
            }
        }
        Ok(())
    }

    fn save_operation(&self, item: &Placed<'_>, tracker: &ChangeTracker) -> Result<Operation> {
        let mut data = self.resource(item.entity)?;
        if let Some(inverse) = &item.def.inverse {
            let owner_kind = self.schema.resource_type(&item.owner.class)?;
            data.relationships.insert(
                inverse.clone(),
                Relationship::to_one(Some(ResourceIdentifier::new(
                    owner_kind,
                    item.owner.id.clone(),
                ))),
            );
        }

        Ok(if tracker.is_added(&item.entity.class, &item.entity.id) {
            Operation::Add { data }
        } else {
            Operation::Update { data }
        })
    }

    /// Payload for any entity: declared scalars and references, plus the id
    /// lists of collections whose children do not link back to their owner.
    fn resource(&self, entity: &Entity) -> Result<Resource> {
        let declaration = self.schema.entity(&entity.class)?;

        let attributes = declaration
            .scalar_fields
            .iter()
            .filter_map(|f| entity.scalars.get(f).map(|v| (f.clone(), v.clone())))
            .collect();

        let mut relationships = BTreeMap::new();
        for field in &declaration.reference_fields {
            let Some(link) = entity.references.get(field) else {
                continue;
            };
            let target = link
                .as_ref()
                .map(|r| ResourceIdentifier::new(r.kind.clone(), r.id.clone()));
            relationships.insert(field.clone(), Relationship::to_one(target));
        }
        for def in declaration.collections.iter().filter(|d| d.inverse.is_none()) {
            let kind = self.schema.resource_type(&def.class)?;
            let targets = entity
                .children(&def.name)
                .iter()
                .map(|c| ResourceIdentifier::new(kind, c.id.clone()))
                .collect();
            relationships.insert(def.name.clone(), Relationship::to_many(targets));
        }

        Ok(Resource {
            kind: declaration.resource_type.clone(),
            id: entity.id.clone(),
            attributes,
            relationships,
        })
    }

    fn root_resource(
        &self,
        root: &Entity,
        tracker: &ChangeTracker,
        include_new_deferred: bool,
        with_version: bool,
    ) -> Result<Resource> {
        let mut data = self.resource(root)?;

        if !include_new_deferred {
            if let Some(deferred) = &self.schema.deferred {
                let declaration = self.schema.entity(&root.class)?;
                for def in declaration
                    .collections
                    .iter()
                    .filter(|d| d.class == deferred.class)
                {
                    if let Some(Relationship {
                        data: RelationshipData::ToMany(targets),
                    }) = data.relationships.get_mut(&def.name)
                    {
                        targets.retain(|t| !tracker.is_added(&deferred.class, &t.id));
                    }
                }
            }
        }

        if with_version {
            if let Some(version) = &root.version {
                data.attributes
                    .insert("version".into(), serde_json::Value::String(version.clone()));
            }
        }

        Ok(data)
    }
}
