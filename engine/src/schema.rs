//! Schema declaration and validation.
//!
//! Each entity class declares its scalar fields, reference fields and owned
//! collections explicitly. The merge, delta and batch code is generic and
//! walks documents through this declaration instead of inspecting values.

use crate::{error::Result, Document, Entity, EntityClass, Error};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// An owned to-many relationship.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionDef {
    /// Field name on the owner
    pub name: String,
    /// Class of every child in the collection
    pub class: EntityClass,
    /// Relationship on the child pointing back at the owner
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inverse: Option<String>,
}

impl CollectionDef {
    pub fn new(name: impl Into<String>, class: impl Into<EntityClass>) -> Self {
        Self {
            name: name.into(),
            class: class.into(),
            inverse: None,
        }
    }

    /// Declare the child's back-reference to its owner.
    pub fn with_inverse(mut self, inverse: impl Into<String>) -> Self {
        self.inverse = Some(inverse.into());
        self
    }
}

/// Declaration of one entity class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntitySchema {
    /// Class name, used as the change tracking key
    pub class: EntityClass,
    /// Resource type used on the wire
    pub resource_type: String,
    /// Plain fields
    pub scalar_fields: Vec<String>,
    /// To-one links
    pub reference_fields: Vec<String>,
    /// Owned to-many relationships
    pub collections: Vec<CollectionDef>,
    /// References cleared whenever the keyed reference changes
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub dependents: BTreeMap<String, Vec<String>>,
}

impl EntitySchema {
    /// Create a class declaration with no fields.
    pub fn new(class: impl Into<EntityClass>, resource_type: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            resource_type: resource_type.into(),
            scalar_fields: Vec::new(),
            reference_fields: Vec::new(),
            collections: Vec::new(),
            dependents: BTreeMap::new(),
        }
    }

    pub fn scalars<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scalar_fields.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn references<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.reference_fields.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn collection(mut self, def: CollectionDef) -> Self {
        self.collections.push(def);
        self
    }

    /// Declare references that depend on `reference`, e.g. a contact that is
    /// only valid for the selected customer.
    pub fn dependents<I, S>(mut self, reference: impl Into<String>, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependents
            .entry(reference.into())
            .or_default()
            .extend(names.into_iter().map(Into::into));
        self
    }

    /// References to clear when `reference` changes.
    pub fn dependents_of(&self, reference: &str) -> &[String] {
        self.dependents
            .get(reference)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Look up a collection declaration by field name.
    pub fn get_collection(&self, name: &str) -> Option<&CollectionDef> {
        self.collections.iter().find(|c| c.name == name)
    }

    pub fn has_scalar(&self, name: &str) -> bool {
        self.scalar_fields.iter().any(|f| f == name)
    }

    pub fn has_reference(&self, name: &str) -> bool {
        self.reference_fields.iter().any(|f| f == name)
    }
}

/// A collection that can only be saved after the root exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeferredCollection {
    /// Class of the deferred entities
    pub class: EntityClass,
    /// Boolean root scalar that switches deferral on. Always on when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled_by: Option<String>,
}

/// Schema for a whole document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentSchema {
    /// Class of the root entity
    pub root_class: EntityClass,
    /// Entity declarations by class
    pub entities: BTreeMap<EntityClass, EntitySchema>,
    /// Save order: owners and referenced classes strictly first
    pub dependency_order: Vec<EntityClass>,
    /// Collection saved after the root, followed by a second root update
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deferred: Option<DeferredCollection>,
    /// Classes left out of dry runs entirely
    #[serde(default)]
    pub dry_run_excluded: Vec<EntityClass>,
}

impl DocumentSchema {
    /// Create a schema around a root declaration.
    pub fn new(root: EntitySchema) -> Self {
        let root_class = root.class.clone();
        let mut entities = BTreeMap::new();
        entities.insert(root_class.clone(), root);
        Self {
            root_class,
            entities,
            dependency_order: Vec::new(),
            deferred: None,
            dry_run_excluded: Vec::new(),
        }
    }

    /// Declare a child class. Classes are saved in the order they are added.
    pub fn with_entity(mut self, entity: EntitySchema) -> Self {
        self.dependency_order.push(entity.class.clone());
        self.entities.insert(entity.class.clone(), entity);
        self
    }

    /// Declare the deferred class. It is not part of the dependency order.
    pub fn with_deferred(mut self, entity: EntitySchema, enabled_by: Option<&str>) -> Self {
        self.deferred = Some(DeferredCollection {
            class: entity.class.clone(),
            enabled_by: enabled_by.map(str::to_string),
        });
        self.entities.insert(entity.class.clone(), entity);
        self
    }

    /// Exclude a class from dry runs.
    pub fn excluding_from_dry_runs(mut self, class: impl Into<EntityClass>) -> Self {
        self.dry_run_excluded.push(class.into());
        self
    }

    /// Get a class declaration.
    pub fn entity(&self, class: &str) -> Result<&EntitySchema> {
        self.entities
            .get(class)
            .ok_or_else(|| Error::UndeclaredClass(class.to_string()))
    }

    /// The root declaration.
    pub fn root(&self) -> Result<&EntitySchema> {
        self.entity(&self.root_class)
    }

    /// Every class that lives in some collection, i.e. every class with a
    /// change set.
    pub fn tracked_classes(&self) -> Vec<EntityClass> {
        let mut classes: Vec<EntityClass> = self.dependency_order.clone();
        if let Some(deferred) = &self.deferred {
            classes.push(deferred.class.clone());
        }
        classes
    }

    pub fn is_deferred(&self, class: &str) -> bool {
        self.deferred.as_ref().is_some_and(|d| d.class == class)
    }

    pub fn is_dry_run_excluded(&self, class: &str) -> bool {
        self.dry_run_excluded.iter().any(|c| c == class)
    }

    /// Resource type for a class.
    pub fn resource_type(&self, class: &str) -> Result<&str> {
        Ok(self.entity(class)?.resource_type.as_str())
    }

    /// Check that the declaration is internally consistent.
    pub fn validate(&self) -> Result<()> {
        self.root()?;

        let mut seen = HashSet::new();
        for class in &self.dependency_order {
            if !seen.insert(class.as_str()) {
                return Err(Error::DuplicateOrderEntry(class.clone()));
            }
        }

        let position = |class: &str| self.dependency_order.iter().position(|c| c == class);

        for owner in self.entities.values() {
            for (reference, dependents) in &owner.dependents {
                for field in std::iter::once(reference).chain(dependents) {
                    if !owner.has_reference(field) {
                        return Err(Error::UnknownField {
                            class: owner.class.clone(),
                            field: field.clone(),
                        });
                    }
                }
            }

            for def in &owner.collections {
                self.entity(&def.class)?;

                if self.is_deferred(&def.class) {
                    continue;
                }
                let child_pos =
                    position(&def.class).ok_or_else(|| Error::UnorderedClass(def.class.clone()))?;

                // Owners that are themselves ordered must be saved first.
                if let Some(owner_pos) = position(&owner.class) {
                    if child_pos < owner_pos {
                        return Err(Error::ChildBeforeOwner {
                            owner: owner.class.clone(),
                            child: def.class.clone(),
                        });
                    }
                }
            }
        }

        Ok(())
    }

    /// Check that a document matches this schema.
    ///
    /// Every collection child must have the declared class and ids must be
    /// unique across the whole tree.
    pub fn validate_document(&self, document: &Document) -> Result<()> {
        if document.root.class != self.root_class {
            return Err(Error::ClassMismatch {
                collection: "<root>".into(),
                expected: self.root_class.clone(),
                got: document.root.class.clone(),
            });
        }

        let mut ids = HashSet::new();
        self.validate_entity(&document.root, &mut ids)
    }

    fn validate_entity<'a>(&self, entity: &'a Entity, ids: &mut HashSet<&'a str>) -> Result<()> {
        if !ids.insert(entity.id.as_str()) {
            return Err(Error::DuplicateEntity(entity.id.clone()));
        }

        let declaration = self.entity(&entity.class)?;
        for (name, children) in &entity.collections {
            let def =
                declaration
                    .get_collection(name)
                    .ok_or_else(|| Error::UnknownCollection {
                        class: entity.class.clone(),
                        collection: name.clone(),
                    })?;

            for child in children {
                if child.class != def.class {
                    return Err(Error::ClassMismatch {
                        collection: name.clone(),
                        expected: def.class.clone(),
                        got: child.class.clone(),
                    });
                }
                self.validate_entity(child, ids)?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_schema() -> DocumentSchema {
        DocumentSchema::new(
            EntitySchema::new("Order", "orders")
                .scalars(["number", "isTemplate"])
                .references(["customer"])
                .collection(CollectionDef::new("rows", "Row").with_inverse("order"))
                .collection(CollectionDef::new("entries", "Entry")),
        )
        .with_entity(
            EntitySchema::new("Row", "rows")
                .scalars(["amount"])
                .collection(CollectionDef::new("parts", "Part").with_inverse("row")),
        )
        .with_entity(EntitySchema::new("Part", "parts").scalars(["size"]))
        .with_deferred(EntitySchema::new("Entry", "entries"), Some("isTemplate"))
    }

    #[test]
    fn valid_schema() {
        assert!(test_schema().validate().is_ok());
    }

    #[test]
    fn tracked_classes_include_deferred() {
        assert_eq!(test_schema().tracked_classes(), vec!["Row", "Part", "Entry"]);
    }

    #[test]
    fn unordered_class_rejected() {
        let mut schema = test_schema();
        schema.dependency_order.retain(|c| c != "Part");
        assert!(matches!(schema.validate(), Err(Error::UnorderedClass(c)) if c == "Part"));
    }

    #[test]
    fn child_before_owner_rejected() {
        let mut schema = test_schema();
        schema.dependency_order = vec!["Part".into(), "Row".into()];
        assert!(matches!(
            schema.validate(),
            Err(Error::ChildBeforeOwner { owner, child }) if owner == "Row" && child == "Part"
        ));
    }

    #[test]
    fn duplicate_order_entry_rejected() {
        let mut schema = test_schema();
        schema.dependency_order.push("Row".into());
        assert!(matches!(schema.validate(), Err(Error::DuplicateOrderEntry(_))));
    }

    #[test]
    fn undeclared_child_class_rejected() {
        let schema = DocumentSchema::new(
            EntitySchema::new("Order", "orders").collection(CollectionDef::new("rows", "Row")),
        );
        assert!(matches!(schema.validate(), Err(Error::UndeclaredClass(c)) if c == "Row"));
    }

    #[test]
    fn dependents_must_be_declared_references() {
        let mut schema = test_schema();
        schema.entities.insert(
            "Order".into(),
            schema.entities["Order"].clone().dependents("customer", ["contact"]),
        );
        assert!(matches!(
            schema.validate(),
            Err(Error::UnknownField { field, .. }) if field == "contact"
        ));

        let order = schema.entities["Order"].clone().references(["contact"]);
        assert_eq!(order.dependents_of("customer"), ["contact".to_string()]);
        assert!(order.dependents_of("contact").is_empty());
        schema.entities.insert("Order".into(), order);
        assert!(schema.validate().is_ok());
    }

    #[test]
    fn document_class_mismatch() {
        let schema = test_schema();
        let doc = Document::new(
            Entity::new("o", "Order").with_child("rows", Entity::new("p", "Part")),
        );
        assert!(matches!(
            schema.validate_document(&doc),
            Err(Error::ClassMismatch { expected, .. }) if expected == "Row"
        ));
    }

    #[test]
    fn document_duplicate_ids() {
        let schema = test_schema();
        let doc = Document::new(
            Entity::new("o", "Order")
                .with_child("rows", Entity::new("r1", "Row"))
                .with_child(
                    "rows",
                    Entity::new("r2", "Row").with_child("parts", Entity::new("r1", "Part")),
                ),
        );
        assert!(matches!(
            schema.validate_document(&doc),
            Err(Error::DuplicateEntity(id)) if id == "r1"
        ));
    }

    #[test]
    fn document_unknown_collection() {
        let schema = test_schema();
        let doc = Document::new(
            Entity::new("o", "Order")
                .with_scalar("number", json!("1"))
                .with_child("notes", Entity::new("n1", "Row")),
        );
        assert!(matches!(
            schema.validate_document(&doc),
            Err(Error::UnknownCollection { collection, .. }) if collection == "notes"
        ));
    }

    #[test]
    fn schema_serialization() {
        let schema = test_schema();
        let json = serde_json::to_string(&schema).unwrap();
        let parsed: DocumentSchema = serde_json::from_str(&json).unwrap();
        assert_eq!(schema, parsed);
    }
}
