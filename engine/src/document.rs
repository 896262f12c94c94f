//! Document and entity types.
//!
//! A document is a tree of entities rooted at one aggregate. Every entity
//! carries a client-generated id that stays stable for its whole lifetime and
//! is the only key used to match entities across snapshots.

use crate::{EntityClass, EntityId, Version};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A to-one link to another entity.
///
/// The `kind` discriminator names the linked entity's type, so a polymorphic
/// link (one that may point at several kinds of entity) is the same value
/// with a different `kind`. It is resolved to a concrete type only by the
/// serializer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Reference {
    #[serde(rename = "type")]
    pub kind: String,
    pub id: EntityId,
}

impl Reference {
    pub fn new(kind: impl Into<String>, id: impl Into<EntityId>) -> Self {
        Self {
            kind: kind.into(),
            id: id.into(),
        }
    }
}

/// A node of the document tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    /// Client-generated, stable identity
    pub id: EntityId,
    /// Entity class this node belongs to
    pub class: EntityClass,
    /// Optimistic concurrency token, when the server issues one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<Version>,
    /// Plain fields
    #[serde(default)]
    pub scalars: BTreeMap<String, serde_json::Value>,
    /// To-one links
    #[serde(default)]
    pub references: BTreeMap<String, Option<Reference>>,
    /// Owned child entities, by collection name
    #[serde(default)]
    pub collections: BTreeMap<String, Vec<Entity>>,
}

impl Entity {
    /// Create an entity with no fields.
    pub fn new(id: impl Into<EntityId>, class: impl Into<EntityClass>) -> Self {
        Self {
            id: id.into(),
            class: class.into(),
            version: None,
            scalars: BTreeMap::new(),
            references: BTreeMap::new(),
            collections: BTreeMap::new(),
        }
    }

    /// Builder-style scalar assignment.
    pub fn with_scalar(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.scalars.insert(name.into(), value);
        self
    }

    /// Builder-style reference assignment.
    pub fn with_reference(mut self, name: impl Into<String>, reference: Option<Reference>) -> Self {
        self.references.insert(name.into(), reference);
        self
    }

    /// Builder-style child append.
    pub fn with_child(mut self, collection: impl Into<String>, child: Entity) -> Self {
        self.collections
            .entry(collection.into())
            .or_default()
            .push(child);
        self
    }

    /// Builder-style version assignment.
    pub fn with_version(mut self, version: impl Into<Version>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Get a scalar value.
    pub fn scalar(&self, name: &str) -> Option<&serde_json::Value> {
        self.scalars.get(name)
    }

    /// Get a reference value. `None` both when unset and when explicitly null.
    pub fn reference(&self, name: &str) -> Option<&Reference> {
        self.references.get(name).and_then(|r| r.as_ref())
    }

    /// Children of one collection (empty when the collection is absent).
    pub fn children(&self, collection: &str) -> &[Entity] {
        self.collections
            .get(collection)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Find a direct child by id.
    pub fn child(&self, collection: &str, id: &str) -> Option<&Entity> {
        self.children(collection).iter().find(|c| c.id == id)
    }

    /// Visit this entity and every descendant, depth-first, in document order.
    pub fn walk<'a>(&'a self, visit: &mut impl FnMut(&'a Entity)) {
        visit(self);
        for children in self.collections.values() {
            for child in children {
                child.walk(visit);
            }
        }
    }

    /// Ids of this entity and all its descendants, grouped by class.
    pub fn subtree_ids(&self) -> Vec<(EntityClass, EntityId)> {
        let mut ids = Vec::new();
        self.walk(&mut |e| ids.push((e.class.clone(), e.id.clone())));
        ids
    }

    fn find(&self, id: &str) -> Option<&Entity> {
        if self.id == id {
            return Some(self);
        }
        self.collections
            .values()
            .flat_map(|children| children.iter())
            .find_map(|child| child.find(id))
    }

    fn find_mut(&mut self, id: &str) -> Option<&mut Entity> {
        if self.id == id {
            return Some(self);
        }
        self.collections
            .values_mut()
            .flat_map(|children| children.iter_mut())
            .find_map(|child| child.find_mut(id))
    }
}

/// The root aggregate being edited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    pub root: Entity,
}

impl Document {
    /// Wrap a root entity.
    pub fn new(root: Entity) -> Self {
        Self { root }
    }

    /// The root id.
    pub fn id(&self) -> &EntityId {
        &self.root.id
    }

    /// Find any entity in the tree by id.
    pub fn find(&self, id: &str) -> Option<&Entity> {
        self.root.find(id)
    }

    /// Find any entity in the tree by id, mutably.
    pub fn find_mut(&mut self, id: &str) -> Option<&mut Entity> {
        self.root.find_mut(id)
    }

    /// Check whether an id exists anywhere in the tree.
    pub fn contains(&self, id: &str) -> bool {
        self.find(id).is_some()
    }

    /// All non-root entities of a class, flattened across their parents.
    pub fn entities_of_class(&self, class: &str) -> Vec<&Entity> {
        let mut found = Vec::new();
        for children in self.root.collections.values() {
            for child in children {
                child.walk(&mut |e| {
                    if e.class == class {
                        found.push(e);
                    }
                });
            }
        }
        found
    }

    /// Ids of all non-root entities of a class, in document order.
    pub fn ids_of_class(&self, class: &str) -> Vec<EntityId> {
        self.entities_of_class(class)
            .into_iter()
            .map(|e| e.id.clone())
            .collect()
    }

    /// Count entities in the tree, root included.
    pub fn entity_count(&self) -> usize {
        let mut count = 0;
        self.root.walk(&mut |_| count += 1);
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Document {
        let goods = Entity::new("goods-1", "GoodsRow")
            .with_scalar("weight", json!(120))
            .with_child("packages", Entity::new("pkg-1", "Package"))
            .with_child("packages", Entity::new("pkg-2", "Package"));
        let goods2 = Entity::new("goods-2", "GoodsRow")
            .with_child("packages", Entity::new("pkg-3", "Package"));

        Document::new(
            Entity::new("order-1", "CustomerOrder")
                .with_scalar("number", json!("A-100"))
                .with_reference("customer", Some(Reference::new("customers", "cust-1")))
                .with_child("goodsRows", goods)
                .with_child("goodsRows", goods2),
        )
    }

    #[test]
    fn find_nested_entity() {
        let doc = sample();
        assert_eq!(doc.find("pkg-2").unwrap().class, "Package");
        assert!(doc.find("missing").is_none());
        assert!(doc.contains("order-1"));
    }

    #[test]
    fn find_mut_edits_in_place() {
        let mut doc = sample();
        doc.find_mut("goods-2")
            .unwrap()
            .scalars
            .insert("weight".into(), json!(5));
        assert_eq!(doc.find("goods-2").unwrap().scalar("weight"), Some(&json!(5)));
    }

    #[test]
    fn class_lookup_flattens_across_parents() {
        let doc = sample();
        assert_eq!(doc.ids_of_class("Package"), vec!["pkg-1", "pkg-2", "pkg-3"]);
        assert_eq!(doc.ids_of_class("GoodsRow"), vec!["goods-1", "goods-2"]);
        assert!(doc.ids_of_class("CustomerOrder").is_empty());
    }

    #[test]
    fn entity_count_includes_root() {
        assert_eq!(sample().entity_count(), 6);
    }

    #[test]
    fn reference_accessor_treats_null_as_unset() {
        let entity = Entity::new("e", "Stop").with_reference("location", None);
        assert!(entity.reference("location").is_none());
        assert!(entity.references.contains_key("location"));
    }

    #[test]
    fn reference_serializes_with_type_discriminator() {
        let r = Reference::new("routes", "route-9");
        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(json, json!({"type": "routes", "id": "route-9"}));
    }

    #[test]
    fn serialization_roundtrip() {
        let doc = sample();
        let json = serde_json::to_string(&doc).unwrap();
        let parsed: Document = serde_json::from_str(&json).unwrap();
        assert_eq!(doc, parsed);
    }
}
