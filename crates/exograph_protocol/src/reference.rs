//! Wire identity of entities.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A reference to an entity as it travels on the wire.
///
/// Serialized as `{"type": "...", "id": "..."}` with an optional
/// `"isNew": true` when the entity has not been persisted yet.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    /// Fully-qualified type name.
    #[serde(rename = "type")]
    pub type_name: String,
    /// Entity id (client-assigned or server-assigned).
    pub id: String,
    /// Whether the entity has not been persisted yet.
    #[serde(rename = "isNew", default, skip_serializing_if = "is_false")]
    pub is_new: bool,
}

fn is_false(value: &bool) -> bool {
    !*value
}

impl EntityRef {
    /// Creates a reference to a persisted entity.
    pub fn new(type_name: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            id: id.into(),
            is_new: false,
        }
    }

    /// Creates a reference to an entity that has not been persisted yet.
    pub fn new_instance(type_name: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            id: id.into(),
            is_new: true,
        }
    }

    /// Returns true if both references name the same type and id,
    /// ignoring the `isNew` marker.
    pub fn same_entity(&self, other: &EntityRef) -> bool {
        self.type_name == other.type_name && self.id == other.id
    }

    /// Returns the `type|id` key used by keyed registries.
    pub fn key(&self) -> String {
        format!("{}|{}", self.type_name, self.id)
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.type_name, self.id)
    }
}

/// A server-assigned identity replacing a client-assigned one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdChange {
    /// Type name of the entity.
    #[serde(rename = "type")]
    pub type_name: String,
    /// Id the entity had before the save.
    #[serde(rename = "oldId")]
    pub old_id: String,
    /// Persisted id assigned by the server.
    #[serde(rename = "newId")]
    pub new_id: String,
}

impl IdChange {
    /// Creates a new id change.
    pub fn new(
        type_name: impl Into<String>,
        old_id: impl Into<String>,
        new_id: impl Into<String>,
    ) -> Self {
        Self {
            type_name: type_name.into(),
            old_id: old_id.into(),
            new_id: new_id.into(),
        }
    }
}

/// An item of a list change on the wire.
///
/// Entity items are sent as references; primitive items pass through
/// as plain JSON values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WireItem {
    /// An entity reference.
    Entity(EntityRef),
    /// A primitive value.
    Value(serde_json::Value),
}

impl WireItem {
    /// Returns the entity reference, if this item is one.
    pub fn as_entity(&self) -> Option<&EntityRef> {
        match self {
            WireItem::Entity(r) => Some(r),
            WireItem::Value(_) => None,
        }
    }
}

impl From<EntityRef> for WireItem {
    fn from(r: EntityRef) -> Self {
        WireItem::Entity(r)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn entity_ref_wire_form() {
        let r = EntityRef::new("Car", "5");
        assert_eq!(serde_json::to_value(&r).unwrap(), json!({"type": "Car", "id": "5"}));

        let n = EntityRef::new_instance("Driver", "+c0");
        assert_eq!(
            serde_json::to_value(&n).unwrap(),
            json!({"type": "Driver", "id": "+c0", "isNew": true})
        );
    }

    #[test]
    fn same_entity_ignores_new_marker() {
        let a = EntityRef::new("Driver", "+c0");
        let b = EntityRef::new_instance("Driver", "+c0");
        assert!(a.same_entity(&b));
        assert_ne!(a, b);
        assert_eq!(a.key(), "Driver|+c0");
    }

    #[test]
    fn id_change_field_names() {
        let change: IdChange =
            serde_json::from_value(json!({"type": "Driver", "oldId": "+c0", "newId": "100"}))
                .unwrap();
        assert_eq!(change, IdChange::new("Driver", "+c0", "100"));
    }

    #[test]
    fn wire_items_distinguish_entities_from_values() {
        let items: Vec<WireItem> =
            serde_json::from_value(json!([{"type": "Car", "id": "5"}, 42, "text"])).unwrap();
        assert_eq!(items[0].as_entity(), Some(&EntityRef::new("Car", "5")));
        assert_eq!(items[1], WireItem::Value(json!(42)));
        assert!(items[2].as_entity().is_none());
    }
}
