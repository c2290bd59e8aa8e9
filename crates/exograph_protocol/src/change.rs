//! Change records.

use crate::reference::{EntityRef, IdChange, WireItem};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Discriminant of a [`ChangeRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    /// A new entity was created.
    InitNew,
    /// An entity-typed property was assigned.
    ReferenceChange,
    /// A primitive-typed property was assigned.
    ValueChange,
    /// Items were added to or removed from a list property.
    ListChange,
    /// The server persisted entities and reassigned their ids.
    Save,
}

impl ChangeKind {
    /// Returns the wire name of the kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::InitNew => "InitNew",
            ChangeKind::ReferenceChange => "ReferenceChange",
            ChangeKind::ValueChange => "ValueChange",
            ChangeKind::ListChange => "ListChange",
            ChangeKind::Save => "Save",
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One atomic mutation of the entity graph.
///
/// Records are created the instant a tracked mutation occurs and are
/// immutable afterwards, except for id fix-ups after a save.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ChangeRecord {
    /// A new entity was created.
    InitNew {
        /// The created entity.
        instance: EntityRef,
    },
    /// An entity-typed property was assigned.
    ReferenceChange {
        /// The entity owning the property.
        instance: EntityRef,
        /// Property name.
        property: String,
        /// Previous referenced entity.
        #[serde(rename = "oldValue", default)]
        old_value: Option<EntityRef>,
        /// New referenced entity.
        #[serde(rename = "newValue", default)]
        new_value: Option<EntityRef>,
    },
    /// A primitive-typed property was assigned.
    ValueChange {
        /// The entity owning the property.
        instance: EntityRef,
        /// Property name.
        property: String,
        /// Previous value.
        #[serde(rename = "oldValue", default)]
        old_value: serde_json::Value,
        /// New value.
        #[serde(rename = "newValue", default)]
        new_value: serde_json::Value,
    },
    /// Items were added to or removed from a list property.
    ListChange {
        /// The entity owning the list.
        instance: EntityRef,
        /// Property name.
        property: String,
        /// Items added, in order.
        #[serde(default)]
        added: Vec<WireItem>,
        /// Items removed, in order.
        #[serde(default)]
        removed: Vec<WireItem>,
    },
    /// The server persisted entities and reassigned their ids.
    Save {
        /// Identity replacements.
        #[serde(rename = "idChanges", default)]
        id_changes: Vec<IdChange>,
    },
}

impl ChangeRecord {
    /// Creates an `InitNew` record.
    pub fn init_new(instance: EntityRef) -> Self {
        ChangeRecord::InitNew { instance }
    }

    /// Creates a `ValueChange` record.
    pub fn value_change(
        instance: EntityRef,
        property: impl Into<String>,
        old_value: serde_json::Value,
        new_value: serde_json::Value,
    ) -> Self {
        ChangeRecord::ValueChange {
            instance,
            property: property.into(),
            old_value,
            new_value,
        }
    }

    /// Creates a `ReferenceChange` record.
    pub fn reference_change(
        instance: EntityRef,
        property: impl Into<String>,
        old_value: Option<EntityRef>,
        new_value: Option<EntityRef>,
    ) -> Self {
        ChangeRecord::ReferenceChange {
            instance,
            property: property.into(),
            old_value,
            new_value,
        }
    }

    /// Creates a `ListChange` record.
    pub fn list_change(
        instance: EntityRef,
        property: impl Into<String>,
        added: Vec<WireItem>,
        removed: Vec<WireItem>,
    ) -> Self {
        ChangeRecord::ListChange {
            instance,
            property: property.into(),
            added,
            removed,
        }
    }

    /// Creates a `Save` record.
    pub fn save(id_changes: Vec<IdChange>) -> Self {
        ChangeRecord::Save { id_changes }
    }

    /// Returns the kind of this record.
    pub fn kind(&self) -> ChangeKind {
        match self {
            ChangeRecord::InitNew { .. } => ChangeKind::InitNew,
            ChangeRecord::ReferenceChange { .. } => ChangeKind::ReferenceChange,
            ChangeRecord::ValueChange { .. } => ChangeKind::ValueChange,
            ChangeRecord::ListChange { .. } => ChangeKind::ListChange,
            ChangeRecord::Save { .. } => ChangeKind::Save,
        }
    }

    /// Returns true for `Save` records.
    pub fn is_save(&self) -> bool {
        matches!(self, ChangeRecord::Save { .. })
    }

    /// Returns the entity this change applies to (absent for `Save`).
    pub fn instance(&self) -> Option<&EntityRef> {
        match self {
            ChangeRecord::InitNew { instance }
            | ChangeRecord::ReferenceChange { instance, .. }
            | ChangeRecord::ValueChange { instance, .. }
            | ChangeRecord::ListChange { instance, .. } => Some(instance),
            ChangeRecord::Save { .. } => None,
        }
    }

    /// Returns the affected property (absent for `InitNew` and `Save`).
    pub fn property(&self) -> Option<&str> {
        match self {
            ChangeRecord::ReferenceChange { property, .. }
            | ChangeRecord::ValueChange { property, .. }
            | ChangeRecord::ListChange { property, .. } => Some(property),
            ChangeRecord::InitNew { .. } | ChangeRecord::Save { .. } => None,
        }
    }

    /// Returns every entity reference mentioned by this record.
    pub fn entity_refs(&self) -> Vec<&EntityRef> {
        let mut refs = Vec::new();
        match self {
            ChangeRecord::InitNew { instance } | ChangeRecord::ValueChange { instance, .. } => {
                refs.push(instance);
            }
            ChangeRecord::ReferenceChange {
                instance,
                old_value,
                new_value,
                ..
            } => {
                refs.push(instance);
                refs.extend(old_value.iter());
                refs.extend(new_value.iter());
            }
            ChangeRecord::ListChange {
                instance,
                added,
                removed,
                ..
            } => {
                refs.push(instance);
                refs.extend(added.iter().filter_map(WireItem::as_entity));
                refs.extend(removed.iter().filter_map(WireItem::as_entity));
            }
            ChangeRecord::Save { .. } => {}
        }
        refs
    }

    /// Calls `f` for every entity reference mentioned by this record.
    pub fn for_each_ref_mut(&mut self, mut f: impl FnMut(&mut EntityRef)) {
        match self {
            ChangeRecord::InitNew { instance } | ChangeRecord::ValueChange { instance, .. } => {
                f(instance);
            }
            ChangeRecord::ReferenceChange {
                instance,
                old_value,
                new_value,
                ..
            } => {
                f(instance);
                if let Some(r) = old_value {
                    f(r);
                }
                if let Some(r) = new_value {
                    f(r);
                }
            }
            ChangeRecord::ListChange {
                instance,
                added,
                removed,
                ..
            } => {
                f(instance);
                for item in added.iter_mut().chain(removed.iter_mut()) {
                    if let WireItem::Entity(r) = item {
                        f(r);
                    }
                }
            }
            ChangeRecord::Save { .. } => {}
        }
    }
}
