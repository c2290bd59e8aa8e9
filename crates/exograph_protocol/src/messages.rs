//! Request and result messages exchanged with the transport providers.

use crate::change::ChangeRecord;
use crate::change_log::ChangeSet;
use crate::reference::EntityRef;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Instance data keyed by type name, then by id.
pub type Instances = BTreeMap<String, BTreeMap<String, InstanceData>>;

/// Condition data keyed by condition-type code.
pub type Conditions = BTreeMap<String, Vec<ConditionData>>;

/// Field values of one instance.
///
/// Servers send either a positional array ordered like the type's
/// properties (base type first) or a map keyed by property name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InstanceData {
    /// Values indexed by property position.
    Fields(Vec<Value>),
    /// Values keyed by property name.
    Named(Map<String, Value>),
}

/// An entity and the properties a condition is attached to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionTarget {
    /// The entity.
    pub instance: EntityRef,
    /// Affected property names.
    #[serde(default)]
    pub properties: Vec<String>,
}

/// A validation or error annotation produced by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionData {
    /// Human-readable message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Where the condition applies.
    #[serde(default)]
    pub targets: Vec<ConditionTarget>,
}

/// What a transport call returns on success.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerResult {
    /// Instance data to merge into the graph.
    #[serde(default)]
    pub instances: Instances,
    /// Conditions keyed by condition-type code.
    #[serde(default)]
    pub conditions: Conditions,
    /// Changes to apply, possibly including `Save` records.
    #[serde(default)]
    pub changes: Vec<ChangeRecord>,
    /// Return value of a server event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_result: Option<Value>,
}

impl ServerResult {
    /// Creates an empty result.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the changes.
    pub fn with_changes(mut self, changes: Vec<ChangeRecord>) -> Self {
        self.changes = changes;
        self
    }

    /// Adds instance data for one entity.
    pub fn with_instance(
        mut self,
        type_name: impl Into<String>,
        id: impl Into<String>,
        data: InstanceData,
    ) -> Self {
        self.instances
            .entry(type_name.into())
            .or_default()
            .insert(id.into(), data);
        self
    }

    /// Sets the conditions of one condition type.
    pub fn with_conditions(mut self, code: impl Into<String>, data: Vec<ConditionData>) -> Self {
        self.conditions.insert(code.into(), data);
        self
    }

    /// Sets the event result.
    pub fn with_event_result(mut self, value: Value) -> Self {
        self.event_result = Some(value);
        self
    }

    /// Returns true if the result carries nothing to apply.
    pub fn is_empty(&self) -> bool {
        self.instances.is_empty() && self.conditions.is_empty() && self.changes.is_empty()
    }
}

/// Origin of a type or property definition on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OriginTag {
    /// Defined by server-provided metadata.
    #[default]
    Server,
    /// Added by client code only.
    Client,
}

/// Property metadata returned by the type provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropertyInfo {
    /// Property name.
    pub name: String,
    /// Value type (`String`, `Integer`, `Number`, `Boolean`, `Date`, `Object`)
    /// or an entity type name.
    #[serde(rename = "type")]
    pub type_name: String,
    /// Whether the property holds a list.
    #[serde(default)]
    pub is_list: bool,
    /// Whether the property is static.
    #[serde(default)]
    pub is_static: bool,
    /// Where the property was defined.
    #[serde(default)]
    pub origin: OriginTag,
}

impl PropertyInfo {
    /// Creates a server-origin, instance-level property.
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
            is_list: false,
            is_static: false,
            origin: OriginTag::Server,
        }
    }

    /// Marks the property as a list.
    pub fn list(mut self) -> Self {
        self.is_list = true;
        self
    }
}

/// Type metadata returned by the type provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypeInfo {
    /// Fully-qualified type name.
    pub name: String,
    /// Base type name, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_type: Option<String>,
    /// Where the type was defined.
    #[serde(default)]
    pub origin: OriginTag,
    /// Properties declared by this type (not inherited ones).
    #[serde(default)]
    pub properties: Vec<PropertyInfo>,
}

/// Request for instance state (object provider).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectRequest {
    /// Type of the requested entities.
    #[serde(rename = "type")]
    pub type_name: String,
    /// Requested ids.
    pub ids: Vec<String>,
    /// Property paths to include.
    pub paths: Vec<String>,
    /// Pending changes, so the server sees the client's state.
    pub changes: Vec<ChangeSet>,
}

/// One query of a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Query {
    /// Root type.
    pub from: String,
    /// Root ids.
    #[serde(default)]
    pub ids: Vec<String>,
    /// Property paths to include.
    #[serde(default)]
    pub paths: Vec<String>,
    /// Whether the roots belong to the page scope.
    #[serde(default)]
    pub in_scope: bool,
}

impl Query {
    /// Creates an in-scope query.
    pub fn new(from: impl Into<String>, ids: Vec<String>) -> Self {
        Self {
            from: from.into(),
            ids,
            paths: Vec::new(),
            in_scope: true,
        }
    }

    /// Adds a property path.
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.paths.push(path.into());
        self
    }
}

/// Batch query request (query provider).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRequest {
    /// The queries.
    pub queries: Vec<Query>,
    /// Pending changes.
    pub changes: Vec<ChangeSet>,
}

/// Request for list contents (list provider).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListRequest {
    /// Type of the list owner.
    pub owner_type: String,
    /// Id of the list owner.
    pub owner_id: String,
    /// List property paths.
    pub paths: Vec<String>,
}

/// Roundtrip request (roundtrip provider).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundtripRequest {
    /// Pending changes.
    pub changes: Vec<ChangeSet>,
}

/// Save request (save provider).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaveRequest {
    /// The entity the save was issued for.
    pub root: EntityRef,
    /// Changes to persist.
    pub changes: Vec<ChangeSet>,
}

/// Server event invocation (event provider).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRequest {
    /// Event name.
    pub event_name: String,
    /// The entity the event is raised on.
    pub target: EntityRef,
    /// Serialized event arguments.
    pub event_args: Map<String, Value>,
    /// Property paths to include in the result.
    pub paths: Vec<String>,
    /// Pending changes.
    pub changes: Vec<ChangeSet>,
}
