//! Error types for the entity model.

use thiserror::Error;

/// Result type for model operations.
pub type ModelResult<T> = Result<T, ModelError>;

/// Errors that can occur while reading or mutating the entity graph.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModelError {
    /// No type with this name has been defined.
    #[error("unknown type: {0}")]
    UnknownType(String),

    /// A type with this name is already defined.
    #[error("type already defined: {0}")]
    DuplicateType(String),

    /// The type has no such property.
    #[error("type {type_name} has no property {property}")]
    UnknownProperty {
        /// Type searched.
        type_name: String,
        /// Property name.
        property: String,
    },

    /// Another entity is already registered under this id.
    #[error("an entity {type_name}|{id} is already registered")]
    DuplicateId {
        /// Type name.
        type_name: String,
        /// Conflicting id.
        id: String,
    },

    /// The entity is not registered with the model.
    #[error("entity {type_name}|{id} is not registered")]
    NotRegistered {
        /// Type name.
        type_name: String,
        /// Entity id.
        id: String,
    },

    /// A list operation was attempted on a scalar property.
    #[error("property {0} is not a list")]
    NotAList(String),

    /// A scalar operation was attempted on a list property.
    #[error("property {0} is a list")]
    IsAList(String),

    /// The property has not been loaded yet.
    #[error("property {0} is not initialized")]
    NotInitialized(String),

    /// The value does not fit the property's type.
    #[error("property {property} expects {expected}")]
    TypeMismatch {
        /// Property name.
        property: String,
        /// Expected type description.
        expected: String,
    },

    /// An observer refused the unregistration of an entity.
    #[error("unregistering {type_name}|{id} is not supported: {reason}")]
    UnregisterRejected {
        /// Type name.
        type_name: String,
        /// Entity id.
        id: String,
        /// Why the observer refused.
        reason: String,
    },
}
