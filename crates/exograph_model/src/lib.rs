//! # ExoGraph Model
//!
//! The live entity graph that ExoGraph synchronizes.
//!
//! This crate provides:
//! - Type metadata (`EntityType`, `PropertyMeta`) used as a read-only oracle
//! - `Entity` handles with mutable identity and lazily initialized properties
//! - `Model`, the entity pool with observable property and list mutation
//! - `GraphObserver`, the subscription interface for mutation and lifecycle events
//!
//! ## Key Invariants
//!
//! - An `(root type, id)` pair names at most one registered entity
//! - Observers are notified after the mutation is stored and all internal
//!   locks are released, so observers may read and mutate the model
//! - New entities start with every property initialized; ghosts start with none

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod entity;
mod error;
mod meta;
mod model;
mod value;

pub use entity::Entity;
pub use error::{ModelError, ModelResult};
pub use meta::{EntityType, Origin, PropertyMeta, PropertyType, TypeBuilder, ValueType};
pub use model::{GraphObserver, Model};
pub use value::Value;
