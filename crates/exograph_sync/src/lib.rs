//! # ExoGraph Sync
//!
//! Client-side change tracking and server synchronization for ExoGraph
//! entity models.
//!
//! This crate provides:
//! - `ChangeListener`, which records tracked mutations of a model as change records
//! - `ServerSync`, which sends pending changes with events, roundtrips and saves
//!   and merges server results back into the graph
//! - Lazy resolution and loading of types, entities and properties
//! - `Signal`, the counted completion barrier that coordinates asynchronous work
//! - A transport abstraction with a scripted `MockTransport`
//! - Future adapters over the callback API
//!
//! ## Architecture
//!
//! Every server interaction follows the same shape:
//! 1. Serialize the change log, filtered by save eligibility
//! 2. Call the transport; the outcome arrives through a callback
//! 3. Apply instance data, then conditions, then change records
//!
//! ## Key Invariants
//!
//! - Mutations made while applying server data are never recorded as local changes
//! - A `Save` record's id remapping is applied before the records that follow it
//! - The change log always has an active set to record into
//! - One synchronization context exists per model; models never share registries

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod context;
pub mod convert;
mod error;
mod events;
mod future;
mod instances;
mod listener;
mod loader;
mod resolve;
mod server_sync;
mod signal;
mod transport;

pub use config::{SyncConfig, SERVER_SOURCE};
pub use error::{SyncError, SyncResult};
pub use events::{RequestKind, SyncObserver, SyncStats};
pub use listener::{is_tracked, ChangeListener, ChangeSink};
pub use resolve::LazyLoadMode;
pub use server_sync::ServerSync;
pub use signal::Signal;
pub use transport::{Callback, MockTransport, Operation, SyncTransport, TransportCall};
