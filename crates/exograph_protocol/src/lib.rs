//! # ExoGraph Protocol
//!
//! Wire-level types for ExoGraph change synchronization.
//!
//! This crate provides:
//! - `EntityRef` and `IdChange`, the wire identity of entities
//! - `ChangeRecord`, one atomic mutation of the entity graph
//! - `ChangeLog`, the ordered, source-partitioned log of pending changes
//! - `Translator`, the client id / server id mapping table
//! - Request and result messages for the transport providers
//! - ISO-8601 date encoding used on the wire
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod change;
mod change_log;
pub mod date;
mod error;
mod messages;
mod reference;
mod translator;

pub use change::{ChangeKind, ChangeRecord};
pub use change_log::{ChangeLog, ChangeSet, LogEntry, LogSet, CLIENT_SOURCE, UNKNOWN_SOURCE};
pub use error::{ProtocolError, ProtocolResult};
pub use messages::{
    ConditionData, ConditionTarget, Conditions, EventRequest, InstanceData, Instances,
    ListRequest, ObjectRequest, OriginTag, PropertyInfo, Query, QueryRequest, RoundtripRequest,
    SaveRequest, ServerResult, TypeInfo,
};
pub use reference::{EntityRef, IdChange, WireItem};
pub use translator::Translator;
