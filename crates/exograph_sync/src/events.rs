//! Synchronizer notifications and counters.

use crate::error::SyncError;
use exograph_protocol::{ChangeRecord, ServerResult};

/// Kind of server request issued by the synchronizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    /// Initial context load through the query provider.
    Context,
    /// Server event invocation.
    Event,
    /// Roundtrip without payload.
    Roundtrip,
    /// Save of a root entity.
    Save,
}

impl RequestKind {
    /// Returns the kind as a lowercase label.
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestKind::Context => "context",
            RequestKind::Event => "event",
            RequestKind::Roundtrip => "roundtrip",
            RequestKind::Save => "save",
        }
    }
}

/// Observes a [`ServerSync`](crate::ServerSync).
///
/// All methods have empty defaults. They are called without any
/// synchronizer lock held.
pub trait SyncObserver: Send + Sync {
    /// A request is about to be sent.
    fn request_begin(&self, _kind: RequestKind) {}

    /// A request finished, successfully or not.
    fn request_end(&self, _kind: RequestKind) {}

    /// A request succeeded and its result was applied.
    fn request_succeeded(&self, _kind: RequestKind, _result: &ServerResult) {}

    /// A request failed.
    fn request_failed(&self, _kind: RequestKind, _error: &SyncError) {}

    /// A local change was recorded.
    fn change_captured(&self, _change: &ChangeRecord) {}

    /// A batch of server changes finished applying.
    fn changes_applied(&self, _applied: usize, _skipped: usize) {}
}

/// Running counters of a synchronizer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStats {
    /// Requests sent.
    pub requests_started: u64,
    /// Requests that failed.
    pub requests_failed: u64,
    /// Saves that succeeded.
    pub saves_completed: u64,
    /// Server changes applied.
    pub changes_applied: u64,
    /// Server changes skipped because they could not be applied.
    pub changes_skipped: u64,
    /// Local changes recorded.
    pub changes_captured: u64,
    /// Changes undone by rollback.
    pub changes_rolled_back: u64,
    /// Message of the most recent failure.
    pub last_error: Option<String>,
}
