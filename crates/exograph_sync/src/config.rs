//! Configuration for the sync engine.

use crate::resolve::LazyLoadMode;
use exograph_protocol::CLIENT_SOURCE;

/// Label of change sets applied from server results.
pub const SERVER_SOURCE: &str = "server";

/// Configuration for a [`ServerSync`](crate::ServerSync).
#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    /// Label of the change set that local mutations are recorded into.
    pub client_source: String,
    /// Label of the change set that server-applied changes are recorded into.
    pub server_source: String,
    /// How `apply_changes` resolves the entity a change targets.
    pub apply_load_mode: LazyLoadMode,
    /// Whether roundtrips send every pending change instead of only the
    /// save-eligible ones.
    pub roundtrip_includes_all_changes: bool,
    /// Property paths requested along with lazily loaded entities.
    pub default_paths: Vec<String>,
}

impl SyncConfig {
    /// Creates a configuration with default labels.
    pub fn new() -> Self {
        Self {
            client_source: CLIENT_SOURCE.to_string(),
            server_source: SERVER_SOURCE.to_string(),
            apply_load_mode: LazyLoadMode::None,
            roundtrip_includes_all_changes: false,
            default_paths: Vec::new(),
        }
    }

    /// Sets the client change set label.
    pub fn with_client_source(mut self, source: impl Into<String>) -> Self {
        self.client_source = source.into();
        self
    }

    /// Sets the server change set label.
    pub fn with_server_source(mut self, source: impl Into<String>) -> Self {
        self.server_source = source.into();
        self
    }

    /// Sets how applied changes resolve their target entity.
    pub fn with_apply_load_mode(mut self, mode: LazyLoadMode) -> Self {
        self.apply_load_mode = mode;
        self
    }

    /// Makes roundtrips send every pending change.
    pub fn with_roundtrip_all_changes(mut self, include_all: bool) -> Self {
        self.roundtrip_includes_all_changes = include_all;
        self
    }

    /// Adds a property path to request with lazily loaded entities.
    pub fn with_default_path(mut self, path: impl Into<String>) -> Self {
        self.default_paths.push(path.into());
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new()
    }
}
