//! Source-partitioned change log.

use crate::change::ChangeRecord;
use crate::error::{ProtocolError, ProtocolResult};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Source label for changes made by local code.
pub const CLIENT_SOURCE: &str = "client";

/// Fallback label used when a set is started without a source.
pub const UNKNOWN_SOURCE: &str = "unknown";

/// A labeled, ordered group of changes as sent on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeSet {
    /// Where the changes came from (`"client"`, `"server"`, or a caller label).
    pub source: String,
    /// The changes, in the order they occurred.
    pub changes: Vec<ChangeRecord>,
}

impl ChangeSet {
    /// Creates a change set.
    pub fn new(source: impl Into<String>, changes: Vec<ChangeRecord>) -> Self {
        Self {
            source: source.into(),
            changes,
        }
    }
}

/// A change in the log, stamped with its append sequence number.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    /// Monotonically increasing sequence number. Never sent on the wire.
    pub seq: u64,
    /// The change.
    pub record: ChangeRecord,
}

/// One partition of the log.
#[derive(Debug, Clone, PartialEq)]
pub struct LogSet {
    source: String,
    entries: Vec<LogEntry>,
}

impl LogSet {
    fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            entries: Vec::new(),
        }
    }

    /// Returns the source label.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Returns the entries of this set.
    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    /// Returns the number of changes in this set.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if this set holds no changes.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// An ordered, append-only log of changes partitioned into labeled sets.
///
/// # Invariants
///
/// - Once `start` has been called there is always exactly one active set
/// - `truncate` always leaves a fresh `"client"` set active
/// - Sequence numbers are assigned in append order and never reused
#[derive(Debug, Clone, Default)]
pub struct ChangeLog {
    sets: Vec<LogSet>,
    active: Option<usize>,
    next_seq: u64,
}

impl ChangeLog {
    /// Creates an empty log with no active set.
    pub fn new() -> Self {
        Self {
            sets: Vec::new(),
            active: None,
            next_seq: 1,
        }
    }

    /// Begins a new active set labeled `source`.
    ///
    /// An empty source is logged and replaced by [`UNKNOWN_SOURCE`].
    /// A trailing active set that is still empty is replaced rather than kept.
    pub fn start(&mut self, source: &str) {
        let source = if source.is_empty() {
            warn!("change set started without a source, using \"{UNKNOWN_SOURCE}\"");
            UNKNOWN_SOURCE
        } else {
            source
        };

        if let Some(idx) = self.active {
            if idx + 1 == self.sets.len() && self.sets[idx].is_empty() {
                self.sets.pop();
            }
        }

        self.sets.push(LogSet::new(source));
        self.active = Some(self.sets.len() - 1);
    }

    /// Appends a change to the active set.
    ///
    /// Returns the assigned sequence number.
    pub fn add(&mut self, record: ChangeRecord) -> ProtocolResult<u64> {
        let idx = self.active.ok_or(ProtocolError::NoActiveSet)?;
        let seq = self.next_seq.max(1);
        self.next_seq = seq + 1;
        self.sets[idx].entries.push(LogEntry { seq, record });
        Ok(seq)
    }

    /// Returns the source of the active set.
    pub fn active_source(&self) -> Option<&str> {
        self.active.map(|idx| self.sets[idx].source())
    }

    /// Returns true if a set is active.
    pub fn has_active(&self) -> bool {
        self.active.is_some()
    }

    /// Returns all sets, oldest first.
    pub fn sets(&self) -> &[LogSet] {
        &self.sets
    }

    /// Iterates over every entry, oldest first.
    pub fn entries(&self) -> impl Iterator<Item = &LogEntry> {
        self.sets.iter().flat_map(|s| s.entries.iter())
    }

    /// Returns the total number of changes.
    pub fn len(&self) -> usize {
        self.sets.iter().map(LogSet::len).sum()
    }

    /// Returns true if the log holds no changes.
    pub fn is_empty(&self) -> bool {
        self.sets.iter().all(LogSet::is_empty)
    }

    /// Returns the sequence number of the most recently appended change,
    /// or 0 if nothing was ever appended.
    pub fn last_seq(&self) -> u64 {
        self.next_seq.saturating_sub(1)
    }

    /// Serializes the sets, keeping only changes that pass `filter`.
    ///
    /// Sets left with no passing change are omitted.
    pub fn serialize<F>(&self, mut filter: F) -> Vec<ChangeSet>
    where
        F: FnMut(&ChangeRecord) -> bool,
    {
        self.sets
            .iter()
            .filter_map(|set| {
                let changes: Vec<ChangeRecord> = set
                    .entries
                    .iter()
                    .filter(|e| filter(&e.record))
                    .map(|e| e.record.clone())
                    .collect();
                (!changes.is_empty()).then(|| ChangeSet::new(set.source.clone(), changes))
            })
            .collect()
    }

    /// Serializes every change.
    pub fn serialize_all(&self) -> Vec<ChangeSet> {
        self.serialize(|_| true)
    }

    /// Removes every entry matching `filter`, drops sets left empty and
    /// starts a fresh `"client"` set.
    ///
    /// Returns the number of removed entries.
    pub fn truncate<F>(&mut self, mut filter: F) -> usize
    where
        F: FnMut(&LogEntry) -> bool,
    {
        let before = self.len();
        for set in &mut self.sets {
            set.entries.retain(|e| !filter(e));
        }
        self.sets.retain(|s| !s.is_empty());
        self.active = None;
        self.start(CLIENT_SOURCE);
        before - self.len()
    }

    /// Pops the most recent change.
    ///
    /// Empty trailing sets are discarded on the way back, but the last
    /// remaining set is always kept. Returns `None` if the log is empty.
    pub fn undo(&mut self) -> Option<ChangeRecord> {
        loop {
            let last = self.sets.last_mut()?;
            if let Some(entry) = last.entries.pop() {
                return Some(entry.record);
            }
            if self.sets.len() == 1 {
                return None;
            }
            self.sets.pop();
            self.active = Some(self.sets.len() - 1);
        }
    }

    /// Returns the most recent change, if any.
    pub fn last_change(&self) -> Option<&ChangeRecord> {
        self.sets
            .iter()
            .rev()
            .find_map(|s| s.entries.last())
            .map(|e| &e.record)
    }

    /// Calls `f` for every logged record, oldest first.
    pub fn for_each_record_mut(&mut self, mut f: impl FnMut(&mut ChangeRecord)) {
        for set in &mut self.sets {
            for entry in &mut set.entries {
                f(&mut entry.record);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reference::EntityRef;
    use proptest::prelude::*;
    use serde_json::json;

    fn change(id: &str, value: i64) -> ChangeRecord {
        ChangeRecord::value_change(EntityRef::new("Driver", id), "Age", json!(0), json!(value))
    }

    #[test]
    fn add_without_start_fails() {
        let mut log = ChangeLog::new();
        assert!(matches!(log.add(change("1", 1)), Err(ProtocolError::NoActiveSet)));
    }

    #[test]
    fn empty_source_falls_back_to_unknown() {
        let mut log = ChangeLog::new();
        log.start("");
        assert_eq!(log.active_source(), Some(UNKNOWN_SOURCE));
        log.add(change("1", 1)).unwrap();
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn sequence_numbers_increase() {
        let mut log = ChangeLog::new();
        log.start(CLIENT_SOURCE);
        assert_eq!(log.last_seq(), 0);
        assert_eq!(log.add(change("1", 1)).unwrap(), 1);
        assert_eq!(log.add(change("1", 2)).unwrap(), 2);
        log.start("server");
        assert_eq!(log.add(change("2", 3)).unwrap(), 3);
        assert_eq!(log.last_seq(), 3);
    }

    #[test]
    fn start_replaces_empty_trailing_set() {
        let mut log = ChangeLog::new();
        log.start(CLIENT_SOURCE);
        log.start("server");
        log.start(CLIENT_SOURCE);
        assert_eq!(log.sets().len(), 1);

        log.add(change("1", 1)).unwrap();
        log.start("server");
        assert_eq!(log.sets().len(), 2);
        assert_eq!(log.active_source(), Some("server"));
    }

    #[test]
    fn serialize_filters_and_omits_empty_sets() {
        let mut log = ChangeLog::new();
        log.start(CLIENT_SOURCE);
        log.add(change("1", 1)).unwrap();
        log.start("server");
        log.add(change("2", 2)).unwrap();

        let all = log.serialize_all();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].source, "client");
        assert_eq!(all[1].source, "server");

        let only_one = log.serialize(|c| c.instance().map(|i| i.id.as_str()) == Some("1"));
        assert_eq!(only_one.len(), 1);
        assert_eq!(only_one[0].changes.len(), 1);

        assert_eq!(
            serde_json::to_value(&only_one).unwrap()[0]["source"],
            json!("client")
        );
    }

    #[test]
    fn truncate_drops_empty_sets_and_restarts_client() {
        let mut log = ChangeLog::new();
        log.start(CLIENT_SOURCE);
        log.add(change("1", 1)).unwrap();
        log.start("server");
        log.add(change("2", 2)).unwrap();
        log.add(change("1", 3)).unwrap();

        let removed = log.truncate(|e| e.record.instance().unwrap().id == "1");
        assert_eq!(removed, 2);
        assert_eq!(log.len(), 1);
        assert_eq!(log.sets()[0].source(), "server");
        assert_eq!(log.active_source(), Some(CLIENT_SOURCE));
        assert!(log.add(change("3", 4)).is_ok());
    }

    #[test]
    fn undo_walks_back_across_sets() {
        let mut log = ChangeLog::new();
        log.start(CLIENT_SOURCE);
        log.add(change("1", 1)).unwrap();
        log.start("server");
        log.add(change("2", 2)).unwrap();
        log.start(CLIENT_SOURCE);
        log.add(change("3", 3)).unwrap();

        assert_eq!(log.undo(), Some(change("3", 3)));
        assert_eq!(log.undo(), Some(change("2", 2)));
        assert_eq!(log.active_source(), Some("server"));
        assert_eq!(log.undo(), Some(change("1", 1)));
        assert_eq!(log.undo(), None);
        assert!(log.has_active());
        assert!(log.add(change("4", 4)).is_ok());
    }

    #[test]
    fn last_change_skips_empty_sets() {
        let mut log = ChangeLog::new();
        assert!(log.last_change().is_none());
        log.start(CLIENT_SOURCE);
        log.add(change("1", 1)).unwrap();
        log.start("server");
        assert_eq!(log.last_change(), Some(&change("1", 1)));
    }

    proptest! {
        #[test]
        fn truncate_always_leaves_active_set(
            ops in prop::collection::vec((0u8..3, 0i64..5), 0..40),
            cut in 0i64..5,
        ) {
            let mut log = ChangeLog::new();
            log.start(CLIENT_SOURCE);
            for (op, v) in ops {
                match op {
                    0 => { log.add(change("1", v)).unwrap(); }
                    1 => log.start("server"),
                    _ => log.start(CLIENT_SOURCE),
                }
            }
            log.truncate(|e| matches!(&e.record, ChangeRecord::ValueChange { new_value, .. } if new_value.as_i64().unwrap_or(0) <= cut));
            prop_assert!(log.add(change("2", 0)).is_ok());
            prop_assert_eq!(log.active_source(), Some(CLIENT_SOURCE));
        }

        #[test]
        fn undo_returns_changes_newest_first(values in prop::collection::vec(0i64..100, 0..30)) {
            let mut log = ChangeLog::new();
            log.start(CLIENT_SOURCE);
            for (i, v) in values.iter().enumerate() {
                if i % 4 == 3 {
                    log.start("server");
                }
                log.add(change("1", *v)).unwrap();
            }
            let mut undone = Vec::new();
            while let Some(c) = log.undo() {
                undone.push(c);
            }
            let expected: Vec<_> = values.iter().rev().map(|v| change("1", *v)).collect();
            prop_assert_eq!(undone, expected);
            prop_assert!(log.is_empty());
        }
    }
}
