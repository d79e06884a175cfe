//! Last-writer-wins decisions for incoming sync entries.
//!
//! The store looks up what it already knows about the entry's table and key
//! and asks the [`Reconciler`] whether the entry should be applied.
//!
//! # Rules
//!
//! 1. Entries that originated on this replica are never re-applied.
//! 2. `U`/`D`: skipped when a local log entry for the same table and key has
//!    a strictly later timestamp, or when the table was dropped (tombstoned)
//!    after the entry was made.
//! 3. `X`: skipped when the table already carries a tombstone at or after
//!    the incoming one; the earlier boundary is already covered.
//!
//! Sequences are per replica and never compared across replicas; only
//! wall-clock timestamps are.

use crate::{synclog::Activity, synclog::SyncEntry, timestamp::Timestamp};
use serde::{Deserialize, Serialize};

/// How a conflict between a local and an incoming change was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConflictResolution {
    /// The local change is newer; the incoming entry is dropped.
    LocalWins,
    /// The incoming change is newer (or there was no local change).
    RemoteWins,
}

/// Why an incoming entry was not applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SkipReason {
    /// The entry originated on this replica.
    OwnEntry,
    /// A local change to the same document is newer.
    LocalIsNewer,
    /// The collection was dropped after the entry was made.
    BeforeTombstone,
    /// An equal or later tombstone is already recorded.
    TombstoneCovered,
}

/// Decision for one incoming entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Apply,
    Skip(SkipReason),
}

impl Verdict {
    /// Conflict resolution implied by this verdict, if it was a conflict at all.
    pub fn resolution(self) -> Option<ConflictResolution> {
        match self {
            Verdict::Apply => Some(ConflictResolution::RemoteWins),
            Verdict::Skip(SkipReason::LocalIsNewer) => Some(ConflictResolution::LocalWins),
            Verdict::Skip(_) => None,
        }
    }
}

/// What the local change log knows about an entry's table and key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LocalHistory {
    /// Latest local log timestamp for the same table and key.
    pub latest_for_key: Option<Timestamp>,
    /// Latest local tombstone for the table.
    pub latest_tombstone: Option<Timestamp>,
}

/// Decides whether incoming entries win against local history.
#[derive(Debug, Clone)]
pub struct Reconciler {
    local_replica: String,
}

impl Reconciler {
    pub fn new(local_replica: impl Into<String>) -> Self {
        Self {
            local_replica: local_replica.into(),
        }
    }

    pub fn local_replica(&self) -> &str {
        &self.local_replica
    }

    /// Decide for `entry`, received from `source_db`.
    pub fn decide(&self, entry: &SyncEntry, source_db: &str, history: &LocalHistory) -> Verdict {
        if entry.origin(source_db) == self.local_replica {
            return Verdict::Skip(SkipReason::OwnEntry);
        }

        let at = entry.time_stamp;
        match entry.activity {
            Activity::Update | Activity::Delete => {
                if history.latest_tombstone.is_some_and(|t| t > at) {
                    return Verdict::Skip(SkipReason::BeforeTombstone);
                }
                if history.latest_for_key.is_some_and(|t| t > at) {
                    return Verdict::Skip(SkipReason::LocalIsNewer);
                }
                Verdict::Apply
            }
            Activity::Drop => {
                if history.latest_tombstone.is_some_and(|t| t >= at) {
                    return Verdict::Skip(SkipReason::TombstoneCovered);
                }
                Verdict::Apply
            }
        }
    }
}

/// Counters describing one import.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportReport {
    pub updates_applied: usize,
    pub deletes_applied: usize,
    pub drops_applied: usize,
    pub skipped_own: usize,
    pub skipped_stale: usize,
    /// Entries that were well formed but failed to apply locally.
    pub failed: usize,
}

impl ImportReport {
    pub fn record_applied(&mut self, activity: Activity) {
        match activity {
            Activity::Update => self.updates_applied += 1,
            Activity::Delete => self.deletes_applied += 1,
            Activity::Drop => self.drops_applied += 1,
        }
    }

    pub fn record_skipped(&mut self, reason: SkipReason) {
        match reason {
            SkipReason::OwnEntry => self.skipped_own += 1,
            _ => self.skipped_stale += 1,
        }
    }

    pub fn applied(&self) -> usize {
        self.updates_applied + self.deletes_applied + self.drops_applied
    }

    pub fn total(&self) -> usize {
        self.applied() + self.skipped_own + self.skipped_stale + self.failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    fn ts(millis: i64) -> Timestamp {
        Timestamp::from_millis(millis).unwrap()
    }

    fn entry(activity: Activity, at: i64, original: Option<&str>) -> SyncEntry {
        SyncEntry {
            time_stamp: ts(at),
            table_name: "people".into(),
            activity,
            key: Some("p1".into()),
            original_db: original.map(String::from),
            value: (activity == Activity::Update).then(Map::new),
        }
    }

    #[test]
    fn own_entries_are_skipped() {
        let reconciler = Reconciler::new("LOCAL");
        let verdict = reconciler.decide(
            &entry(Activity::Update, 10, Some("LOCAL")),
            "REMOTE",
            &LocalHistory::default(),
        );
        assert_eq!(verdict, Verdict::Skip(SkipReason::OwnEntry));
        assert_eq!(verdict.resolution(), None);
    }

    #[test]
    fn newer_local_change_wins() {
        let reconciler = Reconciler::new("LOCAL");
        let history = LocalHistory {
            latest_for_key: Some(ts(20)),
            latest_tombstone: None,
        };
        let verdict = reconciler.decide(&entry(Activity::Update, 10, None), "REMOTE", &history);
        assert_eq!(verdict, Verdict::Skip(SkipReason::LocalIsNewer));
        assert_eq!(verdict.resolution(), Some(ConflictResolution::LocalWins));

        let verdict = reconciler.decide(&entry(Activity::Delete, 30, None), "REMOTE", &history);
        assert_eq!(verdict, Verdict::Apply);
        assert_eq!(verdict.resolution(), Some(ConflictResolution::RemoteWins));
    }

    #[test]
    fn equal_timestamps_apply() {
        let reconciler = Reconciler::new("LOCAL");
        let history = LocalHistory {
            latest_for_key: Some(ts(10)),
            latest_tombstone: None,
        };
        assert_eq!(
            reconciler.decide(&entry(Activity::Update, 10, None), "REMOTE", &history),
            Verdict::Apply
        );
    }

    #[test]
    fn tombstones_bound_late_entries() {
        let reconciler = Reconciler::new("LOCAL");
        let history = LocalHistory {
            latest_for_key: None,
            latest_tombstone: Some(ts(50)),
        };
        assert_eq!(
            reconciler.decide(&entry(Activity::Update, 40, None), "REMOTE", &history),
            Verdict::Skip(SkipReason::BeforeTombstone)
        );
        assert_eq!(
            reconciler.decide(&entry(Activity::Drop, 50, None), "REMOTE", &history),
            Verdict::Skip(SkipReason::TombstoneCovered)
        );
        assert_eq!(
            reconciler.decide(&entry(Activity::Drop, 60, None), "REMOTE", &history),
            Verdict::Apply
        );
    }

    #[test]
    fn report_counts() {
        let mut report = ImportReport::default();
        report.record_applied(Activity::Update);
        report.record_applied(Activity::Drop);
        report.record_skipped(SkipReason::OwnEntry);
        report.record_skipped(SkipReason::LocalIsNewer);
        assert_eq!(report.applied(), 2);
        assert_eq!(report.skipped_own, 1);
        assert_eq!(report.skipped_stale, 1);
        assert_eq!(report.total(), 4);
    }
}
