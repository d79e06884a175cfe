//! Replica synchronization: enabling the change log, exporting it as a sync
//! file, and importing a peer's file with last-writer-wins.

use crate::changelog::{self, Provenance};
use crate::error::{Result, StoreError};
use crate::executor::Session;
use crate::store::Shared;
use crate::subscriptions::ChangeEvent;
use crate::sweeper;
use crate::writer::{self, DeleteMode, WriteDates};
use serde::{Deserialize, Serialize};
use stow_engine::{
    Activity, Collection, ImportReport, Reconciler, StoredDocument, SyncEntry, SyncFile, Verdict,
};

/// Progress callback, called with the completed fraction of an import every
/// `progress_interval` entries and always with `1.0` at the end.
pub type Progress = Box<dyn FnMut(f64) + Send>;

/// Result of applying a sync file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportOutcome {
    /// Replica the file came from.
    pub source_replica: String,
    /// Watermark to pass back to that replica's next export.
    pub last_sequence: i64,
    pub report: ImportReport,
}

fn require_enabled(shared: &Shared) -> Result<()> {
    if shared.sync.is_enabled() {
        Ok(())
    } else {
        Err(StoreError::SyncNotEnabled)
    }
}

/// Create the log tables and log every existing document once.
pub(crate) async fn enable(shared: &Shared, session: &mut Session) -> Result<()> {
    if changelog::tables_exist(session).await? {
        shared.sync.set_enabled(true);
        return Ok(());
    }

    changelog::create_tables(session).await?;
    shared.sync.set_unsynced(Vec::new());
    let provenance = shared.local_provenance();
    let seeded = changelog::seed(session, &shared.registry, &shared.sync, &provenance).await?;
    shared.sync.set_enabled(true);
    tracing::info!(seeded, "Syncing enabled");
    Ok(())
}

pub(crate) async fn disable(shared: &Shared, session: &mut Session) -> Result<()> {
    changelog::drop_tables(session).await?;
    shared.sync.set_enabled(false);
    shared.sync.set_unsynced(Vec::new());
    tracing::info!("Syncing disabled");
    Ok(())
}

/// Replace the set of collections that are kept out of the log.
pub(crate) async fn set_unsynced(shared: &Shared, session: &mut Session, collections: Vec<String>) -> Result<()> {
    require_enabled(shared)?;
    changelog::save_unsynced(session, &collections).await?;
    changelog::purge_tables(session, &collections).await?;
    tracing::debug!(collections = ?collections, "Unsynced collections updated");
    shared.sync.set_unsynced(collections);
    Ok(())
}

/// Export every entry after `since` that `target` has not seen.
pub(crate) async fn build(shared: &Shared, session: &mut Session, since: i64, target: &str) -> Result<SyncFile> {
    require_enabled(shared)?;
    let local = shared.instance_key();
    let rows = changelog::since(session, since, target).await?;

    let mut file = SyncFile::new(local.clone(), since);
    for row in rows {
        file.last_sequence = row.sequence;

        let value = match row.activity {
            Activity::Update => {
                let (Ok(collection), Some(key)) = (Collection::new(row.table.clone()), row.key.as_deref()) else {
                    continue;
                };
                match writer::read_document(shared, session, &collection, key).await? {
                    Some(stored) => Some(stored.to_sync_value()),
                    None => {
                        tracing::debug!(collection = %collection, key, "Logged document no longer exists");
                        continue;
                    }
                }
            }
            Activity::Delete | Activity::Drop => None,
        };

        file.log_entries.push(SyncEntry {
            time_stamp: row.timestamp,
            table_name: row.table,
            activity: row.activity,
            key: row.key,
            original_db: (row.origin != local).then_some(row.origin),
            value,
        });
    }

    tracing::info!(
        target_replica = target,
        entries = file.log_entries.len(),
        last_sequence = file.last_sequence,
        "Built sync file"
    );
    Ok(file)
}

/// An entry checked and decoded ahead of the import.
enum Prepared {
    Update(Collection, StoredDocument),
    Delete(Collection, String),
    Drop(Collection),
}

fn prepare(entry: &SyncEntry) -> stow_engine::Result<Prepared> {
    let collection = entry.collection()?;
    Ok(match entry.activity {
        Activity::Update => {
            let key = entry.document_key()?;
            let value = entry.value.clone().unwrap_or_default();
            Prepared::Update(collection, StoredDocument::from_sync_value(key, &value)?)
        }
        Activity::Delete => Prepared::Delete(collection, entry.document_key()?.to_string()),
        Activity::Drop => Prepared::Drop(collection),
    })
}

/// Apply a peer's sync file.
///
/// The whole file is checked before anything is written; a malformed file
/// changes nothing. Entries that fail to apply are logged and counted.
pub(crate) async fn apply(
    shared: &Shared,
    session: &mut Session,
    file: SyncFile,
    mut progress: Option<Progress>,
) -> Result<ImportOutcome> {
    require_enabled(shared)?;

    let prepared = file
        .validate()
        .and_then(|()| file.log_entries.iter().map(prepare).collect::<stow_engine::Result<Vec<_>>>())
        .map_err(|e| StoreError::CannotParseData(e.to_string()))?;

    sweeper::sweep(shared, session).await?;

    let reconciler = Reconciler::new(shared.instance_key());
    let source = file.source_db.as_str();
    let total = file.log_entries.len();
    let every = shared.config.progress_interval.max(1);
    let mut report = ImportReport::default();

    for (index, (entry, prepared)) in file.log_entries.iter().zip(prepared).enumerate() {
        let history = changelog::history(session, &entry.table_name, entry.key.as_deref()).await?;
        match reconciler.decide(entry, source, &history) {
            Verdict::Skip(reason) => {
                tracing::trace!(table = %entry.table_name, key = ?entry.key, reason = ?reason, "Skipped sync entry");
                report.record_skipped(reason);
            }
            Verdict::Apply => {
                let provenance = Provenance {
                    source: source.to_string(),
                    origin: entry.origin(source).to_string(),
                    at: entry.time_stamp,
                };
                match apply_entry(shared, session, prepared, &provenance).await {
                    Ok(()) => report.record_applied(entry.activity),
                    Err(e) => {
                        tracing::warn!(
                            table = %entry.table_name,
                            key = ?entry.key,
                            activity = %entry.activity,
                            error = %e,
                            "Failed to apply sync entry"
                        );
                        report.failed += 1;
                    }
                }
            }
        }

        let done = index + 1;
        if done % every == 0 {
            if let Some(progress) = progress.as_mut() {
                progress(done as f64 / total as f64);
            }
        }
    }
    if total % every != 0 || total == 0 {
        if let Some(progress) = progress.as_mut() {
            progress(1.0);
        }
    }

    tracing::info!(
        source_replica = source,
        applied = report.applied(),
        skipped = report.skipped_own + report.skipped_stale,
        failed = report.failed,
        "Applied sync file"
    );
    shared.subscriptions.publish(ChangeEvent::SyncApplied {
        source_db: file.source_db.clone(),
        last_sequence: file.last_sequence,
    });

    Ok(ImportOutcome {
        source_replica: file.source_db,
        last_sequence: file.last_sequence,
        report,
    })
}

async fn apply_entry(shared: &Shared, session: &mut Session, prepared: Prepared, provenance: &Provenance) -> Result<()> {
    match prepared {
        Prepared::Update(collection, stored) => {
            let dates = WriteDates {
                auto_delete: stored.auto_delete,
                added: stored.added,
                updated: stored.updated,
            };
            writer::set_value(shared, session, &collection, stored.document, dates, provenance).await
        }
        Prepared::Delete(collection, key) => {
            writer::delete_value(shared, session, &collection, &key, DeleteMode::Explicit(provenance)).await?;
            Ok(())
        }
        Prepared::Drop(collection) => apply_drop(shared, session, &collection, provenance).await,
    }
}

/// Everything in the collection older than the tombstone goes; newer
/// documents survive.
async fn apply_drop(shared: &Shared, session: &mut Session, collection: &Collection, provenance: &Provenance) -> Result<()> {
    let table = collection.as_str();
    writer::begin(session).await?;
    let outcome = async {
        let removed = writer::purge_before(shared, session, collection, provenance.at).await?;
        changelog::purge_before(session, table, provenance.at).await?;
        if !changelog::has_tombstone(session, table, provenance.at).await? {
            changelog::append(session, provenance, table, Activity::Drop, None).await?;
        }
        Ok::<_, StoreError>(removed)
    }
    .await;

    let removed = match outcome {
        Ok(removed) => {
            writer::commit(session).await?;
            removed
        }
        Err(e) => {
            writer::abort(session).await;
            return Err(e);
        }
    };

    tracing::debug!(collection = %collection, removed, "Applied drop tombstone");
    if removed > 0 {
        shared.subscriptions.publish(ChangeEvent::Dropped {
            collection: collection.to_string(),
        });
    }
    Ok(())
}
