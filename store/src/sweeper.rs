//! Auto-delete sweeper.
//!
//! A background task that removes documents whose auto-delete time has
//! passed. Each tick queues one sweep behind whatever the worker is already
//! doing; ticks are skipped while the store is closed.

use crate::error::Result;
use crate::executor::Session;
use crate::store::{Shared, StoreInner};
use crate::writer::{self, DeleteMode};
use std::sync::Weak;
use std::time::Duration;
use stow_engine::Collection;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// Delete every expired document. Returns how many were removed.
pub(crate) async fn sweep(shared: &Shared, session: &mut Session) -> Result<usize> {
    let now = shared.clock.now();
    let mut deleted = 0;

    for name in shared.registry.names() {
        let Ok(collection) = Collection::new(name) else {
            continue;
        };
        let keys = writer::expired_keys(session, &collection, now).await?;
        for key in keys {
            if writer::delete_value(shared, session, &collection, &key, DeleteMode::Expired).await? {
                deleted += 1;
            }
        }
    }

    if deleted > 0 {
        tracing::info!(deleted, "Auto-delete sweep removed expired documents");
    }
    Ok(deleted)
}

/// Start the periodic sweep. The task ends once the store is dropped.
pub(crate) fn spawn(store: Weak<StoreInner>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        tracing::debug!(interval_secs = period.as_secs(), "Starting auto-delete sweeper");
        let mut ticks = interval_at(Instant::now() + period, period);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticks.tick().await;
            let Some(inner) = store.upgrade() else {
                break;
            };
            if inner.is_closed() {
                continue;
            }

            let pending = inner.submit(|shared, session| Box::pin(sweep(shared, session)));
            drop(inner);
            if let Err(e) = pending.await {
                tracing::warn!(error = %e, "Auto-delete sweep failed");
            }
        }
        tracing::debug!("Auto-delete sweeper stopped");
    })
}
