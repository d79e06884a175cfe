//! The store handle.
//!
//! [`Store`] is a cheap-to-clone handle over one SQLite file. Every public
//! operation validates its arguments, queues one job on the worker and
//! awaits it; the worker reopens and bootstraps the file first if it was
//! closed.

use crate::changelog::{self, Provenance, SyncState};
use crate::config::StoreConfig;
use crate::error::{Result, StoreError};
use crate::executor::{Executor, Pending, Session};
use crate::query;
use crate::registry::{self, Registry};
use crate::row::Row;
use crate::settings;
use crate::subscriptions::{Subscription, Subscriptions};
use crate::sweeper;
use crate::sync::{self, ImportOutcome, Progress};
use crate::writer::{self, DeleteMode, WriteDates};
use futures::future::BoxFuture;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use stow_engine::{
    Clock, Collection, Document, KeyQuery, StoredDocument, SyncFile, SystemClock, Timestamp,
};
use tokio::task::JoinHandle;

/// State shared between the handle, the worker's jobs and the sweeper.
#[derive(Debug)]
pub(crate) struct Shared {
    pub config: StoreConfig,
    pub clock: Arc<dyn Clock>,
    pub registry: Registry,
    pub sync: SyncState,
    pub subscriptions: Subscriptions,
    instance_key: RwLock<Option<String>>,
    closed: AtomicBool,
}

impl Shared {
    fn new(config: StoreConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            registry: Registry::new(),
            sync: SyncState::default(),
            subscriptions: Subscriptions::new(),
            instance_key: RwLock::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// This replica's instance key. Empty until the file was first opened.
    pub fn instance_key(&self) -> String {
        self.instance_key
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
            .unwrap_or_default()
    }

    /// Provenance of a change made here, now.
    pub fn local_provenance(&self) -> Provenance {
        Provenance::local(&self.instance_key(), self.clock.now())
    }

    /// Open and bootstrap the file if the worker closed it.
    async fn ready(&self, session: &mut Session) -> Result<()> {
        if !session.is_open() {
            if let Err(e) = self.bootstrap(session).await {
                session.close().await;
                return Err(e);
            }
            self.closed.store(false, Ordering::Release);
        }
        Ok(())
    }

    async fn bootstrap(&self, session: &mut Session) -> Result<()> {
        session.open().await?;

        let check = session.query_strings("pragma quick_check", &[]).await?;
        if check.first().map(String::as_str) != Some("ok") {
            return Err(StoreError::DamagedFile(check.join("; ")));
        }

        settings::ensure_metadata(session).await?;
        let key = settings::instance_key(session).await?;
        *self
            .instance_key
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(key);

        self.registry.refresh(session).await?;

        let enabled = changelog::tables_exist(session).await?;
        let unsynced = if enabled {
            changelog::load_unsynced(session).await?
        } else {
            Vec::new()
        };
        self.sync.set_unsynced(unsynced);
        self.sync.set_enabled(enabled);

        tracing::info!(
            path = %self.config.path.display(),
            collections = self.registry.names().len(),
            syncing = enabled,
            "Store ready"
        );
        Ok(())
    }
}

pub(crate) struct StoreInner {
    executor: Executor,
    shared: Arc<Shared>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl StoreInner {
    /// Queue a job that runs against a ready file.
    pub(crate) fn submit<T, F>(&self, f: F) -> Pending<T>
    where
        T: Send + 'static,
        F: for<'c> FnOnce(&'c Shared, &'c mut Session) -> BoxFuture<'c, Result<T>> + Send + 'static,
    {
        let shared = self.shared.clone();
        self.executor.submit(move |session| {
            Box::pin(async move {
                shared.ready(session).await?;
                f(&shared, session).await
            })
        })
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }
}

impl Drop for StoreInner {
    fn drop(&mut self) {
        let handle = self
            .sweeper
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
    }
}

/// Handle to an open store.
///
/// Clones share the same worker, registry and subscriptions.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("path", &self.inner.shared.config.path)
            .field("queued", &self.inner.executor.queued())
            .finish()
    }
}

impl Store {
    /// Open (or create) the store described by `config`.
    ///
    /// Must be called inside a tokio runtime.
    pub async fn open(config: StoreConfig) -> Result<Self> {
        Self::open_with_clock(config, Arc::new(SystemClock)).await
    }

    /// Like [`Store::open`], reading "now" from `clock`.
    pub async fn open_with_clock(config: StoreConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let session = Session::new(&config.path, config.log_sql);
        let executor = Executor::spawn(session, config.auto_close_after);
        let expiry_interval = config.expiry_interval;

        let inner = Arc::new(StoreInner {
            executor,
            shared: Arc::new(Shared::new(config, clock)),
            sweeper: Mutex::new(None),
        });

        inner
            .submit(|_, _| Box::pin(async move { Ok(()) }))
            .await?;

        if let Some(period) = expiry_interval {
            let handle = sweeper::spawn(Arc::downgrade(&inner), period);
            *inner
                .sweeper
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(handle);
        }

        Ok(Self { inner })
    }

    fn submit<T, F>(&self, f: F) -> Pending<T>
    where
        T: Send + 'static,
        F: for<'c> FnOnce(&'c Shared, &'c mut Session) -> BoxFuture<'c, Result<T>> + Send + 'static,
    {
        self.inner.submit(f)
    }

    /// Close the file once queued work is done. The next operation reopens it.
    pub async fn close(&self) -> Result<()> {
        self.inner.shared.closed.store(true, Ordering::Release);
        self.inner
            .executor
            .submit(|session| {
                Box::pin(async move {
                    session.close().await;
                    Ok(())
                })
            })
            .await
    }

    /// Number of jobs waiting for the worker.
    pub fn queued(&self) -> usize {
        self.inner.executor.queued()
    }

    /// This replica's persistent instance key.
    pub async fn instance_key(&self) -> Result<String> {
        self.submit(|shared, _| Box::pin(async move { Ok(shared.instance_key()) }))
            .await
    }

    pub async fn has_collection(&self, collection: &str) -> Result<bool> {
        let name = collection.to_string();
        self.submit(move |shared, _| Box::pin(async move { Ok(shared.registry.contains(&name)) }))
            .await
    }

    /// Names of every collection, sorted.
    pub async fn collections(&self) -> Result<Vec<String>> {
        self.submit(|shared, _| Box::pin(async move { Ok(shared.registry.names()) }))
            .await
    }

    /// Replace a collection's secondary indexes.
    ///
    /// Each entry is one index; `"last,first"` is a compound index.
    pub async fn set_indexes(&self, collection: &str, indexes: &[&str]) -> Result<()> {
        let collection = Collection::new(collection)?;
        let specs = registry::parse_index_specs(indexes)?;
        self.submit(move |shared, session| {
            Box::pin(async move { shared.registry.set_indexes(session, &collection, specs).await })
        })
        .await
    }

    /// Insert or fully replace a document.
    ///
    /// Fields missing from `value` are cleared. With `auto_delete`, the
    /// document is removed by the first sweep after that time.
    pub async fn set_value(
        &self,
        collection: &str,
        key: &str,
        value: &Map<String, Value>,
        auto_delete: Option<Timestamp>,
    ) -> Result<()> {
        let collection = Collection::new(collection)?;
        let document = Document::from_map(key, value)?;
        self.write(collection, document, auto_delete).await
    }

    /// [`Store::set_value`] taking a JSON object as text.
    pub async fn set_value_json(
        &self,
        collection: &str,
        key: &str,
        json: &str,
        auto_delete: Option<Timestamp>,
    ) -> Result<()> {
        let collection = Collection::new(collection)?;
        let document = Document::from_json_str(key, json)?;
        self.write(collection, document, auto_delete).await
    }

    async fn write(&self, collection: Collection, document: Document, auto_delete: Option<Timestamp>) -> Result<()> {
        self.submit(move |shared, session| {
            Box::pin(async move {
                let provenance = shared.local_provenance();
                let dates = WriteDates {
                    auto_delete,
                    ..WriteDates::default()
                };
                writer::set_value(shared, session, &collection, document, dates, &provenance).await
            })
        })
        .await
    }

    /// Read a document back with its system timestamps.
    pub async fn stored_value(&self, collection: &str, key: &str) -> Result<Option<StoredDocument>> {
        let collection = Collection::new(collection)?;
        let key = key.to_string();
        self.submit(move |shared, session| {
            Box::pin(async move { writer::read_document(shared, session, &collection, &key).await })
        })
        .await
    }

    /// Read a document. `None` if the key or the collection is unknown.
    pub async fn value(&self, collection: &str, key: &str) -> Result<Option<Document>> {
        Ok(self
            .stored_value(collection, key)
            .await?
            .map(|stored| stored.document))
    }

    /// [`Store::value`] as compact JSON text.
    pub async fn value_json(&self, collection: &str, key: &str) -> Result<Option<String>> {
        match self.value(collection, key).await? {
            Some(document) => serde_json::to_string(&document.to_json())
                .map(Some)
                .map_err(|e| StoreError::CannotParseData(e.to_string())),
            None => Ok(None),
        }
    }

    /// Delete a document. Returns whether it existed.
    pub async fn delete_value(&self, collection: &str, key: &str) -> Result<bool> {
        let collection = Collection::new(collection)?;
        let key = key.to_string();
        self.submit(move |shared, session| {
            Box::pin(async move {
                if !shared.registry.contains(collection.as_str()) {
                    return Err(StoreError::TableNotFound(collection.to_string()));
                }
                let provenance = shared.local_provenance();
                writer::delete_value(shared, session, &collection, &key, DeleteMode::Explicit(&provenance)).await
            })
        })
        .await
    }

    /// Drop a collection and all its documents.
    pub async fn drop_collection(&self, collection: &str) -> Result<()> {
        let collection = Collection::new(collection)?;
        self.submit(move |shared, session| {
            Box::pin(async move {
                let provenance = shared.local_provenance();
                writer::drop_collection(shared, session, &collection, Some(&provenance)).await
            })
        })
        .await
    }

    /// Drop every collection.
    pub async fn drop_all_collections(&self) -> Result<()> {
        self.submit(|shared, session| {
            Box::pin(async move {
                let provenance = shared.local_provenance();
                for name in shared.registry.names() {
                    let collection = Collection::new(name)?;
                    writer::drop_collection(shared, session, &collection, Some(&provenance)).await?;
                }
                Ok(())
            })
        })
        .await
    }

    pub async fn has_key(&self, collection: &str, key: &str) -> Result<bool> {
        let collection = Collection::new(collection)?;
        let key = key.to_string();
        self.submit(move |shared, session| {
            Box::pin(async move { writer::has_key(shared, session, &collection, &key).await })
        })
        .await
    }

    /// Whether every key is present. An empty list is trivially present.
    pub async fn has_all_keys(&self, collection: &str, keys: &[&str]) -> Result<bool> {
        let collection = Collection::new(collection)?;
        if keys.is_empty() {
            return Ok(true);
        }
        let keys: Vec<String> = keys.iter().map(|k| k.to_string()).collect();
        self.submit(move |shared, session| {
            Box::pin(async move { writer::has_all_keys(shared, session, &collection, &keys).await })
        })
        .await
    }

    /// Keys of the documents matching `key_query`.
    pub async fn find_keys(&self, collection: &str, key_query: KeyQuery) -> Result<Vec<String>> {
        self.find_keys_pending(collection, key_query)?.await
    }

    /// [`Store::find_keys`] returning the queued job, which can be cancelled
    /// until the worker starts it.
    pub fn find_keys_pending(&self, collection: &str, key_query: KeyQuery) -> Result<Pending<Vec<String>>> {
        let collection = Collection::new(collection)?;
        Ok(self.submit(move |shared, session| {
            Box::pin(async move { query::find_keys(shared, session, &collection, &key_query).await })
        }))
    }

    /// Run a raw select and return every row.
    pub async fn select_rows(&self, sql: &str) -> Result<Vec<Row>> {
        let sql = sql.to_string();
        self.submit(move |_, session| Box::pin(async move { query::select_rows(session, &sql).await }))
            .await
    }

    /// Start logging changes. Existing documents are logged once.
    pub async fn enable_syncing(&self) -> Result<()> {
        self.submit(|shared, session| Box::pin(sync::enable(shared, session)))
            .await
    }

    /// Stop logging changes and discard the log.
    pub async fn disable_syncing(&self) -> Result<()> {
        self.submit(|shared, session| Box::pin(sync::disable(shared, session)))
            .await
    }

    pub async fn is_syncing_enabled(&self) -> Result<bool> {
        self.submit(|shared, _| Box::pin(async move { Ok(shared.sync.is_enabled()) }))
            .await
    }

    /// Keep `collections` out of the change log from now on.
    pub async fn set_unsynced_collections(&self, collections: &[&str]) -> Result<()> {
        let names = collections
            .iter()
            .map(|name| Collection::new(*name).map(String::from))
            .collect::<stow_engine::Result<Vec<_>>>()?;
        self.submit(move |shared, session| Box::pin(sync::set_unsynced(shared, session, names)))
            .await
    }

    /// Export the changes after sequence `since` for `target_replica`.
    pub async fn build_sync_log(&self, since: i64, target_replica: &str) -> Result<SyncFile> {
        let target = target_replica.to_string();
        self.submit(move |shared, session| {
            Box::pin(async move { sync::build(shared, session, since, &target).await })
        })
        .await
    }

    /// Import a sync file given as JSON text.
    pub async fn apply_sync_log(&self, json: &str, progress: Option<Progress>) -> Result<ImportOutcome> {
        let file = SyncFile::from_json(json).map_err(|e| StoreError::CannotParseData(e.to_string()))?;
        self.apply_sync_file(file, progress).await
    }

    pub async fn apply_sync_file(&self, file: SyncFile, progress: Option<Progress>) -> Result<ImportOutcome> {
        self.submit(move |shared, session| Box::pin(sync::apply(shared, session, file, progress)))
            .await
    }

    /// Run one auto-delete pass now. Returns how many documents were removed.
    pub async fn sweep_expired(&self) -> Result<usize> {
        self.submit(|shared, session| Box::pin(sweeper::sweep(shared, session)))
            .await
    }

    /// Receive a [`ChangeEvent`](crate::ChangeEvent) after every committed change.
    pub fn subscribe(&self) -> Subscription {
        self.inner.shared.subscriptions.subscribe()
    }

    pub fn unsubscribe(&self, id: &str) -> bool {
        self.inner.shared.subscriptions.unsubscribe(id)
    }
}
