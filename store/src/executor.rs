//! Serialized execution context.
//!
//! One worker task owns the only SQLite connection. Every statement the store
//! runs is wrapped in a job and queued here; jobs run one at a time in FIFO
//! order. Callers await a [`Pending`] handle, and a job that has not started
//! yet can be withdrawn through its [`CommandToken`].
//!
//! The connection is opened lazily by the first job that needs it and closed
//! again after `auto_close_after` without work.

use crate::error::{Result, StoreError};
use crate::row::{Row, SqlValue};
use futures::future::BoxFuture;
use sqlx::sqlite::{SqliteArguments, SqliteConnectOptions, SqliteConnection};
use sqlx::{ConnectOptions, Connection, Sqlite};
use std::collections::VecDeque;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;

type Query<'q> = sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>;

/// Outcome of a statement that returns no rows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Executed {
    pub rows_affected: u64,
    pub last_insert_rowid: i64,
}

/// The worker's view of the database.
#[derive(Debug)]
pub struct Session {
    options: SqliteConnectOptions,
    conn: Option<SqliteConnection>,
    log_sql: bool,
}

impl Session {
    pub(crate) fn new(path: &Path, log_sql: bool) -> Self {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .disable_statement_logging();
        Self {
            options,
            conn: None,
            log_sql,
        }
    }

    pub fn is_open(&self) -> bool {
        self.conn.is_some()
    }

    /// Open the file if it is not open yet.
    pub async fn open(&mut self) -> Result<()> {
        if self.conn.is_none() {
            let conn = self
                .options
                .connect()
                .await
                .map_err(StoreError::on_open)?;
            tracing::debug!(path = ?self.options.get_filename(), "Opened database file");
            self.conn = Some(conn);
        }
        Ok(())
    }

    pub async fn close(&mut self) {
        if let Some(conn) = self.conn.take() {
            if let Err(e) = conn.close().await {
                tracing::warn!(error = %e, "Error while closing database file");
            } else {
                tracing::debug!("Closed database file");
            }
        }
    }

    async fn connection(&mut self) -> Result<&mut SqliteConnection> {
        self.open().await?;
        self.conn
            .as_mut()
            .ok_or_else(|| StoreError::CannotOpenFile("connection unavailable".into()))
    }

    fn trace(&self, sql: &str, params: &[SqlValue]) {
        if self.log_sql {
            tracing::debug!(sql, params = ?params, "Executing statement");
        }
    }

    /// Run a statement without parameters.
    pub async fn execute(&mut self, sql: &str) -> Result<Executed> {
        self.execute_with(sql, &[]).await
    }

    /// Run a statement with positional parameters.
    pub async fn execute_with(&mut self, sql: &str, params: &[SqlValue]) -> Result<Executed> {
        self.trace(sql, params);
        let conn = self.connection().await?;
        let done = bind_all(sqlx::query(sql).persistent(false), params)
            .execute(&mut *conn)
            .await?;
        Ok(Executed {
            rows_affected: done.rows_affected(),
            last_insert_rowid: done.last_insert_rowid(),
        })
    }

    pub async fn query(&mut self, sql: &str) -> Result<Vec<Row>> {
        self.query_with(sql, &[]).await
    }

    pub async fn query_with(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>> {
        self.trace(sql, params);
        let conn = self.connection().await?;
        let rows = bind_all(sqlx::query(sql).persistent(false), params)
            .fetch_all(&mut *conn)
            .await?;
        rows.iter()
            .map(|row| Row::decode(row).map_err(StoreError::from))
            .collect()
    }

    /// First column of every row, as text.
    pub async fn query_strings(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<String>> {
        let rows = self.query_with(sql, params).await?;
        Ok(rows
            .into_iter()
            .filter_map(|row| row.values.into_iter().next())
            .filter_map(|value| match value {
                SqlValue::Text(s) => Some(s),
                SqlValue::Integer(i) => Some(i.to_string()),
                _ => None,
            })
            .collect())
    }

    /// Whether the statement returns at least one row.
    pub async fn exists(&mut self, sql: &str, params: &[SqlValue]) -> Result<bool> {
        Ok(!self.query_with(sql, params).await?.is_empty())
    }
}

fn bind_all<'q>(mut query: Query<'q>, params: &[SqlValue]) -> Query<'q> {
    for param in params {
        query = match param {
            SqlValue::Null => query.bind(None::<String>),
            SqlValue::Integer(i) => query.bind(*i),
            SqlValue::Real(d) => query.bind(*d),
            SqlValue::Text(s) => query.bind(s.clone()),
        };
    }
    query
}

type Job = Box<dyn for<'c> FnOnce(&'c mut Session) -> BoxFuture<'c, ()> + Send>;

struct Queued {
    id: u64,
    job: Job,
}

#[derive(Default)]
struct Queue {
    jobs: Mutex<VecDeque<Queued>>,
    notify: Notify,
    next_id: AtomicU64,
    shutdown: AtomicBool,
}

impl Queue {
    fn jobs(&self) -> MutexGuard<'_, VecDeque<Queued>> {
        self.jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn push(&self, job: Job) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.jobs().push_back(Queued { id, job });
        self.notify.notify_one();
        id
    }

    fn pop(&self) -> Option<Queued> {
        self.jobs().pop_front()
    }

    fn remove(&self, id: u64) -> bool {
        let mut jobs = self.jobs();
        match jobs.iter().position(|queued| queued.id == id) {
            Some(index) => {
                jobs.remove(index);
                true
            }
            None => false,
        }
    }

    fn len(&self) -> usize {
        self.jobs().len()
    }
}

/// Identifies a submitted job so it can be withdrawn before it starts.
#[derive(Clone)]
pub struct CommandToken {
    id: u64,
    queue: Weak<Queue>,
}

impl CommandToken {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Remove the job from the queue.
    ///
    /// Returns `false` if it already started (or finished); it then runs to
    /// completion. A cancelled job's [`Pending`] resolves to
    /// [`StoreError::Cancelled`].
    pub fn cancel(&self) -> bool {
        let removed = self
            .queue
            .upgrade()
            .is_some_and(|queue| queue.remove(self.id));
        if removed {
            tracing::debug!(command = self.id, "Cancelled queued command");
        }
        removed
    }
}

impl std::fmt::Debug for CommandToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandToken").field("id", &self.id).finish()
    }
}

/// Result of a submitted job.
#[must_use = "a pending command does nothing unless awaited or cancelled"]
pub struct Pending<T> {
    token: CommandToken,
    rx: oneshot::Receiver<Result<T>>,
}

impl<T> Pending<T> {
    pub fn token(&self) -> CommandToken {
        self.token.clone()
    }

    pub fn cancel(&self) -> bool {
        self.token.cancel()
    }
}

impl<T> Future for Pending<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.get_mut().rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(StoreError::Cancelled)))
    }
}

/// Handle to the worker task.
pub(crate) struct Executor {
    queue: Arc<Queue>,
    worker: JoinHandle<()>,
}

impl Executor {
    /// Spawn the worker. Must be called inside a tokio runtime.
    pub fn spawn(session: Session, auto_close_after: Option<Duration>) -> Self {
        let queue = Arc::new(Queue::default());
        let worker = tokio::spawn(run(queue.clone(), session, auto_close_after));
        Self { queue, worker }
    }

    /// Queue a job.
    pub fn submit<T, F>(&self, f: F) -> Pending<T>
    where
        T: Send + 'static,
        F: for<'c> FnOnce(&'c mut Session) -> BoxFuture<'c, Result<T>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job = job(move |session| {
            Box::pin(async move {
                let _ = tx.send(f(session).await);
            })
        });

        if self.worker.is_finished() || self.queue.shutdown.load(Ordering::Acquire) {
            let (dead_tx, dead_rx) = oneshot::channel();
            let _ = dead_tx.send(Err(StoreError::WorkerStopped));
            return Pending {
                token: CommandToken {
                    id: u64::MAX,
                    queue: Weak::new(),
                },
                rx: dead_rx,
            };
        }

        let id = self.queue.push(job);
        Pending {
            token: CommandToken {
                id,
                queue: Arc::downgrade(&self.queue),
            },
            rx,
        }
    }

    /// Number of jobs waiting to start.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        self.queue.shutdown.store(true, Ordering::Release);
        self.queue.notify.notify_one();
    }
}

fn job<F>(f: F) -> Job
where
    F: for<'c> FnOnce(&'c mut Session) -> BoxFuture<'c, ()> + Send + 'static,
{
    Box::new(f)
}

async fn run(queue: Arc<Queue>, mut session: Session, auto_close_after: Option<Duration>) {
    tracing::debug!("Store worker started");
    loop {
        if let Some(next) = queue.pop() {
            (next.job)(&mut session).await;
            continue;
        }

        if queue.shutdown.load(Ordering::Acquire) {
            break;
        }

        match auto_close_after {
            Some(idle) if session.is_open() => {
                if tokio::time::timeout(idle, queue.notify.notified())
                    .await
                    .is_err()
                {
                    tracing::debug!(idle_ms = idle.as_millis() as u64, "Closing idle database");
                    session.close().await;
                }
            }
            _ => queue.notify.notified().await,
        }
    }
    session.close().await;
    tracing::debug!("Store worker stopped");
}
