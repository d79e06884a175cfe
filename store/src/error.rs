//! Unified error handling for the store.
//!
//! Storage failures are classified by SQLite's primary result code so callers
//! can tell an unwritable file from a damaged one without parsing messages.

/// Store error type.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("cannot open database file: {0}")]
    CannotOpenFile(String),

    #[error("cannot write to database file: {0}")]
    CannotWriteToFile(String),

    #[error("disk error: {0}")]
    DiskError(String),

    #[error("database file is damaged: {0}")]
    DamagedFile(String),

    #[error("collection not found: {0}")]
    TableNotFound(String),

    #[error("cannot parse data: {0}")]
    CannotParseData(String),

    #[error("database error {code}: {message}")]
    Other { code: i32, message: String },

    #[error("engine error: {0}")]
    Engine(#[from] stow_engine::Error),

    #[error("syncing is not enabled")]
    SyncNotEnabled,

    #[error("command was cancelled before it started")]
    Cancelled,

    #[error("store worker has stopped")]
    WorkerStopped,
}

impl StoreError {
    /// Numeric code in the store's error taxonomy.
    ///
    /// Storage errors carry SQLite's primary result code; data errors are
    /// negative.
    pub fn code(&self) -> i32 {
        match self {
            StoreError::CannotWriteToFile(_) => SQLITE_READONLY,
            StoreError::DiskError(_) => SQLITE_IOERR,
            StoreError::DamagedFile(_) => SQLITE_CORRUPT,
            StoreError::CannotOpenFile(_) => SQLITE_CANTOPEN,
            StoreError::TableNotFound(_) => -1,
            StoreError::CannotParseData(_) | StoreError::Engine(_) => -2,
            StoreError::Other { code, .. } => *code,
            StoreError::SyncNotEnabled => -3,
            StoreError::Cancelled => -4,
            StoreError::WorkerStopped => -5,
        }
    }

    /// Classify an error raised while opening the file.
    pub(crate) fn on_open(err: sqlx::Error) -> Self {
        match StoreError::from(err) {
            StoreError::Other { message, .. } | StoreError::DiskError(message) => {
                StoreError::CannotOpenFile(message)
            }
            other => other,
        }
    }

    /// Whether re-reading the schema and retrying could help.
    pub(crate) fn is_storage(&self) -> bool {
        matches!(self, StoreError::Other { .. } | StoreError::TableNotFound(_))
    }
}

const SQLITE_ERROR: i32 = 1;
const SQLITE_READONLY: i32 = 8;
const SQLITE_IOERR: i32 = 10;
const SQLITE_CORRUPT: i32 = 11;
const SQLITE_CANTOPEN: i32 = 14;
const SQLITE_NOTADB: i32 = 26;

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(db) => {
                let message = db.message().to_string();
                let code = db
                    .code()
                    .and_then(|c| c.parse::<i32>().ok())
                    .unwrap_or(SQLITE_ERROR);
                match code & 0xff {
                    SQLITE_READONLY => StoreError::CannotWriteToFile(message),
                    SQLITE_IOERR => StoreError::DiskError(message),
                    SQLITE_CORRUPT | SQLITE_NOTADB => StoreError::DamagedFile(message),
                    SQLITE_CANTOPEN => StoreError::CannotOpenFile(message),
                    _ => StoreError::Other { code, message },
                }
            }
            sqlx::Error::Io(e) => StoreError::DiskError(e.to_string()),
            sqlx::Error::ColumnDecode { source, .. } | sqlx::Error::Decode(source) => {
                StoreError::CannotParseData(source.to_string())
            }
            other => StoreError::Other {
                code: SQLITE_ERROR,
                message: other.to_string(),
            },
        }
    }
}

/// Result type alias for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
