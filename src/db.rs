use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use rusqlite::ffi::ErrorCode;
use rusqlite::{Connection, Error as SqliteError, OpenFlags, OptionalExtension};
use tracing::{info, warn};

use crate::cache::CacheStore;
use crate::errors::{AppError, AppResult};

pub const CACHE_STORE_KEY: &str = "geocode_cache";

/// Key-value table in a SQLite file, holding the serialized geocode cache under one key.
pub struct SqliteStore {
    connection: Mutex<Connection>,
    path: Option<PathBuf>,
    key: String,
    recovered: bool,
}

impl SqliteStore {
    pub fn open<P: AsRef<Path>>(db_path: P) -> AppResult<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let (connection, recovered) = match establish_connection(db_path) {
            Ok(connection) => (connection, false),
            Err(AppError::Database(err)) if should_attempt_recovery(&err, db_path) => {
                warn!(
                    target: "cache_store",
                    path = %db_path.display(),
                    error = %err,
                    "cache database failed to open, discarding it"
                );
                recover_store(db_path)?;
                (establish_connection(db_path)?, true)
            }
            Err(err) => return Err(err),
        };

        info!(
            target: "cache_store",
            path = %db_path.display(),
            recovered,
            "sqlite cache store ready"
        );
        Ok(Self {
            connection: Mutex::new(connection),
            path: Some(db_path.to_path_buf()),
            key: CACHE_STORE_KEY.to_string(),
            recovered,
        })
    }

    pub fn in_memory() -> AppResult<Self> {
        let connection = Connection::open_in_memory()?;
        run_migrations(&connection)?;
        Ok(Self {
            connection: Mutex::new(connection),
            path: None,
            key: CACHE_STORE_KEY.to_string(),
            recovered: false,
        })
    }

    pub fn recovered(&self) -> bool {
        self.recovered
    }
}

impl CacheStore for SqliteStore {
    fn load(&self) -> AppResult<Option<String>> {
        let conn = self.connection.lock();
        conn.query_row(
            "SELECT value FROM kv_store WHERE key = ?1",
            [&self.key],
            |row| row.get(0),
        )
        .optional()
        .map_err(AppError::from)
    }

    fn save(&self, payload: &str) -> AppResult<()> {
        let conn = self.connection.lock();
        conn.execute(
            "INSERT INTO kv_store (key, value, updated_at)
            VALUES (?1, ?2, DATETIME('now'))
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at",
            (&self.key, payload),
        )?;
        Ok(())
    }

    fn describe(&self) -> String {
        match &self.path {
            Some(path) => format!("sqlite:{}", path.display()),
            None => "sqlite::memory:".into(),
        }
    }
}

fn establish_connection(db_path: &Path) -> AppResult<Connection> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE;
    let connection = Connection::open_with_flags(db_path, flags)?;
    connection.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        "#,
    )?;
    run_migrations(&connection)?;
    Ok(connection)
}

fn run_migrations(connection: &Connection) -> AppResult<()> {
    connection.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS kv_store (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at TEXT NOT NULL DEFAULT (DATETIME('now'))
        );
        "#,
    )?;
    Ok(())
}

fn should_attempt_recovery(err: &SqliteError, db_path: &Path) -> bool {
    if !db_path.exists() {
        return false;
    }

    match err {
        SqliteError::SqliteFailure(code, message) => {
            matches!(code.code, ErrorCode::NotADatabase | ErrorCode::DatabaseCorrupt)
                || message
                    .as_deref()
                    .map(|msg| msg.contains("database disk image is malformed"))
                    .unwrap_or(false)
        }
        _ => false,
    }
}

fn recover_store(db_path: &Path) -> AppResult<()> {
    remove_if_exists(db_path)?;
    remove_if_exists(&sidecar_path(db_path, "-wal"))?;
    remove_if_exists(&sidecar_path(db_path, "-shm"))?;
    Ok(())
}

fn remove_if_exists(path: &Path) -> AppResult<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(AppError::Io(err)),
    }
}

fn sidecar_path(db_path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(db_path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}
