use std::path::Path;
use std::time::Duration;

use log::info;
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, OptionalExtension, Transaction, TransactionBehavior};

use crate::error::MentorLoopError;
use crate::schema::{CREATE_SCHEMA_SQL, SCHEMA_VERSION};

const DB_FILENAME: &str = "mentorloop.db";
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub type PooledConn = PooledConnection<SqliteConnectionManager>;

/// Pooled access to the SQLite store backing both hierarchies and the ledgers.
#[derive(Clone)]
pub struct Database {
    pool: Pool<SqliteConnectionManager>,
}

impl Database {
    /// Open (creating if needed) the database file inside `db_folder`.
    pub fn connect(db_folder: &Path) -> Result<Self, MentorLoopError> {
        if !db_folder.is_dir() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotADirectory,
                format!(
                    "Database folder '{}' does not exist or is not a directory",
                    db_folder.display()
                ),
            )
            .into());
        }

        let db_path = db_folder.join(DB_FILENAME);
        let manager = SqliteConnectionManager::file(&db_path).with_init(|c| {
            c.busy_timeout(BUSY_TIMEOUT)?;
            c.execute_batch("PRAGMA foreign_keys = ON;")
        });
        let pool = Pool::builder().max_size(8).build(manager)?;

        info!("Database opened at: {}", db_path.display());

        let db = Database { pool };
        db.ensure_schema()?;

        Ok(db)
    }

    pub fn get_connection(&self) -> Result<PooledConn, MentorLoopError> {
        Ok(self.pool.get()?)
    }

    fn ensure_schema(&self) -> Result<(), MentorLoopError> {
        let conn = self.get_connection()?;

        let table_exists: bool = conn
            .query_row(
                "SELECT count(*) FROM sqlite_master WHERE type='table' AND name='meta'",
                [],
                |row| row.get::<_, i32>(0),
            )
            .map(|count| count > 0)?;

        if !table_exists {
            info!("Creating schema version {}", SCHEMA_VERSION);
            conn.execute_batch(CREATE_SCHEMA_SQL)?;
            return Ok(());
        }

        let stored_version: Option<String> = conn
            .query_row(
                "SELECT value FROM meta WHERE key = 'schema_version'",
                [],
                |row| row.get(0),
            )
            .optional()?;

        match stored_version.as_deref() {
            Some(SCHEMA_VERSION) => Ok(()),
            Some(other) => Err(MentorLoopError::Error(format!(
                "Schema version mismatch: database has {}, expected {}",
                other, SCHEMA_VERSION
            ))),
            None => Err(MentorLoopError::Error("Schema version missing".to_string())),
        }
    }

    /// Run `func` inside a `BEGIN IMMEDIATE` transaction. Commits when `func`
    /// returns Ok, rolls back on any error (the transaction is dropped uncommitted).
    ///
    /// Functions with an `_immediate` suffix expect to be called from inside `func`.
    pub fn immediate_transaction<T, F>(conn: &Connection, func: F) -> Result<T, MentorLoopError>
    where
        F: FnOnce(&Connection) -> Result<T, MentorLoopError>,
    {
        let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;
        let value = func(&tx)?;
        tx.commit()?;
        Ok(value)
    }
}
