use super::{format_datestamp, parse_datestamp, LogCategory, LogEntry, LogTable, PendingEntries};
use crate::error::StorageError;
use chrono::Duration as ChronoDuration;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteSynchronous};
use sqlx::{ConnectOptions, Connection, SqliteConnection};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// SQLite result code for a lock that could not be acquired
const SQLITE_BUSY: &str = "5";

type Row = (String, String, i64, String);

pub struct DurableLogStore {
    path: PathBuf,
    options: SqliteConnectOptions,
    lock_timeout: Duration,
}

impl DurableLogStore {
    /// Open (creating if needed) the store at `path`
    pub async fn open(path: &Path, lock_timeout: Duration) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    StorageError::DirectoryCreation {
                        path: parent.display().to_string(),
                        source: e,
                    }
                })?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Delete)
            .synchronous(SqliteSynchronous::Full)
            .busy_timeout(lock_timeout)
            .disable_statement_logging();

        let store = Self {
            path: path.to_path_buf(),
            options,
            lock_timeout,
        };

        let mut tx = store.transaction().await?;
        for table in LogTable::ALL {
            tx.execute(&format!(
                "CREATE TABLE IF NOT EXISTS {} (datestamp TEXT, log_type TEXT, pending INT, message TEXT)",
                table.table_name()
            ))
            .await?;
            tx.execute(&format!(
                "CREATE INDEX IF NOT EXISTS idx_{0}_datestamp ON {0} (datestamp)",
                table.table_name()
            ))
            .await?;
        }
        tx.commit().await?;

        info!("Log store opened at {}", path.display());
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Begin an exclusive transaction on a fresh connection.
    ///
    /// Fails with `LockTimeout` if another writer holds the store for longer
    /// than the configured lock timeout.
    pub async fn transaction(&self) -> Result<LogTransaction, StorageError> {
        let timeout = self.lock_timeout;
        let begin = async {
            let mut conn = self.options.connect().await?;
            sqlx::query("BEGIN EXCLUSIVE").execute(&mut conn).await?;
            Ok::<_, sqlx::Error>(conn)
        };

        match tokio::time::timeout(timeout, begin).await {
            Ok(Ok(conn)) => {
                trace!("Exclusive log store transaction started");
                Ok(LogTransaction {
                    conn: Some(conn),
                    lock_timeout: timeout,
                })
            }
            Ok(Err(e)) => Err(map_busy(e, timeout)),
            Err(_) => Err(StorageError::LockTimeout { timeout }),
        }
    }

    /// Append one entry; returns it with its final, unique datestamp
    pub async fn append(&self, entry: LogEntry) -> Result<LogEntry, StorageError> {
        let mut tx = self.transaction().await?;
        let stored = tx.append(entry).await?;
        tx.commit().await?;
        Ok(stored)
    }

    /// All pending entries of both tables, oldest first
    pub async fn pending(&self) -> Result<PendingEntries, StorageError> {
        let mut tx = self.transaction().await?;
        let pending = PendingEntries {
            capture: tx.pending_in(LogTable::Capture).await?,
            upload: tx.pending_in(LogTable::Upload).await?,
        };
        tx.commit().await?;
        Ok(pending)
    }

    /// Mark entries done; already-done or unknown entries are ignored.
    /// Returns the number of entries that changed state.
    pub async fn mark_done(&self, entries: &[LogEntry]) -> Result<u64, StorageError> {
        if entries.is_empty() {
            return Ok(0);
        }
        let mut tx = self.transaction().await?;
        let changed = tx.mark_done(entries).await?;
        tx.commit().await?;
        Ok(changed)
    }

    /// Every entry of one table, oldest first
    pub async fn entries(&self, table: LogTable) -> Result<Vec<LogEntry>, StorageError> {
        let mut tx = self.transaction().await?;
        let entries = tx.entries(table, false).await?;
        tx.commit().await?;
        Ok(entries)
    }
}

/// An open exclusive transaction. Dropping it without `commit` rolls back.
pub struct LogTransaction {
    conn: Option<SqliteConnection>,
    lock_timeout: Duration,
}

impl LogTransaction {
    fn conn(&mut self) -> Result<&mut SqliteConnection, StorageError> {
        self.conn.as_mut().ok_or_else(|| StorageError::Write {
            path: "log store".to_string(),
            details: "transaction already finished".to_string(),
        })
    }

    async fn execute(&mut self, sql: &str) -> Result<u64, StorageError> {
        let timeout = self.lock_timeout;
        let conn = self.conn()?;
        let result = sqlx::query(sql)
            .execute(conn)
            .await
            .map_err(|e| map_busy(e, timeout))?;
        Ok(result.rows_affected())
    }

    pub async fn append(&mut self, mut entry: LogEntry) -> Result<LogEntry, StorageError> {
        let timeout = self.lock_timeout;
        let table = entry.table.table_name();
        let conn = self.conn()?;

        // Datestamps are the key: bump by one microsecond until free
        loop {
            let (taken,): (i64,) =
                sqlx::query_as(&format!("SELECT COUNT(*) FROM {table} WHERE datestamp = ?"))
                    .bind(&entry.datestamp)
                    .fetch_one(&mut *conn)
                    .await
                    .map_err(|e| map_busy(e, timeout))?;
            if taken == 0 {
                break;
            }
            let current = parse_datestamp(&entry.datestamp).ok_or_else(|| StorageError::Write {
                path: table.to_string(),
                details: format!("malformed datestamp {}", entry.datestamp),
            })?;
            entry.datestamp = format_datestamp(current + ChronoDuration::microseconds(1));
        }

        sqlx::query(&format!(
            "INSERT INTO {table} (datestamp, log_type, pending, message) VALUES (?, ?, ?, ?)"
        ))
        .bind(&entry.datestamp)
        .bind(entry.category.as_str())
        .bind(i64::from(entry.pending))
        .bind(&entry.message)
        .execute(&mut *conn)
        .await
        .map_err(|e| map_busy(e, timeout))?;

        debug!("Logged {} {} in {}", entry.category, entry.datestamp, table);
        Ok(entry)
    }

    pub async fn pending_in(&mut self, table: LogTable) -> Result<Vec<LogEntry>, StorageError> {
        self.entries(table, true).await
    }

    async fn entries(
        &mut self,
        table: LogTable,
        pending_only: bool,
    ) -> Result<Vec<LogEntry>, StorageError> {
        let timeout = self.lock_timeout;
        let conn = self.conn()?;
        let filter = if pending_only { "WHERE pending = 1" } else { "" };
        let rows: Vec<Row> = sqlx::query_as(&format!(
            "SELECT datestamp, log_type, pending, message FROM {} {} ORDER BY datestamp",
            table.table_name(),
            filter
        ))
        .fetch_all(conn)
        .await
        .map_err(|e| map_busy(e, timeout))?;

        Ok(rows
            .into_iter()
            .map(|(datestamp, log_type, pending, message)| LogEntry {
                datestamp,
                category: LogCategory::parse(&log_type),
                pending: pending != 0,
                message,
                table,
            })
            .collect())
    }

    pub async fn mark_done(&mut self, entries: &[LogEntry]) -> Result<u64, StorageError> {
        let timeout = self.lock_timeout;
        let conn = self.conn()?;
        let mut changed = 0;
        for entry in entries {
            let result = sqlx::query(&format!(
                "UPDATE {} SET pending = 0 WHERE datestamp = ? AND pending = 1",
                entry.table.table_name()
            ))
            .bind(&entry.datestamp)
            .execute(&mut *conn)
            .await
            .map_err(|e| map_busy(e, timeout))?;
            changed += result.rows_affected();
        }
        Ok(changed)
    }

    pub async fn commit(mut self) -> Result<(), StorageError> {
        let timeout = self.lock_timeout;
        if let Some(mut conn) = self.conn.take() {
            sqlx::query("COMMIT")
                .execute(&mut conn)
                .await
                .map_err(|e| map_busy(e, timeout))?;
            if let Err(e) = conn.close().await {
                warn!("Failed to close log store connection: {}", e);
            }
        }
        Ok(())
    }

    pub async fn rollback(mut self) -> Result<(), StorageError> {
        if let Some(mut conn) = self.conn.take() {
            sqlx::query("ROLLBACK").execute(&mut conn).await?;
            if let Err(e) = conn.close().await {
                warn!("Failed to close log store connection: {}", e);
            }
        }
        Ok(())
    }
}

fn map_busy(e: sqlx::Error, timeout: Duration) -> StorageError {
    let busy = e
        .as_database_error()
        .and_then(|db| db.code())
        .map(|code| code == SQLITE_BUSY)
        .unwrap_or(false);
    if busy {
        StorageError::LockTimeout { timeout }
    } else {
        StorageError::Database(e)
    }
}
