//! SQLite index
//!
//! One table maps each key to either inline bytes or a content filename,
//! plus size and timestamps. The connection is opened lazily and kept; after
//! a failed open, reopening is throttled by a `RetryGate` so a broken index
//! is not hammered on every call.
//!
//! Fixed statements go through rusqlite's statement cache (keyed by SQL
//! text, reset on reuse). Statements over a key list are built per call and
//! chunked to stay under SQLite's bound-parameter limit.

use crate::error::{KvError, KvResult};
use crate::item::ItemMeta;
use rusqlite::types::ToSql;
use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};
use std::path::{Path, PathBuf};
use stowage_common::RetryGate;
use tracing::{debug, error, warn};

const STATEMENT_CACHE_CAPACITY: usize = 32;

/// Keys bound per `IN (...)` statement
const MAX_BATCH_KEYS: usize = 500;

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS items (
    key TEXT PRIMARY KEY,
    inline_data BLOB,
    filename TEXT,
    size INTEGER,
    last_modification_timestamp INTEGER,
    last_access_timestamp INTEGER
);
CREATE INDEX IF NOT EXISTS last_access_timestamp_idx ON items(last_access_timestamp);
";

const META_COLUMNS: &str =
    "key, filename, size, last_modification_timestamp, last_access_timestamp";
const ITEM_COLUMNS: &str =
    "key, filename, size, last_modification_timestamp, last_access_timestamp, inline_data";

const UPSERT_SQL: &str = "INSERT OR REPLACE INTO items \
    (key, filename, size, inline_data, last_modification_timestamp, last_access_timestamp) \
    VALUES (?1, ?2, ?3, ?4, ?5, ?5)";
const TOUCH_SQL: &str = "UPDATE items SET last_access_timestamp = ?1 WHERE key = ?2";
const SELECT_ITEM_SQL: &str = "SELECT key, filename, size, last_modification_timestamp, \
    last_access_timestamp, inline_data FROM items WHERE key = ?1";
const SELECT_META_SQL: &str = "SELECT key, filename, size, last_modification_timestamp, \
    last_access_timestamp FROM items WHERE key = ?1";
const SELECT_FILENAME_SQL: &str = "SELECT filename FROM items WHERE key = ?1";
const EXISTS_SQL: &str = "SELECT count(key) FROM items WHERE key = ?1";
const DELETE_SQL: &str = "DELETE FROM items WHERE key = ?1";
const COUNT_SQL: &str = "SELECT count(*) FROM items";
const SIZE_SQL: &str = "SELECT sum(size) FROM items";
const FILENAMES_LARGER_SQL: &str =
    "SELECT filename FROM items WHERE size > ?1 AND filename IS NOT NULL";
const DELETE_LARGER_SQL: &str = "DELETE FROM items WHERE size > ?1";
const FILENAMES_BEFORE_SQL: &str =
    "SELECT filename FROM items WHERE last_access_timestamp < ?1 AND filename IS NOT NULL";
const DELETE_BEFORE_SQL: &str = "DELETE FROM items WHERE last_access_timestamp < ?1";
const LRU_BATCH_SQL: &str = "SELECT key, filename, size, last_modification_timestamp, \
    last_access_timestamp FROM items ORDER BY last_access_timestamp ASC, rowid ASC LIMIT ?1";

/// An index row, with the inline payload when it was selected
#[derive(Debug)]
pub(crate) struct Record {
    pub(crate) meta: ItemMeta,
    pub(crate) inline: Option<Vec<u8>>,
}

pub(crate) struct Index {
    path: PathBuf,
    conn: Option<Connection>,
    gate: RetryGate,
    error_logs_enabled: bool,
}

impl Index {
    pub(crate) fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            conn: None,
            gate: RetryGate::default(),
            error_logs_enabled: true,
        }
    }

    #[cfg(test)]
    pub(crate) const fn is_open(&self) -> bool {
        self.conn.is_some()
    }

    pub(crate) const fn error_logs_enabled(&self) -> bool {
        self.error_logs_enabled
    }

    pub(crate) fn set_error_logs_enabled(&mut self, enabled: bool) {
        self.error_logs_enabled = enabled;
    }

    /// Open and initialize the index now, bypassing the retry gate
    pub(crate) fn open(&mut self) -> KvResult<()> {
        if self.conn.is_some() {
            return Ok(());
        }
        match connect(&self.path) {
            Ok(conn) => {
                debug!("Opened index at {:?}", self.path);
                self.conn = Some(conn);
                self.gate.record_success();
                Ok(())
            }
            Err(e) => {
                self.gate.record_failure();
                self.log_error("open", &e);
                Err(e)
            }
        }
    }

    /// Close the connection
    ///
    /// Cached statements are finalized first. If SQLite still reports the
    /// database busy, they are finalized again and the close retried once;
    /// a connection that still refuses to close stays owned by the index.
    pub(crate) fn close(&mut self) -> KvResult<()> {
        let Some(conn) = self.conn.take() else {
            return Ok(());
        };
        conn.flush_prepared_statement_cache();
        let Err((conn, first)) = conn.close() else {
            return Ok(());
        };
        if self.error_logs_enabled {
            warn!("Closing index at {:?} failed ({}), retrying", self.path, first);
        }
        conn.flush_prepared_statement_cache();
        match conn.close() {
            Ok(()) => Ok(()),
            Err((conn, e)) => {
                let e = KvError::from(e);
                self.log_error("close", &e);
                self.conn = Some(conn);
                Err(e)
            }
        }
    }

    /// The open connection, reopening if the retry gate allows
    fn connection(&mut self) -> KvResult<&Connection> {
        if self.conn.is_none() {
            if !self.gate.allows() {
                return Err(KvError::IndexUnavailable(format!(
                    "{} after {} failed opens",
                    self.path.display(),
                    self.gate.failures()
                )));
            }
            self.open()?;
        }
        self.conn
            .as_ref()
            .ok_or_else(|| KvError::IndexUnavailable(self.path.display().to_string()))
    }

    fn run<T>(
        &mut self,
        op: &'static str,
        f: impl FnOnce(&Connection) -> KvResult<T>,
    ) -> KvResult<T> {
        let result = self.connection().and_then(f);
        if let Err(e) = &result {
            self.log_error(op, e);
        }
        result
    }

    fn log_error(&self, op: &str, e: &KvError) {
        if self.error_logs_enabled {
            error!("Index {} failed at {:?}: {}", op, self.path, e);
        }
    }

    /// Merge the write-ahead log into the index file
    pub(crate) fn checkpoint(&mut self) {
        // Failures are logged by `run`; a missed checkpoint is retried next time
        let _ = self.run("checkpoint", |conn| {
            conn.pragma_query(None, "wal_checkpoint", |_| Ok(()))?;
            Ok(())
        });
    }

    pub(crate) fn upsert(
        &mut self,
        key: &str,
        inline: Option<&[u8]>,
        filename: Option<&str>,
        size: i64,
        now: i64,
    ) -> KvResult<()> {
        self.run("upsert", |conn| {
            conn.prepare_cached(UPSERT_SQL)?
                .execute(params![key, filename, size, inline, now])?;
            Ok(())
        })
    }

    pub(crate) fn touch(&mut self, key: &str, now: i64) -> KvResult<()> {
        self.run("touch", |conn| {
            conn.prepare_cached(TOUCH_SQL)?.execute(params![now, key])?;
            Ok(())
        })
    }

    pub(crate) fn touch_many(&mut self, keys: &[&str], now: i64) -> KvResult<()> {
        self.run("touch_many", |conn| {
            for chunk in keys.chunks(MAX_BATCH_KEYS) {
                let sql = format!(
                    "UPDATE items SET last_access_timestamp = ? WHERE key IN ({})",
                    placeholders(chunk.len())
                );
                let mut values: Vec<&dyn ToSql> = Vec::with_capacity(chunk.len() + 1);
                values.push(&now);
                values.extend(chunk.iter().map(|key| key as &dyn ToSql));
                conn.execute(&sql, values.as_slice())?;
            }
            Ok(())
        })
    }

    pub(crate) fn get(&mut self, key: &str, with_inline: bool) -> KvResult<Option<Record>> {
        self.run("get", |conn| {
            let sql = if with_inline {
                SELECT_ITEM_SQL
            } else {
                SELECT_META_SQL
            };
            let record = conn
                .prepare_cached(sql)?
                .query_row(params![key], |row| record_from_row(row, with_inline))
                .optional()?;
            Ok(record)
        })
    }

    pub(crate) fn get_many(&mut self, keys: &[&str], with_inline: bool) -> KvResult<Vec<Record>> {
        self.run("get_many", |conn| {
            let columns = if with_inline { ITEM_COLUMNS } else { META_COLUMNS };
            let mut records = Vec::new();
            for chunk in keys.chunks(MAX_BATCH_KEYS) {
                let sql = format!(
                    "SELECT {columns} FROM items WHERE key IN ({})",
                    placeholders(chunk.len())
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map(params_from_iter(chunk.iter()), |row| {
                    record_from_row(row, with_inline)
                })?;
                for row in rows {
                    records.push(row?);
                }
            }
            Ok(records)
        })
    }

    pub(crate) fn exists(&mut self, key: &str) -> KvResult<bool> {
        self.run("exists", |conn| {
            let count: i64 = conn
                .prepare_cached(EXISTS_SQL)?
                .query_row(params![key], |row| row.get(0))?;
            Ok(count > 0)
        })
    }

    pub(crate) fn filename(&mut self, key: &str) -> KvResult<Option<String>> {
        self.run("filename", |conn| {
            let filename: Option<Option<String>> = conn
                .prepare_cached(SELECT_FILENAME_SQL)?
                .query_row(params![key], |row| row.get(0))
                .optional()?;
            Ok(filename.flatten().filter(|name| !name.is_empty()))
        })
    }

    pub(crate) fn filenames(&mut self, keys: &[&str]) -> KvResult<Vec<String>> {
        self.run("filenames", |conn| {
            let mut names = Vec::new();
            for chunk in keys.chunks(MAX_BATCH_KEYS) {
                let sql = format!(
                    "SELECT filename FROM items WHERE key IN ({}) AND filename IS NOT NULL",
                    placeholders(chunk.len())
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map(params_from_iter(chunk.iter()), |row| {
                    row.get::<_, Option<String>>(0)
                })?;
                for row in rows {
                    names.extend(row?.filter(|name| !name.is_empty()));
                }
            }
            Ok(names)
        })
    }

    pub(crate) fn filenames_larger_than(&mut self, size: i64) -> KvResult<Vec<String>> {
        self.run("filenames_larger_than", |conn| {
            collect_filenames(conn, FILENAMES_LARGER_SQL, size)
        })
    }

    pub(crate) fn filenames_accessed_before(&mut self, time: i64) -> KvResult<Vec<String>> {
        self.run("filenames_accessed_before", |conn| {
            collect_filenames(conn, FILENAMES_BEFORE_SQL, time)
        })
    }

    pub(crate) fn delete(&mut self, key: &str) -> KvResult<usize> {
        self.run("delete", |conn| {
            Ok(conn.prepare_cached(DELETE_SQL)?.execute(params![key])?)
        })
    }

    pub(crate) fn delete_many(&mut self, keys: &[&str]) -> KvResult<usize> {
        self.run("delete_many", |conn| {
            let mut deleted = 0;
            for chunk in keys.chunks(MAX_BATCH_KEYS) {
                let sql = format!(
                    "DELETE FROM items WHERE key IN ({})",
                    placeholders(chunk.len())
                );
                deleted += conn.execute(&sql, params_from_iter(chunk.iter()))?;
            }
            Ok(deleted)
        })
    }

    pub(crate) fn delete_larger_than(&mut self, size: i64) -> KvResult<usize> {
        self.run("delete_larger_than", |conn| {
            Ok(conn.prepare_cached(DELETE_LARGER_SQL)?.execute(params![size])?)
        })
    }

    pub(crate) fn delete_accessed_before(&mut self, time: i64) -> KvResult<usize> {
        self.run("delete_accessed_before", |conn| {
            Ok(conn.prepare_cached(DELETE_BEFORE_SQL)?.execute(params![time])?)
        })
    }

    /// Least-recently-accessed rows, oldest first
    pub(crate) fn lru_batch(&mut self, limit: usize) -> KvResult<Vec<ItemMeta>> {
        self.run("lru_batch", |conn| {
            let limit = i64::try_from(limit).unwrap_or(i64::MAX);
            let mut stmt = conn.prepare_cached(LRU_BATCH_SQL)?;
            let rows = stmt.query_map(params![limit], meta_from_row)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }

    pub(crate) fn total_count(&mut self) -> KvResult<i64> {
        self.run("total_count", |conn| {
            Ok(conn.prepare_cached(COUNT_SQL)?.query_row([], |row| row.get(0))?)
        })
    }

    pub(crate) fn total_size(&mut self) -> KvResult<i64> {
        self.run("total_size", |conn| {
            let size: Option<i64> = conn
                .prepare_cached(SIZE_SQL)?
                .query_row([], |row| row.get(0))?;
            Ok(size.unwrap_or(0))
        })
    }
}

impl Drop for Index {
    fn drop(&mut self) {
        // Logged inside `close`
        let _ = self.close();
    }
}

fn connect(path: &Path) -> KvResult<Connection> {
    let conn = Connection::open(path)?;
    conn.set_prepared_statement_cache_capacity(STATEMENT_CACHE_CAPACITY);
    let mode: String =
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    if !mode.eq_ignore_ascii_case("wal") {
        warn!("Index at {:?} is using journal mode {}", path, mode);
    }
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.execute_batch(SCHEMA_SQL)?;
    Ok(conn)
}

fn placeholders(count: usize) -> String {
    let mut sql = "?,".repeat(count);
    sql.pop();
    sql
}

fn collect_filenames(conn: &Connection, sql: &str, bound: i64) -> KvResult<Vec<String>> {
    let mut stmt = conn.prepare_cached(sql)?;
    let rows = stmt.query_map(params![bound], |row| row.get::<_, Option<String>>(0))?;
    let mut names = Vec::new();
    for row in rows {
        names.extend(row?.filter(|name| !name.is_empty()));
    }
    Ok(names)
}

fn meta_from_row(row: &Row<'_>) -> rusqlite::Result<ItemMeta> {
    Ok(ItemMeta {
        key: row.get(0)?,
        filename: row
            .get::<_, Option<String>>(1)?
            .filter(|name| !name.is_empty()),
        size: row.get::<_, Option<i64>>(2)?.unwrap_or(0),
        modified_at: row.get::<_, Option<i64>>(3)?.unwrap_or(0),
        accessed_at: row.get::<_, Option<i64>>(4)?.unwrap_or(0),
    })
}

fn record_from_row(row: &Row<'_>, with_inline: bool) -> rusqlite::Result<Record> {
    let inline = if with_inline { row.get(5)? } else { None };
    Ok(Record {
        meta: meta_from_row(row)?,
        inline,
    })
}
