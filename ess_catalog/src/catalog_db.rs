use ess_lib::{EssError, EssResult};
use log::{debug, warn};
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, Row};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

const CATALOG_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS edges (
    edge_id INTEGER PRIMARY KEY AUTOINCREMENT,
    edge_name TEXT NOT NULL UNIQUE,
    edge_type TEXT NOT NULL,
    status TEXT NOT NULL,
    is_independent INTEGER NOT NULL DEFAULT 0,
    continent TEXT,
    country_name TEXT,
    region_code TEXT,
    city TEXT,
    longitude TEXT,
    latitude TEXT,
    total_space INTEGER NOT NULL DEFAULT 0,
    used_space INTEGER NOT NULL DEFAULT 0,
    reserved_space INTEGER NOT NULL DEFAULT 0,
    num_files INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS edges_status_idx ON edges(status, updated_at);

CREATE TABLE IF NOT EXISTS collections (
    coll_id INTEGER PRIMARY KEY AUTOINCREMENT,
    scope TEXT NOT NULL,
    name TEXT NOT NULL,
    collection_type TEXT NOT NULL,
    coll_size INTEGER NOT NULL DEFAULT 0,
    global_status TEXT NOT NULL,
    total_files INTEGER NOT NULL DEFAULT 0,
    num_replicas INTEGER NOT NULL DEFAULT 0,
    coll_metadata TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    UNIQUE(scope, name)
);

CREATE TABLE IF NOT EXISTS collection_replicas (
    coll_id INTEGER NOT NULL,
    edge_id INTEGER NOT NULL,
    status TEXT NOT NULL,
    transferring_files INTEGER NOT NULL DEFAULT 0,
    replicated_files INTEGER NOT NULL DEFAULT 0,
    num_active_requests INTEGER NOT NULL DEFAULT 0,
    retries INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    PRIMARY KEY(coll_id, edge_id)
);

CREATE TABLE IF NOT EXISTS contents (
    content_id INTEGER PRIMARY KEY AUTOINCREMENT,
    coll_id INTEGER NOT NULL,
    scope TEXT NOT NULL,
    name TEXT NOT NULL,
    min_id INTEGER NOT NULL,
    max_id INTEGER NOT NULL,
    content_type TEXT NOT NULL,
    status TEXT NOT NULL,
    priority INTEGER NOT NULL DEFAULT 0,
    edge_id INTEGER NOT NULL,
    num_success INTEGER NOT NULL DEFAULT 0,
    num_failure INTEGER NOT NULL DEFAULT 0,
    last_failed_at INTEGER,
    pfn_size INTEGER NOT NULL DEFAULT 0,
    pfn TEXT,
    object_metadata TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    UNIQUE(scope, name, coll_id, content_type, min_id, max_id, edge_id)
);
CREATE INDEX IF NOT EXISTS contents_edge_status_idx ON contents(edge_id, status);
CREATE INDEX IF NOT EXISTS contents_coll_status_idx ON contents(coll_id, status);

CREATE TABLE IF NOT EXISTS requests (
    request_id INTEGER PRIMARY KEY AUTOINCREMENT,
    scope TEXT NOT NULL,
    name TEXT NOT NULL,
    data_type TEXT NOT NULL,
    granularity_type TEXT NOT NULL,
    granularity_level INTEGER,
    priority INTEGER NOT NULL DEFAULT 0,
    edge_id INTEGER,
    status TEXT NOT NULL,
    request_meta TEXT,
    processing_meta TEXT,
    errors TEXT,
    original_request_id INTEGER UNIQUE,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS requests_status_idx ON requests(status, edge_id);
";

/// The catalog store: edges, collections, replicas, contents and requests on SQLite.
///
/// Every workflow claim goes through a conditional update keyed on the current
/// status, so several daemons (or processes) may share one database file.
pub struct CatalogDB {
    pub db_path: String,
    conn: Mutex<Connection>,
}

impl CatalogDB {
    pub fn new(db_path: String) -> EssResult<Self> {
        debug!("CatalogDB: new db path: {}", db_path);
        if let Some(parent) = std::path::Path::new(&db_path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    warn!("CatalogDB: create db dir failed! {}", e);
                    EssError::IoError(format!("create {} failed: {}", parent.display(), e))
                })?;
            }
        }
        let conn = Connection::open(&db_path).map_err(|e| {
            warn!("CatalogDB: open db failed! {}", e);
            EssError::DbError(e.to_string())
        })?;
        Self::init(db_path, conn)
    }

    pub fn new_in_memory() -> EssResult<Self> {
        let conn = Connection::open_in_memory().map_err(|e| {
            warn!("CatalogDB: open in-memory db failed! {}", e);
            EssError::DbError(e.to_string())
        })?;
        Self::init(":memory:".to_string(), conn)
    }

    fn init(db_path: String, conn: Connection) -> EssResult<Self> {
        conn.busy_timeout(Duration::from_secs(10))
            .map_err(|e| map_db_error("set busy timeout", e))?;
        if let Err(e) = conn.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(())) {
            warn!("CatalogDB: enable WAL failed, keep default journal: {}", e);
        }
        conn.execute_batch(CATALOG_SCHEMA).map_err(|e| {
            warn!("CatalogDB: create tables failed! {}", e);
            EssError::DbError(e.to_string())
        })?;

        Ok(Self {
            db_path,
            conn: Mutex::new(conn),
        })
    }

    pub(crate) fn lock_conn(&self) -> EssResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| EssError::Internal(format!("catalog lock poisoned: {}", e)))
    }
}

/// Maps a sqlite failure: no rows is NotFound, a unique violation is AlreadyExists.
pub(crate) fn map_db_error(op: &str, err: rusqlite::Error) -> EssError {
    match &err {
        rusqlite::Error::QueryReturnedNoRows => EssError::NotFound(op.to_string()),
        rusqlite::Error::SqliteFailure(e, msg)
            if e.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            debug!("CatalogDB: {} hit a unique constraint: {:?}", op, msg);
            EssError::AlreadyExists(format!(
                "{}: {}",
                op,
                msg.clone().unwrap_or_else(|| "constraint violation".to_string())
            ))
        }
        _ => {
            warn!("CatalogDB: {} failed! {}", op, err);
            EssError::DbError(format!("{}: {}", op, err))
        }
    }
}

pub(crate) fn to_json_text<T: Serialize>(value: &T) -> EssResult<String> {
    serde_json::to_string(value).map_err(|e| EssError::DecodeError(e.to_string()))
}

/// Reads a JSON text column; NULL or empty text yields `T::default()`.
pub(crate) fn json_column<T: DeserializeOwned + Default>(
    row: &Row<'_>,
    idx: usize,
) -> rusqlite::Result<T> {
    let text: Option<String> = row.get(idx)?;
    match text {
        Some(text) if !text.is_empty() => serde_json::from_str(&text).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        }),
        _ => Ok(T::default()),
    }
}

pub(crate) fn optional_json_column<T: DeserializeOwned>(
    row: &Row<'_>,
    idx: usize,
) -> rusqlite::Result<Option<T>> {
    let text: Option<String> = row.get(idx)?;
    match text {
        Some(text) if !text.is_empty() => serde_json::from_str(&text).map(Some).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        }),
        _ => Ok(None),
    }
}

pub(crate) fn u64_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<u64> {
    let v: i64 = row.get(idx)?;
    Ok(v.max(0) as u64)
}

/// Accumulates `WHERE` clauses and their positional parameters.
#[derive(Default)]
pub(crate) struct WhereBuilder {
    clauses: Vec<String>,
    pub(crate) params: Vec<SqlValue>,
}

impl WhereBuilder {
    pub(crate) fn eq(&mut self, column: &str, value: SqlValue) -> &mut Self {
        self.clauses.push(format!("{} = ?", column));
        self.params.push(value);
        self
    }

    pub(crate) fn eq_opt_i64(&mut self, column: &str, value: Option<i64>) -> &mut Self {
        if let Some(v) = value {
            self.eq(column, SqlValue::Integer(v));
        }
        self
    }

    pub(crate) fn eq_opt_text(&mut self, column: &str, value: Option<&str>) -> &mut Self {
        if let Some(v) = value {
            self.eq(column, SqlValue::Text(v.to_string()));
        }
        self
    }

    pub(crate) fn in_text(&mut self, column: &str, values: &[&str]) -> &mut Self {
        match values.len() {
            0 => {}
            1 => {
                self.eq(column, SqlValue::Text(values[0].to_string()));
            }
            n => {
                let marks = vec!["?"; n].join(", ");
                self.clauses.push(format!("{} IN ({})", column, marks));
                self.params
                    .extend(values.iter().map(|v| SqlValue::Text(v.to_string())));
            }
        }
        self
    }

    pub(crate) fn raw(&mut self, clause: &str, value: SqlValue) -> &mut Self {
        self.clauses.push(clause.to_string());
        self.params.push(value);
        self
    }

    pub(crate) fn sql(&self) -> String {
        if self.clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", self.clauses.join(" AND "))
        }
    }
}

pub(crate) fn limit_sql(limit: Option<usize>) -> String {
    match limit {
        Some(n) => format!(" LIMIT {}", n),
        None => String::new(),
    }
}
