//! Store adapter (spec §4.1).
//!
//! Abstracts over a SQL backend: exposes parameterized queries with a
//! single placeholder dialect (callers always write `?N` positional
//! markers and `{{table}}` logical table tokens), and translates both the
//! placeholder syntax and the table-name aliasing between the embedded
//! backend (local SQLite) and the networked backend (server PostgreSQL).
//! The adapter owns no domain state — it is pure plumbing, grounded on the
//! `StateStore` shape in `coordination/src/state/store.rs` (shared `Arc`
//! handle, a `thiserror` enum classifying failure modes, `StoreResult`
//! alias).

pub mod postgres;
pub mod schema;
pub mod sqlite;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::ErrorKind;
use crate::ids;

/// A bound query parameter. Callers pass these in order; the backend is
/// responsible for encoding them in its native wire format.
#[derive(Debug, Clone)]
pub enum Param {
    Text(String),
    Int(i64),
    Real(f64),
    Bool(bool),
    Json(serde_json::Value),
    Timestamp(DateTime<Utc>),
    Null,
}

impl From<&str> for Param {
    fn from(v: &str) -> Self {
        Param::Text(v.to_string())
    }
}
impl From<String> for Param {
    fn from(v: String) -> Self {
        Param::Text(v)
    }
}
impl From<i64> for Param {
    fn from(v: i64) -> Self {
        Param::Int(v)
    }
}
impl From<f64> for Param {
    fn from(v: f64) -> Self {
        Param::Real(v)
    }
}
impl From<bool> for Param {
    fn from(v: bool) -> Self {
        Param::Bool(v)
    }
}
impl From<DateTime<Utc>> for Param {
    fn from(v: DateTime<Utc>) -> Self {
        Param::Timestamp(v)
    }
}
impl<T: Into<Param>> From<Option<T>> for Param {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(x) => x.into(),
            None => Param::Null,
        }
    }
}

/// One returned row, column-name keyed. Both backends normalize into this
/// shape so downstream code never touches a driver-specific row type.
#[derive(Debug, Clone, Default)]
pub struct Row(pub BTreeMap<String, Param>);

impl Row {
    pub fn get_str(&self, col: &str) -> Option<&str> {
        match self.0.get(col) {
            Some(Param::Text(s)) => Some(s.as_str()),
            _ => None,
        }
    }
    pub fn get_i64(&self, col: &str) -> Option<i64> {
        match self.0.get(col) {
            Some(Param::Int(n)) => Some(*n),
            _ => None,
        }
    }
    pub fn get_f64(&self, col: &str) -> Option<f64> {
        match self.0.get(col) {
            Some(Param::Real(n)) => Some(*n),
            _ => None,
        }
    }
    pub fn get_bool(&self, col: &str) -> Option<bool> {
        match self.0.get(col) {
            Some(Param::Bool(b)) => Some(*b),
            _ => None,
        }
    }
    pub fn get_json(&self, col: &str) -> Option<&serde_json::Value> {
        match self.0.get(col) {
            Some(Param::Json(v)) => Some(v),
            _ => None,
        }
    }
    pub fn get_timestamp(&self, col: &str) -> Option<DateTime<Utc>> {
        match self.0.get(col) {
            Some(Param::Timestamp(t)) => Some(*t),
            _ => None,
        }
    }
    pub fn is_null(&self, col: &str) -> bool {
        matches!(self.0.get(col), Some(Param::Null) | None)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("invalid id: {0}")]
    InvalidId(String),
    #[error("unique violation: {0}")]
    UniqueViolation(String),
    #[error("foreign key violation: {0}")]
    FkViolation(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("transient store error: {0}")]
    Transient(String),
    #[error("fatal store error: {0}")]
    Fatal(String),
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidId(_) => ErrorKind::InvalidInput,
            Self::UniqueViolation(_) | Self::FkViolation(_) | Self::NotFound(_) => {
                ErrorKind::InvalidInput
            }
            Self::Transient(_) => ErrorKind::Transient,
            Self::Fatal(_) => ErrorKind::Fatal,
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Which networked backend a query is being rendered for. Used to pick the
/// placeholder dialect and the table-name map at compile-adjacent sites
/// (i.e. decided once per `Store` instance, not per query).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// Embedded SQLite: `?` placeholders, unprefixed table names.
    Sqlite,
    /// Networked PostgreSQL: `$1,$2,...` placeholders, `gitswarm_`-prefixed
    /// table names.
    Postgres,
}

/// One transaction. Every `exec` within a transaction observes prior
/// writes in the same transaction and nothing commits until `commit` is
/// called; dropping without committing rolls back.
#[async_trait]
pub trait StoreTx: Send {
    async fn exec(&mut self, query: &str, args: &[Param]) -> StoreResult<Vec<Row>>;
    async fn commit(self: Box<Self>) -> StoreResult<()>;
    async fn rollback(self: Box<Self>) -> StoreResult<()>;
}

/// The store adapter itself.
#[async_trait]
pub trait Store: Send + Sync {
    fn dialect(&self) -> Dialect;

    /// Execute one statement outside any explicit transaction (backends
    /// typically wrap this in their own single-statement transaction).
    async fn exec(&self, query: &str, args: &[Param]) -> StoreResult<Vec<Row>>;

    /// Begin a serializable transaction (serializable isolation where the
    /// backend allows it — SQLite's single-writer model makes this the
    /// default; PostgreSQL is asked for `SERIALIZABLE` explicitly).
    async fn begin(&self) -> StoreResult<Box<dyn StoreTx + '_>>;
}

/// Validate every id-shaped argument before it reaches the backend. Spec
/// §4.1: "every boundary call validates ID arguments against the canonical
/// ID shape and returns `invalid_id` on mismatch." Callers pass the subset
/// of `args` that are semantically ids (the store itself cannot tell an id
/// column from a text column).
pub fn validate_ids<'a>(ids: impl IntoIterator<Item = &'a str>) -> StoreResult<()> {
    for id in ids {
        if !ids::is_valid(id) {
            return Err(StoreError::InvalidId(id.to_string()));
        }
    }
    Ok(())
}

/// Rewrite `{{table}}` logical tokens in a query template into the
/// dialect-appropriate physical table name, per `schema::TABLE_MAP`.
pub fn resolve_tables(query: &str, dialect: Dialect) -> String {
    let mut out = query.to_string();
    for (logical, (embedded, networked)) in schema::TABLE_MAP.iter() {
        let token = format!("{{{{{logical}}}}}");
        let physical = match dialect {
            Dialect::Sqlite => embedded,
            Dialect::Postgres => networked,
        };
        out = out.replace(&token, physical);
    }
    out
}

/// Rewrite `?` positional placeholders into `$1,$2,...` for PostgreSQL.
/// SQLite keeps `?` natively and is a no-op pass-through.
pub fn resolve_placeholders(query: &str, dialect: Dialect) -> String {
    match dialect {
        Dialect::Sqlite => query.to_string(),
        Dialect::Postgres => {
            let mut out = String::with_capacity(query.len() + 8);
            let mut n = 0usize;
            for ch in query.chars() {
                if ch == '?' {
                    n += 1;
                    out.push('$');
                    out.push_str(&n.to_string());
                } else {
                    out.push(ch);
                }
            }
            out
        }
    }
}

/// Full render: tables then placeholders, the order the adapter applies at
/// every `exec`/`StoreTx::exec` call site in the two backends.
pub fn render(query: &str, dialect: Dialect) -> String {
    resolve_placeholders(&resolve_tables(query, dialect), dialect)
}
