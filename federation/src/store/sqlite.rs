//! Embedded backend: one SQLite file per `spec.md` §6.5
//! (`<repo>/.gitswarm/federation.db`). `rusqlite` gives a single-writer,
//! synchronous connection; every call is shipped to a blocking thread so
//! the rest of the engine can stay on the async `exec`/`begin` surface in
//! `super::Store`, the same way the teacher keeps its RocksDB calls behind
//! a plain synchronous API (`coordination/src/state/store.rs`) and leaves
//! async scheduling to the caller.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::types::ValueRef;
use rusqlite::Connection;

use super::{render, Dialect, Param, Row, Store, StoreError, StoreResult, StoreTx};

pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let conn = Connection::open(path).map_err(|e| StoreError::Fatal(e.to_string()))?;
        conn.execute_batch("PRAGMA foreign_keys = ON; PRAGMA journal_mode = WAL;")
            .map_err(|e| StoreError::Fatal(e.to_string()))?;
        conn.execute_batch(super::schema::SQLITE_DDL)
            .map_err(|e| StoreError::Fatal(e.to_string()))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory().map_err(|e| StoreError::Fatal(e.to_string()))?;
        conn.execute_batch(super::schema::SQLITE_DDL)
            .map_err(|e| StoreError::Fatal(e.to_string()))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn classify(err: &rusqlite::Error) -> StoreError {
        match err {
            rusqlite::Error::SqliteFailure(e, msg) => {
                use rusqlite::ffi::ErrorCode;
                match e.code {
                    ErrorCode::ConstraintViolation => {
                        let m = msg.clone().unwrap_or_default();
                        if m.contains("FOREIGN KEY") {
                            StoreError::FkViolation(m)
                        } else {
                            StoreError::UniqueViolation(m)
                        }
                    }
                    ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => {
                        StoreError::Transient(msg.clone().unwrap_or_default())
                    }
                    _ => StoreError::Fatal(msg.clone().unwrap_or_default()),
                }
            }
            rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound(err.to_string()),
            other => StoreError::Fatal(other.to_string()),
        }
    }

    fn run(conn: &Connection, query: &str, args: &[Param]) -> StoreResult<Vec<Row>> {
        let mut stmt = conn.prepare(query).map_err(|e| Self::classify(&e))?;
        let params: Vec<Box<dyn rusqlite::ToSql>> = args.iter().map(to_sql).collect();
        let param_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|b| b.as_ref()).collect();

        let col_names: Vec<String> = stmt
            .column_names()
            .into_iter()
            .map(|s| s.to_string())
            .collect();

        let mut out = Vec::new();
        let mut rows = stmt
            .query(rusqlite::params_from_iter(param_refs))
            .map_err(|e| Self::classify(&e))?;
        while let Some(r) = rows.next().map_err(|e| Self::classify(&e))? {
            let mut row = Row::default();
            for (i, name) in col_names.iter().enumerate() {
                let v = r.get_ref(i).map_err(|e| Self::classify(&e))?;
                row.0.insert(name.clone(), from_value_ref(v));
            }
            out.push(row);
        }
        Ok(out)
    }
}

fn to_sql(p: &Param) -> Box<dyn rusqlite::ToSql> {
    match p {
        Param::Text(s) => Box::new(s.clone()),
        Param::Int(n) => Box::new(*n),
        Param::Real(n) => Box::new(*n),
        Param::Bool(b) => Box::new(*b as i64),
        Param::Json(v) => Box::new(v.to_string()),
        Param::Timestamp(t) => Box::new(t.to_rfc3339()),
        Param::Null => Box::new(Option::<i64>::None),
    }
}

fn from_value_ref(v: ValueRef<'_>) -> Param {
    match v {
        ValueRef::Null => Param::Null,
        ValueRef::Integer(n) => Param::Int(n),
        ValueRef::Real(f) => Param::Real(f),
        ValueRef::Text(t) => {
            let s = String::from_utf8_lossy(t).to_string();
            if let Ok(ts) = DateTime::parse_from_rfc3339(&s) {
                return Param::Timestamp(ts.with_timezone(&Utc));
            }
            Param::Text(s)
        }
        ValueRef::Blob(b) => Param::Text(String::from_utf8_lossy(b).to_string()),
    }
}

#[async_trait]
impl Store for SqliteStore {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    async fn exec(&self, query: &str, args: &[Param]) -> StoreResult<Vec<Row>> {
        let conn = self.conn.clone();
        let rendered = render(query, Dialect::Sqlite);
        let args = args.to_vec();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().map_err(|_| StoreError::Fatal("poisoned lock".into()))?;
            Self::run(&conn, &rendered, &args)
        })
        .await
        .map_err(|e| StoreError::Fatal(e.to_string()))?
    }

    async fn begin(&self) -> StoreResult<Box<dyn StoreTx + '_>> {
        self.exec("BEGIN IMMEDIATE", &[]).await?;
        Ok(Box::new(SqliteTx {
            store: self,
            open: true,
        }))
    }
}

struct SqliteTx<'a> {
    store: &'a SqliteStore,
    open: bool,
}

#[async_trait]
impl<'a> StoreTx for SqliteTx<'a> {
    async fn exec(&mut self, query: &str, args: &[Param]) -> StoreResult<Vec<Row>> {
        self.store.exec(query, args).await
    }

    async fn commit(mut self: Box<Self>) -> StoreResult<()> {
        self.store.exec("COMMIT", &[]).await?;
        self.open = false;
        Ok(())
    }

    async fn rollback(mut self: Box<Self>) -> StoreResult<()> {
        self.store.exec("ROLLBACK", &[]).await?;
        self.open = false;
        Ok(())
    }
}

impl<'a> Drop for SqliteTx<'a> {
    fn drop(&mut self) {
        if self.open {
            tracing::warn!("sqlite transaction dropped without commit/rollback");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn opens_and_migrates_in_memory() {
        let store = SqliteStore::open_in_memory().unwrap();
        let rows = store
            .exec("SELECT COUNT(*) AS n FROM {{repos}}", &[])
            .await
            .unwrap();
        assert_eq!(rows[0].get_i64("n"), Some(0));
    }

    #[tokio::test]
    async fn transaction_commits() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut tx = store.begin().await.unwrap();
        tx.exec(
            "INSERT INTO {{agents}} (id, name) VALUES (?, ?)",
            &[Param::Text("a".into()), Param::Text("alice".into())],
        )
        .await
        .unwrap();
        tx.commit().await.unwrap();

        let rows = store
            .exec("SELECT name FROM {{agents}} WHERE id = ?", &[Param::Text("a".into())])
            .await
            .unwrap();
        assert_eq!(rows[0].get_str("name"), Some("alice"));
    }

    #[tokio::test]
    async fn transaction_rollback_discards_writes() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut tx = store.begin().await.unwrap();
        tx.exec(
            "INSERT INTO {{agents}} (id, name) VALUES (?, ?)",
            &[Param::Text("b".into()), Param::Text("bob".into())],
        )
        .await
        .unwrap();
        tx.rollback().await.unwrap();

        let rows = store
            .exec("SELECT name FROM {{agents}} WHERE id = ?", &[Param::Text("b".into())])
            .await
            .unwrap();
        assert!(rows.is_empty());
    }
}
