//! SQLite-backed persistent cache storage.
//!
//! Connections are blocking, so every operation runs on the blocking pool.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info};

use crate::backend::{CacheBackend, EntryMeta};
use crate::{CacheError, CacheKey, CachedResponse};

/// Database schema version for migrations
const SCHEMA_VERSION: i32 = 1;

/// Persistent backend storing every cache in one SQLite database.
pub struct SqliteBackend {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteBackend {
    /// Open (or create) the database at `path`.
    pub fn open(path: &Path) -> Result<Self, CacheError> {
        let conn = Connection::open(path)?;
        info!(path = %path.display(), "Opened cache database");
        Self::with_connection(conn)
    }

    /// Open a private in-memory database.
    pub fn open_in_memory() -> Result<Self, CacheError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, CacheError> {
        init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, CacheError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, CacheError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| CacheError::Backend("cache database lock poisoned".to_string()))?;
            f(&guard)
        })
        .await
        .map_err(|e| CacheError::Backend(format!("blocking task failed: {e}")))?
    }
}

/// Create tables or migrate an existing database.
fn init_schema(conn: &Connection) -> Result<(), CacheError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            version INTEGER NOT NULL
        );
        "#,
    )?;

    let version: i32 = conn
        .query_row(
            "SELECT version FROM schema_version ORDER BY id DESC LIMIT 1",
            [],
            |row| row.get(0),
        )
        .optional()?
        .unwrap_or(0);

    if version < 1 {
        create_schema_v1(conn)?;
    }

    Ok(())
}

fn create_schema_v1(conn: &Connection) -> Result<(), CacheError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS caches (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE
        );

        CREATE TABLE IF NOT EXISTS entries (
            cache_name TEXT NOT NULL,
            method TEXT NOT NULL,
            url TEXT NOT NULL,
            response_url TEXT NOT NULL,
            status INTEGER NOT NULL,
            headers TEXT NOT NULL,
            body BLOB NOT NULL,
            cached_at INTEGER NOT NULL,
            PRIMARY KEY (cache_name, method, url)
        );

        CREATE INDEX IF NOT EXISTS idx_entries_age ON entries(cache_name, cached_at);
        "#,
    )?;

    conn.execute(
        "INSERT INTO schema_version (version) VALUES (?)",
        params![SCHEMA_VERSION],
    )?;

    debug!(version = SCHEMA_VERSION, "Created cache schema");
    Ok(())
}

#[async_trait]
impl CacheBackend for SqliteBackend {
    async fn create_cache(&self, cache: &str) -> Result<(), CacheError> {
        let cache = cache.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO caches (name) VALUES (?)",
                params![cache],
            )?;
            Ok(())
        })
        .await
    }

    async fn has_cache(&self, cache: &str) -> Result<bool, CacheError> {
        let cache = cache.to_string();
        self.with_conn(move |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM caches WHERE name = ?",
                params![cache],
                |row| row.get(0),
            )?;
            Ok(count > 0)
        })
        .await
    }

    async fn delete_cache(&self, cache: &str) -> Result<bool, CacheError> {
        let cache = cache.to_string();
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM entries WHERE cache_name = ?", params![cache])?;
            let removed = conn.execute("DELETE FROM caches WHERE name = ?", params![cache])?;
            Ok(removed > 0)
        })
        .await
    }

    async fn cache_names(&self) -> Result<Vec<String>, CacheError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT name FROM caches ORDER BY id")?;
            let names = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(names)
        })
        .await
    }

    async fn get(&self, cache: &str, key: &CacheKey) -> Result<Option<CachedResponse>, CacheError> {
        let cache = cache.to_string();
        let key = key.clone();
        self.with_conn(move |conn| {
            let row = conn
                .query_row(
                    "SELECT response_url, status, headers, body, cached_at FROM entries
                     WHERE cache_name = ? AND method = ? AND url = ?",
                    params![cache, key.method, key.url],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, u16>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, Vec<u8>>(3)?,
                            row.get::<_, i64>(4)?,
                        ))
                    },
                )
                .optional()?;

            match row {
                Some((url, status, headers, body, cached_at)) => Ok(Some(CachedResponse {
                    url,
                    status,
                    headers: serde_json::from_str(&headers)?,
                    body: body.into(),
                    cached_at: cached_at as u64,
                })),
                None => Ok(None),
            }
        })
        .await
    }

    async fn put(
        &self,
        cache: &str,
        key: &CacheKey,
        response: &CachedResponse,
    ) -> Result<(), CacheError> {
        let cache = cache.to_string();
        let key = key.clone();
        let response = response.clone();
        self.with_conn(move |conn| {
            let headers = serde_json::to_string(&response.headers)?;
            conn.execute(
                "INSERT OR IGNORE INTO caches (name) VALUES (?)",
                params![cache],
            )?;
            conn.execute(
                "INSERT OR REPLACE INTO entries
                 (cache_name, method, url, response_url, status, headers, body, cached_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
                params![
                    cache,
                    key.method,
                    key.url,
                    response.url,
                    response.status,
                    headers,
                    response.body.as_ref(),
                    response.cached_at as i64,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn delete(&self, cache: &str, key: &CacheKey) -> Result<bool, CacheError> {
        let cache = cache.to_string();
        let key = key.clone();
        self.with_conn(move |conn| {
            let removed = conn.execute(
                "DELETE FROM entries WHERE cache_name = ? AND method = ? AND url = ?",
                params![cache, key.method, key.url],
            )?;
            Ok(removed > 0)
        })
        .await
    }

    async fn entries(&self, cache: &str) -> Result<Vec<EntryMeta>, CacheError> {
        let cache = cache.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT method, url, cached_at FROM entries WHERE cache_name = ? ORDER BY cached_at",
            )?;
            let entries = stmt
                .query_map(params![cache], |row| {
                    Ok(EntryMeta {
                        key: CacheKey {
                            method: row.get(0)?,
                            url: row.get(1)?,
                        },
                        cached_at: row.get::<_, i64>(2)? as u64,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(entries)
        })
        .await
    }
}
