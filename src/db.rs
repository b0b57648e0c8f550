use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::any::{AnyConnectOptions, AnyPoolOptions};
use sqlx::AnyPool;
use tokio::sync::RwLock;
use tracing::info;

use crate::error::{CoreError, CoreResult};

/// `sqlx`'s `Any` database implements `Type`/`Encode`/`Decode` only for the
/// small set of primitives it documents (`bool, i16/i32/i64, f32/f64,
/// String, Vec<u8>`) — the `chrono` feature adds impls for the concrete
/// `Sqlite`/`Postgres` types, not for `Any` itself. Every store therefore
/// carries timestamps as RFC3339 text and converts at the boundary through
/// these two functions rather than binding/decoding `DateTime<Utc>`
/// directly.
pub fn encode_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

pub fn decode_ts(raw: &str) -> CoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| CoreError::InputInvalid(format!("invalid timestamp {raw:?}: {e}")))
}

/// Which SQL dialect backs this instance. SQLite needs an explicit
/// application-level read/write lock (§5); Postgres handles concurrent
/// writers itself, so the lock degrades to a no-op there.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Sqlite,
    Postgres,
}

impl Backend {
    fn from_url(url: &str) -> Self {
        if url.starts_with("postgres://") || url.starts_with("postgresql://") {
            Backend::Postgres
        } else {
            Backend::Sqlite
        }
    }
}

/// A no-op guard on Postgres, a held write-lock guard on SQLite. Kept alive
/// for the duration of the write; dropping it releases the lock.
pub enum WriteGuard<'a> {
    Sqlite(tokio::sync::RwLockWriteGuard<'a, ()>),
    Postgres,
}

pub enum ReadGuard<'a> {
    Sqlite(tokio::sync::RwLockReadGuard<'a, ()>),
    Postgres,
}

/// Shared connection pool plus the SQLite-only lock described in §5: "Each
/// SQL store owns a read/write lock used only when the underlying engine
/// needs it." One `Db` is shared by every store (samples, dictionary,
/// approved-users, locator, detected-spam-log, settings).
pub struct Db {
    pool: AnyPool,
    backend: Backend,
    lock: RwLock<()>,
}

impl Db {
    pub async fn connect(url: &str) -> CoreResult<Arc<Self>> {
        sqlx::any::install_default_drivers();
        let backend = Backend::from_url(url);
        let opts = AnyConnectOptions::from_str(url)
            .map_err(|e| CoreError::Fatal(format!("invalid database url: {e}")))?;
        let pool = AnyPoolOptions::new()
            .max_connections(if backend == Backend::Sqlite { 1 } else { 10 })
            .connect_with(opts)
            .await
            .map_err(|e| CoreError::Fatal(format!("failed to connect to database: {e}")))?;

        info!(backend = ?backend, "connected to database");

        let db = Arc::new(Db {
            pool,
            backend,
            lock: RwLock::new(()),
        });
        db.bootstrap_schema().await?;
        Ok(db)
    }

    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    /// Acquire before any write statement. On SQLite this is a real
    /// exclusive lock; on Postgres it resolves immediately.
    pub async fn write_guard(&self) -> WriteGuard<'_> {
        match self.backend {
            Backend::Sqlite => WriteGuard::Sqlite(self.lock.write().await),
            Backend::Postgres => WriteGuard::Postgres,
        }
    }

    /// Acquire before a read that must not race a concurrent writer. On
    /// Postgres this is a no-op — the engine's own MVCC suffices.
    pub async fn read_guard(&self) -> ReadGuard<'_> {
        match self.backend {
            Backend::Sqlite => ReadGuard::Sqlite(self.lock.read().await),
            Backend::Postgres => ReadGuard::Postgres,
        }
    }

    /// Schema bootstrap per §6. Written against ANSI-ish SQL that both
    /// SQLite and Postgres accept via the `Any` driver; the handful of
    /// dialect differences called out in the migration rule (autoincrement
    /// spelling, BIGINT on `detected_spam.user_id`) are applied per-backend.
    async fn bootstrap_schema(&self) -> CoreResult<()> {
        let pk = match self.backend {
            Backend::Sqlite => "INTEGER PRIMARY KEY AUTOINCREMENT",
            Backend::Postgres => "SERIAL PRIMARY KEY",
        };
        let user_id_type = match self.backend {
            Backend::Sqlite => "INTEGER",
            Backend::Postgres => "BIGINT",
        };

        // Timestamps are TEXT (RFC3339, via encode_ts/decode_ts) and the
        // detected_spam "added" flag is an INTEGER 0/1 rather than a native
        // BOOLEAN — both follow from going through the `Any` driver, whose
        // decode support doesn't extend to `chrono` types or to `bool` read
        // back off a SQLite column that's really stored as an integer. See
        // DESIGN.md.
        let statements = vec![
            format!(
                "CREATE TABLE IF NOT EXISTS samples (
                    id {pk},
                    gid BIGINT NOT NULL,
                    ts TEXT NOT NULL,
                    type TEXT NOT NULL CHECK (type IN ('ham', 'spam')),
                    origin TEXT NOT NULL CHECK (origin IN ('preset', 'user')),
                    message TEXT NOT NULL,
                    UNIQUE (gid, message)
                )"
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS dictionary (
                    id {pk},
                    gid BIGINT NOT NULL,
                    ts TEXT NOT NULL,
                    type TEXT NOT NULL CHECK (type IN ('stop_phrase', 'ignored_word')),
                    data TEXT NOT NULL,
                    UNIQUE (gid, data)
                )"
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS approved_users (
                    id {pk},
                    uid BIGINT NOT NULL,
                    gid BIGINT NOT NULL,
                    name TEXT,
                    ts TEXT NOT NULL,
                    UNIQUE (gid, uid)
                )"
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS detected_spam (
                    id {pk},
                    gid BIGINT NOT NULL,
                    text TEXT NOT NULL,
                    user_id {user_id_type} NOT NULL,
                    user_name TEXT,
                    ts TEXT NOT NULL,
                    added INTEGER NOT NULL DEFAULT 0,
                    checks TEXT NOT NULL
                )"
            ),
            "CREATE TABLE IF NOT EXISTS messages (
                hash TEXT PRIMARY KEY,
                gid BIGINT NOT NULL,
                ts TEXT NOT NULL,
                chat_id BIGINT NOT NULL,
                user_id BIGINT NOT NULL,
                user_name TEXT,
                msg_id BIGINT NOT NULL
            )"
            .to_string(),
            "CREATE TABLE IF NOT EXISTS spam (
                user_id BIGINT PRIMARY KEY,
                gid BIGINT NOT NULL,
                ts TEXT NOT NULL,
                checks TEXT NOT NULL
            )"
            .to_string(),
            format!(
                "CREATE TABLE IF NOT EXISTS config (
                    id {pk},
                    gid BIGINT NOT NULL UNIQUE,
                    data TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                )"
            ),
        ];

        let _write = self.write_guard().await;
        for stmt in statements {
            sqlx::query(&stmt).execute(&self.pool).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn backend_detected_from_url() {
        assert_eq!(Backend::from_url("sqlite::memory:"), Backend::Sqlite);
        assert_eq!(Backend::from_url("sqlite:///tmp/foo.db"), Backend::Sqlite);
        assert_eq!(
            Backend::from_url("postgres://user@localhost/db"),
            Backend::Postgres
        );
        assert_eq!(
            Backend::from_url("postgresql://user@localhost/db"),
            Backend::Postgres
        );
    }
}
