//! Connection pools for the SQLite and PostgreSQL backends.
//!
//! The backend is chosen at runtime from the connection string prefix
//! (`sqlite:<path>` or `postgres:<dsn>`). Mappers never match on the backend
//! themselves; they go through [`with_conn!`] or ask the pool for the
//! backend-specific pieces they need (DDL fragments, claim strategy).

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use diesel::connection::SimpleConnection;
use diesel::sqlite::SqliteConnection;
use diesel::Connection;
use diesel_async::sync_connection_wrapper::SyncConnectionWrapper;
use diesel_async::{AsyncConnection, SimpleAsyncConnection};

#[cfg(feature = "postgres")]
use diesel_async::pooled_connection::deadpool::{Object, Pool as DeadPool};
#[cfg(feature = "postgres")]
use diesel_async::pooled_connection::AsyncDieselConnectionManager;
#[cfg(feature = "postgres")]
use diesel_async::AsyncPgConnection;

use super::error::RepositoryError;
use super::util::redact_url_password;

/// Writers wait on the file lock instead of failing with SQLITE_BUSY.
const SQLITE_PRAGMAS: &str = "PRAGMA busy_timeout = 30000;";

/// Connections held by the PostgreSQL pool.
#[cfg(feature = "postgres")]
const PG_POOL_SIZE: usize = 16;

/// Backend kind behind a [`DbPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Sqlite,
    Postgres,
}

impl Backend {
    /// DDL fragment for an autoincrementing 64-bit primary key column.
    pub fn autoincrement_column_type(self) -> &'static str {
        match self {
            Backend::Sqlite => "INTEGER PRIMARY KEY AUTOINCREMENT",
            Backend::Postgres => "BIGSERIAL PRIMARY KEY",
        }
    }

    /// Bind placeholder for the `n`th (1-based) parameter of a raw statement.
    pub fn placeholder(self, n: usize) -> String {
        match self {
            Backend::Sqlite => "?".to_string(),
            Backend::Postgres => format!("${n}"),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Backend::Sqlite => "sqlite",
            Backend::Postgres => "postgres",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// SQLite "pool": opens a connection per use. The file lock is the real
/// point of contention, so holding connections open buys nothing.
#[derive(Clone)]
pub struct SqlitePool {
    path: Arc<str>,
}

impl SqlitePool {
    pub fn new(path: &str) -> Self {
        Self {
            path: Arc::from(path.strip_prefix("sqlite:").unwrap_or(path)),
        }
    }

    pub fn from_path(path: &Path) -> Self {
        Self::new(&path.to_string_lossy())
    }

    fn connection_error(&self, e: impl fmt::Display) -> RepositoryError {
        RepositoryError::Connection(format!("{}: {e}", self.path))
    }

    /// Async connection for ordinary queries.
    pub async fn get(&self) -> Result<SyncConnectionWrapper<SqliteConnection>, RepositoryError> {
        let mut conn = SyncConnectionWrapper::<SqliteConnection>::establish(&self.path)
            .await
            .map_err(|e| self.connection_error(e))?;
        conn.batch_execute(SQLITE_PRAGMAS).await?;
        Ok(conn)
    }

    /// Run `f` against a plain synchronous connection on the blocking pool.
    ///
    /// Used for sections that need `BEGIN IMMEDIATE`, which the async
    /// wrapper's transaction manager does not issue.
    pub async fn blocking<F, T>(&self, f: F) -> Result<T, RepositoryError>
    where
        F: FnOnce(&mut SqliteConnection) -> Result<T, RepositoryError> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn =
                SqliteConnection::establish(&pool.path).map_err(|e| pool.connection_error(e))?;
            conn.batch_execute(SQLITE_PRAGMAS)?;
            f(&mut conn)
        })
        .await?
    }
}

#[cfg(feature = "postgres")]
#[derive(Clone)]
pub struct PgPool {
    pool: DeadPool<AsyncPgConnection>,
}

#[cfg(feature = "postgres")]
impl PgPool {
    pub fn new(dsn: &str, max_size: usize) -> Result<Self, RepositoryError> {
        let manager = AsyncDieselConnectionManager::<AsyncPgConnection>::new(dsn);
        DeadPool::builder(manager)
            .max_size(max_size)
            .build()
            .map(|pool| Self { pool })
            .map_err(|e| RepositoryError::Connection(e.to_string()))
    }

    pub async fn get(
        &self,
    ) -> Result<Object<AsyncDieselConnectionManager<AsyncPgConnection>>, RepositoryError> {
        self.pool
            .get()
            .await
            .map_err(|e| RepositoryError::Connection(e.to_string()))
    }
}

/// Pool over whichever backend the connection string names.
#[derive(Clone)]
pub enum DbPool {
    Sqlite(SqlitePool),
    #[cfg(feature = "postgres")]
    Postgres(PgPool),
}

impl DbPool {
    /// Create a pool from a connection string.
    ///
    /// The backend is the text before the first colon:
    /// - `sqlite:/path/to/file.db` → SQLite (a bare path without a colon too)
    /// - `postgres:<dsn>`, `postgres://…`, `postgresql://…` → PostgreSQL
    pub fn from_url(url: &str) -> Result<Self, RepositoryError> {
        let (scheme, detail) = url.split_once(':').unwrap_or(("sqlite", url));

        match scheme {
            "sqlite" if detail.is_empty() => Err(RepositoryError::Connection(
                "sqlite connection string has no path".to_string(),
            )),
            "sqlite" => Ok(DbPool::Sqlite(SqlitePool::new(detail))),
            "postgres" | "postgresql" => Self::postgres(url, detail),
            other => Err(RepositoryError::BackendUnavailable(format!(
                "unknown database backend '{other}' in {}",
                redact_url_password(url)
            ))),
        }
    }

    #[cfg(feature = "postgres")]
    fn postgres(url: &str, detail: &str) -> Result<Self, RepositoryError> {
        // `postgres://…` is already a URL; `postgres:<dsn>` carries a bare DSN.
        let dsn = if detail.starts_with("//") { url } else { detail };
        Ok(DbPool::Postgres(PgPool::new(dsn, PG_POOL_SIZE)?))
    }

    #[cfg(not(feature = "postgres"))]
    fn postgres(url: &str, _detail: &str) -> Result<Self, RepositoryError> {
        Err(RepositoryError::BackendUnavailable(format!(
            "PostgreSQL support not compiled in (rebuild with --features postgres): {}",
            redact_url_password(url)
        )))
    }

    pub fn sqlite_from_path(path: &Path) -> Self {
        DbPool::Sqlite(SqlitePool::from_path(path))
    }

    pub fn backend(&self) -> Backend {
        match self {
            DbPool::Sqlite(_) => Backend::Sqlite,
            #[cfg(feature = "postgres")]
            DbPool::Postgres(_) => Backend::Postgres,
        }
    }
}

/// Run a block against a connection from either backend.
///
/// The connection is scoped to the block and released when it ends. The
/// enclosing function must return a [`RepositoryError`] result.
///
/// ```ignore
/// with_conn!(self.pool, conn => {
///     ingest_items::table.find(id).first::<ItemRecord>(&mut conn).await
/// })
/// ```
#[macro_export]
macro_rules! with_conn {
    ($pool:expr, $conn:ident => $body:expr) => {{
        match &$pool {
            $crate::repository::pool::DbPool::Sqlite(pool) => {
                let mut $conn = pool.get().await?;
                $body
            }
            #[cfg(feature = "postgres")]
            $crate::repository::pool::DbPool::Postgres(pool) => {
                let mut $conn = pool.get().await?;
                $body
            }
        }
    }};
}

pub use with_conn;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_from_connection_string() {
        let backend = |url: &str| DbPool::from_url(url).map(|pool| pool.backend());
        assert_eq!(backend("/path/to/db.sqlite").unwrap(), Backend::Sqlite);
        assert_eq!(backend("sqlite:/path/to/db").unwrap(), Backend::Sqlite);
        assert!(matches!(
            backend("mysql://localhost/test"),
            Err(RepositoryError::BackendUnavailable(_))
        ));
        assert!(matches!(backend("sqlite:"), Err(RepositoryError::Connection(_))));

        #[cfg(not(feature = "postgres"))]
        assert!(matches!(
            backend("postgres:host=localhost dbname=test"),
            Err(RepositoryError::BackendUnavailable(_))
        ));

        #[cfg(feature = "postgres")]
        {
            assert_eq!(backend("postgres://localhost/test").unwrap(), Backend::Postgres);
            assert_eq!(
                backend("postgres:host=localhost dbname=test").unwrap(),
                Backend::Postgres
            );
        }
    }

    #[test]
    fn test_backend_ddl_fragments() {
        assert_eq!(
            Backend::Sqlite.autoincrement_column_type(),
            "INTEGER PRIMARY KEY AUTOINCREMENT"
        );
        assert_eq!(
            Backend::Postgres.autoincrement_column_type(),
            "BIGSERIAL PRIMARY KEY"
        );
        assert_eq!(Backend::Sqlite.placeholder(2), "?");
        assert_eq!(Backend::Postgres.placeholder(2), "$2");
    }

    #[tokio::test]
    async fn test_sqlite_connection_error_names_path() {
        let pool = SqlitePool::new("sqlite:/nonexistent-dir/for/sure/db.sqlite");
        match pool.get().await {
            Err(RepositoryError::Connection(message)) => {
                assert!(message.contains("/nonexistent-dir/for/sure/db.sqlite"))
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("connected to a path that cannot exist"),
        }
    }
}
