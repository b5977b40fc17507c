//! Backend-neutral DDL helpers.
//!
//! Every statement is `IF NOT EXISTS`, so mapper `initialize()` calls can be
//! repeated freely.

use diesel::sql_types::Text;
use diesel::QueryableByName;
use diesel_async::{RunQueryDsl, SimpleAsyncConnection};

use super::error::Result;
use super::pool::{Backend, DbPool};
use crate::with_conn;

/// Logical column type, mapped to a backend type at DDL time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Text,
    BigInt,
    Bool,
}

impl ColumnType {
    fn sql(self) -> &'static str {
        // SQLite maps these names onto its INTEGER/TEXT/NUMERIC affinities.
        match self {
            ColumnType::Text => "TEXT",
            ColumnType::BigInt => "BIGINT",
            ColumnType::Bool => "BOOLEAN",
        }
    }
}

/// A column definition for [`DbPool::create_table`].
#[derive(Debug, Clone, Copy)]
pub struct Column {
    pub name: &'static str,
    pub ty: ColumnType,
    pub nullable: bool,
}

impl Column {
    pub const fn text(name: &'static str) -> Self {
        Self {
            name,
            ty: ColumnType::Text,
            nullable: false,
        }
    }

    pub const fn bigint(name: &'static str) -> Self {
        Self {
            name,
            ty: ColumnType::BigInt,
            nullable: false,
        }
    }

    pub const fn boolean(name: &'static str) -> Self {
        Self {
            name,
            ty: ColumnType::Bool,
            nullable: false,
        }
    }

    pub const fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    fn ddl(&self) -> String {
        if self.nullable {
            format!("{} {}", self.name, self.ty.sql())
        } else {
            format!("{} {} NOT NULL", self.name, self.ty.sql())
        }
    }
}

#[derive(QueryableByName)]
struct NameRow {
    #[diesel(sql_type = Text)]
    name: String,
}

impl DbPool {
    /// Execute one or more DDL statements.
    pub async fn execute_ddl(&self, sql: &str) -> Result<()> {
        with_conn!(*self, conn => conn.batch_execute(sql).await)?;
        Ok(())
    }

    /// Create a table with the given columns.
    pub async fn create_table(&self, name: &str, columns: &[Column]) -> Result<()> {
        let body = columns.iter().map(Column::ddl).collect::<Vec<_>>().join(", ");
        self.execute_ddl(&format!("CREATE TABLE IF NOT EXISTS {name} ({body})"))
            .await
    }

    /// Create a table whose first column is a store-allocated 64-bit id.
    pub async fn create_autoincrement_table(
        &self,
        name: &str,
        pk_column: &str,
        columns: &[Column],
    ) -> Result<()> {
        let mut parts = vec![format!(
            "{pk_column} {}",
            self.backend().autoincrement_column_type()
        )];
        parts.extend(columns.iter().map(Column::ddl));
        self.execute_ddl(&format!(
            "CREATE TABLE IF NOT EXISTS {name} ({})",
            parts.join(", ")
        ))
        .await
    }

    /// Create an index named `idx_<table>_<columns>`.
    pub async fn create_index(&self, table: &str, columns: &[&str], unique: bool) -> Result<()> {
        let name = format!("idx_{table}_{}", columns.join("_"));
        let unique = if unique { "UNIQUE " } else { "" };
        self.execute_ddl(&format!(
            "CREATE {unique}INDEX IF NOT EXISTS {name} ON {table} ({})",
            columns.join(", ")
        ))
        .await
    }

    /// Switch an SQLite file to WAL journaling. No-op on other backends.
    pub async fn enable_wal(&self) -> Result<()> {
        if self.backend() == Backend::Sqlite {
            self.execute_ddl("PRAGMA journal_mode = WAL;").await?;
        }
        Ok(())
    }

    /// Names of the tables in the current schema.
    pub async fn table_names(&self) -> Result<Vec<String>> {
        self.names(match self.backend() {
            Backend::Sqlite => {
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name"
            }
            Backend::Postgres => {
                "SELECT tablename AS name FROM pg_tables WHERE schemaname = current_schema() ORDER BY tablename"
            }
        })
        .await
    }

    /// Names of the indexes in the current schema.
    pub async fn index_names(&self) -> Result<Vec<String>> {
        self.names(match self.backend() {
            Backend::Sqlite => {
                "SELECT name FROM sqlite_master WHERE type = 'index' AND name NOT LIKE 'sqlite_%' ORDER BY name"
            }
            Backend::Postgres => {
                "SELECT indexname AS name FROM pg_indexes WHERE schemaname = current_schema() ORDER BY indexname"
            }
        })
        .await
    }

    async fn names(&self, sql: &str) -> Result<Vec<String>> {
        let rows = with_conn!(*self, conn => {
            diesel::sql_query(sql).load::<NameRow>(&mut conn).await
        })?;
        Ok(rows.into_iter().map(|r| r.name).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_create_table_is_idempotent() {
        let dir = tempdir().unwrap();
        let pool = DbPool::sqlite_from_path(&dir.path().join("store.db"));

        let columns = [Column::text("label"), Column::bigint("size").nullable()];
        for _ in 0..2 {
            pool.create_autoincrement_table("things", "thing_id", &columns)
                .await
                .unwrap();
            pool.create_index("things", &["label"], true).await.unwrap();
        }

        assert_eq!(pool.table_names().await.unwrap(), vec!["things"]);
        assert_eq!(
            pool.index_names().await.unwrap(),
            vec!["idx_things_label"]
        );
    }

    #[test]
    fn test_column_ddl() {
        assert_eq!(Column::text("path").ddl(), "path TEXT NOT NULL");
        assert_eq!(Column::bigint("n").nullable().ddl(), "n BIGINT");
    }
}
