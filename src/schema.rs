//! Read-only introspection of the query database.

use crate::config::QueryDbConfig;
use crate::errors::{AppError, AppResult};
use crate::models::{
    ColumnSchema, DatabaseMetadata, ForeignKeyRef, IndexSchema, SchemaSnapshot, TableSchema, TableStats,
};
use rusqlite::{Connection, OpenFlags};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct SchemaFetcher {
    db_path: PathBuf,
    timeout: Duration,
}

impl SchemaFetcher {
    pub fn new(db_path: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            db_path: db_path.into(),
            timeout,
        }
    }

    pub fn from_config(config: &QueryDbConfig) -> Self {
        Self::new(config.path.clone(), Duration::from_millis(config.timeout_ms))
    }

    pub async fn fetch_schema(&self) -> AppResult<SchemaSnapshot> {
        let path = self.db_path.clone();
        self.run_blocking(move || {
            let conn = open_read_only(&path)?;
            Ok(SchemaSnapshot {
                tables: read_schema(&conn)?,
                database_path: path.display().to_string(),
            })
        })
        .await
    }

    pub async fn fetch_metadata(&self) -> AppResult<DatabaseMetadata> {
        let path = self.db_path.clone();
        self.run_blocking(move || {
            let conn = open_read_only(&path)?;
            let size_bytes = std::fs::metadata(&path).map(|meta| meta.len()).unwrap_or_default();
            read_metadata(&conn, &path.display().to_string(), size_bytes)
        })
        .await
    }

    async fn run_blocking<T, F>(&self, job: F) -> AppResult<T>
    where
        T: Send + 'static,
        F: FnOnce() -> AppResult<T> + Send + 'static,
    {
        let handle = tokio::task::spawn_blocking(job);
        match tokio::time::timeout(self.timeout, handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(AppError::Transport(format!("schema fetch task failed: {}", join_error))),
            Err(_) => {
                tracing::warn!(path = %self.db_path.display(), timeout_ms = self.timeout.as_millis() as u64, "schema fetch timed out");
                Err(AppError::Transport(format!(
                    "schema fetch timed out after {} ms",
                    self.timeout.as_millis()
                )))
            }
        }
    }
}

fn open_read_only(path: &Path) -> AppResult<Connection> {
    if !path.exists() {
        return Err(AppError::Transport(format!("Database not found at {}", path.display())));
    }
    Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX)
        .map_err(|error| AppError::Transport(format!("failed to open {}: {}", path.display(), error)))
}

fn transport(error: rusqlite::Error) -> AppError {
    AppError::Transport(error.to_string())
}

fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn table_names(conn: &Connection) -> AppResult<Vec<String>> {
    let mut statement = conn
        .prepare("SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name")
        .map_err(transport)?;
    let rows = statement.query_map([], |row| row.get::<_, String>(0)).map_err(transport)?;
    let mut names = Vec::new();
    for row in rows {
        names.push(row.map_err(transport)?);
    }
    Ok(names)
}

/// Tables with their columns, foreign keys and indices, sorted by name.
pub fn read_schema(conn: &Connection) -> AppResult<Vec<TableSchema>> {
    let mut tables = Vec::new();
    for table in table_names(conn)? {
        let quoted = quote_identifier(&table);
        let foreign_keys = read_foreign_keys(conn, &quoted)?;

        let mut statement = conn
            .prepare(&format!("PRAGMA table_info({})", quoted))
            .map_err(transport)?;
        let rows = statement
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, i64>(5)?,
                ))
            })
            .map_err(transport)?;

        let mut columns = Vec::new();
        for row in rows {
            let (name, column_type, not_null, default_value, pk) = row.map_err(transport)?;
            let references = foreign_keys.get(&name).cloned();
            columns.push(ColumnSchema {
                is_foreign_key: references.is_some(),
                references,
                name,
                column_type,
                not_null: not_null != 0,
                default_value,
                is_primary_key: pk > 0,
            });
        }

        tables.push(TableSchema {
            indices: read_indices(conn, &quoted)?,
            table_name: table,
            columns,
        });
    }
    Ok(tables)
}

fn read_foreign_keys(conn: &Connection, quoted_table: &str) -> AppResult<HashMap<String, ForeignKeyRef>> {
    let mut statement = conn
        .prepare(&format!("PRAGMA foreign_key_list({})", quoted_table))
        .map_err(transport)?;
    let rows = statement
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(3)?,
                ForeignKeyRef {
                    referenced_table: row.get(2)?,
                    referenced_column: row.get(4)?,
                    on_update: row.get(5)?,
                    on_delete: row.get(6)?,
                },
            ))
        })
        .map_err(transport)?;
    let mut result = HashMap::new();
    for row in rows {
        let (column, reference) = row.map_err(transport)?;
        result.insert(column, reference);
    }
    Ok(result)
}

fn read_indices(conn: &Connection, quoted_table: &str) -> AppResult<Vec<IndexSchema>> {
    let mut statement = conn
        .prepare(&format!("PRAGMA index_list({})", quoted_table))
        .map_err(transport)?;
    let rows = statement
        .query_map([], |row| Ok((row.get::<_, String>(1)?, row.get::<_, i64>(2)?)))
        .map_err(transport)?;
    let mut listed = Vec::new();
    for row in rows {
        listed.push(row.map_err(transport)?);
    }

    let mut indices = Vec::new();
    for (name, unique) in listed {
        let mut info = conn
            .prepare(&format!("PRAGMA index_info({})", quote_identifier(&name)))
            .map_err(transport)?;
        let columns = info
            .query_map([], |row| row.get::<_, Option<String>>(2))
            .map_err(transport)?;
        let mut column_names = Vec::new();
        for column in columns {
            if let Some(column) = column.map_err(transport)? {
                column_names.push(column);
            }
        }
        indices.push(IndexSchema {
            name,
            unique: unique != 0,
            columns: column_names,
        });
    }
    Ok(indices)
}

pub fn read_metadata(conn: &Connection, path: &str, size_bytes: u64) -> AppResult<DatabaseMetadata> {
    let page_size: i64 = conn
        .query_row("PRAGMA page_size", [], |row| row.get(0))
        .map_err(transport)?;
    let page_count: i64 = conn
        .query_row("PRAGMA page_count", [], |row| row.get(0))
        .map_err(transport)?;

    let mut tables = Vec::new();
    for table in read_schema(conn)? {
        let row_count: i64 = conn
            .query_row(
                &format!("SELECT COUNT(*) FROM {}", quote_identifier(&table.table_name)),
                [],
                |row| row.get(0),
            )
            .map_err(transport)?;
        tables.push(TableStats {
            name: table.table_name,
            row_count: row_count.max(0) as u64,
            column_count: table.columns.len(),
            index_count: table.indices.len(),
        });
    }

    Ok(DatabaseMetadata {
        path: path.to_string(),
        size_bytes,
        page_size,
        page_count,
        total_rows: tables.iter().map(|table| table.row_count).sum(),
        tables,
    })
}

#[cfg(test)]
mod tests {
    use super::{quote_identifier, read_schema, SchemaFetcher};
    use crate::errors::AppError;
    use rusqlite::Connection;
    use std::path::Path;
    use std::time::Duration;

    const SAMPLE_SQL: &str = "
        CREATE TABLE customers (
            id INTEGER PRIMARY KEY,
            email TEXT NOT NULL UNIQUE,
            tier TEXT DEFAULT 'free'
        );
        CREATE TABLE orders (
            id INTEGER PRIMARY KEY,
            customer_id INTEGER NOT NULL REFERENCES customers(id) ON DELETE CASCADE,
            total REAL
        );
        CREATE INDEX idx_orders_customer ON orders(customer_id);
        INSERT INTO customers (email) VALUES ('a@example.com'), ('b@example.com');
        INSERT INTO orders (customer_id, total) VALUES (1, 9.5);
    ";

    fn sample_db(dir: &Path) -> std::path::PathBuf {
        let path = dir.join("query.db");
        let conn = Connection::open(&path).expect("open");
        conn.execute_batch(SAMPLE_SQL).expect("seed");
        path
    }

    #[test]
    fn reads_keys_and_indices() {
        let conn = Connection::open_in_memory().expect("memory");
        conn.execute_batch(SAMPLE_SQL).expect("seed");
        let tables = read_schema(&conn).expect("schema");
        let names: Vec<&str> = tables.iter().map(|table| table.table_name.as_str()).collect();
        assert_eq!(names, vec!["customers", "orders"]);

        let customers = &tables[0];
        assert!(customers.columns[0].is_primary_key);
        assert!(customers.columns[1].not_null);
        assert_eq!(customers.columns[2].default_value.as_deref(), Some("'free'"));
        assert!(customers.indices.iter().any(|index| index.unique && index.columns == vec!["email"]));

        let orders = &tables[1];
        let customer_id = orders
            .columns
            .iter()
            .find(|column| column.name == "customer_id")
            .expect("customer_id");
        assert!(customer_id.is_foreign_key);
        let reference = customer_id.references.as_ref().expect("reference");
        assert_eq!(reference.referenced_table, "customers");
        assert_eq!(reference.referenced_column.as_deref(), Some("id"));
        assert_eq!(reference.on_delete, "CASCADE");
        assert_eq!(orders.indices[0].name, "idx_orders_customer");
        assert!(!orders.columns.iter().any(|column| column.name == "total" && column.is_foreign_key));
    }

    #[test]
    fn serializes_type_field_and_skips_absent_references() {
        let conn = Connection::open_in_memory().expect("memory");
        conn.execute_batch("CREATE TABLE notes (body TEXT);").expect("seed");
        let tables = read_schema(&conn).expect("schema");
        let value = serde_json::to_value(&tables[0]).expect("json");
        assert_eq!(value["columns"][0]["type"], "TEXT");
        assert!(value["columns"][0].get("references").is_none());
        assert!(value.get("indices").is_none());
    }

    #[test]
    fn quotes_identifiers() {
        assert_eq!(quote_identifier("order"), "\"order\"");
        assert_eq!(quote_identifier("we\"ird"), "\"we\"\"ird\"");
    }

    #[tokio::test]
    async fn fetches_schema_and_metadata_from_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let fetcher = SchemaFetcher::new(sample_db(dir.path()), Duration::from_secs(5));

        let first = fetcher.fetch_schema().await.expect("schema");
        let second = fetcher.fetch_schema().await.expect("schema again");
        assert_eq!(first.tables, second.tables);
        assert!(first.database_path.ends_with("query.db"));

        let metadata = fetcher.fetch_metadata().await.expect("metadata");
        assert_eq!(metadata.total_rows, 3);
        assert_eq!(metadata.tables.len(), 2);
        assert!(metadata.page_size > 0);
        assert!(metadata.size_bytes > 0);
    }

    #[tokio::test]
    async fn missing_database_is_a_transport_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let fetcher = SchemaFetcher::new(dir.path().join("absent.db"), Duration::from_secs(1));
        let err = fetcher.fetch_schema().await.expect_err("missing");
        assert!(matches!(err, AppError::Transport(_)));
        assert!(!dir.path().join("absent.db").exists());
    }
}
