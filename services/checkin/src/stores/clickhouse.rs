use super::{RowMutation, StoreError, WideColumnStore};
use crate::config::ClickHouseConfig;
use ::clickhouse::{Client, Row};
use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info, instrument};

/// One versioned cell of a post row
#[derive(Debug, Clone, PartialEq, Serialize, Row)]
struct CellRow {
    row_key: String,
    family: String,
    qualifier: String,
    value: String,
    ts_millis: i64,
}

/// Wide-column layout on ClickHouse: a row is the set of cells sharing `row_key`,
/// and each write appends new versions rather than overwriting.
#[derive(Clone)]
pub struct ClickHouseWideColumnStore {
    client: Client,
    table: String,
}

impl ClickHouseWideColumnStore {
    pub fn new(config: &ClickHouseConfig) -> Self {
        let client = Client::default()
            .with_url(&config.url)
            .with_database(&config.database)
            .with_compression(::clickhouse::Compression::Lz4);

        Self {
            client,
            table: config.table.clone(),
        }
    }

    /// Create the cell table unless it exists
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        let ddl = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                row_key String,
                family LowCardinality(String),
                qualifier String,
                value String,
                ts_millis Int64
            ) ENGINE = MergeTree()
            ORDER BY (row_key, family, qualifier, ts_millis)
            "#,
            table = self.table
        );

        self.client
            .query(&ddl)
            .execute()
            .await
            .map_err(clickhouse_error)?;

        info!(table = %self.table, "ClickHouse cell table ready");
        Ok(())
    }
}

#[async_trait]
impl WideColumnStore for ClickHouseWideColumnStore {
    #[instrument(skip(self, mutation), fields(table = %self.table, cells = mutation.len()))]
    async fn append_row(&self, row_key: &str, mutation: &RowMutation) -> Result<(), StoreError> {
        let rows = cell_rows(row_key, mutation);

        let mut insert = self.client.insert(&self.table).map_err(clickhouse_error)?;
        for row in &rows {
            insert.write(row).await.map_err(clickhouse_error)?;
        }
        insert.end().await.map_err(clickhouse_error)?;

        debug!("Row appended");
        Ok(())
    }
}

fn cell_rows(row_key: &str, mutation: &RowMutation) -> Vec<CellRow> {
    let ts_millis = mutation.timestamp().timestamp_millis();
    mutation
        .cells()
        .map(|(family, qualifier, value)| CellRow {
            row_key: row_key.to_string(),
            family: family.to_string(),
            qualifier: qualifier.to_string(),
            value: value.to_string(),
            ts_millis,
        })
        .collect()
}

fn clickhouse_error(e: ::clickhouse::error::Error) -> StoreError {
    StoreError::Unavailable(format!("ClickHouse: {e}"))
}
