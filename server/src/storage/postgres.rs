//! PostgreSQL relational store.
//!
//! Enable with the `postgres` feature:
//! ```toml
//! arena-server = { version = "0.1", features = ["postgres"] }
//! ```

use super::{RelationalStore, Result, Row, StoreError};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{Column, PgPool, Row as _, TypeInfo};

pub struct PostgresStore {
    database_url: String,
    max_connections: u32,
    pool: Option<PgPool>,
}

impl PostgresStore {
    pub fn new(database_url: &str) -> Self {
        Self {
            database_url: database_url.to_string(),
            max_connections: 5,
            pool: None,
        }
    }

    pub fn with_max_connections(mut self, max_connections: u32) -> Self {
        self.max_connections = max_connections;
        self
    }

    fn decode_row(row: &PgRow) -> Row {
        row.columns()
            .iter()
            .map(|column| {
                let index = column.ordinal();
                let value = match column.type_info().name() {
                    "BOOL" => decode::<bool>(row, index),
                    "INT2" => decode::<i16>(row, index),
                    "INT4" => decode::<i32>(row, index),
                    "INT8" => decode::<i64>(row, index),
                    "FLOAT4" => decode::<f32>(row, index),
                    "FLOAT8" => decode::<f64>(row, index),
                    "JSON" | "JSONB" => row.try_get::<Option<Value>, _>(index).ok().flatten(),
                    _ => decode::<String>(row, index),
                };
                (column.name().to_string(), value.unwrap_or(Value::Null))
            })
            .collect()
    }
}

fn decode<'r, T>(row: &'r PgRow, index: usize) -> Option<Value>
where
    T: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres> + Into<Value>,
{
    row.try_get::<Option<T>, _>(index).ok().flatten().map(Into::into)
}

#[async_trait]
impl RelationalStore for PostgresStore {
    async fn connect(&mut self) -> Result<()> {
        let pool = PgPoolOptions::new()
            .max_connections(self.max_connections)
            .connect(&self.database_url)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        self.pool = Some(pool);
        Ok(())
    }

    async fn execute(&self, query: &str) -> Result<Vec<Row>> {
        let pool = self.pool.as_ref().ok_or(StoreError::NotConnected)?;

        let rows = sqlx::query(query)
            .fetch_all(pool)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        Ok(rows.iter().map(Self::decode_row).collect())
    }
}
