//! Executes statements built by `query::builder` against the business dataset.

use async_trait::async_trait;
use sqlx::postgres::PgArguments;
use sqlx::query::Query;
use sqlx::{PgPool, Postgres, Row};

use super::StoreResult;
use crate::models::ticket::TicketRow;
use crate::query::{SqlValue, Statement};

#[async_trait]
pub trait Dataset: Send + Sync {
    /// First column of the single row, as a count.
    async fn fetch_count(&self, stmt: &Statement) -> StoreResult<i64>;

    async fn fetch_rows(&self, stmt: &Statement) -> StoreResult<Vec<TicketRow>>;

    async fn fetch_optional_row(&self, stmt: &Statement) -> StoreResult<Option<TicketRow>>;

    /// Rows affected.
    async fn execute(&self, stmt: &Statement) -> StoreResult<u64>;

    /// First column of every row, as text.
    async fn fetch_strings(&self, stmt: &Statement) -> StoreResult<Vec<String>>;
}

#[derive(Clone)]
pub struct PgDataset {
    pool: PgPool,
}

impl PgDataset {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn bind_params<'q>(
    mut query: Query<'q, Postgres, PgArguments>,
    params: &'q [SqlValue],
) -> Query<'q, Postgres, PgArguments> {
    for param in params {
        query = match param {
            SqlValue::Text(s) => query.bind(s.as_str()),
            SqlValue::Int(i) => query.bind(*i),
            SqlValue::Null => query.bind(Option::<String>::None),
        };
    }
    query
}

#[async_trait]
impl Dataset for PgDataset {
    async fn fetch_count(&self, stmt: &Statement) -> StoreResult<i64> {
        let row = bind_params(sqlx::query(&stmt.sql), &stmt.params)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get::<i64, _>(0)?)
    }

    async fn fetch_rows(&self, stmt: &Statement) -> StoreResult<Vec<TicketRow>> {
        let rows = bind_params(sqlx::query(&stmt.sql), &stmt.params)
            .fetch_all(&self.pool)
            .await?;
        let tickets = rows
            .iter()
            .map(TicketRow::from_positional)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(tickets)
    }

    async fn fetch_optional_row(&self, stmt: &Statement) -> StoreResult<Option<TicketRow>> {
        let row = bind_params(sqlx::query(&stmt.sql), &stmt.params)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(TicketRow::from_positional).transpose()?)
    }

    async fn execute(&self, stmt: &Statement) -> StoreResult<u64> {
        let result = bind_params(sqlx::query(&stmt.sql), &stmt.params)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn fetch_strings(&self, stmt: &Statement) -> StoreResult<Vec<String>> {
        let rows = bind_params(sqlx::query(&stmt.sql), &stmt.params)
            .fetch_all(&self.pool)
            .await?;
        let values = rows
            .iter()
            .map(|r| r.try_get::<String, _>(0))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(values)
    }
}
