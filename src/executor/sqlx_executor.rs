// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQLx executor over `AnyPool` (Postgres, MySQL, SQLite).
//!
//! A batch runs inside one transaction. On Postgres the transaction is
//! `REPEATABLE READ, READ ONLY` so every statement sees the same snapshot.

use async_trait::async_trait;
use serde_json::{Number, Value};
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{Any, AnyPool, Column, Row as _, ValueRef};
use std::sync::Once;
use std::time::Duration;
use tracing::{debug, info};

use super::retry::{with_retry, RetryPhase, RetryPolicy};
use super::{Row, SearchExecutor};
use crate::error::{SearchError, SearchResult};
use crate::metrics::LatencyTimer;
use crate::sql::{SqlDialect, SqlFragment, SqlParam};

// SQLx `Any` driver requires runtime installation
static INSTALL_DRIVERS: Once = Once::new();

fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

pub struct SqlxExecutor {
    pool: AnyPool,
    dialect: SqlDialect,
    retry: RetryPolicy,
}

impl SqlxExecutor {
    /// Connect with the default [`RetryPolicy`].
    pub async fn connect(url: &str) -> SearchResult<Self> {
        Self::connect_with(url, RetryPolicy::default()).await
    }

    /// Connect, retrying transient failures per `retry.connect`. The same
    /// policy governs `begin` on every batch.
    pub async fn connect_with(url: &str, retry: RetryPolicy) -> SearchResult<Self> {
        install_drivers();

        let dialect = SqlDialect::from_url(url)
            .ok_or_else(|| SearchError::Config(format!("unsupported database URL scheme in '{}'", redact(url))))?;
        // An in-memory SQLite database lives as long as its one connection.
        let in_memory = dialect == SqlDialect::Sqlite && url.contains(":memory:");

        let pool = with_retry(RetryPhase::Connect, &retry, || async move {
            let options = AnyPoolOptions::new().acquire_timeout(Duration::from_secs(10));
            let options = if in_memory {
                options.max_connections(1).idle_timeout(None).max_lifetime(None)
            } else {
                options.max_connections(20).idle_timeout(Duration::from_secs(300))
            };
            options.connect(url).await
        })
        .await?;

        info!(dialect = %dialect, "Connected search executor");
        Ok(Self { pool, dialect, retry })
    }
}

#[async_trait]
impl SearchExecutor for SqlxExecutor {
    fn dialect(&self) -> SqlDialect {
        self.dialect
    }

    async fn execute_batch(&self, statements: &[SqlFragment]) -> SearchResult<Vec<Vec<Row>>> {
        let _timer = LatencyTimer::new("execute");
        let mut tx = with_retry(RetryPhase::Begin, &self.retry, || self.pool.begin()).await?;
        if self.dialect == SqlDialect::Postgres {
            sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ, READ ONLY")
                .execute(&mut *tx)
                .await?;
        }

        let mut results = Vec::with_capacity(statements.len());
        for statement in statements {
            let rendered = statement.render(self.dialect);
            let mut query = sqlx::query::<Any>(&rendered);
            for param in &statement.params {
                query = match param {
                    SqlParam::Text(s) => query.bind(s.clone()),
                    SqlParam::Float(n) => query.bind(*n),
                    SqlParam::Integer(n) => query.bind(*n),
                    SqlParam::Boolean(b) => query.bind(*b),
                };
            }
            let rows = query.fetch_all(&mut *tx).await?;
            debug!(kind = %statement.kind, rows = rows.len(), "Executed statement");
            results.push(rows.iter().map(row_to_json).collect());
        }

        tx.commit().await?;
        Ok(results)
    }
}

/// Decode every column to JSON. Integers, floats, booleans and text are
/// tried in that order; anything else becomes `null`.
fn row_to_json(row: &AnyRow) -> Row {
    let mut out = Row::new();
    for (idx, column) in row.columns().iter().enumerate() {
        out.insert(column.name().to_string(), decode_column(row, idx));
    }
    out
}

fn decode_column(row: &AnyRow, idx: usize) -> Value {
    match row.try_get_raw(idx) {
        Ok(raw) if !raw.is_null() => {}
        _ => return Value::Null,
    }
    if let Ok(v) = row.try_get::<i64, _>(idx) {
        return Value::from(v);
    }
    if let Ok(v) = row.try_get::<f64, _>(idx) {
        return Number::from_f64(v).map(Value::Number).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<bool, _>(idx) {
        return Value::Bool(v);
    }
    if let Ok(v) = row.try_get::<String, _>(idx) {
        return Value::String(v);
    }
    row.try_get::<Vec<u8>, _>(idx)
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .map(Value::String)
        .unwrap_or(Value::Null)
}

/// Drop credentials from a URL before logging it
fn redact(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => format!("{}://***{}", &url[..scheme_end], &url[at..]),
        _ => url.to_string(),
    }
}
