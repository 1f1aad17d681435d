//! Execution collaborator
//!
//! The compiler only produces [`SqlFragment`]s. A [`SearchExecutor`] runs
//! them and hands back rows as JSON objects.
//!
//! ```text
//! CompiledQuery::statements() ─→ SearchExecutor::execute_batch ─→ Vec<Vec<Row>> ─→ CompiledQuery::shape
//! ```
//!
//! Implementations should run one batch against a consistent snapshot
//! where the backend allows it. When they cannot, facet counts and hits
//! may disagree under concurrent writes.

mod retry;
mod sqlx_executor;

pub use retry::{is_transient, Backoff, RetryPhase, RetryPolicy};
pub use sqlx_executor::SqlxExecutor;

use async_trait::async_trait;

use crate::error::SearchResult;
use crate::sql::{SqlDialect, SqlFragment};

/// One result row, column name to JSON value
pub type Row = serde_json::Map<String, serde_json::Value>;

#[async_trait]
pub trait SearchExecutor: Send + Sync {
    /// Dialect the fragments must be rendered for
    fn dialect(&self) -> SqlDialect;

    /// Run every statement in order and return one row set per statement.
    async fn execute_batch(&self, statements: &[SqlFragment]) -> SearchResult<Vec<Vec<Row>>>;
}
