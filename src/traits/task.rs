use async_trait::async_trait;

use crate::credentials::PostgresCredentials;
use crate::error::Result;
use crate::executor::QueryRequest;
use crate::types::Row;

/// The unit of work a workflow engine schedules.
///
/// Implementations run one request to completion and hand back every row,
/// or fail with the error that stopped it. Retry policy belongs to the caller.
#[async_trait]
pub trait QueryTask: Send + Sync {
    async fn run_query(
        &self,
        request: QueryRequest,
        credentials: &PostgresCredentials,
    ) -> Result<Vec<Row>>;
}
