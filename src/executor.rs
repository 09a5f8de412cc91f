use std::fmt;
use std::sync::OnceLock;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::credentials::PostgresCredentials;
use crate::error::{PgTaskError, Result};
use crate::traits::{Connection, Cursor, DatabaseDriver, QueryTask};
use crate::types::{ConnectParams, QueryParams, RawQueryResult, Row, SqlValue};
use crate::worker::Worker;

/// Where a single query invocation is.
///
/// Connecting, Executing and Fetching go straight to Closing on error, and
/// Closing is always reached once a connection exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryPhase {
    Idle,
    Connecting,
    Executing,
    Fetching,
    Closing,
    Done,
}

impl fmt::Display for QueryPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            QueryPhase::Idle => "idle",
            QueryPhase::Connecting => "connecting",
            QueryPhase::Executing => "executing",
            QueryPhase::Fetching => "fetching",
            QueryPhase::Closing => "closing",
            QueryPhase::Done => "done",
        };
        f.write_str(name)
    }
}

/// One statement to run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryRequest {
    pub query: String,
    pub params: QueryParams,
    /// Used only when the credentials have no database configured.
    pub database: Option<String>,
}

impl QueryRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Self::default()
        }
    }

    pub fn with_params(mut self, params: impl Into<QueryParams>) -> Self {
        self.params = params.into();
        self
    }

    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }
}

/// A connection and the cursor opened on it, owned by one invocation.
///
/// Moves into each worker closure and back out, so while the invocation is
/// suspended the session lives on the worker thread.
struct Session {
    connection: Option<Box<dyn Connection>>,
    cursor: Option<Box<dyn Cursor>>,
}

impl Session {
    fn open(driver: &dyn DatabaseDriver, params: &ConnectParams) -> Result<Self> {
        let connection = driver.connect(params)?;
        Ok(Self {
            connection: Some(connection),
            cursor: None,
        })
    }

    fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<()> {
        let connection = self
            .connection
            .as_mut()
            .ok_or_else(|| PgTaskError::query("connection is closed"))?;
        let cursor = self.cursor.insert(connection.cursor()?);
        cursor.execute(sql, params)
    }

    fn fetch_all(&mut self) -> Result<RawQueryResult> {
        self.cursor
            .as_mut()
            .ok_or_else(|| PgTaskError::fetch("no statement has been executed"))?
            .fetch_all()
    }

    /// Drop the cursor, then close the connection explicitly.
    fn close(&mut self) -> Result<()> {
        self.cursor = None;
        match self.connection.take() {
            Some(connection) => connection.close(),
            None => Ok(()),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let Some(connection) = self.connection.take() else {
            return;
        };
        self.cursor = None;

        let close = move || {
            warn!("closing connection left open by an abandoned query");
            if let Err(e) = connection.close() {
                warn!(error = %e, "failed to close abandoned connection");
            }
        };

        // Blocking drivers must not close on a runtime thread
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(close);
            }
            Err(_) => close(),
        }
    }
}

/// Runs queries off the async runtime, one fresh connection per query.
#[derive(Debug, Clone, Default)]
pub struct QueryExecutor {
    worker: Worker,
}

impl QueryExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `worker` for every blocking driver call.
    pub fn with_worker(worker: Worker) -> Self {
        Self { worker }
    }

    /// Execute `request` and return every row it produced.
    ///
    /// Connect, execute, fetch and close each run on the worker, strictly in
    /// that order. The connection is closed before this returns, whether the
    /// query succeeded or not, and the first error is returned unchanged. If
    /// this future is dropped mid-flight the pending driver call still runs
    /// to completion and the connection is closed afterwards.
    pub async fn run(
        &self,
        request: QueryRequest,
        credentials: &PostgresCredentials,
    ) -> Result<Vec<Row>> {
        let QueryRequest {
            query,
            params,
            database,
        } = request;

        let connect_params = credentials.connect_params(database.as_deref())?;
        let driver = credentials.driver();

        debug!(
            phase = %QueryPhase::Connecting,
            host = %connect_params.host,
            port = connect_params.port,
            database = %connect_params.database,
            "running query"
        );
        let session = self
            .worker
            .run(move || Session::open(driver.as_ref(), &connect_params))
            .await??;

        debug!(phase = %QueryPhase::Executing);
        let (session, executed) = self
            .step(session, move |s| {
                let bound = params.bind(&query)?;
                s.execute(&bound.sql, &bound.params)
            })
            .await?;

        let (mut session, outcome) = match executed {
            Ok(()) => {
                debug!(phase = %QueryPhase::Fetching);
                self.step(session, Session::fetch_all).await?
            }
            Err(e) => (session, Err(e)),
        };

        debug!(phase = %QueryPhase::Closing);
        let closed = self.worker.run(move || session.close()).await;
        if let Ok(Err(e)) | Err(e) = closed {
            warn!(error = %e, "failed to close connection");
        }

        let rows = outcome?.into_rows();
        debug!(phase = %QueryPhase::Done, rows = rows.len());
        Ok(rows)
    }

    /// Run one session step on the worker and hand the session back.
    async fn step<T, F>(&self, mut session: Session, f: F) -> Result<(Session, Result<T>)>
    where
        F: FnOnce(&mut Session) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        self.worker
            .run(move || {
                let out = f(&mut session);
                (session, out)
            })
            .await
    }
}

#[async_trait]
impl QueryTask for QueryExecutor {
    async fn run_query(
        &self,
        request: QueryRequest,
        credentials: &PostgresCredentials,
    ) -> Result<Vec<Row>> {
        self.run(request, credentials).await
    }
}

fn default_executor() -> &'static QueryExecutor {
    static EXECUTOR: OnceLock<QueryExecutor> = OnceLock::new();
    EXECUTOR.get_or_init(QueryExecutor::new)
}

/// Execute a query against PostgreSQL and return all rows.
///
/// `database` is only used when `credentials` has no database configured.
///
/// # Example
/// ```ignore
/// let credentials = PostgresCredentials::new("user", "password").with_database("postgres");
/// let rows = run_query(
///     "SELECT * FROM table WHERE id = %(id_param)s LIMIT 8;",
///     &credentials,
///     QueryParams::named([("id_param", 1)]),
///     None,
/// )
/// .await?;
/// ```
pub async fn run_query(
    query: &str,
    credentials: &PostgresCredentials,
    params: impl Into<QueryParams>,
    database: Option<&str>,
) -> Result<Vec<Row>> {
    let mut request = QueryRequest::new(query).with_params(params);
    request.database = database.map(str::to_string);
    default_executor().run(request, credentials).await
}
