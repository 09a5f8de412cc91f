use crate::error::Result;
use crate::types::{ConnectParams, RawQueryResult, SqlValue};

/// Trait for database driver implementations.
///
/// All calls are blocking. Callers on an async runtime must go through a
/// [`Worker`](crate::Worker) so the runtime thread is never stalled.
pub trait DatabaseDriver: Send + Sync {
    /// Open a new, unpooled connection.
    fn connect(&self, params: &ConnectParams) -> Result<Box<dyn Connection>>;
}

/// A live connection owned by exactly one caller.
///
/// Dropping a connection is not guaranteed to release the server session;
/// owners must call [`Connection::close`].
pub trait Connection: Send {
    /// Open a cursor bound to this connection.
    fn cursor(&mut self) -> Result<Box<dyn Cursor>>;

    /// Close the connection, releasing the server session.
    fn close(self: Box<Self>) -> Result<()>;
}

/// A driver-level handle used to run one statement and read its results.
pub trait Cursor: Send {
    /// Execute a statement with `$n` placeholders.
    fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<()>;

    /// Fetch every row produced by the last executed statement.
    fn fetch_all(&mut self) -> Result<RawQueryResult>;
}
