//! pgtask - PostgreSQL credentials and a query task for workflow engines
//!
//! [`PostgresCredentials`] holds what is needed to authenticate and opens a
//! fresh connection on demand. [`run_query`] executes one parameterized
//! statement and returns every row, running the blocking driver calls on a
//! worker thread so the caller's runtime keeps scheduling other tasks.
//!
//! # Example
//! ```ignore
//! use pgtask::{run_query, PostgresCredentials, QueryParams};
//!
//! let credentials = PostgresCredentials::new("user", "password").with_database("postgres");
//!
//! let rows = run_query(
//!     "SELECT * FROM table WHERE id = %(id_param)s LIMIT 8;",
//!     &credentials,
//!     QueryParams::named([("id_param", 1)]),
//!     None,
//! )
//! .await?;
//! ```

pub mod credentials;
pub mod drivers;
pub mod error;
pub mod executor;
pub mod traits;
pub mod types;

mod worker;

// Re-export main types for convenient access
pub use credentials::PostgresCredentials;
pub use error::{DriverError, PgTaskError, Result};
pub use executor::{run_query, QueryExecutor, QueryPhase, QueryRequest};
pub use traits::{Connection, Cursor, DatabaseDriver, QueryTask};
pub use types::{ConnectParams, QueryParams, RawQueryResult, Row, SqlValue};
pub use worker::{Worker, DEFAULT_WORKER_LIMIT};
