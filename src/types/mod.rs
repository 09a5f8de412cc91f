mod connect_params;
mod params;
mod row;
mod sql_value;

pub use connect_params::ConnectParams;
pub use params::{BoundQuery, QueryParams};
pub use row::{RawQueryResult, Row};
pub use sql_value::SqlValue;
