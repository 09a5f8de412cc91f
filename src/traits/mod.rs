mod driver;
mod task;

pub use driver::{Connection, Cursor, DatabaseDriver};
pub use task::QueryTask;
