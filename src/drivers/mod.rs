mod postgres;

pub use self::in_memory_test::{
    DriverEvent, DriverEventKind, InMemoryTestDriver, InMemoryTestResponseBuilder, RecordedQuery,
    ScriptedResponse,
};
pub use self::postgres::{PostgresConnection, PostgresCursor, PostgresDriver};
