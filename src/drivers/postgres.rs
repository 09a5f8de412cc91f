use std::error::Error;
use std::fmt::Write;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use postgres::{Client, NoTls, Statement};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use tokio_postgres::types::{FromSql, Kind, ToSql, Type};
use tracing::debug;
use uuid::Uuid;

use crate::error::{DriverError, PgTaskError, Result};
use crate::traits::{Connection, Cursor, DatabaseDriver};
use crate::types::{ConnectParams, RawQueryResult, SqlValue};

/// PostgreSQL driver implementation using the blocking `postgres` client.
#[derive(Debug, Default, Clone, Copy)]
pub struct PostgresDriver;

impl PostgresDriver {
    pub fn new() -> Self {
        Self
    }
}

impl DatabaseDriver for PostgresDriver {
    fn connect(&self, params: &ConnectParams) -> Result<Box<dyn Connection>> {
        debug!(
            host = %params.host,
            port = params.port,
            database = %params.database,
            user = %params.user,
            "opening postgres connection"
        );

        let client = postgres::Config::from(params.to_config())
            .connect(NoTls)
            .map_err(PgTaskError::connection)?;

        Ok(Box::new(PostgresConnection {
            client: Arc::new(Mutex::new(Some(client))),
        }))
    }
}

type SharedClient = Arc<Mutex<Option<Client>>>;

fn lock(client: &SharedClient) -> MutexGuard<'_, Option<Client>> {
    client.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A single `postgres::Client`, shared with the cursors opened from it.
pub struct PostgresConnection {
    client: SharedClient,
}

impl Connection for PostgresConnection {
    fn cursor(&mut self) -> Result<Box<dyn Cursor>> {
        Ok(Box::new(PostgresCursor {
            client: Arc::clone(&self.client),
            pending: None,
        }))
    }

    fn close(self: Box<Self>) -> Result<()> {
        let client = lock(&self.client).take();
        match client {
            Some(client) => client.close().map_err(PgTaskError::connection),
            None => Ok(()),
        }
    }
}

struct PendingResult {
    columns: Vec<String>,
    rows: Vec<postgres::Row>,
}

/// Executes against the shared client and buffers the rows until fetched.
pub struct PostgresCursor {
    client: SharedClient,
    pending: Option<PendingResult>,
}

impl Cursor for PostgresCursor {
    fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<()> {
        self.pending = None;

        let mut guard = lock(&self.client);
        let client = guard
            .as_mut()
            .ok_or_else(|| PgTaskError::query("connection is closed"))?;

        let statement = client.prepare(sql).map_err(PgTaskError::query)?;
        let converted = convert_params(&statement, params).map_err(PgTaskError::QueryFailed)?;
        let param_refs: Vec<&(dyn ToSql + Sync)> = converted
            .iter()
            .map(|b| b.as_ref() as &(dyn ToSql + Sync))
            .collect();

        let rows = client
            .query(&statement, &param_refs)
            .map_err(PgTaskError::query)?;

        self.pending = Some(PendingResult {
            columns: statement
                .columns()
                .iter()
                .map(|c| c.name().to_string())
                .collect(),
            rows,
        });
        Ok(())
    }

    fn fetch_all(&mut self) -> Result<RawQueryResult> {
        let pending = self
            .pending
            .take()
            .ok_or_else(|| PgTaskError::fetch("no statement has been executed"))?;

        ensure_result_set(pending.columns.len()).map_err(PgTaskError::FetchFailed)?;

        let rows = pending
            .rows
            .iter()
            .map(|row| {
                (0..row.len())
                    .map(|i| row_value(row, i))
                    .collect::<std::result::Result<Vec<_>, _>>()
            })
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(PgTaskError::FetchFailed)?;

        Ok(RawQueryResult::new(pending.columns, rows))
    }
}

type BoxedParam = Box<dyn ToSql + Sync + Send>;

/// Statements without a result set (plain INSERT, DDL) have nothing to fetch.
fn ensure_result_set(column_count: usize) -> std::result::Result<(), DriverError> {
    if column_count == 0 {
        return Err(DriverError::new("no results to fetch"));
    }
    Ok(())
}

fn check_param_count(expected: usize, supplied: usize) -> std::result::Result<(), DriverError> {
    if expected != supplied {
        return Err(DriverError::new(format!(
            "statement expects {} parameter(s), {} supplied",
            expected, supplied
        )));
    }
    Ok(())
}

/// Convert parameters to the types the server inferred for the statement.
fn convert_params(
    statement: &Statement,
    params: &[SqlValue],
) -> std::result::Result<Vec<BoxedParam>, DriverError> {
    check_param_count(statement.params().len(), params.len())?;

    statement
        .params()
        .iter()
        .zip(params)
        .map(|(ty, value)| sql_value_to_tosql(value, ty))
        .collect()
}

/// Convert a SqlValue to a boxed ToSql trait object for the target type.
fn sql_value_to_tosql(
    value: &SqlValue,
    ty: &Type,
) -> std::result::Result<BoxedParam, DriverError> {
    Ok(match value {
        SqlValue::Null => typed_null(ty),
        SqlValue::Bool(b) => Box::new(*b),
        SqlValue::Int32(i) => integer_for(i64::from(*i), ty)?,
        SqlValue::Int64(i) => integer_for(*i, ty)?,
        SqlValue::Float64(f) => match *ty {
            Type::FLOAT4 => Box::new(*f as f32),
            Type::NUMERIC => Box::new(Decimal::from_f64(*f).ok_or_else(|| {
                DriverError::new(format!("value {} is not a valid numeric", f))
            })?),
            _ => Box::new(*f),
        },
        SqlValue::Text(s) => text_for(s, ty)?,
        SqlValue::Bytes(b) => Box::new(b.clone()),
        SqlValue::Json(v) => Box::new(v.clone()),
        SqlValue::Numeric(d) => match *ty {
            Type::FLOAT8 => Box::new(d.to_f64().ok_or_else(|| {
                DriverError::new(format!("value {} does not fit in {}", d, ty))
            })?),
            _ => Box::new(*d),
        },
        SqlValue::Date(d) => Box::new(*d),
        SqlValue::Time(t) => Box::new(*t),
        SqlValue::Timestamp(ts) => match *ty {
            Type::TIMESTAMPTZ => Box::new(ts.and_utc()),
            _ => Box::new(*ts),
        },
        SqlValue::TimestampTz(ts) => match *ty {
            Type::TIMESTAMP => Box::new(ts.naive_utc()),
            _ => Box::new(*ts),
        },
        SqlValue::Uuid(u) => Box::new(*u),
    })
}

fn integer_for(value: i64, ty: &Type) -> std::result::Result<BoxedParam, DriverError> {
    let out_of_range = || DriverError::new(format!("value {} out of range for type {}", value, ty));
    Ok(match *ty {
        Type::INT2 => Box::new(i16::try_from(value).map_err(|_| out_of_range())?),
        Type::INT4 => Box::new(i32::try_from(value).map_err(|_| out_of_range())?),
        Type::FLOAT4 => Box::new(value as f32),
        Type::FLOAT8 => Box::new(value as f64),
        Type::NUMERIC => Box::new(Decimal::from(value)),
        _ => Box::new(value),
    })
}

/// Text bound to a numeric or uuid placeholder is parsed client-side, since
/// the binary protocol gives the server no chance to cast it.
fn text_for(value: &str, ty: &Type) -> std::result::Result<BoxedParam, DriverError> {
    let invalid = |e: &dyn std::fmt::Display| {
        DriverError::new(format!("'{}' is not a valid {}: {}", value, ty, e))
    };
    Ok(match *ty {
        Type::NUMERIC => Box::new(value.parse::<Decimal>().map_err(|e| invalid(&e))?),
        Type::UUID => Box::new(Uuid::parse_str(value).map_err(|e| invalid(&e))?),
        _ => Box::new(value.to_string()),
    })
}

fn typed_null(ty: &Type) -> BoxedParam {
    match *ty {
        Type::BOOL => Box::new(None::<bool>),
        Type::INT2 => Box::new(None::<i16>),
        Type::INT4 => Box::new(None::<i32>),
        Type::INT8 => Box::new(None::<i64>),
        Type::FLOAT4 => Box::new(None::<f32>),
        Type::FLOAT8 => Box::new(None::<f64>),
        Type::BYTEA => Box::new(None::<Vec<u8>>),
        Type::JSON | Type::JSONB => Box::new(None::<serde_json::Value>),
        Type::NUMERIC => Box::new(None::<Decimal>),
        Type::DATE => Box::new(None::<NaiveDate>),
        Type::TIME => Box::new(None::<NaiveTime>),
        Type::TIMESTAMP => Box::new(None::<NaiveDateTime>),
        Type::TIMESTAMPTZ => Box::new(None::<DateTime<Utc>>),
        Type::UUID => Box::new(None::<Uuid>),
        _ => Box::new(None::<String>),
    }
}

/// An `interval` as sent on the wire, rendered as an ISO 8601 duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Interval {
    microseconds: i64,
    days: i32,
    months: i32,
}

impl Interval {
    fn to_iso8601(self) -> String {
        let mut out = String::from("P");
        let (years, months) = (self.months / 12, self.months % 12);
        if years != 0 {
            let _ = write!(out, "{}Y", years);
        }
        if months != 0 {
            let _ = write!(out, "{}M", months);
        }
        if self.days != 0 {
            let _ = write!(out, "{}D", self.days);
        }

        if self.microseconds != 0 {
            out.push('T');
            let hours = self.microseconds / 3_600_000_000;
            let rem = self.microseconds % 3_600_000_000;
            let minutes = rem / 60_000_000;
            let rem = rem % 60_000_000;
            if hours != 0 {
                let _ = write!(out, "{}H", hours);
            }
            if minutes != 0 {
                let _ = write!(out, "{}M", minutes);
            }
            if rem != 0 {
                let seconds = rem / 1_000_000;
                let fraction = (rem % 1_000_000).abs();
                if fraction == 0 {
                    let _ = write!(out, "{}S", seconds);
                } else {
                    let sign = if rem < 0 && seconds == 0 { "-" } else { "" };
                    let digits = format!("{:06}", fraction);
                    let _ = write!(
                        out,
                        "{}{}.{}S",
                        sign,
                        seconds,
                        digits.trim_end_matches('0')
                    );
                }
            }
        }

        if out == "P" {
            out.push_str("T0S");
        }
        out
    }
}

impl<'a> FromSql<'a> for Interval {
    fn from_sql(_: &Type, raw: &'a [u8]) -> std::result::Result<Self, Box<dyn Error + Sync + Send>> {
        if raw.len() != 16 {
            return Err(format!("invalid interval length {}", raw.len()).into());
        }
        let mut micros = [0u8; 8];
        let mut days = [0u8; 4];
        let mut months = [0u8; 4];
        micros.copy_from_slice(&raw[..8]);
        days.copy_from_slice(&raw[8..12]);
        months.copy_from_slice(&raw[12..]);
        Ok(Interval {
            microseconds: i64::from_be_bytes(micros),
            days: i32::from_be_bytes(days),
            months: i32::from_be_bytes(months),
        })
    }

    fn accepts(ty: &Type) -> bool {
        *ty == Type::INTERVAL
    }
}

/// The label of a user-defined enum value; sent as UTF-8 text.
struct EnumLabel(String);

impl<'a> FromSql<'a> for EnumLabel {
    fn from_sql(_: &Type, raw: &'a [u8]) -> std::result::Result<Self, Box<dyn Error + Sync + Send>> {
        Ok(EnumLabel(std::str::from_utf8(raw)?.to_string()))
    }

    fn accepts(ty: &Type) -> bool {
        matches!(ty.kind(), Kind::Enum(_))
    }
}

/// Decode the value at `index` according to its column type.
fn row_value(row: &postgres::Row, index: usize) -> std::result::Result<SqlValue, DriverError> {
    let column = &row.columns()[index];
    let value = match *column.type_() {
        Type::BOOL => row
            .try_get::<_, Option<bool>>(index)
            .map(|v| v.map(SqlValue::Bool)),
        Type::INT2 => row
            .try_get::<_, Option<i16>>(index)
            .map(|v| v.map(|i| SqlValue::Int32(i32::from(i)))),
        Type::INT4 => row
            .try_get::<_, Option<i32>>(index)
            .map(|v| v.map(SqlValue::Int32)),
        Type::INT8 => row
            .try_get::<_, Option<i64>>(index)
            .map(|v| v.map(SqlValue::Int64)),
        Type::OID => row
            .try_get::<_, Option<u32>>(index)
            .map(|v| v.map(|i| SqlValue::Int64(i64::from(i)))),
        Type::FLOAT4 => row
            .try_get::<_, Option<f32>>(index)
            .map(|v| v.map(|f| SqlValue::Float64(f64::from(f)))),
        Type::FLOAT8 => row
            .try_get::<_, Option<f64>>(index)
            .map(|v| v.map(SqlValue::Float64)),
        Type::NUMERIC => row
            .try_get::<_, Option<Decimal>>(index)
            .map(|v| v.map(SqlValue::Numeric)),
        Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME | Type::UNKNOWN => row
            .try_get::<_, Option<String>>(index)
            .map(|v| v.map(SqlValue::Text)),
        Type::BYTEA => row
            .try_get::<_, Option<Vec<u8>>>(index)
            .map(|v| v.map(SqlValue::Bytes)),
        Type::JSON | Type::JSONB => row
            .try_get::<_, Option<serde_json::Value>>(index)
            .map(|v| v.map(SqlValue::Json)),
        Type::DATE => row
            .try_get::<_, Option<NaiveDate>>(index)
            .map(|v| v.map(SqlValue::Date)),
        Type::TIME => row
            .try_get::<_, Option<NaiveTime>>(index)
            .map(|v| v.map(SqlValue::Time)),
        Type::TIMESTAMP => row
            .try_get::<_, Option<NaiveDateTime>>(index)
            .map(|v| v.map(SqlValue::Timestamp)),
        Type::TIMESTAMPTZ => row
            .try_get::<_, Option<DateTime<Utc>>>(index)
            .map(|v| v.map(SqlValue::TimestampTz)),
        Type::UUID => row
            .try_get::<_, Option<Uuid>>(index)
            .map(|v| v.map(SqlValue::Uuid)),
        Type::INTERVAL => row
            .try_get::<_, Option<Interval>>(index)
            .map(|v| v.map(|i| SqlValue::Text(i.to_iso8601()))),
        _ if matches!(column.type_().kind(), Kind::Enum(_)) => row
            .try_get::<_, Option<EnumLabel>>(index)
            .map(|v| v.map(|label| SqlValue::Text(label.0))),
        _ => {
            return Err(DriverError::new(format!(
                "unsupported type {} for column '{}'; cast it to text in the query",
                column.type_(),
                column.name()
            )))
        }
    };

    value
        .map(|v| v.unwrap_or(SqlValue::Null))
        .map_err(DriverError::from)
}
