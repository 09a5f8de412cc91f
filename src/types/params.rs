use std::collections::{BTreeMap, HashMap};

use crate::error::{PgTaskError, Result};
use crate::types::SqlValue;

/// Parameters for a single statement.
///
/// Positional values bind to `%s` placeholders, numbered in order of
/// appearance. A query without any `%s` is sent as-is, so native PostgreSQL
/// placeholders (`$1`, `$2`, ...) keep working. Named values bind to
/// `%(name)s` placeholders. In both forms `%%` is a literal percent sign and
/// the statement reaches the driver with `$n` placeholders only.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum QueryParams {
    #[default]
    None,
    Positional(Vec<SqlValue>),
    Named(BTreeMap<String, SqlValue>),
}

/// A statement ready for the driver: placeholders are all `$n`.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundQuery {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

impl QueryParams {
    /// Build positional parameters from anything convertible to `SqlValue`.
    pub fn positional<V: Into<SqlValue>>(values: impl IntoIterator<Item = V>) -> Self {
        QueryParams::Positional(values.into_iter().map(Into::into).collect())
    }

    /// Build named parameters from `(name, value)` pairs.
    pub fn named<K: Into<String>, V: Into<SqlValue>>(
        values: impl IntoIterator<Item = (K, V)>,
    ) -> Self {
        QueryParams::Named(
            values
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    pub fn is_empty(&self) -> bool {
        match self {
            QueryParams::None => true,
            QueryParams::Positional(values) => values.is_empty(),
            QueryParams::Named(values) => values.is_empty(),
        }
    }

    /// Resolve the placeholders of `query` against these parameters.
    ///
    /// A placeholder without a value, a count mismatch, mixed placeholder
    /// styles or a malformed placeholder fail with `QueryFailed`: it is the
    /// same class of problem as a server-side parameter mismatch.
    pub fn bind(&self, query: &str) -> Result<BoundQuery> {
        match self {
            QueryParams::None => Ok(BoundQuery {
                sql: query.to_string(),
                params: Vec::new(),
            }),
            QueryParams::Positional(values) => bind_positional(query, values),
            QueryParams::Named(values) => bind_named(query, values),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Placeholder<'q> {
    Positional,
    Named(&'q str),
}

/// Rewrite every `%s` / `%(name)s` in `query` to `$n`, with `n` chosen by
/// `slot`. Returns the rewritten SQL and the number of placeholders seen.
///
/// A `%` followed by anything else is kept as-is (the modulo operator).
fn rewrite_placeholders<'q>(
    query: &'q str,
    mut slot: impl FnMut(Placeholder<'q>) -> Result<usize>,
) -> Result<(String, usize)> {
    let mut sql = String::with_capacity(query.len());
    let mut found = 0;
    let mut rest = query;

    while let Some(pos) = rest.find('%') {
        sql.push_str(&rest[..pos]);
        let tail = &rest[pos + 1..];

        // %% is a literal percent sign
        if let Some(after) = tail.strip_prefix('%') {
            sql.push('%');
            rest = after;
            continue;
        }

        let (placeholder, after) = if let Some(after) = tail.strip_prefix('s') {
            (Placeholder::Positional, after)
        } else if let Some(after) = tail.strip_prefix('(') {
            match after.find(')') {
                Some(end) if after[end + 1..].starts_with('s') => {
                    (Placeholder::Named(&after[..end]), &after[end + 2..])
                }
                _ => {
                    return Err(PgTaskError::query(format!(
                        "malformed named placeholder near '%({}'",
                        after.chars().take(32).collect::<String>()
                    )))
                }
            }
        } else {
            sql.push('%');
            rest = tail;
            continue;
        };

        found += 1;
        let index = slot(placeholder)?;
        sql.push('$');
        sql.push_str(&index.to_string());
        rest = after;
    }
    sql.push_str(rest);

    Ok((sql, found))
}

fn bind_positional(query: &str, values: &[SqlValue]) -> Result<BoundQuery> {
    let mut next = 0;
    let (sql, found) = rewrite_placeholders(query, |placeholder| match placeholder {
        Placeholder::Positional => {
            next += 1;
            Ok(next)
        }
        Placeholder::Named(name) => Err(PgTaskError::query(format!(
            "named placeholder '%({})s' used with positional parameters",
            name
        ))),
    })?;

    // No %s at all: native $n placeholders, left to the server
    if found == 0 {
        return Ok(BoundQuery {
            sql: query.to_string(),
            params: values.to_vec(),
        });
    }

    if found != values.len() {
        return Err(PgTaskError::query(format!(
            "query has {} placeholder(s) but {} parameter(s) were supplied",
            found,
            values.len()
        )));
    }

    Ok(BoundQuery {
        sql,
        params: values.to_vec(),
    })
}

fn bind_named(query: &str, values: &BTreeMap<String, SqlValue>) -> Result<BoundQuery> {
    let mut names: Vec<&str> = Vec::new();
    let mut params = Vec::new();

    let (sql, _) = rewrite_placeholders(query, |placeholder| {
        let name = match placeholder {
            Placeholder::Named(name) => name,
            Placeholder::Positional => {
                return Err(PgTaskError::query(
                    "positional placeholder '%s' used with named parameters",
                ))
            }
        };

        // Repeated names share one positional slot
        if let Some(i) = names.iter().position(|n| *n == name) {
            return Ok(i + 1);
        }
        let value = values.get(name).ok_or_else(|| {
            PgTaskError::query(format!("no value supplied for parameter '{}'", name))
        })?;
        names.push(name);
        params.push(value.clone());
        Ok(names.len())
    })?;

    Ok(BoundQuery { sql, params })
}

impl From<Vec<SqlValue>> for QueryParams {
    fn from(values: Vec<SqlValue>) -> Self {
        QueryParams::Positional(values)
    }
}

impl From<BTreeMap<String, SqlValue>> for QueryParams {
    fn from(values: BTreeMap<String, SqlValue>) -> Self {
        QueryParams::Named(values)
    }
}

impl From<HashMap<String, SqlValue>> for QueryParams {
    fn from(values: HashMap<String, SqlValue>) -> Self {
        QueryParams::Named(values.into_iter().collect())
    }
}
