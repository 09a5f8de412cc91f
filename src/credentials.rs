use std::fmt;
use std::sync::Arc;

use serde::Deserialize;
use tracing::debug;

use crate::drivers::PostgresDriver;
use crate::error::{PgTaskError, Result};
use crate::traits::{Connection, DatabaseDriver};
use crate::types::ConnectParams;

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 5432;

const MISSING_DATABASE: &str = "The database must be set in either PostgresCredentials or the task";

fn default_host() -> String {
    DEFAULT_HOST.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_driver() -> Arc<dyn DatabaseDriver> {
    Arc::new(PostgresDriver::new())
}

/// Authentication parameters for a PostgreSQL server.
///
/// Built once, usually from external configuration, then shared read-only
/// by any number of concurrent queries. Each [`get_connection`] call opens a
/// fresh connection.
///
/// The password is never printed: `Debug` redacts it and it is never
/// attached to log events.
///
/// [`get_connection`]: PostgresCredentials::get_connection
#[derive(Clone, Deserialize)]
pub struct PostgresCredentials {
    user: String,
    password: String,
    #[serde(default)]
    database: Option<String>,
    #[serde(default = "default_host")]
    host: String,
    #[serde(default = "default_port")]
    port: u16,
    #[serde(skip, default = "default_driver")]
    driver: Arc<dyn DatabaseDriver>,
}

impl PostgresCredentials {
    /// Credentials for `user`, with no database, on `localhost:5432`.
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
            database: None,
            host: default_host(),
            port: default_port(),
            driver: default_driver(),
        }
    }

    /// Set the default database.
    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Use a custom driver instead of the PostgreSQL one.
    /// Useful for testing or using alternative database drivers.
    pub fn with_driver(mut self, driver: Arc<dyn DatabaseDriver>) -> Self {
        self.driver = driver;
        self
    }

    /// Read credentials from the libpq environment variables.
    ///
    /// `PGUSER` and `PGPASSWORD` are required; `PGDATABASE`, `PGHOST` and
    /// `PGPORT` are optional.
    pub fn from_env() -> Result<Self> {
        Self::from_env_with(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env), with a custom variable lookup.
    pub fn from_env_with<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &str| {
            lookup(key)
                .filter(|v| !v.is_empty())
                .ok_or_else(|| PgTaskError::configuration(format!("{} is not set", key)))
        };

        let mut credentials = Self::new(required("PGUSER")?, required("PGPASSWORD")?);
        if let Some(database) = lookup("PGDATABASE").filter(|v| !v.is_empty()) {
            credentials = credentials.with_database(database);
        }
        if let Some(host) = lookup("PGHOST").filter(|v| !v.is_empty()) {
            credentials = credentials.with_host(host);
        }
        if let Some(port) = lookup("PGPORT").filter(|v| !v.is_empty()) {
            let port = port.parse::<u16>().map_err(|e| {
                PgTaskError::configuration(format!("PGPORT '{}' is not a valid port: {}", port, e))
            })?;
            credentials = credentials.with_port(port);
        }
        Ok(credentials)
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    /// The configured default database, if any.
    pub fn database(&self) -> Option<&str> {
        self.database.as_deref()
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn driver(&self) -> Arc<dyn DatabaseDriver> {
        Arc::clone(&self.driver)
    }

    /// Resolve the parameters a connection would be opened with.
    ///
    /// The database configured on the credentials wins; `database` is only
    /// used when none is configured. Empty names count as unset.
    pub fn connect_params(&self, database: Option<&str>) -> Result<ConnectParams> {
        let database = self
            .database
            .as_deref()
            .filter(|d| !d.is_empty())
            .or_else(|| database.filter(|d| !d.is_empty()))
            .ok_or_else(|| PgTaskError::configuration(MISSING_DATABASE))?;

        Ok(ConnectParams {
            database: database.to_string(),
            user: self.user.clone(),
            password: self.password.clone(),
            host: self.host.clone(),
            port: self.port,
        })
    }

    /// Open an authenticated connection. Blocks until the server answers.
    ///
    /// The caller owns the returned connection and must close it.
    pub fn get_connection(&self, database: Option<&str>) -> Result<Box<dyn Connection>> {
        let params = self.connect_params(database)?;
        debug!(
            host = %params.host,
            port = params.port,
            database = %params.database,
            "requesting connection"
        );
        self.driver.connect(&params)
    }
}

impl fmt::Debug for PostgresCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresCredentials")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("database", &self.database)
            .field("host", &self.host)
            .field("port", &self.port)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let credentials = PostgresCredentials::new("user", "password");
        assert_eq!(credentials.host(), "localhost");
        assert_eq!(credentials.port(), 5432);
        assert_eq!(credentials.database(), None);
    }

    #[test]
    fn test_configured_database_wins_over_override() {
        let credentials = PostgresCredentials::new("user", "password").with_database("database");
        let params = credentials.connect_params(Some("override_database")).unwrap();
        assert_eq!(params.database, "database");
    }

    #[test]
    fn test_override_used_without_configured_database() {
        let credentials = PostgresCredentials::new("user", "password");
        let params = credentials.connect_params(Some("other")).unwrap();
        assert_eq!(params.database, "other");
    }

    #[test]
    fn test_empty_names_count_as_unset() {
        let credentials = PostgresCredentials::new("user", "password").with_database("");
        assert_eq!(
            credentials.connect_params(Some("fallback")).unwrap().database,
            "fallback"
        );
        assert!(matches!(
            credentials.connect_params(Some("")),
            Err(PgTaskError::Configuration(_))
        ));
    }

    #[test]
    fn test_missing_database_message() {
        let err = PostgresCredentials::new("user", "password")
            .connect_params(None)
            .unwrap_err();
        match err {
            PgTaskError::Configuration(msg) => assert!(msg.contains("must be set in either")),
            other => panic!("Expected Configuration error, got {:?}", other),
        }
    }

    #[test]
    fn test_debug_redacts_password() {
        let credentials = PostgresCredentials::new("user", "s3cret").with_database("db");
        let rendered = format!("{:?}", credentials);
        assert!(!rendered.contains("s3cret"));
        assert!(rendered.contains("user"));
    }

    #[test]
    fn test_deserialize_applies_defaults() {
        let credentials: PostgresCredentials =
            serde_json::from_str(r#"{"user": "app", "password": "pw"}"#).unwrap();
        assert_eq!(credentials.user(), "app");
        assert_eq!(credentials.host(), "localhost");
        assert_eq!(credentials.port(), 5432);
        assert_eq!(credentials.database(), None);
    }

    #[test]
    fn test_deserialize_requires_password() {
        let result = serde_json::from_str::<PostgresCredentials>(r#"{"user": "app"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_from_env() {
        let credentials = PostgresCredentials::from_env_with(env(&[
            ("PGUSER", "app"),
            ("PGPASSWORD", "pw"),
            ("PGDATABASE", "orders"),
            ("PGHOST", "db.internal"),
            ("PGPORT", "6432"),
        ]))
        .unwrap();

        assert_eq!(credentials.user(), "app");
        assert_eq!(credentials.database(), Some("orders"));
        assert_eq!(credentials.host(), "db.internal");
        assert_eq!(credentials.port(), 6432);
    }

    #[test]
    fn test_from_env_missing_password() {
        let err = PostgresCredentials::from_env_with(env(&[("PGUSER", "app")])).unwrap_err();
        assert_eq!(err.to_string(), "Configuration error: PGPASSWORD is not set");
    }

    #[test]
    fn test_from_env_invalid_port() {
        let err = PostgresCredentials::from_env_with(env(&[
            ("PGUSER", "app"),
            ("PGPASSWORD", "pw"),
            ("PGPORT", "not-a-port"),
        ]))
        .unwrap_err();
        assert!(matches!(err, PgTaskError::Configuration(_)));
    }
}
