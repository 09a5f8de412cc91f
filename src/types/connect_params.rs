use std::fmt;

/// The exact values handed to a driver's connect primitive.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectParams {
    pub database: String,
    pub user: String,
    pub password: String,
    pub host: String,
    pub port: u16,
}

impl ConnectParams {
    /// Build the `tokio_postgres` connection configuration.
    pub fn to_config(&self) -> tokio_postgres::Config {
        let mut config = tokio_postgres::Config::new();
        config
            .dbname(&self.database)
            .user(&self.user)
            .password(&self.password)
            .host(&self.host)
            .port(self.port);
        config
    }
}

impl fmt::Debug for ConnectParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectParams")
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("host", &self.host)
            .field("port", &self.port)
            .finish()
    }
}
