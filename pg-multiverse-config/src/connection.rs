use serde::{Deserialize, Serialize};

/// Connection settings for one PostgreSQL server, primary or replica.
///
/// Field names follow the JSON configuration document.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ConnectionConfig {
    /// IP address or DNS name of the machine where PostgreSQL is running.
    pub host: String,
    /// The port PostgreSQL is running on. More often than not, `5432`.
    #[serde(default = "ConnectionConfig::port")]
    pub port: u16,
    /// Name of the PostgreSQL database to connect to.
    pub database: String,
    /// Name of the PostgreSQL user to connect with.
    pub user: String,
    /// Password for the user.
    pub password: String,
    /// Maximum number of connections the driver pool may open.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_connections: Option<usize>,
    /// Minimum number of connections the driver pool keeps open.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_connections: Option<usize>,
    /// TLS settings, either a boolean or a full options object.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssl: Option<SslConfig>,
    /// How long to wait for a new server connection, in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_timeout_millis: Option<u64>,
    /// Close connections idle for longer than this, in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idle_timeout_millis: Option<u64>,
    /// `search_path` to set on every connection.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub search_path: Option<String>,
}

impl ConnectionConfig {
    fn port() -> u16 {
        5432
    }
}

impl std::fmt::Display for ConnectionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}@{}:{}/{}",
            self.user, self.host, self.port, self.database
        )
    }
}

/// TLS is either on/off or fully specified.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum SslConfig {
    Enabled(bool),
    Options(SslOptions),
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SslOptions {
    #[serde(default)]
    pub reject_unauthorized: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cert: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ca: Option<String>,
}
