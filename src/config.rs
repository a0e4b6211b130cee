//! Configuration loading and constants.
//!
//! Loads application configuration from TOML files and defines constants for
//! HTTP headers, database probe timeouts, credential chain defaults, logging
//! format, and default paths. `AppConfig` is the root configuration struct.

use const_format::formatcp;
use serde::Deserialize;
use std::path::Path;

// =============================================================================
// HTTP Response Headers
// =============================================================================

/// Health responses must never be served from an intermediate cache
pub const CACHE_CONTROL_HEALTH: &str = "no-store";

/// HSTS max-age in seconds (1 year)
pub const HSTS_MAX_AGE: u32 = 31536000;

pub const STRICT_TRANSPORT_SECURITY: &str = formatcp!("max-age={}", HSTS_MAX_AGE);

/// Seconds to wait for in-flight requests on shutdown
pub const GRACEFUL_SHUTDOWN_SECS: u64 = 30;

// =============================================================================
// Database Probe Constants
// =============================================================================

/// Token scope for Azure SQL Database
pub const DEFAULT_SQL_TOKEN_SCOPE: &str = "https://database.windows.net/.default";

/// Table whose presence marks the database as provisioned
pub const DEFAULT_REQUIRED_TABLE: &str = "Products";

/// Environment variable that overrides `database.connection_string`
pub const DEFAULT_CONNECTION_STRING_ENV: &str = "ConnectionStrings__DefaultConnection";

/// Name used for the SQL dependency in logs
pub const SQL_DEPENDENCY_NAME: &str = "sql";

pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_QUERY_TIMEOUT_SECS: u64 = 10;

// =============================================================================
// Credential Chain Constants
// =============================================================================

/// Per-source token request timeout
pub const DEFAULT_TOKEN_ATTEMPT_TIMEOUT_SECS: u64 = 5;

/// Device code login waits for a human, so it gets a longer budget
pub const DEFAULT_INTERACTIVE_TIMEOUT_SECS: u64 = 120;

/// Cached tokens are replaced this long before they expire
pub const DEFAULT_TOKEN_EXPIRY_SKEW_SECS: u64 = 300;

/// Upper bound accepted for `credentials.expiry_skew_seconds` (one day)
pub const MAX_TOKEN_EXPIRY_SKEW_SECS: u64 = 86_400;

/// Maximum number of scopes kept in the token cache
pub const TOKEN_CACHE_CAPACITY: u64 = 64;

pub const DEFAULT_AUTHORITY_HOST: &str = "https://login.microsoftonline.com";

// =============================================================================
// Default Paths and Strings
// =============================================================================

/// Default configuration file path
pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

/// Default log filter when RUST_LOG is not set
pub const DEFAULT_LOG_FILTER: &str = "stockroom=debug,tower_http=debug";

/// Default log format (text or json)
pub const DEFAULT_LOG_FORMAT: &str = "text";

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// HTTP server configuration
    pub http: HttpServerConfig,
    /// SQL dependency settings
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Credential chain settings
    #[serde(default)]
    pub credentials: CredentialsConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct HttpServerConfig {
    pub host: String,
    pub port: u16,
    /// Directory served under /static (disabled when unset)
    pub static_dir: Option<String>,
    #[serde(default)]
    pub tls: TlsConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TlsMode {
    /// Plain HTTP (development or behind a TLS-terminating proxy)
    #[default]
    None,
    /// User-provided certificate and key files
    Manual,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TlsConfig {
    #[serde(default)]
    pub mode: TlsMode,
    pub cert_path: Option<String>,
    pub key_path: Option<String>,
    /// Run a plain HTTP listener that redirects to HTTPS
    #[serde(default)]
    pub redirect_http: bool,
    #[serde(default = "TlsConfig::default_redirect_port")]
    pub redirect_port: u16,
    /// Send Strict-Transport-Security on TLS responses
    #[serde(default = "TlsConfig::default_hsts")]
    pub hsts: bool,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            mode: TlsMode::None,
            cert_path: None,
            key_path: None,
            redirect_http: false,
            redirect_port: Self::default_redirect_port(),
            hsts: Self::default_hsts(),
        }
    }
}

impl TlsConfig {
    fn default_redirect_port() -> u16 {
        80
    }

    fn default_hsts() -> bool {
        true
    }

    pub fn is_enabled(&self) -> bool {
        self.mode != TlsMode::None
    }
}

/// SQL dependency configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// ADO.NET-style connection string (may be absent; the probe reports it)
    pub connection_string: Option<String>,
    /// Environment variable that takes precedence over `connection_string`
    #[serde(default = "DatabaseConfig::default_connection_string_env")]
    pub connection_string_env: String,
    #[serde(default = "DatabaseConfig::default_token_scope")]
    pub token_scope: String,
    /// Table that must exist for the database to count as provisioned.
    /// An empty string disables the check.
    #[serde(default = "DatabaseConfig::default_required_table")]
    pub required_table: String,
    #[serde(default = "DatabaseConfig::default_connect_timeout")]
    pub connect_timeout_seconds: u64,
    #[serde(default = "DatabaseConfig::default_query_timeout")]
    pub query_timeout_seconds: u64,
    /// Run one probe at startup and log the outcome
    #[serde(default = "DatabaseConfig::default_startup_probe")]
    pub startup_probe: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            connection_string: None,
            connection_string_env: Self::default_connection_string_env(),
            token_scope: Self::default_token_scope(),
            required_table: Self::default_required_table(),
            connect_timeout_seconds: Self::default_connect_timeout(),
            query_timeout_seconds: Self::default_query_timeout(),
            startup_probe: Self::default_startup_probe(),
        }
    }
}

impl DatabaseConfig {
    fn default_connection_string_env() -> String {
        DEFAULT_CONNECTION_STRING_ENV.to_string()
    }

    fn default_token_scope() -> String {
        DEFAULT_SQL_TOKEN_SCOPE.to_string()
    }

    fn default_required_table() -> String {
        DEFAULT_REQUIRED_TABLE.to_string()
    }

    fn default_connect_timeout() -> u64 {
        DEFAULT_CONNECT_TIMEOUT_SECS
    }

    fn default_query_timeout() -> u64 {
        DEFAULT_QUERY_TIMEOUT_SECS
    }

    fn default_startup_probe() -> bool {
        true
    }

    /// Resolve the connection string: environment first, then the config file.
    /// Returns an empty string when neither is set.
    pub fn resolve_connection_string(&self) -> String {
        self.resolve_connection_string_with(|name| std::env::var(name).ok())
    }

    fn resolve_connection_string_with<F>(&self, lookup: F) -> String
    where
        F: Fn(&str) -> Option<String>,
    {
        lookup(&self.connection_string_env)
            .filter(|value| !value.trim().is_empty())
            .or_else(|| self.connection_string.clone())
            .unwrap_or_default()
    }

    /// Required table, or None when the check is disabled
    pub fn required_table(&self) -> Option<&str> {
        let table = self.required_table.trim();
        (!table.is_empty()).then_some(table)
    }
}

/// Credential chain configuration. Sources are always tried in the order
/// environment, managed identity, developer CLI, interactive.
#[derive(Debug, Clone, Deserialize)]
pub struct CredentialsConfig {
    #[serde(default)]
    pub exclude_environment: bool,
    #[serde(default)]
    pub exclude_managed_identity: bool,
    #[serde(default)]
    pub exclude_developer_cli: bool,
    #[serde(default = "CredentialsConfig::default_exclude_interactive")]
    pub exclude_interactive: bool,
    #[serde(default = "CredentialsConfig::default_attempt_timeout")]
    pub attempt_timeout_seconds: u64,
    #[serde(default = "CredentialsConfig::default_interactive_timeout")]
    pub interactive_timeout_seconds: u64,
    #[serde(default = "CredentialsConfig::default_expiry_skew")]
    pub expiry_skew_seconds: u64,
    #[serde(default = "CredentialsConfig::default_authority_host")]
    pub authority_host: String,
    /// Tenant for the interactive login (defaults to "organizations")
    pub tenant_id: Option<String>,
    /// Client ID of a user-assigned managed identity
    pub managed_identity_client_id: Option<String>,
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            exclude_environment: false,
            exclude_managed_identity: false,
            exclude_developer_cli: false,
            exclude_interactive: Self::default_exclude_interactive(),
            attempt_timeout_seconds: Self::default_attempt_timeout(),
            interactive_timeout_seconds: Self::default_interactive_timeout(),
            expiry_skew_seconds: Self::default_expiry_skew(),
            authority_host: Self::default_authority_host(),
            tenant_id: None,
            managed_identity_client_id: None,
        }
    }
}

impl CredentialsConfig {
    fn default_exclude_interactive() -> bool {
        true
    }

    fn default_attempt_timeout() -> u64 {
        DEFAULT_TOKEN_ATTEMPT_TIMEOUT_SECS
    }

    fn default_interactive_timeout() -> u64 {
        DEFAULT_INTERACTIVE_TIMEOUT_SECS
    }

    fn default_expiry_skew() -> u64 {
        DEFAULT_TOKEN_EXPIRY_SKEW_SECS
    }

    fn default_authority_host() -> String {
        DEFAULT_AUTHORITY_HOST.to_string()
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log format: "text" (human-readable, default) or "json" (structured)
    #[serde(default = "LoggingConfig::default_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: DEFAULT_LOG_FORMAT.to_string(),
        }
    }
}

impl LoggingConfig {
    fn default_format() -> String {
        DEFAULT_LOG_FORMAT.to_string()
    }

    pub fn is_json(&self) -> bool {
        self.format == "json"
    }
}

impl AppConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let tls = &self.http.tls;
        if tls.mode == TlsMode::Manual && (tls.cert_path.is_none() || tls.key_path.is_none()) {
            return Err(ConfigError::Validation(
                "http.tls.mode = \"manual\" requires cert_path and key_path".to_string(),
            ));
        }

        if !matches!(self.logging.format.as_str(), "text" | "json") {
            return Err(ConfigError::Validation(format!(
                "Unknown logging.format '{}' (expected \"text\" or \"json\")",
                self.logging.format
            )));
        }

        let timeouts = [
            ("database.connect_timeout_seconds", self.database.connect_timeout_seconds),
            ("database.query_timeout_seconds", self.database.query_timeout_seconds),
            ("credentials.attempt_timeout_seconds", self.credentials.attempt_timeout_seconds),
            ("credentials.interactive_timeout_seconds", self.credentials.interactive_timeout_seconds),
        ];
        if let Some((name, _)) = timeouts.iter().find(|(_, secs)| *secs == 0) {
            return Err(ConfigError::Validation(format!("{} must be greater than 0", name)));
        }

        if self.credentials.expiry_skew_seconds > MAX_TOKEN_EXPIRY_SKEW_SECS {
            return Err(ConfigError::Validation(format!(
                "credentials.expiry_skew_seconds must be at most {}",
                MAX_TOKEN_EXPIRY_SKEW_SECS
            )));
        }

        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Configuration error: {0}")]
    Validation(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [http]
        host = "127.0.0.1"
        port = 8080
    "#;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = AppConfig::from_toml(MINIMAL).unwrap();
        assert_eq!(config.http.port, 8080);
        assert_eq!(config.http.tls.mode, TlsMode::None);
        assert!(config.database.connection_string.is_none());
        assert_eq!(config.database.token_scope, DEFAULT_SQL_TOKEN_SCOPE);
        assert_eq!(config.database.required_table(), Some("Products"));
        assert_eq!(config.database.connect_timeout_seconds, 10);
        assert_eq!(config.credentials.attempt_timeout_seconds, 5);
        assert!(config.credentials.exclude_interactive);
        assert!(!config.credentials.exclude_managed_identity);
        assert_eq!(config.logging.format, "text");
    }

    #[test]
    fn test_empty_required_table_disables_check() {
        let toml = format!("{}\n[database]\nrequired_table = \"  \"\n", MINIMAL);
        let config = AppConfig::from_toml(&toml).unwrap();
        assert_eq!(config.database.required_table(), None);
    }

    #[test]
    fn test_env_overrides_file_connection_string() {
        let db = DatabaseConfig {
            connection_string: Some("Server=file".to_string()),
            ..DatabaseConfig::default()
        };
        let resolved = db.resolve_connection_string_with(|name| {
            assert_eq!(name, DEFAULT_CONNECTION_STRING_ENV);
            Some("Server=env".to_string())
        });
        assert_eq!(resolved, "Server=env");
    }

    #[test]
    fn test_blank_env_falls_back_to_file() {
        let db = DatabaseConfig {
            connection_string: Some("Server=file".to_string()),
            ..DatabaseConfig::default()
        };
        assert_eq!(db.resolve_connection_string_with(|_| Some(" ".into())), "Server=file");
    }

    #[test]
    fn test_missing_connection_string_resolves_empty() {
        let db = DatabaseConfig::default();
        assert_eq!(db.resolve_connection_string_with(|_| None), "");
    }

    #[test]
    fn test_manual_tls_requires_cert_and_key() {
        let toml = format!("{}\n[http.tls]\nmode = \"manual\"\n", MINIMAL.trim_end());
        let err = AppConfig::from_toml(&toml).unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn test_unknown_log_format_rejected() {
        let toml = format!("{}\n[logging]\nformat = \"xml\"\n", MINIMAL);
        assert!(matches!(
            AppConfig::from_toml(&toml),
            Err(ConfigError::Validation(_))
        ));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let toml = format!("{}\n[database]\nconnect_timeout_seconds = 0\n", MINIMAL);
        let err = AppConfig::from_toml(&toml).unwrap_err();
        assert!(err.to_string().contains("connect_timeout_seconds"));
    }

    #[test]
    fn test_huge_expiry_skew_rejected() {
        let toml = format!("{}\n[credentials]\nexpiry_skew_seconds = 9223372036854775807\n", MINIMAL);
        let err = AppConfig::from_toml(&toml).unwrap_err();
        assert!(err.to_string().contains("expiry_skew_seconds"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stockroom.toml");
        std::fs::write(&path, MINIMAL).unwrap();
        let config = AppConfig::load(&path).unwrap();
        assert_eq!(config.http.host, "127.0.0.1");
    }

    #[test]
    fn test_load_missing_file_is_io_error() {
        let err = AppConfig::load("/nonexistent/stockroom.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
