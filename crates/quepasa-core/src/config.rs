//! Environment configuration, read once at startup.
//!
//! Malformed values fail startup with [`QpError::Config`]; absent values
//! fall back to documented defaults.

use crate::error::QpError;
use crate::options::{ServiceBool, ServiceOptions};

/// Database connection settings.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub driver: String,
    pub host: String,
    pub database: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub ssl_mode: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            driver: "sqlite".to_string(),
            host: String::new(),
            database: "quepasa.db".to_string(),
            port: 0,
            user: String::new(),
            password: String::new(),
            ssl_mode: String::new(),
        }
    }
}

impl DatabaseConfig {
    /// Connection URL for sqlx. Only the sqlite driver is wired in this
    /// build; other drivers fail startup with a config error.
    pub fn url(&self) -> Result<String, QpError> {
        match self.driver.as_str() {
            "sqlite" | "sqlite3" => Ok(format!("sqlite:{}", self.database)),
            other => Err(QpError::Config(format!("unsupported DBDRIVER: {other}"))),
        }
    }
}

/// HTTP server settings.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub host: String,
    pub port: u16,
    /// Optional version prefix for every route (e.g. `/v3`).
    pub api_prefix: String,
    /// Request timeout in seconds.
    pub api_timeout: u64,
    /// Webhook delivery deadline in seconds.
    pub webhook_timeout: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 31000,
            api_prefix: String::new(),
            api_timeout: 30,
            webhook_timeout: 10,
        }
    }
}

/// Auth settings.
#[derive(Debug, Clone, Default)]
pub struct AuthConfig {
    /// Master key; empty disables master operations.
    pub master_key: String,
    /// HS256 secret for SPA session JWTs.
    pub signing_secret: String,
    /// Allow self-service account creation on the SPA surface.
    pub account_setup: bool,
    /// Enable the master-only first-available-tenant spam endpoint.
    pub spam_endpoint: bool,
}

/// Message cache bounds.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum cached messages per tenant; 0 = unbounded.
    pub length: usize,
    /// Maximum age in days; 0 = unbounded.
    pub days: u32,
    /// Text truncation for list views and log lines.
    pub synopsis_length: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            length: 1000,
            days: 7,
            synopsis_length: 50,
        }
    }
}

/// Service-default WhatsApp behavior.
#[derive(Debug, Clone, Default)]
pub struct WhatsappDefaults {
    pub options: ServiceOptions,
    /// History sync filter: None = disabled, Some(0) = all, Some(n) =
    /// messages newer than now − n days.
    pub history_sync_days: Option<u32>,
    /// Daily presence toggle hour in [0,23]; None disables the scheduler.
    pub wakeup_hour: Option<u8>,
    /// Seconds to stay `available` after a wake-up.
    pub wakeup_duration: u64,
}

/// Top-level service configuration.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub http: HttpConfig,
    pub auth: AuthConfig,
    pub cache: CacheConfig,
    pub whatsapp: WhatsappDefaults,
    /// Log level feeding the tracing env filter.
    pub log_level: String,
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Result<Option<T>, QpError>
where
    T::Err: std::fmt::Display,
{
    match env_var(name) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| QpError::Config(format!("invalid {name}: {e}"))),
    }
}

fn env_bool(name: &str) -> Result<bool, QpError> {
    match env_var(name) {
        None => Ok(false),
        Some(raw) => crate::options::TriState::parse(&raw)
            .map(|t| t.to_bool(false))
            .map_err(|e| QpError::Config(format!("invalid {name}: {e}"))),
    }
}

fn env_service_bool(name: &str) -> Result<ServiceBool, QpError> {
    match env_var(name) {
        None => Ok(ServiceBool::UnSet),
        Some(raw) => {
            ServiceBool::parse(&raw).map_err(|e| QpError::Config(format!("invalid {name}: {e}")))
        }
    }
}

impl Config {
    /// Load the whole configuration from the process environment.
    pub fn from_env() -> Result<Self, QpError> {
        let mut cfg = Config {
            log_level: env_var("LOGLEVEL").unwrap_or_else(|| "info".to_string()),
            ..Default::default()
        };

        if let Some(v) = env_var("DBDRIVER") {
            cfg.database.driver = v;
        }
        if let Some(v) = env_var("DBHOST") {
            cfg.database.host = v;
        }
        if let Some(v) = env_var("DBDATABASE") {
            cfg.database.database = v;
        }
        if let Some(v) = env_parse::<u16>("DBPORT")? {
            cfg.database.port = v;
        }
        if let Some(v) = env_var("DBUSER") {
            cfg.database.user = v;
        }
        if let Some(v) = env_var("DBPASSWORD") {
            cfg.database.password = v;
        }
        if let Some(v) = env_var("DBSSLMODE") {
            cfg.database.ssl_mode = v;
        }

        if let Some(v) = env_var("WEBSERVER_HOST") {
            cfg.http.host = v;
        }
        if let Some(v) = env_parse::<u16>("WEBSERVER_PORT")? {
            cfg.http.port = v;
        }
        if let Some(v) = env_var("API_PREFIX") {
            cfg.http.api_prefix = normalize_prefix(&v);
        }
        if let Some(v) = env_parse::<u64>("API_TIMEOUT")? {
            cfg.http.api_timeout = v;
        }
        if let Some(v) = env_parse::<u64>("WEBHOOK_TIMEOUT")? {
            cfg.http.webhook_timeout = v;
        }

        if let Some(v) = env_var("MASTERKEY") {
            cfg.auth.master_key = v;
        }
        if let Some(v) = env_var("SIGNING_SECRET") {
            cfg.auth.signing_secret = v;
        }
        cfg.auth.account_setup = env_bool("ACCOUNTSETUP")?;
        cfg.auth.spam_endpoint = env_bool("SPAM_ENDPOINT")?;

        if let Some(v) = env_parse::<usize>("CACHELENGTH")? {
            cfg.cache.length = v;
        }
        if let Some(v) = env_parse::<u32>("CACHEDAYS")? {
            cfg.cache.days = v;
        }
        if let Some(v) = env_parse::<usize>("SYNOPSISLENGTH")? {
            cfg.cache.synopsis_length = v;
        }

        cfg.whatsapp.options = ServiceOptions {
            groups: env_service_bool("GROUPS")?,
            direct: env_service_bool("DIRECT")?,
            broadcasts: env_service_bool("BROADCASTS")?,
            read_receipts: env_service_bool("READRECEIPTS")?,
            calls: env_service_bool("CALLS")?,
            read_update: env_service_bool("READUPDATE")?,
        };
        cfg.whatsapp.history_sync_days = env_parse::<u32>("HISTORYSYNCDAYS")?;
        if let Some(hour) = env_parse::<u8>("WAKEUP_HOUR")? {
            if hour > 23 {
                return Err(QpError::Config(format!(
                    "WAKEUP_HOUR must be in [0,23], got {hour}"
                )));
            }
            cfg.whatsapp.wakeup_hour = Some(hour);
        }
        if let Some(v) = env_parse::<u64>("WAKEUP_DURATION")? {
            cfg.whatsapp.wakeup_duration = v;
        } else {
            cfg.whatsapp.wakeup_duration = 60;
        }

        Ok(cfg)
    }
}

/// Ensure an API prefix has exactly one leading slash and no trailing one.
fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim().trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("/{trimmed}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_normalization() {
        assert_eq!(normalize_prefix("v3"), "/v3");
        assert_eq!(normalize_prefix("/v3/"), "/v3");
        assert_eq!(normalize_prefix(""), "");
        assert_eq!(normalize_prefix("  /  "), "");
    }

    #[test]
    fn sqlite_url() {
        let db = DatabaseConfig::default();
        assert_eq!(db.url().unwrap(), "sqlite:quepasa.db");

        let bad = DatabaseConfig {
            driver: "oracle".into(),
            ..Default::default()
        };
        assert!(bad.url().is_err());
    }
}
