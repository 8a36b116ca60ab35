//! Application configuration module
//! Handles environment variable loading, configuration validation, and application settings

use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Upper bound for any single gateway call.
pub const MAX_GATEWAY_TIMEOUT_SECS: u64 = 60;

/// Main application configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub runtime: RuntimeConfig,
    pub server: ServerConfig,
    /// Absent when running with in-memory stores
    pub database: Option<DatabaseConfig>,
    pub logging: LoggingConfig,
    pub gateway: GatewayConfig,
    pub settlement: SettlementConfig,
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Staging,
    Production,
}

impl FromStr for Environment {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "development" | "dev" | "local" => Ok(Environment::Development),
            "staging" => Ok(Environment::Staging),
            "production" | "prod" => Ok(Environment::Production),
            _ => Err(ConfigError::InvalidValue("ENVIRONMENT".to_string())),
        }
    }
}

/// Process-level switches
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub environment: Environment,
    /// Run against in-memory stores and the in-memory gateway
    pub skip_externals: bool,
}

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Database configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connection_timeout: u64,   // seconds
    pub idle_timeout: Option<u64>, // seconds
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

/// Log format options
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Plain,
}

/// Payment gateway configuration
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub base_url: String,
    pub secret_key: String,
    pub webhook_secret: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub webhook_tolerance_secs: u64,
}

/// Settlement behaviour
#[derive(Debug, Clone)]
pub struct SettlementConfig {
    /// Wrap completion in one database transaction
    pub use_transactions: bool,
    pub default_currency: String,
}

/// Reconciliation job schedule and thresholds
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub stuck_after_hours: i64,
    pub sweep_interval_secs: u64,
    pub balance_retry_interval_secs: u64,
    pub report_interval_secs: u64,
    pub sweep_batch_size: i64,
    pub balance_retry_batch_size: i64,
    pub balance_retry_max_attempts: i32,
    pub stuck_alert_threshold: i64,
    pub failed_updates_alert_threshold: i64,
    pub sweep_concurrency: usize,
}

fn env_or<T: FromStr>(key: &str, default: &str) -> Result<T, ConfigError> {
    env::var(key)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .map_err(|_| ConfigError::InvalidValue(key.to_string()))
}

fn required(key: &str) -> Result<String, ConfigError> {
    env::var(key).map_err(|_| ConfigError::MissingVariable(key.to_string()))
}

impl AppConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if it exists
        let _ = dotenv::dotenv().ok();

        let runtime = RuntimeConfig::from_env()?;
        let database = if runtime.skip_externals {
            None
        } else {
            Some(DatabaseConfig::from_env()?)
        };

        Ok(AppConfig {
            gateway: GatewayConfig::from_env(runtime.skip_externals)?,
            runtime,
            server: ServerConfig::from_env()?,
            database,
            logging: LoggingConfig::from_env()?,
            settlement: SettlementConfig::from_env()?,
            scheduler: SchedulerConfig::from_env()?,
        })
    }

    /// Validate the entire configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server.validate()?;
        if let Some(database) = &self.database {
            database.validate()?;
        }
        self.logging.validate()?;
        self.gateway.validate(self.runtime.skip_externals)?;
        self.settlement.validate()?;
        self.scheduler.validate()?;

        if self.runtime.skip_externals && self.runtime.environment == Environment::Production {
            return Err(ConfigError::ValidationFailed(
                "SKIP_EXTERNALS cannot be used in production".to_string(),
            ));
        }

        Ok(())
    }
}

impl RuntimeConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(RuntimeConfig {
            environment: env_or("ENVIRONMENT", "development")?,
            skip_externals: env_or("SKIP_EXTERNALS", "false")?,
        })
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(ServerConfig {
            host: env::var("SERVER_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            port: env_or("SERVER_PORT", "8000")?,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::InvalidValue(
                "SERVER_PORT cannot be 0".to_string(),
            ));
        }

        if self.host.is_empty() {
            return Err(ConfigError::InvalidValue(
                "SERVER_HOST cannot be empty".to_string(),
            ));
        }

        Ok(())
    }
}

impl DatabaseConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(DatabaseConfig {
            url: required("DATABASE_URL")?,
            max_connections: env_or("DB_MAX_CONNECTIONS", "20")?,
            min_connections: env_or("DB_MIN_CONNECTIONS", "5")?,
            connection_timeout: env_or("DB_CONNECTION_TIMEOUT", "30")?,
            idle_timeout: env::var("DB_IDLE_TIMEOUT")
                .ok()
                .and_then(|val| val.parse().ok()),
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.url.is_empty() {
            return Err(ConfigError::InvalidValue("DATABASE_URL".to_string()));
        }

        if self.max_connections == 0 {
            return Err(ConfigError::InvalidValue("DB_MAX_CONNECTIONS".to_string()));
        }

        if self.min_connections > self.max_connections {
            return Err(ConfigError::InvalidValue(
                "DB_MIN_CONNECTIONS must be <= DB_MAX_CONNECTIONS".to_string(),
            ));
        }

        Ok(())
    }
}

impl LoggingConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(LoggingConfig {
            level: env::var("LOG_LEVEL").unwrap_or_else(|_| "INFO".to_string()),
            format: match env::var("LOG_FORMAT")
                .unwrap_or_else(|_| "plain".to_string())
                .as_str()
            {
                "json" => LogFormat::Json,
                _ => LogFormat::Plain,
            },
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["TRACE", "DEBUG", "INFO", "WARN", "ERROR"];
        if !valid_levels.contains(&self.level.to_uppercase().as_str()) {
            return Err(ConfigError::InvalidValue("LOG_LEVEL".to_string()));
        }

        Ok(())
    }
}

impl GatewayConfig {
    pub fn from_env(skip_externals: bool) -> Result<Self, ConfigError> {
        let secret_key = if skip_externals {
            env::var("GATEWAY_SECRET_KEY").unwrap_or_default()
        } else {
            required("GATEWAY_SECRET_KEY")?
        };

        Ok(GatewayConfig {
            base_url: env::var("GATEWAY_BASE_URL")
                .unwrap_or_else(|_| "https://api.stripe.com".to_string()),
            secret_key,
            webhook_secret: required("GATEWAY_WEBHOOK_SECRET")?,
            timeout_secs: env_or("GATEWAY_TIMEOUT_SECS", "15")?,
            max_retries: env_or("GATEWAY_MAX_RETRIES", "2")?,
            webhook_tolerance_secs: env_or("WEBHOOK_TOLERANCE_SECS", "300")?,
        })
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn webhook_tolerance(&self) -> Duration {
        Duration::from_secs(self.webhook_tolerance_secs)
    }

    pub fn validate(&self, skip_externals: bool) -> Result<(), ConfigError> {
        if self.webhook_secret.trim().is_empty() {
            return Err(ConfigError::InvalidValue(
                "GATEWAY_WEBHOOK_SECRET".to_string(),
            ));
        }

        if !skip_externals {
            if self.secret_key.trim().is_empty() {
                return Err(ConfigError::InvalidValue("GATEWAY_SECRET_KEY".to_string()));
            }
            if !self.base_url.starts_with("http://") && !self.base_url.starts_with("https://") {
                return Err(ConfigError::InvalidValue(
                    "GATEWAY_BASE_URL must be a valid URL".to_string(),
                ));
            }
        }

        if self.timeout_secs == 0 || self.timeout_secs > MAX_GATEWAY_TIMEOUT_SECS {
            return Err(ConfigError::InvalidValue(format!(
                "GATEWAY_TIMEOUT_SECS must be between 1 and {}",
                MAX_GATEWAY_TIMEOUT_SECS
            )));
        }

        if self.webhook_tolerance_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "WEBHOOK_TOLERANCE_SECS".to_string(),
            ));
        }

        Ok(())
    }
}

impl SettlementConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(SettlementConfig {
            use_transactions: env_or("SETTLEMENT_USE_TRANSACTIONS", "true")?,
            default_currency: env::var("DEFAULT_CURRENCY")
                .unwrap_or_else(|_| "USD".to_string())
                .to_uppercase(),
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_currency.len() != 3
            || !self.default_currency.chars().all(|c| c.is_ascii_alphabetic())
        {
            return Err(ConfigError::InvalidValue("DEFAULT_CURRENCY".to_string()));
        }
        Ok(())
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            stuck_after_hours: 24,
            sweep_interval_secs: 86_400,
            balance_retry_interval_secs: 21_600,
            report_interval_secs: 604_800,
            sweep_batch_size: 100,
            balance_retry_batch_size: 50,
            balance_retry_max_attempts: 5,
            stuck_alert_threshold: 10,
            failed_updates_alert_threshold: 5,
            sweep_concurrency: 4,
        }
    }
}

impl SchedulerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(SchedulerConfig {
            stuck_after_hours: env_or("RECONCILE_STUCK_AFTER_HOURS", "24")?,
            sweep_interval_secs: env_or("RECONCILE_SWEEP_INTERVAL_SECS", "86400")?,
            balance_retry_interval_secs: env_or("BALANCE_RETRY_INTERVAL_SECS", "21600")?,
            report_interval_secs: env_or("REPORT_INTERVAL_SECS", "604800")?,
            sweep_batch_size: env_or("RECONCILE_BATCH_SIZE", "100")?,
            balance_retry_batch_size: env_or("BALANCE_RETRY_BATCH_SIZE", "50")?,
            balance_retry_max_attempts: env_or("BALANCE_RETRY_MAX_ATTEMPTS", "5")?,
            stuck_alert_threshold: env_or("ALERT_STUCK_THRESHOLD", "10")?,
            failed_updates_alert_threshold: env_or("ALERT_FAILED_UPDATES_THRESHOLD", "5")?,
            sweep_concurrency: env_or("RECONCILE_CONCURRENCY", "4")?,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stuck_after_hours <= 0 {
            return Err(ConfigError::InvalidValue(
                "RECONCILE_STUCK_AFTER_HOURS".to_string(),
            ));
        }
        if self.sweep_interval_secs == 0
            || self.balance_retry_interval_secs == 0
            || self.report_interval_secs == 0
        {
            return Err(ConfigError::ValidationFailed(
                "job intervals must be greater than zero".to_string(),
            ));
        }
        if self.sweep_batch_size <= 0 || self.balance_retry_batch_size <= 0 {
            return Err(ConfigError::ValidationFailed(
                "batch sizes must be greater than zero".to_string(),
            ));
        }
        if self.balance_retry_max_attempts <= 0 {
            return Err(ConfigError::InvalidValue(
                "BALANCE_RETRY_MAX_ATTEMPTS".to_string(),
            ));
        }
        if self.sweep_concurrency == 0 {
            return Err(ConfigError::InvalidValue("RECONCILE_CONCURRENCY".to_string()));
        }
        Ok(())
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVariable(String),

    #[error("Invalid value for configuration: {0}")]
    InvalidValue(String),

    #[error("Validation failed: {0}")]
    ValidationFailed(String),
}
