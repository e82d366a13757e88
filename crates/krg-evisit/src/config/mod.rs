use std::env;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

const DEVELOPMENT_PERMIT_SECRET: &str = "krg-evisit-development-only-permit-secret";
const MIN_SECRET_BYTES: usize = 32;

/// Distinguishes runtime behavior for different stages of the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppEnvironment {
    Development,
    Test,
    Production,
}

impl AppEnvironment {
    fn from_str(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "prod" | "production" => Self::Production,
            "test" | "ci" => Self::Test,
            _ => Self::Development,
        }
    }
}

/// Top-level configuration for the application.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub environment: AppEnvironment,
    pub server: ServerConfig,
    pub telemetry: TelemetryConfig,
    pub security: SecurityConfig,
    pub sweep: SweepConfig,
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let environment = AppEnvironment::from_str(
            &env::var("APP_ENV").unwrap_or_else(|_| "development".to_string()),
        );

        let host = env::var("APP_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port = env::var("APP_PORT")
            .unwrap_or_else(|_| "3001".to_string())
            .parse::<u16>()
            .map_err(|_| ConfigError::InvalidPort)?;

        let log_level = env::var("APP_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
        let log_format = LogFormat::from_str(
            &env::var("APP_LOG_FORMAT").unwrap_or_else(|_| "compact".to_string()),
        );

        let security = SecurityConfig::from_secret(environment, env::var("PERMIT_HMAC_SECRET").ok())?;

        let interval_secs = env::var("OVERSTAY_SWEEP_INTERVAL_SECS")
            .unwrap_or_else(|_| "3600".to_string())
            .parse::<u64>()
            .map_err(|_| ConfigError::InvalidInterval)?;

        Ok(Self {
            environment,
            server: ServerConfig { host, port },
            telemetry: TelemetryConfig {
                log_level,
                log_format,
            },
            security,
            sweep: SweepConfig {
                interval: (interval_secs > 0).then(|| Duration::from_secs(interval_secs)),
            },
        })
    }
}

/// Settings controlling the HTTP server binding.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        if self.host.eq_ignore_ascii_case("localhost") {
            return Ok(SocketAddr::new(IpAddr::from([127, 0, 0, 1]), self.port));
        }

        let ip: IpAddr = self
            .host
            .parse()
            .map_err(|source| ConfigError::InvalidHost { source })?;

        Ok(SocketAddr::new(ip, self.port))
    }
}

/// Tracing and metrics controls.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub log_level: String,
    pub log_format: LogFormat,
}

/// Output shape of log lines; JSON is meant for log shippers in production.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Compact,
    Json,
}

impl LogFormat {
    fn from_str(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "json" => Self::Json,
            _ => Self::Compact,
        }
    }
}

/// Process-wide permit signing key.
#[derive(Clone)]
pub struct SecurityConfig {
    permit_secret: String,
}

impl SecurityConfig {
    /// Production refuses to start without a strong secret; other stages fall back to a
    /// fixed development key.
    pub fn from_secret(
        environment: AppEnvironment,
        secret: Option<String>,
    ) -> Result<Self, ConfigError> {
        let secret = secret.filter(|value| !value.trim().is_empty());
        match (environment, secret) {
            (_, Some(secret)) if secret.len() < MIN_SECRET_BYTES => Err(ConfigError::WeakSecret {
                min_bytes: MIN_SECRET_BYTES,
            }),
            (_, Some(secret)) => Ok(Self {
                permit_secret: secret,
            }),
            (AppEnvironment::Production, None) => Err(ConfigError::MissingSecret),
            (_, None) => Ok(Self {
                permit_secret: DEVELOPMENT_PERMIT_SECRET.to_string(),
            }),
        }
    }

    pub fn permit_secret(&self) -> &[u8] {
        self.permit_secret.as_bytes()
    }
}

impl fmt::Debug for SecurityConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecurityConfig")
            .field("permit_secret", &"<redacted>")
            .finish()
    }
}

/// Scheduling for the background overstay sweep. `None` disables it.
#[derive(Debug, Clone)]
pub struct SweepConfig {
    pub interval: Option<Duration>,
}

#[derive(Debug)]
pub enum ConfigError {
    InvalidPort,
    InvalidHost { source: std::net::AddrParseError },
    MissingSecret,
    WeakSecret { min_bytes: usize },
    InvalidInterval,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidPort => write!(f, "APP_PORT must be a valid u16"),
            ConfigError::InvalidHost { .. } => {
                write!(f, "APP_HOST must parse to an IPv4 or IPv6 address")
            }
            ConfigError::MissingSecret => {
                write!(f, "PERMIT_HMAC_SECRET must be set in production")
            }
            ConfigError::WeakSecret { min_bytes } => {
                write!(f, "PERMIT_HMAC_SECRET must be at least {min_bytes} bytes")
            }
            ConfigError::InvalidInterval => {
                write!(f, "OVERSTAY_SWEEP_INTERVAL_SECS must be a whole number of seconds")
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::InvalidHost { source } => Some(source),
            ConfigError::InvalidPort
            | ConfigError::MissingSecret
            | ConfigError::WeakSecret { .. }
            | ConfigError::InvalidInterval => None,
        }
    }
}
