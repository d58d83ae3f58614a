use secrecy::SecretString;
use std::net::SocketAddr;

/// Main configuration for the PassClass API.
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub cors: CorsConfig,
    pub auth: AuthConfig,
    pub stripe: StripeConfig,
    #[cfg(feature = "database")]
    pub database: DatabaseConfig,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Maximum request body size in bytes (default: 1MB).
    pub max_body_size: usize,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

/// Allowed browser origins for cross-origin requests.
#[derive(Debug, Clone)]
pub struct CorsConfig {
    pub allowed_origins: Vec<String>,
}

/// Verification settings for user bearer tokens.
///
/// The secret is the shared HS256 signing key of the identity provider that
/// issues the frontend's session tokens.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub jwt_secret: SecretString,
}

/// Stripe credentials and product settings.
///
/// Secrets are held as [`SecretString`] so they never appear in debug output
/// or logs.
#[derive(Debug, Clone)]
pub struct StripeConfig {
    pub secret_key: SecretString,
    pub webhook_secret: SecretString,
    /// Price the checkout flow subscribes new customers to.
    pub price_id: String,
    /// Public base URL the checkout/portal flows redirect back to.
    pub app_url: String,
}

#[cfg(feature = "database")]
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_body_size: default_max_body_size(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: vec!["http://localhost:3000".to_string()],
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_max_body_size() -> usize {
    1024 * 1024
}

impl ServerConfig {
    pub fn addr(&self) -> std::result::Result<SocketAddr, std::net::AddrParseError> {
        format!("{}:{}", self.host, self.port).parse()
    }
}

/// Error returned when configuration is incomplete.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required configuration: {0}")]
    Missing(&'static str),
}

/// Builder for [`Config`] with environment variable support.
#[must_use = "builder does nothing until you call build()"]
pub struct ConfigBuilder {
    server: ServerConfig,
    logging: LoggingConfig,
    cors: CorsConfig,
    jwt_secret: Option<SecretString>,
    stripe_secret_key: Option<SecretString>,
    stripe_webhook_secret: Option<SecretString>,
    stripe_price_id: Option<String>,
    app_url: Option<String>,
    #[cfg(feature = "database")]
    database_url: Option<String>,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            server: ServerConfig::default(),
            logging: LoggingConfig::default(),
            cors: CorsConfig::default(),
            jwt_secret: None,
            stripe_secret_key: None,
            stripe_webhook_secret: None,
            stripe_price_id: None,
            app_url: None,
            #[cfg(feature = "database")]
            database_url: None,
        }
    }

    /// Populate the builder from process environment variables.
    ///
    /// Recognized variables: `HOST`, `PORT`, `LOG_LEVEL`, `PASSCLASS_LOG_JSON`,
    /// `CORS_ORIGINS` (comma separated), `SUPABASE_JWT_SECRET`,
    /// `STRIPE_SECRET_KEY`, `STRIPE_WEBHOOK_KEY`, `STRIPE_PRICE_ID`,
    /// `APP_URL`, and (with the `database` feature) `DATABASE_URL`.
    pub fn from_env() -> Self {
        let mut builder = Self::new();

        if let Ok(host) = std::env::var("HOST") {
            builder.server.host = host;
        }
        if let Some(port) = std::env::var("PORT").ok().and_then(|p| p.parse().ok()) {
            builder.server.port = port;
        }
        if let Ok(level) = std::env::var("LOG_LEVEL") {
            builder.logging.level = level;
        }
        if let Ok(json) = std::env::var("PASSCLASS_LOG_JSON") {
            builder.logging.json = json.parse().unwrap_or(false);
        }
        if let Ok(origins) = std::env::var("CORS_ORIGINS") {
            builder.cors.allowed_origins = origins
                .split(',')
                .map(|o| o.trim().to_string())
                .filter(|o| !o.is_empty())
                .collect();
        }
        if let Ok(secret) = std::env::var("SUPABASE_JWT_SECRET") {
            builder.jwt_secret = Some(secret.into());
        }
        if let Ok(key) = std::env::var("STRIPE_SECRET_KEY") {
            builder.stripe_secret_key = Some(key.into());
        }
        if let Ok(secret) = std::env::var("STRIPE_WEBHOOK_KEY") {
            builder.stripe_webhook_secret = Some(secret.into());
        }
        if let Ok(price) = std::env::var("STRIPE_PRICE_ID") {
            builder.stripe_price_id = Some(price);
        }
        if let Ok(url) = std::env::var("APP_URL") {
            builder.app_url = Some(url);
        }
        #[cfg(feature = "database")]
        if let Ok(url) = std::env::var("DATABASE_URL") {
            builder.database_url = Some(url);
        }

        builder
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.server.host = host.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.server.port = port;
        self
    }

    pub fn with_max_body_size(mut self, max_body_size: usize) -> Self {
        self.server.max_body_size = max_body_size;
        self
    }

    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.logging.level = level.into();
        self
    }

    pub fn with_json_logging(mut self, enabled: bool) -> Self {
        self.logging.json = enabled;
        self
    }

    pub fn with_allowed_origins<I, S>(mut self, origins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.cors.allowed_origins = origins.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_jwt_secret(mut self, secret: impl Into<SecretString>) -> Self {
        self.jwt_secret = Some(secret.into());
        self
    }

    pub fn with_stripe_secret_key(mut self, key: impl Into<SecretString>) -> Self {
        self.stripe_secret_key = Some(key.into());
        self
    }

    pub fn with_stripe_webhook_secret(mut self, secret: impl Into<SecretString>) -> Self {
        self.stripe_webhook_secret = Some(secret.into());
        self
    }

    pub fn with_stripe_price_id(mut self, price_id: impl Into<String>) -> Self {
        self.stripe_price_id = Some(price_id.into());
        self
    }

    pub fn with_app_url(mut self, url: impl Into<String>) -> Self {
        self.app_url = Some(url.into());
        self
    }

    #[cfg(feature = "database")]
    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = Some(url.into());
        self
    }

    /// Build the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Missing`] when a required secret or Stripe
    /// setting was neither set explicitly nor present in the environment.
    pub fn build(self) -> std::result::Result<Config, ConfigError> {
        Ok(Config {
            server: self.server,
            logging: self.logging,
            cors: self.cors,
            auth: AuthConfig {
                jwt_secret: self
                    .jwt_secret
                    .ok_or(ConfigError::Missing("SUPABASE_JWT_SECRET"))?,
            },
            stripe: StripeConfig {
                secret_key: self
                    .stripe_secret_key
                    .ok_or(ConfigError::Missing("STRIPE_SECRET_KEY"))?,
                webhook_secret: self
                    .stripe_webhook_secret
                    .ok_or(ConfigError::Missing("STRIPE_WEBHOOK_KEY"))?,
                price_id: self
                    .stripe_price_id
                    .ok_or(ConfigError::Missing("STRIPE_PRICE_ID"))?,
                app_url: self.app_url.ok_or(ConfigError::Missing("APP_URL"))?,
            },
            #[cfg(feature = "database")]
            database: DatabaseConfig {
                url: self.database_url.ok_or(ConfigError::Missing("DATABASE_URL"))?,
            },
        })
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
