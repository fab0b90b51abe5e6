use thiserror::Error;

/// Shortest accepted HMAC secret, in bytes
pub const MIN_JWT_SECRET_LEN: usize = 32;

/// Longest accepted token lifetime (one year)
pub const MAX_TOKEN_TTL_SECONDS: u64 = 31_536_000;

/// How early clients treat an access token as expired
pub const CLIENT_EXPIRY_SKEW_SECONDS: u64 = 30;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

#[derive(Debug, Clone)]
pub struct Config {
    /// System owner created at startup when none exists yet
    pub bootstrap: Option<BootstrapOwner>,
    pub refresh: RefreshSettings,
    pub server: ServerConfig,
    /// Relaxes startup checks for local runs. Must never be true in production.
    pub test_mode: bool,
    pub tokens: TokenConfig,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_address: String,
    pub data_dir: String,
}

#[derive(Debug, Clone)]
pub struct TokenConfig {
    pub access_ttl_seconds: u64,
    pub cleanup_interval_seconds: u64,
    pub issuer: String,
    pub jwt_secret: String,
    pub refresh_ttl_seconds: u64,
}

/// Client-side rotation limits used by the refresh coordinator
#[derive(Debug, Clone)]
pub struct RefreshSettings {
    pub max_attempts: u32,
    /// Upstream timeout for one rotation attempt
    pub retry_timeout_ms: u64,
    /// How long a queued caller waits before giving up
    pub wait_timeout_ms: u64,
}

#[derive(Clone)]
pub struct BootstrapOwner {
    pub email: String,
    pub full_name: Option<String>,
    pub password: String,
}

impl std::fmt::Debug for BootstrapOwner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BootstrapOwner")
            .field("email", &self.email)
            .field("full_name", &self.full_name)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            access_ttl_seconds: 900, // 15 minutes
            cleanup_interval_seconds: 300,
            issuer: "jumla-auth".to_string(),
            jwt_secret: String::new(),
            refresh_ttl_seconds: 604_800, // 7 days
        }
    }
}

impl Default for RefreshSettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_timeout_ms: 10_000,
            wait_timeout_ms: 15_000,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let number = |key: &str, default: u64| -> Result<u64, ConfigError> {
            match lookup(key) {
                Some(raw) => raw.trim().parse().map_err(|_| {
                    ConfigError::ValidationError(format!("{key} must be a non-negative integer"))
                }),
                None => Ok(default),
            }
        };

        let token_defaults = TokenConfig::default();
        let refresh_defaults = RefreshSettings::default();

        let tokens = TokenConfig {
            access_ttl_seconds: number("ACCESS_TOKEN_TTL_SECONDS", token_defaults.access_ttl_seconds)?,
            cleanup_interval_seconds: number(
                "CLEANUP_INTERVAL_SECONDS",
                token_defaults.cleanup_interval_seconds,
            )?,
            issuer: lookup("JWT_ISSUER").unwrap_or(token_defaults.issuer),
            jwt_secret: lookup("JWT_SECRET").unwrap_or_default(),
            refresh_ttl_seconds: number(
                "REFRESH_TOKEN_TTL_SECONDS",
                token_defaults.refresh_ttl_seconds,
            )?,
        };

        let refresh = RefreshSettings {
            max_attempts: number("REFRESH_MAX_ATTEMPTS", refresh_defaults.max_attempts as u64)?
                as u32,
            retry_timeout_ms: number("REFRESH_RETRY_TIMEOUT_MS", refresh_defaults.retry_timeout_ms)?,
            wait_timeout_ms: number("REFRESH_WAIT_TIMEOUT_MS", refresh_defaults.wait_timeout_ms)?,
        };

        let bootstrap = match (lookup("BOOTSTRAP_OWNER_EMAIL"), lookup("BOOTSTRAP_OWNER_PASSWORD")) {
            (Some(email), Some(password)) => Some(BootstrapOwner {
                email,
                full_name: lookup("BOOTSTRAP_OWNER_NAME"),
                password,
            }),
            (None, None) => None,
            _ => {
                return Err(ConfigError::ValidationError(
                    "BOOTSTRAP_OWNER_EMAIL and BOOTSTRAP_OWNER_PASSWORD must be set together"
                        .to_string(),
                ))
            }
        };

        let test_mode = lookup("TEST_MODE")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);

        let config = Config {
            bootstrap,
            refresh,
            server: ServerConfig {
                bind_address: lookup("BIND_ADDRESS").unwrap_or_else(|| "0.0.0.0:8080".to_string()),
                data_dir: lookup("DATA_DIR").unwrap_or_else(|| "./data".to_string()),
            },
            test_mode,
            tokens,
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.tokens.jwt_secret.len() < MIN_JWT_SECRET_LEN {
            return Err(ConfigError::ValidationError(format!(
                "JWT_SECRET must be at least {MIN_JWT_SECRET_LEN} bytes"
            )));
        }
        if self.tokens.access_ttl_seconds == 0 || self.tokens.refresh_ttl_seconds == 0 {
            return Err(ConfigError::ValidationError(
                "token lifetimes must be positive".to_string(),
            ));
        }
        if self.tokens.access_ttl_seconds > MAX_TOKEN_TTL_SECONDS
            || self.tokens.refresh_ttl_seconds > MAX_TOKEN_TTL_SECONDS
        {
            return Err(ConfigError::ValidationError(format!(
                "token lifetimes must not exceed {MAX_TOKEN_TTL_SECONDS} seconds"
            )));
        }
        if self.tokens.access_ttl_seconds <= CLIENT_EXPIRY_SKEW_SECONDS {
            return Err(ConfigError::ValidationError(format!(
                "ACCESS_TOKEN_TTL_SECONDS must be greater than {CLIENT_EXPIRY_SKEW_SECONDS}"
            )));
        }
        if self.tokens.access_ttl_seconds >= self.tokens.refresh_ttl_seconds {
            tracing::warn!(
                access_ttl = self.tokens.access_ttl_seconds,
                refresh_ttl = self.tokens.refresh_ttl_seconds,
                "Access tokens outlive refresh tokens; rotation will never be needed"
            );
        }
        if self.refresh.max_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "REFRESH_MAX_ATTEMPTS must be at least 1".to_string(),
            ));
        }
        if self.tokens.cleanup_interval_seconds == 0 {
            return Err(ConfigError::ValidationError(
                "CLEANUP_INTERVAL_SECONDS must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    const SECRET: &str = "0123456789abcdef0123456789abcdef";

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup(&[("JWT_SECRET", SECRET)])).unwrap();
        assert_eq!(config.server.bind_address, "0.0.0.0:8080");
        assert_eq!(config.tokens.access_ttl_seconds, 900);
        assert_eq!(config.tokens.refresh_ttl_seconds, 604_800);
        assert_eq!(config.tokens.issuer, "jumla-auth");
        assert_eq!(config.refresh.max_attempts, 3);
        assert!(config.bootstrap.is_none());
        assert!(!config.test_mode);
    }

    #[test]
    fn test_short_secret_rejected() {
        assert!(Config::from_lookup(lookup(&[("JWT_SECRET", "short")])).is_err());
        assert!(Config::from_lookup(lookup(&[])).is_err());
    }

    #[test]
    fn test_token_lifetime_bounds() {
        let too_long = Config::from_lookup(lookup(&[
            ("JWT_SECRET", SECRET),
            ("REFRESH_TOKEN_TTL_SECONDS", "18446744073709551615"),
        ]));
        assert!(too_long.is_err());

        let within_skew = Config::from_lookup(lookup(&[
            ("JWT_SECRET", SECRET),
            ("ACCESS_TOKEN_TTL_SECONDS", "30"),
        ]));
        assert!(within_skew.is_err());

        let config = Config::from_lookup(lookup(&[
            ("JWT_SECRET", SECRET),
            ("ACCESS_TOKEN_TTL_SECONDS", "31"),
            ("REFRESH_TOKEN_TTL_SECONDS", "31536000"),
        ]))
        .unwrap();
        assert_eq!(config.tokens.access_ttl_seconds, 31);
    }

    #[test]
    fn test_short_secret_rejected_in_test_mode() {
        let result = Config::from_lookup(lookup(&[("JWT_SECRET", "short"), ("TEST_MODE", "true")]));
        assert!(result.is_err());
    }

    #[test]
    fn test_bad_number_rejected() {
        let result = Config::from_lookup(lookup(&[
            ("JWT_SECRET", SECRET),
            ("ACCESS_TOKEN_TTL_SECONDS", "fifteen"),
        ]));
        assert!(result.is_err());
    }

    #[test]
    fn test_bootstrap_requires_both_fields() {
        let partial = Config::from_lookup(lookup(&[
            ("JWT_SECRET", SECRET),
            ("BOOTSTRAP_OWNER_EMAIL", "owner@example.com"),
        ]));
        assert!(partial.is_err());

        let config = Config::from_lookup(lookup(&[
            ("JWT_SECRET", SECRET),
            ("BOOTSTRAP_OWNER_EMAIL", "owner@example.com"),
            ("BOOTSTRAP_OWNER_PASSWORD", "a-long-owner-password"),
        ]))
        .unwrap();
        let owner = config.bootstrap.unwrap();
        assert_eq!(owner.email, "owner@example.com");
        assert!(!format!("{owner:?}").contains("a-long-owner-password"));
    }
}
