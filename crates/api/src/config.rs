//! API server configuration

use std::env;
use std::fmt;

use congregate_billing::{RetryPolicy, StripeConfig};
use thiserror::Error;

const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:8080";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{name} is invalid: {value}")]
    Invalid { name: &'static str, value: String },
}

#[derive(Clone)]
pub struct Config {
    pub bind_address: String,
    pub database_url: String,
    pub stripe: StripeConfig,
    /// Bearer token for the admin webhook routes. Unset disables them.
    pub admin_api_token: Option<String>,
    pub retry_policy: RetryPolicy,
    pub run_migrations: bool,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("bind_address", &self.bind_address)
            .field("database_url", &"[redacted]")
            .field("stripe", &self.stripe)
            .field("admin_api_token", &self.admin_api_token.as_ref().map(|_| "[redacted]"))
            .field("retry_policy", &self.retry_policy)
            .field("run_migrations", &self.run_migrations)
            .finish()
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from any key lookup; blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let database_url = get("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?;

        let mut retry_policy = RetryPolicy::default();
        if let Some(raw) = get("WEBHOOK_MAX_ATTEMPTS") {
            retry_policy.max_attempts = parse_positive("WEBHOOK_MAX_ATTEMPTS", &raw)?;
        }
        if let Some(raw) = get("WEBHOOK_STALE_AFTER_MINUTES") {
            let minutes = parse_positive("WEBHOOK_STALE_AFTER_MINUTES", &raw)?;
            retry_policy.stale_after = time::Duration::minutes(i64::from(minutes));
        }

        let run_migrations = match get("RUN_MIGRATIONS") {
            Some(raw) => parse_bool("RUN_MIGRATIONS", &raw)?,
            None => false,
        };

        Ok(Self {
            bind_address: get("BIND_ADDRESS").unwrap_or_else(|| DEFAULT_BIND_ADDRESS.to_string()),
            database_url,
            stripe: StripeConfig {
                secret_key: get("STRIPE_SECRET_KEY"),
                webhook_secret: get("STRIPE_WEBHOOK_SECRET"),
            },
            admin_api_token: get("ADMIN_API_TOKEN"),
            retry_policy,
            run_migrations,
        })
    }
}

fn parse_positive(name: &'static str, raw: &str) -> Result<i32, ConfigError> {
    match raw.parse::<i32>() {
        Ok(value) if value > 0 => Ok(value),
        _ => Err(ConfigError::Invalid {
            name,
            value: raw.to_string(),
        }),
    }
}

fn parse_bool(name: &'static str, raw: &str) -> Result<bool, ConfigError> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid {
            name,
            value: raw.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_apply() {
        let config = config(&[("DATABASE_URL", "postgres://localhost/congregate")]).unwrap();

        assert_eq!(config.bind_address, DEFAULT_BIND_ADDRESS);
        assert!(config.stripe.webhook_secret.is_none());
        assert!(config.admin_api_token.is_none());
        assert_eq!(config.retry_policy.max_attempts, 5);
        assert_eq!(config.retry_policy.stale_after, time::Duration::minutes(30));
        assert!(!config.run_migrations);
    }

    #[test]
    fn database_url_is_required() {
        let err = config(&[("DATABASE_URL", "  ")]).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("DATABASE_URL")));
    }

    #[test]
    fn overrides_are_parsed() {
        let config = config(&[
            ("DATABASE_URL", "postgres://localhost/congregate"),
            ("BIND_ADDRESS", "127.0.0.1:3001"),
            ("STRIPE_WEBHOOK_SECRET", "whsec_x"),
            ("ADMIN_API_TOKEN", "admin-token"),
            ("WEBHOOK_MAX_ATTEMPTS", "3"),
            ("WEBHOOK_STALE_AFTER_MINUTES", "10"),
            ("RUN_MIGRATIONS", "true"),
        ])
        .unwrap();

        assert_eq!(config.bind_address, "127.0.0.1:3001");
        assert_eq!(config.stripe.webhook_secret.as_deref(), Some("whsec_x"));
        assert_eq!(config.retry_policy.max_attempts, 3);
        assert_eq!(config.retry_policy.stale_after, time::Duration::minutes(10));
        assert!(config.run_migrations);
        assert!(!format!("{config:?}").contains("admin-token"));
    }

    #[test]
    fn invalid_numbers_are_rejected() {
        let err = config(&[
            ("DATABASE_URL", "postgres://localhost/congregate"),
            ("WEBHOOK_MAX_ATTEMPTS", "0"),
        ])
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                name: "WEBHOOK_MAX_ATTEMPTS",
                ..
            }
        ));
    }
}
