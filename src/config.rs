use crate::domain::Decimal;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub database_path: String,
    pub commerce_api_url: String,
    pub commerce_api_key: Option<String>,
    pub auth_secret: String,
    pub token_ttl_days: i64,
    pub default_commission_rate: Decimal,
    pub settlement_currency: String,
    pub stats_max_days: i64,
    pub welcome_discount_percent: Decimal,
    pub storefront_url: Option<String>,
    pub webhook_secret: Option<String>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnv(String),
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

const MIN_SECRET_LEN: usize = 16;

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_map(std::env::vars().collect())
    }

    pub fn from_env_map(env_map: HashMap<String, String>) -> Result<Self, ConfigError> {
        let port = env_map
            .get("PORT")
            .map(|s| s.as_str())
            .unwrap_or("8080")
            .parse::<u16>()
            .map_err(|_| {
                ConfigError::InvalidValue("PORT".to_string(), "must be a valid u16".to_string())
            })?;

        let database_path = required(&env_map, "DATABASE_PATH")?;
        let commerce_api_url = required(&env_map, "COMMERCE_API_URL")?
            .trim_end_matches('/')
            .to_string();
        let commerce_api_key = optional(&env_map, "COMMERCE_API_KEY");

        let auth_secret = required(&env_map, "AUTH_SECRET")?;
        if auth_secret.len() < MIN_SECRET_LEN {
            return Err(ConfigError::InvalidValue(
                "AUTH_SECRET".to_string(),
                format!("must be at least {} characters", MIN_SECRET_LEN),
            ));
        }

        let token_ttl_days = positive_i64(&env_map, "TOKEN_TTL_DAYS", 30)?;

        let default_commission_rate = env_map
            .get("DEFAULT_COMMISSION_RATE")
            .map(|s| s.as_str())
            .unwrap_or("0.1");
        let default_commission_rate = Decimal::from_str_canonical(default_commission_rate)
            .ok()
            .filter(|r| crate::domain::order::is_valid_rate(*r))
            .ok_or_else(|| {
                ConfigError::InvalidValue(
                    "DEFAULT_COMMISSION_RATE".to_string(),
                    "must be a decimal between 0 and 1".to_string(),
                )
            })?;

        let settlement_currency = optional(&env_map, "SETTLEMENT_CURRENCY")
            .unwrap_or_else(|| "twd".to_string())
            .to_ascii_lowercase();

        let stats_max_days = positive_i64(&env_map, "STATS_MAX_DAYS", 366)?;

        let welcome_discount_percent = env_map
            .get("WELCOME_DISCOUNT_PERCENT")
            .map(|s| s.as_str())
            .unwrap_or("10");
        let welcome_discount_percent = Decimal::from_str_canonical(welcome_discount_percent)
            .ok()
            .filter(|p| !p.is_negative() && *p <= Decimal::hundred())
            .ok_or_else(|| {
                ConfigError::InvalidValue(
                    "WELCOME_DISCOUNT_PERCENT".to_string(),
                    "must be a decimal between 0 and 100".to_string(),
                )
            })?;

        let storefront_url =
            optional(&env_map, "STOREFRONT_URL").map(|s| s.trim_end_matches('/').to_string());
        let webhook_secret = optional(&env_map, "WEBHOOK_SECRET");

        Ok(Config {
            port,
            database_path,
            commerce_api_url,
            commerce_api_key,
            auth_secret,
            token_ttl_days,
            default_commission_rate,
            settlement_currency,
            stats_max_days,
            welcome_discount_percent,
            storefront_url,
            webhook_secret,
        })
    }
}

fn required(env_map: &HashMap<String, String>, key: &str) -> Result<String, ConfigError> {
    optional(env_map, key).ok_or_else(|| ConfigError::MissingEnv(key.to_string()))
}

fn optional(env_map: &HashMap<String, String>, key: &str) -> Option<String> {
    env_map
        .get(key)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn positive_i64(
    env_map: &HashMap<String, String>,
    key: &str,
    default: i64,
) -> Result<i64, ConfigError> {
    match env_map.get(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse::<i64>()
            .ok()
            .filter(|v| *v > 0)
            .ok_or_else(|| {
                ConfigError::InvalidValue(key.to_string(), "must be a positive integer".to_string())
            }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup_required_env() -> HashMap<String, String> {
        let mut map = HashMap::new();
        map.insert("DATABASE_PATH".to_string(), "/tmp/test.db".to_string());
        map.insert(
            "COMMERCE_API_URL".to_string(),
            "http://localhost:9000/".to_string(),
        );
        map.insert(
            "AUTH_SECRET".to_string(),
            "a-very-long-test-secret".to_string(),
        );
        map
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_env_map(setup_required_env()).unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.commerce_api_url, "http://localhost:9000");
        assert_eq!(config.token_ttl_days, 30);
        assert_eq!(config.default_commission_rate.to_canonical_string(), "0.1");
        assert_eq!(config.settlement_currency, "twd");
        assert_eq!(config.stats_max_days, 366);
        assert_eq!(config.welcome_discount_percent.to_canonical_string(), "10");
        assert!(config.commerce_api_key.is_none());
        assert!(config.webhook_secret.is_none());
    }

    #[test]
    fn test_missing_database_path() {
        let mut env_map = setup_required_env();
        env_map.remove("DATABASE_PATH");
        match Config::from_env_map(env_map) {
            Err(ConfigError::MissingEnv(s)) => assert_eq!(s, "DATABASE_PATH"),
            _ => panic!("Expected MissingEnv error"),
        }
    }

    #[test]
    fn test_missing_commerce_api_url() {
        let mut env_map = setup_required_env();
        env_map.remove("COMMERCE_API_URL");
        match Config::from_env_map(env_map) {
            Err(ConfigError::MissingEnv(s)) => assert_eq!(s, "COMMERCE_API_URL"),
            _ => panic!("Expected MissingEnv error"),
        }
    }

    #[test]
    fn test_short_auth_secret_rejected() {
        let mut env_map = setup_required_env();
        env_map.insert("AUTH_SECRET".to_string(), "short".to_string());
        match Config::from_env_map(env_map) {
            Err(ConfigError::InvalidValue(k, _)) => assert_eq!(k, "AUTH_SECRET"),
            _ => panic!("Expected InvalidValue error"),
        }
    }

    #[test]
    fn test_invalid_port() {
        let mut env_map = setup_required_env();
        env_map.insert("PORT".to_string(), "not_a_number".to_string());
        match Config::from_env_map(env_map) {
            Err(ConfigError::InvalidValue(k, _)) => assert_eq!(k, "PORT"),
            _ => panic!("Expected InvalidValue error"),
        }
    }

    #[test]
    fn test_commission_rate_out_of_range() {
        let mut env_map = setup_required_env();
        env_map.insert("DEFAULT_COMMISSION_RATE".to_string(), "1.5".to_string());
        match Config::from_env_map(env_map) {
            Err(ConfigError::InvalidValue(k, _)) => assert_eq!(k, "DEFAULT_COMMISSION_RATE"),
            _ => panic!("Expected InvalidValue error"),
        }
    }

    #[test]
    fn test_stats_max_days_must_be_positive() {
        let mut env_map = setup_required_env();
        env_map.insert("STATS_MAX_DAYS".to_string(), "0".to_string());
        match Config::from_env_map(env_map) {
            Err(ConfigError::InvalidValue(k, _)) => assert_eq!(k, "STATS_MAX_DAYS"),
            _ => panic!("Expected InvalidValue error"),
        }
    }
}
