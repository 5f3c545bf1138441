use std::env;
use std::time::Duration;

use crate::engine::scoring::MatcherConfig;
use crate::error::AppError;
use crate::models::courier::GeoPoint;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Compact,
    Json,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub http_port: u16,
    pub log_level: String,
    pub log_format: LogFormat,
    /// `None` keeps all state in process memory.
    pub database_url: Option<String>,
    pub db_max_connections: u32,
    pub db_timeout: Duration,
    pub auto_assign_timeout: Duration,
    pub dispatch_queue_size: usize,
    pub event_buffer_size: usize,
    pub matcher: MatcherConfig,
    pub default_reference: GeoPoint,
    /// Zero disables the per-order exclusion of couriers that just declined.
    pub decline_cooldown: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_port: 3000,
            log_level: "info".to_string(),
            log_format: LogFormat::Compact,
            database_url: None,
            db_max_connections: 5,
            db_timeout: Duration::from_millis(5_000),
            auto_assign_timeout: Duration::from_secs(15),
            dispatch_queue_size: 1024,
            event_buffer_size: 1024,
            matcher: MatcherConfig::default(),
            default_reference: GeoPoint::new(-15.4167, 28.2833),
            decline_cooldown: Duration::ZERO,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        let _ = dotenvy::dotenv();
        let defaults = Self::default();

        let log_format = match env::var("LOG_FORMAT").as_deref() {
            Ok("json") => LogFormat::Json,
            Ok("compact") | Err(_) => LogFormat::Compact,
            Ok(other) => {
                return Err(AppError::Internal(format!(
                    "invalid LOG_FORMAT: {other}, expected compact or json"
                )));
            }
        };

        let config = Self {
            http_port: parse_or_default("HTTP_PORT", defaults.http_port)?,
            log_level: env::var("LOG_LEVEL").unwrap_or(defaults.log_level),
            log_format,
            database_url: env::var("DATABASE_URL").ok().filter(|url| !url.trim().is_empty()),
            db_max_connections: parse_or_default("DB_MAX_CONNECTIONS", defaults.db_max_connections)?,
            db_timeout: Duration::from_millis(parse_or_default("DB_TIMEOUT_MS", 5_000u64)?),
            auto_assign_timeout: Duration::from_secs(parse_or_default(
                "AUTO_ASSIGN_TIMEOUT_SECS",
                15u64,
            )?),
            dispatch_queue_size: parse_or_default("DISPATCH_QUEUE_SIZE", defaults.dispatch_queue_size)?,
            event_buffer_size: parse_or_default("EVENT_BUFFER_SIZE", defaults.event_buffer_size)?,
            matcher: MatcherConfig {
                radius_km: parse_or_default("MATCH_RADIUS_KM", defaults.matcher.radius_km)?,
                max_active_orders: parse_or_default(
                    "MAX_ACTIVE_ORDERS",
                    defaults.matcher.max_active_orders,
                )?,
            },
            default_reference: GeoPoint::new(
                parse_or_default("DEFAULT_REFERENCE_LAT", defaults.default_reference.lat)?,
                parse_or_default("DEFAULT_REFERENCE_LON", defaults.default_reference.lng)?,
            ),
            decline_cooldown: Duration::from_secs(parse_or_default("DECLINE_COOLDOWN_SECS", 0u64)?),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.db_timeout.is_zero() || self.db_timeout > Duration::from_secs(10) {
            return Err(AppError::Internal(
                "DB_TIMEOUT_MS must be between 1 and 10000".to_string(),
            ));
        }
        if self.auto_assign_timeout.is_zero() {
            return Err(AppError::Internal(
                "AUTO_ASSIGN_TIMEOUT_SECS must be > 0".to_string(),
            ));
        }
        if self.matcher.radius_km.is_nan() || self.matcher.radius_km <= 0.0 {
            return Err(AppError::Internal("MATCH_RADIUS_KM must be > 0".to_string()));
        }
        if self.matcher.max_active_orders == 0 {
            return Err(AppError::Internal("MAX_ACTIVE_ORDERS must be > 0".to_string()));
        }
        if !self.default_reference.is_valid() {
            return Err(AppError::Internal(
                "DEFAULT_REFERENCE_LAT/LON out of range".to_string(),
            ));
        }
        if self.dispatch_queue_size == 0 || self.event_buffer_size == 0 {
            return Err(AppError::Internal("queue sizes must be > 0".to_string()));
        }
        Ok(())
    }
}

fn parse_or_default<T>(key: &str, default: T) -> Result<T, AppError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|err| AppError::Internal(format!("invalid {key}: {err}"))),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.matcher.radius_km, 10.0);
        assert_eq!(config.matcher.max_active_orders, 3);
        assert_eq!(config.default_reference, GeoPoint::new(-15.4167, 28.2833));
        assert!(config.decline_cooldown.is_zero());
    }

    #[test]
    fn db_timeout_must_stay_in_single_digit_seconds() {
        let config = Config {
            db_timeout: Duration::from_secs(30),
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_load_cap_is_rejected() {
        let config = Config {
            matcher: MatcherConfig {
                radius_km: 10.0,
                max_active_orders: 0,
            },
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn unset_variable_falls_back_to_default() {
        let value: u16 = parse_or_default("LPG_DISPATCH_SURELY_UNSET_VARIABLE", 4242).unwrap();
        assert_eq!(value, 4242);
    }
}
