use std::path::PathBuf;
use std::str::FromStr;

use anyhow::Context;
use chrono::{FixedOffset, Offset, Utc};

use crate::query::PageLimits;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub database_url: String,
    pub database_max_connections: u32,
    /// `production`, `staging`, ... Informational, except that production
    /// refuses to start on the fallback database URL.
    pub env: String,
    pub session_ttl_hours: i64,
    /// Reference offset, in minutes east of UTC, for day-window boundaries.
    pub quota_day_utc_offset_minutes: i32,
    pub default_page_size: u32,
    pub max_page_size: u32,
    pub unpaged_row_cap: u32,
    /// Optional YAML projection override for unrestricted reads.
    pub projection_config: Option<PathBuf>,
    /// Allow admins to create tokens that are neither super nor scoped.
    pub allow_unscoped_tokens: bool,
    /// Believe the first `X-Forwarded-For` hop as the caller IP.
    pub trust_forwarded_for: bool,
    pub metadata_cache_ttl_secs: u64,
    pub cors_allowed_origin: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            database_url: DEFAULT_DATABASE_URL.into(),
            database_max_connections: 10,
            env: "development".into(),
            session_ttl_hours: 24,
            quota_day_utc_offset_minutes: 0,
            default_page_size: 50,
            max_page_size: 500,
            unpaged_row_cap: 500,
            projection_config: None,
            allow_unscoped_tokens: false,
            trust_forwarded_for: false,
            metadata_cache_ttl_secs: 300,
            cors_allowed_origin: None,
        }
    }
}

const DEFAULT_DATABASE_URL: &str = "postgres://localhost/datagate";

impl Config {
    pub fn day_offset(&self) -> FixedOffset {
        // range checked in from_lookup
        FixedOffset::east_opt(self.quota_day_utc_offset_minutes * 60)
            .unwrap_or_else(|| Utc.fix())
    }

    pub fn page_limits(&self) -> PageLimits {
        PageLimits {
            default_per_page: self.default_page_size,
            max_per_page: self.max_page_size,
            unpaged_cap: self.unpaged_row_cap,
        }
    }

    pub fn session_ttl(&self) -> chrono::Duration {
        chrono::Duration::hours(self.session_ttl_hours)
    }

    /// Build from an arbitrary variable source. `load` passes the process
    /// environment; tests pass a map.
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Config::default();
        let get = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let env = get("DATAGATE_ENV").unwrap_or(defaults.env);
        let database_url = match get("DATABASE_URL") {
            Some(url) => url,
            None if matches!(env.as_str(), "production" | "prod") => {
                anyhow::bail!("DATABASE_URL must be set when DATAGATE_ENV=production")
            }
            None => defaults.database_url,
        };

        let config = Config {
            port: parse_or(&get, "DATAGATE_PORT", defaults.port)?,
            database_url,
            database_max_connections: parse_or(
                &get,
                "DATABASE_MAX_CONNECTIONS",
                defaults.database_max_connections,
            )?,
            env,
            session_ttl_hours: parse_or(&get, "SESSION_TTL_HOURS", defaults.session_ttl_hours)?,
            quota_day_utc_offset_minutes: parse_or(
                &get,
                "QUOTA_DAY_UTC_OFFSET_MINUTES",
                defaults.quota_day_utc_offset_minutes,
            )?,
            default_page_size: parse_or(&get, "DEFAULT_PAGE_SIZE", defaults.default_page_size)?,
            max_page_size: parse_or(&get, "MAX_PAGE_SIZE", defaults.max_page_size)?,
            unpaged_row_cap: parse_or(&get, "UNPAGED_ROW_CAP", defaults.unpaged_row_cap)?,
            projection_config: get("PROJECTION_CONFIG").map(PathBuf::from),
            allow_unscoped_tokens: parse_bool(&get, "ALLOW_UNSCOPED_TOKENS")?,
            trust_forwarded_for: parse_bool(&get, "TRUST_FORWARDED_FOR")?,
            metadata_cache_ttl_secs: parse_or(
                &get,
                "METADATA_CACHE_TTL_SECS",
                defaults.metadata_cache_ttl_secs,
            )?,
            cors_allowed_origin: get("CORS_ALLOWED_ORIGIN"),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.quota_day_utc_offset_minutes.abs() >= 24 * 60 {
            anyhow::bail!(
                "QUOTA_DAY_UTC_OFFSET_MINUTES must be within ±1439, got {}",
                self.quota_day_utc_offset_minutes
            );
        }
        if self.session_ttl_hours <= 0 {
            anyhow::bail!("SESSION_TTL_HOURS must be positive");
        }
        if self.max_page_size == 0 || self.unpaged_row_cap == 0 {
            anyhow::bail!("MAX_PAGE_SIZE and UNPAGED_ROW_CAP must be positive");
        }
        if self.default_page_size == 0 || self.default_page_size > self.max_page_size {
            anyhow::bail!(
                "DEFAULT_PAGE_SIZE must be between 1 and MAX_PAGE_SIZE ({})",
                self.max_page_size
            );
        }
        Ok(())
    }
}

fn parse_or<T, G>(get: &G, name: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    G: Fn(&str) -> Option<String>,
{
    match get(name) {
        Some(raw) => raw
            .parse()
            .with_context(|| format!("{name} has invalid value '{raw}'")),
        None => Ok(default),
    }
}

fn parse_bool<G>(get: &G, name: &str) -> anyhow::Result<bool>
where
    G: Fn(&str) -> Option<String>,
{
    match get(name).map(|v| v.to_ascii_lowercase()) {
        None => Ok(false),
        Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => Ok(true),
        Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => Ok(false),
        Some(v) => anyhow::bail!("{name} must be a boolean, got '{v}'"),
    }
}

pub fn load() -> anyhow::Result<Config> {
    dotenvy::dotenv().ok();
    Config::from_lookup(|name| std::env::var(name).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from(vars: &[(&str, &str)]) -> anyhow::Result<Config> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|name| map.get(name).cloned())
    }

    #[test]
    fn test_defaults() {
        let cfg = from(&[]).unwrap();
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.page_limits(), PageLimits::default());
        assert_eq!(cfg.session_ttl(), chrono::Duration::hours(24));
        assert!(!cfg.allow_unscoped_tokens);
        assert_eq!(cfg.day_offset().local_minus_utc(), 0);
    }

    #[test]
    fn test_overrides() {
        let cfg = from(&[
            ("DATAGATE_PORT", "9000"),
            ("QUOTA_DAY_UTC_OFFSET_MINUTES", "420"),
            ("ALLOW_UNSCOPED_TOKENS", "true"),
            ("PROJECTION_CONFIG", "/etc/datagate/projection.yaml"),
        ])
        .unwrap();
        assert_eq!(cfg.port, 9000);
        assert_eq!(cfg.day_offset().local_minus_utc(), 7 * 3600);
        assert!(cfg.allow_unscoped_tokens);
        assert_eq!(
            cfg.projection_config,
            Some(PathBuf::from("/etc/datagate/projection.yaml"))
        );
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(from(&[("DATAGATE_PORT", "eighty")]).is_err());
        assert!(from(&[("QUOTA_DAY_UTC_OFFSET_MINUTES", "1440")]).is_err());
        assert!(from(&[("TRUST_FORWARDED_FOR", "maybe")]).is_err());
        assert!(from(&[("DEFAULT_PAGE_SIZE", "600")]).is_err());
    }

    #[test]
    fn test_production_requires_database_url() {
        assert!(from(&[("DATAGATE_ENV", "production")]).is_err());
        assert!(from(&[
            ("DATAGATE_ENV", "production"),
            ("DATABASE_URL", "postgres://db/datagate")
        ])
        .is_ok());
    }
}
