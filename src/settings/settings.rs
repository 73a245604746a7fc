use crate::application_impl::JwtConfig;
use crate::domain_model::DEFAULT_KEY_PREFIX;
use crate::token_store::*;
use anyhow::{Result, anyhow};
use config::{Config, Environment, File};
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Deserialize)]
pub struct Settings {
    pub remote: Remote,
    #[serde(default)]
    pub token: Token,
    pub jwt: Jwt,
    pub log: Log,
}

#[derive(Debug, Deserialize)]
pub struct Remote {
    pub backend: String, // "redis" or "memory"
    #[serde(default)]
    pub addresses: Vec<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub db: i64,
}

/// Durations are in seconds.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct Token {
    pub key_prefix: String,
    pub access_default_ttl: u64,
    pub refresh_default_ttl: u64,
    pub pending_sync_max: usize,
    pub health_period: u64,
    pub health_ping_timeout: u64,
    pub cache_max_cost: u64,
}

impl Default for Token {
    fn default() -> Self {
        Token {
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            access_default_ttl: DEFAULT_ACCESS_TTL.as_secs(),
            refresh_default_ttl: DEFAULT_REFRESH_TTL.as_secs(),
            pending_sync_max: MAX_PENDING,
            health_period: DEFAULT_HEALTH_PERIOD.as_secs(),
            health_ping_timeout: DEFAULT_HEALTH_PING_TIMEOUT.as_secs(),
            cache_max_cost: DEFAULT_CACHE_MAX_COST,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct Jwt {
    pub issuer: String,
    pub audience: String,
    pub signing_key: String,
}

#[derive(Debug, Deserialize)]
pub struct Log {
    pub filter: String,
}

impl From<&Settings> for TokenStoreConfig {
    fn from(settings: &Settings) -> Self {
        let token = &settings.token;
        TokenStoreConfig {
            key_prefix: token.key_prefix.clone(),
            access_default_ttl: Duration::from_secs(token.access_default_ttl),
            refresh_default_ttl: Duration::from_secs(token.refresh_default_ttl),
            pending_sync_max: token.pending_sync_max,
            health_period: Duration::from_secs(token.health_period),
            health_ping_timeout: Duration::from_secs(token.health_ping_timeout),
            cache_max_cost: token.cache_max_cost,
        }
        .normalized()
    }
}

impl From<&Settings> for JwtConfig {
    fn from(settings: &Settings) -> Self {
        let store = TokenStoreConfig::from(settings);
        JwtConfig {
            issuer: settings.jwt.issuer.clone(),
            audience: settings.jwt.audience.clone(),
            access_ttl: store.access_default_ttl,
            refresh_ttl: store.refresh_default_ttl,
            signing_key: settings.jwt.signing_key.as_bytes().to_vec(),
        }
    }
}

#[cfg(debug_assertions)]
const SETTINGS_PATH: &str = "settings/dev.toml";
#[cfg(not(debug_assertions))]
const SETTINGS_PATH: &str = "settings/release.toml";

/// Prefix of environment overrides, e.g. `TOKENSTORE__REMOTE__BACKEND=memory`.
pub const ENV_PREFIX: &str = "TOKENSTORE";

pub fn parse_settings(path: Option<&str>) -> Result<Settings> {
    let path = path.unwrap_or(SETTINGS_PATH);

    let settings: Settings = Config::builder()
        .add_source(File::with_name(path))
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("remote.addresses")
                .try_parsing(true),
        )
        .build()
        .map_err(|e| anyhow!(e))?
        .try_deserialize()
        .map_err(|e| anyhow!(e))?;

    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::FileFormat;

    fn from_toml(raw: &str) -> Settings {
        Config::builder()
            .add_source(File::from_str(raw, FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap()
    }

    #[test]
    fn token_section_defaults_when_absent() {
        let settings = from_toml(
            r#"
            [remote]
            backend = "memory"
            [jwt]
            issuer = "i"
            audience = "a"
            signing_key = "k"
            [log]
            filter = "info"
            "#,
        );
        let config = TokenStoreConfig::from(&settings);
        assert_eq!(config.key_prefix, "token");
        assert_eq!(config.access_default_ttl, DEFAULT_ACCESS_TTL);
        assert_eq!(config.pending_sync_max, MAX_PENDING);
        assert!(settings.remote.addresses.is_empty());
    }

    #[test]
    fn durations_are_read_in_seconds() {
        let settings = from_toml(
            r#"
            [remote]
            backend = "redis"
            addresses = ["127.0.0.1:6379"]
            db = 2
            [token]
            health_period = 5
            access_default_ttl = 60
            [jwt]
            issuer = "i"
            audience = "a"
            signing_key = "k"
            [log]
            filter = "debug"
            "#,
        );
        let config = TokenStoreConfig::from(&settings);
        assert_eq!(config.health_period, Duration::from_secs(5));
        assert_eq!(config.access_default_ttl, Duration::from_secs(60));
        assert_eq!(config.refresh_default_ttl, DEFAULT_REFRESH_TTL);
        assert_eq!(settings.remote.db, 2);

        let jwt = JwtConfig::from(&settings);
        assert_eq!(jwt.access_ttl, Duration::from_secs(60));
        assert_eq!(jwt.signing_key, b"k".to_vec());
    }
}
