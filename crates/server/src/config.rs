use std::collections::HashMap;
use std::env;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug)]
pub enum ConfigError {
    Io,
    Parse,
    Missing,
    Invalid,
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io => write!(f, "configuration io failure"),
            Self::Parse => write!(f, "configuration parse failure"),
            Self::Missing => write!(f, "configuration key missing"),
            Self::Invalid => write!(f, "configuration value invalid"),
        }
    }
}

impl Error for ConfigError {}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PushAdapter {
    Null,
    Debug,
    Expo,
}

#[derive(Clone)]
pub struct PushConfig {
    pub adapter: PushAdapter,
    pub endpoint: Option<String>,
}

#[derive(Clone, Debug)]
pub struct RateLimitSettings {
    pub burst: u32,
    pub window: Duration,
    pub penalty: Duration,
}

#[derive(Clone, Debug)]
pub struct RateLimitConfig {
    pub http: RateLimitSettings,
    pub connect: RateLimitSettings,
}

#[derive(Clone)]
pub struct ServerConfig {
    pub bind: String,
    pub tls_cert: String,
    pub tls_key: String,
    pub admin_token: Option<String>,
    pub postgres_dsn: String,
    pub redis_url: String,
    pub push: PushConfig,
    pub presence_ttl_seconds: i64,
    pub connection_keepalive: u64,
    pub ring_timeout_seconds: u64,
    pub chat_retry_attempts: u32,
    pub chat_retry_backoff_ms: u64,
    pub history_page_size: i64,
    pub rate_limit: RateLimitConfig,
}

/// Loads Peal server configuration from filesystem and environment overrides.
pub fn load_configuration(path: &Path) -> Result<ServerConfig, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|_| ConfigError::Io)?;
    let mut section = String::new();
    let mut map = HashMap::new();
    for line in contents.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        if trimmed.starts_with('[') && trimmed.ends_with(']') {
            section = trimmed
                .trim_start_matches('[')
                .trim_end_matches(']')
                .to_string();
            continue;
        }
        let parts: Vec<&str> = trimmed.splitn(2, '=').collect();
        if parts.len() != 2 {
            return Err(ConfigError::Parse);
        }
        let key = if section.is_empty() {
            parts[0].trim().to_string()
        } else {
            format!("{}.{}", section, parts[0].trim())
        };
        let mut value = parts[1].trim().to_string();
        if let Some(idx) = value.find('#') {
            value.truncate(idx);
            value = value.trim().to_string();
        }
        if value.starts_with('"') && value.ends_with('"') && value.len() >= 2 {
            value = value[1..value.len() - 1].to_string();
        }
        map.insert(key, value);
    }

    let bind = required(override_env("PEAL_BIND", map.remove("server.bind"))?)?;
    let tls_cert = required(override_env("PEAL_TLS_CERT", map.remove("server.tls_cert"))?)?;
    let tls_key = required(override_env("PEAL_TLS_KEY", map.remove("server.tls_key"))?)?;
    let admin_token = override_env("PEAL_ADMIN_TOKEN", map.remove("admin.token"))?;
    let postgres_dsn = required(override_env(
        "PEAL_PG_DSN",
        map.remove("storage.postgres_dsn"),
    )?)?;
    let redis_url = required(override_env(
        "PEAL_REDIS_URL",
        map.remove("storage.redis_url"),
    )?)?;

    let push_mode = override_env("PEAL_PUSH", map.remove("push.mode"))?
        .unwrap_or_else(|| "null".to_string());
    let push_endpoint = override_env("PEAL_PUSH_ENDPOINT", map.remove("push.endpoint"))?;
    let push_adapter = match push_mode.as_str() {
        "null" => PushAdapter::Null,
        "debug" => PushAdapter::Debug,
        "expo" => PushAdapter::Expo,
        _ => return Err(ConfigError::Invalid),
    };

    let presence_ttl = parse_i64(
        override_env("PEAL_PRESENCE_TTL", map.remove("limits.presence_ttl"))?,
        30,
    )?;
    let keepalive = parse_u64(
        override_env("PEAL_KEEPALIVE", map.remove("server.keepalive"))?,
        60,
    )?;
    let ring_timeout = parse_u64(
        override_env("PEAL_RING_TIMEOUT", map.remove("calls.ring_timeout"))?,
        30,
    )?;
    let chat_retry_attempts = parse_u64(
        override_env("PEAL_CHAT_RETRIES", map.remove("chat.retry_attempts"))?,
        3,
    )? as u32;
    let chat_retry_backoff = parse_u64(
        override_env(
            "PEAL_CHAT_RETRY_BACKOFF_MS",
            map.remove("chat.retry_backoff_ms"),
        )?,
        100,
    )?;
    let history_page_size = parse_i64(
        override_env("PEAL_HISTORY_PAGE", map.remove("limits.history_page"))?,
        200,
    )?;

    let http_limit = RateLimitSettings {
        burst: parse_u64(map.remove("limits.http_burst"), 60)? as u32,
        window: Duration::from_millis(parse_u64(map.remove("limits.http_window_ms"), 60_000)?),
        penalty: Duration::from_millis(parse_u64(map.remove("limits.http_penalty_ms"), 30_000)?),
    };
    let connect_limit = RateLimitSettings {
        burst: parse_u64(map.remove("limits.connect_burst"), 10)? as u32,
        window: Duration::from_millis(parse_u64(map.remove("limits.connect_window_ms"), 60_000)?),
        penalty: Duration::from_millis(parse_u64(
            map.remove("limits.connect_penalty_ms"),
            60_000,
        )?),
    };

    if ring_timeout == 0 || chat_retry_attempts == 0 {
        return Err(ConfigError::Invalid);
    }

    Ok(ServerConfig {
        bind,
        tls_cert,
        tls_key,
        admin_token,
        postgres_dsn,
        redis_url,
        push: PushConfig {
            adapter: push_adapter,
            endpoint: push_endpoint,
        },
        presence_ttl_seconds: presence_ttl,
        connection_keepalive: keepalive,
        ring_timeout_seconds: ring_timeout,
        chat_retry_attempts,
        chat_retry_backoff_ms: chat_retry_backoff,
        history_page_size,
        rate_limit: RateLimitConfig {
            http: http_limit,
            connect: connect_limit,
        },
    })
}

fn override_env(key: &str, current: Option<String>) -> Result<Option<String>, ConfigError> {
    match env::var(key) {
        Ok(value) => Ok(Some(value)),
        Err(env::VarError::NotPresent) => Ok(current),
        Err(_) => Err(ConfigError::Invalid),
    }
}

fn required(value: Option<String>) -> Result<String, ConfigError> {
    value.ok_or(ConfigError::Missing)
}

fn parse_u64(value: Option<String>, default: u64) -> Result<u64, ConfigError> {
    value
        .map(|raw| raw.parse::<u64>().map_err(|_| ConfigError::Invalid))
        .unwrap_or(Ok(default))
}

fn parse_i64(value: Option<String>, default: i64) -> Result<i64, ConfigError> {
    value
        .map(|raw| raw.parse::<i64>().map_err(|_| ConfigError::Invalid))
        .unwrap_or(Ok(default))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::path::PathBuf;

    #[test]
    fn parse_configuration_minimal() {
        let mut path = PathBuf::from(env::temp_dir());
        path.push("peal_test_config.toml");
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(
            b"[server]\nbind=\"127.0.0.1:8443\"\ntls_cert=\"cert.pem\"\ntls_key=\"key.pem\"\n[storage]\npostgres_dsn=\"postgres://\"\nredis_url=\"redis://localhost\"\n",
        )
        .unwrap();
        let config = load_configuration(&path).unwrap();
        assert_eq!(config.bind, "127.0.0.1:8443");
        assert_eq!(config.push.adapter, PushAdapter::Null);
        assert_eq!(config.ring_timeout_seconds, 30);
        assert_eq!(config.chat_retry_attempts, 3);
        assert_eq!(config.chat_retry_backoff_ms, 100);
        assert_eq!(config.presence_ttl_seconds, 30);
        assert_eq!(config.rate_limit.http.burst, 60);
        fs::remove_file(path).unwrap();
    }

    #[test]
    fn parse_configuration_overrides() {
        let mut path = PathBuf::from(env::temp_dir());
        path.push("peal_test_config_full.toml");
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(
            b"[server]\nbind=\"0.0.0.0:8443\"\ntls_cert=\"cert.pem\"\ntls_key=\"key.pem\"\nkeepalive=\"30\"\n[storage]\npostgres_dsn=\"postgres://\"\nredis_url=\"redis://localhost\"\n[push]\nmode=\"debug\"\n[calls]\nring_timeout=\"15\"\n[chat]\nretry_attempts=\"5\"\nretry_backoff_ms=\"50\"\n[limits]\npresence_ttl=\"60\"\nhttp_burst=\"5\"\n",
        )
        .unwrap();
        let config = load_configuration(&path).unwrap();
        assert_eq!(config.push.adapter, PushAdapter::Debug);
        assert_eq!(config.ring_timeout_seconds, 15);
        assert_eq!(config.chat_retry_attempts, 5);
        assert_eq!(config.chat_retry_backoff_ms, 50);
        assert_eq!(config.presence_ttl_seconds, 60);
        assert_eq!(config.connection_keepalive, 30);
        assert_eq!(config.rate_limit.http.burst, 5);
        fs::remove_file(path).unwrap();
    }

    #[test]
    fn rejects_unknown_push_mode() {
        let mut path = PathBuf::from(env::temp_dir());
        path.push("peal_test_config_bad_push.toml");
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(
            b"[server]\nbind=\"127.0.0.1:8443\"\ntls_cert=\"cert.pem\"\ntls_key=\"key.pem\"\n[storage]\npostgres_dsn=\"postgres://\"\nredis_url=\"redis://localhost\"\n[push]\nmode=\"carrier-pigeon\"\n",
        )
        .unwrap();
        assert!(matches!(
            load_configuration(&path),
            Err(ConfigError::Invalid)
        ));
        fs::remove_file(path).unwrap();
    }

    #[test]
    fn rejects_zero_ring_timeout() {
        let mut path = PathBuf::from(env::temp_dir());
        path.push("peal_test_config_zero_ring.toml");
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(
            b"[server]\nbind=\"127.0.0.1:8443\"\ntls_cert=\"cert.pem\"\ntls_key=\"key.pem\"\n[storage]\npostgres_dsn=\"postgres://\"\nredis_url=\"redis://localhost\"\n[calls]\nring_timeout=\"0\"\n",
        )
        .unwrap();
        assert!(matches!(
            load_configuration(&path),
            Err(ConfigError::Invalid)
        ));
        fs::remove_file(path).unwrap();
    }
}
