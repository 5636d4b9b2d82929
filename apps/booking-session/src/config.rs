use std::env;
use std::time::Duration;

use thiserror::Error;
use url::Url;

use crate::realtime::{
    DEFAULT_MAX_RECONNECT_ATTEMPTS, DEFAULT_RECONNECT_BASE_DELAY, DEFAULT_SHUTDOWN_RECONNECT_DELAY,
    DEFAULT_TOKEN_REFRESH_RECONNECT_DELAY, RealtimeConfig,
};

pub const DEFAULT_API_BASE: &str = "http://127.0.0.1:8080/api/";
pub const REALTIME_PATH: &str = "ws/notifications";
pub const DEFAULT_RENEWAL_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} cannot be empty")]
    Empty(&'static str),
    #[error("invalid {field}: {message}")]
    InvalidUrl { field: &'static str, message: String },
}

#[derive(Debug, Clone)]
pub struct LivenessConfig {
    pub api_base: Url,
    pub realtime_url: Url,
    pub renewal_timeout: Duration,
    pub ready_timeout: Duration,
    pub reconnect_base_delay: Duration,
    pub max_reconnect_attempts: u32,
    pub token_refresh_reconnect_delay: Duration,
    pub shutdown_reconnect_default: Duration,
}

impl LivenessConfig {
    /// Defaults for everything but the API base; the realtime endpoint is
    /// derived from it.
    pub fn new(api_base: &str) -> Result<Self, ConfigError> {
        let api_base = normalize_base(api_base)?;
        let realtime_url = derive_realtime_url(&api_base)?;
        Ok(Self {
            api_base,
            realtime_url,
            renewal_timeout: DEFAULT_RENEWAL_TIMEOUT,
            ready_timeout: DEFAULT_READY_TIMEOUT,
            reconnect_base_delay: DEFAULT_RECONNECT_BASE_DELAY,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            token_refresh_reconnect_delay: DEFAULT_TOKEN_REFRESH_RECONNECT_DELAY,
            shutdown_reconnect_default: DEFAULT_SHUTDOWN_RECONNECT_DELAY,
        })
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        let api_base = env_string("BOOKING_API_BASE").unwrap_or_else(|| DEFAULT_API_BASE.to_string());
        let mut config = Self::new(&api_base)?;
        if let Some(realtime) = env_string("BOOKING_REALTIME_URL") {
            config = config.with_realtime_url(&realtime)?;
        }

        config.renewal_timeout = env_millis("BOOKING_RENEWAL_TIMEOUT_MS", config.renewal_timeout);
        config.ready_timeout = env_millis("BOOKING_READY_TIMEOUT_MS", config.ready_timeout);
        config.reconnect_base_delay =
            env_millis("BOOKING_RECONNECT_BASE_MS", config.reconnect_base_delay);
        config.max_reconnect_attempts = env::var("BOOKING_RECONNECT_MAX_ATTEMPTS")
            .ok()
            .and_then(|value| value.trim().parse().ok())
            .unwrap_or(config.max_reconnect_attempts);
        config.token_refresh_reconnect_delay = env_millis(
            "BOOKING_TOKEN_REFRESH_RECONNECT_MS",
            config.token_refresh_reconnect_delay,
        );
        config.shutdown_reconnect_default = env::var("BOOKING_SHUTDOWN_RECONNECT_SECS")
            .ok()
            .and_then(|value| value.trim().parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(config.shutdown_reconnect_default);
        Ok(config)
    }

    /// Points the realtime channel at a different host than the API.
    pub fn with_realtime_url(mut self, realtime: &str) -> Result<Self, ConfigError> {
        self.realtime_url = normalize_realtime(realtime)?;
        Ok(self)
    }

    pub fn realtime(&self) -> RealtimeConfig {
        RealtimeConfig {
            url: self.realtime_url.clone(),
            reconnect_base_delay: self.reconnect_base_delay,
            max_reconnect_attempts: self.max_reconnect_attempts,
            token_refresh_reconnect_delay: self.token_refresh_reconnect_delay,
            shutdown_reconnect_default: self.shutdown_reconnect_default,
        }
    }
}

fn env_string(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_millis(key: &str, default: Duration) -> Duration {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}

/// Parses the API base, inferring a scheme when none is given and making
/// sure relative paths join beneath it.
pub fn normalize_base(raw: &str) -> Result<Url, ConfigError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ConfigError::Empty("api base url"));
    }
    let mut base = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("{}{trimmed}", infer_scheme(trimmed))
    };
    if !base.ends_with('/') {
        base.push('/');
    }
    let url = Url::parse(&base).map_err(|err| ConfigError::InvalidUrl {
        field: "api base url",
        message: err.to_string(),
    })?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(ConfigError::InvalidUrl {
            field: "api base url",
            message: format!("unsupported scheme '{other}'"),
        }),
    }
}

/// Same origin as the API, websocket scheme, fixed notifications path.
pub fn derive_realtime_url(api_base: &Url) -> Result<Url, ConfigError> {
    let mut url = api_base
        .join(&format!("/{REALTIME_PATH}"))
        .map_err(|err| ConfigError::InvalidUrl {
            field: "realtime url",
            message: err.to_string(),
        })?;
    to_websocket_scheme(&mut url)?;
    Ok(url)
}

fn normalize_realtime(raw: &str) -> Result<Url, ConfigError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ConfigError::Empty("realtime url"));
    }
    let with_scheme = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("{}{trimmed}", infer_scheme(trimmed))
    };
    let mut url = Url::parse(&with_scheme).map_err(|err| ConfigError::InvalidUrl {
        field: "realtime url",
        message: err.to_string(),
    })?;
    to_websocket_scheme(&mut url)?;
    if url.path() == "/" {
        url.set_path(REALTIME_PATH);
    }
    Ok(url)
}

fn to_websocket_scheme(url: &mut Url) -> Result<(), ConfigError> {
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(ConfigError::InvalidUrl {
                field: "realtime url",
                message: format!("unsupported scheme '{other}'"),
            });
        }
    };
    url.set_scheme(scheme).map_err(|_| ConfigError::InvalidUrl {
        field: "realtime url",
        message: format!("cannot switch {url} to {scheme}"),
    })
}

/// Plain http for loopback and private ranges, https for everything else.
fn infer_scheme(base: &str) -> &'static str {
    let host_part = base
        .split('/')
        .next()
        .unwrap_or(base)
        .trim_start_matches('[')
        .split(']')
        .next()
        .unwrap_or(base);
    let host_lower = host_part.to_ascii_lowercase();
    if host_lower.starts_with("localhost")
        || host_lower == "0.0.0.0"
        || host_lower.starts_with("127.")
        || host_lower == "::1"
        || host_lower.starts_with("10.")
        || host_lower.starts_with("192.168.")
        || host_lower
            .strip_prefix("172.")
            .and_then(|rest| rest.split('.').next())
            .and_then(|octet| octet.parse::<u8>().ok())
            .map(|octet| (16..32).contains(&octet))
            .unwrap_or(false)
    {
        "http://"
    } else {
        "https://"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{LazyLock, Mutex};

    static ENV_MUTEX: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

    const KEYS: &[&str] = &[
        "BOOKING_API_BASE",
        "BOOKING_REALTIME_URL",
        "BOOKING_RENEWAL_TIMEOUT_MS",
        "BOOKING_READY_TIMEOUT_MS",
        "BOOKING_RECONNECT_BASE_MS",
        "BOOKING_RECONNECT_MAX_ATTEMPTS",
        "BOOKING_TOKEN_REFRESH_RECONNECT_MS",
        "BOOKING_SHUTDOWN_RECONNECT_SECS",
    ];

    fn clear_env() {
        for key in KEYS {
            unsafe {
                env::remove_var(key);
            }
        }
    }

    #[test]
    fn infers_scheme_for_bare_hosts() {
        assert_eq!(
            normalize_base("localhost:8080/api").unwrap().as_str(),
            "http://localhost:8080/api/"
        );
        assert_eq!(
            normalize_base("172.20.0.4:8080").unwrap().scheme(),
            "http"
        );
        assert_eq!(
            normalize_base("booking.example.com/api/").unwrap().as_str(),
            "https://booking.example.com/api/"
        );
        assert!(normalize_base("   ").is_err());
        assert!(normalize_base("ftp://files.example.com").is_err());
    }

    #[test]
    fn realtime_url_follows_api_origin() {
        let secure = normalize_base("https://booking.example.com/api").unwrap();
        assert_eq!(
            derive_realtime_url(&secure).unwrap().as_str(),
            "wss://booking.example.com/ws/notifications"
        );
        let local = normalize_base("http://127.0.0.1:8080/api/").unwrap();
        assert_eq!(
            derive_realtime_url(&local).unwrap().as_str(),
            "ws://127.0.0.1:8080/ws/notifications"
        );
    }

    #[test]
    fn realtime_override_accepts_bare_host() {
        let config = LivenessConfig::new("https://booking.example.com/api/")
            .unwrap()
            .with_realtime_url("push.example.com")
            .unwrap();
        assert_eq!(
            config.realtime_url.as_str(),
            "wss://push.example.com/ws/notifications"
        );
        assert_eq!(config.realtime().url, config.realtime_url);
    }

    #[test]
    fn from_env_uses_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();

        let config = LivenessConfig::from_env().unwrap();
        assert_eq!(config.api_base.as_str(), DEFAULT_API_BASE);
        assert_eq!(
            config.realtime_url.as_str(),
            "ws://127.0.0.1:8080/ws/notifications"
        );
        assert_eq!(config.renewal_timeout, Duration::from_secs(5));
        assert_eq!(config.reconnect_base_delay, Duration::from_secs(1));
        assert_eq!(config.max_reconnect_attempts, 5);
        assert_eq!(config.shutdown_reconnect_default, Duration::from_secs(5));
    }

    #[test]
    fn from_env_reads_overrides() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();
        unsafe {
            env::set_var("BOOKING_API_BASE", "https://booking.example.com/api");
            env::set_var("BOOKING_REALTIME_URL", "wss://push.example.com/socket");
            env::set_var("BOOKING_RECONNECT_BASE_MS", "250");
            env::set_var("BOOKING_RECONNECT_MAX_ATTEMPTS", "8");
            env::set_var("BOOKING_SHUTDOWN_RECONNECT_SECS", "not-a-number");
        }

        let config = LivenessConfig::from_env().unwrap();
        clear_env();

        assert_eq!(config.api_base.as_str(), "https://booking.example.com/api/");
        assert_eq!(config.realtime_url.as_str(), "wss://push.example.com/socket");
        assert_eq!(config.reconnect_base_delay, Duration::from_millis(250));
        assert_eq!(config.max_reconnect_attempts, 8);
        assert_eq!(config.shutdown_reconnect_default, Duration::from_secs(5));
    }
}
