use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tokio::fs;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::ConfigError;

pub const TOPIC_PREFIX: &str = "manhquan/device/mppt_charger/log";
pub const DEFAULT_PATH: &str = "/mppt";
pub const DEFAULT_DEVICE_NAME: &str = "MPPT SmartSolar";
pub const DEFAULT_DEVICE_CLASS: &str = "45a";
pub const DEFAULT_RESET_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_USERNAME: &str = "web_app";
pub const DEFAULT_PASSWORD: &str = "Abc@13579";

/// Charger model tag. The 40A model publishes under the 45A topic segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceClass {
    A40,
    A45,
    A60,
}

impl DeviceClass {
    pub fn topic_segment(&self) -> &'static str {
        match self {
            DeviceClass::A40 | DeviceClass::A45 => "45a",
            DeviceClass::A60 => "60a",
        }
    }
}

impl FromStr for DeviceClass {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "40a" => Ok(DeviceClass::A40),
            "45a" => Ok(DeviceClass::A45),
            "60a" => Ok(DeviceClass::A60),
            _ => Err(ConfigError::UnknownDeviceClass(s.to_string())),
        }
    }
}

pub fn resolve_topic(class: DeviceClass, device_id: &str) -> String {
    format!("{TOPIC_PREFIX}/{}/{device_id}", class.topic_segment())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TlsPolicy {
    /// Plain `ws://`
    Disabled,
    /// `wss://` checked against the platform root store
    Verify,
    /// `wss://` without certificate validation, what the cloud service needs today
    #[default]
    NoVerify,
}

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Bounded reconnect with exponential backoff. `max_attempts: 0` keeps the
/// connector's default behavior of stopping on the first connection error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_secs: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            initial_delay_ms: 1000,
            max_delay_secs: 60,
        }
    }
}

impl ReconnectPolicy {
    pub fn enabled(&self) -> bool {
        self.max_attempts > 0
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        let delay = Duration::from_millis(self.initial_delay_ms.saturating_mul(factor));
        delay.min(Duration::from_secs(self.max_delay_secs))
    }
}

/// Port as typed by a human: `443` and `"443"` are both accepted.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum PortValue {
    Number(i64),
    Text(String),
}

impl PortValue {
    fn to_port(&self) -> Result<u16, ConfigError> {
        let port = match self {
            PortValue::Number(n) => *n,
            PortValue::Text(s) => s
                .trim()
                .parse::<i64>()
                .map_err(|_| ConfigError::invalid("port", format!("'{s}' is not a number")))?,
        };
        u16::try_from(port)
            .ok()
            .filter(|p| *p != 0)
            .ok_or_else(|| ConfigError::invalid("port", format!("{port} is out of range")))
    }
}

/// One device entry as written in the YAML file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SessionConf {
    pub id: Option<String>,
    pub host: Option<String>,
    port: Option<PortValue>,
    pub path: Option<String>,
    pub device_class: Option<String>,
    pub device_id: Option<String>,
    pub device_name: Option<String>,
    pub reset_timeout: Option<u64>,
    pub watchdog_period_secs: Option<u64>,
    pub username: Option<String>,
    pub password: Option<String>,
    #[serde(default)]
    pub tls: TlsPolicy,
    #[serde(default)]
    pub reconnect: ReconnectPolicy,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub sessions: Vec<SessionConf>,
}

/// Validated parameters of one device session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub path: String,
    pub device_class: DeviceClass,
    pub device_id: String,
    pub device_name: String,
    pub reset_timeout: Duration,
    pub watchdog_period: Duration,
    pub credentials: Option<Credentials>,
    pub tls: TlsPolicy,
    pub reconnect: ReconnectPolicy,
}

impl SessionConfig {
    pub fn topic(&self) -> String {
        resolve_topic(self.device_class, &self.device_id)
    }

    pub fn client_id(&self) -> String {
        format!("mppt_{}", self.device_id)
    }

    pub fn broker_url(&self) -> String {
        let scheme = match self.tls {
            TlsPolicy::Disabled => "ws",
            TlsPolicy::Verify | TlsPolicy::NoVerify => "wss",
        };
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("{scheme}://[{}]:{}{}", self.host, self.port, self.path)
        } else {
            format!("{scheme}://{}:{}{}", self.host, self.port, self.path)
        }
    }
}

impl SessionConf {
    fn apply_env_overrides(&mut self, env: &impl Fn(&str) -> Option<String>) {
        if let Some(host) = env("MPPT_HOST") {
            self.host = Some(host);
        }
        if let Some(port) = env("MPPT_PORT") {
            self.port = Some(PortValue::Text(port));
        }
        if let Some(device_id) = env("MPPT_DEVICE_ID") {
            self.device_id = Some(device_id);
        }
        if let Some(username) = env("MPPT_USERNAME") {
            self.username = Some(username);
        }
        if let Some(password) = env("MPPT_PASSWORD") {
            self.password = Some(password);
        }
    }

    pub fn resolve(self) -> Result<SessionConfig, ConfigError> {
        let host = self
            .host
            .map(|h| h.trim().to_string())
            .filter(|h| !h.is_empty())
            .ok_or_else(|| ConfigError::invalid("host", "required"))?;
        let port = self
            .port
            .as_ref()
            .ok_or_else(|| ConfigError::invalid("port", "required"))?
            .to_port()?;

        let path = self.path.unwrap_or_else(|| DEFAULT_PATH.to_string());
        if !path.starts_with('/') {
            return Err(ConfigError::invalid("path", "must start with '/'"));
        }

        let device_class: DeviceClass = self
            .device_class
            .as_deref()
            .unwrap_or(DEFAULT_DEVICE_CLASS)
            .parse()?;

        let device_id = match self.device_id.filter(|id| !id.trim().is_empty()) {
            Some(id) => id.trim().to_string(),
            None => {
                let generated = format!("mppt-{}", &Uuid::new_v4().simple().to_string()[..8]);
                warn!(device_id = %generated, "no device_id configured, generated one; the topic will not match a real charger");
                generated
            }
        };

        let reset_timeout = self.reset_timeout.unwrap_or(DEFAULT_RESET_TIMEOUT_SECS);
        if reset_timeout == 0 {
            return Err(ConfigError::invalid("reset_timeout", "must be at least 1 second"));
        }
        let watchdog_period = self.watchdog_period_secs.unwrap_or(1);
        if !(1..=5).contains(&watchdog_period) {
            return Err(ConfigError::invalid("watchdog_period_secs", "must be between 1 and 5"));
        }

        let username = self.username.unwrap_or_else(|| DEFAULT_USERNAME.to_string());
        let credentials = if username.is_empty() {
            None
        } else {
            Some(Credentials {
                username,
                password: self.password.unwrap_or_else(|| DEFAULT_PASSWORD.to_string()),
            })
        };

        Ok(SessionConfig {
            id: self.id.unwrap_or_else(|| device_id.clone()),
            host,
            port,
            path,
            device_class,
            device_id,
            device_name: self
                .device_name
                .unwrap_or_else(|| DEFAULT_DEVICE_NAME.to_string()),
            reset_timeout: Duration::from_secs(reset_timeout),
            watchdog_period: Duration::from_secs(watchdog_period),
            credentials,
            tls: self.tls,
            reconnect: self.reconnect,
        })
    }
}

impl ConfigFile {
    /// Env overrides target the first session; with no session in the file
    /// but `MPPT_HOST` set, a session is built from the environment alone.
    pub fn apply_env_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        if self.sessions.is_empty() && env("MPPT_HOST").is_some() {
            self.sessions.push(SessionConf::default());
        }
        if let Some(first) = self.sessions.first_mut() {
            first.apply_env_overrides(&env);
        }
    }

    pub fn resolve(self) -> Result<Vec<SessionConfig>, ConfigError> {
        if self.sessions.is_empty() {
            return Err(ConfigError::NoSessions);
        }

        let sessions = self
            .sessions
            .into_iter()
            .map(SessionConf::resolve)
            .collect::<Result<Vec<_>, _>>()?;

        let mut ids = HashSet::new();
        for session in &sessions {
            if !ids.insert(session.id.as_str()) {
                return Err(ConfigError::DuplicateSession(session.id.clone()));
            }
        }
        Ok(sessions)
    }
}

pub fn parse_config(
    text: &str,
    env: impl Fn(&str) -> Option<String>,
) -> Result<Vec<SessionConfig>, ConfigError> {
    let mut file: ConfigFile = if text.trim().is_empty() {
        ConfigFile::default()
    } else {
        serde_yaml::from_str(text)?
    };
    file.apply_env_overrides(env);
    file.resolve()
}

/// Reads `MPPT_BRIDGE_CONFIG` (default `mppt-bridge.yaml`). A missing file
/// is fine when the environment describes the device.
pub async fn load_config() -> Result<Vec<SessionConfig>, ConfigError> {
    let path = std::env::var("MPPT_BRIDGE_CONFIG").unwrap_or_else(|_| "mppt-bridge.yaml".into());

    let text = if Path::new(&path).exists() {
        fs::read_to_string(&path).await.map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?
    } else {
        info!("no {path}, using environment only");
        String::new()
    };

    parse_config(&text, |key| std::env::var(key).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn test_topic_resolution() {
        assert_eq!(
            resolve_topic(DeviceClass::A40, "X"),
            "manhquan/device/mppt_charger/log/45a/X"
        );
        assert_eq!(
            resolve_topic(DeviceClass::A45, "X"),
            "manhquan/device/mppt_charger/log/45a/X"
        );
        assert_eq!(
            resolve_topic(DeviceClass::A60, "X"),
            "manhquan/device/mppt_charger/log/60a/X"
        );
    }

    #[test]
    fn test_defaults() {
        let sessions = parse_config(
            "sessions:\n  - host: mqttx.smartsolar.io.vn\n    port: 443\n    device_id: abc123\n",
            no_env,
        )
        .unwrap();
        let s = &sessions[0];

        assert_eq!(s.id, "abc123");
        assert_eq!(s.path, "/mppt");
        assert_eq!(s.device_class, DeviceClass::A45);
        assert_eq!(s.device_name, "MPPT SmartSolar");
        assert_eq!(s.reset_timeout, Duration::from_secs(60));
        assert_eq!(s.watchdog_period, Duration::from_secs(1));
        assert_eq!(s.tls, TlsPolicy::NoVerify);
        assert!(!s.reconnect.enabled());
        assert_eq!(s.credentials.as_ref().unwrap().username, "web_app");
        assert_eq!(s.topic(), "manhquan/device/mppt_charger/log/45a/abc123");
        assert_eq!(s.client_id(), "mppt_abc123");
        assert_eq!(s.broker_url(), "wss://mqttx.smartsolar.io.vn:443/mppt");
    }

    #[test]
    fn test_port_coercion_and_range() {
        let yaml = |port: &str| format!("sessions:\n  - host: h\n    port: {port}\n    device_id: d\n");
        assert_eq!(parse_config(&yaml("\"8084\""), no_env).unwrap()[0].port, 8084);
        assert!(matches!(
            parse_config(&yaml("\"eighty\""), no_env),
            Err(ConfigError::Invalid { .. })
        ));
        assert!(matches!(
            parse_config(&yaml("70000"), no_env),
            Err(ConfigError::Invalid { .. })
        ));
        assert!(matches!(
            parse_config("sessions:\n  - host: h\n", no_env),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[test]
    fn test_unknown_device_class_is_rejected() {
        let result = parse_config(
            "sessions:\n  - host: h\n    port: 1\n    device_class: 50a\n",
            no_env,
        );
        assert!(matches!(result, Err(ConfigError::UnknownDeviceClass(tag)) if tag == "50a"));
    }

    #[test]
    fn test_empty_username_means_anonymous_and_plain_ws() {
        let sessions = parse_config(
            "sessions:\n  - host: h\n    port: 80\n    device_id: d\n    username: \"\"\n    tls: disabled\n",
            no_env,
        )
        .unwrap();
        assert!(sessions[0].credentials.is_none());
        assert_eq!(sessions[0].broker_url(), "ws://h:80/mppt");
    }

    #[test]
    fn test_ipv6_host_is_bracketed_in_url() {
        let yaml = |host: &str| {
            format!("sessions:\n  - host: \"{host}\"\n    port: 80\n    device_id: d\n    tls: disabled\n")
        };
        let sessions = parse_config(&yaml("::1"), no_env).unwrap();
        assert_eq!(sessions[0].broker_url(), "ws://[::1]:80/mppt");
        let sessions = parse_config(&yaml("[::1]"), no_env).unwrap();
        assert_eq!(sessions[0].broker_url(), "ws://[::1]:80/mppt");
    }

    #[test]
    fn test_env_only_configuration() {
        let env: HashMap<&str, &str> = [
            ("MPPT_HOST", "broker.local"),
            ("MPPT_PORT", "8083"),
            ("MPPT_DEVICE_ID", "dev9"),
            ("MPPT_USERNAME", "me"),
            ("MPPT_PASSWORD", "secret"),
        ]
        .into_iter()
        .collect();
        let sessions = parse_config("", |k| env.get(k).map(|v| v.to_string())).unwrap();

        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].host, "broker.local");
        assert_eq!(sessions[0].port, 8083);
        let creds = sessions[0].credentials.clone().unwrap();
        assert_eq!(creds.password, "secret");
        assert!(!format!("{creds:?}").contains("secret"));
    }

    #[test]
    fn test_validation_errors() {
        assert!(matches!(parse_config("", no_env), Err(ConfigError::NoSessions)));
        assert!(matches!(
            parse_config(
                "sessions:\n  - {host: h, port: 1, device_id: a}\n  - {host: h, port: 1, device_id: a}\n",
                no_env
            ),
            Err(ConfigError::DuplicateSession(id)) if id == "a"
        ));
        assert!(matches!(
            parse_config("sessions:\n  - {host: h, port: 1, reset_timeout: 0}\n", no_env),
            Err(ConfigError::Invalid { .. })
        ));
        assert!(matches!(
            parse_config("sessions:\n  - {host: h, port: 1, watchdog_period_secs: 9}\n", no_env),
            Err(ConfigError::Invalid { .. })
        ));
        assert!(matches!(
            parse_config("sessions:\n  - {host: h, port: 1, path: mppt}\n", no_env),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[test]
    fn test_reconnect_backoff_is_capped() {
        let policy = ReconnectPolicy {
            max_attempts: 10,
            initial_delay_ms: 500,
            max_delay_secs: 3,
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for(2), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(3), Duration::from_millis(2000));
        assert_eq!(policy.delay_for(4), Duration::from_secs(3));
        assert_eq!(policy.delay_for(40), Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_load_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bridge.yaml");
        std::fs::write(
            &path,
            "sessions:\n  - {id: roof, host: h, port: 443, device_class: 60a, device_id: r1}\n",
        )
        .unwrap();
        std::env::set_var("MPPT_BRIDGE_CONFIG", &path);

        let sessions = load_config().await.unwrap();
        std::env::remove_var("MPPT_BRIDGE_CONFIG");

        assert_eq!(sessions[0].id, "roof");
        assert_eq!(sessions[0].topic(), "manhquan/device/mppt_charger/log/60a/r1");
    }
}
