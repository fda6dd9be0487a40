use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use filebox_core::FileboxClient;
use thiserror::Error;
use tokio::sync::watch;
use url::Url;

const DEFAULT_DOWNLOAD_DIR_NAME: &str = "Downloads";
const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;
const DEFAULT_RECONNECT_SECS: u64 = 5;
const DEFAULT_UPLOAD_MAX_BYTES: u64 = 1024 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {name}: {source}")]
    InvalidUrl {
        name: &'static str,
        #[source]
        source: url::ParseError,
    },
    #[error("unsupported push transport: {0}")]
    UnknownTransport(String),
    #[error("unsupported poll mode: {0}")]
    UnknownPollMode(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushTransport {
    WebSocket,
    Dbus,
}

impl FromStr for PushTransport {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "websocket" | "ws" => Ok(Self::WebSocket),
            "dbus" | "d-bus" => Ok(Self::Dbus),
            other => Err(ConfigError::UnknownTransport(other.to_string())),
        }
    }
}

/// When the snapshot poller is allowed to run. A credential is required in
/// both modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollMode {
    Always,
    /// Only while the push channel is not connected.
    Fallback,
}

impl FromStr for PollMode {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "always" => Ok(Self::Always),
            "fallback" => Ok(Self::Fallback),
            other => Err(ConfigError::UnknownPollMode(other.to_string())),
        }
    }
}

/// Connection parameters that may change while the client is running.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionSettings {
    pub base_url: Option<Url>,
    pub push_url: Option<Url>,
    pub token: Option<String>,
}

impl ConnectionSettings {
    pub fn has_token(&self) -> bool {
        self.token.as_deref().is_some_and(|token| !token.is_empty())
    }

    /// The explicit push URL, or `ws://<host>/ws` derived from the base URL.
    pub fn push_endpoint(&self) -> Option<Url> {
        self.push_url
            .clone()
            .or_else(|| self.base_url.as_ref().and_then(derive_push_url))
    }

    pub fn client(&self, http: &reqwest::Client) -> Option<FileboxClient> {
        let base_url = self.base_url.clone()?;
        Some(FileboxClient::from_url(
            http.clone(),
            base_url,
            self.token.clone(),
        ))
    }
}

pub fn derive_push_url(base: &Url) -> Option<Url> {
    let scheme = match base.scheme() {
        "https" | "wss" => "wss",
        _ => "ws",
    };
    let host = base.host_str()?;
    let mut url = Url::parse(&format!("{scheme}://{host}/ws")).ok()?;
    url.set_port(base.port()).ok()?;
    Some(url)
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub connection: ConnectionSettings,
    pub push_transport: PushTransport,
    pub poll_mode: PollMode,
    pub poll_interval: Duration,
    pub reconnect_interval: Duration,
    pub download_dir: PathBuf,
    pub upload_max_bytes: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionSettings::default(),
            push_transport: PushTransport::WebSocket,
            poll_mode: PollMode::Always,
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            reconnect_interval: Duration::from_secs(DEFAULT_RECONNECT_SECS),
            download_dir: default_download_dir(),
            upload_max_bytes: DEFAULT_UPLOAD_MAX_BYTES,
        }
    }
}

impl ClientConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let base_url = read_url(
            "FILEBOX_API_BASE_URL",
            lookup("FILEBOX_API_BASE_URL").or_else(|| lookup("API_BASE_URL")),
        )?;
        let push_url = read_url("FILEBOX_PUSH_URL", lookup("FILEBOX_PUSH_URL"))?;
        let token = lookup("FILEBOX_TOKEN").filter(|token| !token.trim().is_empty());
        let push_transport = match lookup("FILEBOX_PUSH_TRANSPORT") {
            Some(value) => value.parse()?,
            None => PushTransport::WebSocket,
        };
        let poll_mode = match lookup("FILEBOX_POLL_MODE") {
            Some(value) => value.parse()?,
            None => PollMode::Always,
        };
        let poll_interval = Duration::from_millis(read_u64(
            &lookup,
            "FILEBOX_POLL_INTERVAL_MS",
            DEFAULT_POLL_INTERVAL_MS,
        ));
        let reconnect_interval = Duration::from_secs(read_u64(
            &lookup,
            "FILEBOX_RECONNECT_SECS",
            DEFAULT_RECONNECT_SECS,
        ));
        let download_dir = match (lookup("FILEBOX_DOWNLOAD_DIR"), dirs::home_dir()) {
            (Some(value), Some(home)) => expand_with_home(&value, &home),
            (Some(value), None) => PathBuf::from(value),
            (None, _) => default_download_dir(),
        };
        let upload_max_bytes = read_u64(
            &lookup,
            "FILEBOX_UPLOAD_MAX_BYTES",
            DEFAULT_UPLOAD_MAX_BYTES,
        );

        Ok(Self {
            connection: ConnectionSettings {
                base_url,
                push_url,
                token,
            },
            push_transport,
            poll_mode,
            poll_interval,
            reconnect_interval,
            download_dir,
            upload_max_bytes,
        })
    }
}

/// Publishes [`ConnectionSettings`] changes to every running component.
#[derive(Clone)]
pub struct SettingsHandle {
    tx: Arc<watch::Sender<ConnectionSettings>>,
}

impl SettingsHandle {
    pub fn new(initial: ConnectionSettings) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx: Arc::new(tx) }
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionSettings> {
        self.tx.subscribe()
    }

    pub fn current(&self) -> ConnectionSettings {
        self.tx.borrow().clone()
    }

    /// An empty token clears the credential.
    pub fn set_token(&self, token: impl Into<String>) {
        let token = Some(token.into()).filter(|token| !token.is_empty());
        self.tx.send_if_modified(|settings| {
            if settings.token == token {
                return false;
            }
            settings.token = token;
            true
        });
    }

    pub fn set_base_url(&self, base_url: Option<Url>) {
        self.tx.send_if_modified(|settings| {
            if settings.base_url == base_url {
                return false;
            }
            settings.base_url = base_url;
            true
        });
    }

    pub fn set_push_url(&self, push_url: Option<Url>) {
        self.tx.send_if_modified(|settings| {
            if settings.push_url == push_url {
                return false;
            }
            settings.push_url = push_url;
            true
        });
    }
}

fn default_download_dir() -> PathBuf {
    dirs::download_dir()
        .or_else(|| dirs::home_dir().map(|home| home.join(DEFAULT_DOWNLOAD_DIR_NAME)))
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("."))
}

fn read_url(name: &'static str, value: Option<String>) -> Result<Option<Url>, ConfigError> {
    match value.filter(|value| !value.trim().is_empty()) {
        Some(value) => Url::parse(value.trim())
            .map(Some)
            .map_err(|source| ConfigError::InvalidUrl { name, source }),
        None => Ok(None),
    }
}

fn read_u64<F>(lookup: &F, name: &str, default: u64) -> u64
where
    F: Fn(&str) -> Option<String>,
{
    lookup(name)
        .and_then(|value| value.trim().parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

pub(crate) fn expand_with_home(value: &str, home: &Path) -> PathBuf {
    if value == "~" {
        return home.to_path_buf();
    }
    if let Some(rest) = value.strip_prefix("~/") {
        return home.join(rest);
    }
    PathBuf::from(value)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_when_environment_is_empty() {
        let config = ClientConfig::from_lookup(lookup_from(&[])).unwrap();
        assert_eq!(config.connection, ConnectionSettings::default());
        assert_eq!(config.push_transport, PushTransport::WebSocket);
        assert_eq!(config.poll_mode, PollMode::Always);
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert_eq!(config.reconnect_interval, Duration::from_secs(5));
        assert_eq!(config.upload_max_bytes, 1024 * 1024 * 1024);
    }

    #[test]
    fn reads_connection_and_tuning_values() {
        let config = ClientConfig::from_lookup(lookup_from(&[
            ("API_BASE_URL", "http://192.168.1.102:8080"),
            ("FILEBOX_TOKEN", "secret"),
            ("FILEBOX_PUSH_TRANSPORT", "dbus"),
            ("FILEBOX_POLL_MODE", "fallback"),
            ("FILEBOX_POLL_INTERVAL_MS", "250"),
            ("FILEBOX_RECONNECT_SECS", "0"),
            ("FILEBOX_DOWNLOAD_DIR", "/tmp/dl"),
        ]))
        .unwrap();

        assert_eq!(
            config.connection.base_url.as_ref().map(Url::as_str),
            Some("http://192.168.1.102:8080/")
        );
        assert!(config.connection.has_token());
        assert_eq!(config.push_transport, PushTransport::Dbus);
        assert_eq!(config.poll_mode, PollMode::Fallback);
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert_eq!(config.reconnect_interval, Duration::from_secs(5));
        assert_eq!(config.download_dir, PathBuf::from("/tmp/dl"));
    }

    #[test]
    fn rejects_invalid_base_url() {
        let err = ClientConfig::from_lookup(lookup_from(&[("FILEBOX_API_BASE_URL", "not a url")]))
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidUrl {
                name: "FILEBOX_API_BASE_URL",
                ..
            }
        ));
    }

    #[test]
    fn push_endpoint_is_derived_from_base_url() {
        let settings = ConnectionSettings {
            base_url: Some(Url::parse("http://nas.local:8080/api").unwrap()),
            ..ConnectionSettings::default()
        };
        assert_eq!(
            settings.push_endpoint().unwrap().as_str(),
            "ws://nas.local:8080/ws"
        );

        let secure = ConnectionSettings {
            base_url: Some(Url::parse("https://nas.example").unwrap()),
            ..ConnectionSettings::default()
        };
        assert_eq!(
            secure.push_endpoint().unwrap().as_str(),
            "wss://nas.example/ws"
        );
    }

    #[test]
    fn explicit_push_url_wins() {
        let settings = ConnectionSettings {
            base_url: Some(Url::parse("http://nas.local").unwrap()),
            push_url: Some(Url::parse("ws://events.local:9000/usb").unwrap()),
            token: None,
        };
        assert_eq!(
            settings.push_endpoint().unwrap().as_str(),
            "ws://events.local:9000/usb"
        );
    }

    #[test]
    fn settings_handle_only_notifies_on_change() {
        let handle = SettingsHandle::new(ConnectionSettings::default());
        let mut rx = handle.subscribe();
        assert!(!rx.has_changed().unwrap());

        handle.set_token("");
        assert!(!rx.has_changed().unwrap());

        handle.set_token("abc");
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().token.as_deref(), Some("abc"));

        handle.set_token("abc");
        assert!(!rx.has_changed().unwrap());
    }

    #[test]
    fn expands_tilde_to_home() {
        let home = PathBuf::from("/tmp/home-user");
        assert_eq!(
            expand_with_home("~/Downloads", &home),
            PathBuf::from("/tmp/home-user/Downloads")
        );
        assert_eq!(expand_with_home("~", &home), home);
    }
}
