use std::future::Future;
use std::time::Duration;

use futures_util::stream::BoxStream;
use futures_util::{StreamExt, future};
use thiserror::Error;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderValue, header::AUTHORIZATION};
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::debug;
use url::Url;

use crate::config::{ConnectionSettings, PushTransport};

pub const USB_MONITOR_NAME: &str = "org.example.USBDeviceMonitor";
pub const USB_MONITOR_PATH: &str = "/org/example/USBDeviceMonitor";
pub const USB_MONITOR_INTERFACE: &str = "org.example.USBDeviceMonitor";
const USB_MONITOR_SIGNAL: &str = "SendMessage";
const USB_MONITOR_LIST: &str = "GetMountedDevices";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("no push channel configured")]
    NotConfigured,
    #[error("connection attempt timed out")]
    Timeout,
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    #[error("invalid credential header: {0}")]
    Header(#[from] tungstenite::http::header::InvalidHeaderValue),
    #[error("dbus error: {0}")]
    Dbus(#[from] zbus::Error),
    #[error("dbus error: {0}")]
    DbusFdo(#[from] zbus::fdo::Error),
    #[error("service {0} is not running")]
    ServiceUnavailable(&'static str),
}

/// Where and how to open the push channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushTarget {
    pub endpoint: Option<Url>,
    pub token: Option<String>,
}

impl PushTarget {
    pub fn from_settings(settings: &ConnectionSettings) -> Self {
        Self {
            endpoint: settings.push_endpoint(),
            token: settings.token.clone().filter(|token| !token.is_empty()),
        }
    }

    pub fn describe(&self) -> String {
        self.endpoint
            .as_ref()
            .map_or_else(|| "push channel".to_string(), Url::to_string)
    }
}

pub type PushStream = BoxStream<'static, Result<String, ChannelError>>;

/// An open push channel: devices already mounted at handshake time plus the
/// stream of raw messages that follows.
pub struct PushChannel {
    pub mounted: Vec<String>,
    pub messages: PushStream,
}

pub trait PushConnector: Send + Sync + 'static {
    fn open(
        &self,
        target: PushTarget,
    ) -> impl Future<Output = Result<PushChannel, ChannelError>> + Send;
}

#[derive(Debug, Clone, Default)]
pub struct WebSocketConnector;

impl PushConnector for WebSocketConnector {
    async fn open(&self, target: PushTarget) -> Result<PushChannel, ChannelError> {
        let endpoint = target.endpoint.ok_or(ChannelError::NotConfigured)?;
        let mut request = endpoint.as_str().into_client_request()?;
        if let Some(token) = &target.token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        let (stream, _response) = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(request))
            .await
            .map_err(|_| ChannelError::Timeout)??;
        debug!(%endpoint, "websocket handshake complete");

        let messages = stream
            .filter_map(|message| {
                future::ready(match message {
                    Ok(Message::Text(text)) => Some(Ok(text.as_str().to_string())),
                    Ok(Message::Binary(data)) => {
                        Some(Ok(String::from_utf8_lossy(&data).into_owned()))
                    }
                    Ok(_) => None,
                    Err(err) => Some(Err(ChannelError::from(err))),
                })
            })
            .boxed();
        Ok(PushChannel {
            mounted: Vec::new(),
            messages,
        })
    }
}

/// Subscribes to the USB monitor service on the system bus.
#[derive(Debug, Clone, Default)]
pub struct DbusConnector;

impl PushConnector for DbusConnector {
    async fn open(&self, _target: PushTarget) -> Result<PushChannel, ChannelError> {
        let connection = zbus::Connection::system().await?;
        let dbus = zbus::fdo::DBusProxy::new(&connection).await?;
        let name = zbus::names::BusName::try_from(USB_MONITOR_NAME).map_err(zbus::Error::from)?;
        if !dbus.name_has_owner(name).await? {
            return Err(ChannelError::ServiceUnavailable(USB_MONITOR_NAME));
        }

        let proxy = zbus::Proxy::new(
            &connection,
            USB_MONITOR_NAME,
            USB_MONITOR_PATH,
            USB_MONITOR_INTERFACE,
        )
        .await?;
        let mounted: Vec<String> = proxy.call(USB_MONITOR_LIST, &()).await?;
        let signals = proxy.receive_signal(USB_MONITOR_SIGNAL).await?;
        debug!(devices = mounted.len(), "subscribed to {USB_MONITOR_NAME}");

        let messages = signals
            .map(|message| {
                message
                    .body()
                    .deserialize::<String>()
                    .map_err(ChannelError::from)
            })
            .boxed();
        Ok(PushChannel { mounted, messages })
    }
}

/// The connector selected by configuration.
#[derive(Debug, Clone)]
pub enum AnyConnector {
    WebSocket(WebSocketConnector),
    Dbus(DbusConnector),
}

impl AnyConnector {
    pub fn for_transport(transport: PushTransport) -> Self {
        match transport {
            PushTransport::WebSocket => Self::WebSocket(WebSocketConnector),
            PushTransport::Dbus => Self::Dbus(DbusConnector),
        }
    }
}

impl PushConnector for AnyConnector {
    async fn open(&self, target: PushTarget) -> Result<PushChannel, ChannelError> {
        match self {
            Self::WebSocket(connector) => connector.open(target).await,
            Self::Dbus(connector) => connector.open(target).await,
        }
    }
}
