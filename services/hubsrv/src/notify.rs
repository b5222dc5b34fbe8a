//! Event notifier
//!
//! Decoded bus events go to a home-automation server over its websocket API
//! as `call_service` messages. The connection is opened lazily, authenticated
//! when the server asks for it, and re-established with a ping/pong check
//! after a failed send.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use errors::{HubError, HubResult};

use crate::bus::events::BusEvent;

/// Receiver of decoded bus events
#[async_trait]
pub trait Notifier: Send + Sync + fmt::Debug {
    async fn notify(&self, router: u8, event: BusEvent);
}

/// Notifier that only logs; used when no subscriber is configured
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, router: u8, event: BusEvent) {
        debug!("Event alerted: router {} {:?}", router, event);
    }
}

/// Notifier feeding an in-process channel
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<(u8, BusEvent)>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<(u8, BusEvent)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl Notifier for ChannelNotifier {
    async fn notify(&self, router: u8, event: BusEvent) {
        if self.tx.send((router, event)).is_err() {
            debug!("Event receiver gone, dropping {:?}", event);
        }
    }
}

/// Websocket notifier configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct NotifierConfig {
    pub enabled: bool,
    /// e.g. `ws://192.168.0.10:8123/api/websocket`
    pub url: String,
    /// Access token; takes precedence over `token_file`
    pub token: Option<String>,
    /// File holding the access token
    pub token_file: Option<PathBuf>,
    /// Send the token as a bearer header instead of the auth message
    pub bearer_header: bool,
    /// Identifies this hub in every event
    pub hub_uid: String,
    pub reply_timeout_ms: u64,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: "ws://127.0.0.1:8123/api/websocket".to_string(),
            token: None,
            token_file: None,
            bearer_header: false,
            hub_uid: String::new(),
            reply_timeout_ms: 5000,
        }
    }
}

impl NotifierConfig {
    pub fn validate(&self) -> HubResult<()> {
        if self.enabled && !(self.url.starts_with("ws://") || self.url.starts_with("wss://")) {
            return Err(HubError::InvalidConfig {
                field: "notifier.url".to_string(),
                reason: format!("'{}' is not a websocket URL", self.url),
            });
        }
        Ok(())
    }

    /// Token from config or token file; `None` if neither yields one
    pub fn resolve_token(&self) -> Option<String> {
        if let Some(token) = self.token.as_ref().filter(|t| !t.is_empty()) {
            return Some(token.clone());
        }
        let path = self.token_file.as_ref()?;
        match std::fs::read_to_string(path) {
            Ok(content) => Some(content.trim().to_string()).filter(|t| !t.is_empty()),
            Err(e) => {
                error!(
                    "Failed to read token file {}, events can't be transmitted: {}",
                    path.display(),
                    e
                );
                None
            },
        }
    }
}

#[derive(Debug, Serialize)]
struct EventData<'a> {
    hub_uid: &'a str,
    rtr_nmbr: u8,
    mod_nmbr: u8,
    evnt_type: u8,
    evnt_arg1: u16,
    evnt_arg2: u16,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum OutgoingMessage<'a> {
    Auth {
        access_token: &'a str,
    },
    Ping {
        id: u64,
    },
    CallService {
        id: u64,
        domain: &'static str,
        service: &'static str,
        service_data: EventData<'a>,
    },
}

#[derive(Debug, Deserialize)]
struct IncomingMessage {
    #[serde(rename = "type")]
    kind: String,
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Notifier speaking the home-automation websocket API
pub struct WebsocketNotifier {
    config: NotifierConfig,
    socket: Mutex<Option<WsStream>>,
    next_id: AtomicU64,
}

impl fmt::Debug for WebsocketNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebsocketNotifier")
            .field("url", &self.config.url)
            .field("next_id", &self.next_id.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl WebsocketNotifier {
    pub fn new(config: NotifierConfig) -> Self {
        Self {
            config,
            socket: Mutex::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.config.reply_timeout_ms)
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    async fn open(&self) -> HubResult<WsStream> {
        let token = self.config.resolve_token().ok_or_else(|| {
            HubError::Configuration("websocket token is missing, can't open websocket".to_string())
        })?;

        let mut request = self
            .config
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| HubError::Configuration(format!("invalid websocket URL: {e}")))?;
        if self.config.bearer_header {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| HubError::Configuration(format!("invalid token: {e}")))?;
            request.headers_mut().insert("Authorization", value);
        }

        let (mut socket, _) = timeout(self.reply_timeout(), connect_async(request))
            .await
            .map_err(|_| HubError::ProtocolTimeout {
                target: self.config.url.clone(),
                timeout_ms: self.config.reply_timeout_ms,
            })?
            .map_err(|e| HubError::ConnectionFailed {
                endpoint: self.config.url.clone(),
                reason: e.to_string(),
            })?;

        let greeting = self.receive(&mut socket).await?;
        if greeting.kind == "auth_required" {
            let auth = serde_json::to_string(&OutgoingMessage::Auth {
                access_token: &token,
            })?;
            self.transmit(&mut socket, auth).await?;
            let reply = self.receive(&mut socket).await?;
            info!(
                "Websocket connected to {}, response: {}",
                self.config.url, reply.kind
            );
        } else {
            info!(
                "Websocket connected to {}, response: {}",
                self.config.url, greeting.kind
            );
        }
        Ok(socket)
    }

    async fn transmit(&self, socket: &mut WsStream, text: String) -> HubResult<()> {
        socket
            .send(Message::Text(text))
            .await
            .map_err(|e| HubError::Transport(format!("websocket send failed: {e}")))
    }

    /// Next text message, skipping control frames
    async fn receive(&self, socket: &mut WsStream) -> HubResult<IncomingMessage> {
        loop {
            let next = timeout(self.reply_timeout(), socket.next())
                .await
                .map_err(|_| HubError::ProtocolTimeout {
                    target: self.config.url.clone(),
                    timeout_ms: self.config.reply_timeout_ms,
                })?;
            match next {
                Some(Ok(Message::Text(text))) => {
                    debug!("Websocket returned {}", text);
                    return Ok(serde_json::from_str(&text)?);
                },
                Some(Ok(Message::Close(_))) | None => {
                    return Err(HubError::LinkClosed("websocket closed".to_string()));
                },
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    return Err(HubError::Transport(format!("websocket receive failed: {e}")))
                },
            }
        }
    }

    async fn call_service(&self, socket: &mut WsStream, router: u8, event: &BusEvent) -> HubResult<()> {
        let message = OutgoingMessage::CallService {
            id: self.next_id(),
            domain: "habitron",
            service: "update_entity",
            service_data: EventData {
                hub_uid: &self.config.hub_uid,
                rtr_nmbr: router,
                mod_nmbr: event.module,
                evnt_type: event.kind.code(),
                evnt_arg1: event.arg1,
                evnt_arg2: event.arg2,
            },
        };
        self.transmit(socket, serde_json::to_string(&message)?)
            .await?;
        let reply = self.receive(socket).await?;
        debug!("Notify returned {}", reply.kind);
        Ok(())
    }

    /// Reopen the socket and confirm it with a ping
    async fn ping_pong_reconnect(&self) -> HubResult<WsStream> {
        let mut socket = self.open().await?;
        let ping = serde_json::to_string(&OutgoingMessage::Ping { id: self.next_id() })?;
        self.transmit(&mut socket, ping).await?;
        let reply = self.receive(&mut socket).await?;
        if reply.kind != "pong" {
            return Err(HubError::Transport(format!(
                "expected pong from event server, received {}",
                reply.kind
            )));
        }
        debug!("Received pong from event server");
        Ok(socket)
    }
}

#[async_trait]
impl Notifier for WebsocketNotifier {
    async fn notify(&self, router: u8, event: BusEvent) {
        debug!("Event alerted: router {} {:?}", router, event);
        let mut guard = self.socket.lock().await;

        if guard.is_none() {
            match self.open().await {
                Ok(socket) => *guard = Some(socket),
                Err(e) => {
                    error!("Websocket connect failed: {}", e);
                    return;
                },
            }
        }

        if let Some(socket) = guard.as_mut() {
            match self.call_service(socket, router, &event).await {
                Ok(()) => return,
                Err(e) => error!("Could not send event to event server: {}", e),
            }
        }

        *guard = None;
        match self.ping_pong_reconnect().await {
            Ok(mut socket) => {
                if let Err(e) = self.call_service(&mut socket, router, &event).await {
                    warn!("Event retry failed: {}", e);
                    return;
                }
                *guard = Some(socket);
            },
            Err(e) => error!("Could not reconnect to event server: {}", e),
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::bus::events::EventType;
    use std::io::Write;

    #[test]
    fn test_call_service_json_shape() {
        let message = OutgoingMessage::CallService {
            id: 7,
            domain: "habitron",
            service: "update_entity",
            service_data: EventData {
                hub_uid: "hub-1",
                rtr_nmbr: 1,
                mod_nmbr: 5,
                evnt_type: EventType::Output.code(),
                evnt_arg1: 3,
                evnt_arg2: 1,
            },
        };
        let value: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&message).unwrap()).unwrap();
        assert_eq!(value["type"], "call_service");
        assert_eq!(value["id"], 7);
        assert_eq!(value["domain"], "habitron");
        assert_eq!(value["service"], "update_entity");
        assert_eq!(value["service_data"]["mod_nmbr"], 5);
        assert_eq!(value["service_data"]["evnt_type"], 3);
        assert_eq!(value["service_data"]["evnt_arg1"], 3);
    }

    #[test]
    fn test_auth_and_ping_json() {
        let auth = serde_json::to_string(&OutgoingMessage::Auth {
            access_token: "abc",
        })
        .unwrap();
        assert_eq!(auth, r#"{"type":"auth","access_token":"abc"}"#);
        let ping = serde_json::to_string(&OutgoingMessage::Ping { id: 2 }).unwrap();
        assert_eq!(ping, r#"{"type":"ping","id":2}"#);
    }

    #[test]
    fn test_token_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "  secret-token  ").unwrap();
        let config = NotifierConfig {
            token_file: Some(file.path().to_path_buf()),
            ..Default::default()
        };
        assert_eq!(config.resolve_token().as_deref(), Some("secret-token"));

        let config = NotifierConfig {
            token: Some("inline".to_string()),
            token_file: Some(file.path().to_path_buf()),
            ..Default::default()
        };
        assert_eq!(config.resolve_token().as_deref(), Some("inline"));

        assert_eq!(NotifierConfig::default().resolve_token(), None);
    }

    #[test]
    fn test_url_validation() {
        let config = NotifierConfig {
            enabled: true,
            url: "http://host".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
        assert!(NotifierConfig::default().validate().is_ok());
    }

    #[tokio::test]
    async fn test_channel_notifier_delivers() {
        let (notifier, mut rx) = ChannelNotifier::new();
        let event = BusEvent::new(5, EventType::Switch, 2, 1);
        notifier.notify(1, event).await;
        assert_eq!(rx.recv().await, Some((1, event)));
    }

    #[tokio::test]
    async fn test_unreachable_server_drops_event() {
        let config = NotifierConfig {
            enabled: true,
            url: "ws://127.0.0.1:1/api/websocket".to_string(),
            token: Some("t".to_string()),
            reply_timeout_ms: 200,
            ..Default::default()
        };
        let notifier = WebsocketNotifier::new(config);
        notifier
            .notify(1, BusEvent::new(1, EventType::Button, 1, 1))
            .await;
        assert!(notifier.socket.lock().await.is_none());
    }
}
