//! Router forwarding
//!
//! Routers on other hubs are reached by relaying API frames over TCP. The
//! table maps a router id to the IPv4 address of its hub and is persisted as
//! JSON next to the other data files.

use errors::{HubError, HubResult};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::api::commands::group;
use crate::protocol::network::{
    decode_network_frame, encode_network_response, read_raw_frame, NetworkHeader,
};

/// Bound for one remote exchange
pub const FORWARD_TIMEOUT: Duration = Duration::from_secs(20);

/// Command spec of a relayed frame
pub const FORWARD_SPEC: u16 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ForwardConfig {
    /// JSON file holding the table
    pub table_file: PathBuf,
    /// API port of the remote hubs
    pub remote_port: u16,
    pub timeout_secs: u64,
}

impl Default for ForwardConfig {
    fn default() -> Self {
        Self {
            table_file: PathBuf::from("data/forward.json"),
            remote_port: 7777,
            timeout_secs: FORWARD_TIMEOUT.as_secs(),
        }
    }
}

impl ForwardConfig {
    pub fn validate(&self) -> HubResult<()> {
        if self.remote_port == 0 {
            return Err(HubError::InvalidConfig {
                field: "forward.remote_port".to_string(),
                reason: "port must not be 0".to_string(),
            });
        }
        if self.timeout_secs == 0 {
            return Err(HubError::InvalidConfig {
                field: "forward.timeout_secs".to_string(),
                reason: "timeout must be positive".to_string(),
            });
        }
        Ok(())
    }
}

/// Router id to remote hub address
#[derive(Debug, Default)]
pub struct ForwardTable {
    entries: RwLock<BTreeMap<u8, Ipv4Addr>>,
    path: Option<PathBuf>,
}

impl ForwardTable {
    /// Table kept in memory only
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Load `path`, an absent file gives an empty table
    pub fn load(path: impl AsRef<Path>) -> HubResult<Self> {
        let path = path.as_ref().to_path_buf();
        let entries = if path.exists() {
            let text = std::fs::read_to_string(&path)?;
            if text.trim().is_empty() {
                BTreeMap::new()
            } else {
                serde_json::from_str(&text)?
            }
        } else {
            BTreeMap::new()
        };
        info!(
            "Forward table loaded from {}: {} entries",
            path.display(),
            entries.len()
        );
        Ok(Self {
            entries: RwLock::new(entries),
            path: Some(path),
        })
    }

    fn persist(&self, entries: &BTreeMap<u8, Ipv4Addr>) -> HubResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(entries)?)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Add a new mapping; an existing one is left untouched
    pub fn add(&self, router: u8, addr: Ipv4Addr) -> HubResult<()> {
        let mut entries = self.entries.write();
        if entries.contains_key(&router) {
            return Err(HubError::AlreadyExists(format!(
                "forward entry for router {router}"
            )));
        }
        entries.insert(router, addr);
        self.persist(&entries)?;
        info!("Forward router {} -> {}", router, addr);
        Ok(())
    }

    /// Insert or replace a mapping
    pub fn set(&self, router: u8, addr: Ipv4Addr) -> HubResult<Option<Ipv4Addr>> {
        let mut entries = self.entries.write();
        let old = entries.insert(router, addr);
        self.persist(&entries)?;
        info!("Forward router {} -> {} (was {:?})", router, addr, old);
        Ok(old)
    }

    pub fn delete(&self, router: u8) -> HubResult<Ipv4Addr> {
        let mut entries = self.entries.write();
        let old = entries.remove(&router).ok_or_else(|| HubError::NotFound {
            resource: format!("forward entry for router {router}"),
        })?;
        self.persist(&entries)?;
        info!("Forward entry for router {} removed", router);
        Ok(old)
    }

    pub fn lookup(&self, router: u8) -> Option<Ipv4Addr> {
        self.entries.read().get(&router).copied()
    }

    pub fn entries(&self) -> BTreeMap<u8, Ipv4Addr> {
        self.entries.read().clone()
    }
}

/// Relays frames to remote hubs
#[derive(Debug)]
pub struct ForwardRelay {
    table: Arc<ForwardTable>,
    port: u16,
    timeout: Duration,
}

impl ForwardRelay {
    pub fn new(table: Arc<ForwardTable>, port: u16, timeout: Duration) -> Self {
        Self {
            table,
            port,
            timeout,
        }
    }

    pub fn from_config(table: Arc<ForwardTable>, config: &ForwardConfig) -> Self {
        Self::new(
            table,
            config.remote_port,
            Duration::from_secs(config.timeout_secs),
        )
    }

    pub fn table(&self) -> &Arc<ForwardTable> {
        &self.table
    }

    fn remote(&self, router: u8) -> HubResult<SocketAddr> {
        let ip = self.table.lookup(router).ok_or_else(|| HubError::NotFound {
            resource: format!("forward entry for router {router}"),
        })?;
        Ok(SocketAddr::from((ip, self.port)))
    }

    /// Send `body` to the hub owning `router` and return its answer data
    pub async fn relay(&self, router: u8, body: &[u8]) -> HubResult<Vec<u8>> {
        let remote = self.remote(router)?;
        let header = NetworkHeader::new(group::FORWARD, FORWARD_SPEC, router, 0);
        let request = encode_network_response(&header, body)?;

        let exchange = async {
            let mut stream = TcpStream::connect(remote).await?;
            stream.write_all(&request).await?;
            stream.flush().await?;
            let raw = read_raw_frame(&mut stream).await?;
            Ok::<_, std::io::Error>(raw)
        };
        let raw = tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| HubError::ProtocolTimeout {
                target: remote.to_string(),
                timeout_ms: self.timeout.as_millis() as u64,
            })?
            .map_err(|e| HubError::ConnectionFailed {
                endpoint: remote.to_string(),
                reason: e.to_string(),
            })?;

        let reply = decode_network_frame(&raw)?;
        debug!(
            "Forward to router {} at {}: {} bytes answered",
            router,
            remote,
            reply.data.len()
        );
        Ok(reply.data)
    }

    /// Pass a forward response received from the bus back to its origin
    ///
    /// The first payload byte names the router whose hub asked.
    pub async fn send_forward_response(&self, payload: &[u8]) -> HubResult<()> {
        let Some(&router) = payload.first() else {
            warn!("Empty forward response dropped");
            return Ok(());
        };
        let answer = self.relay(router, payload).await?;
        debug!(
            "Forward response for router {} delivered, remote replied {} bytes",
            router,
            answer.len()
        );
        Ok(())
    }
}
