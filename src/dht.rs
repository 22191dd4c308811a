//! DHT client: resolves the overlay infohash into a set of peer endpoints.
//!
//! The client speaks a small JSON datagram protocol to a set of bootstrap
//! routers. An announce registers this node's infohash and overlay port; a
//! find request asks for the current co-members, and responses carry the
//! member list plus the requester's own observed endpoint, which is filtered
//! out of the snapshot so the local node never appears in its own catch.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::net::{lookup_host, UdpSocket};
use tracing::{debug, info, warn};

use crate::error::Result;

/// Bootstrap routers baked into the client.
pub const DEFAULT_ROUTERS: &[&str] = &["dht1.tapmesh.net:6881", "dht2.tapmesh.net:6881"];

/// Mutable client configuration. Obtain with [`DhtClient::config`], set the
/// network hash and overlay port, then pass to [`DhtClient::initialize`].
#[derive(Debug, Clone)]
pub struct DhtConfig {
    /// Infohash identifying the overlay.
    pub network_hash: String,
    /// UDP port the overlay engine listens on, advertised to routers.
    pub p2p_port: u16,
    /// Bootstrap routers queried for co-members.
    pub routers: Vec<String>,
}

impl Default for DhtConfig {
    fn default() -> Self {
        DhtConfig {
            network_hash: "none".to_string(),
            p2p_port: 0,
            routers: DEFAULT_ROUTERS.iter().map(|r| r.to_string()).collect(),
        }
    }
}

/// Control datagrams exchanged with routers.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum RouterMessage {
    /// Register this node under the infohash.
    Announce { hash: String, port: u16 },
    /// Ask for the current member list.
    Find { hash: String },
    /// Router response: members plus the requester's observed endpoint.
    Peers {
        hash: String,
        peers: Vec<String>,
        you: Option<String>,
    },
}

/// Source of peer endpoints for the membership loop.
#[async_trait]
pub trait PeerSource: Send + Sync {
    /// Trigger a refresh of the snapshot.
    async fn refresh(&self);

    /// The most recent snapshot of `"host:port"` endpoints.
    fn last_catch(&self) -> Vec<String>;
}

/// DHT client bound to its own control socket.
pub struct DhtClient {
    config: DhtConfig,
    socket: Arc<UdpSocket>,
    last_catch: RwLock<Vec<String>>,
    own_endpoint: RwLock<Option<String>>,
}

impl DhtClient {
    /// Mutable configuration with defaults.
    pub fn config() -> DhtConfig {
        DhtConfig::default()
    }

    /// Bind the control socket, announce to every router and start the
    /// response reader.
    pub async fn initialize(config: DhtConfig) -> Result<Arc<Self>> {
        let socket = Arc::new(UdpSocket::bind(("0.0.0.0", 0)).await?);
        let client = Arc::new(DhtClient {
            config,
            socket,
            last_catch: RwLock::new(Vec::new()),
            own_endpoint: RwLock::new(None),
        });

        client
            .send_to_routers(&RouterMessage::Announce {
                hash: client.config.network_hash.clone(),
                port: client.config.p2p_port,
            })
            .await;

        let reader = Arc::clone(&client);
        tokio::spawn(async move { reader.read_responses().await });

        info!(
            "DHT client initialized for overlay {}",
            client.config.network_hash
        );
        Ok(client)
    }

    /// Ask every router for the current member list. Responses are collected
    /// asynchronously into the snapshot.
    pub async fn update_peers(&self) {
        self.send_to_routers(&RouterMessage::Find {
            hash: self.config.network_hash.clone(),
        })
        .await;
    }

    async fn send_to_routers(&self, msg: &RouterMessage) {
        let payload = match serde_json::to_vec(msg) {
            Ok(p) => p,
            Err(e) => {
                warn!("failed to encode router message: {}", e);
                return;
            }
        };
        for router in &self.config.routers {
            // Routers may move behind DNS; resolve on every pass.
            match lookup_host(router.as_str()).await {
                Ok(mut addrs) => match addrs.next() {
                    Some(addr) => {
                        if let Err(e) = self.socket.send_to(&payload, addr).await {
                            warn!("failed to reach DHT router {}: {}", router, e);
                        }
                    }
                    None => warn!("DHT router {} resolved to no addresses", router),
                },
                Err(e) => warn!("failed to resolve DHT router {}: {}", router, e),
            }
        }
    }

    async fn read_responses(self: Arc<Self>) {
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let (n, src) = match self.socket.recv_from(&mut buf).await {
                Ok(v) => v,
                Err(e) => {
                    warn!("DHT control socket error: {}", e);
                    return;
                }
            };
            let msg: RouterMessage = match serde_json::from_slice(&buf[..n]) {
                Ok(m) => m,
                Err(e) => {
                    debug!("discarding malformed DHT response from {}: {}", src, e);
                    continue;
                }
            };
            if let RouterMessage::Peers { hash, peers, you } = msg {
                if hash != self.config.network_hash {
                    continue;
                }
                if let Some(observed) = you {
                    if let Ok(mut own) = self.own_endpoint.write() {
                        *own = Some(observed);
                    }
                }
                let own = self
                    .own_endpoint
                    .read()
                    .map(|g| g.clone())
                    .unwrap_or_default();
                let snapshot: Vec<String> = peers
                    .into_iter()
                    .filter(|p| Some(p) != own.as_ref())
                    .collect();
                debug!("DHT snapshot from {}: {} peers", src, snapshot.len());
                if let Ok(mut catch) = self.last_catch.write() {
                    *catch = snapshot;
                }
            }
        }
    }
}

#[async_trait]
impl PeerSource for DhtClient {
    async fn refresh(&self) {
        self.update_peers().await;
    }

    fn last_catch(&self) -> Vec<String> {
        self.last_catch.read().map(|g| g.clone()).unwrap_or_default()
    }
}
