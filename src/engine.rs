//! The overlay node engine.
//!
//! Ties together the TAP interface, the UDP transport, the peer table and the
//! DHT-fed membership loop. Frames written to the TAP by local applications
//! are classified by EtherType and routed to a handshaked peer by destination
//! MAC; inbound overlay messages either complete a handshake or decapsulate
//! into the TAP. A timed loop reconciles the peer table against the DHT's
//! latest catch and introduces the node to newly discovered peers.

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::lookup_host;
use tracing::{debug, error, info, warn};

use crate::config::NodeConfig;
use crate::dht::PeerSource;
use crate::error::Result;
use crate::frame::{self, FrameClass};
use crate::peer::PeerTable;
use crate::proto::{self, MsgType, OverlayMessage};
use crate::tap::{FrameIo, TapFrame};
use crate::transport::{DatagramHandler, UdpTransport};

/// Delay before each DHT refresh.
const MEMBERSHIP_INTERVAL: Duration = Duration::from_secs(3);

/// Grace period for DHT responses to arrive after a refresh.
const DHT_SETTLE: Duration = Duration::from_secs(2);

/// The overlay node engine. Owns the peer table; everything else is shared.
pub struct OverlayEngine {
    config: NodeConfig,
    peers: PeerTable,
    transport: Arc<UdpTransport>,
    tap: Arc<dyn FrameIo>,
    peer_source: Arc<dyn PeerSource>,
    local_ips: Vec<IpAddr>,
}

impl OverlayEngine {
    pub fn new(
        config: NodeConfig,
        transport: Arc<UdpTransport>,
        tap: Arc<dyn FrameIo>,
        peer_source: Arc<dyn PeerSource>,
        local_ips: Vec<IpAddr>,
    ) -> Arc<Self> {
        Arc::new(OverlayEngine {
            config,
            peers: PeerTable::new(),
            transport,
            tap,
            peer_source,
            local_ips,
        })
    }

    pub fn peers(&self) -> &PeerTable {
        &self.peers
    }

    /// Global-unicast addresses of this host, reserved for direct peering.
    pub fn local_ips(&self) -> &[IpAddr] {
        &self.local_ips
    }

    /// Spawn every long-running task of the engine.
    pub fn start(self: &Arc<Self>) {
        self.spawn_datapath();
        self.spawn_membership();
    }

    /// Spawn the TAP reader and the UDP receive loop. Kept separate from the
    /// membership loop so a future direct-peering mode can run the datapath
    /// without a DHT.
    pub fn spawn_datapath(self: &Arc<Self>) {
        let engine = Arc::clone(self);
        tokio::spawn(async move { engine.tap_reader_loop().await });

        let transport = Arc::clone(&self.transport);
        let handler: Arc<dyn DatagramHandler> = Arc::clone(self) as Arc<dyn DatagramHandler>;
        tokio::spawn(async move { transport.receive_loop(handler).await });
    }

    /// Spawn the membership loop.
    pub fn spawn_membership(self: &Arc<Self>) {
        let engine = Arc::clone(self);
        tokio::spawn(async move { engine.membership_loop().await });
    }

    // ---- TAP datapath ----

    async fn tap_reader_loop(self: Arc<Self>) {
        loop {
            match self.tap.read_frame().await {
                Ok(tap_frame) => {
                    if tap_frame.truncated {
                        debug!("truncated frame on {}", self.config.device);
                    }
                    // One short-lived task per frame so the reader never
                    // stalls on classification or send.
                    let engine = Arc::clone(&self);
                    tokio::spawn(async move { engine.handle_frame(tap_frame).await });
                }
                Err(e) => {
                    error!("error reading from TAP device: {}", e);
                    return;
                }
            }
        }
    }

    /// Classify one frame by EtherType and hand it to the matching handler.
    async fn handle_frame(&self, tap_frame: TapFrame) {
        match frame::classify(tap_frame.proto) {
            FrameClass::Ipv4 => self.handle_ipv4(&tap_frame).await,
            FrameClass::Arp => self.handle_arp(&tap_frame).await,
            FrameClass::Ipv6 => self.handle_ipv6(&tap_frame).await,
            FrameClass::Dropped(kind) => debug!("received {} frame, dropping", kind),
            FrameClass::Unknown => debug!(
                "received frame with unhandled EtherType {:#06x}, dropping",
                tap_frame.proto
            ),
        }
    }

    async fn handle_ipv4(&self, tap_frame: &TapFrame) {
        self.route_frame(tap_frame).await;
    }

    async fn handle_arp(&self, tap_frame: &TapFrame) {
        debug!("received ARP frame");
        self.route_frame(tap_frame).await;
    }

    async fn handle_ipv6(&self, tap_frame: &TapFrame) {
        self.route_frame(tap_frame).await;
    }

    /// Default forwarding policy: unicast by destination MAC, flood group
    /// addresses to every handshaked peer. Frames with no matching peer are
    /// dropped without generating traffic.
    async fn route_frame(&self, tap_frame: &TapFrame) {
        let Some(dst) = frame::dst_mac(&tap_frame.data) else {
            debug!("frame too short for an Ethernet header, dropping");
            return;
        };
        if dst.is_group() {
            self.flood_frame(tap_frame).await;
            return;
        }
        let peer = match self.peers.lookup_by_mac(dst) {
            Ok(peer) => peer,
            Err(e) => {
                error!("peer table unavailable: {}", e);
                return;
            }
        };
        let Some(peer) = peer else {
            // no handshaked peer owns this MAC
            return;
        };
        let Some(addr) = peer.udp_addr else {
            return;
        };
        let msg = OverlayMessage::nenc(&tap_frame.data);
        if let Err(e) = self.transport.send(&msg, addr).await {
            warn!("failed to forward frame to {}: {}", peer.remote_endpoint, e);
        }
    }

    async fn flood_frame(&self, tap_frame: &TapFrame) {
        let peers = match self.peers.handshaked() {
            Ok(peers) => peers,
            Err(e) => {
                error!("peer table unavailable: {}", e);
                return;
            }
        };
        for peer in peers {
            let Some(addr) = peer.udp_addr else {
                continue;
            };
            let msg = OverlayMessage::nenc(&tap_frame.data);
            if let Err(e) = self.transport.send(&msg, addr).await {
                warn!("failed to flood frame to {}: {}", peer.remote_endpoint, e);
            }
        }
    }

    // ---- inbound overlay messages ----

    /// The local node's own introduction message.
    fn introduction(&self) -> OverlayMessage {
        OverlayMessage::intro(&proto::format_intro(self.config.ip, self.config.mac))
    }

    async fn handle_intro(&self, payload: &[u8], src: SocketAddr) {
        let endpoint = src.to_string();
        // An already-handshaked sender gets no reply; this is the brake on
        // introduction storms.
        match self.peers.is_unknown(&endpoint) {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => {
                error!("peer table unavailable: {}", e);
                return;
            }
        }
        let text = match std::str::from_utf8(payload) {
            Ok(text) => text,
            Err(_) => {
                warn!("discarding non-ASCII introduction from {}", src);
                return;
            }
        };
        debug!("introduction received from {}: {}", src, text);
        let (ip, mac) = match proto::parse_intro(text) {
            Ok(identity) => identity,
            Err(e) => {
                warn!("failed to parse introduction from {}: {}", src, e);
                return;
            }
        };
        if let Err(e) = self.peers.promote_handshaked(&endpoint, src, ip, mac) {
            warn!("rejecting introduction from {}: {}", src, e);
            return;
        }
        info!("handshake complete with {} ({}, {})", endpoint, ip, mac);
        if let Err(e) = self.transport.send(&self.introduction(), src).await {
            warn!("failed to respond to introduction from {}: {}", src, e);
        }
    }

    async fn handle_nenc(&self, payload: &[u8]) {
        // the EtherType travels inside the encapsulated frame itself
        let Some(proto_id) = frame::ethertype(payload) else {
            warn!("encapsulated frame shorter than an Ethernet header, dropping");
            return;
        };
        if let Err(e) = self.tap.write_frame(payload, proto_id).await {
            warn!("failed to write frame to TAP device: {}", e);
        }
    }

    // ---- membership ----

    async fn membership_loop(self: Arc<Self>) {
        loop {
            tokio::time::sleep(MEMBERSHIP_INTERVAL).await;
            self.peer_source.refresh().await;
            // give the DHT a moment to gather responses before reconciling
            tokio::time::sleep(DHT_SETTLE).await;
            let snapshot = self.peer_source.last_catch();
            if let Err(e) = self.reconcile(&snapshot).await {
                warn!("membership reconciliation failed: {}", e);
            }
        }
    }

    /// One reconciliation cycle against a DHT snapshot: drop absent peers,
    /// add new ones, introduce ourselves to anything still unknown. Returns
    /// the number of newly discovered peers.
    pub async fn reconcile(&self, snapshot: &[String]) -> Result<usize> {
        let keep: HashSet<String> = snapshot.iter().cloned().collect();
        let removed = self.peers.remove_not_in(&keep)?;
        if removed > 0 {
            info!("dropped {} peers no longer in the DHT", removed);
        }
        let mut added = 0;
        for endpoint in snapshot {
            if self.peers.upsert_discovered(endpoint)? {
                added += 1;
            }
        }
        if added > 0 {
            info!("discovered {} new peers", added);
            self.introduce_discovered().await?;
        }
        Ok(added)
    }

    /// Introduction pass: resolve every peer still in `Discovered`, promote
    /// it and send one introduction. Failures leave the peer `Discovered`
    /// for a later cycle.
    async fn introduce_discovered(&self) -> Result<()> {
        for endpoint in self.peers.discovered()? {
            debug!("introducing to {}", endpoint);
            let addr = match lookup_host(endpoint.as_str()).await {
                Ok(mut addrs) => addrs.next(),
                Err(e) => {
                    warn!("failed to resolve peer endpoint {}: {}", endpoint, e);
                    continue;
                }
            };
            let Some(addr) = addr else {
                warn!("peer endpoint {} resolved to no addresses", endpoint);
                continue;
            };
            self.peers.promote_introduced(&endpoint, addr)?;
            if let Err(e) = self.transport.send(&self.introduction(), addr).await {
                warn!("failed to send introduction to {}: {}", addr, e);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl DatagramHandler for OverlayEngine {
    async fn handle_datagram(&self, data: &[u8], src: SocketAddr) {
        let msg = match OverlayMessage::from_bytes(data) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("discarding malformed datagram from {}: {}", src, e);
                return;
            }
        };
        match msg.msg_type() {
            Some(MsgType::Intro) => self.handle_intro(&msg.payload, src).await,
            Some(MsgType::Nenc) => self.handle_nenc(&msg.payload).await,
            None => warn!(
                "unknown message type {} from {}, dropping",
                msg.header.msg_type, src
            ),
        }
    }
}
