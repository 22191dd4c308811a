//! Peer records and the peer table.
//!
//! Peers are keyed by their public UDP endpoint string; a secondary index by
//! overlay MAC keeps the per-frame lookup on the datapath O(1). The table is
//! the only shared mutable structure in the engine, guarded by a single lock
//! with one critical section per operation.

use std::collections::{HashMap, HashSet};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::RwLock;

use crate::error::{Error, Result};
use crate::frame::MacAddr;

/// Lifecycle of a peer. Progression is monotonic while the peer stays in the
/// table; removal is the only way to forget a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PeerState {
    /// Seen in a DHT snapshot, nothing else known.
    Discovered,
    /// Endpoint resolved and an introduction sent.
    Introduced,
    /// Overlay identity exchanged; usable for frame forwarding.
    Handshaked,
}

/// A known member of the overlay.
#[derive(Debug, Clone)]
pub struct Peer {
    /// Public UDP endpoint string; the identity key.
    pub remote_endpoint: String,
    /// Resolved transport address.
    pub udp_addr: Option<SocketAddr>,
    /// The peer's L3 address inside the overlay, known after handshake.
    pub overlay_ip: Option<Ipv4Addr>,
    /// The peer's L2 address inside the overlay, known after handshake.
    pub overlay_mac: Option<MacAddr>,
    /// Relay endpoint, reserved for NAT traversal.
    pub forwarder: Option<SocketAddr>,
    /// Relay path identifier, reserved.
    pub proxy_id: Option<u32>,
    pub state: PeerState,
}

impl Peer {
    fn discovered(endpoint: &str) -> Self {
        Peer {
            remote_endpoint: endpoint.to_string(),
            udp_addr: None,
            overlay_ip: None,
            overlay_mac: None,
            forwarder: None,
            proxy_id: None,
            state: PeerState::Discovered,
        }
    }
}

#[derive(Default)]
struct TableInner {
    by_endpoint: HashMap<String, Peer>,
    by_mac: HashMap<MacAddr, String>,
}

/// Endpoint-keyed table of known peers.
pub struct PeerTable {
    inner: RwLock<TableInner>,
}

impl PeerTable {
    pub fn new() -> Self {
        PeerTable {
            inner: RwLock::new(TableInner::default()),
        }
    }

    /// Insert a peer in `Discovered` unless the endpoint is already present.
    /// Returns whether an insertion occurred.
    pub fn upsert_discovered(&self, endpoint: &str) -> Result<bool> {
        let mut inner = self.inner.write().map_err(|_| Error::Lock)?;
        if inner.by_endpoint.contains_key(endpoint) {
            return Ok(false);
        }
        inner
            .by_endpoint
            .insert(endpoint.to_string(), Peer::discovered(endpoint));
        Ok(true)
    }

    /// Record the resolved transport address and raise the peer to
    /// `Introduced`. Never downgrades; idempotent on re-call.
    pub fn promote_introduced(&self, endpoint: &str, udp_addr: SocketAddr) -> Result<()> {
        let mut inner = self.inner.write().map_err(|_| Error::Lock)?;
        let peer = inner
            .by_endpoint
            .get_mut(endpoint)
            .ok_or_else(|| Error::PeerNotFound(endpoint.to_string()))?;
        peer.udp_addr = Some(udp_addr);
        if peer.state < PeerState::Introduced {
            peer.state = PeerState::Introduced;
        }
        Ok(())
    }

    /// Record the peer's overlay identity and raise it to `Handshaked`,
    /// inserting the peer if an introduction beat the membership loop to it.
    /// Fails when the MAC is already indexed for a different endpoint.
    pub fn promote_handshaked(
        &self,
        endpoint: &str,
        udp_addr: SocketAddr,
        overlay_ip: Ipv4Addr,
        overlay_mac: MacAddr,
    ) -> Result<()> {
        let mut inner = self.inner.write().map_err(|_| Error::Lock)?;
        let TableInner {
            by_endpoint,
            by_mac,
        } = &mut *inner;
        if let Some(owner) = by_mac.get(&overlay_mac) {
            if owner != endpoint {
                return Err(Error::MacConflict(overlay_mac.to_string()));
            }
        }
        let peer = by_endpoint
            .entry(endpoint.to_string())
            .or_insert_with(|| Peer::discovered(endpoint));
        if let Some(previous) = peer.overlay_mac {
            if previous != overlay_mac {
                by_mac.remove(&previous);
            }
        }
        peer.udp_addr = Some(udp_addr);
        peer.overlay_ip = Some(overlay_ip);
        peer.overlay_mac = Some(overlay_mac);
        peer.state = PeerState::Handshaked;
        by_mac.insert(overlay_mac, endpoint.to_string());
        Ok(())
    }

    /// Drop every peer whose endpoint is not in the snapshot. Returns the
    /// number of peers removed.
    pub fn remove_not_in(&self, snapshot: &HashSet<String>) -> Result<usize> {
        let mut inner = self.inner.write().map_err(|_| Error::Lock)?;
        let TableInner {
            by_endpoint,
            by_mac,
        } = &mut *inner;
        let before = by_endpoint.len();
        by_endpoint.retain(|endpoint, _| snapshot.contains(endpoint));
        by_mac.retain(|_, endpoint| by_endpoint.contains_key(endpoint));
        Ok(before - by_endpoint.len())
    }

    /// The handshaked peer owning this overlay MAC, if any.
    pub fn lookup_by_mac(&self, mac: MacAddr) -> Result<Option<Peer>> {
        let inner = self.inner.read().map_err(|_| Error::Lock)?;
        Ok(inner
            .by_mac
            .get(&mac)
            .and_then(|endpoint| inner.by_endpoint.get(endpoint))
            .filter(|peer| peer.state == PeerState::Handshaked)
            .cloned())
    }

    /// True when no peer exists for this endpoint or the peer has not yet
    /// handshaked. Gates introduction replies.
    pub fn is_unknown(&self, endpoint: &str) -> Result<bool> {
        let inner = self.inner.read().map_err(|_| Error::Lock)?;
        Ok(inner
            .by_endpoint
            .get(endpoint)
            .map(|peer| peer.state != PeerState::Handshaked)
            .unwrap_or(true))
    }

    /// Snapshot of a single peer.
    pub fn get(&self, endpoint: &str) -> Result<Option<Peer>> {
        let inner = self.inner.read().map_err(|_| Error::Lock)?;
        Ok(inner.by_endpoint.get(endpoint).cloned())
    }

    /// All endpoints currently in the table.
    pub fn endpoints(&self) -> Result<HashSet<String>> {
        let inner = self.inner.read().map_err(|_| Error::Lock)?;
        Ok(inner.by_endpoint.keys().cloned().collect())
    }

    /// Endpoints of peers still in `Discovered`, the targets of the next
    /// introduction pass.
    pub fn discovered(&self) -> Result<Vec<String>> {
        let inner = self.inner.read().map_err(|_| Error::Lock)?;
        Ok(inner
            .by_endpoint
            .values()
            .filter(|peer| peer.state == PeerState::Discovered)
            .map(|peer| peer.remote_endpoint.clone())
            .collect())
    }

    /// All handshaked peers; used when flooding group-addressed frames.
    pub fn handshaked(&self) -> Result<Vec<Peer>> {
        let inner = self.inner.read().map_err(|_| Error::Lock)?;
        Ok(inner
            .by_endpoint
            .values()
            .filter(|peer| peer.state == PeerState::Handshaked)
            .cloned()
            .collect())
    }

    pub fn len(&self) -> Result<usize> {
        let inner = self.inner.read().map_err(|_| Error::Lock)?;
        Ok(inner.by_endpoint.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

impl Default for PeerTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn mac(s: &str) -> MacAddr {
        s.parse().unwrap()
    }

    #[test]
    fn upsert_is_idempotent() {
        let table = PeerTable::new();
        assert!(table.upsert_discovered("1.2.3.4:5000").unwrap());
        assert!(!table.upsert_discovered("1.2.3.4:5000").unwrap());
        assert_eq!(table.len().unwrap(), 1);
        let peer = table.get("1.2.3.4:5000").unwrap().unwrap();
        assert_eq!(peer.state, PeerState::Discovered);
        assert!(peer.overlay_ip.is_none());
        assert!(peer.overlay_mac.is_none());
    }

    #[test]
    fn states_progress_monotonically() {
        let table = PeerTable::new();
        let endpoint = "1.2.3.4:5000";
        table.upsert_discovered(endpoint).unwrap();
        table
            .promote_introduced(endpoint, addr("1.2.3.4:5000"))
            .unwrap();
        assert_eq!(
            table.get(endpoint).unwrap().unwrap().state,
            PeerState::Introduced
        );

        table
            .promote_handshaked(
                endpoint,
                addr("1.2.3.4:5000"),
                "10.0.0.2".parse().unwrap(),
                mac("06:bb:bb:bb:bb:bb"),
            )
            .unwrap();
        assert_eq!(
            table.get(endpoint).unwrap().unwrap().state,
            PeerState::Handshaked
        );

        // a later introduced-promotion must not downgrade
        table
            .promote_introduced(endpoint, addr("1.2.3.4:5000"))
            .unwrap();
        assert_eq!(
            table.get(endpoint).unwrap().unwrap().state,
            PeerState::Handshaked
        );
    }

    #[test]
    fn handshake_inserts_unseen_endpoint() {
        let table = PeerTable::new();
        table
            .promote_handshaked(
                "9.9.9.9:1000",
                addr("9.9.9.9:1000"),
                "10.0.0.9".parse().unwrap(),
                mac("06:99:99:99:99:99"),
            )
            .unwrap();
        let peer = table.get("9.9.9.9:1000").unwrap().unwrap();
        assert_eq!(peer.state, PeerState::Handshaked);
        assert_eq!(peer.overlay_ip, Some("10.0.0.9".parse().unwrap()));
    }

    #[test]
    fn handshake_is_idempotent() {
        let table = PeerTable::new();
        let endpoint = "1.2.3.4:5000";
        let ip = "10.0.0.2".parse().unwrap();
        let hw = mac("06:bb:bb:bb:bb:bb");
        table
            .promote_handshaked(endpoint, addr(endpoint), ip, hw)
            .unwrap();
        table
            .promote_handshaked(endpoint, addr(endpoint), ip, hw)
            .unwrap();
        assert_eq!(table.len().unwrap(), 1);
        assert!(table.lookup_by_mac(hw).unwrap().is_some());
    }

    #[test]
    fn mac_uniqueness_is_enforced() {
        let table = PeerTable::new();
        let hw = mac("06:bb:bb:bb:bb:bb");
        let ip = "10.0.0.2".parse().unwrap();
        table
            .promote_handshaked("1.1.1.1:1", addr("1.1.1.1:1"), ip, hw)
            .unwrap();
        let err = table
            .promote_handshaked("2.2.2.2:2", addr("2.2.2.2:2"), ip, hw)
            .unwrap_err();
        assert!(matches!(err, Error::MacConflict(_)));
        assert_eq!(table.len().unwrap(), 1);
    }

    #[test]
    fn rehandshake_with_new_mac_updates_index() {
        let table = PeerTable::new();
        let endpoint = "1.1.1.1:1";
        let ip = "10.0.0.2".parse().unwrap();
        let old = mac("06:aa:aa:aa:aa:aa");
        let new = mac("06:bb:bb:bb:bb:bb");
        table
            .promote_handshaked(endpoint, addr(endpoint), ip, old)
            .unwrap();
        table
            .promote_handshaked(endpoint, addr(endpoint), ip, new)
            .unwrap();
        assert!(table.lookup_by_mac(old).unwrap().is_none());
        assert!(table.lookup_by_mac(new).unwrap().is_some());
    }

    #[test]
    fn remove_not_in_retains_snapshot_subset() {
        let table = PeerTable::new();
        table.upsert_discovered("1.1.1.1:1").unwrap();
        table.upsert_discovered("2.2.2.2:2").unwrap();
        table
            .promote_handshaked(
                "3.3.3.3:3",
                addr("3.3.3.3:3"),
                "10.0.0.3".parse().unwrap(),
                mac("06:cc:cc:cc:cc:cc"),
            )
            .unwrap();

        let snapshot: HashSet<String> = ["2.2.2.2:2".to_string()].into_iter().collect();
        let removed = table.remove_not_in(&snapshot).unwrap();
        assert_eq!(removed, 2);
        assert_eq!(table.endpoints().unwrap(), snapshot);
        // the evicted peer's MAC must leave the index with it
        assert!(table
            .lookup_by_mac(mac("06:cc:cc:cc:cc:cc"))
            .unwrap()
            .is_none());
    }

    #[test]
    fn lookup_by_mac_requires_handshake() {
        let table = PeerTable::new();
        table.upsert_discovered("1.1.1.1:1").unwrap();
        assert!(table
            .lookup_by_mac(mac("06:aa:aa:aa:aa:aa"))
            .unwrap()
            .is_none());
    }

    #[test]
    fn is_unknown_is_tri_state() {
        let table = PeerTable::new();
        let endpoint = "1.1.1.1:1";
        // absent
        assert!(table.is_unknown(endpoint).unwrap());
        // discovered
        table.upsert_discovered(endpoint).unwrap();
        assert!(table.is_unknown(endpoint).unwrap());
        // introduced
        table.promote_introduced(endpoint, addr(endpoint)).unwrap();
        assert!(table.is_unknown(endpoint).unwrap());
        // handshaked
        table
            .promote_handshaked(
                endpoint,
                addr(endpoint),
                "10.0.0.2".parse().unwrap(),
                mac("06:bb:bb:bb:bb:bb"),
            )
            .unwrap();
        assert!(!table.is_unknown(endpoint).unwrap());
    }

    #[test]
    fn discovered_lists_only_unintroduced_peers() {
        let table = PeerTable::new();
        table.upsert_discovered("1.1.1.1:1").unwrap();
        table.upsert_discovered("2.2.2.2:2").unwrap();
        table
            .promote_introduced("2.2.2.2:2", addr("2.2.2.2:2"))
            .unwrap();
        assert_eq!(table.discovered().unwrap(), vec!["1.1.1.1:1".to_string()]);
    }
}
