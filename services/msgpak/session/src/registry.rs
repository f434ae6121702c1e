//! Registry of connected peers.
//!
//! Servers key entries by the remote socket address, clients by the pool
//! address they dialed. Entries exist only while a session is established.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use msgpak_wire::crypto::sha256_hex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::handshake::SharedSecret;

/// Live peer entry
pub struct PeerEntry {
    /// Registry key
    pub address: String,
    /// Connection identifier, unique per process
    pub conn_id: u64,
    /// Secret negotiated for this connection
    pub shared_secret: SharedSecret,
    /// When the session was established
    pub connected_at: DateTime<Utc>,
    /// Cancels the connection's task group
    pub cancel: CancellationToken,
}

/// Peer summary without key material
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct PeerInfo {
    /// Registry key
    pub address: String,
    /// Connection identifier
    pub conn_id: u64,
    /// When the session was established
    pub connected_at: DateTime<Utc>,
}

/// Concurrent peer registry
#[derive(Default)]
pub struct PeerRegistry {
    peers: DashMap<String, PeerEntry>,
    next_conn_id: AtomicU64,
}

impl PeerRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a connection identifier
    pub fn next_conn_id(&self) -> u64 {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Register a peer. A previous entry under the same address is cancelled
    /// and replaced.
    pub fn register(&self, entry: PeerEntry) {
        let address = entry.address.clone();
        let conn_id = entry.conn_id;
        if let Some(old) = self.peers.insert(address.clone(), entry) {
            info!(
                "Replacing stale session {} for {} with {}",
                old.conn_id, address, conn_id
            );
            old.cancel.cancel();
        }
        debug!("Registered peer {} (conn {})", address, conn_id);
    }

    /// Remove a peer if the entry still belongs to `conn_id`
    pub fn deregister(&self, address: &str, conn_id: u64) -> bool {
        let removed = self
            .peers
            .remove_if(address, |_, entry| entry.conn_id == conn_id)
            .is_some();
        if removed {
            debug!("Deregistered peer {} (conn {})", address, conn_id);
        }
        removed
    }

    /// Whether an address has a live session
    pub fn contains(&self, address: &str) -> bool {
        self.peers.contains_key(address)
    }

    /// Number of live sessions
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Whether no sessions are live
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Addresses of every live session
    pub fn addresses(&self) -> Vec<String> {
        self.peers.iter().map(|e| e.key().clone()).collect()
    }

    /// Summary of one peer
    pub fn get(&self, address: &str) -> Option<PeerInfo> {
        self.peers.get(address).map(|e| info_of(&e))
    }

    /// Summaries of every live session, sorted by address
    pub fn snapshot(&self) -> Vec<PeerInfo> {
        let mut out: Vec<_> = self.peers.iter().map(|e| info_of(&e)).collect();
        out.sort_by(|a, b| a.address.cmp(&b.address));
        out
    }

    /// Short fingerprint of a peer's secret, for logs and diagnostics
    pub fn secret_fingerprint(&self, address: &str) -> Option<String> {
        self.peers
            .get(address)
            .map(|e| fingerprint(&e.shared_secret))
    }

    /// Cancel one session
    pub fn disconnect(&self, address: &str) -> bool {
        match self.peers.get(address) {
            Some(entry) => {
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }
}

fn info_of(entry: &PeerEntry) -> PeerInfo {
    PeerInfo {
        address: entry.address.clone(),
        conn_id: entry.conn_id,
        connected_at: entry.connected_at,
    }
}

/// First 16 hex chars of the secret's SHA-256
pub fn fingerprint(secret: &str) -> String {
    sha256_hex(secret.as_bytes())[..16].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use zeroize::Zeroizing;

    fn entry(registry: &PeerRegistry, address: &str) -> PeerEntry {
        PeerEntry {
            address: address.to_string(),
            conn_id: registry.next_conn_id(),
            shared_secret: Zeroizing::new("ab".repeat(32)),
            connected_at: Utc::now(),
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn test_register_deregister() {
        let registry = PeerRegistry::new();
        let e = entry(&registry, "10.0.0.1:4000");
        let id = e.conn_id;
        registry.register(e);

        assert!(registry.contains("10.0.0.1:4000"));
        assert_eq!(registry.addresses(), vec!["10.0.0.1:4000".to_string()]);
        assert_eq!(registry.secret_fingerprint("10.0.0.1:4000").unwrap().len(), 16);

        assert!(registry.deregister("10.0.0.1:4000", id));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_replaced_entry_is_cancelled_and_kept() {
        let registry = PeerRegistry::new();
        let old = entry(&registry, "peer");
        let old_id = old.conn_id;
        let old_cancel = old.cancel.clone();
        registry.register(old);

        let new = entry(&registry, "peer");
        let new_id = new.conn_id;
        registry.register(new);
        assert!(old_cancel.is_cancelled());

        // The stale session's cleanup must not remove the new entry
        assert!(!registry.deregister("peer", old_id));
        assert_eq!(registry.get("peer").unwrap().conn_id, new_id);
    }

    #[tokio::test]
    async fn test_disconnect() {
        let registry = PeerRegistry::new();
        let e = entry(&registry, "peer");
        let cancel = e.cancel.clone();
        registry.register(e);

        assert!(registry.disconnect("peer"));
        assert!(cancel.is_cancelled());
        assert!(!registry.disconnect("missing"));
    }
}
