//! The peer table: local bookkeeping for connected peers, addressable by
//! their stable [`Port`].
use std::collections::BTreeMap;

use crate::crypto::PublicKey;
use crate::port::Port;

/// A connected peer, as seen by the tree state actor.
///
/// The transport-level connection itself (socket, URI, zone) is out of this
/// core's scope; only what the tree protocol needs is kept here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub port: Port,
    pub remote_key: PublicKey,
    pub active: bool,
}

impl Peer {
    pub fn new(port: Port, remote_key: PublicKey) -> Self {
        Self {
            port,
            remote_key,
            active: true,
        }
    }
}

/// Registry of connected peers, keyed by their local [`Port`].
#[derive(Debug, Default)]
pub struct PeerTable {
    peers: BTreeMap<Port, Peer>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, peer: Peer) {
        self.peers.insert(peer.port, peer);
    }

    pub fn remove(&mut self, port: Port) -> Option<Peer> {
        self.peers.remove(&port)
    }

    pub fn get(&self, port: Port) -> Option<&Peer> {
        self.peers.get(&port)
    }

    pub fn get_mut(&mut self, port: Port) -> Option<&mut Peer> {
        self.peers.get_mut(&port)
    }

    pub fn contains(&self, port: Port) -> bool {
        self.peers.contains_key(&port)
    }

    /// Find a peer by its remote public key.
    ///
    /// Peer counts in this domain are small, so a linear scan is used
    /// rather than maintaining a secondary index.
    pub fn find(&self, remote_key: &PublicKey) -> Option<&Peer> {
        self.peers.values().find(|p| &p.remote_key == remote_key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Port, &Peer)> {
        self.peers.iter()
    }

    pub fn active(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values().filter(|p| p.active)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
