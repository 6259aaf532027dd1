//! The tree next-hop resolver: given a frame's destination coordinates,
//! choose the outgoing peer that strictly decreases tree distance.
use crate::message::Destination;
use crate::peer::PeerTable;
use crate::port::Port;
use crate::store::AnnouncementStore;

/// Where a frame should go next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextHop {
    /// Deliver to this node's own local endpoint.
    Local,
    /// Forward out through this peer.
    Forward(Port),
    /// No progress can be made; drop the frame.
    Drop,
}

/// Tree distance between two coordinate sequences: `|a| + |b| - 2*lcp(a,b)`.
///
/// A true tree hop count between the nodes at coordinates `a` and `b`.
pub fn tree_distance(a: &[Port], b: &[Port]) -> usize {
    let k = a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count();

    a.len() + b.len() - 2 * k
}

/// Resolve the next hop for a frame arriving from `from_port` (`None` if it
/// originated locally) with the current root epoch `(root_key, sequence)`
/// identified by comparing against each peer's stored announcement.
///
/// The only anti-backtrack rule applied is `port == from_port`; no further
/// loop suppression is performed (see the open question this preserves).
pub fn next_hop(
    our_coords: &[Port],
    our_root_sequence: u64,
    our_root_key: &crate::crypto::PublicKey,
    from_port: Option<Port>,
    destination: &Destination,
    peers: &PeerTable,
    store: &AnnouncementStore,
) -> NextHop {
    let dest = match destination {
        Destination::Coordinates(coords) => coords,
        _ => return NextHop::Drop,
    };

    if dest.as_slice() == our_coords {
        return NextHop::Local;
    }

    let our_dist = tree_distance(our_coords, dest);
    if our_dist == 0 {
        return NextHop::Local;
    }

    let mut best_dist = our_dist;
    let mut best_peer: Option<Port> = None;

    for (port, peer) in peers.iter() {
        if !peer.active || Some(*port) == from_port {
            continue;
        }
        let Some(stored) = store.get(*port) else {
            continue;
        };
        if &stored.announcement.root_key != our_root_key || stored.announcement.sequence != our_root_sequence {
            continue;
        }

        let peer_coords = stored.coordinates();
        let peer_dist = tree_distance(&peer_coords, dest);

        if peer_dist == 0 || peer_coords == *dest {
            return NextHop::Forward(*port);
        }
        if peer_dist < best_dist {
            best_dist = peer_dist;
            best_peer = Some(*port);
        }
    }

    match best_peer {
        Some(port) => NextHop::Forward(port),
        None => NextHop::Drop,
    }
}
