//! The parent selector: a pure function from the current announcement store
//! to the chosen parent peer (or "we are root").
use crate::crypto::PublicKey;
use crate::peer::PeerTable;
use crate::port::Port;
use crate::store::AnnouncementStore;
use crate::{LocalDuration, LocalTime};

/// The outcome of a parent-selection pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selection {
    /// Stay with (or become) root: no peer qualifies as parent.
    Root,
    /// Adopt this peer as parent.
    Peer(Port),
}

/// Pick the best parent candidate among `peers`/`store`, given the node's
/// own key and its current root key (used as the self-root baseline so the
/// node never accepts a parent rooted weaker than itself).
///
/// This function performs no mutation; callers decide what to do with the
/// result (install the parent, broadcast, become root, ...).
#[allow(clippy::too_many_arguments)]
pub fn select_new_parent(
    self_key: &PublicKey,
    current_root_key: &PublicKey,
    current_sequence: u64,
    peers: &PeerTable,
    store: &AnnouncementStore,
    now: LocalTime,
    announcement_timeout: LocalDuration,
) -> Selection {
    let mut best_key = if current_root_key > self_key {
        *current_root_key
    } else {
        *self_key
    };
    let mut best_seq = current_sequence;
    let mut best_order = u64::MAX;
    let mut best_peer: Option<Port> = None;

    for (port, peer) in peers.iter() {
        if !peer.active {
            continue;
        }
        let Some(stored) = store.get(*port) else {
            continue;
        };
        if now.as_secs().saturating_sub(stored.receive_time.as_secs())
            >= announcement_timeout.as_secs()
        {
            continue;
        }

        let ann = &stored.announcement;

        // Never adopt a descendant (or ourselves) as parent.
        if ann.contains(self_key) {
            continue;
        }

        let accept = match ann.root_key.cmp(&best_key) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Less => false,
            std::cmp::Ordering::Equal => match ann.sequence.cmp(&best_seq) {
                std::cmp::Ordering::Greater => true,
                std::cmp::Ordering::Less => false,
                std::cmp::Ordering::Equal => stored.receive_order < best_order,
            },
        };

        if accept {
            best_key = ann.root_key;
            best_seq = ann.sequence;
            best_order = stored.receive_order;
            best_peer = Some(*port);
        }
    }

    match best_peer {
        Some(port) => Selection::Peer(port),
        None => Selection::Root,
    }
}
