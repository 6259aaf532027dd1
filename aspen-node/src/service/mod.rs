//! The tree state actor: owns the peer table and announcement store, drives
//! parent election, and answers coordinate/routing queries.
pub mod config;
pub mod events;
pub mod io;

pub use config::Config;
pub use events::{Event, Events};
pub use io::{Io, Outbox};

use std::sync::Arc;

use crossbeam_channel as chan;
use log::{debug, trace, warn};

use crate::crypto::{PublicKey, Signer};
use crate::message::{Destination, Frame, SwitchAnnouncement, VerifyError};
use crate::peer::{Peer, PeerTable};
use crate::port::Port;
use crate::resolver::{self, NextHop};
use crate::selector::{self, Selection};
use crate::store::{AnnouncementStore, StoredAnnouncement};
use crate::{LocalDuration, LocalTime};

use self::events::EventSinks;

/// Why an inbound announcement was rejected by [`TreeState::validate`].
///
/// Every variant is absorbed at `debug!` by the caller: a rejection never
/// disconnects the peer or otherwise mutates state.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum AnnouncementError {
    #[error("empty signature chain")]
    EmptyChain,
    #[error("first signer does not match root key")]
    WrongRoot,
    #[error("zero hop port")]
    ZeroHop,
    #[error("last signer is not the sending peer")]
    WrongSender,
    #[error(transparent)]
    Chain(#[from] VerifyError),
}

/// Snapshot of a single peer, returned by [`TreeState::peers`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub port: Port,
    pub remote_key: PublicKey,
    pub active: bool,
    pub is_parent: bool,
}

/// Snapshot of the node's current tree state, returned by [`TreeState::node_state`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeState {
    pub self_key: PublicKey,
    pub connections: Vec<(Port, PublicKey)>,
    pub parent_key: Option<PublicKey>,
    pub coords: Vec<Port>,
    pub root_announcement: SwitchAnnouncement,
    pub announcement_time: LocalTime,
}

/// A synchronous read-only query against the tree state, run on the actor's
/// own thread. The closure's side effects (typically sending results over a
/// channel it captured) are its return value; [`Command::QueryState`]'s
/// second field is only used to acknowledge that the query has run.
pub type QueryState<G> = dyn Fn(&TreeState<G>) + Send + Sync;

/// Messages processed by the tree state actor. Delivered in FIFO order with
/// respect to a given sender; never processed concurrently with each other.
pub enum Command<G> {
    /// The transport reports a new peer connection.
    PeerConnected(Port, PublicKey),
    /// The transport reports a peer disconnection.
    PeerDisconnected(Port),
    /// An inbound frame arrived from a peer.
    Frame(Port, Frame),
    /// The periodic maintenance timer fired.
    Tick,
    /// The anti-flap timer fired; `epoch` must match the epoch that
    /// scheduled it or this is a stale, ignored firing.
    ReparentTimer(u64),
    /// Run a read-only query against the state and acknowledge completion.
    QueryState(Arc<QueryState<G>>, chan::Sender<()>),
    /// Register a new event subscriber.
    Subscribe(chan::Sender<Events>),
    /// Stop the actor.
    Shutdown,
}

impl<G> std::fmt::Debug for Command<G> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PeerConnected(port, key) => write!(f, "PeerConnected({port}, {key})"),
            Self::PeerDisconnected(port) => write!(f, "PeerDisconnected({port})"),
            Self::Frame(port, frame) => write!(f, "Frame({port}, {frame:?})"),
            Self::Tick => write!(f, "Tick"),
            Self::ReparentTimer(epoch) => write!(f, "ReparentTimer({epoch})"),
            Self::QueryState(..) => write!(f, "QueryState(..)"),
            Self::Subscribe(..) => write!(f, "Subscribe(..)"),
            Self::Shutdown => write!(f, "Shutdown"),
        }
    }
}

/// The per-node tree state machine (exactly one instance per node).
pub struct TreeState<G> {
    self_key: PublicKey,
    signer: G,
    config: Config,

    peers: PeerTable,
    announcements: AnnouncementStore,
    parent: Option<Port>,
    sequence: u64,
    ordering: u64,
    waiting: bool,
    reparent_epoch: u64,

    events: EventSinks,
    outbox: Outbox,
}

impl<G: Signer> TreeState<G> {
    pub fn new(signer: G, config: Config) -> Self {
        let self_key = *signer.public_key();

        let mut outbox = Outbox::default();
        outbox.wakeup(config.announcement_interval);

        Self {
            self_key,
            signer,
            config,
            peers: PeerTable::new(),
            announcements: AnnouncementStore::new(),
            parent: None,
            sequence: 0,
            ordering: 0,
            waiting: false,
            reparent_epoch: 0,
            events: EventSinks::default(),
            outbox,
        }
    }

    pub fn subscribe(&mut self) -> Events {
        self.events.subscribe()
    }

    /// Drain pending outbound effects. Called by the runtime after every
    /// command.
    pub fn outbox(&mut self) -> &mut Outbox {
        &mut self.outbox
    }

    /// This node's current tree coordinates.
    pub fn coords(&self) -> Vec<Port> {
        self.root_announcement().coordinates()
    }

    /// The announcement this node currently presents to the tree: either
    /// its parent's stored announcement, or a synthetic self-root
    /// announcement if it has no parent.
    fn root_announcement(&self) -> SwitchAnnouncement {
        match self.parent.and_then(|p| self.announcements.get(p)) {
            Some(stored) => stored.announcement.clone(),
            None => SwitchAnnouncement::root(self.self_key, self.sequence),
        }
    }

    fn current_root_key(&self) -> PublicKey {
        self.root_announcement().root_key
    }

    /// Snapshot of all known peers.
    pub fn peers(&self) -> Vec<PeerInfo> {
        self.peers
            .iter()
            .map(|(port, peer)| PeerInfo {
                port: *port,
                remote_key: peer.remote_key,
                active: peer.active,
                is_parent: self.parent == Some(*port),
            })
            .collect()
    }

    /// Snapshot of the node's full tree state.
    pub fn node_state(&self) -> NodeState {
        let connections = self
            .peers
            .iter()
            .map(|(port, peer)| (*port, peer.remote_key))
            .collect();
        let root = self.root_announcement();
        let announcement_time = self
            .parent
            .and_then(|p| self.announcements.get(p))
            .map(|s| s.receive_time)
            .unwrap_or_else(LocalTime::now);

        NodeState {
            self_key: self.self_key,
            connections,
            parent_key: self.parent.and_then(|p| self.peers.get(p)).map(|p| p.remote_key),
            coords: root.coordinates(),
            root_announcement: root,
            announcement_time,
        }
    }

    /// Resolve the outgoing peer for a frame arriving from `from`.
    pub fn next_hop(&self, from: Option<Port>, destination: &Destination) -> NextHop {
        let root = self.root_announcement();

        resolver::next_hop(
            &root.coordinates(),
            root.sequence,
            &root.root_key,
            from,
            destination,
            &self.peers,
            &self.announcements,
        )
    }

    /// Dispatch a single command. This is the only entry point that mutates
    /// the tree state; it never blocks.
    pub fn command(&mut self, cmd: Command<G>, now: LocalTime) {
        match cmd {
            Command::PeerConnected(port, remote_key) => self.on_peer_connected(port, remote_key),
            Command::PeerDisconnected(port) => self.on_peer_disconnected(port, now),
            Command::Frame(port, frame) => self.on_frame(port, frame, now),
            Command::Tick => self.maintain_tree(now),
            Command::ReparentTimer(epoch) => self.on_reparent_timer(epoch, now),
            Command::QueryState(query, ack) => {
                query(self);
                ack.send(()).ok();
            }
            Command::Subscribe(reply) => {
                reply.send(self.subscribe()).ok();
            }
            Command::Shutdown => {}
        }
        self.check_invariants();
    }

    /// Check the invariants that must hold between any two commands (I1,
    /// I5 from the data model). A violation means a bug in this actor, not
    /// a malformed peer input (those are rejected in `validate` without
    /// ever reaching here) -- `debug_assert!` so CI and tests catch it
    /// immediately, while a release build logs and carries on rather than
    /// taking the node down.
    fn check_invariants(&self) {
        if let Some(port) = self.parent {
            let has_peer = self.peers.get(port).is_some();
            let has_announcement = self.announcements.get(port).is_some();

            debug_assert!(has_peer && has_announcement, "I1 violated: parent {port} has no peer/announcement entry");
            if !has_peer || !has_announcement {
                warn!(target: "service", "invariant I1 violated: parent {port} has no peer/announcement entry");
            }
        }

        debug_assert!(!self.waiting || self.parent.is_none(), "I5 violated: waiting but parent is set");
        if self.waiting && self.parent.is_some() {
            warn!(target: "service", "invariant I5 violated: waiting but parent is set");
        }
    }

    fn on_peer_connected(&mut self, port: Port, remote_key: PublicKey) {
        self.peers.insert(Peer::new(port, remote_key));
    }

    fn on_peer_disconnected(&mut self, port: Port, now: LocalTime) {
        self.peers.remove(port);
        self.announcements.remove(port);

        if self.parent == Some(port) {
            if self.waiting {
                // I5: waiting already implies `parent` is `None`; this just
                // keeps that invariant explicit without running
                // `run_selection` (the reparent timer owns re-election
                // while waiting).
                self.parent = None;
            } else {
                // Let `run_selection` itself decide the new `parent`: it
                // already sets `Some(new_port)` or `None` (via
                // `become_root`, which bumps `sequence` and re-broadcasts)
                // depending on whether a candidate remains.
                self.run_selection(now);
            }
        }
    }

    fn on_frame(&mut self, port: Port, frame: Frame, now: LocalTime) {
        match frame {
            Frame::TreeAnnouncement(ann) => self.handle_tree_announcement(port, ann, now),
            Frame::Data {
                destination,
                payload,
            } => match self.next_hop(Some(port), &destination) {
                NextHop::Local => self.outbox.deliver(Frame::Data {
                    destination,
                    payload,
                }),
                NextHop::Forward(out) => self.outbox.send(
                    out,
                    Frame::Data {
                        destination,
                        payload,
                    },
                ),
                NextHop::Drop => {
                    trace!(target: "service", "dropping frame from {port}: no progress possible");
                }
            },
        }
    }

    /// Validate and, if valid, accept an inbound announcement; see module
    /// docs for the full acceptance/classification algorithm.
    fn handle_tree_announcement(&mut self, port: Port, ann: SwitchAnnouncement, now: LocalTime) {
        let Some(peer) = self.peers.get(port) else {
            debug!(target: "service", "dropping announcement from unknown port {port}");
            return;
        };

        if let Err(e) = self.validate(&ann, peer) {
            debug!(target: "service", "rejecting announcement from {port}: {e}");
            return;
        }

        if let Some(prior) = self.announcements.get(port) {
            if prior.announcement.root_key == ann.root_key && ann.sequence < prior.announcement.sequence {
                debug!(target: "service", "rejecting replayed announcement from {port}");
                return;
            }
        }

        let last_root_key = self.current_root_key();
        let last_sequence = self.root_announcement().sequence;
        let is_parent = self.parent == Some(port);

        self.ordering += 1;
        self.announcements.insert(
            port,
            StoredAnnouncement {
                announcement: ann.clone(),
                receive_time: now,
                receive_order: self.ordering,
            },
        );

        let root_delta = ann.root_key.cmp(&last_root_key);

        if is_parent {
            if self.waiting {
                return;
            }

            let regressed = root_delta == std::cmp::Ordering::Less
                || (root_delta == std::cmp::Ordering::Equal && ann.sequence <= last_sequence);

            if regressed {
                self.enter_waiting(now);
                return;
            }
            self.send_tree_announcements();
        } else if root_delta == std::cmp::Ordering::Less && !self.waiting {
            // Teach the peer our better announcement; don't re-elect.
            self.send_to(port);
        }

        if !self.waiting {
            self.run_selection(now);
        }
    }

    /// Structural + cryptographic validation. Never mutates state.
    fn validate(&self, ann: &SwitchAnnouncement, peer: &Peer) -> Result<(), AnnouncementError> {
        if ann.signatures.is_empty() {
            // A wire announcement always carries at least one hop: the
            // sender signs its own self-root announcement before sending
            // (see `send_to`). An empty chain over the wire is malformed,
            // not a legitimate claim.
            return Err(AnnouncementError::EmptyChain);
        }

        if ann.signatures[0].signer != ann.root_key {
            return Err(AnnouncementError::WrongRoot);
        }
        if ann.signatures.iter().any(|h| h.port.is_local()) {
            return Err(AnnouncementError::ZeroHop);
        }
        if ann.signatures.last().map(|h| h.signer) != Some(peer.remote_key) {
            return Err(AnnouncementError::WrongSender);
        }
        ann.verify()?;

        Ok(())
    }

    fn enter_waiting(&mut self, now: LocalTime) {
        self.waiting = true;
        self.reparent_epoch += 1;
        self.become_root(now);
        self.outbox.reparent_timeout(self.config.reparent_wait, self.reparent_epoch);
    }

    fn on_reparent_timer(&mut self, epoch: u64, now: LocalTime) {
        if !self.waiting || epoch != self.reparent_epoch {
            return;
        }
        self.waiting = false;
        self.run_selection(now);
    }

    fn become_root(&mut self, now: LocalTime) {
        self.parent = None;
        self.maintain_tree(now);
    }

    /// Periodic maintenance: bump our own sequence and broadcast if acting
    /// as root, then reschedule unconditionally.
    fn maintain_tree(&mut self, _now: LocalTime) {
        if self.parent.is_none() {
            self.sequence += 1;
            self.send_tree_announcements();
        }
        self.outbox.wakeup(self.config.announcement_interval);
    }

    fn run_selection(&mut self, now: LocalTime) {
        let selection = selector::select_new_parent(
            &self.self_key,
            &self.current_root_key(),
            self.root_announcement().sequence,
            &self.peers,
            &self.announcements,
            now,
            self.config.announcement_timeout,
        );

        match selection {
            Selection::Peer(port) if self.parent != Some(port) => {
                self.parent = Some(port);
                self.events.emit(Event::ParentChanged {
                    parent: self.parent,
                });
                self.events.emit(Event::RootChanged {
                    root_key: self.current_root_key(),
                });
                self.events.emit(Event::CoordsChanged {
                    coords: self.coords(),
                });
                self.send_tree_announcements();
            }
            Selection::Peer(_) => {}
            Selection::Root => {
                if self.parent.is_some() {
                    self.become_root(now);
                    self.events.emit(Event::ParentChanged { parent: None });
                }
            }
        }
    }

    /// Broadcast the current root announcement to every active peer,
    /// re-signed for each peer's own port.
    fn send_tree_announcements(&mut self) {
        let ports: Vec<Port> = self.peers.active().map(|p| p.port).collect();
        for port in ports {
            self.send_to(port);
        }
    }

    fn send_to(&mut self, port: Port) {
        let Some(peer) = self.peers.get(port) else {
            return;
        };
        let ann = self.root_announcement();

        if ann.contains(&peer.remote_key) {
            // Sending this announcement back to a node already in its
            // chain would hand it a loop.
            return;
        }
        let signed = ann.signed(&self.signer, port);
        self.outbox.send(port, Frame::TreeAnnouncement(signed));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::test::signer::MockSigner;

    fn connect<G: Signer>(a: &mut TreeState<G>, port: Port, remote_key: PublicKey) {
        a.command(Command::PeerConnected(port, remote_key), LocalTime::from_secs(0));
    }

    #[test]
    fn test_self_root_baseline() {
        let signer = MockSigner::default();
        let key = *signer.public_key();
        let mut state = TreeState::new(signer, Config::fast());

        assert_eq!(state.coords(), Vec::<Port>::new());
        assert_eq!(state.current_root_key(), key);
    }

    #[test]
    fn test_two_node_election_adopts_higher_key_as_parent() {
        let low = MockSigner::from_seed([1; 32]);
        let high = MockSigner::from_seed([2; 32]);
        let (low, high) = if low.public_key() > high.public_key() {
            (high, low)
        } else {
            (low, high)
        };

        let mut a = TreeState::new(low.clone(), Config::fast());
        connect(&mut a, Port::new(1), *high.public_key());

        // `high`'s self-root announcement arrives at `a` over port 1.
        let ann = SwitchAnnouncement::root(*high.public_key(), 1).signed(&high, Port::new(1));
        a.command(
            Command::Frame(Port::new(1), Frame::TreeAnnouncement(ann)),
            LocalTime::from_secs(0),
        );

        assert_eq!(a.coords(), vec![Port::new(1)]);
        assert_eq!(a.current_root_key(), *high.public_key());
    }

    #[test]
    fn test_empty_chain_is_rejected() {
        let me = MockSigner::default();
        let other = MockSigner::default();
        let mut state = TreeState::new(me, Config::fast());

        connect(&mut state, Port::new(1), *other.public_key());

        // No real sender ever transmits an unsigned, empty-chain
        // announcement (`send_to` always signs before enqueuing); a peer
        // that does is malformed or hostile.
        let ann = SwitchAnnouncement::root(*other.public_key(), 1);
        state.command(
            Command::Frame(Port::new(1), Frame::TreeAnnouncement(ann)),
            LocalTime::from_secs(0),
        );

        assert!(state.announcements.get(Port::new(1)).is_none());
    }

    #[test]
    fn test_loop_chain_is_rejected() {
        let me = MockSigner::default();
        let other = MockSigner::default();
        let mut state = TreeState::new(me.clone(), Config::fast());

        connect(&mut state, Port::new(1), *other.public_key());

        let ann = SwitchAnnouncement::root(*other.public_key(), 1)
            .signed(&me, Port::new(9))
            .signed(&other, Port::new(1));

        state.command(
            Command::Frame(Port::new(1), Frame::TreeAnnouncement(ann)),
            LocalTime::from_secs(0),
        );

        assert!(state.announcements.get(Port::new(1)).is_none());
    }

    #[test]
    fn test_replay_is_rejected() {
        let me = MockSigner::default();
        let peer = MockSigner::default();
        let root = MockSigner::from_seed([9; 32]);
        let mut state = TreeState::new(me, Config::fast());

        connect(&mut state, Port::new(1), *peer.public_key());

        let fresh = SwitchAnnouncement::root(*root.public_key(), 7).signed(&peer, Port::new(1));
        state.command(
            Command::Frame(Port::new(1), Frame::TreeAnnouncement(fresh)),
            LocalTime::from_secs(0),
        );
        assert_eq!(state.announcements.get(Port::new(1)).unwrap().announcement.sequence, 7);

        let stale = SwitchAnnouncement::root(*root.public_key(), 6).signed(&peer, Port::new(1));
        state.command(
            Command::Frame(Port::new(1), Frame::TreeAnnouncement(stale)),
            LocalTime::from_secs(1),
        );
        assert_eq!(state.announcements.get(Port::new(1)).unwrap().announcement.sequence, 7);
    }

    #[test]
    fn test_parent_regression_triggers_waiting() {
        let me = MockSigner::from_seed([1; 32]);
        let parent = MockSigner::from_seed([2; 32]);
        let (me, parent) = if me.public_key() > parent.public_key() {
            (parent, me)
        } else {
            (me, parent)
        };
        let mut state = TreeState::new(me, Config::fast());

        connect(&mut state, Port::new(1), *parent.public_key());

        let ann = SwitchAnnouncement::root(*parent.public_key(), 5).signed(&parent, Port::new(1));
        state.command(
            Command::Frame(Port::new(1), Frame::TreeAnnouncement(ann)),
            LocalTime::from_secs(0),
        );
        assert_eq!(state.parent, Some(Port::new(1)));

        // The parent regresses: lower sequence, same root.
        let regressed = SwitchAnnouncement::root(*parent.public_key(), 4).signed(&parent, Port::new(1));
        state.command(
            Command::Frame(Port::new(1), Frame::TreeAnnouncement(regressed)),
            LocalTime::from_secs(1),
        );

        assert!(state.waiting);
        assert_eq!(state.parent, None);

        // Further updates from the (still-regressed) parent are ignored
        // while waiting.
        let another = SwitchAnnouncement::root(*parent.public_key(), 6).signed(&parent, Port::new(1));
        state.command(
            Command::Frame(Port::new(1), Frame::TreeAnnouncement(another)),
            LocalTime::from_secs(1),
        );
        assert!(state.waiting);

        state.command(Command::ReparentTimer(state.reparent_epoch), LocalTime::from_secs(2));
        assert!(!state.waiting);
    }

    #[test]
    fn test_disconnecting_parent_triggers_reelection() {
        let me = MockSigner::default();
        let parent = MockSigner::from_seed([42; 32]);
        let mut state = TreeState::new(me, Config::fast());

        connect(&mut state, Port::new(1), *parent.public_key());
        let ann = SwitchAnnouncement::root(*parent.public_key(), 1).signed(&parent, Port::new(1));
        state.command(
            Command::Frame(Port::new(1), Frame::TreeAnnouncement(ann)),
            LocalTime::from_secs(0),
        );
        assert_eq!(state.parent, Some(Port::new(1)));

        state.command(Command::PeerDisconnected(Port::new(1)), LocalTime::from_secs(1));
        assert_eq!(state.parent, None);
        assert!(state.announcements.get(Port::new(1)).is_none());
    }
}
