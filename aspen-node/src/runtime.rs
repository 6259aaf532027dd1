//! Spawns the tree state actor on its own OS thread and hands back a
//! cloneable [`Handle`]: the public, `Send`-able façade over the actor's
//! `crossbeam_channel::Sender<Command>`.
//!
//! Timers are owned here, not by [`crate::service::TreeState`] itself: a
//! state transition only ever *requests* a wakeup by pushing an [`Io`]
//! value, and this module is what turns that request into an actual
//! `thread::sleep` and a `Command` posted back onto the actor's channel.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crossbeam_channel as chan;
use log::{debug, trace};
use thiserror::Error;

use crate::crypto::{PublicKey, Signer};
use crate::message::{Destination, Frame};
use crate::port::Port;
use crate::resolver::NextHop;
use crate::service::{self, Command, Config, Events, Io, NodeState, PeerInfo, TreeState};
use crate::LocalTime;

/// An error resulting from a [`Handle`] method.
#[derive(Error, Debug)]
pub enum Error {
    /// The actor has shut down (or never started) and its command channel
    /// is disconnected.
    #[error("the tree state actor is not running")]
    NotConnected,
}

impl<T> From<chan::SendError<T>> for Error {
    fn from(_: chan::SendError<T>) -> Self {
        Self::NotConnected
    }
}

impl From<chan::RecvError> for Error {
    fn from(_: chan::RecvError) -> Self {
        Self::NotConnected
    }
}

/// The cloneable façade over the tree state actor's command channel.
///
/// Every method here either fires a `Command` and returns immediately, or
/// performs a `Command::QueryState`/`Command::Subscribe` round-trip that
/// blocks until the actor has executed it on its own thread.
pub struct Handle<G> {
    commands: chan::Sender<Command<G>>,
    shutdown: Arc<AtomicBool>,
}

impl<G> Clone for Handle<G> {
    fn clone(&self) -> Self {
        Self {
            commands: self.commands.clone(),
            shutdown: self.shutdown.clone(),
        }
    }
}

impl<G> std::fmt::Debug for Handle<G> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle").finish_non_exhaustive()
    }
}

impl<G: Signer + 'static> Handle<G> {
    fn command(&self, cmd: Command<G>) -> Result<(), Error> {
        self.commands.send(cmd).map_err(Error::from)
    }

    /// The transport reports a new peer connection.
    pub fn peer_connected(&self, port: Port, remote_key: PublicKey) -> Result<(), Error> {
        self.command(Command::PeerConnected(port, remote_key))
    }

    /// The transport reports a peer disconnection.
    pub fn peer_disconnected(&self, port: Port) -> Result<(), Error> {
        self.command(Command::PeerDisconnected(port))
    }

    /// An inbound frame arrived from `port`.
    pub fn frame(&self, port: Port, frame: Frame) -> Result<(), Error> {
        self.command(Command::Frame(port, frame))
    }

    /// Stop the actor. Safe to call more than once.
    pub fn shutdown(&self) -> Result<(), Error> {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.command(Command::Shutdown)
    }

    /// Register a new event subscriber.
    pub fn subscribe(&self) -> Result<Events, Error> {
        let (tx, rx) = chan::bounded(1);
        self.command(Command::Subscribe(tx))?;
        rx.recv().map_err(Error::from)
    }

    /// This node's current tree coordinates.
    pub fn coords(&self) -> Result<Vec<Port>, Error> {
        self.query(|state| state.coords())
    }

    /// Snapshot of all known peers.
    pub fn peers(&self) -> Result<Vec<PeerInfo>, Error> {
        self.query(|state| state.peers())
    }

    /// Snapshot of the node's full tree state.
    pub fn node_state(&self) -> Result<NodeState, Error> {
        self.query(|state| state.node_state())
    }

    /// Resolve the outgoing peer for a frame arriving from `from`.
    pub fn next_hop(&self, from: Option<Port>, destination: Destination) -> Result<NextHop, Error> {
        self.query(move |state| state.next_hop(from, &destination))
    }

    /// Run `f` against the actor's state on its own thread, blocking until
    /// the query has executed, and return its result.
    fn query<T, F>(&self, f: F) -> Result<T, Error>
    where
        T: Send + 'static,
        F: Fn(&TreeState<G>) -> T + Send + Sync + 'static,
    {
        let (ack_tx, ack_rx) = chan::bounded(1);
        let slot: Arc<Mutex<Option<T>>> = Arc::new(Mutex::new(None));
        let out = slot.clone();

        let query: Arc<service::QueryState<G>> = Arc::new(move |state: &TreeState<G>| {
            *out.lock().expect("query result lock is never poisoned") = Some(f(state));
        });

        self.command(Command::QueryState(query, ack_tx))?;
        ack_rx.recv()?;

        Ok(slot
            .lock()
            .expect("query result lock is never poisoned")
            .take()
            .expect("the query closure always runs before the actor acknowledges it"))
    }
}

/// Owns the worker thread running a [`TreeState`] and the timer threads that
/// turn its `Io::Wakeup`/`Io::ReparentTimeout` requests back into
/// `Command`s. Dropping or shutting down a `Runtime` stops all of them.
pub struct Runtime<G> {
    handle: Handle<G>,
    /// Frames the actor wants delivered to a peer or to the local endpoint.
    /// The embedding transport drains this; this core does no I/O itself.
    outgoing: chan::Receiver<Io>,
    worker: Option<thread::JoinHandle<()>>,
}

impl<G: Signer + Send + 'static> Runtime<G> {
    /// Spawn the actor on its own thread and start the periodic maintenance
    /// timer.
    pub fn spawn(signer: G, config: Config) -> Self {
        let (commands_tx, commands_rx) = chan::unbounded::<Command<G>>();
        let (outgoing_tx, outgoing_rx) = chan::unbounded::<Io>();
        let shutdown = Arc::new(AtomicBool::new(false));

        let worker = thread::Builder::new()
            .name("aspen-tree-state".into())
            .spawn({
                let commands_tx = commands_tx.clone();
                let shutdown = shutdown.clone();

                move || {
                    let mut state = TreeState::new(signer, config);
                    let drain = |state: &mut TreeState<G>| {
                        for io in state.outbox() {
                            match io {
                                Io::Send(..) | Io::Deliver(..) => {
                                    if outgoing_tx.send(io).is_err() {
                                        trace!(target: "runtime", "outgoing frame dropped: receiver gone");
                                    }
                                }
                                Io::Wakeup(after) => {
                                    spawn_timer(commands_tx.clone(), shutdown.clone(), after, Command::Tick);
                                }
                                Io::ReparentTimeout(after, epoch) => {
                                    spawn_timer(
                                        commands_tx.clone(),
                                        shutdown.clone(),
                                        after,
                                        Command::ReparentTimer(epoch),
                                    );
                                }
                            }
                        }
                    };

                    // `TreeState::new` already queued the first maintenance
                    // wakeup; start that timer before waiting on the first
                    // command so a node with no peers yet still announces.
                    drain(&mut state);

                    while let Ok(cmd) = commands_rx.recv() {
                        let is_shutdown = matches!(cmd, Command::Shutdown);
                        let now = LocalTime::now();

                        state.command(cmd, now);
                        drain(&mut state);

                        if is_shutdown {
                            debug!(target: "runtime", "actor shutting down");
                            break;
                        }
                    }
                }
            })
            .expect("spawning the tree state actor thread should not fail");

        Self {
            handle: Handle {
                commands: commands_tx,
                shutdown,
            },
            outgoing: outgoing_rx,
            worker: Some(worker),
        }
    }

    /// A cloneable handle to this runtime's actor.
    pub fn handle(&self) -> Handle<G> {
        self.handle.clone()
    }

    /// The channel of outbound frames (`Io::Send`/`Io::Deliver`) the
    /// embedding transport must drain and act on.
    pub fn outgoing(&self) -> &chan::Receiver<Io> {
        &self.outgoing
    }

    /// Request shutdown and block until the actor thread has exited.
    pub fn join(mut self) {
        let _ = self.handle.shutdown();
        if let Some(worker) = self.worker.take() {
            worker.join().ok();
        }
    }
}

impl<G> Drop for Runtime<G> {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = self.handle.shutdown();
            worker.join().ok();
        }
    }
}

/// Spawn a one-shot timer thread that sleeps for `after`, then posts `cmd`
/// back onto the actor's command channel unless shutdown has been
/// requested in the meantime.
fn spawn_timer<G: Send + 'static>(
    commands: chan::Sender<Command<G>>,
    shutdown: Arc<AtomicBool>,
    after: crate::LocalDuration,
    cmd: Command<G>,
) {
    thread::spawn(move || {
        thread::sleep(to_std_duration(after));

        if shutdown.load(Ordering::SeqCst) {
            return;
        }
        commands.send(cmd).ok();
    });
}

fn to_std_duration(d: crate::LocalDuration) -> Duration {
    Duration::from_millis(d.as_millis() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::test::signer::MockSigner;
    use crate::message::SwitchAnnouncement;
    use crate::service::Config;
    use std::time;

    #[test]
    fn test_spawn_and_query_coords() {
        let signer = MockSigner::default();
        let runtime = Runtime::spawn(signer, Config::fast());
        let handle = runtime.handle();

        assert_eq!(handle.coords().unwrap(), Vec::<Port>::new());
        runtime.join();
    }

    #[test]
    fn test_handle_after_shutdown_errs() {
        let signer = MockSigner::default();
        let runtime = Runtime::spawn(signer, Config::fast());
        let handle = runtime.handle();

        handle.shutdown().unwrap();
        runtime.join();

        assert!(handle.coords().is_err());
    }

    #[test]
    fn test_peer_connected_then_frame_elects_parent() {
        let low = MockSigner::from_seed([1; 32]);
        let high = MockSigner::from_seed([2; 32]);
        let (low, high) = if low.public_key() > high.public_key() {
            (high, low)
        } else {
            (low, high)
        };

        let runtime = Runtime::spawn(low, Config::fast());
        let handle = runtime.handle();
        let events = handle.subscribe().unwrap();

        handle.peer_connected(Port::new(1), *high.public_key()).unwrap();
        handle
            .frame(
                Port::new(1),
                Frame::TreeAnnouncement(
                    SwitchAnnouncement::root(*high.public_key(), 1).signed(&high, Port::new(1)),
                ),
            )
            .unwrap();

        let event = events.wait(
            |e| matches!(e, service::Event::ParentChanged { parent: Some(_) }),
            time::Duration::from_secs(2),
        );

        assert!(event.is_ok(), "expected a ParentChanged event within the timeout");
        assert_eq!(handle.coords().unwrap(), vec![Port::new(1)]);

        runtime.join();
    }
}
