use std::ops::Deref;
use std::time;

use crossbeam_channel as chan;

use crate::crypto::PublicKey;
use crate::port::Port;

/// A tree-state event, delivered to subscribers via [`Events`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// This node's parent changed (including becoming, or ceasing to be,
    /// root).
    ParentChanged {
        parent: Option<Port>,
    },
    /// The root key of the tree this node is attached to changed.
    RootChanged {
        root_key: PublicKey,
    },
    /// This node's own coordinates changed.
    CoordsChanged {
        coords: Vec<Port>,
    },
}

/// A subscriber's feed of tree-state events.
pub struct Events(chan::Receiver<Event>);

impl From<chan::Receiver<Event>> for Events {
    fn from(value: chan::Receiver<Event>) -> Self {
        Self(value)
    }
}

impl Deref for Events {
    type Target = chan::Receiver<Event>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Events {
    /// Listen for events, and wait for the given predicate to return `true`,
    /// or timeout if the specified amount of time has elapsed.
    pub fn wait<F>(&self, mut f: F, timeout: time::Duration) -> Result<Event, chan::RecvTimeoutError>
    where
        F: FnMut(&Event) -> bool,
    {
        let start = time::Instant::now();

        loop {
            if let Some(remaining) = timeout.checked_sub(start.elapsed()) {
                match self.recv_timeout(remaining) {
                    Ok(event) => {
                        if f(&event) {
                            return Ok(event);
                        }
                    }
                    Err(err @ chan::RecvTimeoutError::Disconnected) => return Err(err),
                    Err(chan::RecvTimeoutError::Timeout) => continue,
                }
            } else {
                return Err(chan::RecvTimeoutError::Timeout);
            }
        }
    }
}

/// Sink side used internally by the tree actor to publish events; cloned
/// freely since it's backed by an unbounded `crossbeam_channel`.
#[derive(Debug, Clone, Default)]
pub struct EventSinks {
    sinks: Vec<chan::Sender<Event>>,
}

impl EventSinks {
    pub fn subscribe(&mut self) -> Events {
        let (tx, rx) = chan::unbounded();
        self.sinks.push(tx);
        Events::from(rx)
    }

    pub fn emit(&mut self, event: Event) {
        self.sinks.retain(|sink| sink.send(event.clone()).is_ok());
    }
}
