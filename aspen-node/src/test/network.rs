//! An in-process network of real [`Runtime`]s wired together over explicit
//! links, for integration tests that want to watch actual convergence
//! rather than poke at a single [`TreeState`](crate::service::TreeState).
//!
//! Each node runs on its own OS thread, same as in production; a pump
//! thread per node drains its `Io::Send` frames and redelivers them to
//! whatever endpoint the link table says is on the other end. There is no
//! virtual clock: tests use [`crate::service::Config::fast`] timings and
//! poll with real timeouts.
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread;

use crate::crypto::{PublicKey, Signer};
use crate::port::Port;
use crate::runtime::{Handle, Runtime};
use crate::service::{Config, Io};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct Endpoint {
    node: PublicKey,
    port: Port,
}

/// A small simulated network: add nodes, link their ports, then drive them
/// exactly like a real deployment would, through each node's [`Handle`].
pub struct Network<G> {
    runtimes: HashMap<PublicKey, Runtime<G>>,
    handles: Arc<Mutex<HashMap<PublicKey, Handle<G>>>>,
    links: Arc<Mutex<HashMap<Endpoint, Endpoint>>>,
    pumps: Vec<thread::JoinHandle<()>>,
}

impl<G> Default for Network<G> {
    fn default() -> Self {
        Self {
            runtimes: HashMap::new(),
            handles: Arc::new(Mutex::new(HashMap::new())),
            links: Arc::new(Mutex::new(HashMap::new())),
            pumps: Vec::new(),
        }
    }
}

impl<G: Signer + Send + 'static> Network<G> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a node's actor and the pump thread that relays its outgoing
    /// frames to whatever it's linked to. Returns the node's key.
    pub fn add(&mut self, signer: G, config: Config) -> PublicKey {
        let key = *signer.public_key();
        let runtime = Runtime::spawn(signer, config);
        let outgoing = runtime.outgoing().clone();

        self.handles.lock().expect("handle table lock is never poisoned").insert(key, runtime.handle());

        let handles = self.handles.clone();
        let links = self.links.clone();
        let pump = thread::Builder::new()
            .name(format!("network-pump-{key}"))
            .spawn(move || {
                while let Ok(io) = outgoing.recv() {
                    let Io::Send(port, frame) = io else {
                        // `Io::Deliver` is local-endpoint delivery; this
                        // harness has no application layer to hand it to.
                        continue;
                    };
                    let src = Endpoint { node: key, port };
                    let Some(dst) = links.lock().expect("link table lock is never poisoned").get(&src).copied()
                    else {
                        continue;
                    };
                    let dst_handle = handles
                        .lock()
                        .expect("handle table lock is never poisoned")
                        .get(&dst.node)
                        .cloned();
                    if let Some(dst_handle) = dst_handle {
                        let _ = dst_handle.frame(dst.port, frame);
                    }
                }
            })
            .expect("spawning a network pump thread should not fail");

        self.runtimes.insert(key, runtime);
        self.pumps.push(pump);
        key
    }

    /// Link two node/port endpoints bidirectionally and tell both actors
    /// about the new peer.
    pub fn link(&mut self, a: PublicKey, a_port: Port, b: PublicKey, b_port: Port) {
        {
            let mut links = self.links.lock().expect("link table lock is never poisoned");
            links.insert(Endpoint { node: a, port: a_port }, Endpoint { node: b, port: b_port });
            links.insert(Endpoint { node: b, port: b_port }, Endpoint { node: a, port: a_port });
        }

        self.handle(&a).peer_connected(a_port, b).expect("node a's actor is running");
        self.handle(&b).peer_connected(b_port, a).expect("node b's actor is running");
    }

    /// Tear down a link without disconnecting the nodes involved otherwise.
    pub fn unlink(&mut self, a: PublicKey, a_port: Port, b: PublicKey, b_port: Port) {
        {
            let mut links = self.links.lock().expect("link table lock is never poisoned");
            links.remove(&Endpoint { node: a, port: a_port });
            links.remove(&Endpoint { node: b, port: b_port });
        }

        self.handle(&a).peer_disconnected(a_port).expect("node a's actor is running");
        self.handle(&b).peer_disconnected(b_port).expect("node b's actor is running");
    }

    pub fn handle(&self, key: &PublicKey) -> Handle<G> {
        self.handles
            .lock()
            .expect("handle table lock is never poisoned")
            .get(key)
            .cloned()
            .expect("node was added to this network")
    }
}

impl<G> Drop for Network<G> {
    fn drop(&mut self) {
        for (_, runtime) in self.runtimes.drain() {
            runtime.join();
        }
        for pump in self.pumps.drain(..) {
            pump.join().ok();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::crypto::test::signer::MockSigner;
    use crate::service::{self, Config};

    fn ordered_pair(a: MockSigner, b: MockSigner) -> (MockSigner, MockSigner) {
        if a.public_key() > b.public_key() {
            (b, a)
        } else {
            (a, b)
        }
    }

    #[test]
    fn test_two_node_network_converges() {
        let (low, high) = ordered_pair(MockSigner::from_seed([1; 32]), MockSigner::from_seed([2; 32]));
        let high_key = *high.public_key();

        let mut net = Network::new();
        let a = net.add(low, Config::fast());
        let b = net.add(high, Config::fast());

        let events = net.handle(&a).subscribe().unwrap();
        net.link(a, Port::new(1), b, Port::new(1));

        events
            .wait(
                |e| matches!(e, service::Event::ParentChanged { parent: Some(_) }),
                Duration::from_secs(2),
            )
            .expect("the lower-key node should adopt the higher-key node as parent");

        assert_eq!(net.handle(&a).coords().unwrap(), vec![Port::new(1)]);
        assert_eq!(net.handle(&b).node_state().unwrap().self_key, high_key);
        assert!(net.handle(&b).coords().unwrap().is_empty());
    }

    #[test]
    fn test_root_failure_triggers_reconvergence() {
        let (low, high) = ordered_pair(MockSigner::from_seed([3; 32]), MockSigner::from_seed([4; 32]));
        let low_key = *low.public_key();

        let mut net = Network::new();
        let a = net.add(low.clone(), Config::fast());
        let b = net.add(high, Config::fast());

        let events = net.handle(&a).subscribe().unwrap();
        net.link(a, Port::new(1), b, Port::new(1));

        events
            .wait(
                |e| matches!(e, service::Event::ParentChanged { parent: Some(_) }),
                Duration::from_secs(2),
            )
            .expect("initial election");

        // The root disappears.
        net.unlink(a, Port::new(1), b, Port::new(1));

        events
            .wait(|e| matches!(e, service::Event::ParentChanged { parent: None }), Duration::from_secs(2))
            .expect("losing the only peer should make the node root itself");

        assert!(net.handle(&a).coords().unwrap().is_empty());
        assert_eq!(net.handle(&a).node_state().unwrap().self_key, low_key);
    }

    #[test]
    fn test_three_node_chain_forwards_by_distance() {
        // r - x - y, with `r` the highest key so it roots the tree.
        let mut signers = vec![
            MockSigner::from_seed([10; 32]),
            MockSigner::from_seed([11; 32]),
            MockSigner::from_seed([12; 32]),
        ];
        signers.sort_by_key(|s| *s.public_key());
        let (x_signer, y_signer, r_signer) = (signers[0].clone(), signers[1].clone(), signers[2].clone());

        let mut net = Network::new();
        let r = net.add(r_signer, Config::fast());
        let x = net.add(x_signer, Config::fast());
        let y = net.add(y_signer, Config::fast());

        let r_events = net.handle(&r).subscribe().unwrap();
        let x_events = net.handle(&x).subscribe().unwrap();
        let y_events = net.handle(&y).subscribe().unwrap();

        net.link(r, Port::new(1), x, Port::new(1));
        net.link(x, Port::new(2), y, Port::new(1));

        x_events
            .wait(
                |e| matches!(e, service::Event::ParentChanged { parent: Some(_) }),
                Duration::from_secs(2),
            )
            .expect("x should adopt r as parent");
        y_events
            .wait(
                |e| matches!(e, service::Event::ParentChanged { parent: Some(_) }),
                Duration::from_secs(2),
            )
            .expect("y should adopt x as parent");
        // `r` never changes parent (it stays root); just let its announcements settle.
        let _ = r_events.wait(|_| false, Duration::from_millis(200));

        // x's coordinates: [1] (via r). y's coordinates: [1, 2] (r -> x -> y).
        assert_eq!(net.handle(&x).coords().unwrap(), vec![Port::new(1)]);
        assert_eq!(net.handle(&y).coords().unwrap(), vec![Port::new(1), Port::new(2)]);

        // A frame arriving at `x` from its local endpoint addressed to `y`'s
        // coordinates must be forwarded out on port 2 (toward `y`), not back
        // toward `r`.
        let next_hop = net
            .handle(&x)
            .next_hop(None, crate::message::Destination::Coordinates(vec![Port::new(1), Port::new(2)]))
            .unwrap();
        assert_eq!(next_hop, crate::resolver::NextHop::Forward(Port::new(2)));
    }
}
