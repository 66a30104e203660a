// Shared harness for multi-node scenarios: every node is a protocol
// instance over a mock device, all devices share one virtual clock, and
// the pump shuttles link packets between nodes by address, firing the
// globally earliest timer whenever no packet is in flight.

#![allow(dead_code)]

use std::sync::Arc;

use weft_core::sync::Model;
use weft_core::testing::{MockDevice, SimClock};
use weft_core::{ContactId, ContactsContainer, DeviceAddress, Protocol, ProtocolOptions, SharedSecret};

pub struct Node {
    pub name: &'static str,
    pub dev: Arc<MockDevice>,
    pub proto: Protocol,
}

impl Node {
    pub fn new(
        name: &'static str,
        seed: u64,
        options: ProtocolOptions,
        clock: &Arc<SimClock>,
    ) -> Node {
        let dev = Arc::new(MockDevice::with_clock(seed, Arc::clone(clock)));
        let proto = Protocol::new(dev.clone(), options);
        Node { name, dev, proto }
    }

    pub fn address(&self) -> DeviceAddress {
        DeviceAddress::from(self.name)
    }

    /// Store a link secret directly, bypassing the pairing handshake.
    pub fn add_link(&self, secret: [u8; 32]) -> ContactId {
        self.dev
            .contact_store()
            .new_link(SharedSecret(secret))
            .unwrap()
    }

    /// Join a group by its raw secret.
    pub fn join_group(&self, secret: [u8; 32]) -> ContactId {
        self.proto.join_group(SharedSecret(secret)).unwrap()
    }

    /// The latest persisted sync model for `contact`.
    pub fn model(&self, contact: &ContactId) -> Model {
        let state = self
            .dev
            .sync_state(contact)
            .expect("no sync state for contact")
            .expect("contact was deleted");
        Model::from_json(&state).unwrap()
    }
}

/// Bring the link between two nodes up in both directions.
pub fn connect(a: &Node, b: &Node) {
    a.proto.on_connection(&b.address());
    b.proto.on_connection(&a.address());
}

/// Deliver queued packets and run timers until the mesh goes quiet.
///
/// Packets travel instantly; when none are in flight, the delayed
/// action with the earliest virtual deadline fires next, so delayed
/// acknowledgements (1 s) always beat session timeouts (3 s). Packets
/// addressed to nodes outside `nodes` are dropped.
pub fn pump(nodes: &[&Node]) {
    loop {
        let mut progress = false;

        for node in nodes {
            for (address, packet) in node.dev.take_packets() {
                let Some(target) = nodes.iter().find(|n| n.address() == address) else {
                    continue;
                };
                target.proto.receive_packet(&node.address(), &packet);
                progress = true;
            }
        }
        if progress {
            continue;
        }

        let next = nodes
            .iter()
            .filter_map(|node| node.dev.next_delay_at().map(|at| (at, *node)))
            .min_by_key(|(at, _)| *at);
        if let Some((_, node)) = next {
            node.dev.run_next_delay_action();
            continue;
        }

        break;
    }
}
