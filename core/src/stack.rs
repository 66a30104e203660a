// The protocol core — every layer's state behind one lock.
//
// The layers are re-entrant across each other (a route request asks the
// upper layers for its reply payload, a sync merge sends pushes back
// down through transport), so their state lives together in one struct
// and each layer contributes its logic as `impl ProtocolCore` blocks in
// its own module. The public `Protocol` handle serializes every entry
// point through the mutex; timer actions re-enter the same way via a
// weak handle.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;

use crate::app::PendingPush;
use crate::device::{Device, DeviceAddress, MessageId, ProtocolOptions};
use crate::link::LinkState;
use crate::routing::RoutingTables;
use crate::sync::Synchronizer;
use crate::transport::TransportTables;

pub(crate) struct ProtocolCore {
    pub(crate) dev: Arc<dyn Device>,
    pub(crate) options: ProtocolOptions,
    handle: Weak<Mutex<ProtocolCore>>,
    pub(crate) link: LinkState,
    pub(crate) routing: RoutingTables,
    pub(crate) transport: TransportTables,
    /// Present iff the sync option is enabled.
    pub(crate) sync: Option<Synchronizer>,
    /// Outstanding sync pushes awaiting their delivery confirmation.
    pub(crate) pending_pushes: HashMap<MessageId, PendingPush>,
}

impl ProtocolCore {
    pub(crate) fn new(dev: Arc<dyn Device>, options: ProtocolOptions) -> Arc<Mutex<ProtocolCore>> {
        Arc::new_cyclic(|handle| {
            Mutex::new(ProtocolCore {
                dev,
                sync: options.enable_sync.then(Synchronizer::new),
                options,
                handle: handle.clone(),
                link: LinkState::new(),
                routing: RoutingTables::new(),
                transport: TransportTables::new(),
                pending_pushes: HashMap::new(),
            })
        })
    }

    /// Run `action` against the core after `duration`, through the
    /// host's delay facility and this core's lock. Dropped silently when
    /// the protocol has been torn down by then.
    pub(crate) fn schedule<F>(&self, duration: Duration, action: F)
    where
        F: FnOnce(&mut ProtocolCore) + Send + 'static,
    {
        let handle = self.handle.clone();
        self.dev.delay(
            Box::new(move || {
                if let Some(core) = handle.upgrade() {
                    action(&mut core.lock());
                }
            }),
            duration,
        );
    }

    /// A link to `address` is up and ready for packets.
    pub(crate) fn on_connection(&mut self, address: &DeviceAddress) {
        let dev = Arc::clone(&self.dev);
        self.link.on_connection(dev.as_ref(), address);

        if !self.options.disable_auto_rreq_on_connection {
            self.send_route_request(address, 1);
        }
    }

    /// The link to `address` is gone; tear down everything riding on it.
    pub(crate) fn on_disconnection(&mut self, address: &DeviceAddress) {
        self.transport_disconnect(address);
        self.link.on_disconnection(address);
        self.routing_disconnect(address);
    }

    /// One link packet arrived from `sender`: reassemble messages, route
    /// them, and deliver whatever reaches the application layer.
    pub(crate) fn receive_packet(&mut self, sender: &DeviceAddress, packet: &[u8]) {
        let dev = Arc::clone(&self.dev);
        let messages = self.link.receive(dev.as_ref(), sender, packet);

        for message in messages {
            let Some(session_message) = self.handle_routing_message(sender, &message) else {
                continue;
            };

            let delivered =
                self.handle_transport_message(session_message.session, &session_message.data);
            for message in delivered {
                self.handle_app_message(message.session, &message.contact, &message.data);
            }
        }
    }
}
