//! Delay-tolerant, source-routed, end-to-end-encrypted mesh messaging.
//!
//! Peers are organized into contacts — pairwise links or multi-party
//! groups — each keyed by a 32-byte shared secret. The stack discovers
//! multi-hop paths through intermittently connected neighbours,
//! establishes authenticated sessions over them, delivers application
//! messages reliably, and (optionally) gossips a signed per-contact log
//! between all members.
//!
//! The crate performs no I/O of its own: the host feeds link packets in
//! through [`Protocol::receive_packet`] and carries everything else —
//! radio sends, timers, randomness, persistence — through the [`Device`]
//! trait.
//!
//! ```no_run
//! use std::sync::Arc;
//! use weft_core::{Protocol, ProtocolOptions};
//! # fn host_device() -> Arc<dyn weft_core::Device> { unimplemented!() }
//!
//! let dev: Arc<dyn weft_core::Device> = host_device();
//! let protocol = Protocol::new(dev, ProtocolOptions::default());
//!
//! protocol.on_connection(&"peer-1".into());
//! protocol.broadcast_route_request();
//! ```

pub mod contacts;
pub mod device;
pub mod link;
pub mod routing;
pub mod sync;
pub mod testing;
pub mod transport;

mod app;
mod stack;
mod util;

pub use contacts::{
    ContactId, ContactsContainer, LinkingSession, MemoryContactsContainer, SharedSecret,
};
pub use device::{
    BroadcastStrategy, DelayedAction, Device, DeviceAddress, MessageId, ProtocolOptions, SessionId,
};

use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;

use stack::ProtocolCore;

/// Failures surfaced to the host. Network-level problems (malformed
/// packets, unknown sessions, failed decryptions) never appear here;
/// they are logged and dropped, and delivery outcomes reach the host
/// only through [`Device::message_delivered`] and
/// [`Device::session_broken`].
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("contact not found")]
    ContactNotFound,
    #[error("session not found")]
    SessionNotFound,
    #[error("cannot send on an intermediary session")]
    IntermediarySession,
    #[error("group already joined")]
    DuplicateGroup,
    #[error("shared secret must be 32 bytes, got {0}")]
    SecretLength(usize),
    #[error("synchronization is not enabled")]
    SyncDisabled,
    #[error("no contacts could be encoded in the route request")]
    EmptyRouteRequest,
    #[error("crypto failure: {0}")]
    Crypto(&'static str),
    #[error("sync: {0}")]
    Sync(#[from] sync::SyncError),
    #[error("device error: {0}")]
    Device(String),
}

/// The protocol stack. Cheap to clone; all clones share one serialized
/// core, so hosts may call it from any thread.
#[derive(Clone)]
pub struct Protocol {
    core: Arc<Mutex<ProtocolCore>>,
    dev: Arc<dyn Device>,
}

impl Protocol {
    pub fn new(dev: Arc<dyn Device>, options: ProtocolOptions) -> Self {
        Protocol {
            core: ProtocolCore::new(Arc::clone(&dev), options),
            dev,
        }
    }

    fn log(&self, message: &str) {
        self.dev.log(&format!("proto:{message}"));
    }

    /// Provision sync models for contacts already in the host's store.
    /// Call once on startup, after loading persisted models through
    /// [`Protocol::sync_load_state`].
    pub fn load_persisted_state(&self) {
        self.log("load_persisted_state");
        self.core.lock().load_persisted_state();
    }

    /// A link-layer connection to `address` is established and ready.
    pub fn on_connection(&self, address: &DeviceAddress) {
        self.log(&format!("on_connection:{address}"));
        self.core.lock().on_connection(address);
    }

    /// The link-layer connection to `address` is gone.
    pub fn on_disconnection(&self, address: &DeviceAddress) {
        self.log(&format!("on_disconnection:{address}"));
        self.core.lock().on_disconnection(address);
    }

    /// A link packet arrived from `address`.
    pub fn receive_packet(&self, address: &DeviceAddress, packet: &[u8]) {
        self.log(&format!("receive_packet:{address}:{} bytes", packet.len()));
        self.core.lock().receive_packet(address, packet);
    }

    /// Send a message on an established session. The returned id is
    /// echoed by [`Device::message_delivered`] once the peer confirms.
    pub fn send_message(
        &self,
        session: SessionId,
        message: &[u8],
    ) -> Result<MessageId, ProtocolError> {
        self.log(&format!("send_message:{session}:{} bytes", message.len()));
        self.core.lock().send_message(session, message)
    }

    /// Flood a route request for every contact that lacks a session.
    pub fn broadcast_route_request(&self) {
        self.log("broadcast_rreq");
        self.core.lock().broadcast_route_request();
    }

    /// Create a group with a fresh random secret and start looking for
    /// members.
    pub fn new_group(&self) -> Result<ContactId, ProtocolError> {
        self.log("new_group");
        let mut secret = [0u8; 32];
        self.dev.fill_crypto_random(&mut secret);
        let result = self.core.lock().join_group(SharedSecret(secret));
        if let Err(err) = &result {
            tracing::warn!(error = %err, "failed to create group");
        }
        result
    }

    /// Join a group whose secret was obtained elsewhere (typically from
    /// an invitation attached to a sync message).
    pub fn join_group(&self, secret: SharedSecret) -> Result<ContactId, ProtocolError> {
        self.log("join_group");
        self.core.lock().join_group(secret)
    }

    /// Begin a pairing handshake; exchange [`LinkingSession::share`]
    /// values out of band, then finish with [`Protocol::linking_create`].
    pub fn linking_start(&self) -> LinkingSession {
        self.log("linking_start");
        LinkingSession::start()
    }

    /// Finish a pairing handshake with the peer's public share, storing
    /// the derived link contact.
    pub fn linking_create(
        &self,
        session: &LinkingSession,
        remote_share: &[u8],
    ) -> Result<ContactId, ProtocolError> {
        self.log("linking_create");

        let secret = session.create_contact(remote_share).map_err(|err| {
            tracing::warn!(error = %err, "linking failed");
            err
        })?;

        let mut core = self.core.lock();
        let contact = core.dev.contacts().new_link(secret)?;

        if let Err(err) = core.contact_created(&contact, sync::ModelType::Link) {
            // Roll back so a failed provisioning leaves no orphan.
            core.dev.contacts().delete_contact(&contact);
            return Err(err);
        }

        core.broadcast_route_request();
        Ok(contact)
    }

    /// Forget a contact; future requests from it will be ignored.
    pub fn delete_contact(&self, contact: &ContactId) {
        self.log(&format!("delete_contact:{contact}"));
        self.core.lock().delete_contact(contact);
    }

    /// Add a message to a contact's synchronized log. With
    /// `attached_contact` set, that contact's secret rides along as an
    /// invitation for the other members.
    ///
    /// Requires the sync option.
    pub fn sync_add_message(
        &self,
        contact: &ContactId,
        message: &[u8],
        attached_contact: Option<&ContactId>,
    ) -> Result<(), ProtocolError> {
        self.log("sync_add_message");
        self.core
            .lock()
            .sync_add_message(contact, message, attached_contact)
    }

    /// Restore a contact's sync model from state previously handed to
    /// [`Device::sync_state_changed`].
    ///
    /// Requires the sync option.
    pub fn sync_load_state(&self, contact: &ContactId, state: &[u8]) -> Result<(), ProtocolError> {
        self.log("sync_load_state");
        self.core.lock().sync_load_state(contact, state)
    }
}
