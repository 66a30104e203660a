// Host interface — everything the protocol needs from the outside world.
//
// The protocol itself performs no I/O, keeps no clock and draws no
// randomness of its own: link packets, timers and entropy all arrive
// through the `Device` trait, which the embedding host implements once
// per platform (BLE central, radio bridge, simulator, ...).

use std::fmt;
use std::time::{Duration, Instant};

use crate::contacts::{ContactId, ContactsContainer};
use crate::ProtocolError;

/// Address of a directly connected link-layer peer.
///
/// Opaque to the protocol; hosts typically use a MAC address or a
/// platform connection handle rendered as a string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceAddress(pub String);

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceAddress {
    fn from(value: &str) -> Self {
        DeviceAddress(value.to_owned())
    }
}

impl From<String> for DeviceAddress {
    fn from(value: String) -> Self {
        DeviceAddress(value)
    }
}

/// Correlates a sent message with its later delivery notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(pub u64);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identifies an established end-to-end session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A deferred action scheduled through [`Device::delay`].
pub type DelayedAction = Box<dyn FnOnce() + Send>;

/// Strategy used when forwarding route requests to neighbours.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BroadcastStrategy {
    /// Forward to every neighbour except the sender.
    #[default]
    All,
    /// Forward to a random sample of neighbours, sample size growing
    /// logarithmically with the neighbour count.
    LogFunc,
    /// Forward to two randomly selected neighbours.
    Two,
}

/// Tunables for a protocol instance.
#[derive(Debug, Clone)]
pub struct ProtocolOptions {
    /// Whether the synchronization extension is enabled.
    pub enable_sync: bool,
    /// When set, no route request is sent automatically on connection.
    pub disable_auto_rreq_on_connection: bool,
    /// Max time-to-live given to broadcast or forwarded route requests.
    pub max_rreq_ttl: u16,
    /// Strategy for forwarding route requests.
    pub broadcast_strategy: BroadcastStrategy,
    /// Forward route requests even when this node matched the recipient hint.
    pub forward_rreqs_when_matching: bool,
    /// How long a receiver batches sequence numbers before acknowledging.
    pub ack_delay: Duration,
    /// How long a sender waits for an acknowledgement before breaking
    /// the session.
    pub ack_timeout: Duration,
}

impl Default for ProtocolOptions {
    fn default() -> Self {
        ProtocolOptions {
            enable_sync: false,
            disable_auto_rreq_on_connection: false,
            max_rreq_ttl: 10,
            broadcast_strategy: BroadcastStrategy::All,
            forward_rreqs_when_matching: false,
            ack_delay: Duration::from_secs(1),
            ack_timeout: Duration::from_secs(3),
        }
    }
}

impl ProtocolOptions {
    /// Default options with the synchronization extension turned on.
    pub fn with_sync() -> Self {
        ProtocolOptions {
            enable_sync: true,
            ..ProtocolOptions::default()
        }
    }
}

/// The host environment the protocol runs against.
///
/// All methods are invoked while the protocol's internal lock is held, so
/// implementations must return promptly and must never call back into the
/// [`Protocol`](crate::Protocol) from the calling thread. `delay` actions
/// re-enter the protocol through its own lock and therefore must run from
/// a separate executor, never inline.
pub trait Device: Send + Sync {
    /// Append a message to the device log.
    fn log(&self, message: &str);

    /// Transmit one link packet to the peer at `address`.
    fn send_packet(&self, address: &DeviceAddress, packet: &[u8]);

    /// Max link packet size for the peer at `address`.
    /// Must be at least 3 and less than 2^14.
    fn max_packet_size(&self, address: &DeviceAddress) -> Result<usize, ProtocolError>;

    /// A previously sent message has been confirmed delivered.
    fn message_delivered(&self, message: MessageId);

    /// A complete application message arrived on an established session.
    fn process_message(&self, session: SessionId, message: &[u8]);

    /// A matching route request was received; the returned payload is
    /// piggybacked on the route reply. `None` sends an empty reply.
    fn reply_payload(&self, session: SessionId, contact: &ContactId) -> Option<Vec<u8>>;

    /// A new session with `contact` has been established via `address`.
    fn session_established(&self, session: SessionId, contact: &ContactId, address: &DeviceAddress);

    /// A previously established session is no longer usable.
    fn session_broken(&self, session: SessionId);

    /// The synchronization state for `contact` changed. The state is the
    /// JSON-serialized model, or `None` when the contact was deleted.
    /// Only invoked when the sync option is turned on.
    fn sync_state_changed(&self, contact: &ContactId, state: Option<&[u8]>);

    /// Fill `buf` from a non-cryptographic PRNG.
    fn fill_random(&self, buf: &mut [u8]);

    /// Fill `buf` from a cryptographically secure source.
    fn fill_crypto_random(&self, buf: &mut [u8]);

    /// Run `action` after `duration` has passed. Must not run it inline.
    fn delay(&self, action: DelayedAction, duration: Duration);

    /// Current time of the device.
    fn now(&self) -> Instant;

    /// The host's contact store.
    fn contacts(&self) -> &dyn ContactsContainer;
}
