// Routing tables — duplicate suppression for route requests and
// forwarding/endpoint state per session.

use std::collections::HashMap;
use std::fmt;

use x25519_dalek::StaticSecret;
use zeroize::Zeroize;

use crate::contacts::ContactId;
use crate::device::{Device, DeviceAddress, SessionId};
use crate::util::shuffled_keys;

/// Identifies a route request; also the seed of its recipient bitmap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// One observed (or originated) route request.
///
/// Entries live for the lifetime of the node and double as the duplicate
/// suppression set. Only the originator holds the ephemeral key.
pub(crate) struct RequestEntry {
    /// Neighbour the request arrived from; `None` when we originated it.
    pub source_neighbour: Option<DeviceAddress>,
    /// Our X25519 ephemeral, kept to decrypt the eventual replies.
    pub ephemeral: Option<StaticSecret>,
}

/// One entry of the session table.
///
/// Endpoints have `contact` and `session_secret` set and exactly one
/// neighbour (the next hop toward the peer); relays have both neighbours
/// and never hold key material.
pub(crate) struct SessionEntry {
    pub request_id: RequestId,
    pub contact: Option<ContactId>,
    pub source_neighbour: Option<DeviceAddress>,
    pub target_neighbour: Option<DeviceAddress>,
    pub session_secret: Option<[u8; 32]>,
}

impl SessionEntry {
    pub fn is_endpoint(&self) -> bool {
        self.contact.is_some()
    }

    /// The neighbour on the opposite side of `addr`, for relay entries.
    pub fn opposite_neighbour(&self, addr: &DeviceAddress) -> Option<&DeviceAddress> {
        match (&self.source_neighbour, &self.target_neighbour) {
            (Some(source), Some(target)) if source == addr => Some(target),
            (Some(source), Some(target)) if target == addr => Some(source),
            _ => None,
        }
    }
}

impl Drop for SessionEntry {
    fn drop(&mut self) {
        if let Some(secret) = self.session_secret.as_mut() {
            secret.zeroize();
        }
    }
}

#[derive(Default)]
pub(crate) struct RoutingTables {
    pub requests: HashMap<RequestId, RequestEntry>,
    pub sessions: HashMap<SessionId, SessionEntry>,
}

impl RoutingTables {
    pub fn new() -> Self {
        RoutingTables::default()
    }

    pub fn session(&self, session: SessionId) -> Option<&SessionEntry> {
        self.sessions.get(&session)
    }

    /// Every endpoint session established with `contact`, in an order
    /// shuffled by the device PRNG.
    pub fn sessions_for_contact(&self, dev: &dyn Device, contact: &ContactId) -> Vec<SessionId> {
        shuffled_keys(dev, &self.sessions)
            .into_iter()
            .filter(|id| {
                self.sessions
                    .get(id)
                    .is_some_and(|entry| entry.contact.as_ref() == Some(contact))
            })
            .collect()
    }

    /// Whether any endpoint session exists for `contact`.
    pub fn has_session_for_contact(&self, contact: &ContactId) -> bool {
        self.sessions
            .values()
            .any(|entry| entry.contact.as_ref() == Some(contact))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockDevice;

    fn endpoint_entry(contact: &str) -> SessionEntry {
        SessionEntry {
            request_id: RequestId(1),
            contact: Some(ContactId(contact.into())),
            source_neighbour: Some("peer".into()),
            target_neighbour: None,
            session_secret: Some([0u8; 32]),
        }
    }

    fn relay_entry() -> SessionEntry {
        SessionEntry {
            request_id: RequestId(2),
            contact: None,
            source_neighbour: Some("left".into()),
            target_neighbour: Some("right".into()),
            session_secret: None,
        }
    }

    #[test]
    fn test_endpoint_and_relay_shapes() {
        assert!(endpoint_entry("c").is_endpoint());
        assert!(!relay_entry().is_endpoint());
    }

    #[test]
    fn test_opposite_neighbour() {
        let relay = relay_entry();
        assert_eq!(relay.opposite_neighbour(&"left".into()), Some(&"right".into()));
        assert_eq!(relay.opposite_neighbour(&"right".into()), Some(&"left".into()));
        assert_eq!(relay.opposite_neighbour(&"stranger".into()), None);

        // Endpoints have no opposite side.
        assert_eq!(endpoint_entry("c").opposite_neighbour(&"peer".into()), None);
    }

    #[test]
    fn test_sessions_for_contact_filters_endpoints() {
        let dev = MockDevice::with_seed(5);
        let mut tables = RoutingTables::new();
        tables.sessions.insert(SessionId(1), endpoint_entry("alpha"));
        tables.sessions.insert(SessionId(2), endpoint_entry("beta"));
        tables.sessions.insert(SessionId(3), relay_entry());

        let found = tables.sessions_for_contact(&dev, &ContactId("alpha".into()));
        assert_eq!(found, vec![SessionId(1)]);
        assert!(tables.has_session_for_contact(&ContactId("beta".into())));
        assert!(!tables.has_session_for_contact(&ContactId("gamma".into())));
    }
}
