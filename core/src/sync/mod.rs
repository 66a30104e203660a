// Synchronization extension — per-contact signed-log replication with
// pull/push gossip.
//
// Pure engine: methods mutate the models and return the side effects
// (pushes to emit, discovery broadcasts, state snapshots for the host)
// for the application layer to carry out.

mod delta;
mod digest;
mod model;
mod packet;

pub use delta::Delta;
pub use digest::{Digest, Version};
pub use model::{Model, ModelMessage, ModelType, NodePublicKey, NodeStates};
pub use packet::{PullPacket, PushPacket, SYNC_PULL, SYNC_PUSH};

use std::collections::HashMap;

use ed25519_dalek::SigningKey;
use thiserror::Error;

use crate::contacts::{ContactId, SharedSecret};
use crate::device::{Device, SessionId};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("no sync state for contact")]
    ContactNotFound,
    #[error("buffer too short when decoding {0}")]
    Truncated(&'static str),
    #[error("invalid sync packet type {0}")]
    UnknownType(u8),
    #[error("invalid signature")]
    Signature,
    #[error("invalid state json: {0}")]
    Json(#[from] serde_json::Error),
}

/// A side effect the application layer must perform.
#[derive(Debug)]
pub enum SyncEffect {
    /// The model for `contact` changed; hand the host its JSON snapshot.
    StateChanged { contact: ContactId, state: Vec<u8> },
    /// Send `packet` to the peer on `session`.
    PushUpdates {
        contact: ContactId,
        session: SessionId,
        packet: PushPacket,
    },
    /// No session currently reaches `contact`; a route request may find
    /// one.
    DiscoverContact { contact: ContactId },
}

struct SyncSession {
    contact: ContactId,
    public_key: NodePublicKey,
    /// True once a PULL arrived on this session. Until then the peer's
    /// digest is unknown and proactive pushes would be wasted bytes.
    received_pull: bool,
}

/// The sync engine: one model per contact plus per-session peer state.
#[derive(Default)]
pub struct Synchronizer {
    models: HashMap<ContactId, Model>,
    sessions: HashMap<SessionId, SyncSession>,
}

impl Synchronizer {
    pub fn new() -> Self {
        Synchronizer::default()
    }

    fn log(dev: &dyn Device, message: &str) {
        dev.log(&format!("sync:{message}"));
    }

    pub fn has_contact(&self, contact: &ContactId) -> bool {
        self.models.contains_key(contact)
    }

    /// Provision a fresh model for `contact` under the given identity.
    pub fn new_contact(
        &mut self,
        dev: &dyn Device,
        contact: ContactId,
        signing_key: SigningKey,
        model_type: ModelType,
    ) -> Result<Vec<SyncEffect>, SyncError> {
        Self::log(dev, &format!("new_contact:{model_type}:{contact}"));

        self.models
            .insert(contact.clone(), Model::new(signing_key, model_type));
        Ok(vec![self.state_changed(&contact)?])
    }

    pub fn delete_contact(&mut self, dev: &dyn Device, contact: &ContactId) {
        Self::log(dev, &format!("delete_contact:{contact}"));
        self.models.remove(contact);
    }

    /// Restore a model from its persisted JSON snapshot.
    pub fn load_state(
        &mut self,
        dev: &dyn Device,
        contact: ContactId,
        state: &[u8],
    ) -> Result<Vec<SyncEffect>, SyncError> {
        let model = Model::from_json(state)?;
        Self::log(dev, &format!("state:load:{}", model.node_states.len()));

        self.models.insert(contact.clone(), model);
        Ok(vec![self.state_changed(&contact)?])
    }

    /// The PULL handed to a fresh session with `contact`.
    pub fn pull_packet(&mut self, contact: &ContactId) -> Result<PullPacket, SyncError> {
        let model = self.models.get_mut(contact).ok_or(SyncError::ContactNotFound)?;
        Ok(PullPacket::new(model))
    }

    pub fn session_broken(&mut self, dev: &dyn Device, session: SessionId) {
        Self::log(dev, &format!("session_broken:{session}"));
        self.sessions.remove(&session);
    }

    /// Publish a locally authored message, optionally attaching another
    /// contact's secret (a group invitation).
    pub fn new_message(
        &mut self,
        dev: &dyn Device,
        contact: &ContactId,
        body: &[u8],
        attached_secret: Option<SharedSecret>,
    ) -> Result<Vec<SyncEffect>, SyncError> {
        Self::log(dev, &format!("new_message:{contact}"));

        let model = self.models.get_mut(contact).ok_or(SyncError::ContactNotFound)?;
        model.new_message(body.to_vec(), attached_secret);

        let mut effects = vec![self.state_changed(contact)?];
        self.push_state_updates(dev, contact, &mut effects)?;
        Ok(effects)
    }

    /// Dispatch one received sync packet (tag byte already stripped).
    pub fn receive_packet(
        &mut self,
        dev: &dyn Device,
        contact: &ContactId,
        session: SessionId,
        packet: &[u8],
    ) -> Result<Vec<SyncEffect>, SyncError> {
        match packet.first() {
            Some(&SYNC_PULL) => {
                let pull = PullPacket::decode(packet)?;
                self.handle_pull(dev, session, contact, pull)
            }
            Some(&SYNC_PUSH) => {
                let push = PushPacket::decode(packet)?;
                self.merge_push(dev, session, contact, push)
            }
            Some(&other) => Err(SyncError::UnknownType(other)),
            None => Err(SyncError::Truncated("sync packet")),
        }
    }

    /// A peer announced its digest: record it and push what it lacks.
    fn handle_pull(
        &mut self,
        dev: &dyn Device,
        session: SessionId,
        contact: &ContactId,
        pull: PullPacket,
    ) -> Result<Vec<SyncEffect>, SyncError> {
        Self::log(dev, &format!("packet:pull:handle:{contact}:{session}"));

        if !self.models.contains_key(contact) {
            return Err(SyncError::ContactNotFound);
        }
        self.update_session(dev, session, contact, pull.sender_public_key, true);

        let model = self.models.get_mut(contact).ok_or(SyncError::ContactNotFound)?;
        let mut effects = Vec::new();

        if model.update_digests(pull.sender_public_key, pull.digest) {
            Self::log(dev, "packet:pull:handle:digest_updated");
            effects.push(self.state_changed(contact)?);
        }

        let model = self.models.get_mut(contact).ok_or(SyncError::ContactNotFound)?;
        let peer_digest = model
            .digests
            .get(&pull.sender_public_key)
            .cloned()
            .unwrap_or_default();
        let deltas = model.delta(&peer_digest);

        if !deltas.is_empty() {
            Self::log(dev, &format!("packet:pull:handle:push_reply:{}", deltas.len()));
            let packet = PushPacket::new(model, pull.sender_public_key, deltas);
            effects.push(SyncEffect::PushUpdates {
                contact: contact.clone(),
                session,
                packet,
            });
        }

        Ok(effects)
    }

    /// A peer pushed deltas: merge them and propagate further.
    fn merge_push(
        &mut self,
        dev: &dyn Device,
        session: SessionId,
        contact: &ContactId,
        push: PushPacket,
    ) -> Result<Vec<SyncEffect>, SyncError> {
        Self::log(dev, &format!("packet:push:merge:{contact}:{session}"));

        if !self.models.contains_key(contact) {
            return Err(SyncError::ContactNotFound);
        }
        self.update_session(dev, session, contact, push.sender_public_key, false);

        let model = self.models.get_mut(contact).ok_or(SyncError::ContactNotFound)?;
        if !model.merge(push.sender_public_key, &push.deltas) {
            return Ok(Vec::new());
        }

        Self::log(dev, "packet:push:merge:state_change");

        let mut effects = vec![self.state_changed(contact)?];
        self.push_state_updates(dev, contact, &mut effects)?;
        Ok(effects)
    }

    /// A previously sent PUSH was delivered: the receiver now provably
    /// holds those versions, so remember them and avoid re-pushing.
    pub fn push_delivered(
        &mut self,
        dev: &dyn Device,
        contact: &ContactId,
        session: SessionId,
        packet: &PushPacket,
    ) -> Result<Vec<SyncEffect>, SyncError> {
        Self::log(dev, &format!("packet:push:delivered:{session}"));

        let model = self.models.get_mut(contact).ok_or(SyncError::ContactNotFound)?;
        let receiver = packet.receiver_public_key;

        let mut updated = 0;
        let mut max_version = 0;
        for delta in &packet.deltas {
            if model.update_digest(receiver, delta.public_key, delta.version) {
                updated += 1;
            }
            let seen = model.digests[&receiver].nodes[&delta.public_key];
            max_version = max_version.max(seen);
        }

        if let Some(digest) = model.digests.get_mut(&receiver) {
            digest.max_version = digest.max_version.max(max_version);
        }

        Self::log(dev, &format!("packet:push:delivered:digests_updated:{updated}"));
        if updated > 0 {
            return Ok(vec![self.state_changed(contact)?]);
        }
        Ok(Vec::new())
    }

    fn update_session(
        &mut self,
        dev: &dyn Device,
        session: SessionId,
        contact: &ContactId,
        public_key: NodePublicKey,
        received_pull: bool,
    ) {
        let received_pull = received_pull
            || self
                .sessions
                .get(&session)
                .is_some_and(|s| s.received_pull);

        self.sessions.insert(
            session,
            SyncSession {
                contact: contact.clone(),
                public_key,
                received_pull,
            },
        );

        Self::log(dev, &format!("update_sync_session:{session}:{received_pull}"));
    }

    fn state_changed(&self, contact: &ContactId) -> Result<SyncEffect, SyncError> {
        let model = self.models.get(contact).ok_or(SyncError::ContactNotFound)?;
        Ok(SyncEffect::StateChanged {
            contact: contact.clone(),
            state: model.to_json()?,
        })
    }

    /// Push fresh deltas to every session of `contact` that has revealed
    /// its digest; ask for discovery when no session reaches the contact
    /// at all.
    fn push_state_updates(
        &mut self,
        dev: &dyn Device,
        contact: &ContactId,
        effects: &mut Vec<SyncEffect>,
    ) -> Result<(), SyncError> {
        let model = self.models.get_mut(contact).ok_or(SyncError::ContactNotFound)?;

        let mut session_ids: Vec<SessionId> = self.sessions.keys().copied().collect();
        session_ids.sort();

        let mut reachable = false;
        for session in session_ids {
            let peer = &self.sessions[&session];
            if peer.contact != *contact {
                continue;
            }
            reachable = true;

            if !peer.received_pull {
                continue;
            }

            let peer_digest = model
                .digests
                .get(&peer.public_key)
                .cloned()
                .unwrap_or_default();
            let deltas = model.delta(&peer_digest);

            if !deltas.is_empty() {
                Self::log(dev, &format!("sync_update:push:{session}:{}", deltas.len()));
                let packet = PushPacket::new(model, peer.public_key, deltas);
                effects.push(SyncEffect::PushUpdates {
                    contact: contact.clone(),
                    session,
                    packet,
                });
            }
        }

        if !reachable {
            effects.push(SyncEffect::DiscoverContact {
                contact: contact.clone(),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockDevice;

    fn contact(name: &str) -> ContactId {
        ContactId(name.into())
    }

    fn key(seed: u8) -> SigningKey {
        SigningKey::from_bytes(&[seed; 32])
    }

    fn engine_with_contact(dev: &MockDevice, name: &str, seed: u8) -> Synchronizer {
        let mut engine = Synchronizer::new();
        engine
            .new_contact(dev, contact(name), key(seed), ModelType::Group)
            .unwrap();
        engine
    }

    fn state_of(effects: &[SyncEffect]) -> Option<&[u8]> {
        effects.iter().find_map(|effect| match effect {
            SyncEffect::StateChanged { state, .. } => Some(state.as_slice()),
            _ => None,
        })
    }

    #[test]
    fn test_new_contact_emits_initial_state() {
        let dev = MockDevice::with_seed(1);
        let mut engine = Synchronizer::new();

        let effects = engine
            .new_contact(&dev, contact("c"), key(1), ModelType::Link)
            .unwrap();
        assert_eq!(effects.len(), 1);
        assert!(state_of(&effects).is_some());
        assert!(engine.has_contact(&contact("c")));
    }

    #[test]
    fn test_new_message_without_sessions_requests_discovery() {
        let dev = MockDevice::with_seed(1);
        let mut engine = engine_with_contact(&dev, "c", 1);

        let effects = engine.new_message(&dev, &contact("c"), b"hi", None).unwrap();
        assert!(matches!(effects[0], SyncEffect::StateChanged { .. }));
        assert!(effects
            .iter()
            .any(|e| matches!(e, SyncEffect::DiscoverContact { .. })));
    }

    #[test]
    fn test_pull_answers_with_missing_deltas() {
        let dev = MockDevice::with_seed(1);
        let mut alice = engine_with_contact(&dev, "c", 1);
        let mut bob = engine_with_contact(&dev, "c", 2);

        alice.new_message(&dev, &contact("c"), b"hello", None).unwrap();

        // Bob announces his (empty) digest to Alice.
        let pull = bob.pull_packet(&contact("c")).unwrap().encode();
        let effects = alice
            .receive_packet(&dev, &contact("c"), SessionId(9), &pull)
            .unwrap();

        let push = effects
            .iter()
            .find_map(|effect| match effect {
                SyncEffect::PushUpdates { packet, .. } => Some(packet.clone()),
                _ => None,
            })
            .expect("pull must be answered with a push");
        assert_eq!(push.deltas.len(), 1);
        assert_eq!(push.deltas[0].value, b"hello");

        // Bob merges the push; both sides now hold the entry.
        let effects = bob
            .receive_packet(&dev, &contact("c"), SessionId(10), &push.encode())
            .unwrap();
        assert!(state_of(&effects).is_some());
    }

    #[test]
    fn test_push_then_new_message_pushes_proactively() {
        let dev = MockDevice::with_seed(1);
        let mut alice = engine_with_contact(&dev, "c", 1);
        let mut bob = engine_with_contact(&dev, "c", 2);

        // A full pull exchange teaches Alice that session 5 reaches Bob.
        let pull = bob.pull_packet(&contact("c")).unwrap().encode();
        alice
            .receive_packet(&dev, &contact("c"), SessionId(5), &pull)
            .unwrap();

        // A new local message is pushed without waiting for another pull.
        let effects = alice.new_message(&dev, &contact("c"), b"fresh", None).unwrap();
        let push = effects.iter().find_map(|effect| match effect {
            SyncEffect::PushUpdates { session, packet, .. } => Some((*session, packet.clone())),
            _ => None,
        });
        let (session, packet) = push.expect("new message must be pushed to the pulled session");
        assert_eq!(session, SessionId(5));
        assert_eq!(packet.deltas.len(), 1);
    }

    #[test]
    fn test_push_only_session_is_not_pushed_to() {
        let dev = MockDevice::with_seed(1);
        let mut alice = engine_with_contact(&dev, "c", 1);
        let mut bob = engine_with_contact(&dev, "c", 2);

        bob.new_message(&dev, &contact("c"), b"from bob", None).unwrap();

        // Alice only ever received a PUSH on this session; she has no
        // digest for the peer and must not push blindly.
        let peer_digest = Digest::new();
        let deltas = {
            let model = bob.models.get_mut(&contact("c")).unwrap();
            model.delta(&peer_digest)
        };
        let push = PushPacket::new(bob.models.get(&contact("c")).unwrap(), NodePublicKey([0; 32]), deltas);
        alice
            .receive_packet(&dev, &contact("c"), SessionId(4), &push.encode())
            .unwrap();

        let effects = alice.new_message(&dev, &contact("c"), b"reply", None).unwrap();
        assert!(!effects
            .iter()
            .any(|e| matches!(e, SyncEffect::PushUpdates { .. })));
        // The session exists, so no discovery either.
        assert!(!effects
            .iter()
            .any(|e| matches!(e, SyncEffect::DiscoverContact { .. })));
    }

    #[test]
    fn test_push_delivered_suppresses_re_push() {
        let dev = MockDevice::with_seed(1);
        let mut alice = engine_with_contact(&dev, "c", 1);
        let mut bob = engine_with_contact(&dev, "c", 2);

        alice.new_message(&dev, &contact("c"), b"hello", None).unwrap();

        let pull = bob.pull_packet(&contact("c")).unwrap().encode();
        let effects = alice
            .receive_packet(&dev, &contact("c"), SessionId(5), &pull)
            .unwrap();
        let packet = effects
            .iter()
            .find_map(|effect| match effect {
                SyncEffect::PushUpdates { packet, .. } => Some(packet.clone()),
                _ => None,
            })
            .unwrap();

        alice
            .push_delivered(&dev, &contact("c"), SessionId(5), &packet)
            .unwrap();

        // Nothing new to push: the peer digest already covers version 1.
        let mut effects = Vec::new();
        alice
            .push_state_updates(&dev, &contact("c"), &mut effects)
            .unwrap();
        assert!(!effects
            .iter()
            .any(|e| matches!(e, SyncEffect::PushUpdates { .. })));
    }

    #[test]
    fn test_session_broken_forgets_the_peer() {
        let dev = MockDevice::with_seed(1);
        let mut alice = engine_with_contact(&dev, "c", 1);
        let mut bob = engine_with_contact(&dev, "c", 2);

        let pull = bob.pull_packet(&contact("c")).unwrap().encode();
        alice
            .receive_packet(&dev, &contact("c"), SessionId(5), &pull)
            .unwrap();

        alice.session_broken(&dev, SessionId(5));

        let effects = alice.new_message(&dev, &contact("c"), b"m", None).unwrap();
        assert!(effects
            .iter()
            .any(|e| matches!(e, SyncEffect::DiscoverContact { .. })));
    }

    #[test]
    fn test_receive_packet_rejects_unknown_contact_and_type() {
        let dev = MockDevice::with_seed(1);
        let mut engine = engine_with_contact(&dev, "known", 1);
        let mut other = engine_with_contact(&dev, "other", 2);

        let pull = other.pull_packet(&contact("other")).unwrap().encode();
        assert!(matches!(
            engine.receive_packet(&dev, &contact("missing"), SessionId(1), &pull),
            Err(SyncError::ContactNotFound)
        ));
        assert!(matches!(
            engine.receive_packet(&dev, &contact("known"), SessionId(1), &[0x07]),
            Err(SyncError::UnknownType(0x07))
        ));
    }

    #[test]
    fn test_load_state_restores_a_model() {
        let dev = MockDevice::with_seed(1);
        let mut original = engine_with_contact(&dev, "c", 1);
        original.new_message(&dev, &contact("c"), b"persisted", None).unwrap();

        let mut effects = Vec::new();
        original
            .push_state_updates(&dev, &contact("c"), &mut effects)
            .ok();
        let snapshot = {
            let model = original.models.get(&contact("c")).unwrap();
            model.to_json().unwrap()
        };

        let mut restored = Synchronizer::new();
        restored.load_state(&dev, contact("c"), &snapshot).unwrap();

        let model = restored.models.get(&contact("c")).unwrap();
        let own = model.node_states.get(&model.public_key).unwrap();
        assert_eq!(own[&1].value, b"persisted");
    }
}
