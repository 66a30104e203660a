// Application layer — demultiplexes session payloads between host
// messages and the sync extension, wires session lifecycle events to
// the host, and carries out the sync engine's side effects.
//
// Every payload starts with a one-byte tag: 0x01 user data, 0x02 sync.

use std::sync::Arc;

use ed25519_dalek::SigningKey;
use zeroize::Zeroize;

use crate::contacts::{ContactId, SharedSecret};
use crate::device::{DeviceAddress, MessageId, SessionId};
use crate::stack::ProtocolCore;
use crate::sync::{ModelType, PushPacket, SyncEffect};
use crate::ProtocolError;

/// Tag for host application payloads.
pub const TAG_USER: u8 = 0x01;
/// Tag for sync extension payloads.
pub const TAG_SYNC: u8 = 0x02;

/// A sent PUSH whose delivery confirmation is still outstanding.
pub(crate) struct PendingPush {
    contact: ContactId,
    session: SessionId,
    packet: PushPacket,
}

fn tagged(tag: u8, payload: &[u8]) -> Vec<u8> {
    let mut data = Vec::with_capacity(1 + payload.len());
    data.push(tag);
    data.extend_from_slice(payload);
    data
}

impl ProtocolCore {
    fn app_log(&self, message: &str) {
        self.dev.log(&format!("application:{message}"));
    }

    /// Send a host message on `session`.
    pub(crate) fn send_message(
        &mut self,
        session: SessionId,
        message: &[u8],
    ) -> Result<MessageId, ProtocolError> {
        self.transport_send(session, tagged(TAG_USER, message))
    }

    /// Demultiplex one reliably delivered payload.
    pub(crate) fn handle_app_message(
        &mut self,
        session: SessionId,
        contact: &ContactId,
        data: &[u8],
    ) {
        let Some((&tag, payload)) = data.split_first() else {
            return;
        };

        match tag {
            TAG_USER => {
                self.app_log(&format!("handle_packet:user_data:{session}"));
                self.dev.process_message(session, payload);
            }
            TAG_SYNC => {
                self.app_log(&format!("handle_packet:sync:{session}:{contact}"));
                let dev = Arc::clone(&self.dev);
                let result = match self.sync.as_mut() {
                    Some(sync) => sync.receive_packet(dev.as_ref(), contact, session, payload),
                    None => {
                        self.app_log(&format!(
                            "handle_packet:sync:disabled:{session} 'dropping sync packet'"
                        ));
                        return;
                    }
                };
                match result {
                    Ok(effects) => self.apply_sync_effects(effects),
                    Err(err) => self.app_log(&format!("handle_packet:sync:error '{err}'")),
                }
            }
            other => {
                self.app_log(&format!(
                    "handle_packet:error:unknown_packet_type:{session}:{contact}:{other}"
                ));
            }
        }
    }

    /// A session reached the endpoint state. The piggybacked route reply
    /// payload (initiator side) first runs through the transport receive
    /// path so its DATA packet is sequenced and acknowledged normally.
    pub(crate) fn session_established(
        &mut self,
        session: SessionId,
        contact: &ContactId,
        address: &DeviceAddress,
        payload: Option<Vec<u8>>,
        is_initiator: bool,
    ) {
        let mut app_payload = None;
        if let Some(payload) = payload {
            if !payload.is_empty() {
                let mut messages = self.handle_transport_message(session, &payload);
                if messages.len() > 1 {
                    self.app_log("event:session_establish:error 'multiple packets in reply payload'");
                }
                if !messages.is_empty() {
                    app_payload = Some(messages.remove(0));
                }
            }
        }

        self.dev.session_established(session, contact, address);

        if let Some(message) = app_payload {
            self.handle_app_message(message.session, &message.contact, &message.data);
        }

        // The initiator opens the digest exchange with a PULL as its
        // first reliable message; the responder already piggybacked its
        // own on the route reply.
        if is_initiator && self.sync.is_some() {
            let pull = match self.sync.as_mut() {
                Some(sync) => sync.pull_packet(contact),
                None => return,
            };
            let data = match pull {
                Ok(pull) => tagged(TAG_SYNC, &pull.encode()),
                Err(err) => {
                    self.app_log(&format!("sync:pull:error '{err}'"));
                    return;
                }
            };
            if let Err(err) = self.transport_send(session, data) {
                self.app_log(&format!("sync:pull:send:error '{err}'"));
            }
        }
    }

    /// An endpoint session died: notify the host and the sync engine,
    /// and go looking for a new route when messages are still pending.
    pub(crate) fn session_broken_upward(&mut self, session: SessionId) {
        self.dev.session_broken(session);

        if let Some(sync) = self.sync.as_mut() {
            let dev = Arc::clone(&self.dev);
            sync.session_broken(dev.as_ref(), session);
        }

        let pending = self
            .transport
            .states
            .get(&session)
            .map(|state| state.sender.awaiting_acks.len())
            .unwrap_or(0);
        if pending > 0 {
            self.broadcast_route_request();
        }
    }

    /// Delivery confirmations for sync pushes feed the engine's digest
    /// bookkeeping; everything else belongs to the host.
    pub(crate) fn message_delivered_upward(&mut self, message: MessageId) {
        let Some(pending) = self.pending_pushes.remove(&message) else {
            self.app_log(&format!("deliver_packet:device:{message}"));
            self.dev.message_delivered(message);
            return;
        };

        self.app_log(&format!("deliver_packet:sync:{message}"));
        let dev = Arc::clone(&self.dev);
        let result = match self.sync.as_mut() {
            Some(sync) => sync.push_delivered(
                dev.as_ref(),
                &pending.contact,
                pending.session,
                &pending.packet,
            ),
            None => return,
        };
        match result {
            Ok(effects) => self.apply_sync_effects(effects),
            Err(err) => self.app_log(&format!("deliver_packet:sync:error:{message} '{err}'")),
        }
    }

    /// The payload to piggyback on a route reply, already wrapped in a
    /// DATA packet so it consumes the session's first sequence number.
    pub(crate) fn reply_payload_wrapped(
        &mut self,
        session: SessionId,
        contact: &ContactId,
    ) -> Vec<u8> {
        let payload = self.app_reply_payload(session, contact);
        match self.transport_wrap(session, payload.unwrap_or_default()) {
            Ok((packet, _)) => packet,
            Err(err) => {
                self.app_log(&format!("reply_payload:error '{err}'"));
                Vec::new()
            }
        }
    }

    fn app_reply_payload(&mut self, session: SessionId, contact: &ContactId) -> Option<Vec<u8>> {
        if let Some(sync) = self.sync.as_mut() {
            // Sync sessions open with a digest exchange.
            match sync.pull_packet(contact) {
                Ok(pull) => return Some(tagged(TAG_SYNC, &pull.encode())),
                Err(err) => {
                    self.app_log(&format!("reply_payload:error '{err}'"));
                    return None;
                }
            }
        }

        // Without sync, the host decides what to piggyback.
        let payload = self.dev.reply_payload(session, contact)?;
        if payload.is_empty() {
            return None;
        }
        Some(tagged(TAG_USER, &payload))
    }

    /// Carry out the sync engine's requested side effects, in order.
    pub(crate) fn apply_sync_effects(&mut self, effects: Vec<SyncEffect>) {
        for effect in effects {
            match effect {
                SyncEffect::StateChanged { contact, state } => {
                    self.dev.sync_state_changed(&contact, Some(&state));
                }
                SyncEffect::DiscoverContact { contact } => {
                    self.app_log(&format!("sync:discover_contact:{contact}"));
                    self.broadcast_route_request();
                }
                SyncEffect::PushUpdates {
                    contact,
                    session,
                    packet,
                } => {
                    self.app_log(&format!("sync:push_sync_updates:{contact}"));
                    let data = tagged(TAG_SYNC, &packet.encode());
                    match self.transport_send(session, data) {
                        Ok(message_id) => {
                            self.pending_pushes.insert(
                                message_id,
                                PendingPush {
                                    contact,
                                    session,
                                    packet,
                                },
                            );
                        }
                        Err(err) => {
                            self.app_log(&format!("sync:push_sync_updates:send:error '{err}'"));
                        }
                    }
                }
            }
        }
    }

    /// Provision the sync model for a newly stored contact.
    pub(crate) fn contact_created(
        &mut self,
        contact: &ContactId,
        model_type: ModelType,
    ) -> Result<(), ProtocolError> {
        if self.sync.is_none() {
            return Ok(());
        }

        let mut key_bytes = [0u8; 32];
        self.dev.fill_crypto_random(&mut key_bytes);
        let signing_key = SigningKey::from_bytes(&key_bytes);
        key_bytes.zeroize();

        let dev = Arc::clone(&self.dev);
        let effects = match self.sync.as_mut() {
            Some(sync) => sync.new_contact(dev.as_ref(), contact.clone(), signing_key, model_type),
            None => return Ok(()),
        };

        match effects {
            Ok(effects) => {
                self.apply_sync_effects(effects);
                Ok(())
            }
            Err(err) => {
                self.app_log(&format!("new_contact:error '{err}'"));
                Err(err.into())
            }
        }
    }

    /// Store and provision a group secret, then go looking for members.
    pub(crate) fn join_group(&mut self, secret: SharedSecret) -> Result<ContactId, ProtocolError> {
        let contact = self.dev.contacts().join_group(secret).map_err(|err| {
            self.app_log(&format!("new_contact:error '{err}'"));
            err
        })?;

        self.contact_created(&contact, ModelType::Group)?;
        self.broadcast_route_request();
        Ok(contact)
    }

    /// Remove a contact: its sessions, its routes and its sync state.
    pub(crate) fn delete_contact(&mut self, contact: &ContactId) {
        self.dev.contacts().delete_contact(contact);
        self.delete_contact_sessions(contact);

        let remaining =
            self.dev.contacts().all_groups().len() + self.dev.contacts().all_links().len();
        self.app_log(&format!(
            "delete_contact:deleted 'deleted contact, {remaining} total contacts'"
        ));

        if self.sync.is_some() {
            let dev = Arc::clone(&self.dev);
            if let Some(sync) = self.sync.as_mut() {
                sync.delete_contact(dev.as_ref(), contact);
            }
            self.dev.sync_state_changed(contact, None);
        }
    }

    /// Publish a message into a contact's synchronized log, optionally
    /// attaching another contact's secret as an invitation.
    pub(crate) fn sync_add_message(
        &mut self,
        contact: &ContactId,
        message: &[u8],
        attached_contact: Option<&ContactId>,
    ) -> Result<(), ProtocolError> {
        if self.sync.is_none() {
            return Err(ProtocolError::SyncDisabled);
        }

        let attached_secret = match attached_contact {
            Some(attached) => Some(self.dev.contacts().contact_secret(attached)?),
            None => None,
        };

        let dev = Arc::clone(&self.dev);
        let effects = match self.sync.as_mut() {
            Some(sync) => sync.new_message(dev.as_ref(), contact, message, attached_secret)?,
            None => return Err(ProtocolError::SyncDisabled),
        };

        self.apply_sync_effects(effects);
        Ok(())
    }

    /// Restore a contact's sync model from persisted JSON.
    pub(crate) fn sync_load_state(
        &mut self,
        contact: &ContactId,
        state: &[u8],
    ) -> Result<(), ProtocolError> {
        if self.sync.is_none() {
            return Err(ProtocolError::SyncDisabled);
        }

        let dev = Arc::clone(&self.dev);
        let effects = match self.sync.as_mut() {
            Some(sync) => sync.load_state(dev.as_ref(), contact.clone(), state)?,
            None => return Err(ProtocolError::SyncDisabled),
        };

        self.apply_sync_effects(effects);
        Ok(())
    }

    /// Provision sync models for stored contacts that lack one (fresh
    /// install, or contacts added while sync was off).
    pub(crate) fn load_persisted_state(&mut self) {
        if self.sync.is_none() {
            return;
        }

        let groups = self.dev.contacts().all_groups();
        let links = self.dev.contacts().all_links();
        let contacts = groups
            .into_iter()
            .map(|contact| (contact, ModelType::Group))
            .chain(links.into_iter().map(|contact| (contact, ModelType::Link)));

        for (contact, model_type) in contacts {
            let known = self
                .sync
                .as_ref()
                .is_some_and(|sync| sync.has_contact(&contact));
            if known {
                continue;
            }

            if let Err(err) = self.contact_created(&contact, model_type) {
                self.app_log(&format!("load_persisted_state:error:{contact} '{err}'"));
            }
        }
    }
}
