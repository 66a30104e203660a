// Transport layer — per-session sliding-window reliable delivery:
// sequence numbers, delayed selective acknowledgements, retransmission,
// and session timeout. Rides inside SESS ciphertext; timers ride on the
// host's delay facility.

pub mod packet;
mod state;

pub use packet::SequenceId;
pub(crate) use state::SessionState;

use std::collections::HashMap;
use std::sync::Arc;

use crate::contacts::ContactId;
use crate::device::{DeviceAddress, MessageId, SessionId};
use crate::stack::ProtocolCore;
use crate::util::{rand_u64, shuffled_keys};
use crate::ProtocolError;

use packet::{AckPacket, DataPacket, TransportPacket};

/// Reliable-delivery state per endpoint session.
#[derive(Default)]
pub(crate) struct TransportTables {
    pub states: HashMap<SessionId, SessionState>,
}

impl TransportTables {
    pub fn new() -> Self {
        TransportTables::default()
    }
}

/// A reliably delivered message on its way to the application layer.
pub(crate) struct TransportMessage {
    pub session: SessionId,
    pub contact: ContactId,
    pub data: Vec<u8>,
}

impl ProtocolCore {
    fn transport_log(&self, message: &str) {
        self.dev.log(&format!("transport:{message}"));
    }

    /// Send `data` reliably on `session`. Returns the message id that a
    /// later delivery confirmation will carry.
    pub(crate) fn transport_send(
        &mut self,
        session: SessionId,
        data: Vec<u8>,
    ) -> Result<MessageId, ProtocolError> {
        let (packet, message_id) = self.transport_wrap(session, data)?;
        self.send_session_data(session, &packet)?;
        Ok(message_id)
    }

    /// Register `data` for reliable delivery and return the encoded DATA
    /// packet; the caller chooses how it travels (a normal session send,
    /// or piggybacked inside a route reply).
    pub(crate) fn transport_wrap(
        &mut self,
        session: SessionId,
        data: Vec<u8>,
    ) -> Result<(Vec<u8>, MessageId), ProtocolError> {
        if self.routing.session(session).is_none() {
            return Err(ProtocolError::SessionNotFound);
        }

        let message_id = MessageId(rand_u64(self.dev.as_ref()));
        let now = self.dev.now();

        let state = self
            .transport
            .states
            .entry(session)
            .or_insert_with(SessionState::new);
        let seq = state.register_send(message_id, data.clone(), now);

        let packet = DataPacket { seq, body: data }.encode();
        self.start_timeout_timer(session);

        Ok((packet, message_id))
    }

    /// Decode one transport packet from SESS plaintext and apply it.
    /// Returns the messages that became deliverable, in sequence order.
    pub(crate) fn handle_transport_message(
        &mut self,
        session: SessionId,
        data: &[u8],
    ) -> Vec<TransportMessage> {
        let packet = match TransportPacket::decode(data) {
            Ok(packet) => packet,
            Err(err) => {
                self.transport_log(&format!("packet:handle:decode:error '{err}'"));
                return Vec::new();
            }
        };

        match packet {
            TransportPacket::Data(data) => self.handle_data_packet(session, data),
            TransportPacket::Ack(ack) => {
                self.handle_ack_packet(session, ack);
                Vec::new()
            }
        }
    }

    fn handle_data_packet(
        &mut self,
        session: SessionId,
        packet: DataPacket,
    ) -> Vec<TransportMessage> {
        self.transport_log(&format!("packet:data:handle:{session}:{}", packet.seq));

        let Some(entry) = self.routing.session(session) else {
            self.transport_log(&format!(
                "packet:data:handle:error:{session} 'session was not found, ignoring packet'"
            ));
            return Vec::new();
        };
        let Some(contact) = entry.contact.clone() else {
            self.transport_log(&format!(
                "packet:data:handle:error:{session} 'session has no contact'"
            ));
            return Vec::new();
        };

        self.transport
            .states
            .entry(session)
            .or_insert_with(SessionState::new);
        self.start_ack_timer(session);

        let Some(state) = self.transport.states.get_mut(&session) else {
            return Vec::new();
        };

        state
            .receive_data(packet)
            .into_iter()
            .map(|packet| TransportMessage {
                session,
                contact: contact.clone(),
                data: packet.body,
            })
            .collect()
    }

    fn handle_ack_packet(&mut self, session: SessionId, ack: AckPacket) {
        self.transport_log(&format!("packet:ack:handle:{session}:{}", ack.latest_seq));

        if self.routing.session(session).is_none() {
            self.transport_log(&format!(
                "packet:ack:handle:error:{session} 'session was not found, ignoring packet'"
            ));
            return;
        }

        let state = self
            .transport
            .states
            .entry(session)
            .or_insert_with(SessionState::new);
        let (resend, delivered) = state.receive_ack(&ack);

        self.transport_log(&format!(
            "packet:ack:handle:done:{}:{} '{} message(s) delivered'",
            resend.len(),
            delivered.len() + resend.len(),
            delivered.len()
        ));

        for message in delivered {
            self.message_delivered_upward(message);
        }
        for packet in resend {
            let _ = self.send_session_data(session, &packet.encode());
        }
    }

    /// Arm the delayed acknowledgement for `session`, if not already
    /// running. The packet itself is built at fire time.
    fn start_ack_timer(&mut self, session: SessionId) {
        let Some(state) = self.transport.states.get_mut(&session) else {
            return;
        };
        if state.receiver.ack_timer {
            return;
        }
        state.receiver.ack_timer = true;

        self.transport_log(&format!("session:timer:ack:starting:{session}"));
        let delay = self.options.ack_delay;
        self.schedule(delay, move |core| core.ack_timer_fired(session));
    }

    fn ack_timer_fired(&mut self, session: SessionId) {
        let Some(state) = self.transport.states.get_mut(&session) else {
            return;
        };
        state.receiver.ack_timer = false;

        let ack = AckPacket {
            latest_seq: state.receiver.latest_seq,
            missing: state.receiver.missing_seqs.clone(),
        };

        if self.routing.session(session).is_none() {
            self.transport_log(&format!(
                "session:timer:ack:send:error:{session} 'session not found'"
            ));
            return;
        }

        self.transport_log(&format!("session:timer:ack:send:{session} 'sending ack reply'"));
        let _ = self.send_session_data(session, &ack.encode());
    }

    /// Arm the retransmission timeout against the oldest unacknowledged
    /// packet, if not already running.
    fn start_timeout_timer(&mut self, session: SessionId) {
        let Some(state) = self.transport.states.get_mut(&session) else {
            return;
        };
        if state.sender.timeout_timer {
            return;
        }
        let Some(head) = state.sender.awaiting_acks.first() else {
            return;
        };
        let head_seq = head.seq;
        let sent_at = head.timestamp;
        state.sender.timeout_timer = true;

        self.transport_log(&format!("session:timer:timeout:starting:{session}"));

        // The head may already have been waiting for a while.
        let elapsed = self.dev.now().saturating_duration_since(sent_at);
        let delay = self.options.ack_timeout.saturating_sub(elapsed);
        self.schedule(delay, move |core| core.timeout_timer_fired(session, head_seq));
    }

    fn timeout_timer_fired(&mut self, session: SessionId, seq: SequenceId) {
        let Some(state) = self.transport.states.get_mut(&session) else {
            return;
        };

        let still_waiting = state.sender.awaiting_acks.iter().any(|a| a.seq == seq);
        if !still_waiting {
            // Acknowledged in the meantime; rearm against the new head.
            state.sender.timeout_timer = false;
            self.start_timeout_timer(session);
            return;
        }

        self.transport_log(&format!(
            "session:timer:timeout:timed_out:{session} 'breaking session'"
        ));
        self.timeout_session(session);
    }

    /// The peer went silent past the timeout: break the session at the
    /// routing layer and drop the delivery state.
    fn timeout_session(&mut self, session: SessionId) {
        self.transport_log(&format!("session:timeout:cleanup:{session}"));

        if !self.transport.states.contains_key(&session) {
            self.transport_log("session:timeout:cleanup:error 'session not found'");
            return;
        }

        self.session_broken_at(session, None);
        self.transport.states.remove(&session);
    }

    /// Drop delivery state for sessions that ran through `address`.
    pub(crate) fn transport_disconnect(&mut self, address: &DeviceAddress) {
        let dev = Arc::clone(&self.dev);
        for session in shuffled_keys(dev.as_ref(), &self.transport.states) {
            let keep = match self.routing.session(session) {
                None => false,
                Some(entry) => {
                    entry.source_neighbour.as_ref() != Some(address)
                        && entry.target_neighbour.as_ref() != Some(address)
                }
            };

            if !keep {
                self.transport_log(&format!("disconnect:clear_state:{session}:{address}"));
                self.transport.states.remove(&session);
            }
        }
    }
}
