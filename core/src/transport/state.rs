// Per-session reliable-delivery state.
//
// The sender tracks unacknowledged packets; the receiver tracks the
// highest sequence seen, the gaps below it, and packets buffered behind
// those gaps. Pure state: timers and packet transmission stay with the
// caller.

use std::time::Instant;

use super::packet::{AckPacket, DataPacket, SequenceId};
use crate::device::MessageId;

pub(crate) struct AwaitingAck {
    pub seq: SequenceId,
    pub message: MessageId,
    pub body: Vec<u8>,
    pub timestamp: Instant,
}

pub(crate) struct SenderState {
    pub timeout_timer: bool,
    pub awaiting_acks: Vec<AwaitingAck>,
    pub next_seq: u32,
}

pub(crate) struct ReceiverState {
    pub ack_timer: bool,
    pub latest_seq: SequenceId,
    /// Gap sequence numbers below `latest_seq`, ascending.
    pub missing_seqs: Vec<SequenceId>,
    /// Packets received ahead of an open gap.
    pub awaiting_delivery: Vec<DataPacket>,
}

pub(crate) struct SessionState {
    pub sender: SenderState,
    pub receiver: ReceiverState,
}

impl SessionState {
    pub fn new() -> Self {
        SessionState {
            sender: SenderState {
                timeout_timer: false,
                awaiting_acks: Vec::new(),
                next_seq: 1,
            },
            receiver: ReceiverState {
                ack_timer: false,
                latest_seq: SequenceId(0),
                missing_seqs: Vec::new(),
                awaiting_delivery: Vec::new(),
            },
        }
    }

    /// Register an outbound message and assign its sequence number. The
    /// caller emits the DATA packet and arms the timeout timer.
    pub fn register_send(&mut self, message: MessageId, body: Vec<u8>, now: Instant) -> SequenceId {
        let seq = SequenceId(self.sender.next_seq);
        self.sender.next_seq += 1;
        self.sender.awaiting_acks.push(AwaitingAck {
            seq,
            message,
            body,
            timestamp: now,
        });
        seq
    }

    /// Process an acknowledgement. Returns the packets to retransmit and
    /// the messages now confirmed delivered. Entries above the peer's
    /// latest sequence stay registered untouched.
    pub fn receive_ack(&mut self, ack: &AckPacket) -> (Vec<DataPacket>, Vec<MessageId>) {
        let mut resend = Vec::new();
        let mut delivered = Vec::new();
        let mut kept = Vec::new();

        for awaiting in self.sender.awaiting_acks.drain(..) {
            if awaiting.seq > ack.latest_seq {
                kept.push(awaiting);
            } else if ack.missing.contains(&awaiting.seq) {
                resend.push(DataPacket {
                    seq: awaiting.seq,
                    body: awaiting.body.clone(),
                });
                kept.push(awaiting);
            } else {
                delivered.push(awaiting.message);
            }
        }

        self.sender.awaiting_acks = kept;
        (resend, delivered)
    }

    /// Process an inbound DATA packet. Returns the packets now
    /// deliverable in ascending sequence order; packets behind an open
    /// gap are buffered. Retransmits of already-delivered sequences are
    /// dropped, never delivered twice.
    pub fn receive_data(&mut self, packet: DataPacket) -> Vec<DataPacket> {
        let receiver = &mut self.receiver;

        if packet.seq <= receiver.latest_seq && !receiver.missing_seqs.contains(&packet.seq) {
            return Vec::new();
        }

        if receiver.latest_seq < packet.seq {
            for seq in receiver.latest_seq.0 + 1..packet.seq.0 {
                receiver.missing_seqs.push(SequenceId(seq));
            }
            receiver.latest_seq = packet.seq;
        }

        let mut deliverable = Vec::new();

        if receiver.missing_seqs.is_empty() {
            deliverable.push(packet);
        } else if receiver.missing_seqs[0] == packet.seq {
            // The earliest gap just closed; release everything buffered
            // up to the next one.
            let deliver_until = receiver
                .missing_seqs
                .get(1)
                .copied()
                .unwrap_or(SequenceId(receiver.latest_seq.0 + 1));

            let mut buffered = Vec::new();
            for waiting in receiver.awaiting_delivery.drain(..) {
                if waiting.seq < deliver_until {
                    deliverable.push(waiting);
                } else {
                    buffered.push(waiting);
                }
            }
            receiver.awaiting_delivery = buffered;

            receiver.missing_seqs.remove(0);
            deliverable.push(packet);
        } else {
            // An older gap is still open; hold this packet back.
            receiver.missing_seqs.retain(|seq| *seq != packet.seq);
            receiver.awaiting_delivery.push(packet);
        }

        deliverable.sort_by_key(|p| p.seq);
        deliverable
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(seq: u32) -> DataPacket {
        DataPacket {
            seq: SequenceId(seq),
            body: format!("message {seq}").into_bytes(),
        }
    }

    fn delivered_seqs(packets: &[DataPacket]) -> Vec<u32> {
        packets.iter().map(|p| p.seq.0).collect()
    }

    #[test]
    fn test_register_send_assigns_increasing_seqs() {
        let mut state = SessionState::new();
        let now = Instant::now();

        assert_eq!(state.register_send(MessageId(10), vec![1], now), SequenceId(1));
        assert_eq!(state.register_send(MessageId(11), vec![2], now), SequenceId(2));
        assert_eq!(state.sender.awaiting_acks.len(), 2);
    }

    #[test]
    fn test_in_order_packets_deliver_immediately() {
        let mut state = SessionState::new();

        for seq in 1..=3 {
            let deliverable = state.receive_data(data(seq));
            assert_eq!(delivered_seqs(&deliverable), vec![seq]);
        }
        assert!(state.receiver.missing_seqs.is_empty());
    }

    #[test]
    fn test_gap_buffers_until_missing_packet_arrives() {
        let mut state = SessionState::new();

        assert_eq!(delivered_seqs(&state.receive_data(data(1))), vec![1]);
        // 2 is dropped in flight; 3 and 4 wait behind the gap.
        assert!(state.receive_data(data(3)).is_empty());
        assert!(state.receive_data(data(4)).is_empty());
        assert_eq!(state.receiver.missing_seqs, vec![SequenceId(2)]);

        let deliverable = state.receive_data(data(2));
        assert_eq!(delivered_seqs(&deliverable), vec![2, 3, 4]);
        assert!(state.receiver.missing_seqs.is_empty());
        assert!(state.receiver.awaiting_delivery.is_empty());
    }

    #[test]
    fn test_two_gaps_release_in_stages() {
        let mut state = SessionState::new();

        // Receive 1, 2, 4, 6 — gaps at 3 and 5.
        state.receive_data(data(1));
        state.receive_data(data(2));
        assert!(state.receive_data(data(4)).is_empty());
        assert!(state.receive_data(data(6)).is_empty());
        assert_eq!(state.receiver.missing_seqs, vec![SequenceId(3), SequenceId(5)]);

        // 3 arrives: release up to the next gap only.
        let deliverable = state.receive_data(data(3));
        assert_eq!(delivered_seqs(&deliverable), vec![3, 4]);

        // 5 arrives: release the rest.
        let deliverable = state.receive_data(data(5));
        assert_eq!(delivered_seqs(&deliverable), vec![5, 6]);
    }

    #[test]
    fn test_retransmit_of_delivered_packet_is_dropped() {
        let mut state = SessionState::new();
        state.receive_data(data(1));
        state.receive_data(data(2));

        assert!(state.receive_data(data(1)).is_empty());
        assert!(state.receive_data(data(2)).is_empty());
        assert_eq!(state.receiver.latest_seq, SequenceId(2));
    }

    #[test]
    fn test_ack_confirms_and_requests_resend() {
        let mut state = SessionState::new();
        let now = Instant::now();
        for seq in 1..=4u64 {
            state.register_send(MessageId(seq), vec![seq as u8], now);
        }

        let (resend, delivered) = state.receive_ack(&AckPacket {
            latest_seq: SequenceId(4),
            missing: vec![SequenceId(2)],
        });

        assert_eq!(delivered, vec![MessageId(1), MessageId(3), MessageId(4)]);
        assert_eq!(delivered_seqs(&resend), vec![2]);
        assert_eq!(state.sender.awaiting_acks.len(), 1);
        assert_eq!(state.sender.awaiting_acks[0].seq, SequenceId(2));
    }

    #[test]
    fn test_ack_keeps_entries_above_latest() {
        let mut state = SessionState::new();
        let now = Instant::now();
        for seq in 1..=3u64 {
            state.register_send(MessageId(seq), vec![seq as u8], now);
        }

        // The peer has only seen up to 1 so far.
        let (resend, delivered) = state.receive_ack(&AckPacket {
            latest_seq: SequenceId(1),
            missing: Vec::new(),
        });

        assert_eq!(delivered, vec![MessageId(1)]);
        assert!(resend.is_empty());
        // 2 and 3 remain registered for a later acknowledgement.
        assert_eq!(state.sender.awaiting_acks.len(), 2);
    }

    #[test]
    fn test_resend_preserves_original_timestamp() {
        let mut state = SessionState::new();
        let now = Instant::now();
        state.register_send(MessageId(1), vec![1], now);

        let (resend, _) = state.receive_ack(&AckPacket {
            latest_seq: SequenceId(1),
            missing: vec![SequenceId(1)],
        });
        assert_eq!(delivered_seqs(&resend), vec![1]);
        // Timeout accounting still runs from the first transmission.
        assert_eq!(state.sender.awaiting_acks[0].timestamp, now);
    }
}
