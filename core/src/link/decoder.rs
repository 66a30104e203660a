// Frame decoder — reassembles messages from a queue of received link
// packets, walking continuation chains across packet boundaries.

use std::collections::VecDeque;

use super::header::{FrameHeader, HEADER_LEN};
use super::{FrameError, MAX_PACKET_SIZE};

#[derive(Default)]
pub struct FrameDecoder {
    packets: VecDeque<Vec<u8>>,
    cursor: usize,
}

impl FrameDecoder {
    pub fn new() -> Self {
        FrameDecoder::default()
    }

    pub fn packet_count(&self) -> usize {
        self.packets.len()
    }

    /// Queue a received link packet for decoding.
    pub fn append_packet(&mut self, packet: &[u8]) -> Result<(), FrameError> {
        if packet.len() >= MAX_PACKET_SIZE {
            return Err(FrameError::PacketTooLarge(packet.len()));
        }

        self.packets.push_back(packet.to_vec());
        Ok(())
    }

    fn advance_packet(&mut self) {
        self.packets.pop_front();
        self.cursor = 0;
    }

    /// Drop padding frames and packets too short to hold a header.
    fn skip_empty_frames(&mut self) {
        while let Some(front) = self.packets.front() {
            let rest = &front[self.cursor..];
            if rest.len() < HEADER_LEN {
                self.advance_packet();
                break;
            }

            match FrameHeader::decode(rest) {
                Ok(header) if !header.non_empty => self.advance_packet(),
                _ => break,
            }
        }
    }

    /// Whether a complete message (a frame chain ending with a
    /// non-continuation frame) is available.
    ///
    /// The scan consumes nothing; truncated packets are stepped over and
    /// reported by [`read_message`](Self::read_message) once consumed.
    pub fn has_message(&mut self) -> bool {
        self.skip_empty_frames();

        let mut cursor = self.cursor;
        let mut index = 0;

        while index < self.packets.len() {
            let packet = &self.packets[index];
            if packet.len().saturating_sub(cursor) < HEADER_LEN {
                index += 1;
                cursor = 0;
                continue;
            }

            let Ok(header) = FrameHeader::decode(&packet[cursor..]) else {
                break;
            };
            if !header.continuation {
                return true;
            }

            cursor += header.size + HEADER_LEN;
            if cursor >= packet.len().saturating_sub(HEADER_LEN + 1) {
                index += 1;
                cursor = 0;
            }
        }

        false
    }

    /// Decode and remove the oldest complete message.
    pub fn read_message(&mut self) -> Result<Vec<u8>, FrameError> {
        if !self.has_message() {
            return Err(FrameError::NoMessage);
        }

        let mut message = Vec::new();
        let mut continuation = true;

        while continuation {
            let Some(front) = self.packets.front() else {
                break;
            };
            let rest = &front[self.cursor..];

            let header = match FrameHeader::decode(rest) {
                Ok(header) => header,
                Err(err) => {
                    self.advance_packet();
                    return Err(err);
                }
            };

            if header.size > rest.len() - HEADER_LEN {
                self.advance_packet();
                return Err(FrameError::FrameOverrun);
            }

            message.extend_from_slice(&rest[HEADER_LEN..HEADER_LEN + header.size]);
            continuation = header.continuation;

            self.cursor += header.size + HEADER_LEN;
            if self.cursor >= front.len() {
                self.advance_packet();
            }
        }

        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::encoder::FrameEncoder;
    use proptest::prelude::*;

    fn single_frame_packet(body: &[u8]) -> Vec<u8> {
        let mut packet = vec![0b1000_0000, body.len() as u8];
        packet.extend_from_slice(body);
        packet
    }

    #[test]
    fn test_decode_simple_message() {
        let mut decoder = FrameDecoder::new();
        let mut packet = single_frame_packet(b"hello");
        packet.resize(514, 0);
        decoder.append_packet(&packet).unwrap();

        assert_eq!(decoder.packet_count(), 1);
        assert_eq!(decoder.read_message().unwrap(), b"hello");
        assert!(!decoder.has_message());
    }

    #[test]
    fn test_decode_two_messages_in_one_packet() {
        let mut packet = single_frame_packet(b"Hi Bob");
        packet.extend_from_slice(&single_frame_packet(b"Hi Charlie"));
        packet.resize(514, 0);

        let mut decoder = FrameDecoder::new();
        decoder.append_packet(&packet).unwrap();

        assert!(decoder.has_message());
        assert_eq!(decoder.read_message().unwrap(), b"Hi Bob");
        assert_eq!(decoder.read_message().unwrap(), b"Hi Charlie");
        assert!(!decoder.has_message());
    }

    #[test]
    fn test_decode_message_spanning_two_packets() {
        let message = vec![b'A'; 600];
        let mut encoder = FrameEncoder::new(514);
        encoder.encode_message(&message).unwrap();

        let mut decoder = FrameDecoder::new();
        while encoder.packet_count() > 0 {
            decoder.append_packet(&encoder.pop_packet()).unwrap();
        }

        assert_eq!(decoder.packet_count(), 2);
        assert!(decoder.has_message());
        assert_eq!(decoder.read_message().unwrap(), message);
        assert!(!decoder.has_message());
    }

    #[test]
    fn test_partial_message_is_not_ready() {
        let message = vec![b'A'; 600];
        let mut encoder = FrameEncoder::new(514);
        encoder.encode_message(&message).unwrap();

        let mut decoder = FrameDecoder::new();
        decoder.append_packet(&encoder.pop_packet()).unwrap();

        assert!(!decoder.has_message());
        assert!(matches!(
            decoder.read_message(),
            Err(FrameError::NoMessage)
        ));
    }

    #[test]
    fn test_padding_after_last_frame_is_skipped() {
        let mut packet = single_frame_packet(b"data");
        packet.resize(64, 0);

        let mut decoder = FrameDecoder::new();
        decoder.append_packet(&packet).unwrap();

        assert_eq!(decoder.read_message().unwrap(), b"data");
        assert!(!decoder.has_message());
        assert_eq!(decoder.packet_count(), 0);
    }

    #[test]
    fn test_frame_size_beyond_packet_is_malformed() {
        // Claims 200 body bytes in a 10-byte packet.
        let mut packet = vec![0b1000_0000, 200];
        packet.resize(10, 0);

        let mut decoder = FrameDecoder::new();
        decoder.append_packet(&packet).unwrap();

        assert!(matches!(
            decoder.read_message(),
            Err(FrameError::FrameOverrun)
        ));
        assert_eq!(decoder.packet_count(), 0);
    }

    #[test]
    fn test_oversized_packet_is_rejected() {
        let mut decoder = FrameDecoder::new();
        let packet = vec![0u8; MAX_PACKET_SIZE];
        assert!(matches!(
            decoder.append_packet(&packet),
            Err(FrameError::PacketTooLarge(_))
        ));
    }

    #[test]
    fn test_empty_message_roundtrip() {
        let mut encoder = FrameEncoder::new(16);
        encoder.encode_message(&[]).unwrap();

        let mut decoder = FrameDecoder::new();
        decoder.append_packet(&encoder.pop_packet()).unwrap();

        assert!(decoder.has_message());
        assert_eq!(decoder.read_message().unwrap(), Vec::<u8>::new());
    }

    proptest! {
        #[test]
        fn prop_roundtrip_any_mtu(
            packet_size in 3usize..400,
            message in proptest::collection::vec(any::<u8>(), 0..1200),
        ) {
            let mut encoder = FrameEncoder::new(packet_size);
            encoder.encode_message(&message).unwrap();

            let mut decoder = FrameDecoder::new();
            while encoder.packet_count() > 0 {
                decoder.append_packet(&encoder.pop_packet()).unwrap();
            }

            prop_assert!(decoder.has_message());
            prop_assert_eq!(decoder.read_message().unwrap(), message);
            prop_assert!(!decoder.has_message());
        }

        #[test]
        fn prop_decoder_never_panics_on_garbage(
            packets in proptest::collection::vec(
                proptest::collection::vec(any::<u8>(), 0..600),
                1..4,
            ),
        ) {
            let mut decoder = FrameDecoder::new();
            for packet in &packets {
                decoder.append_packet(packet).unwrap();
            }

            // Drain until quiescent; errors are fine, panics are not.
            while decoder.has_message() {
                let _ = decoder.read_message();
            }
        }
    }
}
