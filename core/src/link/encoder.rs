// Frame encoder — packs variable-size messages into fixed-size link
// packets, splitting across packet boundaries with continuation frames.

use std::collections::VecDeque;

use super::header::{FrameHeader, HEADER_LEN};
use super::{FrameError, MAX_PACKET_SIZE};

pub struct FrameEncoder {
    packets: VecDeque<Vec<u8>>,
    working: Vec<u8>,
    cursor: usize,
    packet_size: usize,
}

impl FrameEncoder {
    /// # Panics
    /// Panics when `packet_size` is outside `[3, 2^14)`; the host MTU
    /// contract guarantees the range.
    pub fn new(packet_size: usize) -> Self {
        assert!(
            packet_size >= HEADER_LEN + 1,
            "packet size must be at least {}",
            HEADER_LEN + 1
        );
        assert!(
            packet_size < MAX_PACKET_SIZE,
            "packet size must be below {MAX_PACKET_SIZE}"
        );

        FrameEncoder {
            packets: VecDeque::new(),
            working: vec![0; packet_size],
            cursor: 0,
            packet_size,
        }
    }

    pub fn packet_size(&self) -> usize {
        self.packet_size
    }

    /// Completed packets plus the partial working packet, if any.
    pub fn packet_count(&self) -> usize {
        self.packets.len() + usize::from(self.cursor > 0)
    }

    /// Remove and return the oldest pending packet. Falls back to the
    /// partial working packet, and to an empty buffer when idle.
    pub fn pop_packet(&mut self) -> Vec<u8> {
        if let Some(packet) = self.packets.pop_front() {
            return packet;
        }

        if self.cursor > 0 {
            self.take_working()
        } else {
            Vec::new()
        }
    }

    fn take_working(&mut self) -> Vec<u8> {
        let mut packet = std::mem::replace(&mut self.working, vec![0; self.packet_size]);
        packet.truncate(self.cursor);
        self.cursor = 0;
        packet
    }

    fn flush_working(&mut self) {
        let packet = self.take_working();
        self.packets.push_back(packet);
    }

    fn write_frame(&mut self, body: &[u8], continuation: bool) -> Result<(), FrameError> {
        if body.len() > self.packet_size - self.cursor - HEADER_LEN {
            return Err(FrameError::MessageOverflow);
        }

        let header = FrameHeader::data(body.len(), continuation).encode();
        self.working[self.cursor..self.cursor + HEADER_LEN].copy_from_slice(&header);
        self.working[self.cursor + HEADER_LEN..self.cursor + HEADER_LEN + body.len()]
            .copy_from_slice(body);
        self.cursor += body.len() + HEADER_LEN;

        Ok(())
    }

    /// Append `message` to the working packet, emitting completed packets
    /// as continuation frames fill them.
    pub fn encode_message(&mut self, mut message: &[u8]) -> Result<(), FrameError> {
        // Too little room for even a header plus one byte.
        if self.cursor >= self.packet_size - HEADER_LEN {
            self.flush_working();
        }

        loop {
            let room = self.packet_size - self.cursor - HEADER_LEN;
            if message.len() > room {
                self.write_frame(&message[..room], true)?;
                self.flush_working();
                message = &message[room..];
            } else {
                self.write_frame(message, false)?;
                return Ok(());
            }
        }
    }
}
