// Link layer — fragments variable-size messages over fixed-size link
// packets, one encoder/decoder pair per connected peer.

mod decoder;
mod encoder;
mod header;

pub use decoder::FrameDecoder;
pub use encoder::FrameEncoder;
pub use header::{FrameHeader, HEADER_LEN};

use std::collections::HashMap;

use thiserror::Error;

use crate::device::{BroadcastStrategy, Device, DeviceAddress};
use crate::util::shuffled_keys;

/// Exclusive upper bound on link packet sizes.
pub const MAX_PACKET_SIZE: usize = 1 << 14;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    #[error("packet of {0} bytes exceeds the packet size limit")]
    PacketTooLarge(usize),
    #[error("frame header needs at least 2 bytes")]
    TruncatedHeader,
    #[error("frame size exceeds the remaining packet bytes")]
    FrameOverrun,
    #[error("message does not fit in the working packet")]
    MessageOverflow,
    #[error("no message available to read")]
    NoMessage,
}

struct LinkConnection {
    encoder: FrameEncoder,
    decoder: FrameDecoder,
}

impl LinkConnection {
    fn new(packet_size: usize) -> Self {
        LinkConnection {
            encoder: FrameEncoder::new(packet_size),
            decoder: FrameDecoder::new(),
        }
    }
}

/// Per-peer framing state for every connected neighbour.
#[derive(Default)]
pub struct LinkState {
    connections: HashMap<DeviceAddress, LinkConnection>,
}

impl LinkState {
    pub fn new() -> Self {
        LinkState::default()
    }

    fn log(dev: &dyn Device, message: &str) {
        dev.log(&format!("link:{message}"));
    }

    /// Number of currently connected neighbours.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn on_connection(&mut self, dev: &dyn Device, address: &DeviceAddress) {
        let packet_size = match dev.max_packet_size(address) {
            Ok(size) => size,
            Err(err) => {
                Self::log(dev, &format!("connect:error 'failed to get packet size: {err}'"));
                return;
            }
        };

        self.connections
            .insert(address.clone(), LinkConnection::new(packet_size));
    }

    pub fn on_disconnection(&mut self, address: &DeviceAddress) {
        self.connections.remove(address);
    }

    /// Feed one received link packet through the peer's decoder and
    /// return every complete message it yields.
    pub fn receive(
        &mut self,
        dev: &dyn Device,
        sender: &DeviceAddress,
        packet: &[u8],
    ) -> Vec<Vec<u8>> {
        let Some(conn) = self.connections.get_mut(sender) else {
            Self::log(dev, "receive:error 'connection not found'");
            return Vec::new();
        };

        if let Err(err) = conn.decoder.append_packet(packet) {
            Self::log(dev, &format!("receive:error 'failed to append packet: {err}'"));
            return Vec::new();
        }

        let mut messages = Vec::new();
        while conn.decoder.has_message() {
            match conn.decoder.read_message() {
                Ok(message) => messages.push(message),
                Err(err) => {
                    Self::log(dev, &format!("receive:error 'failed to decode packet: {err}'"));
                }
            }
        }

        if !messages.is_empty() {
            Self::log(
                dev,
                &format!("receive:{sender} 'decoded {} message(s)'", messages.len()),
            );
        }

        messages
    }

    /// Frame `data` for `address` and hand the resulting link packets to
    /// the device. Returns false when the peer is unknown or framing
    /// failed; the caller decides whether that breaks a session.
    pub fn send(&mut self, dev: &dyn Device, address: &DeviceAddress, data: &[u8]) -> bool {
        let packet_size = match dev.max_packet_size(address) {
            Ok(size) => size,
            Err(err) => {
                Self::log(dev, &format!("send:error 'failed to get packet size: {err}'"));
                return false;
            }
        };

        let Some(conn) = self.connections.get_mut(address) else {
            Self::log(dev, "send:error 'connection not found'");
            return false;
        };

        // The MTU may change between sends; rebuild the encoder when it does.
        if packet_size != conn.encoder.packet_size() {
            conn.encoder = FrameEncoder::new(packet_size);
        }

        if conn.encoder.encode_message(data).is_err() {
            Self::log(dev, "send:error 'failed to encode message'");
            return false;
        }

        Self::log(
            dev,
            &format!("send:{address} '{} packet(s)'", conn.encoder.packet_count()),
        );
        while conn.encoder.packet_count() > 0 {
            let packet = conn.encoder.pop_packet();
            dev.send_packet(address, &packet);
        }

        true
    }

    /// Send `data` to every connected neighbour in shuffled order.
    pub fn broadcast(&mut self, dev: &dyn Device, data: &[u8]) {
        Self::log(
            dev,
            &format!("broadcast 'sending to {} peer(s)'", self.connections.len()),
        );
        for address in shuffled_keys(dev, &self.connections) {
            self.send(dev, &address, data);
        }
    }

    /// Send `data` to neighbours other than `except`, narrowed by the
    /// configured broadcast strategy.
    pub fn broadcast_except(
        &mut self,
        dev: &dyn Device,
        strategy: BroadcastStrategy,
        data: &[u8],
        except: &DeviceAddress,
    ) {
        match strategy {
            BroadcastStrategy::All => {
                Self::log(
                    dev,
                    &format!(
                        "broadcast 'sending to {} peer(s)'",
                        self.connections.len().saturating_sub(1)
                    ),
                );
                for address in shuffled_keys(dev, &self.connections) {
                    if address != *except {
                        self.send(dev, &address, data);
                    }
                }
            }
            BroadcastStrategy::LogFunc => {
                let neighbours = self.connections.len().saturating_sub(1);
                let limit = if neighbours == 0 {
                    0
                } else {
                    neighbours.min(neighbours.ilog2() as usize + 1)
                };

                let mut count = 0;
                for address in shuffled_keys(dev, &self.connections) {
                    if address != *except {
                        if count < limit {
                            self.send(dev, &address, data);
                        }
                        count += 1;
                    }
                }
                Self::log(
                    dev,
                    &format!("broadcast 'sending to {} peer(s)'", limit.min(count)),
                );
            }
            BroadcastStrategy::Two => {
                let addresses = shuffled_keys(dev, &self.connections);
                let mut count = 0;
                for address in addresses.iter().take(2) {
                    self.send(dev, address, data);
                    count += 1;
                }
                Self::log(dev, &format!("broadcast 'sending to {count} peer(s)'"));
            }
        }
    }
}
