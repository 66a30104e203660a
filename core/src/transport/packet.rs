// Transport packet wire formats, carried inside SESS ciphertext.
//
// DATA  0x01 | seq(4) | body
// ACK   0x02 | latest_seq(4) | missing_count(4) | missing_seq(4)*

use std::fmt;

use thiserror::Error;

pub const DATA: u8 = 0x01;
pub const ACK: u8 = 0x02;

/// Per-session sequence number, strictly increasing from 1 per direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SequenceId(pub u32);

impl fmt::Display for SequenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PacketError {
    #[error("buffer too small when decoding {kind}: {len} bytes")]
    Truncated { kind: &'static str, len: usize },
    #[error("unknown transport packet type {0}")]
    UnknownType(u8),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPacket {
    pub seq: SequenceId,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckPacket {
    pub latest_seq: SequenceId,
    pub missing: Vec<SequenceId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportPacket {
    Data(DataPacket),
    Ack(AckPacket),
}

impl TransportPacket {
    pub fn decode(buf: &[u8]) -> Result<TransportPacket, PacketError> {
        match buf.first() {
            Some(&DATA) => DataPacket::decode(buf).map(TransportPacket::Data),
            Some(&ACK) => AckPacket::decode(buf).map(TransportPacket::Ack),
            Some(&other) => Err(PacketError::UnknownType(other)),
            None => Err(PacketError::Truncated {
                kind: "transport packet",
                len: 0,
            }),
        }
    }
}

impl DataPacket {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(5 + self.body.len());
        buf.push(DATA);
        buf.extend_from_slice(&self.seq.0.to_be_bytes());
        buf.extend_from_slice(&self.body);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<DataPacket, PacketError> {
        if buf.len() < 5 {
            return Err(PacketError::Truncated {
                kind: "DATA",
                len: buf.len(),
            });
        }

        Ok(DataPacket {
            seq: SequenceId(u32::from_be_bytes(buf[1..5].try_into().unwrap())),
            body: buf[5..].to_vec(),
        })
    }
}

impl AckPacket {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(9 + self.missing.len() * 4);
        buf.push(ACK);
        buf.extend_from_slice(&self.latest_seq.0.to_be_bytes());
        buf.extend_from_slice(&(self.missing.len() as u32).to_be_bytes());
        for seq in &self.missing {
            buf.extend_from_slice(&seq.0.to_be_bytes());
        }
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<AckPacket, PacketError> {
        if buf.len() < 9 {
            return Err(PacketError::Truncated {
                kind: "ACK",
                len: buf.len(),
            });
        }

        let count = u32::from_be_bytes(buf[5..9].try_into().unwrap()) as usize;
        let needed = count
            .checked_mul(4)
            .and_then(|n| n.checked_add(9))
            .ok_or(PacketError::Truncated {
                kind: "ACK missing list",
                len: buf.len(),
            })?;
        if buf.len() < needed {
            return Err(PacketError::Truncated {
                kind: "ACK missing list",
                len: buf.len(),
            });
        }

        let missing = (0..count)
            .map(|i| {
                let offset = 9 + i * 4;
                SequenceId(u32::from_be_bytes(buf[offset..offset + 4].try_into().unwrap()))
            })
            .collect();

        Ok(AckPacket {
            latest_seq: SequenceId(u32::from_be_bytes(buf[1..5].try_into().unwrap())),
            missing,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_data_roundtrip() {
        let packet = DataPacket {
            seq: SequenceId(7),
            body: b"payload".to_vec(),
        };
        let encoded = packet.encode();
        assert_eq!(encoded[0], DATA);
        assert_eq!(DataPacket::decode(&encoded).unwrap(), packet);
    }

    #[test]
    fn test_data_with_empty_body() {
        let packet = DataPacket {
            seq: SequenceId(1),
            body: Vec::new(),
        };
        assert_eq!(DataPacket::decode(&packet.encode()).unwrap(), packet);
    }

    #[test]
    fn test_ack_roundtrip() {
        let packet = AckPacket {
            latest_seq: SequenceId(6),
            missing: vec![SequenceId(3), SequenceId(5)],
        };
        let encoded = packet.encode();
        assert_eq!(encoded.len(), 9 + 8);
        assert_eq!(AckPacket::decode(&encoded).unwrap(), packet);
    }

    #[test]
    fn test_ack_with_no_missing_seqs() {
        let packet = AckPacket {
            latest_seq: SequenceId(12),
            missing: Vec::new(),
        };
        assert_eq!(AckPacket::decode(&packet.encode()).unwrap(), packet);
    }

    #[test]
    fn test_decode_rejects_truncation_and_unknown_types() {
        assert!(matches!(
            TransportPacket::decode(&[]),
            Err(PacketError::Truncated { .. })
        ));
        assert!(matches!(
            TransportPacket::decode(&[0x03, 0, 0]),
            Err(PacketError::UnknownType(0x03))
        ));
        assert!(matches!(
            DataPacket::decode(&[DATA, 0, 0]),
            Err(PacketError::Truncated { .. })
        ));

        // ACK claiming more missing entries than the buffer carries.
        let mut encoded = AckPacket {
            latest_seq: SequenceId(1),
            missing: Vec::new(),
        }
        .encode();
        encoded[5..9].copy_from_slice(&u32::MAX.to_be_bytes());
        assert!(matches!(
            AckPacket::decode(&encoded),
            Err(PacketError::Truncated { .. })
        ));
    }

    proptest! {
        #[test]
        fn prop_decode_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..300)) {
            let _ = TransportPacket::decode(&bytes);
        }
    }
}
