// Routing packet wire formats. All integers are big-endian.
//
// RREQ  0x01 | request_id(8) | ttl(2) | ephemeral_public(32) | bitmap(256)
// RREP  0x02 | request_id(8) | session_id(8) | ephemeral_public(32)
//            | nonce(12) | payload_len(4) | ciphertext(payload_len + 16)
// SESS  0x03 | session_id(8) | nonce(12) | payload_len(4) | ciphertext
// RERR  0x04 | session_id(8)

use thiserror::Error;

use super::bitmap::{ContactBitmap, BITMAP_SIZE};
use super::table::RequestId;
use crate::device::SessionId;

pub const RREQ: u8 = 0x01;
pub const RREP: u8 = 0x02;
pub const SESS: u8 = 0x03;
pub const RERR: u8 = 0x04;

/// Length of the RREP header that doubles as AEAD associated data.
pub const RREP_HEADER_LEN: usize = 49;

const GCM_TAG_LEN: usize = 16;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PacketError {
    #[error("buffer too small when decoding {kind}: {len} bytes")]
    Truncated { kind: &'static str, len: usize },
    #[error("unknown routing packet type {0}")]
    UnknownType(u8),
    #[error("wrong packet header when decoding {0}")]
    WrongHeader(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteRequest {
    pub request_id: RequestId,
    pub ttl: u16,
    pub ephemeral_key: [u8; 32],
    pub bitmap: ContactBitmap,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteReply {
    pub request_id: RequestId,
    pub session_id: SessionId,
    pub ephemeral_key: [u8; 32],
    pub nonce: [u8; 12],
    /// Ciphertext including the 16-byte authentication tag.
    pub cipher: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionData {
    pub session_id: SessionId,
    pub nonce: [u8; 12],
    /// Ciphertext including the 16-byte authentication tag.
    pub cipher: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteError {
    pub session_id: SessionId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutingPacket {
    RouteRequest(RouteRequest),
    RouteReply(RouteReply),
    SessionData(SessionData),
    RouteError(RouteError),
}

impl RoutingPacket {
    pub fn decode(buf: &[u8]) -> Result<RoutingPacket, PacketError> {
        match buf.first() {
            Some(&RREQ) => RouteRequest::decode(buf).map(RoutingPacket::RouteRequest),
            Some(&RREP) => RouteReply::decode(buf).map(RoutingPacket::RouteReply),
            Some(&SESS) => SessionData::decode(buf).map(RoutingPacket::SessionData),
            Some(&RERR) => RouteError::decode(buf).map(RoutingPacket::RouteError),
            Some(&other) => Err(PacketError::UnknownType(other)),
            None => Err(PacketError::Truncated {
                kind: "routing packet",
                len: 0,
            }),
        }
    }
}

impl RouteRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(43 + BITMAP_SIZE);
        buf.push(RREQ);
        buf.extend_from_slice(&self.request_id.0.to_be_bytes());
        buf.extend_from_slice(&self.ttl.to_be_bytes());
        buf.extend_from_slice(&self.ephemeral_key);
        buf.extend_from_slice(&self.bitmap);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<RouteRequest, PacketError> {
        if buf.len() < 43 + BITMAP_SIZE {
            return Err(PacketError::Truncated {
                kind: "RREQ",
                len: buf.len(),
            });
        }
        if buf[0] != RREQ {
            return Err(PacketError::WrongHeader("RREQ"));
        }

        let mut bitmap = [0u8; BITMAP_SIZE];
        bitmap.copy_from_slice(&buf[43..43 + BITMAP_SIZE]);

        Ok(RouteRequest {
            request_id: RequestId(u64::from_be_bytes(buf[1..9].try_into().unwrap())),
            ttl: u16::from_be_bytes(buf[9..11].try_into().unwrap()),
            ephemeral_key: buf[11..43].try_into().unwrap(),
            bitmap,
        })
    }
}

impl RouteReply {
    /// The 49-byte header authenticated as AEAD associated data.
    pub fn header_bytes(
        request_id: RequestId,
        session_id: SessionId,
        ephemeral_key: &[u8; 32],
    ) -> [u8; RREP_HEADER_LEN] {
        let mut buf = [0u8; RREP_HEADER_LEN];
        buf[0] = RREP;
        buf[1..9].copy_from_slice(&request_id.0.to_be_bytes());
        buf[9..17].copy_from_slice(&session_id.0.to_be_bytes());
        buf[17..49].copy_from_slice(ephemeral_key);
        buf
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(RREP_HEADER_LEN + 16 + self.cipher.len());
        buf.extend_from_slice(&Self::header_bytes(
            self.request_id,
            self.session_id,
            &self.ephemeral_key,
        ));
        buf.extend_from_slice(&self.nonce);
        let payload_len = (self.cipher.len() - GCM_TAG_LEN) as u32;
        buf.extend_from_slice(&payload_len.to_be_bytes());
        buf.extend_from_slice(&self.cipher);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<RouteReply, PacketError> {
        if buf.len() < 65 {
            return Err(PacketError::Truncated {
                kind: "RREP",
                len: buf.len(),
            });
        }
        if buf[0] != RREP {
            return Err(PacketError::WrongHeader("RREP"));
        }

        let payload_len = u32::from_be_bytes(buf[61..65].try_into().unwrap()) as usize;
        let end = 65 + payload_len + GCM_TAG_LEN;
        if buf.len() < end {
            return Err(PacketError::Truncated {
                kind: "RREP payload",
                len: buf.len(),
            });
        }

        Ok(RouteReply {
            request_id: RequestId(u64::from_be_bytes(buf[1..9].try_into().unwrap())),
            session_id: SessionId(u64::from_be_bytes(buf[9..17].try_into().unwrap())),
            ephemeral_key: buf[17..49].try_into().unwrap(),
            nonce: buf[49..61].try_into().unwrap(),
            cipher: buf[65..end].to_vec(),
        })
    }
}

impl SessionData {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(25 + self.cipher.len());
        buf.push(SESS);
        buf.extend_from_slice(&self.session_id.0.to_be_bytes());
        buf.extend_from_slice(&self.nonce);
        let payload_len = (self.cipher.len() - GCM_TAG_LEN) as u32;
        buf.extend_from_slice(&payload_len.to_be_bytes());
        buf.extend_from_slice(&self.cipher);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<SessionData, PacketError> {
        if buf.len() < 41 {
            return Err(PacketError::Truncated {
                kind: "SESS",
                len: buf.len(),
            });
        }
        if buf[0] != SESS {
            return Err(PacketError::WrongHeader("SESS"));
        }

        let payload_len = u32::from_be_bytes(buf[21..25].try_into().unwrap()) as usize;
        if buf.len() < 41 + payload_len {
            return Err(PacketError::Truncated {
                kind: "SESS cipher",
                len: buf.len(),
            });
        }

        Ok(SessionData {
            session_id: SessionId(u64::from_be_bytes(buf[1..9].try_into().unwrap())),
            nonce: buf[9..21].try_into().unwrap(),
            cipher: buf[25..25 + payload_len + GCM_TAG_LEN].to_vec(),
        })
    }
}

impl RouteError {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(9);
        buf.push(RERR);
        buf.extend_from_slice(&self.session_id.0.to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<RouteError, PacketError> {
        if buf.len() < 9 {
            return Err(PacketError::Truncated {
                kind: "RERR",
                len: buf.len(),
            });
        }
        if buf[0] != RERR {
            return Err(PacketError::WrongHeader("RERR"));
        }

        Ok(RouteError {
            session_id: SessionId(u64::from_be_bytes(buf[1..9].try_into().unwrap())),
        })
    }
}
