// Delta — one signed log entry another peer is missing.
//
// Wire format:
//   pk(32) | version(4) | len(4) | value | 0x00 | signature(64)
//   pk(32) | version(4) | len(4) | value | 0x01 | attached_secret(32) | signature(64)
//
// The signature covers everything before it and is verified on decode,
// so tampering anywhere in a delta fails before it can reach a model.

use ed25519_dalek::{Signature, Verifier};

use super::digest::Version;
use super::model::NodePublicKey;
use super::SyncError;

const SIGNATURE_LEN: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delta {
    pub public_key: NodePublicKey,
    pub version: Version,
    pub value: Vec<u8>,
    pub attached_secret: Option<[u8; 32]>,
    pub signature: Vec<u8>,
}

impl Delta {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.public_key.0);
        buf.extend_from_slice(&self.version.to_be_bytes());
        buf.extend_from_slice(&(self.value.len() as u32).to_be_bytes());
        buf.extend_from_slice(&self.value);

        match &self.attached_secret {
            Some(secret) => {
                buf.push(0x01);
                buf.extend_from_slice(secret);
            }
            None => buf.push(0x00),
        }

        buf.extend_from_slice(&self.signature);
    }

    /// Decode and verify one delta, returning it with the bytes consumed.
    pub fn decode(buf: &[u8]) -> Result<(Delta, usize), SyncError> {
        if buf.len() < 40 {
            return Err(SyncError::Truncated("delta"));
        }

        let public_key = NodePublicKey(buf[0..32].try_into().unwrap());
        let version = u32::from_be_bytes(buf[32..36].try_into().unwrap());
        let value_len = u32::from_be_bytes(buf[36..40].try_into().unwrap()) as usize;

        if buf.len() < value_len
            .checked_add(40 + 1 + SIGNATURE_LEN)
            .ok_or(SyncError::Truncated("delta"))?
        {
            return Err(SyncError::Truncated("delta"));
        }

        let value = buf[40..40 + value_len].to_vec();
        let mut offset = 40 + value_len;

        let has_secret = buf[offset] == 0x01;
        offset += 1;

        let attached_secret = if has_secret {
            if buf.len() < offset + 32 + SIGNATURE_LEN {
                return Err(SyncError::Truncated("delta"));
            }
            let secret: [u8; 32] = buf[offset..offset + 32].try_into().unwrap();
            offset += 32;
            Some(secret)
        } else {
            None
        };

        let signature = buf[offset..offset + SIGNATURE_LEN].to_vec();
        verify_author(&public_key, &buf[..offset], &signature)?;

        Ok((
            Delta {
                public_key,
                version,
                value,
                attached_secret,
                signature,
            },
            offset + SIGNATURE_LEN,
        ))
    }

    pub fn encode_list(deltas: &[Delta], buf: &mut Vec<u8>) {
        buf.extend_from_slice(&(deltas.len() as u32).to_be_bytes());
        for delta in deltas {
            delta.encode(buf);
        }
    }

    /// Decode a length-prefixed delta list with the bytes consumed.
    pub fn decode_list(buf: &[u8]) -> Result<(Vec<Delta>, usize), SyncError> {
        if buf.len() < 4 {
            return Err(SyncError::Truncated("delta list"));
        }

        let count = u32::from_be_bytes(buf[0..4].try_into().unwrap()) as usize;
        let mut deltas = Vec::new();
        let mut offset = 4;

        for _ in 0..count {
            let (delta, consumed) = Delta::decode(&buf[offset..])?;
            deltas.push(delta);
            offset += consumed;
        }

        Ok((deltas, offset))
    }
}

pub(super) fn verify_author(
    public_key: &NodePublicKey,
    message: &[u8],
    signature: &[u8],
) -> Result<(), SyncError> {
    let key = public_key.verifying_key().map_err(|_| SyncError::Signature)?;
    let signature = Signature::from_slice(signature).map_err(|_| SyncError::Signature)?;
    key.verify(message, &signature).map_err(|_| SyncError::Signature)
}
