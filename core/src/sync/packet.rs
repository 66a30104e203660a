// Sync packet wire formats, carried under the 0x02 application tag.
//
// PULL  0x00 | sender_pk(32) | sender_version(4) | digest | signature(64)
// PUSH  0x01 | sender_pk(32) | receiver_pk(32) | deltas | signature(64)
//
// The PULL digest omits the sender's own entry; receivers restore it
// from `sender_version`. Both packets are signed by the sender's node
// key; deltas additionally carry their author's signature.

use super::delta::{verify_author, Delta};
use super::digest::{Digest, Version};
use super::model::{Model, NodePublicKey};
use super::SyncError;

pub const SYNC_PULL: u8 = 0x00;
pub const SYNC_PUSH: u8 = 0x01;

const SIGNATURE_LEN: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullPacket {
    pub sender_public_key: NodePublicKey,
    pub sender_version: Version,
    pub digest: Digest,
    pub signature: Vec<u8>,
}

fn pull_header(sender: &NodePublicKey, sender_version: Version, digest: &Digest) -> Vec<u8> {
    let mut buf = vec![SYNC_PULL];
    buf.extend_from_slice(&sender.0);
    buf.extend_from_slice(&sender_version.to_be_bytes());
    digest.encode_without_sender(&mut buf, sender);
    buf
}

impl PullPacket {
    /// Snapshot `model`'s own digest into a signed PULL.
    pub fn new(model: &mut Model) -> PullPacket {
        let digest = model.own_digest().clone();
        let sender = model.public_key;
        let sender_version = digest.nodes.get(&sender).copied().unwrap_or(0);

        let header = pull_header(&sender, sender_version, &digest);
        let signature = model.sign(&header);

        PullPacket {
            sender_public_key: sender,
            sender_version,
            digest,
            signature,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = pull_header(&self.sender_public_key, self.sender_version, &self.digest);
        buf.extend_from_slice(&self.signature);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<PullPacket, SyncError> {
        if buf.len() < 37 {
            return Err(SyncError::Truncated("pull packet"));
        }
        if buf[0] != SYNC_PULL {
            return Err(SyncError::UnknownType(buf[0]));
        }

        let sender_public_key = NodePublicKey(buf[1..33].try_into().unwrap());
        let sender_version = u32::from_be_bytes(buf[33..37].try_into().unwrap());
        let (mut digest, digest_len) = Digest::decode(&buf[37..])?;

        let signed_len = 37 + digest_len;
        if buf.len() < signed_len + SIGNATURE_LEN {
            return Err(SyncError::Truncated("pull packet"));
        }

        let signature = buf[signed_len..signed_len + SIGNATURE_LEN].to_vec();
        verify_author(&sender_public_key, &buf[..signed_len], &signature)?;

        // Restore the sender's own elided entry.
        digest.update_node(sender_public_key, sender_version);

        Ok(PullPacket {
            sender_public_key,
            sender_version,
            digest,
            signature,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushPacket {
    pub sender_public_key: NodePublicKey,
    pub receiver_public_key: NodePublicKey,
    pub deltas: Vec<Delta>,
    pub signature: Vec<u8>,
}

fn push_header(
    sender: &NodePublicKey,
    receiver: &NodePublicKey,
    deltas: &[Delta],
) -> Vec<u8> {
    let mut buf = vec![SYNC_PUSH];
    buf.extend_from_slice(&sender.0);
    buf.extend_from_slice(&receiver.0);
    Delta::encode_list(deltas, &mut buf);
    buf
}

impl PushPacket {
    pub fn new(model: &Model, receiver: NodePublicKey, deltas: Vec<Delta>) -> PushPacket {
        let header = push_header(&model.public_key, &receiver, &deltas);
        let signature = model.sign(&header);

        PushPacket {
            sender_public_key: model.public_key,
            receiver_public_key: receiver,
            deltas,
            signature,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = push_header(
            &self.sender_public_key,
            &self.receiver_public_key,
            &self.deltas,
        );
        buf.extend_from_slice(&self.signature);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<PushPacket, SyncError> {
        if buf.len() < 69 {
            return Err(SyncError::Truncated("push packet"));
        }
        if buf[0] != SYNC_PUSH {
            return Err(SyncError::UnknownType(buf[0]));
        }

        let sender_public_key = NodePublicKey(buf[1..33].try_into().unwrap());
        let receiver_public_key = NodePublicKey(buf[33..65].try_into().unwrap());
        let (deltas, deltas_len) = Delta::decode_list(&buf[65..])?;

        let signed_len = 65 + deltas_len;
        if buf.len() < signed_len + SIGNATURE_LEN {
            return Err(SyncError::Truncated("push packet"));
        }

        let signature = buf[signed_len..signed_len + SIGNATURE_LEN].to_vec();
        verify_author(&sender_public_key, &buf[..signed_len], &signature)?;

        Ok(PushPacket {
            sender_public_key,
            receiver_public_key,
            deltas,
            signature,
        })
    }
}
