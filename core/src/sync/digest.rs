// Digest — a per-contact summary of the latest known version per author.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::model::NodePublicKey;
use super::SyncError;

/// Version counter scoped per contact: every published message takes the
/// next value regardless of author.
pub type Version = u32;

const DIGEST_ENTRY_LEN: usize = 36;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Digest {
    pub nodes: BTreeMap<NodePublicKey, Version>,
    pub max_version: Version,
}

impl Digest {
    pub fn new() -> Self {
        Digest::default()
    }

    /// Bump `max_version` and record it as `node`'s latest. Returns the
    /// version assigned.
    pub fn increment_node(&mut self, node: NodePublicKey) -> Version {
        self.max_version += 1;
        self.nodes.insert(node, self.max_version);
        self.max_version
    }

    /// Raise `node`'s entry to at least `version`. Returns the entry's
    /// resulting value.
    pub fn update_node(&mut self, node: NodePublicKey, version: Version) -> Version {
        let entry = self.nodes.entry(node).or_insert(0);
        *entry = (*entry).max(version);
        let new_version = *entry;

        self.max_version = self.max_version.max(new_version);
        new_version
    }

    /// Nodes present in `self` but absent from `other`.
    pub fn subtract_nodes(&self, other: &Digest) -> Vec<NodePublicKey> {
        self.nodes
            .keys()
            .filter(|node| !other.nodes.contains_key(node))
            .copied()
            .collect()
    }

    /// Nodes present in both digests.
    pub fn intersecting_nodes(&self, other: &Digest) -> Vec<NodePublicKey> {
        self.nodes
            .keys()
            .filter(|node| other.nodes.contains_key(node))
            .copied()
            .collect()
    }

    /// Wire encoding with `sender`'s own entry elided; the receiver
    /// restores it from the sender version field of the packet.
    pub fn encode_without_sender(&self, buf: &mut Vec<u8>, sender: &NodePublicKey) {
        let mut count = self.nodes.len();
        if self.nodes.contains_key(sender) {
            count -= 1;
        }
        buf.extend_from_slice(&(count as u32).to_be_bytes());

        for (node, version) in &self.nodes {
            if node == sender {
                continue;
            }
            buf.extend_from_slice(&node.0);
            buf.extend_from_slice(&version.to_be_bytes());
        }
    }

    /// Decode a digest, returning it along with the bytes consumed.
    pub fn decode(buf: &[u8]) -> Result<(Digest, usize), SyncError> {
        if buf.len() < 4 {
            return Err(SyncError::Truncated("digest"));
        }

        let count = u32::from_be_bytes(buf[0..4].try_into().unwrap()) as usize;
        let len = count
            .checked_mul(DIGEST_ENTRY_LEN)
            .and_then(|n| n.checked_add(4))
            .ok_or(SyncError::Truncated("digest"))?;
        if buf.len() < len {
            return Err(SyncError::Truncated("digest"));
        }

        let mut nodes = BTreeMap::new();
        let mut max_version = 0;
        for i in 0..count {
            let offset = 4 + i * DIGEST_ENTRY_LEN;
            let node = NodePublicKey(buf[offset..offset + 32].try_into().unwrap());
            let version =
                u32::from_be_bytes(buf[offset + 32..offset + 36].try_into().unwrap());
            max_version = max_version.max(version);
            nodes.insert(node, version);
        }

        Ok((Digest { nodes, max_version }, len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(byte: u8) -> NodePublicKey {
        NodePublicKey([byte; 32])
    }

    #[test]
    fn test_increment_assigns_contact_scoped_versions() {
        let mut digest = Digest::new();

        assert_eq!(digest.increment_node(node(1)), 1);
        assert_eq!(digest.increment_node(node(2)), 2);
        // The same author's next message continues the shared counter.
        assert_eq!(digest.increment_node(node(1)), 3);
        assert_eq!(digest.max_version, 3);
    }

    #[test]
    fn test_update_node_never_regresses() {
        let mut digest = Digest::new();
        assert_eq!(digest.update_node(node(1), 5), 5);
        assert_eq!(digest.update_node(node(1), 3), 5);
        assert_eq!(digest.update_node(node(1), 9), 9);
        assert_eq!(digest.max_version, 9);
    }

    #[test]
    fn test_subtract_and_intersect() {
        let mut left = Digest::new();
        left.update_node(node(1), 1);
        left.update_node(node(2), 2);

        let mut right = Digest::new();
        right.update_node(node(2), 1);
        right.update_node(node(3), 4);

        assert_eq!(left.subtract_nodes(&right), vec![node(1)]);
        assert_eq!(left.intersecting_nodes(&right), vec![node(2)]);
        assert_eq!(right.subtract_nodes(&left), vec![node(3)]);
    }

    #[test]
    fn test_wire_roundtrip_elides_the_sender() {
        let sender = node(7);
        let mut digest = Digest::new();
        digest.update_node(sender, 4);
        digest.update_node(node(1), 2);
        digest.update_node(node(2), 3);

        let mut buf = Vec::new();
        digest.encode_without_sender(&mut buf, &sender);
        assert_eq!(buf.len(), 4 + 2 * DIGEST_ENTRY_LEN);

        let (decoded, consumed) = Digest::decode(&buf).unwrap();
        assert_eq!(consumed, buf.len());
        assert!(!decoded.nodes.contains_key(&sender));
        assert_eq!(decoded.nodes[&node(1)], 2);
        assert_eq!(decoded.nodes[&node(2)], 3);
        assert_eq!(decoded.max_version, 3);

        // The receiver re-adds the sender from the packet header.
        let mut restored = decoded;
        restored.update_node(sender, 4);
        assert_eq!(restored, digest);
    }

    #[test]
    fn test_decode_rejects_truncated_digests() {
        assert!(matches!(
            Digest::decode(&[0, 0]),
            Err(SyncError::Truncated(_))
        ));

        // Claims one entry but carries none.
        let buf = 1u32.to_be_bytes().to_vec();
        assert!(matches!(Digest::decode(&buf), Err(SyncError::Truncated(_))));
    }
}
