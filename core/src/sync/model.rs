// Model — the per-contact signed log.
//
// Every member of a contact is a node identified by an Ed25519 public
// key. Each node appends messages under contact-scoped versions; entries
// carry the author's signature, so any member can relay any other
// member's entries without being able to forge them.
//
// The model serializes to JSON for host persistence: binary fields are
// standard base64, and maps keyed by public keys use the base64 key
// string.

use std::collections::BTreeMap;
use std::fmt;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::delta::Delta;
use super::digest::{Digest, Version};
use super::SyncError;
use crate::contacts::SharedSecret;

/// A node's identity within a contact: its Ed25519 public key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodePublicKey(pub [u8; 32]);

impl NodePublicKey {
    pub fn verifying_key(&self) -> Result<VerifyingKey, SyncError> {
        VerifyingKey::from_bytes(&self.0).map_err(|_| SyncError::Signature)
    }
}

impl fmt::Display for NodePublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&BASE64.encode(self.0))
    }
}

impl Serialize for NodePublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(self.0))
    }
}

impl<'de> Deserialize<'de> for NodePublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        let bytes = BASE64.decode(&encoded).map_err(D::Error::custom)?;
        let key: [u8; 32] = bytes
            .try_into()
            .map_err(|_| D::Error::custom("public key must be 32 bytes"))?;
        Ok(NodePublicKey(key))
    }
}

mod b64 {
    use super::*;

    pub fn serialize<S: Serializer>(bytes: &Vec<u8>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64.decode(&encoded).map_err(D::Error::custom)
    }
}

mod b64_secret {
    use super::*;

    pub fn serialize<S: Serializer>(
        secret: &Option<[u8; 32]>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match secret {
            Some(secret) => serializer.serialize_some(&BASE64.encode(secret)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<[u8; 32]>, D::Error> {
        let encoded: Option<String> = Option::deserialize(deserializer)?;
        encoded
            .map(|encoded| {
                let bytes = BASE64.decode(&encoded).map_err(D::Error::custom)?;
                bytes
                    .try_into()
                    .map_err(|_| D::Error::custom("attached secret must be 32 bytes"))
            })
            .transpose()
    }
}

mod b64_signing_key {
    use super::*;

    pub fn serialize<S: Serializer>(key: &SigningKey, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(key.to_bytes()))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<SigningKey, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        let bytes = BASE64.decode(&encoded).map_err(D::Error::custom)?;
        let key: [u8; 32] = bytes
            .try_into()
            .map_err(|_| D::Error::custom("private key must be 32 bytes"))?;
        Ok(SigningKey::from_bytes(&key))
    }
}

/// One stored log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelMessage {
    #[serde(with = "b64")]
    pub value: Vec<u8>,
    #[serde(rename = "sig", with = "b64")]
    pub signature: Vec<u8>,
    #[serde(with = "b64_secret")]
    pub attached_secret: Option<[u8; 32]>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelType {
    Link,
    Group,
}

impl fmt::Display for ModelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelType::Link => f.write_str("link"),
            ModelType::Group => f.write_str("group"),
        }
    }
}

pub type NodeStates = BTreeMap<NodePublicKey, BTreeMap<Version, ModelMessage>>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Model {
    pub digests: BTreeMap<NodePublicKey, Digest>,
    #[serde(rename = "private_key", with = "b64_signing_key")]
    signing_key: SigningKey,
    pub public_key: NodePublicKey,
    pub node_states: NodeStates,
    #[serde(rename = "type")]
    pub model_type: ModelType,
}

impl Model {
    pub fn new(signing_key: SigningKey, model_type: ModelType) -> Self {
        let public_key = NodePublicKey(signing_key.verifying_key().to_bytes());
        Model {
            digests: BTreeMap::new(),
            signing_key,
            public_key,
            node_states: BTreeMap::new(),
            model_type,
        }
    }

    pub(super) fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.signing_key.sign(message).to_bytes().to_vec()
    }

    /// Our own digest, created on first use with our node at version 0.
    pub fn own_digest(&mut self) -> &mut Digest {
        let public_key = self.public_key;
        self.digests.entry(public_key).or_insert_with(|| {
            let mut digest = Digest::new();
            digest.update_node(public_key, 0);
            digest
        })
    }

    /// Append a locally authored message, assigning the next
    /// contact-scoped version and signing the entry.
    pub fn new_message(&mut self, value: Vec<u8>, attached_secret: Option<SharedSecret>) -> Version {
        let attached_secret = attached_secret.map(|secret| secret.0);
        let public_key = self.public_key;
        let version = self.own_digest().increment_node(public_key);

        let mut signed = Vec::new();
        signed.extend_from_slice(&self.public_key.0);
        signed.extend_from_slice(&version.to_be_bytes());
        signed.extend_from_slice(&(value.len() as u32).to_be_bytes());
        signed.extend_from_slice(&value);
        match &attached_secret {
            Some(secret) => {
                signed.push(0x01);
                signed.extend_from_slice(secret);
            }
            None => signed.push(0x00),
        }
        let signature = self.sign(&signed);

        self.node_states.entry(self.public_key).or_default().insert(
            version,
            ModelMessage {
                value,
                signature,
                attached_secret,
            },
        );

        version
    }

    /// Replace our record of `node`'s digest. Returns whether anything
    /// we knew about their view changed.
    pub fn update_digests(&mut self, node: NodePublicKey, digest: Digest) -> bool {
        let changed = match self.digests.get(&node) {
            Some(existing) => digest
                .nodes
                .iter()
                .any(|(other, version)| existing.nodes.get(other) != Some(version)),
            None => !digest.nodes.is_empty(),
        };

        self.digests.insert(node, digest);
        changed
    }

    /// Raise `base`'s record of `node` to at least `version`. Returns
    /// whether the record grew.
    pub fn update_digest(
        &mut self,
        base: NodePublicKey,
        node: NodePublicKey,
        version: Version,
    ) -> bool {
        let digest = self.digests.entry(base).or_default();
        let old = digest.nodes.get(&node).copied();
        let new = digest.update_node(node, version);
        match old {
            Some(old) => old < new,
            None => true,
        }
    }

    /// Every stored entry the holder of `peer_digest` is missing, sorted
    /// by version ascending.
    pub fn delta(&mut self, peer_digest: &Digest) -> Vec<Delta> {
        let own = self.own_digest().clone();
        let mut deltas = Vec::new();

        for node in peer_digest.intersecting_nodes(&own) {
            let Some(states) = self.node_states.get(&node) else {
                continue;
            };
            let peer_version = peer_digest.nodes[&node];
            for (&version, message) in states {
                if peer_version < version {
                    deltas.push(make_delta(node, version, message));
                }
            }
        }

        for node in own.subtract_nodes(peer_digest) {
            let Some(states) = self.node_states.get(&node) else {
                continue;
            };
            for (&version, message) in states {
                deltas.push(make_delta(node, version, message));
            }
        }

        deltas.sort_by_key(|delta| delta.version);
        deltas
    }

    /// Install `deltas` received from `sender`, updating our digest, the
    /// author's digest, and the sender's digest (the sender has seen
    /// whatever it relayed). Returns whether any entry changed.
    pub fn merge(&mut self, sender: NodePublicKey, deltas: &[Delta]) -> bool {
        let mut state_changed = false;

        for delta in deltas {
            let states = self.node_states.entry(delta.public_key).or_default();
            let changed = match states.get(&delta.version) {
                Some(existing) => existing.value != delta.value,
                None => true,
            };
            state_changed |= changed;

            states.insert(
                delta.version,
                ModelMessage {
                    value: delta.value.clone(),
                    signature: delta.signature.clone(),
                    attached_secret: delta.attached_secret,
                },
            );

            self.own_digest().update_node(delta.public_key, delta.version);
            self.update_digest(delta.public_key, delta.public_key, delta.version);
            self.update_digest(sender, delta.public_key, delta.version);
        }

        state_changed
    }

    pub fn to_json(&self) -> Result<Vec<u8>, SyncError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_json(data: &[u8]) -> Result<Model, SyncError> {
        Ok(serde_json::from_slice(data)?)
    }
}

fn make_delta(node: NodePublicKey, version: Version, message: &ModelMessage) -> Delta {
    Delta {
        public_key: node,
        version,
        value: message.value.clone(),
        attached_secret: message.attached_secret,
        signature: message.signature.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model(seed: u8) -> Model {
        Model::new(SigningKey::from_bytes(&[seed; 32]), ModelType::Group)
    }

    #[test]
    fn test_new_message_versions_and_signatures() {
        let mut model = model(1);

        assert_eq!(model.new_message(b"first".to_vec(), None), 1);
        assert_eq!(model.new_message(b"second".to_vec(), None), 2);

        let own = model.node_states[&model.public_key].clone();
        assert_eq!(own.len(), 2);
        assert_eq!(own[&1].value, b"first");

        // Entries round-trip through the verifying delta codec.
        let deltas = model.delta(&Digest::new());
        let mut buf = Vec::new();
        Delta::encode_list(&deltas, &mut buf);
        let (decoded, _) = Delta::decode_list(&buf).unwrap();
        assert_eq!(decoded.len(), 2);
    }

    #[test]
    fn test_delta_against_empty_digest_is_everything() {
        let mut model = model(1);
        model.new_message(b"a".to_vec(), None);
        model.new_message(b"b".to_vec(), None);

        let deltas = model.delta(&Digest::new());
        assert_eq!(deltas.len(), 2);
        assert_eq!(deltas[0].version, 1);
        assert_eq!(deltas[1].version, 2);
    }

    #[test]
    fn test_delta_skips_entries_the_peer_has() {
        let mut model = model(1);
        model.new_message(b"a".to_vec(), None);
        model.new_message(b"b".to_vec(), None);

        let mut peer = Digest::new();
        peer.update_node(model.public_key, 1);

        let deltas = model.delta(&peer);
        assert_eq!(deltas.len(), 1);
        assert_eq!(deltas[0].version, 2);
    }

    #[test]
    fn test_merge_installs_and_updates_digests() {
        let mut author = model(1);
        author.new_message(b"hi".to_vec(), None);
        let deltas = author.delta(&Digest::new());

        let mut receiver = model(2);
        let relay = NodePublicKey([9u8; 32]);
        assert!(receiver.merge(relay, &deltas));

        let author_key = author.public_key;
        assert_eq!(receiver.node_states[&author_key][&1].value, b"hi");
        // Our own view, the author's view and the relay's view all know
        // version 1 now.
        assert_eq!(receiver.own_digest().nodes[&author_key], 1);
        assert_eq!(receiver.digests[&author_key].nodes[&author_key], 1);
        assert_eq!(receiver.digests[&relay].nodes[&author_key], 1);

        // Merging the same deltas again changes nothing.
        assert!(!receiver.merge(relay, &deltas));
    }

    #[test]
    fn test_update_digests_detects_changes() {
        let mut model = model(1);
        let peer = NodePublicKey([5u8; 32]);

        let mut digest = Digest::new();
        digest.update_node(NodePublicKey([6u8; 32]), 3);

        assert!(model.update_digests(peer, digest.clone()));
        assert!(!model.update_digests(peer, digest.clone()));

        digest.update_node(NodePublicKey([6u8; 32]), 4);
        assert!(model.update_digests(peer, digest));
    }

    #[test]
    fn test_json_roundtrip_preserves_the_model() {
        let mut model = model(3);
        model.new_message(b"hello".to_vec(), Some(SharedSecret([8u8; 32])));
        model.new_message(b"world".to_vec(), None);
        model.update_digest(NodePublicKey([4u8; 32]), model.public_key, 1);

        let json = model.to_json().unwrap();
        let restored = Model::from_json(&json).unwrap();

        assert_eq!(restored.public_key, model.public_key);
        assert_eq!(restored.model_type, model.model_type);
        assert_eq!(restored.node_states, model.node_states);
        assert_eq!(restored.digests, model.digests);

        // The restored key still signs as the same node.
        let mut restored = restored;
        assert_eq!(restored.new_message(b"again".to_vec(), None), 3);
    }

    #[test]
    fn test_json_schema_fields() {
        let mut model = model(3);
        model.new_message(b"hello".to_vec(), None);

        let json: serde_json::Value =
            serde_json::from_slice(&model.to_json().unwrap()).unwrap();
        assert!(json.get("digests").is_some());
        assert!(json.get("private_key").is_some());
        assert!(json.get("public_key").is_some());
        assert!(json.get("node_states").is_some());
        assert_eq!(json["type"], "group");

        // Node maps are keyed by the base64 public key.
        let key = model.public_key.to_string();
        assert!(json["node_states"].get(&key).is_some());
        assert_eq!(json["node_states"][&key]["1"]["value"], BASE64.encode(b"hello"));
        assert_eq!(json["node_states"][&key]["1"]["attached_secret"], serde_json::Value::Null);
    }
}
