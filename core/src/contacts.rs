// Contact management — shared secrets, derived contact ids, and the
// out-of-band linking handshake.
//
// A contact is a 32-byte secret shared by two (link) or more (group)
// peers. The secret never appears on the wire; its derived id is safe to
// expose to hosts and logs.

use std::collections::HashMap;
use std::fmt;

use aes::cipher::{generic_array::GenericArray, BlockEncrypt, KeyInit};
use aes::Aes256;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use hkdf::Hkdf;
use parking_lot::Mutex;
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};
use zeroize::Zeroize;

use crate::ProtocolError;

/// A 32-byte secret shared by all members of a contact.
#[derive(Clone, PartialEq, Eq)]
pub struct SharedSecret(pub [u8; 32]);

impl SharedSecret {
    /// Derive the public contact id for this secret:
    /// `base64( SHA-256( AES-256-ECB(key = secret, plaintext = 0^16) ) )`.
    ///
    /// The id is stable per secret and reveals nothing about it.
    pub fn contact_id(&self) -> ContactId {
        let cipher = Aes256::new(GenericArray::from_slice(&self.0));
        let mut block = GenericArray::from([0u8; 16]);
        cipher.encrypt_block(&mut block);

        let hash = Sha256::digest(block);
        ContactId(BASE64.encode(hash))
    }
}

impl fmt::Debug for SharedSecret {
    // Never leak secret material through Debug output.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SharedSecret(..)")
    }
}

impl TryFrom<&[u8]> for SharedSecret {
    type Error = ProtocolError;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        let secret: [u8; 32] = bytes
            .try_into()
            .map_err(|_| ProtocolError::SecretLength(bytes.len()))?;
        Ok(SharedSecret(secret))
    }
}

/// Identifies a contact. Derived deterministically from its shared secret.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContactId(pub String);

impl fmt::Display for ContactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The host's contact store.
///
/// Contacts are partitioned into bilateral links and multilateral groups,
/// both keyed by their derived [`ContactId`]. Implementations must be
/// thread-safe; the protocol calls them from its serialized executor, but
/// hosts may also read them from elsewhere.
pub trait ContactsContainer: Send + Sync {
    /// The shared secret for `contact`, or `ContactNotFound`.
    fn contact_secret(&self, contact: &ContactId) -> Result<SharedSecret, ProtocolError>;

    /// Remove `contact` from the store. Removing an unknown id is a no-op.
    fn delete_contact(&self, contact: &ContactId);

    /// Ids of all stored groups.
    fn all_groups(&self) -> Vec<ContactId>;

    /// Ids of all stored links.
    fn all_links(&self) -> Vec<ContactId>;

    /// Create a group with a fresh random secret.
    fn new_group(&self) -> Result<ContactId, ProtocolError>;

    /// Store a group secret obtained elsewhere. Joining a group twice is
    /// an error.
    fn join_group(&self, secret: SharedSecret) -> Result<ContactId, ProtocolError>;

    /// Store a link secret. Re-adding an existing link is idempotent.
    fn new_link(&self, secret: SharedSecret) -> Result<ContactId, ProtocolError>;
}

/// In-memory [`ContactsContainer`] for hosts without their own store and
/// for tests. Hosts that persist contacts implement the trait themselves.
#[derive(Default)]
pub struct MemoryContactsContainer {
    inner: Mutex<ContactMaps>,
}

#[derive(Default)]
struct ContactMaps {
    links: HashMap<ContactId, SharedSecret>,
    groups: HashMap<ContactId, SharedSecret>,
}

impl MemoryContactsContainer {
    pub fn new() -> Self {
        MemoryContactsContainer::default()
    }

    /// Total number of stored contacts.
    pub fn len(&self) -> usize {
        let inner = self.inner.lock();
        inner.links.len() + inner.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ContactsContainer for MemoryContactsContainer {
    fn contact_secret(&self, contact: &ContactId) -> Result<SharedSecret, ProtocolError> {
        let inner = self.inner.lock();
        inner
            .links
            .get(contact)
            .or_else(|| inner.groups.get(contact))
            .cloned()
            .ok_or(ProtocolError::ContactNotFound)
    }

    fn delete_contact(&self, contact: &ContactId) {
        let mut inner = self.inner.lock();
        inner.links.remove(contact);
        inner.groups.remove(contact);
    }

    fn all_groups(&self) -> Vec<ContactId> {
        self.inner.lock().groups.keys().cloned().collect()
    }

    fn all_links(&self) -> Vec<ContactId> {
        self.inner.lock().links.keys().cloned().collect()
    }

    fn new_group(&self) -> Result<ContactId, ProtocolError> {
        let mut secret = [0u8; 32];
        OsRng.fill_bytes(&mut secret);
        self.join_group(SharedSecret(secret))
    }

    fn join_group(&self, secret: SharedSecret) -> Result<ContactId, ProtocolError> {
        let contact = secret.contact_id();

        let mut inner = self.inner.lock();
        if inner.groups.contains_key(&contact) {
            return Err(ProtocolError::DuplicateGroup);
        }

        inner.groups.insert(contact.clone(), secret);
        Ok(contact)
    }

    fn new_link(&self, secret: SharedSecret) -> Result<ContactId, ProtocolError> {
        let contact = secret.contact_id();
        self.inner.lock().links.insert(contact.clone(), secret);
        Ok(contact)
    }
}

/// One side of the out-of-band pairing handshake.
///
/// Each side generates an X25519 key, exchanges the public share over a
/// trusted channel (QR code, NFC tap), and derives the same link secret.
pub struct LinkingSession {
    private: StaticSecret,
}

impl LinkingSession {
    /// Begin a linking session with a fresh X25519 key.
    pub fn start() -> Self {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        let private = StaticSecret::from(bytes);
        bytes.zeroize();

        LinkingSession { private }
    }

    /// The public share to present to the peer.
    pub fn share(&self) -> [u8; 32] {
        X25519PublicKey::from(&self.private).to_bytes()
    }

    /// Combine the peer's public share into the link secret:
    /// `HKDF-SHA256( X25519(ours, theirs) )`, no salt, no info.
    pub fn create_contact(&self, remote_share: &[u8]) -> Result<SharedSecret, ProtocolError> {
        let remote: [u8; 32] = remote_share
            .try_into()
            .map_err(|_| ProtocolError::SecretLength(remote_share.len()))?;

        let key_material = self.private.diffie_hellman(&X25519PublicKey::from(remote));

        let hk = Hkdf::<Sha256>::new(None, key_material.as_bytes());
        let mut secret = [0u8; 32];
        hk.expand(&[], &mut secret)
            .map_err(|_| ProtocolError::Crypto("linking key derivation failed"))?;

        Ok(SharedSecret(secret))
    }
}
