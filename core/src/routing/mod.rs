// Routing layer — route discovery, session key agreement, source-routed
// forwarding, and route error propagation.
//
// Route requests flood outward carrying an oblivious recipient hint;
// matching recipients answer with an encrypted route reply that doubles
// as the key agreement. Intermediate nodes keep only opaque forwarding
// state and can never decrypt.

pub mod bitmap;
pub mod packet;
mod table;

pub use table::RequestId;
pub(crate) use table::{RequestEntry, RoutingTables, SessionEntry};

use std::sync::Arc;

use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use hkdf::Hkdf;
use sha2::Sha256;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};
use zeroize::Zeroize;

use crate::contacts::{ContactId, ContactsContainer};
use crate::device::{DeviceAddress, SessionId};
use crate::stack::ProtocolCore;
use crate::util::{rand_u64, shuffled_keys};
use crate::ProtocolError;

use bitmap::{decode_contact_bitmap, encode_contact_bitmap};
use packet::{RouteError, RouteReply, RouteRequest, RoutingPacket, SessionData};

/// Seed attempts when encoding the recipient bitmap of a route request.
const BITMAP_ATTEMPTS: usize = 5;

/// A decrypted payload that arrived on an endpoint session.
pub(crate) struct SessionMessage {
    pub session: SessionId,
    pub data: Vec<u8>,
}

/// Derive the session key both endpoints agree on:
/// `HKDF-SHA256( contact_secret || X25519(ours, theirs) )`, no salt, no
/// info, 32 bytes out.
pub(crate) fn session_secret(
    contacts: &dyn ContactsContainer,
    contact: &ContactId,
    ephemeral: &StaticSecret,
    remote_ephemeral: &[u8; 32],
) -> Result<[u8; 32], ProtocolError> {
    let contact_secret = contacts.contact_secret(contact)?;
    let shared = ephemeral.diffie_hellman(&X25519PublicKey::from(*remote_ephemeral));

    let mut ikm = Vec::with_capacity(64);
    ikm.extend_from_slice(&contact_secret.0);
    ikm.extend_from_slice(shared.as_bytes());

    let hk = Hkdf::<Sha256>::new(None, &ikm);
    let mut secret = [0u8; 32];
    hk.expand(&[], &mut secret)
        .map_err(|_| ProtocolError::Crypto("session key derivation failed"))?;

    ikm.zeroize();
    Ok(secret)
}

pub(crate) fn seal(
    secret: &[u8; 32],
    nonce: &[u8; 12],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, ProtocolError> {
    let cipher =
        Aes256Gcm::new_from_slice(secret).map_err(|_| ProtocolError::Crypto("invalid key"))?;
    cipher
        .encrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| ProtocolError::Crypto("encryption failed"))
}

/// AEAD open; failure is expected while trying contacts against a route
/// reply, so no logging happens here.
pub(crate) fn open(
    secret: &[u8; 32],
    nonce: &[u8; 12],
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, ProtocolError> {
    let cipher =
        Aes256Gcm::new_from_slice(secret).map_err(|_| ProtocolError::Crypto("invalid key"))?;
    cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| ProtocolError::Crypto("authentication failed"))
}

impl ProtocolCore {
    fn net_log(&self, message: &str) {
        self.dev.log(&format!("network:{message}"));
    }

    /// Decode one routing message and dispatch it. Returns the decrypted
    /// payload when it was session data addressed to us.
    pub(crate) fn handle_routing_message(
        &mut self,
        sender: &DeviceAddress,
        data: &[u8],
    ) -> Option<SessionMessage> {
        let packet = match RoutingPacket::decode(data) {
            Ok(packet) => packet,
            Err(err) => {
                self.net_log(&format!("packet:receive:error '{err}'"));
                return None;
            }
        };

        match packet {
            RoutingPacket::RouteRequest(rreq) => {
                self.handle_route_request(rreq, sender);
                None
            }
            RoutingPacket::RouteReply(rrep) => {
                self.handle_route_reply(rrep, sender);
                None
            }
            RoutingPacket::SessionData(sess) => self.handle_session_data(sess, sender),
            RoutingPacket::RouteError(rerr) => {
                self.handle_route_error(rerr, sender);
                None
            }
        }
    }

    /// Broadcast a fresh route request to every neighbour.
    pub(crate) fn broadcast_route_request(&mut self) {
        let ttl = self.options.max_rreq_ttl;
        let rreq = match self.build_route_request(ttl) {
            Ok(rreq) => rreq,
            Err(err) => {
                self.net_log(&format!("packet:rreq:broadcast:error '{err}'"));
                return;
            }
        };

        self.net_log("packet:rreq:broadcast 'broadcasting rreq packet'");
        let data = rreq.encode();
        let dev = Arc::clone(&self.dev);
        self.link.broadcast(dev.as_ref(), &data);
    }

    /// Send a fresh route request to a single neighbour (used on
    /// connection, with a TTL of 1).
    pub(crate) fn send_route_request(&mut self, address: &DeviceAddress, ttl: u16) {
        let rreq = match self.build_route_request(ttl) {
            Ok(rreq) => rreq,
            Err(err) => {
                self.net_log(&format!("packet:rreq:send:error '{err}'"));
                return;
            }
        };

        self.net_log(&format!("packet:rreq:send:{address}"));
        let data = rreq.encode();
        let dev = Arc::clone(&self.dev);
        self.link.send(dev.as_ref(), address, &data);
    }

    /// Build a route request for the contacts that currently lack a
    /// session, registering us as its originator.
    fn build_route_request(&mut self, ttl: u16) -> Result<RouteRequest, ProtocolError> {
        let contacts = self.dev.contacts();
        let mut all = contacts.all_groups();
        all.extend(contacts.all_links());
        let total = all.len();

        // Contacts that already have a session don't need another one.
        let prioritized: Vec<ContactId> = all
            .into_iter()
            .filter(|contact| !self.routing.has_session_for_contact(contact))
            .collect();

        let encoding = encode_contact_bitmap(
            self.dev.as_ref(),
            &prioritized,
            self.dev.contacts(),
            BITMAP_ATTEMPTS,
        )?;
        if encoding.contact_count == 0 {
            self.net_log(&format!(
                "packet:rreq:build:no_contacts:{total}:{}",
                self.routing.sessions.len()
            ));
            return Err(ProtocolError::EmptyRouteRequest);
        }

        let request_id = RequestId(encoding.seed);

        let mut key_bytes = [0u8; 32];
        self.dev.fill_crypto_random(&mut key_bytes);
        let ephemeral = StaticSecret::from(key_bytes);
        key_bytes.zeroize();
        let ephemeral_key = X25519PublicKey::from(&ephemeral).to_bytes();

        self.routing.requests.insert(
            request_id,
            RequestEntry {
                source_neighbour: None,
                ephemeral: Some(ephemeral),
            },
        );

        self.net_log(&format!(
            "packet:rreq:build:{}:{total}:{ttl}:{request_id}",
            encoding.contact_count
        ));

        Ok(RouteRequest {
            request_id,
            ttl,
            ephemeral_key,
            bitmap: encoding.bitmap,
        })
    }

    fn handle_route_request(&mut self, rreq: RouteRequest, sender: &DeviceAddress) {
        if self.routing.requests.contains_key(&rreq.request_id) {
            self.net_log(&format!("packet:rreq:duplicate:{sender}:{}", rreq.request_id));
            return;
        }

        self.net_log(&format!("packet:rreq:receive:{sender}:{}", rreq.request_id));
        self.routing.requests.insert(
            rreq.request_id,
            RequestEntry {
                source_neighbour: Some(sender.clone()),
                ephemeral: None,
            },
        );

        let matched =
            match decode_contact_bitmap(self.dev.contacts(), rreq.request_id.0, &rreq.bitmap) {
                Ok(matched) => matched,
                Err(err) => {
                    self.net_log(&format!("packet:rreq:error '{err}'"));
                    return;
                }
            };

        if matched.is_empty() {
            self.forward_route_request(rreq, sender);
            return;
        }

        // We are a recipient: answer every matched contact with its own
        // session and route reply.
        for contact in matched {
            let mut key_bytes = [0u8; 32];
            self.dev.fill_crypto_random(&mut key_bytes);
            let ephemeral = StaticSecret::from(key_bytes);
            key_bytes.zeroize();

            let secret = match session_secret(
                self.dev.contacts(),
                &contact,
                &ephemeral,
                &rreq.ephemeral_key,
            ) {
                Ok(secret) => secret,
                Err(err) => {
                    self.net_log(&format!("packet:rreq:build_reply:error '{err}'"));
                    return;
                }
            };

            let session_id = SessionId(rand_u64(self.dev.as_ref()));
            self.routing.sessions.insert(
                session_id,
                SessionEntry {
                    request_id: rreq.request_id,
                    contact: Some(contact.clone()),
                    source_neighbour: Some(sender.clone()),
                    target_neighbour: None,
                    session_secret: Some(secret),
                },
            );

            self.net_log(&format!("session:established:{contact}:{session_id}"));
            self.session_established(session_id, &contact, sender, None, false);

            let payload = self.reply_payload_wrapped(session_id, &contact);

            let ephemeral_key = X25519PublicKey::from(&ephemeral).to_bytes();
            let mut nonce = [0u8; 12];
            self.dev.fill_crypto_random(&mut nonce);
            let header = RouteReply::header_bytes(rreq.request_id, session_id, &ephemeral_key);

            let cipher = match seal(&secret, &nonce, &payload, &header) {
                Ok(cipher) => cipher,
                Err(err) => {
                    self.net_log(&format!("packet:rreq:build_reply:error '{err}'"));
                    continue;
                }
            };

            let rrep = RouteReply {
                request_id: rreq.request_id,
                session_id,
                ephemeral_key,
                nonce,
                cipher,
            };

            self.net_log(&format!(
                "packet:rreq:contact_match:{contact}:{} 'found known contact in rreq'",
                rreq.ttl
            ));
            self.forward_route_reply(session_id, &rrep.encode());

            if self.options.forward_rreqs_when_matching {
                self.forward_route_request(rreq.clone(), sender);
            }
        }
    }

    fn forward_route_request(&mut self, mut rreq: RouteRequest, sender: &DeviceAddress) {
        rreq.ttl = rreq.ttl.min(self.options.max_rreq_ttl).saturating_sub(1);
        if rreq.ttl == 0 {
            self.net_log("packet:rreq:ttl_expired");
            return;
        }

        self.net_log(&format!("packet:rreq:forward:{}:{}", rreq.request_id, rreq.ttl));
        let data = rreq.encode();
        let dev = Arc::clone(&self.dev);
        let strategy = self.options.broadcast_strategy;
        self.link.broadcast_except(dev.as_ref(), strategy, &data, sender);
    }

    /// Send a route reply one hop back toward the request's origin. On
    /// link failure, report the broken route in the other direction.
    fn forward_route_reply(&mut self, session_id: SessionId, encoded: &[u8]) {
        let Some(entry) = self.routing.sessions.get(&session_id) else {
            return;
        };
        let Some(source) = entry.source_neighbour.clone() else {
            return;
        };
        let target = entry.target_neighbour.clone();

        self.net_log(&format!("packet:rrep:forward:{source}"));
        let dev = Arc::clone(&self.dev);
        if !self.link.send(dev.as_ref(), &source, encoded) {
            if let Some(target) = target {
                self.send_route_error(&target, session_id);
            }
            self.session_broken_at(session_id, Some(&source));
        }
    }

    fn handle_route_reply(&mut self, rrep: RouteReply, sender: &DeviceAddress) {
        let Some(request) = self.routing.requests.get(&rrep.request_id) else {
            self.net_log(&format!(
                "packet:rrep:unknown_request:{} 'dropping reply'",
                rrep.request_id
            ));
            return;
        };

        self.net_log(&format!("packet:rrep:receive:{sender}"));

        if let Some(source) = request.source_neighbour.clone() {
            // We forwarded this request: become a relay on its path.
            self.routing.sessions.insert(
                rrep.session_id,
                SessionEntry {
                    request_id: rrep.request_id,
                    contact: None,
                    source_neighbour: Some(source),
                    target_neighbour: Some(sender.clone()),
                    session_secret: None,
                },
            );
            self.forward_route_reply(rrep.session_id, &rrep.encode());
            return;
        }

        // We originated the request: find the contact whose secret opens
        // the reply. Success authenticates the peer, identifies the
        // contact, and recovers the piggybacked payload in one step.
        let Some(ephemeral) = request.ephemeral.clone() else {
            self.net_log("packet:rrep:error 'origin entry without ephemeral key'");
            return;
        };

        let header =
            RouteReply::header_bytes(rrep.request_id, rrep.session_id, &rrep.ephemeral_key);

        let mut contacts = self.dev.contacts().all_links();
        contacts.extend(self.dev.contacts().all_groups());

        for contact in contacts {
            let secret = match session_secret(
                self.dev.contacts(),
                &contact,
                &ephemeral,
                &rrep.ephemeral_key,
            ) {
                Ok(secret) => secret,
                Err(err) => {
                    self.net_log(&format!("packet:rrep:compute_session_secret:error '{err}'"));
                    return;
                }
            };

            let Ok(payload) = open(&secret, &rrep.nonce, &rrep.cipher, &header) else {
                continue;
            };

            self.routing.sessions.insert(
                rrep.session_id,
                SessionEntry {
                    request_id: rrep.request_id,
                    contact: Some(contact.clone()),
                    source_neighbour: None,
                    target_neighbour: Some(sender.clone()),
                    session_secret: Some(secret),
                },
            );

            self.net_log(&format!(
                "packet:rrep:session_established:{contact}:{}",
                rrep.session_id
            ));
            self.session_established(rrep.session_id, &contact, sender, Some(payload), true);
            break;
        }
    }

    /// Encrypt `data` for `session_id` and send it toward the peer.
    pub(crate) fn send_session_data(
        &mut self,
        session_id: SessionId,
        data: &[u8],
    ) -> Result<(), ProtocolError> {
        let Some(entry) = self.routing.sessions.get(&session_id) else {
            self.net_log("send:sess:error 'session not found in session table'");
            return Err(ProtocolError::SessionNotFound);
        };

        if entry.contact.is_none() {
            self.net_log("send:sess:error 'intermediary session id'");
            return Err(ProtocolError::IntermediarySession);
        }
        let Some(secret) = entry.session_secret else {
            self.net_log("send:sess:error 'invalid session, no session secret'");
            return Err(ProtocolError::Crypto("missing session secret"));
        };
        let Some(neighbour) = entry
            .target_neighbour
            .clone()
            .or_else(|| entry.source_neighbour.clone())
        else {
            return Err(ProtocolError::SessionNotFound);
        };

        let mut nonce = [0u8; 12];
        self.dev.fill_crypto_random(&mut nonce);
        let aad = session_id.to_string().into_bytes();
        let cipher = seal(&secret, &nonce, data, &aad)?;

        let packet = SessionData {
            session_id,
            nonce,
            cipher,
        };

        self.net_log(&format!("send:sess:{session_id}:{neighbour}"));
        let dev = Arc::clone(&self.dev);
        self.link.send(dev.as_ref(), &neighbour, &packet.encode());
        Ok(())
    }

    fn handle_session_data(
        &mut self,
        sess: SessionData,
        sender: &DeviceAddress,
    ) -> Option<SessionMessage> {
        let Some(entry) = self.routing.sessions.get(&sess.session_id) else {
            self.net_log("packet:sess:session:not_found");
            return None;
        };

        self.net_log(&format!("packet:sess:receive_packet:{sender}"));

        if entry.source_neighbour.is_none() || entry.target_neighbour.is_none() {
            // Endpoint: decrypt for the application stack.
            let Some(contact) = entry.contact.clone() else {
                self.net_log("packet:sess:decrypt:contact_not_found");
                return None;
            };
            let Some(secret) = entry.session_secret else {
                self.net_log("packet:sess:decrypt:missing_secret");
                return None;
            };

            let aad = sess.session_id.to_string().into_bytes();
            match open(&secret, &sess.nonce, &sess.cipher, &aad) {
                Ok(data) => {
                    self.net_log(&format!(
                        "packet:sess:receive:{contact} 'received {} bytes'",
                        data.len()
                    ));
                    Some(SessionMessage {
                        session: sess.session_id,
                        data,
                    })
                }
                Err(err) => {
                    self.net_log(&format!("packet:sess:error_decrypting:{sender} '{err}'"));
                    None
                }
            }
        } else {
            // Relay: pass the packet out the other side, untouched.
            let Some(to) = entry.opposite_neighbour(sender).cloned() else {
                self.net_log("packet:sess:session:wrong_sender");
                return None;
            };

            self.net_log(&format!("packet:sess:forward:{to}"));
            let encoded = sess.encode();
            let dev = Arc::clone(&self.dev);
            self.link.send(dev.as_ref(), &to, &encoded);
            None
        }
    }

    fn handle_route_error(&mut self, rerr: RouteError, sender: &DeviceAddress) {
        let Some(entry) = self.routing.sessions.get(&rerr.session_id) else {
            self.net_log(&format!(
                "packet:rerr:receive:session_not_found:{}",
                rerr.session_id
            ));
            return;
        };

        self.net_log(&format!("packet:rerr:receive:{sender}"));

        if entry.is_endpoint() {
            self.net_log(&format!("packet:rerr:session_broken:{sender}"));
            self.session_broken_at(rerr.session_id, Some(sender));
        } else {
            let opposite = entry.opposite_neighbour(sender).cloned();
            if let Some(to) = opposite {
                self.send_route_error(&to, rerr.session_id);
            }
            self.routing.sessions.remove(&rerr.session_id);
        }
    }

    pub(crate) fn send_route_error(&mut self, address: &DeviceAddress, session_id: SessionId) {
        let packet = RouteError { session_id };
        self.net_log(&format!("packet:rerr:send:{address}"));
        let data = packet.encode();
        let dev = Arc::clone(&self.dev);
        self.link.send(dev.as_ref(), address, &data);
    }

    /// Tear down a session. With `address` set, the failure was observed
    /// on that link; without it (timeout, contact deletion) a route
    /// error is sent toward the remaining neighbour first. Endpoint
    /// sessions additionally notify the upper layers.
    pub(crate) fn session_broken_at(
        &mut self,
        session_id: SessionId,
        address: Option<&DeviceAddress>,
    ) {
        if !self.routing.sessions.contains_key(&session_id) {
            return;
        }

        self.net_log(&format!("session:broken:{session_id}"));

        if address.is_none() {
            let neighbour = self.routing.sessions.get(&session_id).and_then(|entry| {
                entry
                    .source_neighbour
                    .clone()
                    .or_else(|| entry.target_neighbour.clone())
            });
            if let Some(neighbour) = neighbour {
                self.send_route_error(&neighbour, session_id);
            }
        }

        let Some(entry) = self.routing.sessions.remove(&session_id) else {
            return;
        };
        if entry.is_endpoint() {
            self.session_broken_upward(session_id);
        }
    }

    /// A neighbour disconnected: break endpoint sessions through it and
    /// notify the surviving side of relayed ones.
    pub(crate) fn routing_disconnect(&mut self, failed: &DeviceAddress) {
        let dev = Arc::clone(&self.dev);
        for session_id in shuffled_keys(dev.as_ref(), &self.routing.sessions) {
            let Some(entry) = self.routing.sessions.get(&session_id) else {
                continue;
            };
            let source = entry.source_neighbour.clone();
            let target = entry.target_neighbour.clone();

            match (source, target) {
                (Some(next_hop), None) | (None, Some(next_hop)) if next_hop == *failed => {
                    self.net_log(&format!("disconnect:session_broken:{failed}"));
                    self.session_broken_at(session_id, Some(failed));
                }
                (Some(source), Some(target)) => {
                    if source == *failed {
                        self.send_route_error(&target, session_id);
                        self.routing.sessions.remove(&session_id);
                    } else if target == *failed {
                        self.send_route_error(&source, session_id);
                        self.routing.sessions.remove(&session_id);
                    }
                }
                _ => {}
            }
        }
    }

    /// Break and forget every session established with `contact`, along
    /// with the route requests that produced them.
    pub(crate) fn delete_contact_sessions(&mut self, contact: &ContactId) {
        let dev = Arc::clone(&self.dev);
        let doomed: Vec<_> = shuffled_keys(dev.as_ref(), &self.routing.sessions)
            .into_iter()
            .filter_map(|session_id| {
                let entry = self.routing.sessions.get(&session_id)?;
                (entry.contact.as_ref() == Some(contact)).then_some((session_id, entry.request_id))
            })
            .collect();

        for (session_id, request_id) in doomed {
            self.session_broken_at(session_id, None);
            self.routing.requests.remove(&request_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contacts::{MemoryContactsContainer, SharedSecret};

    #[test]
    fn test_x25519_rfc7748_vector() {
        let alice_secret = StaticSecret::from(<[u8; 32]>::try_from(
            hex::decode("77076d0a7318a57d3c16c17251b26645df4c2f87ebc0992ab177fba51db92c2a")
                .unwrap()
                .as_slice(),
        )
        .unwrap());
        let bob_public = X25519PublicKey::from(<[u8; 32]>::try_from(
            hex::decode("de9edb7d7b7dc1b4d35b61c2ece435373f8343c85b78674dadfc7e146f882b4f")
                .unwrap()
                .as_slice(),
        )
        .unwrap());

        let shared = alice_secret.diffie_hellman(&bob_public);
        assert_eq!(
            hex::encode(shared.as_bytes()),
            "4a5d9d5ba4ce2de1728e3bf480350f25e07e21c947d19e3376f09b3c1e161742"
        );
    }

    #[test]
    fn test_hkdf_sha256_vector() {
        // HKDF-SHA256, no salt, empty info, against an independently
        // computed output for ikm = 0x0b * 22.
        let hk = Hkdf::<Sha256>::new(None, &[0x0b; 22]);
        let mut okm = [0u8; 32];
        hk.expand(&[], &mut okm).unwrap();
        assert_eq!(
            hex::encode(okm),
            "8da4e775a563c18f715f802a063c5a31b8a11f5c5ee1879ec3454e5f3c738d2d"
        );
    }

    #[test]
    fn test_session_secret_agrees_in_both_directions() {
        let contacts = MemoryContactsContainer::new();
        let contact = contacts.new_link(SharedSecret([1u8; 32])).unwrap();

        let ours = StaticSecret::from([11u8; 32]);
        let theirs = StaticSecret::from([22u8; 32]);
        let our_public = X25519PublicKey::from(&ours).to_bytes();
        let their_public = X25519PublicKey::from(&theirs).to_bytes();

        let forward = session_secret(&contacts, &contact, &ours, &their_public).unwrap();
        let backward = session_secret(&contacts, &contact, &theirs, &our_public).unwrap();
        assert_eq!(forward, backward);
    }

    #[test]
    fn test_session_secret_differs_per_contact() {
        let contacts = MemoryContactsContainer::new();
        let one = contacts.new_link(SharedSecret([1u8; 32])).unwrap();
        let two = contacts.new_link(SharedSecret([2u8; 32])).unwrap();

        let ours = StaticSecret::from([11u8; 32]);
        let their_public = X25519PublicKey::from(&StaticSecret::from([22u8; 32])).to_bytes();

        let first = session_secret(&contacts, &one, &ours, &their_public).unwrap();
        let second = session_secret(&contacts, &two, &ours, &their_public).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn test_seal_open_roundtrip_and_aad_binding() {
        let secret = [7u8; 32];
        let nonce = [3u8; 12];

        let cipher = seal(&secret, &nonce, b"session payload", b"aad").unwrap();
        assert_eq!(open(&secret, &nonce, &cipher, b"aad").unwrap(), b"session payload");

        // Wrong associated data fails authentication.
        assert!(open(&secret, &nonce, &cipher, b"other").is_err());

        // Any flipped ciphertext byte fails authentication.
        for i in 0..cipher.len() {
            let mut tampered = cipher.clone();
            tampered[i] ^= 0x01;
            assert!(open(&secret, &nonce, &tampered, b"aad").is_err());
        }

        // The wrong key cannot open it either.
        assert!(open(&[8u8; 32], &nonce, &cipher, b"aad").is_err());
    }
}
