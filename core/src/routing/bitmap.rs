// Contact bitmap — the oblivious recipient hint carried in every route
// request.
//
// For each contact, the shared secret and the request seed yield twelve
// bit positions that are painted with an alternating 0/1 pattern. Anyone
// holding the secret regenerates the positions and recognises the
// pattern; everyone else sees uniform noise, because the background bits
// are drawn at random.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::contacts::{ContactId, ContactsContainer, SharedSecret};
use crate::device::Device;
use crate::ProtocolError;

/// Bitmap length in bytes (2048 bits).
pub const BITMAP_SIZE: usize = 2048 / 8;

/// Bits painted per contact.
pub const BITS_PER_CONTACT: usize = 12;

pub type ContactBitmap = [u8; BITMAP_SIZE];

type HmacSha256 = Hmac<Sha256>;

fn get_bit(bits: &[u8], index: usize) -> bool {
    bits[index / 8] & (1 << (index % 8)) != 0
}

fn set_bit(bits: &mut [u8], index: usize, value: bool) {
    if value {
        bits[index / 8] |= 1 << (index % 8);
    } else {
        bits[index / 8] &= !(1 << (index % 8));
    }
}

/// The twelve bit positions for `secret` under `seed`:
/// `HMAC-SHA256(secret, seed)` read as little-endian u16 words modulo
/// 2048, collisions bumped upward modulo 2047.
pub fn contact_bits(seed: u64, secret: &SharedSecret) -> [usize; BITS_PER_CONTACT] {
    let mut mac = HmacSha256::new_from_slice(&secret.0).expect("HMAC accepts any key length");
    mac.update(&seed.to_be_bytes());
    let hash = mac.finalize().into_bytes();

    let mut bits = [0usize; BITS_PER_CONTACT];
    for i in 0..BITS_PER_CONTACT {
        let mut index = (u16::from_le_bytes([hash[i * 2], hash[i * 2 + 1]]) & 0x7FF) as usize;
        while bits[..i].contains(&index) {
            index = (index + 1) % 0x7FF;
        }
        bits[i] = index;
    }

    bits
}

pub struct BitmapEncoding {
    pub seed: u64,
    pub bitmap: ContactBitmap,
    pub contact_count: usize,
}

/// Encode as many of `prioritized` as possible into a fresh bitmap.
///
/// Each attempt draws a random seed and a random background; contacts are
/// added in priority order and skipped when one of their bits is already
/// locked with the opposite polarity. The attempt encoding the most
/// contacts wins. The random background hides how many contacts (and
/// which) were actually encoded.
pub fn encode_contact_bitmap(
    dev: &dyn Device,
    prioritized: &[ContactId],
    contacts: &dyn ContactsContainer,
    attempts: usize,
) -> Result<BitmapEncoding, ProtocolError> {
    let mut best: Option<BitmapEncoding> = None;

    for _ in 0..attempts {
        let mut seed_bytes = [0u8; 8];
        dev.fill_crypto_random(&mut seed_bytes);
        let seed = u64::from_be_bytes(seed_bytes);

        let mut bitmap = [0u8; BITMAP_SIZE];
        dev.fill_crypto_random(&mut bitmap);
        let mut locked = [0u8; BITMAP_SIZE];

        let mut contact_count = 0;
        'contacts: for contact in prioritized {
            let secret = contacts.contact_secret(contact)?;
            let bits = contact_bits(seed, &secret);

            for (i, &bit) in bits.iter().enumerate() {
                if get_bit(&locked, bit) && get_bit(&bitmap, bit) != (i % 2 == 1) {
                    continue 'contacts;
                }
            }

            for (i, &bit) in bits.iter().enumerate() {
                set_bit(&mut locked, bit, true);
                set_bit(&mut bitmap, bit, i % 2 == 1);
            }
            contact_count += 1;
        }

        let better = best
            .as_ref()
            .map_or(true, |b| contact_count > b.contact_count);
        if better {
            best = Some(BitmapEncoding {
                seed,
                bitmap,
                contact_count,
            });
        }

        if contact_count == prioritized.len() {
            break;
        }
    }

    best.ok_or(ProtocolError::EmptyRouteRequest)
}

/// Every local contact whose twelve-bit pattern matches `bitmap`,
/// sorted by contact id for deterministic handling order.
pub fn decode_contact_bitmap(
    contacts: &dyn ContactsContainer,
    seed: u64,
    bitmap: &ContactBitmap,
) -> Result<Vec<ContactId>, ProtocolError> {
    let mut decoded = Vec::new();

    let mut all = contacts.all_groups();
    all.extend(contacts.all_links());

    'contacts: for contact in all {
        let secret = contacts.contact_secret(&contact)?;
        for (i, &bit) in contact_bits(seed, &secret).iter().enumerate() {
            if get_bit(bitmap, bit) != (i % 2 == 1) {
                continue 'contacts;
            }
        }
        decoded.push(contact);
    }

    decoded.sort();
    Ok(decoded)
}
