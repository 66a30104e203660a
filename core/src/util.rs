// Small helpers driven by the device PRNG.

use std::collections::HashMap;

use crate::device::Device;

/// One `u64` from the device's non-cryptographic PRNG.
pub fn rand_u64(dev: &dyn Device) -> u64 {
    let mut buf = [0u8; 8];
    dev.fill_random(&mut buf);
    u64::from_be_bytes(buf)
}

/// All keys of `map`, sorted then shuffled with the device PRNG.
///
/// Hash map iteration order is arbitrary but not uniform; sorting first
/// makes the shuffle the only source of ordering, so replaying a device
/// RNG replays the traversal.
pub fn shuffled_keys<K, V>(dev: &dyn Device, map: &HashMap<K, V>) -> Vec<K>
where
    K: Ord + Clone,
{
    let mut keys: Vec<K> = map.keys().cloned().collect();
    keys.sort();

    // Fisher-Yates
    for i in (1..keys.len()).rev() {
        let j = (rand_u64(dev) % (i as u64 + 1)) as usize;
        keys.swap(i, j);
    }

    keys
}
