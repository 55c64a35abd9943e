//! Seed payload and object name generation.

use bytes::Bytes;
use rand::{Rng, RngCore};

/// Length of generated object names.
pub const OBJECT_NAME_LEN: usize = 8;

const NAME_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Generates the payload written to every object of a run.
///
/// `object_size / 2` random bytes are hex-encoded, so the payload is `object_size` characters
/// long. An odd size is truncated by one byte; sizes are configured in round numbers in
/// practice, and keeping the truncation keeps reported byte counts stable.
pub fn seed_payload(rng: &mut impl RngCore, object_size: usize) -> Bytes {
    let mut random = vec![0; object_size / 2];
    rng.fill_bytes(&mut random);
    Bytes::from(hex::encode(random))
}

/// Generates a random object name of uppercase letters and digits.
///
/// Names are not checked for collisions. A collision only overwrites an object written earlier in
/// the same cycle; both registry entries are then read and deleted, which S3 permits.
pub fn object_name(rng: &mut impl Rng) -> String {
    (0..OBJECT_NAME_LEN)
        .map(|_| NAME_ALPHABET[rng.random_range(0..NAME_ALPHABET.len())] as char)
        .collect()
}
