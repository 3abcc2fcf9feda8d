use crate::error::{LeakError, Result};
use num_bigint::BigUint;
use rand::{Rng, RngCore};
use sha1::{Digest, Sha1};

/// Length of a public key and of the shared secret
pub const KEY_LEN: usize = 96;
pub const SECRET_LEN: usize = KEY_LEN;

/// Largest padding a remote peer may append to its public key
pub const MAX_PADDING: usize = 512;

const PRIVATE_KEY_LEN: usize = 20;
const GENERATOR: u32 = 2;

/// 768-bit MODP group prime
const PRIME: [u8; KEY_LEN] = [
    0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xC9, 0x0F, 0xDA, 0xA2,
    0x21, 0x68, 0xC2, 0x34, 0xC4, 0xC6, 0x62, 0x8B, 0x80, 0xDC, 0x1C, 0xD1,
    0x29, 0x02, 0x4E, 0x08, 0x8A, 0x67, 0xCC, 0x74, 0x02, 0x0B, 0xBE, 0xA6,
    0x3B, 0x13, 0x9B, 0x22, 0x51, 0x4A, 0x08, 0x79, 0x8E, 0x34, 0x04, 0xDD,
    0xEF, 0x95, 0x19, 0xB3, 0xCD, 0x3A, 0x43, 0x1B, 0x30, 0x2B, 0x0A, 0x6D,
    0xF2, 0x5F, 0x14, 0x37, 0x4F, 0xE1, 0x35, 0x6D, 0x6D, 0x51, 0xC2, 0x45,
    0xE4, 0x85, 0xB5, 0x76, 0x62, 0x5E, 0x7E, 0xC6, 0xF4, 0x4C, 0x42, 0xE9,
    0xA6, 0x3A, 0x36, 0x21, 0x00, 0x00, 0x00, 0x00, 0x00, 0x09, 0x05, 0x63,
];

/// Key material for a single handshake attempt
pub struct HandshakeCredentials {
    pub private_key: [u8; PRIVATE_KEY_LEN],
    pub public_key: [u8; KEY_LEN],
    pub padding: Vec<u8>,
}

impl HandshakeCredentials {
    /// Generate a fresh key pair and up to `max_padding` random padding bytes
    pub fn generate(max_padding: usize) -> Self {
        let mut rng = rand::thread_rng();

        let private_key: [u8; PRIVATE_KEY_LEN] = rng.gen();
        let exponent = BigUint::from_bytes_be(&private_key);
        let public = BigUint::from(GENERATOR).modpow(&exponent, &prime());

        let mut padding = vec![0u8; rng.gen_range(0..=max_padding.min(MAX_PADDING))];
        rng.fill_bytes(&mut padding);

        Self {
            private_key,
            public_key: to_fixed(&public),
            padding,
        }
    }

    /// Derive the secret shared with the owner of `remote_key`
    pub fn shared_secret(&self, remote_key: &[u8]) -> Result<[u8; SECRET_LEN]> {
        let prime = prime();
        let remote = BigUint::from_bytes_be(remote_key);

        // Keys of 0, 1 or p-1 force a predictable secret
        let one = BigUint::from(1u32);
        if remote <= one || remote >= &prime - &one {
            return Err(LeakError::HandshakeFailure("Invalid public key".to_string()));
        }

        let exponent = BigUint::from_bytes_be(&self.private_key);
        Ok(to_fixed(&remote.modpow(&exponent, &prime)))
    }
}

fn prime() -> BigUint {
    BigUint::from_bytes_be(&PRIME)
}

fn to_fixed(value: &BigUint) -> [u8; KEY_LEN] {
    let bytes = value.to_bytes_be();
    let mut fixed = [0u8; KEY_LEN];
    fixed[KEY_LEN - bytes.len()..].copy_from_slice(&bytes);
    fixed
}

/// SHA-1 over the concatenation of `parts`
pub fn hash(parts: &[&[u8]]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    for part in parts {
        hasher.update(part);
    }

    let mut result = [0u8; 20];
    result.copy_from_slice(&hasher.finalize());
    result
}

pub fn xor(left: &[u8; 20], right: &[u8; 20]) -> [u8; 20] {
    let mut result = [0u8; 20];
    for (index, byte) in result.iter_mut().enumerate() {
        *byte = left[index] ^ right[index];
    }
    result
}
