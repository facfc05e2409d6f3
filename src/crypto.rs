use aes::cipher::{KeyIvInit, StreamCipher};
use aes::Aes256;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};

/// Key length of the derived symmetric key (AES-256).
pub const KEY_LEN: usize = 32;

/// Per-frame nonce length on the wire. Equals the AES block size, which is
/// what CTR mode requires for its initial counter block.
pub const NONCE_LEN: usize = 16;

/// AES-256 in counter mode with a big-endian 128-bit counter.
pub type Aes256Ctr = ctr::Ctr128BE<Aes256>;

/// Derive the 32-byte symmetric key from the shared secret.
///
/// Single-pass SHA-256 over the secret bytes, no salt. Both peers must be
/// configured with the same secret string.
pub fn derive_key(secret: &str) -> [u8; KEY_LEN] {
    Sha256::digest(secret.as_bytes()).into()
}

/// Sample a fresh random nonce from the operating system RNG.
///
/// Every frame carries its own independent nonce; reuse under the same key
/// would break confidentiality.
pub fn generate_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Build a stateful CTR keystream for streaming transforms.
///
/// The keystream position advances across successive `apply_keystream`
/// calls, so a single instance can decrypt a body chunk by chunk.
pub fn keystream(key: &[u8; KEY_LEN], nonce: &[u8; NONCE_LEN]) -> Aes256Ctr {
    Aes256Ctr::new(key[..].into(), nonce[..].into())
}

/// XOR `buf` in place with the CTR keystream for `(key, nonce)`.
///
/// CTR encryption and decryption are the same operation, which is what
/// lets both sides transform pooled buffers without copying.
pub fn xor_ctr_in_place(key: &[u8; KEY_LEN], nonce: &[u8; NONCE_LEN], buf: &mut [u8]) {
    keystream(key, nonce).apply_keystream(buf);
}
