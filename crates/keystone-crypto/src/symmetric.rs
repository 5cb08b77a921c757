//! AES-256-CBC symmetric encryption.
//!
//! The backup artifact format and the license cache ciphertext format are both
//! fixed contracts: AES-256 in CBC mode with PKCS#7 padding and a random
//! 16-byte IV prepended to the ciphertext. Neither format carries a header or
//! magic bytes, and neither carries an authentication tag — callers MUST
//! verify a separate checksum (see [`crate::integrity`]) before trusting
//! decrypted bytes.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::error::{CryptoError, CryptoResult};

/// AES block size / IV length in bytes.
pub const IV_LEN: usize = 16;

/// Required symmetric key length in bytes (AES-256).
pub const KEY_LEN: usize = 32;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Generate a random 32-byte key suitable for [`encrypt`].
pub fn generate_key() -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    rand::thread_rng().fill_bytes(&mut key);
    key
}

/// Derive a 32-byte key from a caller-supplied passphrase via SHA-256.
///
/// This is the fixed key-derivation scheme for license payloads; it is not a
/// password hash and carries no salt or iteration count, matching the format
/// the license cache was built against.
pub fn derive_key_from_passphrase(passphrase: &str) -> [u8; KEY_LEN] {
    let mut hasher = Sha256::new();
    hasher.update(passphrase.as_bytes());
    hasher.finalize().into()
}

/// Encrypt `plaintext` under `key` (32 bytes), returning `IV(16) || ciphertext`.
pub fn encrypt(plaintext: &[u8], key: &[u8]) -> CryptoResult<Vec<u8>> {
    if key.len() != KEY_LEN {
        return Err(CryptoError::InvalidKey(format!(
            "expected {}-byte key, got {}",
            KEY_LEN,
            key.len()
        )));
    }

    let mut iv = [0u8; IV_LEN];
    rand::thread_rng().fill_bytes(&mut iv);

    let encryptor = Aes256CbcEnc::new(key.into(), &iv.into());
    let ciphertext = encryptor.encrypt_padded_vec_mut::<Pkcs7>(plaintext);

    let mut out = Vec::with_capacity(IV_LEN + ciphertext.len());
    out.extend_from_slice(&iv);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt an `IV(16) || ciphertext` blob produced by [`encrypt`].
pub fn decrypt(blob: &[u8], key: &[u8]) -> CryptoResult<Vec<u8>> {
    if key.len() != KEY_LEN {
        return Err(CryptoError::InvalidKey(format!(
            "expected {}-byte key, got {}",
            KEY_LEN,
            key.len()
        )));
    }
    if blob.len() < IV_LEN {
        return Err(CryptoError::MalformedCiphertext(
            "ciphertext shorter than IV".to_string(),
        ));
    }

    let (iv, ciphertext) = blob.split_at(IV_LEN);
    let decryptor = Aes256CbcDec::new(key.into(), iv.into());
    decryptor
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))
}

/// Encrypt `plaintext` and render it in the license cache's
/// `"<iv_hex>:<ciphertext_hex>"` ASCII format.
pub fn encrypt_to_hex_pair(plaintext: &[u8], key: &[u8]) -> CryptoResult<String> {
    let blob = encrypt(plaintext, key)?;
    let (iv, ciphertext) = blob.split_at(IV_LEN);
    Ok(format!("{}:{}", hex::encode(iv), hex::encode(ciphertext)))
}

/// Inverse of [`encrypt_to_hex_pair`].
pub fn decrypt_hex_pair(formatted: &str, key: &[u8]) -> CryptoResult<Vec<u8>> {
    let (iv_hex, ct_hex) = formatted
        .split_once(':')
        .ok_or_else(|| CryptoError::InvalidFormat(formatted.to_string()))?;

    let iv = hex::decode(iv_hex)?;
    let ciphertext = hex::decode(ct_hex)?;
    if iv.len() != IV_LEN {
        return Err(CryptoError::InvalidFormat(format!(
            "IV must be {} bytes, got {}",
            IV_LEN,
            iv.len()
        )));
    }

    let mut blob = Vec::with_capacity(iv.len() + ciphertext.len());
    blob.extend_from_slice(&iv);
    blob.extend_from_slice(&ciphertext);
    decrypt(&blob, key)
}

/// Streaming SHA-256 checksum of a reader, returned as lowercase hex.
///
/// Reads in fixed-size chunks so callers can checksum arbitrarily large
/// artifacts without buffering them in memory.
pub fn checksum_reader<R: std::io::Read>(mut reader: R) -> CryptoResult<String> {
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// SHA-256 checksum of an in-memory byte slice, as lowercase hex.
pub fn checksum_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// MD5 checksum of bytes, as lowercase hex.
///
/// Used only for the license cache's `cache.checksum` field, which is a
/// fixed-format compatibility requirement, not a security boundary.
pub fn md5_hex(data: &[u8]) -> String {
    format!("{:x}", md5::compute(data))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_arbitrary_bytes() {
        let key = generate_key();
        for len in [0usize, 1, 15, 16, 17, 1000] {
            let plaintext: Vec<u8> = (0..len).map(|i| (i % 256) as u8).collect();
            let ciphertext = encrypt(&plaintext, &key).unwrap();
            let decrypted = decrypt(&ciphertext, &key).unwrap();
            assert_eq!(plaintext, decrypted);
        }
    }

    #[test]
    fn ciphertext_is_nondeterministic() {
        let key = generate_key();
        let plaintext = b"same plaintext every time";
        let a = encrypt(plaintext, &key).unwrap();
        let b = encrypt(plaintext, &key).unwrap();
        assert_ne!(a, b, "random IV should make ciphertexts differ");
    }

    #[test]
    fn rejects_short_key() {
        let short_key = vec![0u8; 16];
        assert!(encrypt(b"data", &short_key).is_err());
    }

    #[test]
    fn rejects_truncated_ciphertext() {
        let key = generate_key();
        assert!(decrypt(&[0u8; 8], &key).is_err());
    }

    #[test]
    fn rejects_bad_padding() {
        let key = generate_key();
        let mut blob = encrypt(b"some plaintext data", &key).unwrap();
        let last = blob.len() - 1;
        blob[last] ^= 0xFF;
        assert!(decrypt(&blob, &key).is_err());
    }

    #[test]
    fn hex_pair_roundtrip() {
        let key = derive_key_from_passphrase("correct horse battery staple");
        let formatted = encrypt_to_hex_pair(b"license payload json", &key).unwrap();
        assert!(formatted.contains(':'));
        let decrypted = decrypt_hex_pair(&formatted, &key).unwrap();
        assert_eq!(decrypted, b"license payload json");
    }

    #[test]
    fn hex_pair_rejects_malformed_input() {
        let key = generate_key();
        assert!(decrypt_hex_pair("not-a-valid-pair", &key).is_err());
        assert!(decrypt_hex_pair("deadbeef:not-hex", &key).is_err());
    }

    #[test]
    fn checksum_matches_for_same_bytes() {
        let data = b"checksum me";
        assert_eq!(checksum_bytes(data), checksum_bytes(data));
        let mut reader = std::io::Cursor::new(data.to_vec());
        assert_eq!(checksum_bytes(data), checksum_reader(&mut reader).unwrap());
    }

    #[test]
    fn derive_key_is_deterministic() {
        let a = derive_key_from_passphrase("hunter2");
        let b = derive_key_from_passphrase("hunter2");
        assert_eq!(a, b);
        let c = derive_key_from_passphrase("different");
        assert_ne!(a, c);
    }
}
