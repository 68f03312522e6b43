//! Filename encryption used by the encrypted-passthrough provider variant.
//!
//! Each logical name gets an opaque `key` attribute so that a peer on the far
//! end of a remote-mount relay never sees real on-disk names, only a token it
//! can hand back unchanged. Encryption is XChaCha20-Poly1305 with a random
//! 24-byte nonce; the key is derived once per provider instance via HKDF so the
//! configured secret never gets used as an AEAD key directly.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;

pub struct FilenameCipher {
    cipher: XChaCha20Poly1305,
}

impl FilenameCipher {
    /// Derive an AEAD key from an arbitrary-length secret and a fixed context
    /// label, so two providers configured with the same secret but a different
    /// purpose never share a key.
    pub fn from_secret(secret: &[u8]) -> Self {
        let hk = Hkdf::<Sha256>::new(None, secret);
        let mut key_bytes = [0u8; 32];
        hk.expand(b"repertory-core filename encryption", &mut key_bytes)
            .expect("32 bytes is a valid HKDF output length");
        let cipher = XChaCha20Poly1305::new(Key::from_slice(&key_bytes));
        Self { cipher }
    }

    /// Encrypt one path segment, returning a hex-encoded `nonce || ciphertext`.
    pub fn encrypt_name(&self, name: &str) -> String {
        let mut nonce_bytes = [0u8; 24];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = XNonce::from_slice(&nonce_bytes);
        let ciphertext = self
            .cipher
            .encrypt(nonce, name.as_bytes())
            .expect("encryption over an in-memory buffer cannot fail");
        let mut out = Vec::with_capacity(24 + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        encode_hex(&out)
    }

    /// Decrypt a token produced by [`Self::encrypt_name`]. Returns `None` on any
    /// malformed input or authentication failure -- callers treat that the same
    /// as "not an item this provider created".
    pub fn decrypt_name(&self, token: &str) -> Option<String> {
        let raw = decode_hex(token)?;
        if raw.len() < 24 {
            return None;
        }
        let (nonce_bytes, ciphertext) = raw.split_at(24);
        let nonce = XNonce::from_slice(nonce_bytes);
        let plaintext = self.cipher.decrypt(nonce, ciphertext).ok()?;
        String::from_utf8(plaintext).ok()
    }
}

fn encode_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

fn decode_hex(text: &str) -> Option<Vec<u8>> {
    if text.len() % 2 != 0 {
        return None;
    }
    (0..text.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&text[i..i + 2], 16).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_name() {
        let cipher = FilenameCipher::from_secret(b"test secret");
        let token = cipher.encrypt_name("report.pdf");
        assert_eq!(cipher.decrypt_name(&token).as_deref(), Some("report.pdf"));
    }

    #[test]
    fn tokens_for_the_same_name_differ_by_nonce() {
        let cipher = FilenameCipher::from_secret(b"test secret");
        assert_ne!(cipher.encrypt_name("a"), cipher.encrypt_name("a"));
    }

    #[test]
    fn rejects_garbage_tokens() {
        let cipher = FilenameCipher::from_secret(b"test secret");
        assert!(cipher.decrypt_name("not hex at all").is_none());
        assert!(cipher.decrypt_name("ab").is_none());
    }

    #[test]
    fn different_secrets_cannot_decrypt_each_other() {
        let a = FilenameCipher::from_secret(b"secret a");
        let b = FilenameCipher::from_secret(b"secret b");
        let token = a.encrypt_name("x");
        assert!(b.decrypt_name(&token).is_none());
    }
}
