//! Gateway Crypto — authenticated encryption for provider credentials at rest.
//!
//! Provides AES-256-GCM encryption keyed by a single process-wide secret:
//! - The secret is loaded once at process start (see [`Secret::from_str`])
//! - Every credential gets a fresh random nonce (no reuse)
//! - The store holds only encrypted blobs, never plaintext
//! - The key implements `Zeroize` for automatic memory cleanup

#![forbid(unsafe_code)]

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Error types for crypto operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Encryption failed
    EncryptionFailed,
    /// Decryption failed (wrong key, tampered data, or invalid nonce)
    DecryptionFailed,
    /// Invalid data format
    InvalidFormat(String),
    /// The configured secret could not be decoded into a 256-bit key
    InvalidSecret(String),
}

impl std::fmt::Display for CryptoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EncryptionFailed => write!(f, "encryption failed"),
            Self::DecryptionFailed => write!(f, "decryption failed"),
            Self::InvalidFormat(msg) => write!(f, "invalid format: {}", msg),
            Self::InvalidSecret(msg) => write!(f, "invalid secret: {}", msg),
        }
    }
}

impl std::error::Error for CryptoError {}

/// Result type for crypto operations.
pub type Result<T> = std::result::Result<T, CryptoError>;

/// An encrypted credential bundle, serialized for storage in the
/// `provider_configs.api_key` column.
///
/// Contains everything needed to decrypt except the process secret:
/// version, nonce, and ciphertext with the GCM auth tag appended.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedCredential {
    /// Format version (currently 1)
    pub version: u8,
    /// 12-byte nonce (GCM standard)
    pub nonce: [u8; 12],
    /// Ciphertext including GCM authentication tag (16 bytes appended)
    pub ciphertext: Vec<u8>,
}

impl EncryptedCredential {
    /// Serialize to the flat byte layout stored at rest: `[version][nonce][ciphertext]`.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + 12 + self.ciphertext.len());
        out.push(self.version);
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&self.ciphertext);
        out
    }

    /// Parse the flat byte layout produced by [`Self::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 1 + 12 {
            return Err(CryptoError::InvalidFormat(format!(
                "expected at least 13 bytes, got {}",
                bytes.len()
            )));
        }
        let version = bytes[0];
        let mut nonce = [0u8; 12];
        nonce.copy_from_slice(&bytes[1..13]);
        let ciphertext = bytes[13..].to_vec();
        Ok(Self {
            version,
            nonce,
            ciphertext,
        })
    }
}

/// The process-wide 256-bit secret used to key the [`CredentialCodec`].
///
/// Loaded once at startup from `ENCRYPTION_SECRET`, accepted as either a
/// 64-character hex string or a base64-encoded 32-byte value. Zeroized on
/// drop so the raw bytes never linger in memory longer than necessary.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct Secret([u8; 32]);

impl Secret {
    /// Wrap raw key bytes directly.
    #[must_use]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Parse a secret from its configured string form (hex or base64).
    ///
    /// Hex is tried first (64 lowercase/uppercase hex characters); if that
    /// fails, standard base64 is tried. Either must decode to exactly 32 bytes.
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        let decoded = hex_decode(trimmed)
            .or_else(|_| base64_decode(trimmed))
            .map_err(|_| {
                CryptoError::InvalidSecret(
                    "ENCRYPTION_SECRET must be 64 hex characters or base64-encoded 32 bytes"
                        .to_string(),
                )
            })?;
        if decoded.len() != 32 {
            return Err(CryptoError::InvalidSecret(format!(
                "decoded secret is {} bytes, expected 32",
                decoded.len()
            )));
        }
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&decoded);
        Ok(Self(bytes))
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Secret").field(&"[REDACTED]").finish()
    }
}

fn hex_decode(s: &str) -> std::result::Result<Vec<u8>, ()> {
    if s.len() % 2 != 0 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(());
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).map_err(|_| ()))
        .collect()
}

fn base64_decode(s: &str) -> std::result::Result<Vec<u8>, ()> {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD
        .decode(s)
        .map_err(|_| ())
}

/// Authenticated encryption over provider API keys, keyed by the process-wide
/// [`Secret`].
///
/// Unlike a per-session cipher negotiated between two parties, this codec
/// decrypts its own ciphertext — there is only one party, the gateway
/// process itself — so the key is loaded once and never exchanged.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct CredentialCodec {
    key: [u8; 32],
}

impl CredentialCodec {
    /// Build a codec from the process secret.
    #[must_use]
    pub fn new(secret: &Secret) -> Self {
        Self { key: secret.0 }
    }

    /// Encrypt plaintext with a fresh random nonce.
    ///
    /// Each call generates a unique nonce, so encrypting the same plaintext
    /// twice produces different ciphertext.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<EncryptedCredential> {
        let cipher =
            Aes256Gcm::new_from_slice(&self.key).map_err(|_| CryptoError::EncryptionFailed)?;

        let mut nonce_bytes = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| CryptoError::EncryptionFailed)?;

        Ok(EncryptedCredential {
            version: 1,
            nonce: nonce_bytes,
            ciphertext,
        })
    }

    /// Decrypt an encrypted credential bundle.
    pub fn decrypt(&self, data: &EncryptedCredential) -> Result<Vec<u8>> {
        if data.version != 1 {
            return Err(CryptoError::InvalidFormat(format!(
                "unsupported version: {}",
                data.version
            )));
        }

        let cipher =
            Aes256Gcm::new_from_slice(&self.key).map_err(|_| CryptoError::DecryptionFailed)?;
        let nonce = Nonce::from_slice(&data.nonce);

        cipher
            .decrypt(nonce, data.ciphertext.as_ref())
            .map_err(|_| CryptoError::DecryptionFailed)
    }

    /// Convenience: encrypt a UTF-8 string and return the flat byte layout
    /// ready for a `BLOB` column.
    pub fn encrypt_str(&self, plaintext: &str) -> Result<Vec<u8>> {
        Ok(self.encrypt(plaintext.as_bytes())?.to_bytes())
    }

    /// Convenience: decrypt the flat byte layout back into a UTF-8 string.
    pub fn decrypt_str(&self, bytes: &[u8]) -> Result<String> {
        let data = EncryptedCredential::from_bytes(bytes)?;
        let plaintext = self.decrypt(&data)?;
        String::from_utf8(plaintext)
            .map_err(|e| CryptoError::InvalidFormat(format!("decrypted bytes not UTF-8: {e}")))
    }
}

impl std::fmt::Debug for CredentialCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialCodec")
            .field("key", &"[REDACTED]")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> CredentialCodec {
        CredentialCodec::new(&Secret::from_bytes([42u8; 32]))
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let cipher = codec();

        let plaintext = b"sk-test-0123456789";
        let encrypted = cipher.encrypt(plaintext).unwrap();

        assert_eq!(encrypted.version, 1);
        assert_ne!(&encrypted.ciphertext[..], plaintext);

        let decrypted = cipher.decrypt(&encrypted).unwrap();
        assert_eq!(&decrypted, plaintext);
    }

    #[test]
    fn test_different_nonces() {
        let cipher = codec();
        let plaintext = b"same message";

        let enc1 = cipher.encrypt(plaintext).unwrap();
        let enc2 = cipher.encrypt(plaintext).unwrap();

        assert_ne!(enc1.nonce, enc2.nonce);
        assert_ne!(enc1.ciphertext, enc2.ciphertext);

        assert_eq!(cipher.decrypt(&enc1).unwrap(), plaintext);
        assert_eq!(cipher.decrypt(&enc2).unwrap(), plaintext);
    }

    #[test]
    fn test_wrong_key_fails() {
        let cipher1 = CredentialCodec::new(&Secret::from_bytes([1u8; 32]));
        let cipher2 = CredentialCodec::new(&Secret::from_bytes([2u8; 32]));

        let encrypted = cipher1.encrypt(b"secret").unwrap();

        let result = cipher2.decrypt(&encrypted);
        assert_eq!(result, Err(CryptoError::DecryptionFailed));
    }

    #[test]
    fn test_tampered_data_fails() {
        let cipher = codec();
        let mut encrypted = cipher.encrypt(b"original").unwrap();

        if let Some(byte) = encrypted.ciphertext.first_mut() {
            *byte ^= 0xFF;
        }

        let result = cipher.decrypt(&encrypted);
        assert_eq!(result, Err(CryptoError::DecryptionFailed));
    }

    #[test]
    fn test_empty_plaintext() {
        let cipher = codec();
        let encrypted = cipher.encrypt(b"").unwrap();
        let decrypted = cipher.decrypt(&encrypted).unwrap();
        assert!(decrypted.is_empty());
    }

    #[test]
    fn test_invalid_version() {
        let cipher = codec();
        let data = EncryptedCredential {
            version: 99,
            nonce: [0u8; 12],
            ciphertext: vec![1, 2, 3],
        };
        let result = cipher.decrypt(&data);
        assert!(matches!(result, Err(CryptoError::InvalidFormat(_))));
    }

    #[test]
    fn test_serialization_roundtrip() {
        let cipher = codec();
        let encrypted = cipher.encrypt(b"test").unwrap();

        let json = serde_json::to_string(&encrypted).unwrap();
        let parsed: EncryptedCredential = serde_json::from_str(&json).unwrap();

        let decrypted = cipher.decrypt(&parsed).unwrap();
        assert_eq!(&decrypted, b"test");
    }

    #[test]
    fn test_flat_byte_roundtrip() {
        let cipher = codec();
        let bytes = cipher.encrypt_str("sk-ant-abc123").unwrap();
        let plaintext = cipher.decrypt_str(&bytes).unwrap();
        assert_eq!(plaintext, "sk-ant-abc123");
    }

    #[test]
    fn test_debug_redacts_key() {
        let cipher = codec();
        let debug = format!("{:?}", cipher);
        assert!(debug.contains("REDACTED"));
        assert!(!debug.contains("42"));
    }

    #[test]
    fn test_secret_from_hex() {
        let hex = "2a".repeat(32);
        let secret = Secret::parse(&hex).unwrap();
        let codec = CredentialCodec::new(&secret);
        let encrypted = codec.encrypt(b"hello").unwrap();
        assert_eq!(codec.decrypt(&encrypted).unwrap(), b"hello");
    }

    #[test]
    fn test_secret_from_base64() {
        use base64::Engine;
        let b64 = base64::engine::general_purpose::STANDARD.encode([7u8; 32]);
        let secret = Secret::parse(&b64).unwrap();
        let codec = CredentialCodec::new(&secret);
        let encrypted = codec.encrypt(b"hello").unwrap();
        assert_eq!(codec.decrypt(&encrypted).unwrap(), b"hello");
    }

    #[test]
    fn test_secret_wrong_length_rejected() {
        let hex = "2a".repeat(16); // 16 bytes, not 32
        assert!(Secret::parse(&hex).is_err());
    }

    #[test]
    fn test_secret_garbage_rejected() {
        assert!(Secret::parse("not a valid secret at all!!").is_err());
    }
}
