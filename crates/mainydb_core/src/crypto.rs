//! Field-level encryption hooks.
//!
//! Collections accept an optional [`FieldCrypto`] transform with two hook
//! points: `on_write` runs before a document is stored or indexed,
//! `on_read` before it is handed back. Two field styles exist:
//!
//! - **Hash fields** (SHA-256, salted) are one-way: transformed on write
//!   only and compared as structured hash records via [`FieldCrypto::verify_field`].
//! - **Cipher fields** (AES-256-GCM) are reversible: encrypted on write
//!   and decrypted on read.
//!
//! Querying on transformed fields matches the stored record structure,
//! not the plaintext.

use crate::error::{EngineError, EngineResult};
use mainydb_codec::{Document, Value};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};

/// Environment variable consulted when no key is supplied explicitly.
pub const KEY_ENV_VAR: &str = "MAINYDB_ENCRYPTION_KEY";

const NONCE_SIZE: usize = 12;
const SALT_SIZE: usize = 32;
const KDF_ROUNDS: u32 = 100_000;

/// A 256-bit encryption key, zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey([u8; 32]);

impl EncryptionKey {
    /// Generates a fresh random key.
    #[must_use]
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Wraps raw key bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Derives a key from a passphrase with an iterated salted hash.
    #[must_use]
    pub fn derive_from_passphrase(passphrase: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"MainyDB-AES256-Salt");
        hasher.update(passphrase.as_bytes());
        let mut digest = hasher.finalize();
        for _ in 1..KDF_ROUNDS {
            digest = Sha256::digest(digest);
        }
        Self(digest.into())
    }

    /// Parses a 64-character hex rendering of a key.
    pub fn from_hex(hex: &str) -> EngineResult<Self> {
        if hex.len() != 64 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(EngineError::encryption("key must be 64 hex characters"));
        }
        let mut bytes = [0u8; 32];
        for (i, chunk) in hex.as_bytes().chunks(2).enumerate() {
            let hi = (chunk[0] as char).to_digit(16).unwrap_or(0) as u8;
            let lo = (chunk[1] as char).to_digit(16).unwrap_or(0) as u8;
            bytes[i] = (hi << 4) | lo;
        }
        Ok(Self(bytes))
    }

    /// Renders the key as lowercase hex, for operator hand-off.
    #[must_use]
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{b:02x}")).collect()
    }

    fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("EncryptionKey(…)")
    }
}

/// Which fields get which transform.
#[derive(Debug, Clone, Default)]
pub struct EncryptionConfig {
    /// Top-level fields hashed with SHA-256 on write.
    pub sha256_fields: Vec<String>,
    /// Top-level fields encrypted with AES-256-GCM on write.
    pub aes256_fields: Vec<String>,
}

impl EncryptionConfig {
    /// Creates an empty configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a field to hash on write.
    #[must_use]
    pub fn sha256_field(mut self, field: impl Into<String>) -> Self {
        let field = field.into();
        if !self.sha256_fields.contains(&field) {
            self.sha256_fields.push(field);
        }
        self
    }

    /// Adds a field to encrypt on write and decrypt on read.
    #[must_use]
    pub fn aes256_field(mut self, field: impl Into<String>) -> Self {
        let field = field.into();
        if !self.aes256_fields.contains(&field) {
            self.aes256_fields.push(field);
        }
        self
    }

    /// True when any field is configured for either transform.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sha256_fields.is_empty() && self.aes256_fields.is_empty()
    }
}

/// Salted SHA-256 hashing producing structured hash records.
#[derive(Debug, Default)]
pub struct Sha256Hasher;

impl Sha256Hasher {
    /// Hashes a string with a fresh random salt.
    #[must_use]
    pub fn hash(data: &str) -> Document {
        let mut salt = [0u8; SALT_SIZE];
        OsRng.fill_bytes(&mut salt);
        Self::hash_with_salt(data, &salt)
    }

    fn hash_with_salt(data: &str, salt: &[u8]) -> Document {
        let mut hasher = Sha256::new();
        hasher.update(salt);
        hasher.update(data.as_bytes());
        let digest = hasher.finalize();

        let mut record = Document::with_capacity(3);
        record.set("algorithm", "sha256");
        record.set("hash", Value::Bytes(digest.to_vec()));
        record.set("salt", Value::Bytes(salt.to_vec()));
        record
    }

    /// Verifies a plaintext against a stored hash record.
    #[must_use]
    pub fn verify(data: &str, record: &Document) -> bool {
        let Some(salt) = record.get("salt").and_then(Value::as_bytes) else {
            return false;
        };
        let recomputed = Self::hash_with_salt(data, salt);
        recomputed.get("hash") == record.get("hash")
    }
}

/// AES-256-GCM encryption of string fields.
pub struct Aes256Cipher {
    cipher: Aes256Gcm,
}

impl Aes256Cipher {
    /// Creates a cipher from a key.
    pub fn new(key: &EncryptionKey) -> EngineResult<Self> {
        let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
            .map_err(|e| EngineError::encryption(format!("failed to build cipher: {e}")))?;
        Ok(Self { cipher })
    }

    /// Encrypts a string into a structured cipher record.
    pub fn encrypt(&self, data: &str) -> EngineResult<Document> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = self
            .cipher
            .encrypt(nonce, data.as_bytes())
            .map_err(|_| EngineError::encryption("encryption failed"))?;

        let mut record = Document::with_capacity(3);
        record.set("algorithm", "aes256");
        record.set("ciphertext", Value::Bytes(ciphertext));
        record.set("nonce", Value::Bytes(nonce_bytes.to_vec()));
        Ok(record)
    }

    /// Decrypts a cipher record back into its plaintext.
    pub fn decrypt(&self, record: &Document) -> EngineResult<String> {
        let ciphertext = record
            .get("ciphertext")
            .and_then(Value::as_bytes)
            .ok_or_else(|| EngineError::encryption("record has no ciphertext"))?;
        let nonce_bytes = record
            .get("nonce")
            .and_then(Value::as_bytes)
            .filter(|n| n.len() == NONCE_SIZE)
            .ok_or_else(|| EngineError::encryption("record has a bad nonce"))?;

        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| EngineError::encryption("decryption failed (wrong key or tampered data)"))?;
        String::from_utf8(plaintext)
            .map_err(|_| EngineError::encryption("decrypted payload is not UTF-8"))
    }
}

impl std::fmt::Debug for Aes256Cipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Aes256Cipher")
    }
}

/// The per-collection document transform pair.
#[derive(Debug)]
pub struct FieldCrypto {
    config: EncryptionConfig,
    cipher: Option<Aes256Cipher>,
}

impl FieldCrypto {
    /// Builds the transform from a configuration and an optional key.
    ///
    /// When cipher fields are configured and no key is given, the key is
    /// taken from [`KEY_ENV_VAR`] (64 hex chars), or generated, in
    /// which case it is logged once so the operator can save it.
    pub fn new(config: EncryptionConfig, key: Option<EncryptionKey>) -> EngineResult<Self> {
        let cipher = if config.aes256_fields.is_empty() {
            None
        } else {
            let key = match key {
                Some(key) => key,
                None => match std::env::var(KEY_ENV_VAR) {
                    Ok(hex) => EncryptionKey::from_hex(&hex)?,
                    Err(_) => {
                        let key = EncryptionKey::generate();
                        tracing::warn!(
                            key = %key.to_hex(),
                            "auto-generated encryption key; store it securely and set {KEY_ENV_VAR}"
                        );
                        key
                    }
                },
            };
            Some(Aes256Cipher::new(&key)?)
        };
        Ok(Self { config, cipher })
    }

    /// The write-side hook: hash and encrypt configured string fields.
    ///
    /// Values that are not strings (including records produced by an
    /// earlier pass) are left alone, which makes the transform
    /// idempotent across update round-trips.
    pub fn on_write(&self, mut doc: Document) -> EngineResult<Document> {
        for field in &self.config.sha256_fields {
            if let Some(Value::Text(plain)) = doc.get(field) {
                let record = Sha256Hasher::hash(&plain.clone());
                doc.set(field.as_str(), Value::Doc(record));
            }
        }
        if let Some(cipher) = &self.cipher {
            for field in &self.config.aes256_fields {
                if let Some(Value::Text(plain)) = doc.get(field) {
                    let record = cipher.encrypt(&plain.clone())?;
                    doc.set(field.as_str(), Value::Doc(record));
                }
            }
        }
        Ok(doc)
    }

    /// The read-side hook: decrypt cipher records back to plaintext.
    ///
    /// Hash fields stay as records (one-way). A record that fails to
    /// decrypt is returned unchanged rather than failing the read.
    #[must_use]
    pub fn on_read(&self, mut doc: Document) -> Document {
        let Some(cipher) = &self.cipher else {
            return doc;
        };
        for field in &self.config.aes256_fields {
            let Some(Value::Doc(record)) = doc.get(field) else {
                continue;
            };
            if record.get("algorithm").and_then(Value::as_str) != Some("aes256") {
                continue;
            }
            match cipher.decrypt(&record.clone()) {
                Ok(plain) => doc.set(field.as_str(), Value::Text(plain)),
                Err(err) => {
                    tracing::warn!(field = field.as_str(), error = %err, "failed to decrypt field");
                }
            }
        }
        doc
    }

    /// Verifies a plaintext against a stored hash-field record.
    pub fn verify_field(&self, field: &str, value: &str, record: &Document) -> EngineResult<bool> {
        if !self.config.sha256_fields.iter().any(|f| f == field) {
            return Err(EngineError::encryption(format!(
                "field {field:?} is not configured for hashing"
            )));
        }
        Ok(Sha256Hasher::verify(value, record))
    }
}
