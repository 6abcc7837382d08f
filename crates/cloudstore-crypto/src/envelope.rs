//! Envelope encryption of per-object content keys
//!
//! An object's content key is RSA-sealed once per recipient. The envelope
//! keeps three positionally aligned lists: recipient names, base64 sealed
//! keys, and short public-key hashes. Any listed recipient whose private key
//! is available locally (and whose public key still hashes to the recorded
//! value) can recover the content key.

use crate::keys::{ContentKey, KeyProvider, PrivateKey};
use crate::{CryptoError, Result};
use base64::Engine;
use std::sync::Arc;
use tracing::debug;

/// Maximum number of recipients an object may carry
pub const MAX_RECIPIENTS: usize = 4;

const SEPARATOR: char = ',';

/// One sealed copy of a content key
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SealedKey {
    /// Base64 RSA ciphertext of the content key
    pub sealed: String,
    /// 8-character base64 hash of the recipient public key
    pub key_hash: String,
}

/// Recipient list attached to an encrypted object
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncryptionEnvelope {
    names: Vec<String>,
    sealed_keys: Vec<String>,
    key_hashes: Vec<String>,
}

impl EncryptionEnvelope {
    /// Envelope with a single recipient
    pub fn single(name: impl Into<String>, sealed: SealedKey) -> Self {
        Self {
            names: vec![name.into()],
            sealed_keys: vec![sealed.sealed],
            key_hashes: vec![sealed.key_hash],
        }
    }

    /// Parse the comma-joined metadata fields
    pub fn from_fields(names: &str, sealed_keys: &str, key_hashes: &str) -> Result<Self> {
        let split = |s: &str| -> Vec<String> {
            s.split(SEPARATOR)
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty())
                .collect()
        };
        let envelope = Self {
            names: split(names),
            sealed_keys: split(sealed_keys),
            key_hashes: split(key_hashes),
        };
        envelope.validate()?;
        Ok(envelope)
    }

    fn validate(&self) -> Result<()> {
        if self.names.is_empty() {
            return Err(CryptoError::InvalidEnvelope("no recipients".to_string()));
        }
        if self.names.len() != self.sealed_keys.len() || self.names.len() != self.key_hashes.len()
        {
            return Err(CryptoError::InvalidEnvelope(format!(
                "{} names, {} sealed keys, {} key hashes",
                self.names.len(),
                self.sealed_keys.len(),
                self.key_hashes.len()
            )));
        }
        if self.names.len() > MAX_RECIPIENTS {
            return Err(CryptoError::InvalidEnvelope(format!(
                "{} recipients exceeds the maximum of {}",
                self.names.len(),
                MAX_RECIPIENTS
            )));
        }
        Ok(())
    }

    /// Recipient names in order
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Number of recipients
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Always false for a valid envelope
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Position of a recipient
    pub fn position(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    /// Check whether a recipient is listed
    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    /// Sealed key and hash recorded for a recipient
    pub fn sealed_for(&self, name: &str) -> Option<SealedKey> {
        self.position(name).map(|i| SealedKey {
            sealed: self.sealed_keys[i].clone(),
            key_hash: self.key_hashes[i].clone(),
        })
    }

    /// Comma-joined recipient names
    pub fn names_field(&self) -> String {
        self.names.join(",")
    }

    /// Comma-joined base64 sealed keys
    pub fn sealed_keys_field(&self) -> String {
        self.sealed_keys.join(",")
    }

    /// Comma-joined public-key hashes
    pub fn key_hashes_field(&self) -> String {
        self.key_hashes.join(",")
    }

    /// Append a recipient, enforcing name uniqueness and the recipient limit
    pub fn with_recipient(&self, name: &str, sealed: SealedKey) -> Result<Self> {
        if self.contains(name) {
            return Err(CryptoError::Usage(format!(
                "key '{}' already exists on the object",
                name
            )));
        }
        if self.len() >= MAX_RECIPIENTS {
            return Err(CryptoError::Usage(format!(
                "objects may have at most {} encryption keys",
                MAX_RECIPIENTS
            )));
        }
        let mut next = self.clone();
        next.names.push(name.to_string());
        next.sealed_keys.push(sealed.sealed);
        next.key_hashes.push(sealed.key_hash);
        Ok(next)
    }

    /// Drop a recipient; the last one can never be removed
    pub fn without_recipient(&self, name: &str) -> Result<Self> {
        let index = self.position(name).ok_or_else(|| {
            CryptoError::Usage(format!("key '{}' is not an encryption key of the object", name))
        })?;
        if self.len() == 1 {
            return Err(CryptoError::Usage(format!(
                "cannot remove '{}': it is the only encryption key of the object",
                name
            )));
        }
        let mut next = self.clone();
        next.names.remove(index);
        next.sealed_keys.remove(index);
        next.key_hashes.remove(index);
        Ok(next)
    }
}

/// Creates, opens and rotates envelopes using a key provider
#[derive(Clone)]
pub struct EnvelopeKeyManager {
    provider: Arc<dyn KeyProvider>,
}

impl EnvelopeKeyManager {
    /// Create a manager over the given key provider
    pub fn new(provider: Arc<dyn KeyProvider>) -> Self {
        Self { provider }
    }

    /// The underlying key provider
    pub fn provider(&self) -> &Arc<dyn KeyProvider> {
        &self.provider
    }

    /// Fresh random content key
    pub fn generate(&self) -> ContentKey {
        ContentKey::generate()
    }

    /// Seal a content key for a named recipient
    pub fn seal(&self, key: &ContentKey, recipient: &str) -> Result<SealedKey> {
        let public = self.provider.public_key(recipient).map_err(|e| match e {
            CryptoError::NoSuchKey(name) => CryptoError::NoEncryptionKey(name),
            other => other,
        })?;
        let sealed = public.seal(key)?;
        Ok(SealedKey {
            sealed: base64::engine::general_purpose::STANDARD.encode(sealed),
            key_hash: public.hash()?,
        })
    }

    /// Generate a content key and seal it for a single recipient
    pub fn create(&self, recipient: &str) -> Result<(ContentKey, EncryptionEnvelope)> {
        let key = self.generate();
        let sealed = self.seal(&key, recipient)?;
        Ok((key, EncryptionEnvelope::single(recipient, sealed)))
    }

    /// Recover the content key as a specific recipient
    pub fn open(&self, envelope: &EncryptionEnvelope, recipient: &str) -> Result<ContentKey> {
        let sealed = envelope
            .sealed_for(recipient)
            .ok_or_else(|| CryptoError::NoSuchKey(recipient.to_string()))?;
        let private = self.provider.private_key(recipient)?;
        open_with(&private, recipient, &sealed)
    }

    /// Recover the content key with the first recipient held locally.
    ///
    /// Recipients whose private key is missing or whose hash does not match
    /// are skipped.
    pub fn open_any(&self, envelope: &EncryptionEnvelope) -> Result<ContentKey> {
        self.open_first(envelope).map(|(_, key)| key)
    }

    fn open_first(&self, envelope: &EncryptionEnvelope) -> Result<(String, ContentKey)> {
        for name in envelope.names() {
            match self.open(envelope, name) {
                Ok(key) => return Ok((name.clone(), key)),
                Err(e) => debug!(recipient = %name, error = %e, "skipping recipient"),
            }
        }
        Err(CryptoError::MissingDecryptionKey(envelope.names_field()))
    }

    /// Reseal the content key for an additional recipient
    pub fn add_recipient(
        &self,
        envelope: &EncryptionEnvelope,
        new_name: &str,
    ) -> Result<EncryptionEnvelope> {
        if envelope.contains(new_name) {
            return Err(CryptoError::Usage(format!(
                "key '{}' already exists on the object",
                new_name
            )));
        }
        if envelope.len() >= MAX_RECIPIENTS {
            return Err(CryptoError::Usage(format!(
                "objects may have at most {} encryption keys",
                MAX_RECIPIENTS
            )));
        }
        let (opened_by, key) = self.open_first(envelope).map_err(|_| {
            CryptoError::Usage(format!(
                "no private key available for any of {}",
                envelope.names_field()
            ))
        })?;
        debug!(recipient = %new_name, opened_by = %opened_by, "adding recipient");
        let sealed = self.seal(&key, new_name)?;
        envelope.with_recipient(new_name, sealed)
    }

    /// Remove a recipient from the envelope
    pub fn remove_recipient(
        &self,
        envelope: &EncryptionEnvelope,
        name: &str,
    ) -> Result<EncryptionEnvelope> {
        envelope.without_recipient(name)
    }
}

fn open_with(private: &PrivateKey, recipient: &str, sealed: &SealedKey) -> Result<ContentKey> {
    let actual = private.public_key().hash()?;
    if actual != sealed.key_hash {
        return Err(CryptoError::KeyMismatch {
            name: recipient.to_string(),
            expected: sealed.key_hash.clone(),
            actual,
        });
    }
    let bytes = base64::engine::general_purpose::STANDARD.decode(&sealed.sealed)?;
    private.unseal(&bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::tests::test_pair;
    use crate::keys::MemoryKeyProvider;

    fn manager_with(names: &[&str]) -> (EnvelopeKeyManager, MemoryKeyProvider) {
        let provider = MemoryKeyProvider::new();
        for (slot, name) in names.iter().enumerate() {
            provider.insert_pair(*name, &test_pair(slot));
        }
        (EnvelopeKeyManager::new(Arc::new(provider.clone())), provider)
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let (manager, _) = manager_with(&["alice"]);
        let (key, envelope) = manager.create("alice").unwrap();
        assert_eq!(envelope.names(), ["alice".to_string()]);
        assert_eq!(manager.open(&envelope, "alice").unwrap(), key);
        assert_eq!(manager.open_any(&envelope).unwrap(), key);
    }

    #[test]
    fn test_seal_unknown_recipient() {
        let (manager, _) = manager_with(&["alice"]);
        let key = manager.generate();
        assert!(matches!(
            manager.seal(&key, "mallory"),
            Err(CryptoError::NoEncryptionKey(name)) if name == "mallory"
        ));
    }

    #[test]
    fn test_open_detects_hash_mismatch() {
        let (manager, provider) = manager_with(&["alice"]);
        let (_, envelope) = manager.create("alice").unwrap();

        // Same name, different key material
        provider.insert_pair("alice", &test_pair(3));
        assert!(matches!(
            manager.open(&envelope, "alice"),
            Err(CryptoError::KeyMismatch { .. })
        ));
    }

    #[test]
    fn test_open_without_private_key() {
        let (manager, provider) = manager_with(&["alice"]);
        let (_, envelope) = manager.create("alice").unwrap();
        provider.remove_private("alice");

        assert!(matches!(
            manager.open(&envelope, "alice"),
            Err(CryptoError::NoSuchKey(_))
        ));
        assert!(matches!(
            manager.open_any(&envelope),
            Err(CryptoError::MissingDecryptionKey(_))
        ));
    }

    #[test]
    fn test_add_then_remove_recipient() {
        let (manager, _) = manager_with(&["alice", "bob"]);
        let (key, envelope) = manager.create("alice").unwrap();

        let grown = manager.add_recipient(&envelope, "bob").unwrap();
        assert_eq!(grown.len(), 2);
        assert_eq!(manager.open(&grown, "bob").unwrap(), key);

        let shrunk = manager.remove_recipient(&grown, "bob").unwrap();
        assert_eq!(shrunk, envelope);
        assert_eq!(manager.open(&shrunk, "alice").unwrap(), key);
    }

    #[test]
    fn test_add_recipient_errors() {
        let (manager, provider) = manager_with(&["a", "b", "c", "d"]);
        let (_, envelope) = manager.create("a").unwrap();

        assert!(matches!(
            manager.add_recipient(&envelope, "a"),
            Err(CryptoError::Usage(_))
        ));

        let full = ["b", "c", "d"]
            .iter()
            .fold(envelope.clone(), |env, name| manager.add_recipient(&env, name).unwrap());
        assert_eq!(full.len(), MAX_RECIPIENTS);
        provider.insert_public("e", test_pair(0).public_key());
        assert!(matches!(
            manager.add_recipient(&full, "e"),
            Err(CryptoError::Usage(_))
        ));

        provider.remove_private("a");
        assert!(matches!(
            manager.add_recipient(&envelope, "b"),
            Err(CryptoError::Usage(_))
        ));
    }

    #[test]
    fn test_remove_last_recipient_fails() {
        let (manager, _) = manager_with(&["alice"]);
        let (_, envelope) = manager.create("alice").unwrap();
        assert!(matches!(
            manager.remove_recipient(&envelope, "alice"),
            Err(CryptoError::Usage(_))
        ));
        assert!(matches!(
            manager.remove_recipient(&envelope, "nobody"),
            Err(CryptoError::Usage(_))
        ));
    }

    #[test]
    fn test_fields_roundtrip() {
        let (manager, _) = manager_with(&["alice", "bob"]);
        let (_, envelope) = manager.create("alice").unwrap();
        let envelope = manager.add_recipient(&envelope, "bob").unwrap();

        assert_eq!(envelope.names_field(), "alice,bob");
        let parsed = EncryptionEnvelope::from_fields(
            &envelope.names_field(),
            &envelope.sealed_keys_field(),
            &envelope.key_hashes_field(),
        )
        .unwrap();
        assert_eq!(parsed, envelope);
    }

    #[test]
    fn test_from_fields_rejects_misaligned_lists() {
        assert!(matches!(
            EncryptionEnvelope::from_fields("a,b", "x", "h1,h2"),
            Err(CryptoError::InvalidEnvelope(_))
        ));
        assert!(matches!(
            EncryptionEnvelope::from_fields("", "", ""),
            Err(CryptoError::InvalidEnvelope(_))
        ));
    }
}
