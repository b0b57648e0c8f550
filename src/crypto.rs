use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use argon2::Argon2;
use base64::Engine;
use rand::RngCore;
use zeroize::Zeroizing;

use crate::error::{CoreError, CoreResult};

const ENC_PREFIX: &str = "ENC:";
const NONCE_LEN: usize = 12;
const MIN_MASTER_KEY_LEN: usize = 20;

/// AES-256-GCM field-level encryption keyed by an Argon2id-derived secret
/// (§4.12, §6 "Encrypted-value encoding"). The salt is fixed per instance
/// (derived from the instance id) rather than random per value, so the same
/// plaintext+key always produces a decryptable value — encryption is for
/// secrets at rest, not for hiding repetition.
pub struct FieldCipher {
    cipher: Aes256Gcm,
}

impl FieldCipher {
    pub fn new(master_key: &[u8], instance_id: &str) -> CoreResult<Self> {
        if master_key.len() < MIN_MASTER_KEY_LEN {
            return Err(CoreError::Fatal(format!(
                "master key must be at least {MIN_MASTER_KEY_LEN} bytes, got {}",
                master_key.len()
            )));
        }

        let salt = derive_salt(instance_id);
        let mut derived = Zeroizing::new([0u8; 32]);
        Argon2::default()
            .hash_password_into(master_key, &salt, derived.as_mut())
            .map_err(|e| CoreError::Fatal(format!("key derivation failed: {e}")))?;

        let cipher = Aes256Gcm::new_from_slice(derived.as_ref())
            .map_err(|e| CoreError::Fatal(format!("invalid derived key: {e}")))?;

        Ok(FieldCipher { cipher })
    }

    /// Encrypts `plaintext`, returning an `ENC:`-prefixed base64 blob of
    /// `nonce || ciphertext`. Idempotent on decrypt: decrypting the output
    /// of `encrypt` always yields the original plaintext back.
    pub fn encrypt(&self, plaintext: &str) -> CoreResult<String> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| CoreError::Fatal(format!("encryption failed: {e}")))?;

        let mut combined = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        combined.extend_from_slice(&nonce_bytes);
        combined.extend_from_slice(&ciphertext);

        Ok(format!(
            "{ENC_PREFIX}{}",
            base64::engine::general_purpose::STANDARD.encode(combined)
        ))
    }

    /// Decrypts a value previously produced by `encrypt`. Values without the
    /// `ENC:` prefix are returned unchanged — callers may hold a mix of
    /// plaintext and encrypted fields during migration.
    pub fn decrypt_if_needed(&self, value: &str) -> CoreResult<String> {
        let Some(encoded) = value.strip_prefix(ENC_PREFIX) else {
            return Ok(value.to_owned());
        };

        let combined = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| CoreError::InputInvalid(format!("invalid encrypted value: {e}")))?;

        if combined.len() < NONCE_LEN {
            return Err(CoreError::InputInvalid("encrypted value too short".to_owned()));
        }

        let (nonce_bytes, ciphertext) = combined.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);

        let plaintext = self
            .cipher
            .decrypt(nonce, ciphertext)
            .map_err(|e| CoreError::InputInvalid(format!("decryption failed: {e}")))?;

        String::from_utf8(plaintext).map_err(|e| CoreError::InputInvalid(format!("decrypted value not utf8: {e}")))
    }
}

fn derive_salt(instance_id: &str) -> [u8; 16] {
    use sha2::{Digest, Sha256};
    let digest = Sha256::digest(instance_id.as_bytes());
    let mut salt = [0u8; 16];
    salt.copy_from_slice(&digest[..16]);
    salt
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    fn test_key() -> Vec<u8> {
        b"0123456789abcdef0123456789".to_vec()
    }

    #[test]
    fn rejects_short_master_key() {
        let result = FieldCipher::new(b"tooshort", "instance-1");
        assert!(result.is_err());
    }

    #[test]
    fn round_trips_plaintext() {
        let cipher = FieldCipher::new(&test_key(), "instance-1").unwrap();
        let encrypted = cipher.encrypt("super secret token").unwrap();
        assert!(encrypted.starts_with("ENC:"));
        let decrypted = cipher.decrypt_if_needed(&encrypted).unwrap();
        assert_eq!(decrypted, "super secret token");
    }

    #[test]
    fn passthrough_for_unprefixed_values() {
        let cipher = FieldCipher::new(&test_key(), "instance-1").unwrap();
        let value = cipher.decrypt_if_needed("plain-value").unwrap();
        assert_eq!(value, "plain-value");
    }

    #[test]
    fn decrypt_is_idempotent_across_two_instances_with_same_key_and_id() {
        let a = FieldCipher::new(&test_key(), "instance-1").unwrap();
        let b = FieldCipher::new(&test_key(), "instance-1").unwrap();
        let encrypted = a.encrypt("value").unwrap();
        assert_eq!(b.decrypt_if_needed(&encrypted).unwrap(), "value");
    }
}
