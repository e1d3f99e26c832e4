// Envelope encryption for provider API keys.
// AES-256-GCM with a per-value data key wrapped by a versioned key-encryption
// key, so KEKs can rotate without re-encrypting every row at once.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

const NONCE_SIZE: usize = 12;
const KEY_SIZE: usize = 32;
const PAYLOAD_VERSION: u8 = 1;
const ALGORITHM: &str = "AES-256-GCM";

/// Encrypted payload stored in llm_providers.api_key_encrypted
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedPayload {
    pub version: u8,
    pub alg: String,
    /// Id of the KEK that wrapped the data key
    pub key_id: String,
    /// Base64: data-key nonce + wrapped data key
    pub dek_wrapped: String,
    pub nonce: String,
    pub ciphertext: String,
}

#[derive(Clone)]
struct VersionedKey {
    id: String,
    cipher: Aes256Gcm,
}

/// Thread-safe encryption service; one primary KEK for new writes, all known
/// KEKs available for reads.
#[derive(Clone)]
pub struct SecretCipher {
    primary: Arc<VersionedKey>,
    keys: Arc<HashMap<String, Aes256Gcm>>,
}

impl SecretCipher {
    /// Build from versioned key strings of the form "key_id:base64_key".
    /// The first key encrypts new values; every key decrypts.
    pub fn new(primary_key: &str, previous_keys: &[&str]) -> Result<Self> {
        let (primary_id, primary_cipher) = parse_versioned_key(primary_key)?;

        let mut keys = HashMap::new();
        keys.insert(primary_id.clone(), primary_cipher.clone());
        for key_str in previous_keys {
            let (id, cipher) = parse_versioned_key(key_str)?;
            if keys.insert(id.clone(), cipher).is_some() {
                anyhow::bail!("duplicate key id: {id}");
            }
        }

        Ok(Self {
            primary: Arc::new(VersionedKey {
                id: primary_id,
                cipher: primary_cipher,
            }),
            keys: Arc::new(keys),
        })
    }

    /// Build from PERPETUA_SECRETS_KEY (required) and
    /// PERPETUA_SECRETS_KEY_PREVIOUS (optional, rotation).
    pub fn from_env() -> Result<Self> {
        let primary = std::env::var("PERPETUA_SECRETS_KEY")
            .context("PERPETUA_SECRETS_KEY environment variable not set")?;
        let previous = std::env::var("PERPETUA_SECRETS_KEY_PREVIOUS").ok();
        let previous_refs: Vec<&str> = previous.as_deref().into_iter().collect();
        Self::new(&primary, &previous_refs)
    }

    /// Encrypt a secret string for database storage
    pub fn encrypt(&self, plaintext: &str) -> Result<Vec<u8>> {
        let mut dek = [0u8; KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut dek);

        let mut dek_nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut dek_nonce_bytes);
        let wrapped_dek = self
            .primary
            .cipher
            .encrypt(Nonce::from_slice(&dek_nonce_bytes), dek.as_ref())
            .map_err(|e| anyhow::anyhow!("failed to wrap data key: {e}"))?;

        let dek_cipher = Aes256Gcm::new_from_slice(&dek)
            .map_err(|e| anyhow::anyhow!("failed to build data-key cipher: {e}"))?;
        let mut data_nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut data_nonce_bytes);
        let ciphertext = dek_cipher
            .encrypt(Nonce::from_slice(&data_nonce_bytes), plaintext.as_bytes())
            .map_err(|e| anyhow::anyhow!("encryption failed: {e}"))?;

        let mut dek_wrapped = Vec::with_capacity(NONCE_SIZE + wrapped_dek.len());
        dek_wrapped.extend_from_slice(&dek_nonce_bytes);
        dek_wrapped.extend_from_slice(&wrapped_dek);

        let payload = EncryptedPayload {
            version: PAYLOAD_VERSION,
            alg: ALGORITHM.to_string(),
            key_id: self.primary.id.clone(),
            dek_wrapped: BASE64.encode(&dek_wrapped),
            nonce: BASE64.encode(data_nonce_bytes),
            ciphertext: BASE64.encode(&ciphertext),
        };
        serde_json::to_vec(&payload).context("failed to serialize encrypted payload")
    }

    /// Decrypt a stored secret using whichever KEK the payload references
    pub fn decrypt(&self, data: &[u8]) -> Result<String> {
        let payload: EncryptedPayload =
            serde_json::from_slice(data).context("failed to parse encrypted payload")?;
        if payload.version != PAYLOAD_VERSION {
            anyhow::bail!("unsupported payload version {}", payload.version);
        }
        if payload.alg != ALGORITHM {
            anyhow::bail!("unsupported algorithm {}", payload.alg);
        }

        let kek = self
            .keys
            .get(&payload.key_id)
            .with_context(|| format!("unknown key id '{}'", payload.key_id))?;

        let dek_wrapped = BASE64
            .decode(&payload.dek_wrapped)
            .context("failed to decode wrapped data key")?;
        if dek_wrapped.len() < NONCE_SIZE {
            anyhow::bail!("wrapped data key too short");
        }
        let (dek_nonce, wrapped) = dek_wrapped.split_at(NONCE_SIZE);
        let dek = kek
            .decrypt(Nonce::from_slice(dek_nonce), wrapped)
            .map_err(|e| anyhow::anyhow!("failed to unwrap data key: {e}"))?;
        if dek.len() != KEY_SIZE {
            anyhow::bail!("invalid data key size after unwrap");
        }

        let dek_cipher = Aes256Gcm::new_from_slice(&dek)
            .map_err(|e| anyhow::anyhow!("failed to build data-key cipher: {e}"))?;
        let data_nonce = BASE64.decode(&payload.nonce).context("failed to decode nonce")?;
        let ciphertext = BASE64
            .decode(&payload.ciphertext)
            .context("failed to decode ciphertext")?;
        let plaintext = dek_cipher
            .decrypt(Nonce::from_slice(&data_nonce), ciphertext.as_ref())
            .map_err(|e| anyhow::anyhow!("decryption failed (data may be corrupted): {e}"))?;

        String::from_utf8(plaintext).context("decrypted data is not valid UTF-8")
    }

    pub fn primary_key_id(&self) -> &str {
        &self.primary.id
    }
}

fn parse_versioned_key(key_str: &str) -> Result<(String, Aes256Gcm)> {
    let Some((key_id, encoded)) = key_str.split_once(':') else {
        anyhow::bail!("invalid key format; expected 'key_id:base64_key'");
    };
    let key_bytes = BASE64.decode(encoded).context("failed to decode key from base64")?;
    if key_bytes.len() != KEY_SIZE {
        anyhow::bail!(
            "key '{key_id}' must be {KEY_SIZE} bytes, got {}",
            key_bytes.len()
        );
    }
    let cipher = Aes256Gcm::new_from_slice(&key_bytes)
        .map_err(|e| anyhow::anyhow!("failed to build cipher for key '{key_id}': {e}"))?;
    Ok((key_id.to_string(), cipher))
}

/// Generate a fresh random KEK in "key_id:base64_key" form
pub fn generate_secret_key(key_id: &str) -> String {
    let mut key = [0u8; KEY_SIZE];
    rand::thread_rng().fill_bytes(&mut key);
    format!("{key_id}:{}", BASE64.encode(key))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let cipher = SecretCipher::new(&generate_secret_key("kek-v1"), &[]).unwrap();
        let encrypted = cipher.encrypt("sk-test-provider-key").unwrap();
        assert_eq!(cipher.decrypt(&encrypted).unwrap(), "sk-test-provider-key");
    }

    #[test]
    fn same_plaintext_yields_different_ciphertext() {
        let cipher = SecretCipher::new(&generate_secret_key("kek-v1"), &[]).unwrap();
        let a = cipher.encrypt("secret").unwrap();
        let b = cipher.encrypt("secret").unwrap();
        assert_ne!(a, b);
        assert_eq!(cipher.decrypt(&a).unwrap(), cipher.decrypt(&b).unwrap());
    }

    #[test]
    fn rotation_keeps_old_values_readable() {
        let v1 = generate_secret_key("kek-v1");
        let v2 = generate_secret_key("kek-v2");

        let old = SecretCipher::new(&v1, &[]).unwrap();
        let encrypted = old.encrypt("legacy-secret").unwrap();

        let rotated = SecretCipher::new(&v2, &[&v1]).unwrap();
        assert_eq!(rotated.decrypt(&encrypted).unwrap(), "legacy-secret");
        assert_eq!(rotated.primary_key_id(), "kek-v2");
    }

    #[test]
    fn unknown_key_id_fails() {
        let encrypted = SecretCipher::new(&generate_secret_key("kek-v1"), &[])
            .unwrap()
            .encrypt("secret")
            .unwrap();
        let other = SecretCipher::new(&generate_secret_key("kek-v2"), &[]).unwrap();
        assert!(other.decrypt(&encrypted).is_err());
    }

    #[test]
    fn malformed_keys_are_rejected() {
        assert!(SecretCipher::new("no-separator", &[]).is_err());
        assert!(SecretCipher::new("kek:not!base64", &[]).is_err());
        let short = format!("kek:{}", BASE64.encode([0u8; 8]));
        assert!(SecretCipher::new(&short, &[]).is_err());
    }

    #[test]
    fn duplicate_key_ids_are_rejected() {
        let a = generate_secret_key("kek-v1");
        let b = generate_secret_key("kek-v1");
        assert!(SecretCipher::new(&a, &[&b]).is_err());
    }
}
