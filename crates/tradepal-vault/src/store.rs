use std::sync::Arc;

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::Engine;
use chrono::Utc;
use parking_lot::Mutex;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use tradepal_types::ProviderId;

use crate::storage::KeyValueStorage;
use crate::{CredentialError, Result};

/// Durable entry prefix; the provider id is appended.
pub const CREDENTIAL_KEY_PREFIX: &str = "tradepal.credential.";
/// Session entry holding the raw AES key as a JSON byte array.
pub const SESSION_KEY_ENTRY: &str = "tradepal.session_key";

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

/// Durable record for one provider. `key` is `base64(nonce || ciphertext)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredCredential {
    pub provider: ProviderId,
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub created_at: String,
}

/// What callers may see about a stored credential: never the key itself.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CredentialSummary {
    pub provider: ProviderId,
    pub label: Option<String>,
    pub created_at: String,
}

/// Validate a key against the provider's known format before storing it.
pub fn validate_api_key(provider: ProviderId, key: &str) -> Result<()> {
    let key = key.trim();
    if key.is_empty() {
        return Err(CredentialError::EmptyKey);
    }

    let (prefix, min_len) = match provider {
        ProviderId::OpenAi => ("sk-", 20),
        ProviderId::Anthropic => ("sk-ant-", 20),
        ProviderId::Google => ("AIza", 30),
        ProviderId::OpenRouter => ("sk-or-", 20),
    };

    if !key.starts_with(prefix) {
        return Err(CredentialError::InvalidFormat {
            provider: provider.to_string(),
            reason: format!("expected a key starting with `{}`", prefix),
        });
    }
    if key.len() < min_len {
        return Err(CredentialError::InvalidFormat {
            provider: provider.to_string(),
            reason: format!("key appears too short (minimum {} characters)", min_len),
        });
    }
    Ok(())
}

pub struct CredentialStore {
    durable: Arc<dyn KeyValueStorage>,
    session: Arc<dyn KeyValueStorage>,
    key_init: Mutex<()>,
}

impl CredentialStore {
    pub fn new(durable: Arc<dyn KeyValueStorage>, session: Arc<dyn KeyValueStorage>) -> Self {
        Self {
            durable,
            session,
            key_init: Mutex::new(()),
        }
    }

    pub fn store(
        &self,
        provider: ProviderId,
        plaintext_key: &str,
        label: Option<&str>,
    ) -> Result<()> {
        validate_api_key(provider, plaintext_key)?;

        let cipher = self.cipher()?;
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext_key.trim().as_bytes())
            .map_err(|e| CredentialError::Crypto(format!("Encryption failed: {}", e)))?;

        let mut payload = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        payload.extend_from_slice(&nonce_bytes);
        payload.extend_from_slice(&ciphertext);

        let record = StoredCredential {
            provider,
            key: base64::engine::general_purpose::STANDARD.encode(payload),
            label: label
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(str::to_string),
            created_at: Utc::now().to_rfc3339(),
        };
        self.durable
            .set(&entry_key(provider), &serde_json::to_string(&record)?)?;
        tracing::info!(provider = provider.as_str(), "stored provider credential");
        Ok(())
    }

    /// Plaintext key for `provider`, or `None` when nothing usable is stored.
    /// Undecryptable entries (corruption, or a key from an earlier session)
    /// are logged and reported as `None`.
    pub fn retrieve(&self, provider: ProviderId) -> Option<String> {
        match self.try_retrieve(provider) {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!(
                    provider = provider.as_str(),
                    "stored credential is unreadable: {}",
                    err
                );
                None
            }
        }
    }

    pub fn remove(&self, provider: ProviderId) -> Result<()> {
        self.durable.remove(&entry_key(provider))
    }

    pub fn clear_all(&self) -> Result<()> {
        for key in self.durable.keys()? {
            if key.starts_with(CREDENTIAL_KEY_PREFIX) {
                self.durable.remove(&key)?;
            }
        }
        Ok(())
    }

    /// Providers with a stored entry. Existence check only, nothing is decrypted.
    pub fn list_configured(&self) -> Vec<ProviderId> {
        ProviderId::ALL
            .into_iter()
            .filter(|provider| match self.durable.get(&entry_key(*provider)) {
                Ok(Some(raw)) => !raw.trim().is_empty() && raw.trim() != "null",
                _ => false,
            })
            .collect()
    }

    pub fn summaries(&self) -> Vec<CredentialSummary> {
        self.list_configured()
            .into_iter()
            .filter_map(|provider| {
                let raw = self.durable.get(&entry_key(provider)).ok()??;
                let record: StoredCredential = serde_json::from_str(&raw).ok()?;
                Some(CredentialSummary {
                    provider,
                    label: record.label,
                    created_at: record.created_at,
                })
            })
            .collect()
    }

    fn try_retrieve(&self, provider: ProviderId) -> Result<Option<String>> {
        let Some(raw) = self.durable.get(&entry_key(provider))? else {
            return Ok(None);
        };
        let record: StoredCredential = serde_json::from_str(&raw)?;

        let payload = base64::engine::general_purpose::STANDARD
            .decode(record.key.as_bytes())
            .map_err(|e| CredentialError::Crypto(format!("Invalid ciphertext encoding: {}", e)))?;
        if payload.len() <= NONCE_LEN {
            return Err(CredentialError::Crypto("Ciphertext too short".to_string()));
        }
        let (nonce_bytes, ciphertext) = payload.split_at(NONCE_LEN);

        let cipher = self.cipher()?;
        let plaintext = Zeroizing::new(
            cipher
                .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
                .map_err(|e| CredentialError::Crypto(format!("Decryption failed: {}", e)))?,
        );
        let value = String::from_utf8(plaintext.to_vec())
            .map_err(|e| CredentialError::Crypto(format!("Invalid UTF-8: {}", e)))?;
        Ok(Some(value))
    }

    fn cipher(&self) -> Result<Aes256Gcm> {
        let key = self.session_key()?;
        Aes256Gcm::new_from_slice(&key)
            .map_err(|e| CredentialError::Crypto(format!("Invalid session key: {}", e)))
    }

    /// Loads the session key, generating and saving one when absent.
    fn session_key(&self) -> Result<Zeroizing<Vec<u8>>> {
        let _guard = self.key_init.lock();
        if let Some(raw) = self.session.get(SESSION_KEY_ENTRY)? {
            match serde_json::from_str::<Vec<u8>>(&raw) {
                Ok(bytes) if bytes.len() == KEY_LEN => return Ok(Zeroizing::new(bytes)),
                _ => tracing::warn!("session key entry is malformed; generating a new one"),
            }
        }

        let mut bytes = vec![0u8; KEY_LEN];
        OsRng.fill_bytes(&mut bytes);
        self.session
            .set(SESSION_KEY_ENTRY, &serde_json::to_string(&bytes)?)?;
        Ok(Zeroizing::new(bytes))
    }
}

fn entry_key(provider: ProviderId) -> String {
    format!("{}{}", CREDENTIAL_KEY_PREFIX, provider.as_str())
}
