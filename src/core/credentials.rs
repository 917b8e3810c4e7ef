//! Ledger signing credentials.
//!
//! The first access generates an ed25519 key and persists it in the identity
//! store; every later access reuses it. Concurrent first access is funnelled
//! through one `OnceCell` initialisation so only one key is ever generated per
//! cache.

use std::sync::Arc;

use base64::Engine as _;
use ed25519_dalek::{Signer as _, SigningKey};
use tokio::sync::OnceCell;
use tracing::info;

use crate::core::identity::{IdentityStore, KEY_LEDGER_SIGNING_KEY};
use crate::core::keyring::StoreError;

pub struct LedgerKeypair {
    signing_key: SigningKey,
}

impl LedgerKeypair {
    pub fn generate() -> Result<Self, StoreError> {
        let mut seed = [0_u8; 32];
        getrandom::fill(&mut seed)
            .map_err(|err| StoreError::corrupt(KEY_LEDGER_SIGNING_KEY, err.to_string()))?;
        Ok(Self::from_seed(seed))
    }

    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(&seed),
        }
    }

    pub fn decode(encoded: &str) -> Result<Self, StoreError> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|err| StoreError::corrupt(KEY_LEDGER_SIGNING_KEY, err.to_string()))?;
        let seed: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
            StoreError::corrupt(
                KEY_LEDGER_SIGNING_KEY,
                format!("expected 32 bytes, got {}", bytes.len()),
            )
        })?;
        Ok(Self::from_seed(seed))
    }

    pub fn encode(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(self.signing_key.to_bytes())
    }

    pub fn public_key_b64(&self) -> String {
        base64::engine::general_purpose::STANDARD
            .encode(self.signing_key.verifying_key().to_bytes())
    }

    pub fn sign_b64(&self, payload: &[u8]) -> String {
        base64::engine::general_purpose::STANDARD.encode(self.signing_key.sign(payload).to_bytes())
    }

    #[cfg(test)]
    pub fn verify(&self, payload: &[u8], signature_b64: &str) -> bool {
        let Ok(bytes) = base64::engine::general_purpose::STANDARD.decode(signature_b64) else {
            return false;
        };
        let Ok(bytes) = <[u8; 64]>::try_from(bytes.as_slice()) else {
            return false;
        };
        let signature = ed25519_dalek::Signature::from_bytes(&bytes);
        self.signing_key
            .verifying_key()
            .verify_strict(payload, &signature)
            .is_ok()
    }
}

/// Payload signed for every ledger submission.
pub fn ledger_signing_payload(
    chat_id: &str,
    sender_id: &str,
    content: &str,
    client_key: &str,
) -> Vec<u8> {
    format!("{chat_id}\n{sender_id}\n{content}\n{client_key}").into_bytes()
}

/// Load-or-create once, share afterwards.
#[derive(Default)]
pub struct CredentialCache {
    cell: OnceCell<Arc<LedgerKeypair>>,
}

impl CredentialCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get_or_init(
        &self,
        store: &dyn IdentityStore,
    ) -> Result<Arc<LedgerKeypair>, StoreError> {
        self.cell
            .get_or_try_init(|| async { load_or_create(store).map(Arc::new) })
            .await
            .cloned()
    }
}

fn load_or_create(store: &dyn IdentityStore) -> Result<LedgerKeypair, StoreError> {
    if let Some(encoded) = store.get(KEY_LEDGER_SIGNING_KEY)? {
        return LedgerKeypair::decode(&encoded);
    }

    let keypair = LedgerKeypair::generate()?;
    store.set(KEY_LEDGER_SIGNING_KEY, &keypair.encode())?;
    info!(public_key = %keypair.public_key_b64(), "Generated ledger signing key");
    Ok(keypair)
}
