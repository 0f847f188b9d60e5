use crate::error::CoreError;
use aviary_api::invite::inbox_id_for_key;
use aviary_api::types::{ClientId, InboxId};
use k256::ecdsa::SigningKey;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Platform secret store seam: string values by named account. Delete
/// of a missing account is not an error.
pub trait SecretStore: Send + Sync {
    fn get(&self, account: &str) -> Option<String>;
    fn set(&self, account: &str, value: &str) -> Result<(), CoreError>;
    fn delete(&self, account: &str) -> Result<(), CoreError>;
}

#[derive(Clone, Default)]
pub struct InMemorySecretStore {
    entries: Arc<Mutex<HashMap<String, String>>>,
}

impl InMemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SecretStore for InMemorySecretStore {
    fn get(&self, account: &str) -> Option<String> {
        self.entries
            .lock()
            .ok()
            .and_then(|guard| guard.get(account).cloned())
    }

    fn set(&self, account: &str, value: &str) -> Result<(), CoreError> {
        let mut guard = self.entries.lock().map_err(|_| CoreError::Storage)?;
        guard.insert(account.to_string(), value.to_string());
        Ok(())
    }

    fn delete(&self, account: &str) -> Result<(), CoreError> {
        let mut guard = self.entries.lock().map_err(|_| CoreError::Storage)?;
        guard.remove(account);
        Ok(())
    }
}

/// One inbox's cryptographic identity: the protocol signing key plus the
/// key protecting its local encrypted database.
#[derive(Clone)]
pub struct Identity {
    pub client_id: ClientId,
    pub inbox_id: InboxId,
    signing_key: [u8; 32],
    pub db_key: [u8; 32],
}

#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct StoredIdentity {
    client_id: String,
    inbox_id: String,
    signing_key_hex: String,
    db_key_hex: String,
}

impl Identity {
    pub fn generate(client_id: ClientId) -> Self {
        let signing = SigningKey::random(&mut OsRng);
        let inbox_id = inbox_id_for_key(signing.verifying_key());
        let mut db_key = [0u8; 32];
        OsRng.fill_bytes(&mut db_key);
        Self {
            client_id,
            inbox_id,
            signing_key: signing.to_bytes().into(),
            db_key,
        }
    }

    pub fn signing_key(&self) -> Result<SigningKey, CoreError> {
        SigningKey::from_slice(&self.signing_key)
            .map_err(|_| CoreError::Consistency("signing key".to_string()))
    }
}

fn identity_account(client_id: &ClientId) -> String {
    format!("identity:{}", client_id.value)
}

fn inbox_index_account(inbox_id: &InboxId) -> String {
    format!("inbox-index:{}", inbox_id.value)
}

/// Identity persistence over the secret store, with a by-inbox index so
/// lookups work from either identifier.
#[derive(Clone)]
pub struct IdentityStore {
    secret: Arc<dyn SecretStore>,
}

impl IdentityStore {
    pub fn new(secret: Arc<dyn SecretStore>) -> Self {
        Self { secret }
    }

    pub fn save(&self, identity: &Identity) -> Result<(), CoreError> {
        let stored = StoredIdentity {
            client_id: identity.client_id.value.clone(),
            inbox_id: identity.inbox_id.value.clone(),
            signing_key_hex: hex::encode(identity.signing_key),
            db_key_hex: hex::encode(identity.db_key),
        };
        let json = serde_json::to_string(&stored).map_err(|_| CoreError::Storage)?;
        self.secret.set(&identity_account(&identity.client_id), &json)?;
        self.secret.set(
            &inbox_index_account(&identity.inbox_id),
            &identity.client_id.value,
        )
    }

    pub fn by_client(&self, client_id: &ClientId) -> Result<Identity, CoreError> {
        let json = self
            .secret
            .get(&identity_account(client_id))
            .ok_or(CoreError::NotFound)?;
        let stored: StoredIdentity =
            serde_json::from_str(&json).map_err(|_| CoreError::Storage)?;
        let signing_key = decode_key(&stored.signing_key_hex)?;
        let db_key = decode_key(&stored.db_key_hex)?;
        Ok(Identity {
            client_id: ClientId::new(stored.client_id),
            inbox_id: InboxId::new(stored.inbox_id),
            signing_key,
            db_key,
        })
    }

    pub fn by_inbox(&self, inbox_id: &InboxId) -> Result<Identity, CoreError> {
        let client_value = self
            .secret
            .get(&inbox_index_account(inbox_id))
            .ok_or(CoreError::NotFound)?;
        self.by_client(&ClientId::new(client_value))
    }

    /// Idempotent: deleting an identity that is already gone succeeds.
    pub fn delete(&self, client_id: &ClientId) -> Result<(), CoreError> {
        if let Ok(identity) = self.by_client(client_id) {
            self.secret
                .delete(&inbox_index_account(&identity.inbox_id))?;
        }
        self.secret.delete(&identity_account(client_id))
    }
}

fn decode_key(value: &str) -> Result<[u8; 32], CoreError> {
    let bytes = hex::decode(value).map_err(|_| CoreError::Storage)?;
    bytes.try_into().map_err(|_| CoreError::Storage)
}
