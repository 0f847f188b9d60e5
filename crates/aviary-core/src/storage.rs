use crate::error::CoreError;
use aviary_api::types::{ClientId, Consent, ConversationId, InboxActivity, InboxId};
use aviary_store::{EncryptedStore, KeyProvider, StoreError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConversationRow {
    pub conversation_id: String,
    pub client_id: String,
    pub invite_tag: Option<String>,
    pub unused: bool,
    pub joined: bool,
    pub consent: Consent,
    pub created_at_ms: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MessageRow {
    pub message_id: Uuid,
    pub conversation_id: String,
    pub client_id: String,
    pub sender_inbox_id: String,
    pub text: String,
    pub timestamp_ms: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MemberRow {
    pub conversation_id: String,
    pub inbox_id: String,
    pub consent: Consent,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PendingInviteRow {
    pub client_id: String,
    pub tag: String,
    pub created_at_ms: u64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct Tables {
    conversations: HashMap<String, ConversationRow>,
    messages: Vec<MessageRow>,
    members: Vec<MemberRow>,
    activity: HashMap<String, InboxActivity>,
    pending_invites: HashMap<String, PendingInviteRow>,
    local_state: HashMap<String, String>,
}

/// Transactional-enough durable store over the encrypted kv file: the
/// whole table set is one row, every mutation rewrites it. Conversation
/// inserts wake blocked `wait_for_joined_conversation_with_tag` readers.
#[derive(Clone)]
pub struct DurableStore {
    tables: Arc<Mutex<Tables>>,
    disk: Option<Arc<Mutex<EncryptedStore>>>,
    conversation_notify: Arc<Notify>,
}

const TABLES_KEY: &str = "tables";

impl DurableStore {
    pub fn open(
        path: impl AsRef<Path>,
        namespace: &str,
        key_provider: &dyn KeyProvider,
    ) -> Result<Self, CoreError> {
        let store = EncryptedStore::open_or_create(path, namespace, key_provider)
            .map_err(|_| CoreError::Storage)?;
        let tables = match store.get(TABLES_KEY) {
            Some(bytes) => serde_json::from_slice(&bytes).map_err(|_| CoreError::Storage)?,
            None => Tables::default(),
        };
        Ok(Self {
            tables: Arc::new(Mutex::new(tables)),
            disk: Some(Arc::new(Mutex::new(store))),
            conversation_notify: Arc::new(Notify::new()),
        })
    }

    pub fn in_memory() -> Self {
        Self {
            tables: Arc::new(Mutex::new(Tables::default())),
            disk: None,
            conversation_notify: Arc::new(Notify::new()),
        }
    }

    fn with_tables<R>(&self, f: impl FnOnce(&mut Tables) -> R) -> Result<R, CoreError> {
        let mut guard = self.tables.lock().map_err(|_| CoreError::Storage)?;
        let out = f(&mut guard);
        if let Some(disk) = self.disk.as_ref() {
            let bytes = serde_json::to_vec(&*guard).map_err(|_| CoreError::Storage)?;
            let mut disk = disk.lock().map_err(|_| CoreError::Storage)?;
            disk.put(TABLES_KEY, bytes).map_err(map_store_err)?;
        }
        Ok(out)
    }

    fn read_tables<R>(&self, f: impl FnOnce(&Tables) -> R) -> R {
        let guard = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        f(&guard)
    }

    // --- conversations ---

    pub fn upsert_conversation(&self, row: ConversationRow) -> Result<(), CoreError> {
        self.with_tables(|t| {
            t.conversations.insert(row.conversation_id.clone(), row);
        })?;
        self.conversation_notify.notify_waiters();
        Ok(())
    }

    pub fn conversation(&self, id: &ConversationId) -> Option<ConversationRow> {
        self.read_tables(|t| t.conversations.get(&id.value).cloned())
    }

    /// Joined rows win over placeholders sharing the same tag.
    pub fn conversation_by_tag(&self, tag: &str) -> Option<ConversationRow> {
        self.read_tables(|t| {
            let mut tagged = t
                .conversations
                .values()
                .filter(|row| row.invite_tag.as_deref() == Some(tag));
            let first = tagged.next().cloned()?;
            if first.joined {
                return Some(first);
            }
            Some(tagged.find(|row| row.joined).cloned().unwrap_or(first))
        })
    }

    pub fn conversations_for_client(&self, client_id: &ClientId) -> Vec<ConversationRow> {
        self.read_tables(|t| {
            t.conversations
                .values()
                .filter(|row| row.client_id == client_id.value)
                .cloned()
                .collect()
        })
    }

    pub fn set_conversation_unused(
        &self,
        id: &ConversationId,
        unused: bool,
    ) -> Result<(), CoreError> {
        self.with_tables(|t| match t.conversations.get_mut(&id.value) {
            Some(row) => {
                row.unused = unused;
                Ok(())
            }
            None => Err(CoreError::NotFound),
        })?
    }

    pub fn delete_conversation(&self, id: &ConversationId) -> Result<(), CoreError> {
        self.with_tables(|t| {
            t.conversations.remove(&id.value);
            t.messages.retain(|m| m.conversation_id != id.value);
            t.members.retain(|m| m.conversation_id != id.value);
        })
    }

    /// Blocks until a *joined* conversation row tagged `tag` appears.
    /// Placeholder rows carry the same tag but `joined: false`, so they do
    /// not satisfy the wait. Driven by change notification, not polling;
    /// callers race this against their own cancellation or error signals
    /// with `select!`.
    pub async fn wait_for_joined_conversation_with_tag(&self, tag: &str) -> ConversationRow {
        loop {
            let notified = self.conversation_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(row) = self.conversation_by_tag(tag).filter(|row| row.joined) {
                return row;
            }
            notified.await;
        }
    }

    // --- messages and members ---

    pub fn insert_message(&self, row: MessageRow) -> Result<(), CoreError> {
        self.with_tables(|t| {
            t.messages.push(row);
        })
    }

    pub fn messages_for_conversation(&self, id: &ConversationId) -> Vec<MessageRow> {
        self.read_tables(|t| {
            t.messages
                .iter()
                .filter(|m| m.conversation_id == id.value)
                .cloned()
                .collect()
        })
    }

    pub fn upsert_member(&self, row: MemberRow) -> Result<(), CoreError> {
        self.with_tables(|t| {
            if let Some(existing) = t
                .members
                .iter_mut()
                .find(|m| m.conversation_id == row.conversation_id && m.inbox_id == row.inbox_id)
            {
                existing.consent = row.consent;
            } else {
                t.members.push(row);
            }
        })
    }

    pub fn member(&self, conversation_id: &ConversationId, inbox_id: &InboxId) -> Option<MemberRow> {
        self.read_tables(|t| {
            t.members
                .iter()
                .find(|m| m.conversation_id == conversation_id.value && m.inbox_id == inbox_id.value)
                .cloned()
        })
    }

    // --- inbox activity ---

    pub fn record_inbox(
        &self,
        client_id: &ClientId,
        inbox_id: &InboxId,
        created_at_ms: u64,
    ) -> Result<(), CoreError> {
        self.with_tables(|t| {
            t.activity
                .entry(client_id.value.clone())
                .and_modify(|record| record.inbox_id = inbox_id.clone())
                .or_insert_with(|| InboxActivity {
                    client_id: client_id.clone(),
                    inbox_id: inbox_id.clone(),
                    last_activity_ms: None,
                    created_at_ms,
                });
        })
    }

    pub fn record_activity(&self, client_id: &ClientId, now_ms: u64) -> Result<(), CoreError> {
        self.with_tables(|t| match t.activity.get_mut(&client_id.value) {
            Some(record) => {
                record.last_activity_ms = Some(now_ms);
                Ok(())
            }
            None => Err(CoreError::NotFound),
        })?
    }

    pub fn activity_for(&self, client_id: &ClientId) -> Option<InboxActivity> {
        self.read_tables(|t| t.activity.get(&client_id.value).cloned())
    }

    pub fn activity_records(&self) -> Vec<InboxActivity> {
        self.read_tables(|t| t.activity.values().cloned().collect())
    }

    // --- pending invites ---

    pub fn set_pending_invite(
        &self,
        client_id: &ClientId,
        tag: &str,
        now_ms: u64,
    ) -> Result<(), CoreError> {
        self.with_tables(|t| {
            t.pending_invites.insert(
                client_id.value.clone(),
                PendingInviteRow {
                    client_id: client_id.value.clone(),
                    tag: tag.to_string(),
                    created_at_ms: now_ms,
                },
            );
        })
    }

    pub fn clear_pending_invite(&self, client_id: &ClientId) -> Result<(), CoreError> {
        self.with_tables(|t| {
            t.pending_invites.remove(&client_id.value);
        })
    }

    pub fn has_pending_invite(&self, client_id: &ClientId) -> bool {
        self.read_tables(|t| t.pending_invites.contains_key(&client_id.value))
    }

    pub fn pending_invite_tag(&self, client_id: &ClientId) -> Option<String> {
        self.read_tables(|t| {
            t.pending_invites
                .get(&client_id.value)
                .map(|row| row.tag.clone())
        })
    }

    pub fn pending_invite_clients(&self) -> Vec<ClientId> {
        self.read_tables(|t| {
            t.pending_invites
                .keys()
                .map(|k| ClientId::new(k.clone()))
                .collect()
        })
    }

    // --- local state ---

    pub fn set_local(&self, key: &str, value: &str) -> Result<(), CoreError> {
        self.with_tables(|t| {
            t.local_state.insert(key.to_string(), value.to_string());
        })
    }

    pub fn local(&self, key: &str) -> Option<String> {
        self.read_tables(|t| t.local_state.get(key).cloned())
    }

    pub fn delete_local(&self, key: &str) -> Result<(), CoreError> {
        self.with_tables(|t| {
            t.local_state.remove(key);
        })
    }

    // --- client-scoped wipe ---

    /// Removes every row scoped to the client. After this returns,
    /// `references_client` is false.
    pub fn delete_all_for_client(&self, client_id: &ClientId) -> Result<(), CoreError> {
        self.with_tables(|t| {
            let convo_ids: Vec<String> = t
                .conversations
                .values()
                .filter(|row| row.client_id == client_id.value)
                .map(|row| row.conversation_id.clone())
                .collect();
            t.conversations
                .retain(|_, row| row.client_id != client_id.value);
            t.messages
                .retain(|m| m.client_id != client_id.value && !convo_ids.contains(&m.conversation_id));
            t.members.retain(|m| !convo_ids.contains(&m.conversation_id));
            t.activity.remove(&client_id.value);
            t.pending_invites.remove(&client_id.value);
            t.local_state
                .retain(|key, value| !key_scoped_to(key, value, &client_id.value));
        })
    }

    pub fn references_client(&self, client_id: &ClientId) -> bool {
        self.read_tables(|t| {
            t.conversations
                .values()
                .any(|row| row.client_id == client_id.value)
                || t.messages.iter().any(|m| m.client_id == client_id.value)
                || t.activity.contains_key(&client_id.value)
                || t.pending_invites.contains_key(&client_id.value)
                || t.local_state
                    .iter()
                    .any(|(key, value)| key_scoped_to(key, value, &client_id.value))
        })
    }
}

fn key_scoped_to(key: &str, value: &str, client_value: &str) -> bool {
    key.ends_with(&format!(":{}", client_value)) || value == client_value
}

fn map_store_err(_err: StoreError) -> CoreError {
    CoreError::Storage
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    struct FixedKey;

    impl KeyProvider for FixedKey {
        fn master_key(&self) -> Result<[u8; 32], StoreError> {
            Ok([9u8; 32])
        }
    }

    #[test]
    fn tables_survive_reopen() {
        let dir = tempdir().unwrap();
        let store = DurableStore::open(dir.path(), "test", &FixedKey).unwrap();
        store
            .upsert_conversation(ConversationRow {
                conversation_id: "c1".to_string(),
                client_id: "alice".to_string(),
                invite_tag: Some("tag".to_string()),
                unused: false,
                joined: true,
                consent: Consent::Allowed,
                created_at_ms: 1,
            })
            .unwrap();
        store.set_local("sleep-at:alice", "42").unwrap();
        drop(store);

        let store = DurableStore::open(dir.path(), "test", &FixedKey).unwrap();
        let row = store
            .conversation(&ConversationId::new("c1"))
            .expect("row survives reopen");
        assert!(row.joined);
        assert_eq!(row.invite_tag.as_deref(), Some("tag"));
        assert_eq!(store.local("sleep-at:alice").as_deref(), Some("42"));
    }

    #[test]
    fn client_wipe_clears_every_reference() {
        let store = DurableStore::in_memory();
        let client = ClientId::new("alice");
        store
            .record_inbox(&client, &InboxId::new("aa"), 1)
            .unwrap();
        store.set_pending_invite(&client, "tag", 1).unwrap();
        store.set_local("topic:inbox/aa", "alice").unwrap();
        assert!(store.references_client(&client));

        store.delete_all_for_client(&client).unwrap();
        assert!(!store.references_client(&client));
    }
}
