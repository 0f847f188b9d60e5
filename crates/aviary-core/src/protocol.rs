use crate::error::CoreError;
use crate::keys::Identity;
use crate::time::now_ms;
use aviary_api::types::{Consent, ConversationId, InboxId};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Newest-message metadata for one conversation, fetched without
/// instantiating any client.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageMetadata {
    pub conversation_id: ConversationId,
    pub newest_sent_at_ms: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PushEvent {
    Message {
        conversation_id: ConversationId,
        sender_inbox_id: InboxId,
        text: String,
        sent_at_ms: u64,
    },
    Welcome {
        conversation_id: ConversationId,
        actionable: bool,
    },
}

/// Entry points of the messaging-protocol SDK that exist before any
/// client does.
#[async_trait]
pub trait ProtocolSdk: Send + Sync {
    /// Rebuild a client from cached key state. `NotFound` when nothing is
    /// cached for this identity.
    async fn build_client(&self, identity: &Identity) -> Result<Arc<dyn ProtocolClient>, CoreError>;
    async fn create_client(&self, identity: &Identity)
        -> Result<Arc<dyn ProtocolClient>, CoreError>;
    async fn newest_message_metadata(
        &self,
        conversation_ids: &[ConversationId],
    ) -> Result<Vec<MessageMetadata>, CoreError>;
}

#[async_trait]
pub trait ProtocolClient: Send + Sync {
    fn inbox_id(&self) -> InboxId;
    async fn prepare_conversation(&self) -> Result<ConversationId, CoreError>;
    async fn publish_conversation(&self, id: &ConversationId) -> Result<(), CoreError>;
    async fn send_text(&self, id: &ConversationId, text: &str) -> Result<(), CoreError>;
    async fn send_dm(&self, peer: &InboxId, text: &str) -> Result<(), CoreError>;
    async fn update_consent(&self, id: &ConversationId, consent: Consent) -> Result<(), CoreError>;
    async fn connect_db(&self) -> Result<(), CoreError>;
    async fn disconnect_db(&self) -> Result<(), CoreError>;
    async fn delete_local_db(&self) -> Result<(), CoreError>;
    async fn decode_push(&self, payload: &serde_json::Value) -> Result<PushEvent, CoreError>;
}

#[derive(Clone, Debug)]
pub struct SentMessage {
    pub conversation_id: ConversationId,
    pub sender_inbox_id: InboxId,
    pub text: String,
    pub sent_at_ms: u64,
}

#[derive(Clone, Debug)]
pub struct SentDm {
    pub from: InboxId,
    pub to: InboxId,
    pub text: String,
}

#[derive(Default)]
struct Net {
    cached_clients: HashSet<String>,
    conversations: HashMap<String, Vec<SentMessage>>,
    published: HashSet<String>,
    consents: HashMap<(String, String), Consent>,
    dms: Vec<SentDm>,
    forced_inbox: Option<String>,
    fail_publish: bool,
}

/// In-process protocol fake shared by every client it creates, so
/// multiple inboxes in one test see the same simulated network.
#[derive(Clone, Default)]
pub struct InMemoryProtocol {
    net: Arc<Mutex<Net>>,
}

impl InMemoryProtocol {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next created client report this inbox id instead of the
    /// identity's own, to provoke the consistency check.
    pub fn force_inbox_id(&self, inbox_id: Option<InboxId>) {
        let mut net = self.net.lock().unwrap_or_else(|e| e.into_inner());
        net.forced_inbox = inbox_id.map(|id| id.value);
    }

    pub fn fail_publish(&self, fail: bool) {
        let mut net = self.net.lock().unwrap_or_else(|e| e.into_inner());
        net.fail_publish = fail;
    }

    /// Simulates a message arriving from the network side.
    pub fn inject_remote_message(
        &self,
        conversation_id: &ConversationId,
        sender: &InboxId,
        text: &str,
        sent_at_ms: u64,
    ) {
        let mut net = self.net.lock().unwrap_or_else(|e| e.into_inner());
        net.conversations
            .entry(conversation_id.value.clone())
            .or_default()
            .push(SentMessage {
                conversation_id: conversation_id.clone(),
                sender_inbox_id: sender.clone(),
                text: text.to_string(),
                sent_at_ms,
            });
    }

    pub fn sent_dms(&self) -> Vec<SentDm> {
        let net = self.net.lock().unwrap_or_else(|e| e.into_inner());
        net.dms.clone()
    }

    pub fn messages_in(&self, conversation_id: &ConversationId) -> Vec<SentMessage> {
        let net = self.net.lock().unwrap_or_else(|e| e.into_inner());
        net.conversations
            .get(&conversation_id.value)
            .cloned()
            .unwrap_or_default()
    }

    pub fn is_published(&self, conversation_id: &ConversationId) -> bool {
        let net = self.net.lock().unwrap_or_else(|e| e.into_inner());
        net.published.contains(&conversation_id.value)
    }

    pub fn consent_of(&self, conversation_id: &ConversationId, inbox: &InboxId) -> Option<Consent> {
        let net = self.net.lock().unwrap_or_else(|e| e.into_inner());
        net.consents
            .get(&(conversation_id.value.clone(), inbox.value.clone()))
            .copied()
    }

    fn make_client(&self, inbox_id: InboxId) -> Arc<dyn ProtocolClient> {
        Arc::new(InMemoryClient {
            net: self.net.clone(),
            inbox_id,
            db_connected: Mutex::new(true),
            db_deleted: Mutex::new(false),
        })
    }
}

#[async_trait]
impl ProtocolSdk for InMemoryProtocol {
    async fn build_client(
        &self,
        identity: &Identity,
    ) -> Result<Arc<dyn ProtocolClient>, CoreError> {
        {
            let net = self.net.lock().unwrap_or_else(|e| e.into_inner());
            if !net.cached_clients.contains(&identity.inbox_id.value) {
                return Err(CoreError::NotFound);
            }
        }
        Ok(self.make_client(identity.inbox_id.clone()))
    }

    async fn create_client(
        &self,
        identity: &Identity,
    ) -> Result<Arc<dyn ProtocolClient>, CoreError> {
        let inbox_id = {
            let mut net = self.net.lock().unwrap_or_else(|e| e.into_inner());
            let inbox = net
                .forced_inbox
                .take()
                .map(InboxId::new)
                .unwrap_or_else(|| identity.inbox_id.clone());
            net.cached_clients.insert(inbox.value.clone());
            inbox
        };
        Ok(self.make_client(inbox_id))
    }

    async fn newest_message_metadata(
        &self,
        conversation_ids: &[ConversationId],
    ) -> Result<Vec<MessageMetadata>, CoreError> {
        let net = self.net.lock().unwrap_or_else(|e| e.into_inner());
        Ok(conversation_ids
            .iter()
            .map(|id| MessageMetadata {
                conversation_id: id.clone(),
                newest_sent_at_ms: net
                    .conversations
                    .get(&id.value)
                    .and_then(|msgs| msgs.iter().map(|m| m.sent_at_ms).max()),
            })
            .collect())
    }
}

struct InMemoryClient {
    net: Arc<Mutex<Net>>,
    inbox_id: InboxId,
    db_connected: Mutex<bool>,
    db_deleted: Mutex<bool>,
}

#[async_trait]
impl ProtocolClient for InMemoryClient {
    fn inbox_id(&self) -> InboxId {
        self.inbox_id.clone()
    }

    async fn prepare_conversation(&self) -> Result<ConversationId, CoreError> {
        let id = ConversationId::new(Uuid::new_v4().to_string());
        let mut net = self.net.lock().unwrap_or_else(|e| e.into_inner());
        net.conversations.insert(id.value.clone(), Vec::new());
        Ok(id)
    }

    async fn publish_conversation(&self, id: &ConversationId) -> Result<(), CoreError> {
        let mut net = self.net.lock().unwrap_or_else(|e| e.into_inner());
        if net.fail_publish {
            return Err(CoreError::Protocol("publish".to_string()));
        }
        if !net.conversations.contains_key(&id.value) {
            return Err(CoreError::NotFound);
        }
        net.published.insert(id.value.clone());
        Ok(())
    }

    async fn send_text(&self, id: &ConversationId, text: &str) -> Result<(), CoreError> {
        let mut net = self.net.lock().unwrap_or_else(|e| e.into_inner());
        let messages = net
            .conversations
            .get_mut(&id.value)
            .ok_or(CoreError::NotFound)?;
        messages.push(SentMessage {
            conversation_id: id.clone(),
            sender_inbox_id: self.inbox_id.clone(),
            text: text.to_string(),
            sent_at_ms: now_ms(),
        });
        Ok(())
    }

    async fn send_dm(&self, peer: &InboxId, text: &str) -> Result<(), CoreError> {
        let mut net = self.net.lock().unwrap_or_else(|e| e.into_inner());
        net.dms.push(SentDm {
            from: self.inbox_id.clone(),
            to: peer.clone(),
            text: text.to_string(),
        });
        Ok(())
    }

    async fn update_consent(&self, id: &ConversationId, consent: Consent) -> Result<(), CoreError> {
        let mut net = self.net.lock().unwrap_or_else(|e| e.into_inner());
        net.consents
            .insert((id.value.clone(), self.inbox_id.value.clone()), consent);
        Ok(())
    }

    async fn connect_db(&self) -> Result<(), CoreError> {
        let mut guard = self.db_connected.lock().unwrap_or_else(|e| e.into_inner());
        *guard = true;
        Ok(())
    }

    async fn disconnect_db(&self) -> Result<(), CoreError> {
        let mut guard = self.db_connected.lock().unwrap_or_else(|e| e.into_inner());
        *guard = false;
        Ok(())
    }

    async fn delete_local_db(&self) -> Result<(), CoreError> {
        let mut guard = self.db_deleted.lock().unwrap_or_else(|e| e.into_inner());
        *guard = true;
        Ok(())
    }

    async fn decode_push(&self, payload: &serde_json::Value) -> Result<PushEvent, CoreError> {
        if let Some(welcome) = payload.get("welcome") {
            let conversation_id = welcome
                .get("conversation_id")
                .and_then(|v| v.as_str())
                .ok_or_else(|| CoreError::Protocol("welcome payload".to_string()))?;
            return Ok(PushEvent::Welcome {
                conversation_id: ConversationId::new(conversation_id),
                actionable: welcome
                    .get("actionable")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false),
            });
        }
        let conversation_id = payload
            .get("conversation_id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| CoreError::Protocol("message payload".to_string()))?;
        let sender = payload
            .get("sender_inbox_id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| CoreError::Protocol("message payload".to_string()))?;
        Ok(PushEvent::Message {
            conversation_id: ConversationId::new(conversation_id),
            sender_inbox_id: InboxId::new(sender),
            text: payload
                .get("text")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            sent_at_ms: payload
                .get("sent_at_ms")
                .and_then(|v| v.as_u64())
                .unwrap_or_else(now_ms),
        })
    }
}
