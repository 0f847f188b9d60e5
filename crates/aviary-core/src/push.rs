use crate::error::CoreError;
use crate::inbox::topic_key;
use crate::keys::IdentityStore;
use crate::protocol::{ProtocolClient, PushEvent};
use crate::storage::{ConversationRow, DurableStore, MessageRow};
use crate::time::now_ms;
use async_trait::async_trait;
use aviary_api::types::{
    ClientId, Consent, ConversationId, DecodedNotification, InboxId, MessageId,
    NotificationOutcome,
};
use log::{debug, warn};
use serde_json::json;
use std::sync::Arc;

/// Hands out a live protocol client for an inbox, waking it first when it
/// is asleep. Implemented by the fleet owner.
#[async_trait]
pub trait ClientProvider: Send + Sync {
    async fn client_for(
        &self,
        client_id: &ClientId,
        inbox_id: &InboxId,
    ) -> Result<Arc<dyn ProtocolClient>, CoreError>;
}

/// Notification entry point: opaque payload in, decoded notification or
/// "dropped" out. Self-sent messages, spam DMs, and non-actionable
/// welcomes produce no visible effect.
pub struct PushDispatcher {
    identities: IdentityStore,
    store: DurableStore,
    provider: Arc<dyn ClientProvider>,
}

impl PushDispatcher {
    pub fn new(
        identities: IdentityStore,
        store: DurableStore,
        provider: Arc<dyn ClientProvider>,
    ) -> Self {
        Self {
            identities,
            store,
            provider,
        }
    }

    pub async fn handle(
        &self,
        payload: &serde_json::Value,
    ) -> Result<NotificationOutcome, CoreError> {
        let (client_id, inbox_id) = self.resolve(payload)?;
        let client = self.provider.client_for(&client_id, &inbox_id).await?;
        let event = client.decode_push(payload).await?;
        match event {
            PushEvent::Message {
                conversation_id,
                sender_inbox_id,
                text,
                sent_at_ms,
            } => {
                self.handle_message(
                    &client_id,
                    &inbox_id,
                    conversation_id,
                    sender_inbox_id,
                    text,
                    sent_at_ms,
                )
                .await
            }
            PushEvent::Welcome {
                conversation_id,
                actionable,
            } => self.handle_welcome(&client_id, conversation_id, actionable),
        }
    }

    /// The payload names its delivery topic; the topic maps back to the
    /// owning client through the local-state row written at bring-up, with
    /// the identity index as fallback for inboxes this process has not
    /// brought up yet.
    fn resolve(&self, payload: &serde_json::Value) -> Result<(ClientId, InboxId), CoreError> {
        let topic = payload
            .get("topic")
            .and_then(|v| v.as_str())
            .ok_or_else(|| CoreError::Protocol("payload without topic".to_string()))?;
        let inbox_value = topic
            .strip_prefix("inbox/")
            .ok_or_else(|| CoreError::Protocol(format!("unroutable topic {topic}")))?;
        let inbox_id = InboxId::new(inbox_value);
        if let Some(client_value) = self.store.local(&topic_key(topic)) {
            return Ok((ClientId::new(client_value), inbox_id));
        }
        let identity = self.identities.by_inbox(&inbox_id)?;
        Ok((identity.client_id, inbox_id))
    }

    async fn handle_message(
        &self,
        client_id: &ClientId,
        own_inbox: &InboxId,
        conversation_id: ConversationId,
        sender: InboxId,
        text: String,
        sent_at_ms: u64,
    ) -> Result<NotificationOutcome, CoreError> {
        if sender == *own_inbox {
            debug!("push: self-sent message in {conversation_id}, dropped");
            return Ok(NotificationOutcome::Dropped);
        }
        if self.is_spam(&conversation_id, &sender) {
            debug!("push: spam dm from {sender} in {conversation_id}, dropped");
            return Ok(NotificationOutcome::Dropped);
        }
        let row = MessageRow {
            message_id: MessageId::random().value,
            conversation_id: conversation_id.value.clone(),
            client_id: client_id.value.clone(),
            sender_inbox_id: sender.value.clone(),
            text: text.clone(),
            timestamp_ms: sent_at_ms,
        };
        if let Err(err) = self.store.insert_message(row) {
            warn!("push: recording inbound message: {err}");
        }
        if let Err(err) = self.store.record_activity(client_id, now_ms()) {
            debug!("push: activity bump skipped: {err}");
        }
        Ok(NotificationOutcome::Decoded(DecodedNotification {
            title: short_sender(&sender),
            body: text,
            conversation_id: Some(conversation_id.clone()),
            user_info: json!({
                "client_id": client_id.value,
                "conversation_id": conversation_id.value,
            }),
        }))
    }

    /// A conversation the client has denied, or a first contact from a
    /// sender with no member row, is spam.
    fn is_spam(&self, conversation_id: &ConversationId, sender: &InboxId) -> bool {
        match self.store.conversation(conversation_id) {
            Some(row) => row.consent == Consent::Denied,
            None => self.store.member(conversation_id, sender).is_none(),
        }
    }

    /// An actionable welcome completes a pending join: the joined row it
    /// writes (carrying the pending invite's tag) is what releases the
    /// conversation machine's blocking wait.
    fn handle_welcome(
        &self,
        client_id: &ClientId,
        conversation_id: ConversationId,
        actionable: bool,
    ) -> Result<NotificationOutcome, CoreError> {
        if !actionable {
            debug!("push: non-actionable welcome for {conversation_id}, dropped");
            return Ok(NotificationOutcome::Dropped);
        }
        let tag = self.store.pending_invite_tag(client_id);
        self.store.upsert_conversation(ConversationRow {
            conversation_id: conversation_id.value.clone(),
            client_id: client_id.value.clone(),
            invite_tag: tag,
            unused: false,
            joined: true,
            consent: Consent::Allowed,
            created_at_ms: now_ms(),
        })?;
        Ok(NotificationOutcome::Decoded(DecodedNotification {
            title: "New conversation".to_string(),
            body: String::new(),
            conversation_id: Some(conversation_id.clone()),
            user_info: json!({
                "client_id": client_id.value,
                "conversation_id": conversation_id.value,
            }),
        }))
    }
}

fn short_sender(sender: &InboxId) -> String {
    let mut value = sender.value.clone();
    value.truncate(8);
    value
}
