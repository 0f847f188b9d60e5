pub mod backend;
pub mod checker;
pub mod config;
pub mod conversation;
pub mod error;
pub mod event;
pub mod inbox;
pub mod keys;
pub mod lifecycle;
pub mod protocol;
pub mod push;
pub mod spare;
pub mod storage;
pub mod time;

#[cfg(test)]
mod tests;

use crate::backend::BackendApi;
use crate::checker::{CheckerHandle, MessageChecker};
use crate::config::CoreConfig;
use crate::conversation::{
    ConversationDeps, ConversationMachine, ConversationSnapshot, InviteErrorHub,
};
use crate::error::CoreError;
use crate::event::StateReceiver;
use crate::inbox::{InboxDeps, InboxMachine, InboxPhase, InboxSnapshot};
use crate::keys::{IdentityStore, SecretStore};
use crate::lifecycle::{InboxHost, LifecycleManager};
use crate::protocol::{ProtocolClient, ProtocolSdk};
use crate::push::{ClientProvider, PushDispatcher};
use crate::spare::{SpareCache, SpareFactory, SpareHandle};
use crate::storage::DurableStore;
use crate::time::now_ms;
use async_trait::async_trait;
use aviary_api::invite::SignedInvite;
use aviary_api::types::{
    ClientId, ConversationId, ConversationReadyResult, InboxId, NotificationOutcome,
};
use aviary_api::validation::{validate_client_id, validate_inbox_id, ValidationLimits};
use log::warn;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Owns the machine maps and implements the narrow traits the managers
/// need, so none of them has to hold the fleet itself.
struct Host {
    deps: InboxDeps,
    invite_errors: InviteErrorHub,
    machines: Mutex<HashMap<String, Arc<InboxMachine>>>,
    conversations: Mutex<HashMap<String, Arc<ConversationMachine>>>,
}

impl Host {
    fn machine(&self, client_id: &ClientId) -> Arc<InboxMachine> {
        let mut machines = self.machines.lock().unwrap_or_else(|e| e.into_inner());
        machines
            .entry(client_id.value.clone())
            .or_insert_with(|| InboxMachine::spawn(client_id.clone(), self.deps.clone()))
            .clone()
    }

    fn conversation(&self, client_id: &ClientId) -> Arc<ConversationMachine> {
        let inbox = self.machine(client_id);
        let mut conversations = self
            .conversations
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        conversations
            .entry(client_id.value.clone())
            .or_insert_with(|| {
                ConversationMachine::spawn(ConversationDeps {
                    store: self.deps.store.clone(),
                    inbox,
                    identities: self.deps.identities.clone(),
                    invite_errors: self.invite_errors.clone(),
                    config: self.deps.config.clone(),
                })
            })
            .clone()
    }

    fn forget(&self, client_id: &ClientId) {
        let mut machines = self.machines.lock().unwrap_or_else(|e| e.into_inner());
        machines.remove(&client_id.value);
        let mut conversations = self
            .conversations
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        conversations.remove(&client_id.value);
    }
}

#[async_trait]
impl InboxHost for Host {
    async fn bring_up(&self, client_id: &ClientId, inbox_id: &InboxId) -> Result<(), CoreError> {
        let machine = self.machine(client_id);
        if machine.current().phase == InboxPhase::Ready {
            return Ok(());
        }
        machine.authorize(inbox_id.clone()).await
    }

    async fn tear_down(&self, client_id: &ClientId) -> Result<(), CoreError> {
        let machine = {
            let machines = self.machines.lock().unwrap_or_else(|e| e.into_inner());
            machines.get(&client_id.value).cloned()
        };
        match machine {
            Some(machine) => machine.stop().await,
            None => Ok(()),
        }
    }
}

#[async_trait]
impl SpareFactory for Host {
    async fn create_inbox(&self) -> Result<(ClientId, InboxId), CoreError> {
        let client_id = ClientId::generate();
        let machine = self.machine(&client_id);
        let inbox_id = machine.register().await?;
        Ok((client_id, inbox_id))
    }

    async fn create_conversation(
        &self,
        client_id: &ClientId,
    ) -> Result<ConversationId, CoreError> {
        let conversation = self.conversation(client_id);
        let result = conversation.create().await?;
        Ok(result.conversation_id)
    }

    async fn discard(&self, client_id: &ClientId) {
        let machine = self.machine(client_id);
        if let Err(err) = machine.delete().await {
            warn!("discarding spare {client_id}: {err}");
        }
        self.forget(client_id);
    }
}

/// Push-path client lookup. Bring-up goes through the scheduler so a
/// sleeping inbox moves into the awake set (evicting if it must) instead
/// of coming up on the side with the partition none the wiser.
struct FleetClients {
    host: Arc<Host>,
    lifecycle: Arc<LifecycleManager>,
}

#[async_trait]
impl ClientProvider for FleetClients {
    async fn client_for(
        &self,
        client_id: &ClientId,
        inbox_id: &InboxId,
    ) -> Result<Arc<dyn ProtocolClient>, CoreError> {
        let machine = self.host.machine(client_id);
        if let Some(client) = machine.client() {
            return Ok(client);
        }
        self.lifecycle.wake(client_id, inbox_id, "push").await?;
        machine
            .client()
            .ok_or_else(|| CoreError::Consistency("ready without client".to_string()))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FleetStats {
    pub awake: usize,
    pub sleeping: usize,
    pub spare_ready: bool,
}

/// Entry point for the whole fleet: per-inbox and per-conversation
/// operations, the scheduler, the spare cache, the sleeping-inbox
/// checker, and push dispatch, over one shared set of collaborators.
pub struct Fleet {
    config: CoreConfig,
    identities: IdentityStore,
    store: DurableStore,
    host: Arc<Host>,
    lifecycle: Arc<LifecycleManager>,
    spare: Arc<SpareCache>,
    checker: Arc<MessageChecker>,
    push: PushDispatcher,
    invite_errors: InviteErrorHub,
    checker_handle: Mutex<Option<CheckerHandle>>,
}

impl Fleet {
    pub fn new(
        config: CoreConfig,
        secret: Arc<dyn SecretStore>,
        store: DurableStore,
        sdk: Arc<dyn ProtocolSdk>,
        backend: Arc<dyn BackendApi>,
    ) -> Arc<Self> {
        let identities = IdentityStore::new(secret.clone());
        let invite_errors = InviteErrorHub::new();
        let host = Arc::new(Host {
            deps: InboxDeps {
                identities: identities.clone(),
                store: store.clone(),
                sdk: sdk.clone(),
                backend,
                config: config.clone(),
            },
            invite_errors: invite_errors.clone(),
            machines: Mutex::new(HashMap::new()),
            conversations: Mutex::new(HashMap::new()),
        });
        let lifecycle = LifecycleManager::new(host.clone(), store.clone(), config.clone());
        let spare = SpareCache::new(
            secret,
            identities.clone(),
            store.clone(),
            host.clone(),
            config.clone(),
        );
        let checker = MessageChecker::new(sdk, store.clone(), lifecycle.clone(), &config);
        let push = PushDispatcher::new(
            identities.clone(),
            store.clone(),
            Arc::new(FleetClients {
                host: host.clone(),
                lifecycle: lifecycle.clone(),
            }),
        );
        Arc::new(Self {
            config,
            identities,
            store,
            host,
            lifecycle,
            spare,
            checker,
            push,
            invite_errors,
            checker_handle: Mutex::new(None),
        })
    }

    /// Starts the background pieces: the periodic checker and the first
    /// spare warm-up.
    pub fn start(self: &Arc<Self>) {
        let mut handle = self
            .checker_handle
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if handle.is_none() {
            *handle = Some(self.checker.start());
        }
        drop(handle);
        self.spare.schedule_warm();
    }

    pub fn lifecycle(&self) -> &Arc<LifecycleManager> {
        &self.lifecycle
    }

    pub fn spare(&self) -> &Arc<SpareCache> {
        &self.spare
    }

    pub fn checker(&self) -> &Arc<MessageChecker> {
        &self.checker
    }

    // --- per-inbox ---

    pub async fn authorize(
        &self,
        client_id: &ClientId,
        inbox_id: &InboxId,
    ) -> Result<(), CoreError> {
        let limits = ValidationLimits::default();
        validate_client_id(client_id, &limits)
            .and_then(|_| validate_inbox_id(inbox_id, &limits))
            .map_err(|err| CoreError::Validation(err.to_string()))?;
        self.lifecycle.wake(client_id, inbox_id, "authorize").await
    }

    pub async fn register(&self, client_id: &ClientId) -> Result<InboxId, CoreError> {
        validate_client_id(client_id, &ValidationLimits::default())
            .map_err(|err| CoreError::Validation(err.to_string()))?;
        let machine = self.host.machine(client_id);
        let inbox_id = machine.register().await?;
        // Registration brought the machine up already; this only enters it
        // into the awake set. With no room, the machine cannot stay up
        // outside the partition, so it goes straight to sleep.
        if let Err(err) = self.lifecycle.wake(client_id, &inbox_id, "register").await {
            if let Err(stop_err) = machine.stop().await {
                warn!("stopping {client_id} after refused wake: {stop_err}");
            }
            self.lifecycle.mark_sleeping(client_id).await;
            return Err(err);
        }
        Ok(inbox_id)
    }

    pub async fn stop(&self, client_id: &ClientId) -> Result<(), CoreError> {
        self.lifecycle.sleep(client_id).await
    }

    /// Deletes the inbox end to end and drops it from scheduling. Safe to
    /// call twice.
    pub async fn delete(&self, client_id: &ClientId) -> Result<(), CoreError> {
        let conversation = {
            let conversations = self
                .host
                .conversations
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            conversations.get(&client_id.value).cloned()
        };
        if let Some(conversation) = conversation {
            if let Err(err) = conversation.delete().await {
                warn!("deleting conversation state for {client_id}: {err}");
            }
        }
        self.host.machine(client_id).delete().await?;
        self.lifecycle.force_remove(client_id).await;
        self.host.forget(client_id);
        Ok(())
    }

    /// Pauses the inbox without leaving the awake set; database sync is
    /// resumed by `enter_foreground`.
    pub async fn enter_background(&self, client_id: &ClientId) -> Result<(), CoreError> {
        self.host.machine(client_id).enter_background().await
    }

    pub async fn enter_foreground(&self, client_id: &ClientId) -> Result<(), CoreError> {
        self.host.machine(client_id).enter_foreground().await
    }

    pub fn observe_inbox(&self, client_id: &ClientId) -> StateReceiver<InboxSnapshot> {
        self.host.machine(client_id).subscribe()
    }

    pub async fn wait_for_ready(&self, client_id: &ClientId) -> Result<(), CoreError> {
        let timeout = Duration::from_millis(self.config.ready_timeout_ms);
        self.host.machine(client_id).wait_for_ready(timeout).await
    }

    // --- per-conversation ---

    pub async fn create_conversation(
        &self,
        client_id: &ClientId,
    ) -> Result<ConversationReadyResult, CoreError> {
        self.host.conversation(client_id).create().await
    }

    /// Reopens a conversation this client already holds locally, as after
    /// a process restart.
    pub async fn use_existing_conversation(
        &self,
        client_id: &ClientId,
        conversation_id: ConversationId,
    ) -> Result<ConversationReadyResult, CoreError> {
        self.host
            .conversation(client_id)
            .use_existing(conversation_id)
            .await
    }

    pub async fn join_conversation(
        &self,
        client_id: &ClientId,
        code: &str,
    ) -> Result<ConversationReadyResult, CoreError> {
        self.host.conversation(client_id).join_with_code(code).await
    }

    pub fn send_message(&self, client_id: &ClientId, text: &str) -> Result<(), CoreError> {
        self.host.conversation(client_id).send_message(text)
    }

    pub async fn delete_conversation(&self, client_id: &ClientId) -> Result<(), CoreError> {
        self.host.conversation(client_id).delete().await
    }

    /// Abandons a failed or half-finished attempt and returns the machine
    /// to its starting phase.
    pub async fn reset_conversation(&self, client_id: &ClientId) -> Result<(), CoreError> {
        self.host.conversation(client_id).reset().await
    }

    pub fn observe_conversation(
        &self,
        client_id: &ClientId,
    ) -> StateReceiver<ConversationSnapshot> {
        self.host.conversation(client_id).subscribe()
    }

    /// Fresh signed invite for a conversation this client owns.
    pub fn invite_for(
        &self,
        client_id: &ClientId,
        conversation_id: &ConversationId,
    ) -> Result<String, CoreError> {
        let row = self
            .store
            .conversation(conversation_id)
            .ok_or(CoreError::NotFound)?;
        if row.client_id != client_id.value {
            return Err(CoreError::Consistency(
                "conversation belongs to another client".to_string(),
            ));
        }
        let identity = self.identities.by_client(client_id)?;
        let key = identity.signing_key()?;
        let now = now_ms();
        let invite = SignedInvite::sign(
            &key,
            conversation_id.value.clone(),
            now + self.config.invite_ttl_ms,
            now + self.config.conversation_ttl_ms,
        )?;
        Ok(invite.encode()?)
    }

    /// Inviter-reported failure for an in-flight join, delivered to the
    /// single registered handler.
    pub fn report_invite_error(&self, tag: &str, message: &str) -> bool {
        self.invite_errors
            .deliver(tag, CoreError::Protocol(message.to_string()))
    }

    // --- fleet ---

    /// Hands out a pre-warmed inbox when one exists, registering a fresh
    /// one otherwise, and enters it into the awake set.
    pub async fn create_new_inbox(&self) -> Result<(ClientId, InboxId), CoreError> {
        let handle = self.spare.consume_inbox_only().await?;
        self.lifecycle
            .wake(&handle.client_id, &handle.inbox_id, "new inbox")
            .await?;
        Ok((handle.client_id, handle.inbox_id))
    }

    /// Spare-backed instant conversation: inbox and published conversation
    /// ready before the caller asked.
    pub async fn instant_conversation(&self) -> Result<SpareHandle, CoreError> {
        let handle = self.spare.consume_or_create_conversation().await?;
        self.lifecycle
            .wake(&handle.client_id, &handle.inbox_id, "instant conversation")
            .await?;
        Ok(handle)
    }

    pub async fn wake(&self, client_id: &ClientId, inbox_id: &InboxId) -> Result<(), CoreError> {
        self.lifecycle.wake(client_id, inbox_id, "caller").await
    }

    pub async fn sleep(&self, client_id: &ClientId) -> Result<(), CoreError> {
        self.lifecycle.sleep(client_id).await
    }

    pub async fn rebalance(&self) -> Result<(), CoreError> {
        self.lifecycle.rebalance().await
    }

    pub async fn initialize_on_app_launch(&self) -> Result<(), CoreError> {
        self.lifecycle.initialize_on_app_launch().await
    }

    pub async fn set_active_client(&self, client_id: Option<ClientId>) {
        self.lifecycle.set_active_client(client_id).await
    }

    pub async fn stop_all(&self) -> Result<(), CoreError> {
        if let Some(handle) = self
            .checker_handle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            handle.stop();
        }
        self.lifecycle.stop_all().await
    }

    // --- push ---

    pub async fn handle_push(
        &self,
        payload: &serde_json::Value,
    ) -> Result<NotificationOutcome, CoreError> {
        self.push.handle(payload).await
    }

    pub async fn stats(&self) -> FleetStats {
        FleetStats {
            awake: self.lifecycle.awake_clients().await.len(),
            sleeping: self.lifecycle.sleeping_clients().await.len(),
            spare_ready: self.spare.has_spare().await,
        }
    }
}
