use crate::config::CoreConfig;
use crate::error::CoreError;
use crate::keys::{IdentityStore, SecretStore};
use crate::storage::DurableStore;
use async_trait::async_trait;
use aviary_api::types::{ClientId, ConversationId, InboxId};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};

const SPARE_ACCOUNT: &str = "unused-inbox";

/// Creates the resources a spare is made of. Implemented by the fleet
/// owner; the cache itself never touches machines directly.
#[async_trait]
pub trait SpareFactory: Send + Sync {
    /// Registers a brand-new inbox and brings it fully up.
    async fn create_inbox(&self) -> Result<(ClientId, InboxId), CoreError>;
    /// Creates and publishes a conversation on an already-ready inbox,
    /// with a generated invite, flagged unused in durable storage.
    async fn create_conversation(&self, client_id: &ClientId)
        -> Result<ConversationId, CoreError>;
    /// Best-effort teardown of a spare that will never be handed out.
    async fn discard(&self, client_id: &ClientId);
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SpareHandle {
    pub client_id: ClientId,
    pub inbox_id: InboxId,
    pub conversation_id: Option<ConversationId>,
}

#[derive(Default)]
struct Inner {
    handle: Option<SpareHandle>,
    creating: bool,
}

/// At most one pre-warmed inbox (optionally with a published conversation)
/// held for instant handoff. The secret-store pointer is the single source
/// of truth; the in-memory handle is a cache of it, and every consumption
/// path clears both under one lock before any further awaited work.
pub struct SpareCache {
    secret: Arc<dyn SecretStore>,
    identities: IdentityStore,
    store: DurableStore,
    factory: Arc<dyn SpareFactory>,
    config: CoreConfig,
    inner: Mutex<Inner>,
    created: Notify,
}

impl SpareCache {
    pub fn new(
        secret: Arc<dyn SecretStore>,
        identities: IdentityStore,
        store: DurableStore,
        factory: Arc<dyn SpareFactory>,
        config: CoreConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            secret,
            identities,
            store,
            factory,
            config,
            inner: Mutex::new(Inner::default()),
            created: Notify::new(),
        })
    }

    /// Claims the spare, creating one inline when none exists. The handle
    /// always carries a conversation; an inbox-only spare gets its
    /// conversation created on the way out.
    pub async fn consume_or_create_conversation(
        self: &Arc<Self>,
    ) -> Result<SpareHandle, CoreError> {
        let claimed = self.claim().await?;
        let mut handle = match claimed {
            Some(handle) => handle,
            None => self.create_fresh().await?,
        };
        if handle.conversation_id.is_none() {
            handle.conversation_id =
                Some(self.factory.create_conversation(&handle.client_id).await?);
        }
        if let Some(conversation_id) = handle.conversation_id.as_ref() {
            if let Err(err) = self.store.set_conversation_unused(conversation_id, false) {
                debug!("spare: clearing unused flag on {conversation_id}: {err}");
            }
        }
        self.schedule_warm();
        Ok(handle)
    }

    /// Claims the spare inbox without requiring a conversation; a spare
    /// conversation that came with it is left flagged unused for later
    /// divergence checks to discard.
    pub async fn consume_inbox_only(self: &Arc<Self>) -> Result<SpareHandle, CoreError> {
        let claimed = self.claim().await?;
        let handle = match claimed {
            Some(handle) => handle,
            None => self.create_fresh().await?,
        };
        self.schedule_warm();
        Ok(handle)
    }

    /// Kicks off background creation when no spare exists. Idempotent:
    /// at most one creation runs at a time.
    pub fn schedule_warm(self: &Arc<Self>) {
        if !self.config.spare_enabled {
            return;
        }
        let cache = self.clone();
        tokio::spawn(async move {
            cache.warm().await;
        });
    }

    pub async fn warm(self: &Arc<Self>) {
        if !self.config.spare_enabled {
            return;
        }
        {
            let mut inner = self.inner.lock().await;
            if inner.creating {
                return;
            }
            if inner.handle.is_some() || self.validated_pointer(&mut inner).is_some() {
                return;
            }
            inner.creating = true;
        }
        let result = self.build_spare().await;
        let mut inner = self.inner.lock().await;
        inner.creating = false;
        match result {
            Ok(handle) => {
                if let Err(err) = self.write_pointer(&handle) {
                    warn!("spare: persisting pointer: {err}");
                }
                info!(
                    "spare: warmed inbox {} (conversation: {})",
                    handle.client_id,
                    handle.conversation_id.is_some()
                );
                inner.handle = Some(handle);
            }
            Err(err) => {
                warn!("spare: background creation failed: {err}");
            }
        }
        drop(inner);
        self.created.notify_waiters();
    }

    pub async fn has_spare(&self) -> bool {
        let mut inner = self.inner.lock().await;
        inner.handle.is_some() || self.validated_pointer(&mut inner).is_some()
    }

    /// Atomic claim: handle and pointer are cleared under the lock, before
    /// any await, so a second concurrent consumer can never receive the
    /// same spare. An in-flight background creation is waited on rather
    /// than raced.
    async fn claim(&self) -> Result<Option<SpareHandle>, CoreError> {
        loop {
            let mut inner = self.inner.lock().await;
            if inner.creating {
                // Arm the notification before releasing the lock so a warm
                // finishing in between cannot be missed.
                let notified = self.created.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                drop(inner);
                notified.await;
                continue;
            }
            let handle = inner
                .handle
                .take()
                .or_else(|| self.validated_pointer(&mut inner));
            self.secret.delete(SPARE_ACCOUNT)?;
            return Ok(handle);
        }
    }

    /// Reads the pointer and checks it against durable state. A pointer
    /// whose conversation row is missing, claimed, or foreign — or whose
    /// identity is gone — is discarded, never silently reused.
    fn validated_pointer(&self, inner: &mut Inner) -> Option<SpareHandle> {
        let raw = self.secret.get(SPARE_ACCOUNT)?;
        let handle: SpareHandle = match serde_json::from_str(&raw) {
            Ok(handle) => handle,
            Err(_) => {
                warn!("spare: unreadable pointer discarded");
                self.discard_pointer(inner, None);
                return None;
            }
        };
        if self.identities.by_client(&handle.client_id).is_err() {
            warn!("spare: pointer to {} has no identity, discarded", handle.client_id);
            self.discard_pointer(inner, Some(handle.client_id));
            return None;
        }
        if let Some(conversation_id) = handle.conversation_id.as_ref() {
            let row = self.store.conversation(conversation_id);
            let usable = row
                .map(|row| row.unused && row.client_id == handle.client_id.value)
                .unwrap_or(false);
            if !usable {
                warn!(
                    "spare: pointer conversation {conversation_id} diverged from storage, discarded"
                );
                self.discard_pointer(inner, Some(handle.client_id));
                return None;
            }
        }
        Some(handle)
    }

    fn discard_pointer(&self, _inner: &mut Inner, orphan: Option<ClientId>) {
        if let Err(err) = self.secret.delete(SPARE_ACCOUNT) {
            warn!("spare: deleting stale pointer: {err}");
        }
        if let Some(client_id) = orphan {
            let factory = self.factory.clone();
            tokio::spawn(async move {
                factory.discard(&client_id).await;
            });
        }
    }

    fn write_pointer(&self, handle: &SpareHandle) -> Result<(), CoreError> {
        let json = serde_json::to_string(handle).map_err(|_| CoreError::Storage)?;
        self.secret.set(SPARE_ACCOUNT, &json)
    }

    async fn create_fresh(&self) -> Result<SpareHandle, CoreError> {
        let (client_id, inbox_id) = self.factory.create_inbox().await?;
        Ok(SpareHandle {
            client_id,
            inbox_id,
            conversation_id: None,
        })
    }

    /// Partial failure keeps the inbox as a valid inbox-only spare instead
    /// of discarding it.
    async fn build_spare(&self) -> Result<SpareHandle, CoreError> {
        let (client_id, inbox_id) = self.factory.create_inbox().await?;
        let conversation_id = match self.factory.create_conversation(&client_id).await {
            Ok(conversation_id) => {
                if let Err(err) = self.store.set_conversation_unused(&conversation_id, true) {
                    debug!("spare: flagging {conversation_id} unused: {err}");
                }
                Some(conversation_id)
            }
            Err(err) => {
                warn!("spare: conversation for {client_id} failed, keeping inbox-only: {err}");
                None
            }
        };
        Ok(SpareHandle {
            client_id,
            inbox_id,
            conversation_id,
        })
    }
}
