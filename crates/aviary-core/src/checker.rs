use crate::config::CoreConfig;
use crate::lifecycle::LifecycleManager;
use crate::protocol::ProtocolSdk;
use crate::storage::DurableStore;
use aviary_api::types::{ClientId, ConversationId};
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// Periodic sweep over sleeping inboxes. Uses the SDK's client-less
/// newest-message query, so a sweep over a fully quiet fleet instantiates
/// nothing.
pub struct MessageChecker {
    sdk: Arc<dyn ProtocolSdk>,
    store: DurableStore,
    lifecycle: Arc<LifecycleManager>,
    interval: Duration,
    trigger: Notify,
}

pub struct CheckerHandle {
    checker: Arc<MessageChecker>,
    task: JoinHandle<()>,
}

impl CheckerHandle {
    /// Out-of-schedule sweep, used on app-foreground transitions.
    pub fn trigger(&self) {
        self.checker.trigger.notify_one();
    }

    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for CheckerHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl MessageChecker {
    pub fn new(
        sdk: Arc<dyn ProtocolSdk>,
        store: DurableStore,
        lifecycle: Arc<LifecycleManager>,
        config: &CoreConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            sdk,
            store,
            lifecycle,
            interval: Duration::from_millis(config.checker_interval_ms.max(1)),
            trigger: Notify::new(),
        })
    }

    pub fn start(self: &Arc<Self>) -> CheckerHandle {
        let checker = self.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(checker.interval) => {}
                    _ = checker.trigger.notified() => {}
                }
                checker.sweep().await;
            }
        });
        CheckerHandle {
            checker: self.clone(),
            task,
        }
    }

    /// One pass: wake every sleeping inbox whose newest remote message
    /// postdates its recorded sleep time.
    pub async fn sweep(&self) {
        for client_id in self.lifecycle.sleeping_clients().await {
            let slept_at = match self.lifecycle.sleep_time_of(&client_id).await {
                Some(at) => at,
                // Raced a wake between the two reads; nothing to do.
                None => continue,
            };
            match self.newest_for(&client_id).await {
                Ok(Some(newest)) if newest > slept_at => {
                    info!("checker: {client_id} has mail from {newest}, waking");
                    self.promote(&client_id).await;
                }
                Ok(_) => {}
                Err(err) => {
                    warn!("checker: metadata query for {client_id} failed: {err}");
                }
            }
        }
    }

    async fn newest_for(&self, client_id: &ClientId) -> Result<Option<u64>, crate::error::CoreError> {
        let conversation_ids: Vec<ConversationId> = self
            .store
            .conversations_for_client(client_id)
            .into_iter()
            .filter(|row| row.joined)
            .map(|row| ConversationId::new(row.conversation_id))
            .collect();
        if conversation_ids.is_empty() {
            return Ok(None);
        }
        let metadata = self.sdk.newest_message_metadata(&conversation_ids).await?;
        Ok(metadata
            .into_iter()
            .filter_map(|m| m.newest_sent_at_ms)
            .max())
    }

    async fn promote(&self, client_id: &ClientId) {
        let inbox_id = match self.store.activity_for(client_id) {
            Some(record) => record.inbox_id,
            None => {
                debug!("checker: no activity record for {client_id}, skipping wake");
                return;
            }
        };
        if let Err(err) = self.lifecycle.wake(client_id, &inbox_id, "checker").await {
            warn!("checker: wake of {client_id} failed: {err}");
        }
    }
}
