use crate::config::CoreConfig;
use crate::error::CoreError;
use crate::storage::DurableStore;
use crate::time::now_ms;
use async_trait::async_trait;
use aviary_api::types::{ClientId, InboxActivity, InboxId};
use log::{debug, info, warn};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;

/// What the lifecycle manager asks of whoever owns the machines: bring an
/// inbox's resources up, or tear them down. The manager itself holds no
/// machine handles.
#[async_trait]
pub trait InboxHost: Send + Sync {
    async fn bring_up(&self, client_id: &ClientId, inbox_id: &InboxId) -> Result<(), CoreError>;
    async fn tear_down(&self, client_id: &ClientId) -> Result<(), CoreError>;
}

#[derive(Default)]
struct Sets {
    awake: HashSet<String>,
    sleeping: HashMap<String, u64>,
    active: Option<String>,
}

/// Fleet scheduler. All mutations run under one async mutex (single-writer
/// discipline); eviction re-checks protection under the same lock, so
/// concurrent rebalance and wake calls cannot evict a protected inbox.
pub struct LifecycleManager {
    host: Arc<dyn InboxHost>,
    store: DurableStore,
    config: CoreConfig,
    sets: Mutex<Sets>,
}

fn sleep_time_key(client_value: &str) -> String {
    format!("sleep-at:{client_value}")
}

impl LifecycleManager {
    pub fn new(host: Arc<dyn InboxHost>, store: DurableStore, config: CoreConfig) -> Arc<Self> {
        Arc::new(Self {
            host,
            store,
            config,
            sets: Mutex::new(Sets::default()),
        })
    }

    pub async fn is_awake(&self, client_id: &ClientId) -> bool {
        let sets = self.sets.lock().await;
        sets.awake.contains(&client_id.value)
    }

    pub async fn awake_clients(&self) -> Vec<ClientId> {
        let sets = self.sets.lock().await;
        sets.awake.iter().map(|v| ClientId::new(v.clone())).collect()
    }

    pub async fn sleeping_clients(&self) -> Vec<ClientId> {
        let sets = self.sets.lock().await;
        sets.sleeping
            .keys()
            .map(|v| ClientId::new(v.clone()))
            .collect()
    }

    pub async fn sleep_time_of(&self, client_id: &ClientId) -> Option<u64> {
        let sets = self.sets.lock().await;
        sets.sleeping.get(&client_id.value).copied()
    }

    pub async fn set_active_client(&self, client_id: Option<ClientId>) {
        let mut sets = self.sets.lock().await;
        sets.active = client_id.map(|c| c.value);
    }

    /// No-op when already awake. At capacity, tries to free a slot by
    /// evicting the least-recently-used unprotected inbox; a target with a
    /// pending invite is woken even when nothing can be evicted, which may
    /// transiently exceed the cap.
    pub async fn wake(
        &self,
        client_id: &ClientId,
        inbox_id: &InboxId,
        reason: &str,
    ) -> Result<(), CoreError> {
        let mut sets = self.sets.lock().await;
        if sets.awake.contains(&client_id.value) {
            return Ok(());
        }
        if sets.awake.len() >= self.config.max_awake_inboxes {
            match self.eviction_candidate(&sets) {
                Some(victim) => {
                    debug!("lifecycle: evicting {victim} to wake {client_id} ({reason})");
                    self.sleep_locked(&mut sets, &victim).await;
                }
                None if self.store.has_pending_invite(client_id) => {
                    info!(
                        "lifecycle: waking {client_id} over capacity for pending invite ({reason})"
                    );
                }
                None => return Err(CoreError::Capacity),
            }
        }
        self.wake_locked(&mut sets, client_id, inbox_id).await
    }

    /// Refused while the inbox holds a pending invite; invites can arrive
    /// after waking, so the check belongs here too, not only at wake time.
    pub async fn sleep(&self, client_id: &ClientId) -> Result<(), CoreError> {
        let mut sets = self.sets.lock().await;
        if self.store.has_pending_invite(client_id) {
            debug!("lifecycle: sleep of {client_id} refused, pending invite");
            return Ok(());
        }
        self.sleep_locked(&mut sets, &client_id.value).await;
        Ok(())
    }

    /// Recomputes the ideal awake set from activity recency plus
    /// protections, then converges toward it. Safe to call repeatedly; a
    /// second call with no activity change performs no transitions.
    pub async fn rebalance(&self) -> Result<(), CoreError> {
        let mut sets = self.sets.lock().await;
        let ideal = self.ideal_awake_set(sets.active.as_deref());
        let to_sleep: Vec<String> = sets
            .awake
            .iter()
            .filter(|v| !ideal.contains_key(*v))
            .cloned()
            .collect();
        for victim in to_sleep {
            if self.protected(&sets, &victim) {
                continue;
            }
            self.sleep_locked(&mut sets, &victim).await;
        }
        let to_wake: Vec<(String, InboxId)> = ideal
            .iter()
            .filter(|(v, _)| !sets.awake.contains(*v))
            .map(|(v, inbox)| (v.clone(), inbox.clone()))
            .collect();
        for (value, inbox_id) in to_wake {
            let client_id = ClientId::new(value);
            if let Err(err) = self.wake_locked(&mut sets, &client_id, &inbox_id).await {
                warn!("lifecycle: rebalance wake of {client_id} failed: {err}");
            }
        }
        Ok(())
    }

    /// Reconstructs the awake/sleeping partition from durable records.
    /// Inboxes beyond capacity with no pending invite are marked sleeping
    /// without ever having been woken; their sleep time is the persisted
    /// one from the previous run when available.
    pub async fn initialize_on_app_launch(&self) -> Result<(), CoreError> {
        let mut sets = self.sets.lock().await;
        let ideal = self.ideal_awake_set(sets.active.as_deref());
        for record in self.store.activity_records() {
            let value = record.client_id.value.clone();
            if ideal.contains_key(&value) {
                if let Err(err) = self
                    .wake_locked(&mut sets, &record.client_id, &record.inbox_id)
                    .await
                {
                    warn!("lifecycle: launch wake of {} failed: {err}", record.client_id);
                }
            } else if !sets.awake.contains(&value) {
                let persisted = self
                    .store
                    .local(&sleep_time_key(&value))
                    .and_then(|v| v.parse().ok())
                    .unwrap_or_else(now_ms);
                sets.sleeping.insert(value, persisted);
            }
        }
        Ok(())
    }

    /// Records an inbox as sleeping without it ever having been awake, as
    /// when registration outlives its capacity slot. No-op for an awake
    /// inbox.
    pub async fn mark_sleeping(&self, client_id: &ClientId) {
        let mut sets = self.sets.lock().await;
        if sets.awake.contains(&client_id.value) {
            return;
        }
        let at = now_ms();
        sets.sleeping.insert(client_id.value.clone(), at);
        if let Err(err) = self
            .store
            .set_local(&sleep_time_key(&client_id.value), &at.to_string())
        {
            warn!("lifecycle: persisting sleep time for {client_id}: {err}");
        }
    }

    /// Drops a client from both sets without touching its machine; the
    /// caller has already deleted it.
    pub async fn force_remove(&self, client_id: &ClientId) {
        let mut sets = self.sets.lock().await;
        sets.awake.remove(&client_id.value);
        sets.sleeping.remove(&client_id.value);
        if sets.active.as_deref() == Some(client_id.value.as_str()) {
            sets.active = None;
        }
    }

    pub async fn stop_all(&self) -> Result<(), CoreError> {
        let mut sets = self.sets.lock().await;
        let awake: Vec<String> = sets.awake.iter().cloned().collect();
        for value in awake {
            self.sleep_locked(&mut sets, &value).await;
        }
        Ok(())
    }

    async fn wake_locked(
        &self,
        sets: &mut Sets,
        client_id: &ClientId,
        inbox_id: &InboxId,
    ) -> Result<(), CoreError> {
        sets.sleeping.remove(&client_id.value);
        sets.awake.insert(client_id.value.clone());
        if let Err(err) = self.host.bring_up(client_id, inbox_id).await {
            sets.awake.remove(&client_id.value);
            return Err(err);
        }
        Ok(())
    }

    async fn sleep_locked(&self, sets: &mut Sets, client_value: &str) {
        if !sets.awake.remove(client_value) {
            return;
        }
        let at = now_ms();
        sets.sleeping.insert(client_value.to_string(), at);
        if let Err(err) = self
            .store
            .set_local(&sleep_time_key(client_value), &at.to_string())
        {
            warn!("lifecycle: persisting sleep time for {client_value}: {err}");
        }
        let client_id = ClientId::new(client_value.to_string());
        if let Err(err) = self.host.tear_down(&client_id).await {
            warn!("lifecycle: tear down of {client_id}: {err}");
        }
    }

    fn protected(&self, sets: &Sets, client_value: &str) -> bool {
        if sets.active.as_deref() == Some(client_value) {
            return true;
        }
        self.store
            .has_pending_invite(&ClientId::new(client_value.to_string()))
    }

    /// Protection window first, then recency: an inbox created inside the
    /// window has no activity signal to rank it yet, so it is never a
    /// victim. Among the rest, never-active ranks below any recorded
    /// activity.
    fn eviction_candidate(&self, sets: &Sets) -> Option<String> {
        let now = now_ms();
        let window = self.config.eviction_protection_window_ms;
        sets.awake
            .iter()
            .filter(|v| !self.protected(sets, v))
            .filter_map(|v| {
                let record = self
                    .store
                    .activity_for(&ClientId::new(v.to_string()))?;
                if now.saturating_sub(record.created_at_ms) < window {
                    return None;
                }
                Some((v.clone(), recency_rank(&record)))
            })
            .min_by_key(|(_, rank)| *rank)
            .map(|(v, _)| v)
    }

    /// Ideal awake membership: every protected inbox (active client and
    /// pending invites), then the most recently active remainder up to
    /// capacity.
    fn ideal_awake_set(&self, active: Option<&str>) -> HashMap<String, InboxId> {
        let mut records = self.store.activity_records();
        records.sort_by_key(|r| std::cmp::Reverse(recency_rank(r)));
        let mut protected: HashSet<String> = self
            .store
            .pending_invite_clients()
            .into_iter()
            .map(|c| c.value)
            .collect();
        if let Some(active) = active {
            protected.insert(active.to_string());
        }
        let mut ideal = HashMap::new();
        for record in &records {
            if protected.remove(&record.client_id.value) {
                ideal.insert(record.client_id.value.clone(), record.inbox_id.clone());
            }
        }
        for record in &records {
            if ideal.len() >= self.config.max_awake_inboxes {
                break;
            }
            ideal
                .entry(record.client_id.value.clone())
                .or_insert_with(|| record.inbox_id.clone());
        }
        ideal
    }
}

/// Never-active sorts before any timestamp. Created-at breaks ties so
/// ranking is stable across calls.
fn recency_rank(record: &InboxActivity) -> (u64, u64) {
    (
        record.last_activity_ms.map_or(0, |ms| ms + 1),
        record.created_at_ms,
    )
}
