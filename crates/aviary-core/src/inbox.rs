use crate::backend::BackendApi;
use crate::config::CoreConfig;
use crate::error::CoreError;
use crate::event::{StateCell, StateReceiver};
use crate::keys::{Identity, IdentityStore};
use crate::protocol::{ProtocolClient, ProtocolSdk};
use crate::storage::DurableStore;
use crate::time::now_ms;
use aviary_api::types::{ClientId, InboxId};
use log::{debug, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InboxPhase {
    Idle,
    Authorizing,
    Registering,
    AuthenticatingBackend,
    Ready,
    Backgrounded,
    Deleting,
    Stopping,
    Error(CoreError),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InboxSnapshot {
    pub client_id: ClientId,
    pub phase: InboxPhase,
}

enum InboxAction {
    Authorize {
        inbox_id: InboxId,
        reply: oneshot::Sender<Result<(), CoreError>>,
    },
    Register {
        reply: oneshot::Sender<Result<InboxId, CoreError>>,
    },
    EnterBackground {
        reply: oneshot::Sender<Result<(), CoreError>>,
    },
    EnterForeground {
        reply: oneshot::Sender<Result<(), CoreError>>,
    },
    Delete {
        reply: oneshot::Sender<Result<(), CoreError>>,
    },
    Stop {
        reply: oneshot::Sender<Result<(), CoreError>>,
    },
}

impl InboxAction {
    fn name(&self) -> &'static str {
        match self {
            InboxAction::Authorize { .. } => "authorize",
            InboxAction::Register { .. } => "register",
            InboxAction::EnterBackground { .. } => "enter_background",
            InboxAction::EnterForeground { .. } => "enter_foreground",
            InboxAction::Delete { .. } => "delete",
            InboxAction::Stop { .. } => "stop",
        }
    }

    fn drop_cancelled(self) {
        match self {
            InboxAction::Authorize { reply, .. } => {
                let _ = reply.send(Err(CoreError::Cancelled));
            }
            InboxAction::Register { reply } => {
                let _ = reply.send(Err(CoreError::Cancelled));
            }
            InboxAction::EnterBackground { reply }
            | InboxAction::EnterForeground { reply }
            | InboxAction::Delete { reply }
            | InboxAction::Stop { reply } => {
                let _ = reply.send(Err(CoreError::Cancelled));
            }
        }
    }
}

#[derive(Clone)]
pub struct InboxDeps {
    pub identities: IdentityStore,
    pub store: DurableStore,
    pub sdk: Arc<dyn ProtocolSdk>,
    pub backend: Arc<dyn BackendApi>,
    pub config: CoreConfig,
}

#[derive(Clone)]
struct ReadyHandles {
    client: Arc<dyn ProtocolClient>,
    inbox_id: InboxId,
    backend_token: String,
}

/// Single authority over one client id's lifecycle. Every public
/// operation is enqueue-and-await; the worker drains actions strictly
/// one at a time, so transition logic always observes a settled state.
pub struct InboxMachine {
    client_id: ClientId,
    tx: mpsc::Sender<InboxAction>,
    state: StateCell<InboxSnapshot>,
    cancel: Arc<AtomicBool>,
    ready: Arc<Mutex<Option<ReadyHandles>>>,
}

impl InboxMachine {
    pub fn spawn(client_id: ClientId, deps: InboxDeps) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(deps.config.action_queue_depth.max(1));
        let state = StateCell::new(InboxSnapshot {
            client_id: client_id.clone(),
            phase: InboxPhase::Idle,
        });
        let cancel = Arc::new(AtomicBool::new(false));
        let ready = Arc::new(Mutex::new(None));
        let mut worker = InboxWorker {
            client_id: client_id.clone(),
            deps,
            state: state.clone(),
            cancel: cancel.clone(),
            ready: ready.clone(),
        };
        tokio::spawn(async move {
            worker.run(rx).await;
        });
        Arc::new(Self {
            client_id,
            tx,
            state,
            cancel,
            ready,
        })
    }

    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    pub fn subscribe(&self) -> StateReceiver<InboxSnapshot> {
        self.state.subscribe()
    }

    pub fn current(&self) -> InboxSnapshot {
        self.state.current()
    }

    pub fn client(&self) -> Option<Arc<dyn ProtocolClient>> {
        let guard = self.ready.lock().unwrap_or_else(|e| e.into_inner());
        guard.as_ref().map(|h| h.client.clone())
    }

    pub fn inbox_id(&self) -> Option<InboxId> {
        let guard = self.ready.lock().unwrap_or_else(|e| e.into_inner());
        guard.as_ref().map(|h| h.inbox_id.clone())
    }

    pub async fn authorize(&self, inbox_id: InboxId) -> Result<(), CoreError> {
        let (reply, rx) = oneshot::channel();
        self.enqueue(InboxAction::Authorize { inbox_id, reply }).await?;
        rx.await.unwrap_or(Err(CoreError::Cancelled))
    }

    pub async fn register(&self) -> Result<InboxId, CoreError> {
        let (reply, rx) = oneshot::channel();
        self.enqueue(InboxAction::Register { reply }).await?;
        rx.await.unwrap_or(Err(CoreError::Cancelled))
    }

    pub async fn enter_background(&self) -> Result<(), CoreError> {
        let (reply, rx) = oneshot::channel();
        self.enqueue(InboxAction::EnterBackground { reply }).await?;
        rx.await.unwrap_or(Err(CoreError::Cancelled))
    }

    pub async fn enter_foreground(&self) -> Result<(), CoreError> {
        let (reply, rx) = oneshot::channel();
        self.enqueue(InboxAction::EnterForeground { reply }).await?;
        rx.await.unwrap_or(Err(CoreError::Cancelled))
    }

    /// Supersedes whatever is in flight: queued actions are dropped and
    /// the in-flight one is cooperatively cancelled before cleanup runs.
    pub async fn delete(&self) -> Result<(), CoreError> {
        self.cancel.store(true, Ordering::SeqCst);
        let (reply, rx) = oneshot::channel();
        self.enqueue(InboxAction::Delete { reply }).await?;
        rx.await.unwrap_or(Err(CoreError::Cancelled))
    }

    pub async fn stop(&self) -> Result<(), CoreError> {
        self.cancel.store(true, Ordering::SeqCst);
        let (reply, rx) = oneshot::channel();
        self.enqueue(InboxAction::Stop { reply }).await?;
        rx.await.unwrap_or(Err(CoreError::Cancelled))
    }

    pub async fn wait_for_ready(&self, timeout: Duration) -> Result<(), CoreError> {
        let mut rx = self.subscribe();
        let wait = async {
            loop {
                let phase = rx.borrow_and_update().phase.clone();
                match phase {
                    InboxPhase::Ready => return Ok(()),
                    InboxPhase::Error(cause) => return Err(cause),
                    _ => {}
                }
                if rx.changed().await.is_err() {
                    return Err(CoreError::Cancelled);
                }
            }
        };
        match tokio::time::timeout(timeout, wait).await {
            Ok(result) => result,
            Err(_) => Err(CoreError::Timeout),
        }
    }

    async fn enqueue(&self, action: InboxAction) -> Result<(), CoreError> {
        self.tx
            .send(action)
            .await
            .map_err(|_| CoreError::Cancelled)
    }
}

struct InboxWorker {
    client_id: ClientId,
    deps: InboxDeps,
    state: StateCell<InboxSnapshot>,
    cancel: Arc<AtomicBool>,
    ready: Arc<Mutex<Option<ReadyHandles>>>,
}

impl InboxWorker {
    async fn run(&mut self, mut rx: mpsc::Receiver<InboxAction>) {
        while let Some(action) = rx.recv().await {
            let superseding =
                matches!(action, InboxAction::Delete { .. } | InboxAction::Stop { .. });
            if self.cancel.load(Ordering::SeqCst) && !superseding {
                debug!(
                    "inbox {}: dropping queued {} (superseded)",
                    self.client_id,
                    action.name()
                );
                action.drop_cancelled();
                continue;
            }
            self.handle(action).await;
        }
    }

    fn phase(&self) -> InboxPhase {
        self.state.current().phase
    }

    fn set_phase(&self, phase: InboxPhase) {
        self.state.publish(InboxSnapshot {
            client_id: self.client_id.clone(),
            phase,
        });
    }

    fn cancelled(&self) -> Result<(), CoreError> {
        if self.cancel.load(Ordering::SeqCst) {
            Err(CoreError::Cancelled)
        } else {
            Ok(())
        }
    }

    async fn handle(&mut self, action: InboxAction) {
        match action {
            InboxAction::Authorize { inbox_id, reply } => {
                let result = match self.phase() {
                    InboxPhase::Idle => self.run_authorize(inbox_id).await,
                    InboxPhase::Error(_) => {
                        self.run_stop().await;
                        self.run_authorize(inbox_id).await
                    }
                    other => Err(self.invalid("authorize", &other)),
                };
                let _ = reply.send(self.settle(result));
            }
            InboxAction::Register { reply } => {
                let result = match self.phase() {
                    InboxPhase::Idle => self.run_register().await,
                    InboxPhase::Error(_) => {
                        self.run_stop().await;
                        self.run_register().await
                    }
                    other => Err(self.invalid("register", &other)),
                };
                let _ = reply.send(self.settle(result));
            }
            InboxAction::EnterBackground { reply } => {
                let result = match self.phase() {
                    InboxPhase::Ready => self.run_background().await,
                    other => Err(self.invalid("enter_background", &other)),
                };
                let _ = reply.send(result);
            }
            InboxAction::EnterForeground { reply } => {
                let result = match self.phase() {
                    InboxPhase::Backgrounded => self.run_foreground().await,
                    other => Err(self.invalid("enter_foreground", &other)),
                };
                let _ = reply.send(result);
            }
            InboxAction::Delete { reply } => {
                let result = self.run_delete().await;
                self.cancel.store(false, Ordering::SeqCst);
                let _ = reply.send(result);
            }
            InboxAction::Stop { reply } => {
                self.run_stop().await;
                self.cancel.store(false, Ordering::SeqCst);
                let _ = reply.send(Ok(()));
            }
        }
    }

    /// Invalid transitions are logged and dropped, never fatal.
    fn invalid(&self, action: &str, phase: &InboxPhase) -> CoreError {
        warn!(
            "inbox {}: {} not valid in {:?}, dropped",
            self.client_id, action, phase
        );
        CoreError::Validation(format!("{action} in {phase:?}"))
    }

    /// Cancellation is a silent abort back to idle; anything else is an
    /// error state carrying the cause.
    fn settle<T>(&self, result: Result<T, CoreError>) -> Result<T, CoreError> {
        if let Err(err) = &result {
            if err.is_cancelled() {
                debug!("inbox {}: action cancelled", self.client_id);
                self.set_phase(InboxPhase::Idle);
            } else {
                self.set_phase(InboxPhase::Error(err.clone()));
            }
        }
        result
    }

    async fn run_authorize(&mut self, inbox_id: InboxId) -> Result<(), CoreError> {
        self.set_phase(InboxPhase::Authorizing);
        let identity = self.deps.identities.by_inbox(&inbox_id)?;
        if identity.client_id != self.client_id {
            return Err(CoreError::Consistency(format!(
                "inbox {} belongs to client {}",
                inbox_id, identity.client_id
            )));
        }
        self.cancelled()?;
        let client = match self.deps.sdk.build_client(&identity).await {
            Ok(client) => client,
            Err(build_err) => {
                debug!(
                    "inbox {}: rebuild from cached keys failed ({build_err}), creating fresh",
                    self.client_id
                );
                self.cancelled()?;
                self.deps.sdk.create_client(&identity).await?
            }
        };
        self.cancelled()?;
        if client.inbox_id() != inbox_id {
            return Err(CoreError::Consistency(format!(
                "created client reports inbox {}, expected {}",
                client.inbox_id(),
                inbox_id
            )));
        }
        self.finish_bring_up(client, identity).await
    }

    async fn run_register(&mut self) -> Result<InboxId, CoreError> {
        self.set_phase(InboxPhase::Registering);
        let mut identity = Identity::generate(self.client_id.clone());
        self.cancelled()?;
        let client = self.deps.sdk.create_client(&identity).await?;
        self.cancelled()?;
        // The protocol assigns the inbox id; adopt whatever the created
        // client reports before persisting anything.
        identity.inbox_id = client.inbox_id();
        let inbox_id = identity.inbox_id.clone();
        self.deps.identities.save(&identity)?;
        // Secret store and durable row are one conceptual write. If the
        // durable half fails, roll the secret-store half back so no
        // orphaned identity survives.
        if let Err(err) = self
            .deps
            .store
            .record_inbox(&self.client_id, &inbox_id, now_ms())
        {
            if let Err(rollback) = self.deps.identities.delete(&self.client_id) {
                warn!(
                    "inbox {}: rollback after failed registration also failed: {rollback}",
                    self.client_id
                );
            }
            return Err(CoreError::Consistency(format!(
                "registration rolled back: {err}"
            )));
        }
        self.finish_bring_up(client, identity).await?;
        Ok(inbox_id)
    }

    async fn finish_bring_up(
        &mut self,
        client: Arc<dyn ProtocolClient>,
        identity: Identity,
    ) -> Result<(), CoreError> {
        self.set_phase(InboxPhase::AuthenticatingBackend);
        let token = self.deps.backend.authenticate(&self.client_id).await?;
        self.cancelled()?;
        client.connect_db().await?;
        let topic = inbox_topic(&identity.inbox_id);
        if let Err(err) = self.deps.backend.subscribe_topic(&token, &topic).await {
            warn!("inbox {}: topic subscribe failed: {err}", self.client_id);
        }
        self.deps
            .store
            .set_local(&topic_key(&topic), &self.client_id.value)?;
        self.deps
            .store
            .record_inbox(&self.client_id, &identity.inbox_id, now_ms())?;
        {
            let mut guard = self.ready.lock().unwrap_or_else(|e| e.into_inner());
            *guard = Some(ReadyHandles {
                client,
                inbox_id: identity.inbox_id,
                backend_token: token,
            });
        }
        self.set_phase(InboxPhase::Ready);
        Ok(())
    }

    async fn run_background(&mut self) -> Result<(), CoreError> {
        if let Some(handles) = self.handles() {
            if let Err(err) = handles.client.disconnect_db().await {
                warn!("inbox {}: disconnect on background: {err}", self.client_id);
            }
        }
        self.set_phase(InboxPhase::Backgrounded);
        Ok(())
    }

    async fn run_foreground(&mut self) -> Result<(), CoreError> {
        if let Some(handles) = self.handles() {
            handles.client.connect_db().await?;
        }
        self.set_phase(InboxPhase::Ready);
        Ok(())
    }

    /// Full teardown: sync stop, best-effort backend cleanup, durable
    /// wipe, idempotent identity delete, local database removal. Repeat
    /// deletes are no-ops.
    async fn run_delete(&mut self) -> Result<(), CoreError> {
        let identity = self.deps.identities.by_client(&self.client_id).ok();
        if matches!(self.phase(), InboxPhase::Idle)
            && identity.is_none()
            && !self.deps.store.references_client(&self.client_id)
        {
            debug!("inbox {}: repeat delete ignored", self.client_id);
            return Ok(());
        }
        self.set_phase(InboxPhase::Deleting);
        let handles = self.take_handles();
        if let Some(handles) = handles.as_ref() {
            if let Err(err) = handles.client.disconnect_db().await {
                warn!("inbox {}: sync stop during delete: {err}", self.client_id);
            }
            let topic = inbox_topic(&handles.inbox_id);
            if let Err(err) = self
                .deps
                .backend
                .unsubscribe_topic(&handles.backend_token, &topic)
                .await
            {
                warn!("inbox {}: unsubscribe during delete: {err}", self.client_id);
            }
        }
        if let Some(identity) = identity.as_ref() {
            if let Err(err) = self
                .deps
                .backend
                .unregister_installation(&identity.inbox_id)
                .await
            {
                warn!("inbox {}: unregister during delete: {err}", self.client_id);
            }
        }
        if let Err(err) = self.deps.store.delete_all_for_client(&self.client_id) {
            warn!("inbox {}: durable wipe during delete: {err}", self.client_id);
        }
        if let Err(err) = self.deps.identities.delete(&self.client_id) {
            warn!("inbox {}: identity delete: {err}", self.client_id);
        }
        match handles {
            Some(handles) => {
                if handles.client.delete_local_db().await.is_err() {
                    self.remove_database_files();
                }
            }
            None => self.remove_database_files(),
        }
        self.set_phase(InboxPhase::Stopping);
        self.set_phase(InboxPhase::Idle);
        Ok(())
    }

    async fn run_stop(&mut self) {
        self.set_phase(InboxPhase::Stopping);
        if let Some(handles) = self.take_handles() {
            if let Err(err) = handles.client.disconnect_db().await {
                warn!("inbox {}: disconnect on stop: {err}", self.client_id);
            }
        }
        self.set_phase(InboxPhase::Idle);
    }

    fn handles(&self) -> Option<ReadyHandles> {
        let guard = self.ready.lock().unwrap_or_else(|e| e.into_inner());
        guard.clone()
    }

    fn take_handles(&self) -> Option<ReadyHandles> {
        let mut guard = self.ready.lock().unwrap_or_else(|e| e.into_inner());
        guard.take()
    }

    /// Fallback when the SDK cannot remove its own database: unlink any
    /// file under the storage path named after this client.
    fn remove_database_files(&self) {
        let dir = std::path::Path::new(&self.deps.config.storage_path);
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(_) => return,
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.contains(&self.client_id.value) {
                if let Err(err) = std::fs::remove_file(entry.path()) {
                    warn!(
                        "inbox {}: could not remove {}: {err}",
                        self.client_id, name
                    );
                }
            }
        }
    }
}

pub fn inbox_topic(inbox_id: &InboxId) -> String {
    format!("inbox/{}", inbox_id.value)
}

pub fn topic_key(topic: &str) -> String {
    format!("topic:{topic}")
}
