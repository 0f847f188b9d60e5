use crate::config::CoreConfig;
use crate::error::CoreError;
use crate::event::{StateCell, StateReceiver};
use crate::inbox::InboxMachine;
use crate::keys::IdentityStore;
use crate::storage::{ConversationRow, DurableStore, MessageRow};
use crate::time::now_ms;
use aviary_api::invite::SignedInvite;
use aviary_api::types::{
    ClientId, Consent, ConversationId, ConversationOrigin, ConversationReadyResult, MessageId,
};
use aviary_api::validation::{validate_message_text, ValidationLimits};
use log::{debug, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Notify};
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConversationPhase {
    Uninitialized,
    Creating,
    Validating,
    Validated {
        invite: SignedInvite,
        placeholder: ConversationId,
        previous: Option<ConversationId>,
    },
    Joining {
        tag: String,
        placeholder: ConversationId,
    },
    JoinFailed {
        tag: String,
        cause: CoreError,
    },
    Ready(ConversationReadyResult),
    Deleting,
    Error(CoreError),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConversationSnapshot {
    pub client_id: ClientId,
    pub phase: ConversationPhase,
}

/// Out-of-band invite failure channel. Exactly one conversation machine
/// owns the slot at a time; registering a new tag displaces the previous
/// owner, whose receiver then resolves as closed.
#[derive(Clone, Default)]
pub struct InviteErrorHub {
    slot: Arc<Mutex<Option<ErrorSlot>>>,
}

struct ErrorSlot {
    tag: String,
    tx: oneshot::Sender<CoreError>,
}

impl InviteErrorHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, tag: &str) -> oneshot::Receiver<CoreError> {
        let (tx, rx) = oneshot::channel();
        let mut guard = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = guard.take() {
            debug!("invite error slot: displacing handler for tag {}", previous.tag);
        }
        *guard = Some(ErrorSlot {
            tag: tag.to_string(),
            tx,
        });
        rx
    }

    pub fn unregister(&self, tag: &str) {
        let mut guard = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        if guard.as_ref().map(|slot| slot.tag.as_str()) == Some(tag) {
            *guard = None;
        }
    }

    /// Delivers an inviter-reported failure to the registered handler.
    /// Returns false when no handler owns the tag.
    pub fn deliver(&self, tag: &str, cause: CoreError) -> bool {
        let mut guard = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        if guard.as_ref().map(|slot| slot.tag.as_str()) == Some(tag) {
            if let Some(slot) = guard.take() {
                return slot.tx.send(cause).is_ok();
            }
        }
        false
    }
}

enum ConversationAction {
    Create {
        reply: oneshot::Sender<Result<ConversationReadyResult, CoreError>>,
    },
    UseExisting {
        conversation_id: ConversationId,
        reply: oneshot::Sender<Result<ConversationReadyResult, CoreError>>,
    },
    Validate {
        code: String,
        reply: oneshot::Sender<Result<(), CoreError>>,
    },
    Join {
        reply: oneshot::Sender<Result<ConversationReadyResult, CoreError>>,
    },
    Delete {
        reply: oneshot::Sender<Result<(), CoreError>>,
    },
    Stop {
        reply: oneshot::Sender<Result<(), CoreError>>,
    },
    Reset {
        reply: oneshot::Sender<Result<(), CoreError>>,
    },
}

impl ConversationAction {
    fn drop_cancelled(self) {
        match self {
            ConversationAction::Create { reply } | ConversationAction::Join { reply } => {
                let _ = reply.send(Err(CoreError::Cancelled));
            }
            ConversationAction::UseExisting { reply, .. } => {
                let _ = reply.send(Err(CoreError::Cancelled));
            }
            ConversationAction::Validate { reply, .. } => {
                let _ = reply.send(Err(CoreError::Cancelled));
            }
            ConversationAction::Delete { reply }
            | ConversationAction::Stop { reply }
            | ConversationAction::Reset { reply } => {
                let _ = reply.send(Err(CoreError::Cancelled));
            }
        }
    }
}

#[derive(Clone)]
pub struct ConversationDeps {
    pub store: DurableStore,
    pub inbox: Arc<InboxMachine>,
    pub identities: IdentityStore,
    pub invite_errors: InviteErrorHub,
    pub config: CoreConfig,
}

/// Drives exactly one creation-or-join attempt, with the same
/// enqueue-and-await discipline as the inbox machine. Outbound text is
/// queued separately and drained in order by one consumer that blocks
/// until the conversation is ready.
pub struct ConversationMachine {
    client_id: ClientId,
    tx: mpsc::Sender<ConversationAction>,
    outbound: mpsc::UnboundedSender<String>,
    state: StateCell<ConversationSnapshot>,
    cancel: Arc<AtomicBool>,
    cancel_notify: Arc<Notify>,
    limits: ValidationLimits,
}

impl ConversationMachine {
    pub fn spawn(deps: ConversationDeps) -> Arc<Self> {
        let client_id = deps.inbox.client_id().clone();
        let (tx, rx) = mpsc::channel(deps.config.action_queue_depth.max(1));
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let state = StateCell::new(ConversationSnapshot {
            client_id: client_id.clone(),
            phase: ConversationPhase::Uninitialized,
        });
        let cancel = Arc::new(AtomicBool::new(false));
        let cancel_notify = Arc::new(Notify::new());
        let mut worker = ConversationWorker {
            client_id: client_id.clone(),
            deps: deps.clone(),
            state: state.clone(),
            cancel: cancel.clone(),
            cancel_notify: cancel_notify.clone(),
        };
        tokio::spawn(async move {
            worker.run(rx).await;
        });
        let sender = OutboundSender {
            client_id: client_id.clone(),
            deps,
            state: state.clone(),
        };
        tokio::spawn(async move {
            sender.run(outbound_rx).await;
        });
        Arc::new(Self {
            client_id,
            tx,
            outbound,
            state,
            cancel,
            cancel_notify,
            limits: ValidationLimits::default(),
        })
    }

    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    pub fn subscribe(&self) -> StateReceiver<ConversationSnapshot> {
        self.state.subscribe()
    }

    pub fn current(&self) -> ConversationSnapshot {
        self.state.current()
    }

    pub fn ready_result(&self) -> Option<ConversationReadyResult> {
        match self.state.current().phase {
            ConversationPhase::Ready(result) => Some(result),
            _ => None,
        }
    }

    pub async fn create(&self) -> Result<ConversationReadyResult, CoreError> {
        let (reply, rx) = oneshot::channel();
        self.enqueue(ConversationAction::Create { reply }).await?;
        rx.await.unwrap_or(Err(CoreError::Cancelled))
    }

    pub async fn use_existing(
        &self,
        conversation_id: ConversationId,
    ) -> Result<ConversationReadyResult, CoreError> {
        let (reply, rx) = oneshot::channel();
        self.enqueue(ConversationAction::UseExisting {
            conversation_id,
            reply,
        })
        .await?;
        rx.await.unwrap_or(Err(CoreError::Cancelled))
    }

    pub async fn validate(&self, code: &str) -> Result<(), CoreError> {
        let (reply, rx) = oneshot::channel();
        self.enqueue(ConversationAction::Validate {
            code: code.to_string(),
            reply,
        })
        .await?;
        rx.await.unwrap_or(Err(CoreError::Cancelled))
    }

    pub async fn join(&self) -> Result<ConversationReadyResult, CoreError> {
        let (reply, rx) = oneshot::channel();
        self.enqueue(ConversationAction::Join { reply }).await?;
        rx.await.unwrap_or(Err(CoreError::Cancelled))
    }

    /// Validate then join in one call; the common path for an invite code
    /// pasted by the user.
    pub async fn join_with_code(&self, code: &str) -> Result<ConversationReadyResult, CoreError> {
        self.validate(code).await?;
        self.join().await
    }

    /// Accepted in any phase. Text is queued in arrival order and sent
    /// once the conversation is ready; it is never reordered.
    pub fn send_message(&self, text: &str) -> Result<(), CoreError> {
        validate_message_text(text, &self.limits)
            .map_err(|err| CoreError::Validation(err.to_string()))?;
        self.outbound
            .send(text.to_string())
            .map_err(|_| CoreError::Cancelled)
    }

    pub async fn delete(&self) -> Result<(), CoreError> {
        self.cancel.store(true, Ordering::SeqCst);
        self.cancel_notify.notify_waiters();
        let (reply, rx) = oneshot::channel();
        self.enqueue(ConversationAction::Delete { reply }).await?;
        rx.await.unwrap_or(Err(CoreError::Cancelled))
    }

    pub async fn stop(&self) -> Result<(), CoreError> {
        self.cancel.store(true, Ordering::SeqCst);
        self.cancel_notify.notify_waiters();
        let (reply, rx) = oneshot::channel();
        self.enqueue(ConversationAction::Stop { reply }).await?;
        rx.await.unwrap_or(Err(CoreError::Cancelled))
    }

    pub async fn reset(&self) -> Result<(), CoreError> {
        let (reply, rx) = oneshot::channel();
        self.enqueue(ConversationAction::Reset { reply }).await?;
        rx.await.unwrap_or(Err(CoreError::Cancelled))
    }

    pub async fn wait_for_ready(
        &self,
        timeout: Duration,
    ) -> Result<ConversationReadyResult, CoreError> {
        let mut rx = self.subscribe();
        let wait = async {
            loop {
                let phase = rx.borrow_and_update().phase.clone();
                match phase {
                    ConversationPhase::Ready(result) => return Ok(result),
                    ConversationPhase::Error(cause) => return Err(cause),
                    ConversationPhase::JoinFailed { cause, .. } => return Err(cause),
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

    async fn enqueue(&self, action: ConversationAction) -> Result<(), CoreError> {
        self.tx
            .send(action)
            .await
            .map_err(|_| CoreError::Cancelled)
    }
}

struct ConversationWorker {
    client_id: ClientId,
    deps: ConversationDeps,
    state: StateCell<ConversationSnapshot>,
    cancel: Arc<AtomicBool>,
    cancel_notify: Arc<Notify>,
}

impl ConversationWorker {
    async fn run(&mut self, mut rx: mpsc::Receiver<ConversationAction>) {
        while let Some(action) = rx.recv().await {
            let superseding = matches!(
                action,
                ConversationAction::Delete { .. } | ConversationAction::Stop { .. }
            );
            if self.cancel.load(Ordering::SeqCst) && !superseding {
                action.drop_cancelled();
                continue;
            }
            self.handle(action).await;
        }
    }

    fn phase(&self) -> ConversationPhase {
        self.state.current().phase
    }

    fn set_phase(&self, phase: ConversationPhase) {
        self.state.publish(ConversationSnapshot {
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

    async fn handle(&mut self, action: ConversationAction) {
        match action {
            ConversationAction::Create { reply } => {
                let result = match self.phase() {
                    ConversationPhase::Uninitialized => self.run_create().await,
                    other => Err(self.invalid("create", &other)),
                };
                let _ = reply.send(self.settle(result));
            }
            ConversationAction::UseExisting {
                conversation_id,
                reply,
            } => {
                let result = match self.phase() {
                    ConversationPhase::Uninitialized => self.run_use_existing(conversation_id),
                    other => Err(self.invalid("use_existing", &other)),
                };
                let _ = reply.send(self.settle(result));
            }
            ConversationAction::Validate { code, reply } => {
                let result = match self.phase() {
                    ConversationPhase::Uninitialized | ConversationPhase::JoinFailed { .. } => {
                        self.run_validate(&code).await
                    }
                    other => Err(self.invalid("validate", &other)),
                };
                let _ = reply.send(self.settle(result));
            }
            ConversationAction::Join { reply } => {
                let result = match self.phase() {
                    ConversationPhase::Ready(result) => Ok(result),
                    ConversationPhase::Validated {
                        invite,
                        placeholder,
                        previous,
                    } => self.run_join(invite, placeholder, previous).await,
                    other => Err(self.invalid("join", &other)),
                };
                let _ = reply.send(self.settle_join(result));
            }
            ConversationAction::Delete { reply } => {
                let result = self.run_delete().await;
                self.cancel.store(false, Ordering::SeqCst);
                let _ = reply.send(result);
            }
            ConversationAction::Stop { reply } => {
                self.run_stop();
                self.cancel.store(false, Ordering::SeqCst);
                let _ = reply.send(Ok(()));
            }
            ConversationAction::Reset { reply } => {
                self.run_stop();
                let _ = reply.send(Ok(()));
            }
        }
    }

    fn invalid(&self, action: &str, phase: &ConversationPhase) -> CoreError {
        warn!(
            "conversation for {}: {} not valid while {}, dropped",
            self.client_id,
            action,
            phase_name(phase)
        );
        CoreError::Validation(format!("{action} not valid now"))
    }

    fn settle<T>(&self, result: Result<T, CoreError>) -> Result<T, CoreError> {
        if let Err(err) = &result {
            if err.is_cancelled() {
                self.set_phase(ConversationPhase::Uninitialized);
            } else {
                self.set_phase(ConversationPhase::Error(err.clone()));
            }
        }
        result
    }

    /// Join failures reported by the inviter land in `JoinFailed`, which
    /// keeps the tag so the caller can offer a retry with the original
    /// code. Everything else settles like any other action.
    fn settle_join(
        &self,
        result: Result<ConversationReadyResult, CoreError>,
    ) -> Result<ConversationReadyResult, CoreError> {
        match &result {
            Err(err) if err.is_cancelled() => {
                self.set_phase(ConversationPhase::Uninitialized);
            }
            Err(err) => {
                if let ConversationPhase::JoinFailed { .. } = self.phase() {
                    // run_join already published the failure phase.
                } else {
                    self.set_phase(ConversationPhase::Error(err.clone()));
                }
            }
            Ok(_) => {}
        }
        result
    }

    async fn ready_client(
        &self,
    ) -> Result<Arc<dyn crate::protocol::ProtocolClient>, CoreError> {
        let timeout = Duration::from_millis(self.deps.config.ready_timeout_ms);
        self.deps.inbox.wait_for_ready(timeout).await?;
        self.deps
            .inbox
            .client()
            .ok_or_else(|| CoreError::Consistency("inbox ready without client".to_string()))
    }

    async fn run_create(&mut self) -> Result<ConversationReadyResult, CoreError> {
        self.set_phase(ConversationPhase::Creating);
        let client = self.ready_client().await?;
        self.cancelled()?;
        let conversation_id = client.prepare_conversation().await?;
        self.cancelled()?;
        client.publish_conversation(&conversation_id).await?;
        let invite = self.generate_invite(&conversation_id)?;
        self.deps.store.upsert_conversation(ConversationRow {
            conversation_id: conversation_id.value.clone(),
            client_id: self.client_id.value.clone(),
            invite_tag: Some(invite.tag.clone()),
            unused: false,
            joined: true,
            consent: Consent::Allowed,
            created_at_ms: now_ms(),
        })?;
        self.deps.store.record_activity(&self.client_id, now_ms())?;
        let result = ConversationReadyResult {
            conversation_id,
            origin: ConversationOrigin::Created,
        };
        self.set_phase(ConversationPhase::Ready(result.clone()));
        Ok(result)
    }

    fn run_use_existing(
        &mut self,
        conversation_id: ConversationId,
    ) -> Result<ConversationReadyResult, CoreError> {
        let row = self
            .deps
            .store
            .conversation(&conversation_id)
            .ok_or(CoreError::NotFound)?;
        if row.client_id != self.client_id.value {
            return Err(CoreError::Consistency(format!(
                "conversation {} belongs to another client",
                conversation_id
            )));
        }
        let result = ConversationReadyResult {
            conversation_id,
            origin: ConversationOrigin::Existing,
        };
        self.set_phase(ConversationPhase::Ready(result.clone()));
        Ok(result)
    }

    async fn run_validate(&mut self, code: &str) -> Result<(), CoreError> {
        self.set_phase(ConversationPhase::Validating);
        let invite = SignedInvite::decode(code)?;
        invite.verify(now_ms())?;
        self.cancelled()?;
        // A matching local row with its identity intact short-circuits the
        // join entirely when we already belong to the conversation.
        if let Some(row) = self.deps.store.conversation_by_tag(&invite.tag) {
            let owner = ClientId::new(row.client_id.clone());
            if self.deps.identities.by_client(&owner).is_ok() && row.joined {
                let result = ConversationReadyResult {
                    conversation_id: ConversationId::new(row.conversation_id),
                    origin: ConversationOrigin::Existing,
                };
                self.set_phase(ConversationPhase::Ready(result));
                return Ok(());
            }
        }
        let previous = self.current_joined_conversation();
        let placeholder = self.insert_placeholder(&invite)?;
        self.set_phase(ConversationPhase::Validated {
            invite,
            placeholder,
            previous,
        });
        Ok(())
    }

    /// The conversation this join replaces, if the client already had one.
    fn current_joined_conversation(&self) -> Option<ConversationId> {
        self.deps
            .store
            .conversations_for_client(&self.client_id)
            .into_iter()
            .filter(|row| row.joined)
            .max_by_key(|row| row.created_at_ms)
            .map(|row| ConversationId::new(row.conversation_id))
    }

    /// Local row visible immediately so the caller has something to render
    /// while the asynchronous join settles.
    fn insert_placeholder(&self, invite: &SignedInvite) -> Result<ConversationId, CoreError> {
        let placeholder = ConversationId::new(format!("placeholder-{}", Uuid::new_v4()));
        self.deps.store.upsert_conversation(ConversationRow {
            conversation_id: placeholder.value.clone(),
            client_id: self.client_id.value.clone(),
            invite_tag: Some(invite.tag.clone()),
            unused: false,
            joined: false,
            consent: Consent::Unknown,
            created_at_ms: now_ms(),
        })?;
        Ok(placeholder)
    }

    async fn run_join(
        &mut self,
        invite: SignedInvite,
        placeholder: ConversationId,
        previous: Option<ConversationId>,
    ) -> Result<ConversationReadyResult, CoreError> {
        let tag = invite.tag.clone();
        self.set_phase(ConversationPhase::Joining {
            tag: tag.clone(),
            placeholder: placeholder.clone(),
        });
        let error_rx = self.deps.invite_errors.register(&tag);
        self.deps
            .store
            .set_pending_invite(&self.client_id, &tag, now_ms())?;
        let outcome = self
            .join_inner(&invite, &placeholder, previous, error_rx)
            .await;
        self.deps.invite_errors.unregister(&tag);
        if let Err(err) = self.deps.store.clear_pending_invite(&self.client_id) {
            warn!(
                "conversation for {}: clearing pending invite: {err}",
                self.client_id
            );
        }
        match outcome {
            Ok(result) => {
                self.set_phase(ConversationPhase::Ready(result.clone()));
                Ok(result)
            }
            Err(cause) if !cause.is_cancelled() && is_invite_failure(&cause) => {
                self.remove_placeholder(&placeholder);
                self.set_phase(ConversationPhase::JoinFailed {
                    tag,
                    cause: cause.clone(),
                });
                Err(cause)
            }
            Err(cause) => Err(cause),
        }
    }

    async fn join_inner(
        &mut self,
        invite: &SignedInvite,
        placeholder: &ConversationId,
        previous: Option<ConversationId>,
        error_rx: oneshot::Receiver<CoreError>,
    ) -> Result<ConversationReadyResult, CoreError> {
        let client = self.ready_client().await?;
        self.cancelled()?;
        client
            .send_dm(&invite.creator(), &join_request_text(&invite.tag))
            .await?;
        // Replacing a previous conversation never blocks the new join on
        // its success; failures here are logged and carried past.
        if let Some(previous) = previous {
            if previous != *placeholder {
                self.retire_conversation(&client, &previous).await;
            }
        }
        self.cancelled()?;
        let store = self.deps.store.clone();
        let tag = invite.tag.clone();
        let row = tokio::select! {
            row = store.wait_for_joined_conversation_with_tag(&tag) => row,
            cause = error_rx => {
                let cause = cause.unwrap_or(CoreError::Cancelled);
                return Err(cause);
            }
            _ = self.cancel_notify.notified() => {
                return Err(CoreError::Cancelled);
            }
        };
        self.remove_placeholder(placeholder);
        self.deps.store.record_activity(&self.client_id, now_ms())?;
        Ok(ConversationReadyResult {
            conversation_id: ConversationId::new(row.conversation_id),
            origin: ConversationOrigin::Joined,
        })
    }

    async fn retire_conversation(
        &self,
        client: &Arc<dyn crate::protocol::ProtocolClient>,
        conversation_id: &ConversationId,
    ) {
        if let Err(err) = client.update_consent(conversation_id, Consent::Denied).await {
            warn!(
                "conversation for {}: denying consent on {conversation_id}: {err}",
                self.client_id
            );
        }
        if let Err(err) = self.deps.store.delete_conversation(conversation_id) {
            warn!(
                "conversation for {}: removing rows for {conversation_id}: {err}",
                self.client_id
            );
        }
    }

    fn remove_placeholder(&self, placeholder: &ConversationId) {
        if let Err(err) = self.deps.store.delete_conversation(placeholder) {
            warn!(
                "conversation for {}: removing placeholder: {err}",
                self.client_id
            );
        }
    }

    async fn run_delete(&mut self) -> Result<(), CoreError> {
        let ready_id = match self.phase() {
            ConversationPhase::Ready(result) => Some(result.conversation_id),
            _ => None,
        };
        self.set_phase(ConversationPhase::Deleting);
        if let Some(conversation_id) = ready_id {
            if let Some(client) = self.deps.inbox.client() {
                self.retire_conversation(&client, &conversation_id).await;
            } else if let Err(err) = self.deps.store.delete_conversation(&conversation_id) {
                warn!(
                    "conversation for {}: removing rows for {conversation_id}: {err}",
                    self.client_id
                );
            }
        }
        self.set_phase(ConversationPhase::Uninitialized);
        Ok(())
    }

    fn run_stop(&mut self) {
        if let ConversationPhase::Joining { tag, placeholder } = self.phase() {
            self.deps.invite_errors.unregister(&tag);
            self.remove_placeholder(&placeholder);
            if let Err(err) = self.deps.store.clear_pending_invite(&self.client_id) {
                warn!(
                    "conversation for {}: clearing pending invite on stop: {err}",
                    self.client_id
                );
            }
        }
        self.set_phase(ConversationPhase::Uninitialized);
    }

    fn generate_invite(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<SignedInvite, CoreError> {
        let identity = self.deps.identities.by_client(&self.client_id)?;
        let key = identity.signing_key()?;
        let now = now_ms();
        SignedInvite::sign(
            &key,
            conversation_id.value.clone(),
            now + self.deps.config.invite_ttl_ms,
            now + self.deps.config.conversation_ttl_ms,
        )
        .map_err(CoreError::Invite)
    }
}

/// Invite errors, timeouts, and inviter-reported protocol failures land in
/// `JoinFailed`; infrastructure failures settle as `Error`.
fn is_invite_failure(cause: &CoreError) -> bool {
    matches!(
        cause,
        CoreError::Invite(_) | CoreError::Protocol(_) | CoreError::Timeout
    )
}

pub fn join_request_text(tag: &str) -> String {
    format!("join-request:{tag}")
}

fn phase_name(phase: &ConversationPhase) -> &'static str {
    match phase {
        ConversationPhase::Uninitialized => "uninitialized",
        ConversationPhase::Creating => "creating",
        ConversationPhase::Validating => "validating",
        ConversationPhase::Validated { .. } => "validated",
        ConversationPhase::Joining { .. } => "joining",
        ConversationPhase::JoinFailed { .. } => "join-failed",
        ConversationPhase::Ready(_) => "ready",
        ConversationPhase::Deleting => "deleting",
        ConversationPhase::Error(_) => "error",
    }
}

/// Drains queued outbound text strictly in order, blocking each send until
/// the conversation reaches ready. Delivery failures are logged, never
/// retried automatically.
struct OutboundSender {
    client_id: ClientId,
    deps: ConversationDeps,
    state: StateCell<ConversationSnapshot>,
}

impl OutboundSender {
    async fn run(&self, mut rx: mpsc::UnboundedReceiver<String>) {
        while let Some(text) = rx.recv().await {
            let conversation_id = match self.wait_until_ready().await {
                Some(conversation_id) => conversation_id,
                None => {
                    warn!(
                        "conversation for {}: machine gone, outbound message not sent",
                        self.client_id
                    );
                    continue;
                }
            };
            self.deliver(&conversation_id, &text).await;
        }
    }

    async fn wait_until_ready(&self) -> Option<ConversationId> {
        let mut rx = self.state.subscribe();
        loop {
            let phase = rx.borrow_and_update().phase.clone();
            if let ConversationPhase::Ready(result) = phase {
                return Some(result.conversation_id);
            }
            if rx.changed().await.is_err() {
                return None;
            }
        }
    }

    async fn deliver(&self, conversation_id: &ConversationId, text: &str) {
        let client = match self.deps.inbox.client() {
            Some(client) => client,
            None => {
                warn!(
                    "conversation for {}: no live client, outbound message not sent",
                    self.client_id
                );
                return;
            }
        };
        match client.send_text(conversation_id, text).await {
            Ok(()) => {
                let row = MessageRow {
                    message_id: MessageId::random().value,
                    conversation_id: conversation_id.value.clone(),
                    client_id: self.client_id.value.clone(),
                    sender_inbox_id: client.inbox_id().value,
                    text: text.to_string(),
                    timestamp_ms: now_ms(),
                };
                if let Err(err) = self.deps.store.insert_message(row) {
                    warn!(
                        "conversation for {}: recording sent message: {err}",
                        self.client_id
                    );
                }
                if let Err(err) = self.deps.store.record_activity(&self.client_id, now_ms()) {
                    debug!(
                        "conversation for {}: activity bump skipped: {err}",
                        self.client_id
                    );
                }
            }
            Err(err) => {
                warn!(
                    "conversation for {}: outbound send failed: {err}",
                    self.client_id
                );
            }
        }
    }
}
