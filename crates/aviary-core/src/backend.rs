use crate::error::CoreError;
use aviary_api::types::{ClientId, InboxId};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

/// Backend API seam: device-check authentication, topic subscriptions,
/// installation unregister, attachment upload.
#[async_trait]
pub trait BackendApi: Send + Sync {
    async fn authenticate(&self, client_id: &ClientId) -> Result<String, CoreError>;
    async fn subscribe_topic(&self, token: &str, topic: &str) -> Result<(), CoreError>;
    async fn unsubscribe_topic(&self, token: &str, topic: &str) -> Result<(), CoreError>;
    async fn unregister_installation(&self, inbox_id: &InboxId) -> Result<(), CoreError>;
    async fn upload_attachment(&self, bytes: &[u8]) -> Result<String, CoreError>;
}

#[derive(Default)]
struct BackendState {
    tokens: HashMap<String, String>,
    topics: HashSet<String>,
    unregistered: Vec<String>,
    uploads: usize,
    fail_auth: bool,
    fail_unsubscribe: bool,
}

#[derive(Clone, Default)]
pub struct InMemoryBackend {
    state: Arc<Mutex<BackendState>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_auth(&self, fail: bool) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.fail_auth = fail;
    }

    pub fn fail_unsubscribe(&self, fail: bool) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.fail_unsubscribe = fail;
    }

    pub fn subscribed_topics(&self) -> Vec<String> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let mut topics: Vec<String> = state.topics.iter().cloned().collect();
        topics.sort();
        topics
    }

    pub fn unregistered_inboxes(&self) -> Vec<String> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.unregistered.clone()
    }
}

#[async_trait]
impl BackendApi for InMemoryBackend {
    async fn authenticate(&self, client_id: &ClientId) -> Result<String, CoreError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.fail_auth {
            return Err(CoreError::Backend("auth".to_string()));
        }
        let token = format!("token-{}", client_id.value);
        state.tokens.insert(client_id.value.clone(), token.clone());
        Ok(token)
    }

    async fn subscribe_topic(&self, _token: &str, topic: &str) -> Result<(), CoreError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.topics.insert(topic.to_string());
        Ok(())
    }

    async fn unsubscribe_topic(&self, _token: &str, topic: &str) -> Result<(), CoreError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.fail_unsubscribe {
            return Err(CoreError::Backend("unsubscribe".to_string()));
        }
        state.topics.remove(topic);
        Ok(())
    }

    async fn unregister_installation(&self, inbox_id: &InboxId) -> Result<(), CoreError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.unregistered.push(inbox_id.value.clone());
        Ok(())
    }

    async fn upload_attachment(&self, bytes: &[u8]) -> Result<String, CoreError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.uploads += 1;
        Ok(format!("attachment://{}-{}", state.uploads, bytes.len()))
    }
}
