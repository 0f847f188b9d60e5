use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct CoreConfig {
    pub storage_path: String,
    pub namespace: String,
    pub max_awake_inboxes: usize,
    /// Inboxes younger than this are never evicted; they have no
    /// activity signal to rank them yet.
    pub eviction_protection_window_ms: u64,
    pub checker_interval_ms: u64,
    pub spare_enabled: bool,
    pub invite_ttl_ms: u64,
    pub conversation_ttl_ms: u64,
    pub action_queue_depth: usize,
    pub ready_timeout_ms: u64,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            storage_path: ".aviary".to_string(),
            namespace: "default".to_string(),
            max_awake_inboxes: 25,
            eviction_protection_window_ms: 10 * 60 * 1000,
            checker_interval_ms: 60 * 1000,
            spare_enabled: true,
            invite_ttl_ms: 7 * 24 * 60 * 60 * 1000,
            conversation_ttl_ms: 30 * 24 * 60 * 60 * 1000,
            action_queue_depth: 32,
            ready_timeout_ms: 15 * 1000,
        }
    }
}
