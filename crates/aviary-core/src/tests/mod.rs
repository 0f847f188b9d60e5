mod checker_tests;
mod conversation_tests;
mod inbox_tests;
mod lifecycle_tests;
mod ordering_tests;
mod push_tests;

use crate::backend::InMemoryBackend;
use crate::config::CoreConfig;
use crate::keys::{IdentityStore, InMemorySecretStore};
use crate::protocol::InMemoryProtocol;
use crate::storage::DurableStore;
use crate::Fleet;
use std::sync::Arc;
use std::time::Duration;

pub struct TestFleet {
    pub fleet: Arc<Fleet>,
    pub protocol: InMemoryProtocol,
    pub backend: InMemoryBackend,
    pub secret: Arc<InMemorySecretStore>,
    pub store: DurableStore,
}

impl TestFleet {
    pub fn identities(&self) -> IdentityStore {
        IdentityStore::new(self.secret.clone())
    }
}

pub fn base_config() -> CoreConfig {
    CoreConfig {
        max_awake_inboxes: 3,
        eviction_protection_window_ms: 0,
        checker_interval_ms: 10_000,
        spare_enabled: false,
        ready_timeout_ms: 2_000,
        ..CoreConfig::default()
    }
}

pub fn build_fleet(config: CoreConfig) -> TestFleet {
    build_fleet_on(config, InMemoryProtocol::new())
}

/// Second fleet on the same simulated network: distinct stores and
/// secrets, shared protocol fake.
pub fn build_fleet_on(config: CoreConfig, protocol: InMemoryProtocol) -> TestFleet {
    let backend = InMemoryBackend::new();
    let secret = Arc::new(InMemorySecretStore::new());
    let store = DurableStore::in_memory();
    let fleet = Fleet::new(
        config,
        secret.clone(),
        store.clone(),
        Arc::new(protocol.clone()),
        Arc::new(backend.clone()),
    );
    TestFleet {
        fleet,
        protocol,
        backend,
        secret,
        store,
    }
}

/// Polls until the condition holds; panics after two seconds.
pub async fn wait_until<F: Fn() -> bool>(what: &str, cond: F) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}
