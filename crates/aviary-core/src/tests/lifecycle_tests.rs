use super::{base_config, build_fleet};
use crate::config::CoreConfig;
use crate::error::CoreError;
use crate::time::now_ms;
use aviary_api::types::ClientId;

fn small_config(max: usize) -> CoreConfig {
    CoreConfig {
        max_awake_inboxes: max,
        ..base_config()
    }
}

#[tokio::test]
async fn capacity_evicts_least_recently_active() {
    let t = build_fleet(small_config(2));
    let a = ClientId::generate();
    let b = ClientId::generate();
    let c = ClientId::generate();
    t.fleet.register(&a).await.unwrap();
    t.fleet.register(&b).await.unwrap();

    // a is fresh, b went quiet long ago.
    t.store.record_activity(&a, now_ms()).unwrap();
    t.store.record_activity(&b, now_ms() - 60_000).unwrap();

    t.fleet.register(&c).await.unwrap();

    assert!(t.fleet.lifecycle().is_awake(&a).await);
    assert!(!t.fleet.lifecycle().is_awake(&b).await);
    assert!(t.fleet.lifecycle().is_awake(&c).await);
    assert!(t.fleet.lifecycle().awake_clients().await.len() <= 2);
    assert!(t.fleet.lifecycle().sleep_time_of(&b).await.is_some());
}

#[tokio::test]
async fn protection_window_blocks_eviction_entirely() {
    let t = build_fleet(CoreConfig {
        max_awake_inboxes: 1,
        eviction_protection_window_ms: 10 * 60 * 1000,
        ..base_config()
    });
    let a = ClientId::generate();
    let b = ClientId::generate();
    t.fleet.register(&a).await.unwrap();

    // a was just created, so it cannot be ranked for eviction yet; b has
    // no pending invite, so the wake fails with a capacity error.
    let err = t.fleet.register(&b).await.unwrap_err();
    assert_eq!(err, CoreError::Capacity);
    assert!(t.fleet.lifecycle().is_awake(&a).await);
    assert!(!t.fleet.lifecycle().is_awake(&b).await);
}

#[tokio::test]
async fn pending_invite_refuses_sleep() {
    let t = build_fleet(base_config());
    let a = ClientId::generate();
    t.fleet.register(&a).await.unwrap();
    t.store.set_pending_invite(&a, "tag-a", now_ms()).unwrap();

    t.fleet.sleep(&a).await.unwrap();
    assert!(t.fleet.lifecycle().is_awake(&a).await);
    assert!(t.fleet.lifecycle().sleeping_clients().await.is_empty());

    t.store.clear_pending_invite(&a).unwrap();
    t.fleet.sleep(&a).await.unwrap();
    assert!(!t.fleet.lifecycle().is_awake(&a).await);
}

#[tokio::test]
async fn pending_invite_wake_may_exceed_capacity() {
    let t = build_fleet(small_config(1));
    let a = ClientId::generate();
    let b = ClientId::generate();
    t.fleet.register(&a).await.unwrap();
    t.fleet.set_active_client(Some(a.clone())).await;

    // The only occupant is protected and the target holds an invite, so
    // the wake goes through over the cap.
    t.store.set_pending_invite(&b, "tag-b", now_ms()).unwrap();
    t.fleet.register(&b).await.unwrap();

    assert!(t.fleet.lifecycle().is_awake(&a).await);
    assert!(t.fleet.lifecycle().is_awake(&b).await);
    assert_eq!(t.fleet.lifecycle().awake_clients().await.len(), 2);
}

#[tokio::test]
async fn rebalance_is_idempotent() {
    let t = build_fleet(small_config(2));
    let a = ClientId::generate();
    let b = ClientId::generate();
    let c = ClientId::generate();
    t.fleet.register(&a).await.unwrap();
    t.fleet.register(&b).await.unwrap();
    t.store.record_activity(&a, now_ms()).unwrap();
    t.store.record_activity(&b, now_ms() - 60_000).unwrap();
    t.fleet.register(&c).await.unwrap();

    t.fleet.rebalance().await.unwrap();
    let awake_first: Vec<_> = {
        let mut v: Vec<String> = t
            .fleet
            .lifecycle()
            .awake_clients()
            .await
            .into_iter()
            .map(|c| c.value)
            .collect();
        v.sort();
        v
    };
    let slept_first = t.fleet.lifecycle().sleep_time_of(&b).await;

    t.fleet.rebalance().await.unwrap();
    let awake_second: Vec<_> = {
        let mut v: Vec<String> = t
            .fleet
            .lifecycle()
            .awake_clients()
            .await
            .into_iter()
            .map(|c| c.value)
            .collect();
        v.sort();
        v
    };
    // No transitions the second time: same partition, untouched sleep time.
    assert_eq!(awake_first, awake_second);
    assert_eq!(slept_first, t.fleet.lifecycle().sleep_time_of(&b).await);
}

fn windowed_config(max: usize) -> CoreConfig {
    CoreConfig {
        max_awake_inboxes: max,
        eviction_protection_window_ms: 10 * 60 * 1000,
        ..base_config()
    }
}

#[tokio::test]
async fn launch_reconstructs_partition_without_waking_excess() {
    let t = build_fleet(windowed_config(1));
    let a = ClientId::generate();
    let b = ClientId::generate();
    t.fleet.register(&a).await.unwrap();
    // a sits inside the protection window, so b cannot take its slot and
    // goes to sleep as soon as it has registered.
    let err = t.fleet.register(&b).await.unwrap_err();
    assert_eq!(err, CoreError::Capacity);
    t.store.record_activity(&a, now_ms()).unwrap();

    // Fresh fleet over the same durable state, as after a process restart.
    let fleet2 = crate::Fleet::new(
        windowed_config(1),
        t.secret.clone(),
        t.store.clone(),
        std::sync::Arc::new(t.protocol.clone()),
        std::sync::Arc::new(t.backend.clone()),
    );
    fleet2.initialize_on_app_launch().await.unwrap();

    assert!(fleet2.lifecycle().is_awake(&a).await);
    assert!(!fleet2.lifecycle().is_awake(&b).await);
    let sleeping = fleet2.lifecycle().sleeping_clients().await;
    assert_eq!(sleeping.len(), 1);
    assert_eq!(sleeping[0], b);
}

#[tokio::test]
async fn refused_registration_leaves_no_live_machine_behind() {
    let t = build_fleet(windowed_config(1));
    let a = ClientId::generate();
    let b = ClientId::generate();
    t.fleet.register(&a).await.unwrap();

    let err = t.fleet.register(&b).await.unwrap_err();
    assert_eq!(err, CoreError::Capacity);
    // b exists durably but its resources came back down, and the
    // scheduler accounts for it as sleeping.
    assert!(!t.fleet.lifecycle().is_awake(&b).await);
    assert!(t.fleet.lifecycle().sleep_time_of(&b).await.is_some());
    let phase = t.fleet.observe_inbox(&b).borrow().phase.clone();
    assert_eq!(phase, crate::inbox::InboxPhase::Idle);
}

#[tokio::test]
async fn rebalance_keeps_active_inside_capacity() {
    let t = build_fleet(small_config(1));
    let a = ClientId::generate();
    let b = ClientId::generate();
    t.fleet.register(&b).await.unwrap();
    t.fleet.register(&a).await.unwrap(); // takes b's slot
    t.fleet.set_active_client(Some(a.clone())).await;
    t.store.record_activity(&b, now_ms()).unwrap();

    // b is the more recently active, but the active client holds the
    // only slot: the cap must survive repeated rebalances.
    t.fleet.rebalance().await.unwrap();
    assert!(t.fleet.lifecycle().is_awake(&a).await);
    assert!(!t.fleet.lifecycle().is_awake(&b).await);
    assert_eq!(t.fleet.lifecycle().awake_clients().await.len(), 1);
    t.fleet.rebalance().await.unwrap();
    assert_eq!(t.fleet.lifecycle().awake_clients().await.len(), 1);
}
