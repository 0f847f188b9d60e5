use super::{base_config, build_fleet};
use aviary_api::types::{ClientId, InboxId};

#[tokio::test]
async fn stale_messages_never_wake_a_sleeping_inbox() {
    let t = build_fleet(base_config());
    let client = ClientId::generate();
    t.fleet.register(&client).await.unwrap();
    let created = t.fleet.create_conversation(&client).await.unwrap();

    t.fleet.sleep(&client).await.unwrap();
    let slept_at = t.fleet.lifecycle().sleep_time_of(&client).await.unwrap();

    t.protocol.inject_remote_message(
        &created.conversation_id,
        &InboxId::new("feedface"),
        "old news",
        slept_at.saturating_sub(5_000),
    );
    t.fleet.checker().sweep().await;

    assert!(!t.fleet.lifecycle().is_awake(&client).await);
}

#[tokio::test]
async fn fresh_message_promotes_on_next_sweep() {
    let t = build_fleet(base_config());
    let client = ClientId::generate();
    t.fleet.register(&client).await.unwrap();
    let created = t.fleet.create_conversation(&client).await.unwrap();

    t.fleet.sleep(&client).await.unwrap();
    let slept_at = t.fleet.lifecycle().sleep_time_of(&client).await.unwrap();

    t.protocol.inject_remote_message(
        &created.conversation_id,
        &InboxId::new("feedface"),
        "you there?",
        slept_at + 5_000,
    );
    t.fleet.checker().sweep().await;

    assert!(t.fleet.lifecycle().is_awake(&client).await);
}

#[tokio::test]
async fn sweep_without_conversations_touches_nothing() {
    let t = build_fleet(base_config());
    let client = ClientId::generate();
    t.fleet.register(&client).await.unwrap();
    t.fleet.sleep(&client).await.unwrap();

    t.fleet.checker().sweep().await;
    assert!(!t.fleet.lifecycle().is_awake(&client).await);
}
