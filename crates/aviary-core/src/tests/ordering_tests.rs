use super::{base_config, build_fleet, wait_until};
use aviary_api::types::ClientId;

#[tokio::test]
async fn messages_sent_before_ready_arrive_in_order() {
    let t = build_fleet(base_config());
    let client = ClientId::generate();
    t.fleet.register(&client).await.unwrap();

    // Queued while no conversation exists at all.
    t.fleet.send_message(&client, "first").unwrap();
    t.fleet.send_message(&client, "second").unwrap();
    t.fleet.send_message(&client, "third").unwrap();

    let result = t.fleet.create_conversation(&client).await.unwrap();

    wait_until("all three deliveries", || {
        t.protocol.messages_in(&result.conversation_id).len() == 3
    })
    .await;
    let texts: Vec<String> = t
        .protocol
        .messages_in(&result.conversation_id)
        .into_iter()
        .map(|m| m.text)
        .collect();
    assert_eq!(texts, vec!["first", "second", "third"]);
}

#[tokio::test]
async fn empty_message_is_rejected_up_front() {
    let t = build_fleet(base_config());
    let client = ClientId::generate();
    t.fleet.register(&client).await.unwrap();
    assert!(t.fleet.send_message(&client, "").is_err());
}
