use super::{base_config, build_fleet};
use crate::storage::{ConversationRow, MemberRow};
use crate::time::now_ms;
use aviary_api::types::{ClientId, Consent, NotificationOutcome};
use serde_json::json;

#[tokio::test]
async fn inbound_message_decodes_with_sender_and_body() {
    let t = build_fleet(base_config());
    let client = ClientId::generate();
    let inbox = t.fleet.register(&client).await.unwrap();
    let created = t.fleet.create_conversation(&client).await.unwrap();

    let outcome = t
        .fleet
        .handle_push(&json!({
            "topic": format!("inbox/{}", inbox.value),
            "conversation_id": created.conversation_id.value,
            "sender_inbox_id": "feedfacefeedface",
            "text": "hello there",
            "sent_at_ms": now_ms(),
        }))
        .await
        .unwrap();

    match outcome {
        NotificationOutcome::Decoded(note) => {
            assert_eq!(note.title, "feedface");
            assert_eq!(note.body, "hello there");
            assert_eq!(note.conversation_id, Some(created.conversation_id.clone()));
        }
        NotificationOutcome::Dropped => panic!("expected a decoded notification"),
    }
    assert_eq!(
        t.store.messages_for_conversation(&created.conversation_id).len(),
        1
    );
}

#[tokio::test]
async fn self_sent_message_is_dropped() {
    let t = build_fleet(base_config());
    let client = ClientId::generate();
    let inbox = t.fleet.register(&client).await.unwrap();
    let created = t.fleet.create_conversation(&client).await.unwrap();

    let outcome = t
        .fleet
        .handle_push(&json!({
            "topic": format!("inbox/{}", inbox.value),
            "conversation_id": created.conversation_id.value,
            "sender_inbox_id": inbox.value,
            "text": "echo",
        }))
        .await
        .unwrap();
    assert_eq!(outcome, NotificationOutcome::Dropped);
}

#[tokio::test]
async fn dm_from_unknown_sender_is_dropped_as_spam() {
    let t = build_fleet(base_config());
    let client = ClientId::generate();
    let inbox = t.fleet.register(&client).await.unwrap();

    // No local conversation row and no member row for the sender.
    let outcome = t
        .fleet
        .handle_push(&json!({
            "topic": format!("inbox/{}", inbox.value),
            "conversation_id": "unknown-conversation",
            "sender_inbox_id": "feedfacefeedface",
            "text": "buy now",
        }))
        .await
        .unwrap();
    assert_eq!(outcome, NotificationOutcome::Dropped);

    // A member row for the sender makes the same payload deliverable.
    t.store
        .upsert_member(MemberRow {
            conversation_id: "unknown-conversation".to_string(),
            inbox_id: "feedfacefeedface".to_string(),
            consent: Consent::Allowed,
        })
        .unwrap();
    let outcome = t
        .fleet
        .handle_push(&json!({
            "topic": format!("inbox/{}", inbox.value),
            "conversation_id": "unknown-conversation",
            "sender_inbox_id": "feedfacefeedface",
            "text": "hello again",
        }))
        .await
        .unwrap();
    assert!(matches!(outcome, NotificationOutcome::Decoded(_)));
}

#[tokio::test]
async fn denied_conversation_is_dropped() {
    let t = build_fleet(base_config());
    let client = ClientId::generate();
    let inbox = t.fleet.register(&client).await.unwrap();
    t.store
        .upsert_conversation(ConversationRow {
            conversation_id: "denied-conversation".to_string(),
            client_id: client.value.clone(),
            invite_tag: None,
            unused: false,
            joined: true,
            consent: Consent::Denied,
            created_at_ms: now_ms(),
        })
        .unwrap();

    let outcome = t
        .fleet
        .handle_push(&json!({
            "topic": format!("inbox/{}", inbox.value),
            "conversation_id": "denied-conversation",
            "sender_inbox_id": "feedfacefeedface",
            "text": "spam",
        }))
        .await
        .unwrap();
    assert_eq!(outcome, NotificationOutcome::Dropped);
}

#[tokio::test]
async fn non_actionable_welcome_is_dropped() {
    let t = build_fleet(base_config());
    let client = ClientId::generate();
    let inbox = t.fleet.register(&client).await.unwrap();

    let outcome = t
        .fleet
        .handle_push(&json!({
            "topic": format!("inbox/{}", inbox.value),
            "welcome": {
                "conversation_id": "some-conversation",
                "actionable": false,
            },
        }))
        .await
        .unwrap();
    assert_eq!(outcome, NotificationOutcome::Dropped);
}

#[tokio::test]
async fn push_for_a_sleeping_inbox_wakes_its_client() {
    let t = build_fleet(base_config());
    let client = ClientId::generate();
    let inbox = t.fleet.register(&client).await.unwrap();
    let created = t.fleet.create_conversation(&client).await.unwrap();
    t.fleet.sleep(&client).await.unwrap();

    let outcome = t
        .fleet
        .handle_push(&json!({
            "topic": format!("inbox/{}", inbox.value),
            "conversation_id": created.conversation_id.value,
            "sender_inbox_id": "feedfacefeedface",
            "text": "wake up",
        }))
        .await
        .unwrap();
    assert!(matches!(outcome, NotificationOutcome::Decoded(_)));
    // The bring-up went through the scheduler, so the partition agrees
    // with the machine's state.
    assert!(t.fleet.lifecycle().is_awake(&client).await);
    assert!(t.fleet.lifecycle().sleeping_clients().await.is_empty());
}
