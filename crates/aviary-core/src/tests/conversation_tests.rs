use super::{base_config, build_fleet, build_fleet_on, wait_until};
use crate::conversation::ConversationPhase;
use crate::error::CoreError;
use crate::time::now_ms;
use aviary_api::invite::{InviteError, SignedInvite};
use aviary_api::types::{ClientId, ConversationOrigin};
use serde_json::json;

#[tokio::test]
async fn create_reaches_ready_with_published_conversation() {
    let t = build_fleet(base_config());
    let client = ClientId::generate();
    t.fleet.register(&client).await.unwrap();

    let result = t.fleet.create_conversation(&client).await.unwrap();

    assert_eq!(result.origin, ConversationOrigin::Created);
    assert!(t.protocol.is_published(&result.conversation_id));
    let row = t.store.conversation(&result.conversation_id).unwrap();
    assert!(row.joined);
    assert!(row.invite_tag.is_some());
    assert!(t.store.activity_for(&client).unwrap().last_activity_ms.is_some());
}

#[tokio::test]
async fn join_completes_when_welcome_lands() {
    let a = build_fleet(base_config());
    let creator = ClientId::generate();
    let creator_inbox = a.fleet.register(&creator).await.unwrap();
    let created = a.fleet.create_conversation(&creator).await.unwrap();
    let code = a
        .fleet
        .invite_for(&creator, &created.conversation_id)
        .unwrap();

    // The joiner lives in its own process: same network, nothing local.
    let b = build_fleet_on(base_config(), a.protocol.clone());
    let joiner = ClientId::generate();
    let joiner_inbox = b.fleet.register(&joiner).await.unwrap();

    let fleet = b.fleet.clone();
    let joiner_for_task = joiner.clone();
    let code_for_task = code.clone();
    let join = tokio::spawn(async move {
        fleet
            .join_conversation(&joiner_for_task, &code_for_task)
            .await
    });

    wait_until("pending invite", || b.store.has_pending_invite(&joiner)).await;
    assert!(a
        .protocol
        .sent_dms()
        .iter()
        .any(|dm| dm.to == creator_inbox));

    // The welcome notification writes the joined row that releases the
    // machine's blocking wait.
    b.fleet
        .handle_push(&json!({
            "topic": format!("inbox/{}", joiner_inbox.value),
            "welcome": {
                "conversation_id": created.conversation_id.value,
                "actionable": true,
            },
        }))
        .await
        .unwrap();

    let result = join.await.unwrap().unwrap();
    assert_eq!(result.origin, ConversationOrigin::Joined);
    assert_eq!(result.conversation_id, created.conversation_id);
    assert!(!b.store.has_pending_invite(&joiner));
    // The placeholder row was replaced by the real one.
    let rows = b.store.conversations_for_client(&joiner);
    assert_eq!(rows.len(), 1);
    assert!(rows[0].joined);
}

#[tokio::test]
async fn reported_invite_error_short_circuits_the_wait() {
    let a = build_fleet(base_config());
    let creator = ClientId::generate();
    a.fleet.register(&creator).await.unwrap();
    let created = a.fleet.create_conversation(&creator).await.unwrap();
    let code = a
        .fleet
        .invite_for(&creator, &created.conversation_id)
        .unwrap();
    let tag = SignedInvite::decode(&code).unwrap().tag;

    let b = build_fleet_on(base_config(), a.protocol.clone());
    let joiner = ClientId::generate();
    b.fleet.register(&joiner).await.unwrap();

    let fleet = b.fleet.clone();
    let joiner_for_task = joiner.clone();
    let join = tokio::spawn(async move {
        fleet.join_conversation(&joiner_for_task, &code).await
    });
    wait_until("pending invite", || b.store.has_pending_invite(&joiner)).await;

    assert!(b.fleet.report_invite_error(&tag, "invite already used"));

    let err = join.await.unwrap().unwrap_err();
    assert!(matches!(err, CoreError::Protocol(_)));
    assert!(matches!(
        b.fleet.observe_conversation(&joiner).borrow().phase,
        ConversationPhase::JoinFailed { .. }
    ));
    assert!(!b.store.has_pending_invite(&joiner));

    // Reset clears the failure so a different code can be tried.
    b.fleet.reset_conversation(&joiner).await.unwrap();
    assert_eq!(
        b.fleet.observe_conversation(&joiner).borrow().phase,
        ConversationPhase::Uninitialized
    );
}

#[tokio::test]
async fn garbage_code_fails_as_malformed() {
    let t = build_fleet(base_config());
    let client = ClientId::generate();
    t.fleet.register(&client).await.unwrap();

    let err = t
        .fleet
        .join_conversation(&client, "not an invite")
        .await
        .unwrap_err();
    assert_eq!(err, CoreError::Invite(InviteError::Malformed));
}

#[tokio::test]
async fn expired_invite_fails_before_join_starts() {
    let t = build_fleet(base_config());
    let creator = ClientId::generate();
    t.fleet.register(&creator).await.unwrap();
    let created = t.fleet.create_conversation(&creator).await.unwrap();

    let key = t
        .identities()
        .by_client(&creator)
        .unwrap()
        .signing_key()
        .unwrap();
    let now = now_ms();
    let invite = SignedInvite::sign(
        &key,
        created.conversation_id.value.clone(),
        now - 1_000,
        now + 60_000,
    )
    .unwrap();

    let joiner = ClientId::generate();
    t.fleet.register(&joiner).await.unwrap();
    let err = t
        .fleet
        .join_conversation(&joiner, &invite.encode().unwrap())
        .await
        .unwrap_err();
    assert_eq!(err, CoreError::Invite(InviteError::InviteExpired));
    assert!(!t.store.has_pending_invite(&joiner));
}

#[tokio::test]
async fn restart_reopens_an_existing_conversation() {
    let t = build_fleet(base_config());
    let client = ClientId::generate();
    let inbox = t.fleet.register(&client).await.unwrap();
    let created = t.fleet.create_conversation(&client).await.unwrap();

    // Fresh fleet over the same durable state; its conversation machine
    // starts uninitialized and adopts the stored row.
    let fleet2 = crate::Fleet::new(
        base_config(),
        t.secret.clone(),
        t.store.clone(),
        std::sync::Arc::new(t.protocol.clone()),
        std::sync::Arc::new(t.backend.clone()),
    );
    fleet2.authorize(&client, &inbox).await.unwrap();
    let result = fleet2
        .use_existing_conversation(&client, created.conversation_id.clone())
        .await
        .unwrap();
    assert_eq!(result.origin, ConversationOrigin::Existing);
    assert_eq!(result.conversation_id, created.conversation_id);
}

#[tokio::test]
async fn validate_with_matching_joined_row_short_circuits_to_existing() {
    let t = build_fleet(base_config());
    let creator = ClientId::generate();
    t.fleet.register(&creator).await.unwrap();
    let created = t.fleet.create_conversation(&creator).await.unwrap();
    let code = t
        .fleet
        .invite_for(&creator, &created.conversation_id)
        .unwrap();

    // The creator's own machine is already ready; a second machine seeing
    // the same tag with an intact identity resolves without joining.
    let other = ClientId::generate();
    t.fleet.register(&other).await.unwrap();
    let result = t.fleet.join_conversation(&other, &code).await.unwrap();
    assert_eq!(result.origin, ConversationOrigin::Existing);
    assert_eq!(result.conversation_id, created.conversation_id);
}
