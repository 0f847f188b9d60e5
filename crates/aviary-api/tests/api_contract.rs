use aviary_api::invite::{inbox_id_for_key, tag_for_token, InviteError, SignedInvite};
use aviary_api::types::{ClientId, ConversationId, ConversationOrigin, ConversationReadyResult};
use aviary_api::validation::{validate_message_text, ValidationError, ValidationLimits};
use k256::ecdsa::SigningKey;
use rand::rngs::OsRng;

const FAR_FUTURE_MS: u64 = u64::MAX / 2;

fn invite(key: &SigningKey) -> SignedInvite {
    SignedInvite::sign(key, "token-1", FAR_FUTURE_MS, FAR_FUTURE_MS).expect("sign")
}

#[test]
fn invite_roundtrips_through_wire_encoding() {
    let key = SigningKey::random(&mut OsRng);
    let signed = invite(&key);
    let code = signed.encode().expect("encode");
    let decoded = SignedInvite::decode(&code).expect("decode");
    assert_eq!(decoded, signed);
    assert_eq!(decoded.tag, tag_for_token("token-1"));
    assert_eq!(
        decoded.creator(),
        inbox_id_for_key(key.verifying_key())
    );
    decoded.verify(1_000).expect("verify");
}

#[test]
fn garbage_code_is_malformed() {
    assert_eq!(
        SignedInvite::decode("not base64 at all!").unwrap_err(),
        InviteError::Malformed
    );
    assert_eq!(
        SignedInvite::decode("aGVsbG8=").unwrap_err(),
        InviteError::Malformed
    );
}

#[test]
fn tampered_invite_fails_signature_even_when_expired() {
    let key = SigningKey::random(&mut OsRng);
    let mut signed = SignedInvite::sign(&key, "token-2", 10, 10).expect("sign");
    signed.conversation_token = "token-stolen".to_string();
    // Both expiries are in the past, but the signature check comes first.
    assert_eq!(signed.verify(FAR_FUTURE_MS).unwrap_err(), InviteError::Signature);
}

#[test]
fn wrong_claimed_creator_fails_signature() {
    let key = SigningKey::random(&mut OsRng);
    let other = SigningKey::random(&mut OsRng);
    let mut signed = invite(&key);
    signed.creator_inbox_id = inbox_id_for_key(other.verifying_key()).value;
    assert_eq!(signed.verify(1_000).unwrap_err(), InviteError::Signature);
}

#[test]
fn expired_invite_wins_over_live_conversation() {
    let key = SigningKey::random(&mut OsRng);
    let signed = SignedInvite::sign(&key, "token-3", 100, FAR_FUTURE_MS).expect("sign");
    assert_eq!(signed.verify(100).unwrap_err(), InviteError::InviteExpired);
}

#[test]
fn expired_conversation_is_distinct() {
    let key = SigningKey::random(&mut OsRng);
    let signed = SignedInvite::sign(&key, "token-4", FAR_FUTURE_MS, 100).expect("sign");
    assert_eq!(
        signed.verify(100).unwrap_err(),
        InviteError::ConversationExpired
    );
}

#[test]
fn ready_result_roundtrip() {
    let result = ConversationReadyResult {
        conversation_id: ConversationId::new("conv-1"),
        origin: ConversationOrigin::Joined,
    };
    let encoded = serde_json::to_string(&result).expect("serialize");
    let decoded: ConversationReadyResult = serde_json::from_str(&encoded).expect("deserialize");
    assert_eq!(decoded, result);
}

#[test]
fn client_id_rejects_unknown_fields() {
    let err = serde_json::from_str::<ClientId>(r#"{"value":"a","extra":1}"#);
    assert!(err.is_err());
}

#[test]
fn text_validation_limits() {
    let limits = ValidationLimits {
        max_text_bytes: 4,
        ..ValidationLimits::default()
    };
    assert_eq!(
        validate_message_text("", &limits).unwrap_err(),
        ValidationError::Empty("text")
    );
    assert_eq!(
        validate_message_text("hello", &limits).unwrap_err(),
        ValidationError::TooLong("text")
    );
    validate_message_text("hey", &limits).expect("ok");
}
