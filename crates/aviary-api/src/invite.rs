use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use blake3::Hasher;
use k256::ecdsa::{RecoveryId, Signature, SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::InboxId;

const SIGNING_DOMAIN: &[u8] = b"aviary:invite:v1";

/// A signed, expirable token permitting one recipient to join a specific
/// conversation. Never trusted without recovering the signer's key from
/// the signature and comparing it against `creator_inbox_id`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SignedInvite {
    pub conversation_token: String,
    pub tag: String,
    pub creator_inbox_id: String,
    pub expires_at_ms: u64,
    pub conversation_expires_at_ms: u64,
    pub signature: Vec<u8>,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum InviteError {
    #[error("malformed invite")]
    Malformed,
    #[error("invite signature")]
    Signature,
    #[error("invite expired")]
    InviteExpired,
    #[error("conversation expired")]
    ConversationExpired,
}

/// Derives the protocol-assigned inbox id for a signing key: the blake3
/// hash of the compressed public point, hex encoded.
pub fn inbox_id_for_key(key: &VerifyingKey) -> InboxId {
    let mut hasher = Hasher::new();
    hasher.update(key.to_encoded_point(true).as_bytes());
    InboxId::new(hasher.finalize().to_hex().to_string())
}

/// Short public tag binding invite and conversation row, derived from the
/// conversation token so both sides compute the same value.
pub fn tag_for_token(conversation_token: &str) -> String {
    let mut hasher = Hasher::new();
    hasher.update(b"aviary:tag:v1");
    hasher.update(conversation_token.as_bytes());
    hex::encode(&hasher.finalize().as_bytes()[..16])
}

fn signing_payload(
    conversation_token: &str,
    tag: &str,
    creator_inbox_id: &str,
    expires_at_ms: u64,
    conversation_expires_at_ms: u64,
) -> [u8; 32] {
    let mut hasher = Hasher::new();
    hasher.update(SIGNING_DOMAIN);
    hasher.update(conversation_token.as_bytes());
    hasher.update(tag.as_bytes());
    hasher.update(creator_inbox_id.as_bytes());
    hasher.update(&expires_at_ms.to_be_bytes());
    hasher.update(&conversation_expires_at_ms.to_be_bytes());
    *hasher.finalize().as_bytes()
}

impl SignedInvite {
    pub fn sign(
        key: &SigningKey,
        conversation_token: impl Into<String>,
        expires_at_ms: u64,
        conversation_expires_at_ms: u64,
    ) -> Result<Self, InviteError> {
        let conversation_token = conversation_token.into();
        let tag = tag_for_token(&conversation_token);
        let creator_inbox_id = inbox_id_for_key(key.verifying_key()).value;
        let payload = signing_payload(
            &conversation_token,
            &tag,
            &creator_inbox_id,
            expires_at_ms,
            conversation_expires_at_ms,
        );
        let (signature, recovery) = key
            .sign_recoverable(&payload)
            .map_err(|_| InviteError::Signature)?;
        let mut bytes = signature.to_bytes().to_vec();
        bytes.push(recovery.to_byte());
        Ok(Self {
            conversation_token,
            tag,
            creator_inbox_id,
            expires_at_ms,
            conversation_expires_at_ms,
            signature: bytes,
        })
    }

    pub fn encode(&self) -> Result<String, InviteError> {
        let json = serde_json::to_vec(self).map_err(|_| InviteError::Malformed)?;
        Ok(STANDARD.encode(json))
    }

    pub fn decode(code: &str) -> Result<Self, InviteError> {
        let bytes = STANDARD
            .decode(code.trim())
            .map_err(|_| InviteError::Malformed)?;
        serde_json::from_slice(&bytes).map_err(|_| InviteError::Malformed)
    }

    /// Signature recovery first, expiry checks after: a bad signature must
    /// surface as `Signature` regardless of the expiry fields, and an
    /// expired invite surfaces before an expired conversation.
    pub fn verify(&self, now_ms: u64) -> Result<(), InviteError> {
        let recovered = self.recover_signer()?;
        if inbox_id_for_key(&recovered).value != self.creator_inbox_id {
            return Err(InviteError::Signature);
        }
        if now_ms >= self.expires_at_ms {
            return Err(InviteError::InviteExpired);
        }
        if now_ms >= self.conversation_expires_at_ms {
            return Err(InviteError::ConversationExpired);
        }
        Ok(())
    }

    fn recover_signer(&self) -> Result<VerifyingKey, InviteError> {
        if self.signature.len() != 65 {
            return Err(InviteError::Malformed);
        }
        let signature =
            Signature::from_slice(&self.signature[..64]).map_err(|_| InviteError::Malformed)?;
        let recovery =
            RecoveryId::from_byte(self.signature[64]).ok_or(InviteError::Malformed)?;
        let payload = signing_payload(
            &self.conversation_token,
            &self.tag,
            &self.creator_inbox_id,
            self.expires_at_ms,
            self.conversation_expires_at_ms,
        );
        VerifyingKey::recover_from_msg(&payload, &signature, recovery)
            .map_err(|_| InviteError::Signature)
    }

    pub fn creator(&self) -> InboxId {
        InboxId::new(self.creator_inbox_id.clone())
    }
}
