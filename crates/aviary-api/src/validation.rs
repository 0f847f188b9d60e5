use crate::types::*;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("empty field {0}")]
    Empty(&'static str),
    #[error("too long {0}")]
    TooLong(&'static str),
    #[error("invalid {0}")]
    Invalid(&'static str),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidationLimits {
    pub max_text_bytes: usize,
    pub max_id_len: usize,
}

impl Default for ValidationLimits {
    fn default() -> Self {
        Self {
            max_text_bytes: 256 * 1024,
            max_id_len: 128,
        }
    }
}

pub fn validate_client_id(id: &ClientId, limits: &ValidationLimits) -> Result<(), ValidationError> {
    if id.value.trim().is_empty() {
        return Err(ValidationError::Empty("client_id"));
    }
    if id.value.len() > limits.max_id_len {
        return Err(ValidationError::TooLong("client_id"));
    }
    Ok(())
}

pub fn validate_inbox_id(id: &InboxId, limits: &ValidationLimits) -> Result<(), ValidationError> {
    if id.value.trim().is_empty() {
        return Err(ValidationError::Empty("inbox_id"));
    }
    if id.value.len() > limits.max_id_len {
        return Err(ValidationError::TooLong("inbox_id"));
    }
    if !id.value.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(ValidationError::Invalid("inbox_id"));
    }
    Ok(())
}

pub fn validate_message_text(
    text: &str,
    limits: &ValidationLimits,
) -> Result<(), ValidationError> {
    if text.is_empty() {
        return Err(ValidationError::Empty("text"));
    }
    if text.len() > limits.max_text_bytes {
        return Err(ValidationError::TooLong("text"));
    }
    Ok(())
}
