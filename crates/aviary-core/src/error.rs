use aviary_api::invite::InviteError;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("storage")]
    Storage,
    #[error("validation {0}")]
    Validation(String),
    #[error("protocol {0}")]
    Protocol(String),
    #[error("backend {0}")]
    Backend(String),
    #[error("invite {0}")]
    Invite(#[from] InviteError),
    #[error("at capacity")]
    Capacity,
    #[error("consistency {0}")]
    Consistency(String),
    #[error("not found")]
    NotFound,
    #[error("timeout")]
    Timeout,
    /// Cooperative cancellation. Absorbed at the action loop and the
    /// public call boundary; never surfaced as a user-visible failure.
    #[error("cancelled")]
    Cancelled,
}

impl CoreError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, CoreError::Cancelled)
    }
}
