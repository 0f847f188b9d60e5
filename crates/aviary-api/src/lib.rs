pub mod invite;
pub mod types;
pub mod validation;

pub use invite::{InviteError, SignedInvite};
pub use types::*;
