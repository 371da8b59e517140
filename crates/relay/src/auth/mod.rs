pub mod jwt;
pub mod middleware;

use courier_common::types::UserId;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum IdentityError {
    #[error("invalid token")]
    Invalid,
    #[error("token expired")]
    Expired,
}

/// Resolves an opaque credential to the user it was issued for.
///
/// The relay never sees passwords or sessions; whatever issued the credential
/// only has to agree with the verifier on how a user id is encoded.
pub trait IdentityVerifier: Send + Sync {
    fn verify(&self, credential: &str) -> Result<UserId, IdentityError>;
}
