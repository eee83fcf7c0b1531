//! Derivation of the instance token.
//!
//! The instance token is a short namespace derived from the account identifier. It keeps the
//! telemetry of one running instance apart from every other instance sharing the same store,
//! without writing the raw account identifier into channel or key names.

use std::fmt::Display;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use sha2::{Digest, Sha256};

/// Number of characters kept from the encoded digest.
pub const TOKEN_LENGTH: usize = 7;

/// Error returned by [`derive`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentityError {
    /// The user identifier was empty.
    #[error("invalid argument: user id must not be empty")]
    InvalidArgument,
}

/// Short, alphanumeric, deterministic namespace token.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InstanceToken(String);

impl InstanceToken {
    /// The token as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for InstanceToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for InstanceToken {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Derive the instance token of `user_id`.
///
/// SHA-256 digest, standard base64, non-alphanumeric characters stripped, last
/// [`TOKEN_LENGTH`] characters kept.
///
/// # Errors
/// [`IdentityError::InvalidArgument`] if `user_id` is empty.
pub fn derive(user_id: &str) -> Result<InstanceToken, IdentityError> {
    if user_id.is_empty() {
        return Err(IdentityError::InvalidArgument);
    }
    let digest = Sha256::digest(user_id.as_bytes());
    let encoded = STANDARD.encode(digest);
    let alphanumeric = encoded
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .collect::<Vec<_>>();
    let start = alphanumeric.len().saturating_sub(TOKEN_LENGTH);
    Ok(InstanceToken(alphanumeric[start..].iter().collect()))
}
