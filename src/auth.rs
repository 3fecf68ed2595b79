//! Credential validation and role mapping.
//!
//! Presented credentials are compared against the configured sets in
//! constant time so response timing reveals nothing about how much of a
//! guess matched. Admin credentials are checked first. The endpoint
//! allow-list (root, health, metrics scrape) lives at the HTTP boundary,
//! not here.

use serde::Serialize;

use crate::{MimirError, Result};

/// Role attached to an authenticated credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Admin,
}

/// Maps a presented credential to a role or a rejection.
pub struct Authenticator {
    header_name: String,
    admin_credentials: Vec<String>,
    user_credentials: Vec<String>,
}

impl Authenticator {
    /// Create an authenticator reading credentials from `header_name`.
    pub fn new(
        header_name: impl Into<String>,
        admin_credentials: Vec<String>,
        user_credentials: Vec<String>,
    ) -> Self {
        Self {
            header_name: header_name.into().to_ascii_lowercase(),
            admin_credentials,
            user_credentials,
        }
    }

    /// Header the credential is read from (lowercase).
    pub fn header_name(&self) -> &str {
        &self.header_name
    }

    /// Validate a presented credential.
    ///
    /// Fails with [`MimirError::Unauthenticated`] when the header was
    /// missing or the value matches no configured credential.
    pub fn authenticate(&self, presented: Option<&str>) -> Result<Role> {
        let presented = presented.ok_or(MimirError::Unauthenticated)?;
        for credential in &self.admin_credentials {
            if constant_time_eq(presented.as_bytes(), credential.as_bytes()) {
                return Ok(Role::Admin);
            }
        }
        for credential in &self.user_credentials {
            if constant_time_eq(presented.as_bytes(), credential.as_bytes()) {
                return Ok(Role::User);
            }
        }
        Err(MimirError::Unauthenticated)
    }
}

/// Constant-time byte equality. Lengths are not secret; for equal
/// lengths the comparison touches every byte regardless of where the
/// first difference sits.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}
