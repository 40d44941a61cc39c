//! Session gate
//!
//! The hub asks a [`SessionGate`] whether a credential belongs to an
//! authorized session before admitting a subscriber. Issuing, storing and
//! hashing credentials happens elsewhere.

use crate::config::AuthConfig;
use crate::error::GateError;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Identity of an authorized viewer
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        UserId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for UserId {
    fn from(id: &str) -> Self {
        UserId(id.to_string())
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Answers "is this session authorized"
#[cfg_attr(test, mockall::automock)]
pub trait SessionGate: Send + Sync {
    /// Validate a bearer credential
    ///
    /// # Returns
    ///
    /// * `Ok(UserId)` - the session is authorized
    /// * `Err(GateError::InvalidToken)` - the credential is unknown or expired
    /// * `Err(GateError::Unavailable)` - the gate could not decide
    fn authorize(&self, token: &str) -> Result<UserId, GateError>;
}

/// Gate backed by a fixed token table from configuration
#[derive(Debug, Clone, Default)]
pub struct StaticTokenGate {
    tokens: BTreeMap<String, UserId>,
}

impl StaticTokenGate {
    pub fn new(tokens: BTreeMap<String, UserId>) -> Self {
        Self { tokens }
    }

    /// Build the gate from the `[auth.tokens]` table (token = user id)
    pub fn from_config(config: &AuthConfig) -> Self {
        let tokens: BTreeMap<String, UserId> = config
            .tokens
            .iter()
            .map(|(token, user)| (token.clone(), UserId::new(user.clone())))
            .collect();
        info!("Session gate loaded with {} token(s)", tokens.len());
        Self::new(tokens)
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl SessionGate for StaticTokenGate {
    fn authorize(&self, token: &str) -> Result<UserId, GateError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(GateError::InvalidToken);
        }
        match self.tokens.get(token) {
            Some(user) => Ok(user.clone()),
            None => {
                debug!("Rejected unknown session token");
                Err(GateError::InvalidToken)
            }
        }
    }
}
