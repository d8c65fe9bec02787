//! Client key handling.

use serde::{Deserialize, Serialize};

/// Identifies the subject a quota applies to.
///
/// The key is opaque to the engine and used only as the store's primary key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientKey(String);

impl ClientKey {
    /// Wrap an externally derived identifier.
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Key for a session accessing a resource path, as `{session}++{uri}`.
    pub fn for_session(session_id: &str, uri: &str) -> Self {
        Self(format!("{}++{}", session_id, uri))
    }

    /// The key as stored.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for ClientKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

impl From<&str> for ClientKey {
    fn from(key: &str) -> Self {
        Self(key.to_string())
    }
}

impl std::fmt::Display for ClientKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
