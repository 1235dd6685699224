//! Identity key generation and handling.

use std::fmt;

/// The subject of a single admission decision, as presented by a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subject {
    /// Credential value from the credential header, if any
    pub credential: Option<String>,
    /// Client address with any port suffix removed
    pub address: String,
}

impl Subject {
    /// Create a subject from an optional credential and a client address.
    pub fn new(credential: Option<&str>, address: impl Into<String>) -> Self {
        Self {
            credential: credential.map(str::to_string),
            address: address.into(),
        }
    }

    /// A subject identified only by its address.
    pub fn from_address(address: impl Into<String>) -> Self {
        Self {
            credential: None,
            address: address.into(),
        }
    }

    /// The credential, if present and non-empty.
    pub fn credential(&self) -> Option<&str> {
        self.credential.as_deref().filter(|c| !c.is_empty())
    }
}

/// A key that uniquely identifies a rate limited subject in the counting store.
///
/// Keys are namespaced by kind so a credential can never collide with an
/// address of the same text.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum IdentityKey {
    /// Subject identified by its API credential
    Token(String),
    /// Subject identified by its network address
    Ip(String),
}

impl IdentityKey {
    /// The namespace prefix of this key.
    pub fn kind(&self) -> &'static str {
        match self {
            IdentityKey::Token(_) => "token",
            IdentityKey::Ip(_) => "ip",
        }
    }

    /// Convert the identity key to the string stored in the counting store.
    pub fn to_store_key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdentityKey::Token(value) | IdentityKey::Ip(value) => {
                write!(f, "{}:{}", self.kind(), value)
            }
        }
    }
}
