//! Core identifier types for coedit

use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Session identifier - cheaply cloneable
#[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionKey(Arc<str>);

impl SessionKey {
    pub fn new(s: impl Into<String>) -> Self {
        Self(Arc::from(s.into()))
    }

    /// Fresh random session key, used for connections that do not name one.
    pub fn generate() -> Self {
        Self::new(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for SessionKey {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<&str> for SessionKey {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Who holds or requests a block lock.
///
/// Wire form is `user:<id>` or `pipeline:<name>`. A bare string without a
/// prefix is read as a user id.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum Actor {
    User(String),
    Pipeline(String),
}

impl Actor {
    pub fn user(id: impl Into<String>) -> Self {
        Self::User(id.into())
    }

    pub fn pipeline(name: impl Into<String>) -> Self {
        Self::Pipeline(name.into())
    }

    pub fn is_agent(&self) -> bool {
        matches!(self, Self::Pipeline(_))
    }

    /// The bare id or pipeline name, without the kind prefix.
    pub fn id(&self) -> &str {
        match self {
            Self::User(id) | Self::Pipeline(id) => id,
        }
    }

    pub fn lock_type(&self) -> LockType {
        match self {
            Self::User(_) => LockType::Human,
            Self::Pipeline(_) => LockType::Agent,
        }
    }
}

impl std::fmt::Display for Actor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User(id) => write!(f, "user:{}", id),
            Self::Pipeline(name) => write!(f, "pipeline:{}", name),
        }
    }
}

impl From<Actor> for String {
    fn from(actor: Actor) -> Self {
        actor.to_string()
    }
}

impl From<String> for Actor {
    fn from(s: String) -> Self {
        Self::from(s.as_str())
    }
}

impl From<&str> for Actor {
    fn from(s: &str) -> Self {
        match s.split_once(':') {
            Some(("pipeline", name)) => Self::Pipeline(name.to_string()),
            Some(("user", id)) => Self::User(id.to_string()),
            _ => Self::User(s.to_string()),
        }
    }
}

/// Kind of lock, derived from the holder.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockType {
    Human,
    Agent,
}

impl LockType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LockType::Human => "human",
            LockType::Agent => "agent",
        }
    }
}

impl std::str::FromStr for LockType {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "human" => Ok(LockType::Human),
            "agent" => Ok(LockType::Agent),
            other => Err(crate::Error::InvalidMessage(format!(
                "unknown lock type: {}",
                other
            ))),
        }
    }
}
