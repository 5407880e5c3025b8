//! Per-session context shared by every operation.
//!
//! One [`Session`] corresponds to one interactive user: its chat history,
//! the database restored for it (if any), and the vector collection holding
//! its ingested documents. Sessions are persisted in SQLite so consecutive
//! CLI invocations continue the same conversation.

use serde::{Deserialize, Serialize};

/// Chat participant role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }

    pub fn parse(s: &str) -> Option<Role> {
        match s {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            "system" => Some(Role::System),
            _ => None,
        }
    }
}

/// One chat turn, in the shape the model API expects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Session state as loaded from the store.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    /// Name of the database restored for this session, if any.
    pub current_db: Option<String>,
    /// Name of this session's vector collection, created on first ingest.
    pub collection: Option<String>,
}

impl Session {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            current_db: None,
            collection: None,
        }
    }

    pub fn has_db(&self) -> bool {
        self.current_db.is_some()
    }
}
