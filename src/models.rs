use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// Who authored a message. The generation backend calls itself "model",
// so the stored role does too.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Model,
}

// Represents a single message in a conversation. Content only grows while
// the model reply for this turn is still streaming; after that it is never
// touched again.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Message {
    #[serde(default = "Uuid::new_v4")] // Generate a new UUID if missing during deserialization
    pub id: Uuid,
    pub role: Role,
    pub content: String,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            role: Role::User,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    // Empty model message that stream fragments get appended into.
    pub fn model_placeholder() -> Self {
        Self {
            id: Uuid::new_v4(),
            role: Role::Model,
            content: String::new(),
            timestamp: Utc::now(),
        }
    }
}

// Represents a conversation thread. The id is minted from the creation
// timestamp when the first completed turn is reconciled; the title is
// derived once from the first message and never recomputed.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Conversation {
    pub id: String,
    pub title: String,
    pub messages: Vec<Message>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub last_updated_at: DateTime<Utc>,
}
