//! Core chat turn types shared across the workspace.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::metrics;

/// Author of a chat turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Model,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Model => "model",
            Role::System => "system",
        }
    }

    /// The Gemini API only accepts "user" and "model" roles in `contents`;
    /// everything that is not a model reply is sent as "user".
    pub fn as_provider_role(&self) -> &'static str {
        match self {
            Role::Model => "model",
            Role::User | Role::System => "user",
        }
    }
}

/// One turn in a conversation.
///
/// Ids are assigned at creation and never reused. `latency` and `model_name`
/// are only ever set on model turns; the constructors are the only way to
/// build a `Message`, so the invariant holds by construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub token_count: u32,
    pub word_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_name: Option<String>,
}

impl Message {
    fn build(role: Role, content: String) -> Self {
        let estimate = metrics::estimate(&content);
        Self {
            id: Uuid::new_v4(),
            role,
            content,
            timestamp: Utc::now(),
            token_count: estimate.token_count,
            word_count: estimate.word_count,
            latency: None,
            model_name: None,
        }
    }

    /// A user-authored turn.
    pub fn user(content: impl Into<String>) -> Self {
        Self::build(Role::User, content.into())
    }

    /// A system turn (e.g. an injected instruction shown in the transcript).
    pub fn system(content: impl Into<String>) -> Self {
        Self::build(Role::System, content.into())
    }

    /// A model reply, stamped with the wall-clock latency of the request
    /// and the model that produced it.
    pub fn model(
        content: impl Into<String>,
        latency: Duration,
        model_name: impl Into<String>,
    ) -> Self {
        let mut msg = Self::build(Role::Model, content.into());
        msg.latency = Some(latency);
        msg.model_name = Some(model_name.into());
        msg
    }
}
