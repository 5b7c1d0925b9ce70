pub mod chat;
pub mod error;
pub mod metrics;

pub mod settings {
    use serde::{Deserialize, Serialize};

    pub const DEFAULT_MODEL: &str = "gemini-1.5-flash";

    /// Session-scoped configuration for one conversation.
    ///
    /// Lives for the duration of a session and is never persisted unless the
    /// conversation is explicitly exported.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct ChatSettings {
        /// Provider API key. `None` until the user supplies one. Never
        /// written out when settings are serialized.
        #[serde(skip_serializing, default)]
        pub api_key: Option<String>,
        /// Prefixed to every outbound request as the leading turn.
        pub system_prompt: String,
        pub model_name: String,
        pub chat_title: String,
    }

    impl Default for ChatSettings {
        fn default() -> Self {
            Self {
                api_key: None,
                system_prompt: "You are a helpful AI assistant.".to_string(),
                model_name: DEFAULT_MODEL.to_string(),
                chat_title: "New chat".to_string(),
            }
        }
    }

    /// Validity of the configured API key, derived solely from the last
    /// verification call. Goes back to `Unknown` whenever the key changes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    #[serde(rename_all = "snake_case")]
    pub enum CredentialStatus {
        #[default]
        Unknown,
        Valid,
        Invalid,
    }
}
