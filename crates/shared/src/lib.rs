pub mod conversation;
pub mod errors;
pub mod events;
pub mod provider;

pub use conversation::{Conversation, ConversationId, ConversationSummary, Message, MessageId, Role};
pub use errors::AssistantError;
pub use events::UiEvent;
pub use provider::{
    LifecyclePhase, LifecycleProgress, ProviderKind, ProviderPreference, StreamStatus,
};

pub mod settings {
    use crate::provider::ProviderPreference;
    use serde::{Deserialize, Serialize};

    fn default_history_window() -> usize {
        20
    }

    fn default_title_max_chars() -> usize {
        40
    }

    fn default_outbox_capacity() -> usize {
        256
    }

    /// Ollama endpoint and model selection
    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(default)]
    pub struct OllamaSettings {
        pub base_url: String, // e.g., "http://127.0.0.1:11434"
        /// Empty means "pick one for this machine's RAM"
        pub model: String,
    }

    impl Default for OllamaSettings {
        fn default() -> Self {
            Self {
                base_url: "http://127.0.0.1:11434".into(),
                model: String::new(),
            }
        }
    }

    /// Any OpenAI-compatible server running locally (LM Studio, llama.cpp server)
    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(default)]
    pub struct LocalServerSettings {
        pub base_url: String, // e.g., "http://127.0.0.1:1234/v1"
        pub model: String,
    }

    impl Default for LocalServerSettings {
        fn default() -> Self {
            Self {
                base_url: "http://127.0.0.1:1234/v1".into(),
                model: "local-model".into(),
            }
        }
    }

    /// Self-contained runner shipped as a downloadable archive
    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(default)]
    pub struct BundledSettings {
        /// `.tar.gz` with the runner binary and its weights. No URL disables the backend.
        pub archive_url: Option<String>,
        /// Hex SHA-256 of the archive, checked before extraction when present
        pub sha256: Option<String>,
        /// Runner path relative to the extracted directory
        pub runner: String,
        /// Extra arguments placed before `--prompt <text>`
        pub args: Vec<String>,
    }

    impl Default for BundledSettings {
        fn default() -> Self {
            Self {
                archive_url: None,
                sha256: None,
                runner: "runner".into(),
                args: vec![],
            }
        }
    }

    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    #[serde(default)]
    pub struct ProviderSettings {
        pub preference: ProviderPreference,
        pub ollama: OllamaSettings,
        pub local_server: LocalServerSettings,
        pub bundled: BundledSettings,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct AssistantSettings {
        #[serde(default)]
        pub providers: ProviderSettings,
        /// How many prior messages are replayed to the model with each turn
        #[serde(default = "default_history_window")]
        pub history_window: usize,
        #[serde(default = "default_title_max_chars")]
        pub title_max_chars: usize,
        /// Updates held back while the presentation layer is not ready yet
        #[serde(default = "default_outbox_capacity")]
        pub outbox_capacity: usize,
        /// Where conversations and downloaded assets live. Defaults to the platform data dir.
        #[serde(default)]
        pub data_dir: Option<String>,
    }

    impl Default for AssistantSettings {
        fn default() -> Self {
            Self {
                providers: ProviderSettings::default(),
                history_window: default_history_window(),
                title_max_chars: default_title_max_chars(),
                outbox_capacity: default_outbox_capacity(),
                data_dir: None,
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::provider::ProviderKind;

        #[test]
        fn test_partial_settings_fill_defaults() {
            let settings: AssistantSettings =
                serde_json::from_str(r#"{"providers": {"preference": "ollama"}}"#).unwrap();

            assert_eq!(
                settings.providers.preference,
                ProviderPreference::Fixed(ProviderKind::Ollama)
            );
            assert_eq!(settings.providers.ollama.base_url, "http://127.0.0.1:11434");
            assert_eq!(settings.history_window, 20);
            assert_eq!(settings.outbox_capacity, 256);
        }

        #[test]
        fn test_empty_settings() {
            let settings: AssistantSettings = serde_json::from_str("{}").unwrap();
            assert_eq!(settings.providers.preference, ProviderPreference::Auto);
            assert!(settings.providers.bundled.archive_url.is_none());
        }
    }
}
