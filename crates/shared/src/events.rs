//! Updates pushed to the presentation layer.

use serde::{Deserialize, Serialize};

use crate::conversation::{ConversationId, Message};
use crate::errors::AssistantError;
use crate::provider::{LifecycleProgress, ProviderKind, StreamStatus};

/// Event for the chat surface
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UiEvent {
    /// The full working buffer for the selected conversation, never a delta
    Messages {
        conversation_id: Option<ConversationId>,
        messages: Vec<Message>,
    },
    /// Selection moved to another conversation (or to none)
    Selected {
        conversation_id: Option<ConversationId>,
    },
    /// Titles, order or membership of the conversation list changed
    ConversationsChanged,
    Status {
        status: StreamStatus,
    },
    DownloadProgress {
        progress: LifecycleProgress,
    },
    ProviderChanged {
        provider: ProviderKind,
    },
    Error {
        message: String,
    },
    /// Non-fatal problem, e.g. a failed save
    Warning {
        message: String,
    },
}

impl UiEvent {
    pub fn messages(conversation_id: Option<ConversationId>, messages: Vec<Message>) -> Self {
        UiEvent::Messages {
            conversation_id,
            messages,
        }
    }

    /// Fatal errors become `Error`, persistence hiccups become `Warning`
    pub fn from_error(error: &AssistantError) -> Self {
        if error.is_warning() {
            UiEvent::Warning {
                message: error.user_message(),
            }
        } else {
            UiEvent::Error {
                message: error.user_message(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tagged_serialization() {
        let event = UiEvent::Status {
            status: StreamStatus::Streaming,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "status");
        assert_eq!(json["status"], "streaming");
    }

    #[test]
    fn test_write_failure_is_a_warning() {
        let err = AssistantError::PersistenceWriteFailed {
            id: ConversationId::from("c1"),
            reason: "disk".into(),
        };
        assert!(matches!(UiEvent::from_error(&err), UiEvent::Warning { .. }));
        assert!(matches!(
            UiEvent::from_error(&AssistantError::ProviderUnavailable),
            UiEvent::Error { .. }
        ));
    }
}
