//! Error taxonomy surfaced to the user.

use crate::conversation::ConversationId;
use crate::provider::ProviderKind;

/// Everything that can go wrong between "user pressed send" and "reply saved"
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AssistantError {
    #[error("No inference provider is available")]
    ProviderUnavailable,

    #[error("{provider} failed to initialize: {reason}")]
    ProviderInitFailed {
        provider: ProviderKind,
        reason: String,
    },

    #[error("{provider} stream aborted: {reason}")]
    StreamAborted {
        provider: ProviderKind,
        reason: String,
    },

    #[error("Prompt is empty")]
    EmptyPrompt,

    #[error("Failed to save conversation {id}: {reason}")]
    PersistenceWriteFailed { id: ConversationId, reason: String },

    #[error("Failed to load conversation {id}: {reason}")]
    PersistenceLoadFailed { id: ConversationId, reason: String },

    #[error("Conversation not found: {0}")]
    ConversationNotFound(ConversationId),
}

impl AssistantError {
    /// Text suitable for showing in the chat surface
    pub fn user_message(&self) -> String {
        match self {
            AssistantError::ProviderUnavailable => {
                "No local model is available. Start Ollama or a local server, or configure a bundled model, then try again.".to_string()
            }
            AssistantError::ProviderInitFailed { provider, reason } => format!(
                "{} could not finish setting up, so nothing was sent. You can try again.\n\nError: {}",
                provider.display_name(),
                reason
            ),
            AssistantError::StreamAborted { provider, reason } => format!(
                "The connection to {} dropped while it was answering. The reply above may be incomplete.\n\nError: {}",
                provider.display_name(),
                reason
            ),
            AssistantError::EmptyPrompt => "There is nothing to send.".to_string(),
            AssistantError::PersistenceWriteFailed { reason, .. } => format!(
                "This conversation could not be saved right now. It is still here and will be saved with the next reply.\n\nError: {}",
                reason
            ),
            AssistantError::PersistenceLoadFailed { reason, .. } => format!(
                "That conversation could not be opened.\n\nError: {}",
                reason
            ),
            AssistantError::ConversationNotFound(_) => {
                "That conversation no longer exists.".to_string()
            }
        }
    }

    /// Whether trying the same request again may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AssistantError::ProviderInitFailed { .. } | AssistantError::StreamAborted { .. }
        )
    }

    /// Whether the in-memory conversation flow can keep going
    pub fn is_warning(&self) -> bool {
        matches!(self, AssistantError::PersistenceWriteFailed { .. })
    }
}
