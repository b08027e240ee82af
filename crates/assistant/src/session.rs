//! The selected conversation and its working buffer.

use shared::{ConversationId, Message};

/// What the chat surface is currently showing. The buffer may be ahead of the
/// store while a reply is streaming.
#[derive(Debug, Default)]
pub struct SessionState {
    pub(crate) selected: Option<ConversationId>,
    pub(crate) buffer: Vec<Message>,
    /// Conversation the buffer was loaded for. Lags `selected` while a load is
    /// pending.
    pub(crate) owner: Option<ConversationId>,
    /// Bumped on every selection so a slow load can tell it has been superseded
    pub(crate) generation: u64,
}

impl SessionState {
    pub fn is_selected(&self, id: &ConversationId) -> bool {
        self.selected.as_ref() == Some(id)
    }

    /// Selected conversation and buffer, if the buffer really belongs to it
    pub fn settled(&self) -> Option<(&ConversationId, &[Message])> {
        match (&self.selected, &self.owner) {
            (Some(selected), Some(owner)) if selected == owner => Some((selected, &self.buffer)),
            _ => None,
        }
    }
}
