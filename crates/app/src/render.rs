//! Prints [`UiEvent`]s to the terminal.
//!
//! Events carry whole buffers; the renderer remembers how much of the current
//! reply it has printed and writes only the new tail, so a streaming reply
//! appears token by token.

use shared::{LifecyclePhase, Message, MessageId, Role, UiEvent};
use std::io::Write;

#[derive(Default)]
pub struct Renderer {
    /// Reply being printed and how many bytes of it are on screen
    reply: Option<(MessageId, usize)>,
    /// The next snapshot is a freshly loaded history the REPL prints itself
    skip_snapshot: bool,
}

impl Renderer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Text to print for `event`, if any
    pub fn render(&mut self, event: &UiEvent) -> Option<String> {
        match event {
            UiEvent::Messages { messages, .. } => self.render_messages(messages),
            UiEvent::Selected { .. } => {
                self.skip_snapshot = true;
                self.reply = None;
                None
            }
            UiEvent::ConversationsChanged | UiEvent::Status { .. } => None,
            UiEvent::DownloadProgress { progress } => Some(match progress.phase {
                LifecyclePhase::Downloading => format!("[{}% {}]\n", progress.percent, progress.message),
                LifecyclePhase::Extracting => format!("[{}]\n", progress.message),
                LifecyclePhase::Complete => format!("[{}]\n", progress.message),
            }),
            UiEvent::ProviderChanged { provider } => {
                Some(format!("[using {}]\n", provider.display_name()))
            }
            UiEvent::Error { message } => Some(format!("\nerror: {}\n", message)),
            UiEvent::Warning { message } => Some(format!("\nwarning: {}\n", message)),
        }
    }

    fn render_messages(&mut self, messages: &[Message]) -> Option<String> {
        let last = messages.last();
        if std::mem::take(&mut self.skip_snapshot) {
            self.reply = last
                .filter(|m| m.role == Role::Assistant)
                .map(|m| (m.id.clone(), m.content.len()));
            return None;
        }
        let last = last.filter(|m| m.role == Role::Assistant)?;

        match &mut self.reply {
            Some((id, shown)) if *id == last.id => {
                let tail = last.content.get(*shown..).unwrap_or_default();
                *shown = last.content.len();
                (!tail.is_empty()).then(|| tail.to_string())
            }
            _ => {
                self.reply = Some((last.id.clone(), last.content.len()));
                Some(format!("assistant> {}", last.content))
            }
        }
    }
}

/// Print a loaded conversation in full
pub fn print_history(messages: &[Message]) {
    let mut out = std::io::stdout().lock();
    for message in messages {
        let _ = writeln!(out, "{}> {}", message.role.as_str(), message.content);
        if let Some(error) = &message.error {
            let _ = writeln!(out, "  ({})", error);
        }
    }
    let _ = out.flush();
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::ConversationId;

    fn snapshot(messages: &[Message]) -> UiEvent {
        UiEvent::messages(Some(ConversationId::from("c1")), messages.to_vec())
    }

    #[test]
    fn test_prints_only_new_tail() {
        let mut r = Renderer::new();
        let user = Message::user("hi");
        let mut reply = Message::placeholder();

        assert_eq!(r.render(&snapshot(&[user.clone()])), None);
        assert_eq!(
            r.render(&snapshot(&[user.clone(), reply.clone()])).as_deref(),
            Some("assistant> ")
        );
        reply.content.push_str("Hel");
        assert_eq!(r.render(&snapshot(&[user.clone(), reply.clone()])).as_deref(), Some("Hel"));
        reply.content.push_str("lo");
        assert_eq!(r.render(&snapshot(&[user.clone(), reply.clone()])).as_deref(), Some("lo"));
        assert_eq!(r.render(&snapshot(&[user, reply])), None);
    }

    #[test]
    fn test_loaded_history_is_not_reprinted() {
        let mut r = Renderer::new();
        r.render(&UiEvent::Selected {
            conversation_id: Some(ConversationId::from("c1")),
        });
        let history = [Message::user("q"), Message::assistant("old answer")];
        assert_eq!(r.render(&snapshot(&history)), None);
        assert_eq!(r.render(&snapshot(&history)), None);
    }
}
