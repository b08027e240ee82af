//! Commands arriving from an external surface (context menu, page script).
//!
//! Each command becomes a ready-made request: what the chat shows as the user
//! turn, what the model is actually asked, and a title for a new conversation.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::prompts;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tone {
    Formal,
    Casual,
    Concise,
    Friendly,
    Professional,
}

impl Tone {
    pub const ALL: [Tone; 5] = [
        Tone::Formal,
        Tone::Casual,
        Tone::Concise,
        Tone::Friendly,
        Tone::Professional,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tone::Formal => "formal",
            Tone::Casual => "casual",
            Tone::Concise => "concise",
            Tone::Friendly => "friendly",
            Tone::Professional => "professional",
        }
    }

    pub(crate) fn instruction(&self) -> &'static str {
        match self {
            Tone::Formal => "formal and polished, without contractions or slang",
            Tone::Casual => "relaxed and conversational, like a message to a friend",
            Tone::Concise => "as short as possible while keeping every important point",
            Tone::Friendly => "warm and approachable",
            Tone::Professional => "clear and professional, suitable for work email",
        }
    }
}

impl fmt::Display for Tone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tone {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Tone::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| {
                let names: Vec<_> = Tone::ALL.iter().map(Tone::as_str).collect();
                format!("unknown tone `{}` (expected one of: {})", s, names.join(", "))
            })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum HostCommand {
    Chat {
        text: String,
    },
    SummarizePage {
        title: String,
        url: String,
        content: String,
    },
    SummarizeVideo {
        title: String,
        transcript: String,
    },
    RewriteSelection {
        text: String,
        tone: Tone,
    },
}

/// A submit request with its display text and prompt already formed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedRequest {
    /// Shown as the user turn
    pub display: String,
    /// Sent to the model
    pub prompt: String,
    /// Title for the conversation if one has to be created
    pub title: Option<String>,
}

impl PreparedRequest {
    /// Plain chat: the user sees and the model receives the same text
    pub fn chat(text: impl Into<String>) -> Self {
        let text = text.into();
        Self {
            prompt: text.clone(),
            display: text,
            title: None,
        }
    }
}

impl HostCommand {
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }

    pub fn prepare(&self) -> PreparedRequest {
        match self {
            HostCommand::Chat { text } => PreparedRequest::chat(text.clone()),
            HostCommand::SummarizePage {
                title,
                url,
                content,
            } => PreparedRequest {
                display: format!("Summarize this page: {}", title),
                prompt: prompts::summarize_page(title, url, content),
                title: Some(format!("Summary: {}", title)),
            },
            HostCommand::SummarizeVideo { title, transcript } => PreparedRequest {
                display: format!("Summarize this video: {}", title),
                prompt: prompts::summarize_video(title, transcript),
                title: Some(format!("Video: {}", title)),
            },
            HostCommand::RewriteSelection { text, tone } => PreparedRequest {
                display: format!("Rewrite ({}): {}", tone, text),
                prompt: prompts::rewrite(text, *tone),
                title: Some(format!("Rewrite ({})", tone)),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tagged_json() {
        let cmd = HostCommand::from_json(
            r#"{"command":"rewrite_selection","text":"hey whats up","tone":"formal"}"#,
        )
        .unwrap();
        assert_eq!(
            cmd,
            HostCommand::RewriteSelection {
                text: "hey whats up".into(),
                tone: Tone::Formal
            }
        );
        assert!(HostCommand::from_json(r#"{"command":"screenshot"}"#).is_err());
    }

    #[test]
    fn test_prepare_page_summary() {
        let req = HostCommand::SummarizePage {
            title: "Rust 2024".into(),
            url: "https://blog.rust-lang.org".into(),
            content: "Edition notes".into(),
        }
        .prepare();
        assert_eq!(req.display, "Summarize this page: Rust 2024");
        assert_eq!(req.title.as_deref(), Some("Summary: Rust 2024"));
        assert!(req.prompt.contains("Edition notes"));
    }

    #[test]
    fn test_chat_display_equals_prompt() {
        let req = HostCommand::Chat { text: "hi".into() }.prepare();
        assert_eq!(req, PreparedRequest::chat("hi"));
    }

    #[test]
    fn test_tone_from_str() {
        assert_eq!("Casual".parse::<Tone>(), Ok(Tone::Casual));
        assert!("angry".parse::<Tone>().is_err());
    }
}
