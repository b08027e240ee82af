//! Prompt text sent to the model.

use shared::{Message, Role};

use crate::commands::Tone;

/// Page text beyond this many characters is cut before prompting
pub const MAX_PAGE_CHARS: usize = 12_000;

const HISTORY_PREAMBLE: &str =
    "You are a helpful assistant in a browser side panel. Continue the conversation below and reply as the assistant.";

/// Final prompt for a turn: the last `window` messages of `history` (the new
/// turn counts toward the window) followed by `prompt`. With no usable history
/// the prompt is sent as is.
pub fn build_prompt(history: &[Message], window: usize, prompt: &str) -> String {
    let usable: Vec<&Message> = history
        .iter()
        .filter(|m| !m.content.trim().is_empty())
        .collect();
    let keep = window.saturating_sub(1);
    let recent = &usable[usable.len().saturating_sub(keep)..];
    if recent.is_empty() {
        return prompt.to_string();
    }

    let mut out = String::from(HISTORY_PREAMBLE);
    out.push_str("\n\n");
    for message in recent {
        out.push_str(speaker(message.role));
        out.push_str(": ");
        out.push_str(message.content.trim());
        out.push_str("\n\n");
    }
    out.push_str("User: ");
    out.push_str(prompt.trim());
    out.push_str("\n\nAssistant:");
    out
}

fn speaker(role: Role) -> &'static str {
    match role {
        Role::User => "User",
        Role::Assistant => "Assistant",
    }
}

pub fn summarize_page(title: &str, url: &str, content: &str) -> String {
    format!(
        "Summarize the following web page in a few short paragraphs, then list the key points.\n\n\
         Title: {}\nURL: {}\n\nContent:\n{}",
        title,
        url,
        truncate_chars(content.trim(), MAX_PAGE_CHARS)
    )
}

pub fn summarize_video(title: &str, transcript: &str) -> String {
    format!(
        "Summarize this video from its transcript. Start with one sentence on what it is about, \
         then list the main points in order.\n\nTitle: {}\n\nTranscript:\n{}",
        title,
        truncate_chars(transcript.trim(), MAX_PAGE_CHARS)
    )
}

pub fn rewrite(text: &str, tone: Tone) -> String {
    format!(
        "Rewrite the text below so it reads {}. Keep the meaning and the language. \
         Reply with the rewritten text only.\n\nText:\n{}",
        tone.instruction(),
        text.trim()
    )
}

/// First `max` characters of `text`, marking the cut
pub fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((end, _)) => format!("{}\n[...truncated]", &text[..end]),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_history_sends_prompt_verbatim() {
        assert_eq!(build_prompt(&[], 20, "Hello"), "Hello");
    }

    #[test]
    fn test_history_window_keeps_most_recent() {
        let history: Vec<Message> = (0..10)
            .map(|i| {
                if i % 2 == 0 {
                    Message::user(format!("q{}", i))
                } else {
                    Message::assistant(format!("a{}", i))
                }
            })
            .collect();

        let prompt = build_prompt(&history, 4, "next");
        assert!(!prompt.contains("q6"));
        assert!(prompt.contains("a7"));
        assert!(prompt.contains("User: q8"));
        assert!(prompt.contains("Assistant: a9"));
        assert!(prompt.ends_with("User: next\n\nAssistant:"));
    }

    #[test]
    fn test_empty_turns_are_skipped() {
        let history = vec![
            Message::user("hi"),
            Message::placeholder().with_error("Stream aborted"),
        ];
        let prompt = build_prompt(&history, 20, "again");
        assert!(prompt.contains("User: hi"));
        assert!(!prompt.contains("Assistant: \n"));
    }

    #[test]
    fn test_truncate_chars_is_boundary_safe() {
        assert_eq!(truncate_chars("héllo", 10), "héllo");
        assert_eq!(truncate_chars("héllo", 2), "hé\n[...truncated]");
    }

    #[test]
    fn test_page_prompt_is_bounded() {
        let content = "x".repeat(MAX_PAGE_CHARS * 2);
        let prompt = summarize_page("T", "https://example.com", &content);
        assert!(prompt.len() < MAX_PAGE_CHARS + 500);
        assert!(prompt.contains("https://example.com"));
    }
}
