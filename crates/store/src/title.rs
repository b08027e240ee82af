//! Conversation titles from the first user message.

pub const DEFAULT_TITLE: &str = "New conversation";

/// Conversational openers that say nothing about the topic
const LEAD_INS: &[&str] = &[
    "can you ",
    "could you ",
    "would you ",
    "please ",
    "help me ",
    "i need ",
    "i want to ",
    "hey, ",
    "hey ",
    "hi, ",
    "hi ",
    "tell me ",
    "show me ",
];

/// Short title for a conversation opened with `text`.
///
/// Strips openers like "Can you please", collapses whitespace, capitalises the
/// first letter and truncates to `max_chars` characters with an ellipsis.
pub fn derive_title(text: &str, max_chars: usize) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");

    let mut rest = collapsed.as_str();
    'strip: loop {
        for lead in LEAD_INS {
            if let Some(head) = rest.get(..lead.len()) {
                if head.eq_ignore_ascii_case(lead) && rest.len() > lead.len() {
                    rest = &rest[lead.len()..];
                    continue 'strip;
                }
            }
        }
        break;
    }

    let rest = rest.trim_end_matches(['?', '!', '.', ' ']);
    if rest.is_empty() {
        return DEFAULT_TITLE.to_string();
    }

    let mut chars = rest.chars();
    let mut title: String = match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => return DEFAULT_TITLE.to_string(),
    };

    if max_chars > 0 && title.chars().count() > max_chars {
        title = title.chars().take(max_chars).collect::<String>().trim_end().to_string();
        title.push_str("...");
    }
    title
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_message() {
        assert_eq!(derive_title("Hello", 40), "Hello");
    }

    #[test]
    fn test_strips_lead_ins_and_punctuation() {
        assert_eq!(
            derive_title("Can you please  explain\nlifetimes?", 40),
            "Explain lifetimes"
        );
        assert_eq!(derive_title("hey, tell me a joke!", 40), "A joke");
    }

    #[test]
    fn test_lead_in_alone_is_kept() {
        assert_eq!(derive_title("Please", 40), "Please");
    }

    #[test]
    fn test_truncates_on_char_boundary() {
        let title = derive_title(&"é".repeat(50), 10);
        assert_eq!(title, format!("{}...", "É".to_string() + &"é".repeat(9)));
    }

    #[test]
    fn test_empty_falls_back() {
        assert_eq!(derive_title("   ", 40), DEFAULT_TITLE);
        assert_eq!(derive_title("?!", 40), DEFAULT_TITLE);
    }
}
