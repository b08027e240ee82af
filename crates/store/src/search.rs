//! Keyword search over stored conversations.

use chrono::{DateTime, Utc};
use serde::Serialize;
use shared::ConversationId;

use crate::{ConversationStore, StoreError};

const SNIPPET_CONTEXT: usize = 30;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub conversation_id: ConversationId,
    pub title: String,
    /// Matching message, or `None` when only the title matched
    pub message_index: Option<usize>,
    pub snippet: String,
    pub updated_at: DateTime<Utc>,
}

/// Case-insensitive match over titles and message contents, most recent
/// conversations first, at most `limit` hits
pub async fn search(
    store: &dyn ConversationStore,
    query: &str,
    limit: usize,
) -> Result<Vec<SearchHit>, StoreError> {
    let query = query.trim().to_lowercase();
    if query.is_empty() || limit == 0 {
        return Ok(Vec::new());
    }

    let mut hits = Vec::new();
    for summary in store.list().await? {
        let Some(conversation) = store.get(&summary.id).await? else {
            continue;
        };

        let mut matched = false;
        for (i, msg) in conversation.messages.iter().enumerate() {
            if let Some(snippet) = extract_snippet(&msg.content, &query) {
                matched = true;
                hits.push(SearchHit {
                    conversation_id: conversation.id.clone(),
                    title: conversation.title.clone(),
                    message_index: Some(i),
                    snippet,
                    updated_at: conversation.updated_at,
                });
                if hits.len() >= limit {
                    return Ok(hits);
                }
            }
        }

        if !matched && conversation.title.to_lowercase().contains(&query) {
            hits.push(SearchHit {
                conversation_id: conversation.id.clone(),
                title: conversation.title.clone(),
                message_index: None,
                snippet: conversation.title.clone(),
                updated_at: conversation.updated_at,
            });
            if hits.len() >= limit {
                return Ok(hits);
            }
        }
    }
    Ok(hits)
}

/// Text around the first occurrence of `query` (already lowercased), or `None`
fn extract_snippet(content: &str, query: &str) -> Option<String> {
    let chars: Vec<char> = content.chars().collect();
    let needle: Vec<char> = query.chars().collect();
    let pos = (0..chars.len()).find(|&start| {
        let mut folded = chars[start..].iter().flat_map(|c| c.to_lowercase());
        needle.iter().all(|n| folded.next() == Some(*n))
    })?;

    let start = pos.saturating_sub(SNIPPET_CONTEXT);
    let end = (pos + needle.len() + SNIPPET_CONTEXT).min(chars.len());
    let mut snippet: String = chars[start..end].iter().collect();
    if start > 0 {
        snippet = format!("...{}", snippet);
    }
    if end < chars.len() {
        snippet.push_str("...");
    }
    Some(snippet)
}
