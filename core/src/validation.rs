/// Local checks on outgoing messages, run before any request is made
use crate::error::{Result, SyncError};
use crate::messenger_types::{SendMessageRequest, UserId};

/// Characters people insert to dodge word filters
fn normalize_for_filter(text: &str) -> String {
    text.to_lowercase()
        .chars()
        .filter(|c| !matches!(c, '*' | '-' | '_' | '.') && !c.is_whitespace())
        .collect()
}

/// First blocked word contained in `text`, if any
pub fn find_blocked_word<'a>(text: &str, blocked: &'a [String]) -> Option<&'a str> {
    let normalized = normalize_for_filter(text);
    blocked
        .iter()
        .filter(|w| !w.trim().is_empty())
        .find(|w| normalized.contains(&normalize_for_filter(w)))
        .map(String::as_str)
}

/// Build a send request from user input, or explain why it is rejected
pub fn build_send_request(
    content: &str,
    to_user_id: UserId,
    product_id: Option<i64>,
    max_len: usize,
    blocked: &[String],
) -> Result<SendMessageRequest> {
    let content = content.trim();
    if content.is_empty() {
        return Err(SyncError::Validation("message is empty".to_string()));
    }
    if to_user_id <= 0 {
        return Err(SyncError::Validation(format!("invalid recipient id {}", to_user_id)));
    }
    let len = content.chars().count();
    if len > max_len {
        return Err(SyncError::Validation(format!(
            "message is {} characters, limit is {}",
            len, max_len
        )));
    }
    if let Some(word) = find_blocked_word(content, blocked) {
        return Err(SyncError::Validation(format!("message contains blocked word {:?}", word)));
    }

    Ok(SendMessageRequest {
        content: content.to_string(),
        to_user_id,
        product_id: product_id.filter(|p| *p > 0),
    })
}
