/// Presentation helpers for list rows and thread bubbles
use crate::messenger_types::Conversation;
use chrono::{DateTime, Utc};

/// Coarse "how long ago" label
pub fn relative_time(created_at: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let minutes = (now - created_at).num_minutes();
    if minutes < 1 {
        return "just now".to_string();
    }
    if minutes < 60 {
        return format!("{} min ago", minutes);
    }
    let hours = minutes / 60;
    if hours < 24 {
        return format!("{} h ago", hours);
    }
    let days = hours / 24;
    if days < 7 {
        return format!("{} d ago", days);
    }
    created_at.format("%b %-d").to_string()
}

/// Name to show for a conversation row
pub fn display_name<'a>(conversation: &'a Conversation, placeholder: &'a str) -> &'a str {
    if conversation.counterpart_display_name.is_empty() {
        placeholder
    } else {
        &conversation.counterpart_display_name
    }
}

/// One-line preview of the last message
pub fn preview(conversation: &Conversation, max_chars: usize) -> String {
    let content = conversation.last_message.content.replace('\n', " ");
    if content.chars().count() <= max_chars {
        content
    } else {
        let cut: String = content.chars().take(max_chars.saturating_sub(1)).collect();
        format!("{}…", cut)
    }
}
