/// Shared types for the messaging layer
use crate::error::ErrorClass;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub type UserId = i64;
pub type MessageId = i64;

/// Epoch values below this are taken as seconds, above as milliseconds
const SECONDS_THRESHOLD: f64 = 100_000_000_000.0;

/// One direct message, immutable once received
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub from_user: UserId,
    pub to_user: UserId,
    pub content: String,
    pub created_at: DateTime<Utc>,
    /// 0 = unread, 1 = read, None = unknown (treated as unread)
    pub read_flag: Option<u8>,
    pub product_id: Option<i64>,
}

impl Message {
    /// The other participant relative to `current_user`
    pub fn counterpart(&self, current_user: UserId) -> UserId {
        if self.from_user == current_user {
            self.to_user
        } else {
            self.from_user
        }
    }

    pub fn is_read(&self) -> bool {
        matches!(self.read_flag, Some(flag) if flag != 0)
    }

    /// Addressed to `current_user` by `counterpart` and not yet read
    pub fn is_unread_for(&self, current_user: UserId, counterpart: UserId) -> bool {
        self.to_user == current_user && self.from_user == counterpart && !self.is_read()
    }

    pub fn created_at_ms(&self) -> i64 {
        self.created_at.timestamp_millis()
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("malformed message: missing {field}")]
pub struct MalformedMessage {
    pub field: &'static str,
}

/// A message as it arrives on the wire. Every field is optional so a
/// single odd record never fails the whole response body.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RawMessage {
    pub id: Option<MessageId>,
    pub from_user: Option<UserId>,
    pub to_user: Option<UserId>,
    pub content: Option<String>,
    pub created_at: Option<Value>,
    pub read_flag: Option<Value>,
    pub product_id: Option<i64>,
}

impl RawMessage {
    /// Produce a fixed-shape message, defaulting what can be defaulted.
    ///
    /// Without an id or both participants a message can be neither
    /// attributed to a conversation nor deduplicated, so it is rejected.
    pub fn normalize(self) -> Result<Message, MalformedMessage> {
        let id = self.id.ok_or(MalformedMessage { field: "id" })?;
        let from_user = self.from_user.ok_or(MalformedMessage { field: "fromUser" })?;
        let to_user = self.to_user.ok_or(MalformedMessage { field: "toUser" })?;

        let created_at = self
            .created_at
            .as_ref()
            .and_then(parse_timestamp)
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);

        Ok(Message {
            id,
            from_user,
            to_user,
            content: self.content.unwrap_or_default(),
            created_at,
            read_flag: self.read_flag.as_ref().and_then(parse_read_flag),
            product_id: self.product_id,
        })
    }
}

impl From<&Message> for RawMessage {
    fn from(msg: &Message) -> Self {
        Self {
            id: Some(msg.id),
            from_user: Some(msg.from_user),
            to_user: Some(msg.to_user),
            content: Some(msg.content.clone()),
            created_at: Some(Value::String(msg.created_at.to_rfc3339())),
            read_flag: msg.read_flag.map(Value::from),
            product_id: msg.product_id,
        }
    }
}

/// Accepts RFC 3339, naive ISO local time (taken as UTC) and epoch numbers
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => {
            let s = s.trim();
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Some(dt.with_timezone(&Utc));
            }
            ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
                .iter()
                .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
                .map(|naive| Utc.from_utc_datetime(&naive))
        }
        Value::Number(n) => {
            let raw = n.as_f64()?;
            let millis = if raw.abs() < SECONDS_THRESHOLD {
                (raw * 1000.0).round() as i64
            } else {
                raw.round() as i64
            };
            DateTime::from_timestamp_millis(millis)
        }
        _ => None,
    }
}

fn parse_read_flag(value: &Value) -> Option<u8> {
    match value {
        Value::Bool(b) => Some(u8::from(*b)),
        Value::Number(n) => n.as_i64().map(|v| u8::from(v != 0)),
        Value::String(s) => s.trim().parse::<i64>().ok().map(|v| u8::from(v != 0)),
        _ => None,
    }
}

/// One row of the conversation list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub counterpart_user_id: UserId,
    pub last_message: Message,
    pub unread_count: u32,
    pub counterpart_display_name: String,
    pub counterpart_avatar_url: String,
    pub product_id: Option<i64>,
}

/// Page body of `GET /messages/conversations`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConversationPage {
    pub content: Vec<RawMessage>,
    pub page: u32,
    pub size: u32,
    pub total: u64,
    pub total_pages: u32,
    pub has_next: bool,
    pub has_previous: bool,
}

/// Counterpart profile from `GET /user/{id}`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UserProfile {
    pub id: Option<UserId>,
    pub nickname: Option<String>,
    pub avatar_url: Option<String>,
}

/// Body of `POST /messages/send`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    pub content: String,
    pub to_user_id: UserId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product_id: Option<i64>,
}

/// Response wrapper used by every endpoint: `code == 0` is success
#[derive(Debug, Clone, Deserialize)]
pub struct ApiEnvelope<T> {
    pub code: i64,
    pub message: Option<String>,
    pub data: Option<T>,
}

/// Events streamed to the UI layer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
    /// The sorted conversation list changed
    ConversationsUpdated { conversations: Vec<Conversation> },
    /// A thread was (re)loaded in full
    ThreadLoaded { counterpart: UserId, messages: Vec<Message> },
    /// New messages were appended to the open thread; scroll to the newest
    NewMessages { counterpart: UserId, messages: Vec<Message> },
    /// Badge total changed
    UnreadChanged { total: u32 },
    /// Something the user should see briefly
    Notice { class: ErrorClass, message: String },
    /// Session is no longer valid
    SessionExpired { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_normalize_defaults() {
        let raw: RawMessage = serde_json::from_value(json!({
            "id": 7,
            "fromUser": 5,
            "toUser": 2,
            "createdAt": "not a date"
        }))
        .unwrap();

        let msg = raw.normalize().unwrap();
        assert_eq!(msg.content, "");
        assert_eq!(msg.created_at, DateTime::<Utc>::UNIX_EPOCH);
        assert_eq!(msg.read_flag, None);
        assert!(msg.is_unread_for(2, 5));
    }

    #[test]
    fn test_normalize_rejects_unattributable() {
        let raw: RawMessage = serde_json::from_value(json!({ "id": 1, "toUser": 2 })).unwrap();
        assert_eq!(raw.normalize().unwrap_err().field, "fromUser");

        let raw: RawMessage = serde_json::from_value(json!({ "fromUser": 1, "toUser": 2 })).unwrap();
        assert_eq!(raw.normalize().unwrap_err().field, "id");
    }

    #[test]
    fn test_timestamp_formats() {
        let expected = Utc.with_ymd_and_hms(2024, 3, 4, 10, 30, 0).unwrap();

        assert_eq!(parse_timestamp(&json!("2024-03-04T10:30:00Z")), Some(expected));
        assert_eq!(parse_timestamp(&json!("2024-03-04T18:30:00+08:00")), Some(expected));
        assert_eq!(parse_timestamp(&json!("2024-03-04T10:30:00")), Some(expected));
        assert_eq!(parse_timestamp(&json!("2024-03-04 10:30:00.000")), Some(expected));
        assert_eq!(parse_timestamp(&json!(expected.timestamp_millis())), Some(expected));
        assert_eq!(parse_timestamp(&json!(expected.timestamp() as f64)), Some(expected));
        assert_eq!(parse_timestamp(&json!(true)), None);
    }

    #[test]
    fn test_read_flag_variants() {
        let flag = |v: Value| {
            let raw: RawMessage = serde_json::from_value(json!({
                "id": 1, "fromUser": 5, "toUser": 2, "readFlag": v
            }))
            .unwrap();
            raw.normalize().unwrap()
        };

        assert!(flag(json!(1)).is_read());
        assert!(flag(json!(true)).is_read());
        assert!(!flag(json!(0)).is_read());
        assert!(!flag(json!(null)).is_read());
        assert!(!flag(json!("0")).is_read());
    }

    #[test]
    fn test_counterpart() {
        let msg = RawMessage {
            id: Some(1),
            from_user: Some(2),
            to_user: Some(5),
            ..Default::default()
        }
        .normalize()
        .unwrap();

        assert_eq!(msg.counterpart(2), 5);
        assert_eq!(msg.counterpart(5), 2);
        // Outgoing messages never count as unread for us
        assert!(!msg.is_unread_for(2, 5));
    }

    #[test]
    fn test_send_request_wire_shape() {
        let req = SendMessageRequest {
            content: "hi".into(),
            to_user_id: 5,
            product_id: None,
        };
        assert_eq!(
            serde_json::to_value(&req).unwrap(),
            json!({ "content": "hi", "toUserId": 5 })
        );
    }

    #[test]
    fn test_event_tagging() {
        let event = SyncEvent::UnreadChanged { total: 3 };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({ "type": "unread_changed", "total": 3 })
        );
    }
}
