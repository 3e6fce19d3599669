/// Thread storage: the ordered message history of the open conversation
/// In-memory only; the server is the source of truth
use crate::messenger_types::{Message, MessageId, RawMessage, UserId};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use tracing::{debug, warn};

#[derive(Debug, Default)]
pub struct MessageStore {
    counterpart: Option<UserId>,
    messages: Vec<Message>,
    ids: HashSet<MessageId>,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind the store to a thread, dropping whatever was loaded before
    pub fn open(&mut self, counterpart: UserId) {
        self.clear();
        self.counterpart = Some(counterpart);
    }

    pub fn close(&mut self) {
        self.clear();
        self.counterpart = None;
    }

    pub fn counterpart(&self) -> Option<UserId> {
        self.counterpart
    }

    /// Whether a response fetched for `counterpart` still belongs here
    pub fn is_current(&self, counterpart: UserId) -> bool {
        self.counterpart == Some(counterpart)
    }

    /// Replace the whole thread. Returns false (and changes nothing) when the
    /// response belongs to a thread that is no longer open.
    pub fn load_all(&mut self, counterpart: UserId, raw: Vec<RawMessage>) -> bool {
        if !self.is_current(counterpart) {
            debug!("Discarding stale thread load for {}", counterpart);
            return false;
        }

        self.clear();
        for msg in normalize_all(raw) {
            if self.ids.insert(msg.id) {
                self.messages.push(msg);
            }
        }
        self.sort();
        true
    }

    /// Append messages newer than the cursor, dropping ids already held.
    ///
    /// Returns the messages actually added, oldest first, or None when the
    /// response is stale.
    pub fn append_since(&mut self, counterpart: UserId, raw: Vec<RawMessage>) -> Option<Vec<Message>> {
        if !self.is_current(counterpart) {
            debug!("Discarding stale thread increment for {}", counterpart);
            return None;
        }

        let mut added = Vec::new();
        for msg in normalize_all(raw) {
            if self.ids.insert(msg.id) {
                added.push(msg.clone());
                self.messages.push(msg);
            }
        }

        if !added.is_empty() {
            self.sort();
            added.sort_by_key(|m| (m.created_at, m.id));
        }
        Some(added)
    }

    /// `since` cursor for the next incremental fetch
    pub fn last_seen_timestamp(&self) -> Option<DateTime<Utc>> {
        self.messages.iter().map(|m| m.created_at).max()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    fn clear(&mut self) {
        self.messages.clear();
        self.ids.clear();
    }

    fn sort(&mut self) {
        self.messages.sort_by_key(|m| (m.created_at, m.id));
    }
}

fn normalize_all(raw: Vec<RawMessage>) -> Vec<Message> {
    raw.into_iter()
        .filter_map(|r| match r.normalize() {
            Ok(msg) => Some(msg),
            Err(e) => {
                warn!("Skipping thread message: {}", e);
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(id: i64, from: i64, to: i64, ms: i64) -> RawMessage {
        RawMessage {
            id: Some(id),
            from_user: Some(from),
            to_user: Some(to),
            content: Some(format!("m{}", id)),
            created_at: Some(json!(ms)),
            ..Default::default()
        }
    }

    const T0: i64 = 1_700_000_000_000;

    #[test]
    fn test_load_all_replaces_and_orders() {
        let mut store = MessageStore::new();
        store.open(5);

        assert!(store.load_all(5, vec![raw(2, 5, 2, T0 + 20), raw(1, 2, 5, T0 + 10)]));
        let ids: Vec<_> = store.messages().iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![1, 2]);

        assert!(store.load_all(5, vec![raw(3, 5, 2, T0 + 30)]));
        assert_eq!(store.len(), 1);
        assert_eq!(store.messages()[0].id, 3);
    }

    #[test]
    fn test_append_since_drops_duplicates() {
        let mut store = MessageStore::new();
        store.open(5);
        store.load_all(5, vec![raw(1, 5, 2, T0), raw(2, 2, 5, T0 + 10)]);

        let added = store
            .append_since(5, vec![raw(2, 2, 5, T0 + 10), raw(3, 5, 2, T0 + 20)])
            .unwrap();
        assert_eq!(added.len(), 1);
        assert_eq!(added[0].id, 3);
        assert_eq!(store.len(), 3);
        assert_eq!(store.last_seen_timestamp().unwrap().timestamp_millis(), T0 + 20);

        // Re-delivery of everything adds nothing
        let again = store
            .append_since(5, vec![raw(1, 5, 2, T0), raw(3, 5, 2, T0 + 20)])
            .unwrap();
        assert!(again.is_empty());
    }

    #[test]
    fn test_stale_responses_are_discarded() {
        let mut store = MessageStore::new();
        store.open(5);
        store.load_all(5, vec![raw(1, 5, 2, T0)]);

        store.open(9);
        assert!(!store.load_all(5, vec![raw(4, 5, 2, T0)]));
        assert!(store.append_since(5, vec![raw(4, 5, 2, T0)]).is_none());
        assert!(store.is_empty());

        store.close();
        assert!(store.append_since(9, vec![raw(4, 9, 2, T0)]).is_none());
    }

    #[test]
    fn test_unattributable_messages_skipped() {
        let mut store = MessageStore::new();
        store.open(5);
        let broken = RawMessage {
            id: None,
            ..raw(0, 5, 2, T0)
        };
        store.load_all(5, vec![broken, raw(1, 5, 2, T0)]);
        assert_eq!(store.len(), 1);
    }
}
