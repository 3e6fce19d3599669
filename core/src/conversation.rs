/// Conversation aggregation: folds paginated, polled, overlapping message
/// pages into one entry per counterpart.
///
/// Invariants held across any sequence of merges:
/// - at most one entry per counterpart;
/// - `last_message` is the newest message ever observed for the counterpart
///   (an older page can never regress it);
/// - each qualifying unread message id is counted at most once, and a
///   count zeroed by `mark_read` is never re-inflated by ids seen before.
use crate::messenger_types::{Conversation, Message, MessageId, RawMessage, UserId};
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

/// Counterpart name and avatar as shown in the list
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DisplayInfo {
    pub name: String,
    pub avatar_url: String,
}

impl DisplayInfo {
    pub fn is_empty(&self) -> bool {
        self.name.is_empty() && self.avatar_url.is_empty()
    }

    /// Field-wise: an incoming value only wins when it is non-empty
    pub fn richer(existing: &DisplayInfo, incoming: &DisplayInfo) -> DisplayInfo {
        let pick = |old: &String, new: &String| {
            if new.is_empty() {
                old.clone()
            } else {
                new.clone()
            }
        };
        DisplayInfo {
            name: pick(&existing.name, &incoming.name),
            avatar_url: pick(&existing.avatar_url, &incoming.avatar_url),
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    last_message: Message,
    unread_count: u32,
    display: DisplayInfo,
    product_id: Option<i64>,
}

/// Messages of one page that belong to one counterpart
#[derive(Debug, Clone)]
pub struct PageGroup {
    pub counterpart: UserId,
    pub last_message: Message,
    pub unread_ids: Vec<MessageId>,
    pub product_id: Option<i64>,
}

/// Result of merging one page
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    /// Counterparts seen for the first time (need a profile lookup)
    pub new_counterparts: Vec<UserId>,
    /// Whether any entry's last message, product or unread count moved
    pub changed: bool,
    /// Records dropped because they could not be attributed
    pub skipped: usize,
}

/// Pagination state of the conversation list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageCursor {
    pub page: u32,
    pub size: u32,
    pub has_more: bool,
}

impl PageCursor {
    pub fn new(size: u32) -> Self {
        Self {
            page: 0,
            size,
            has_more: true,
        }
    }

    pub fn reset(&mut self) {
        self.page = 0;
        self.has_more = true;
    }

    /// Record that `loaded` was fetched and whether the server has more
    pub fn advance(&mut self, loaded: u32, has_next: bool) {
        self.page = loaded + 1;
        self.has_more = has_next;
    }
}

/// In-memory conversation table
#[derive(Debug)]
pub struct ConversationAggregator {
    entries: HashMap<UserId, Entry>,
    /// Every unread id ever counted, across all counterparts
    counted: HashSet<MessageId>,
    /// Counterparts whose profile lookup was already issued this session
    profile_requested: HashSet<UserId>,
    cursor: PageCursor,
}

impl ConversationAggregator {
    pub fn new(page_size: u32) -> Self {
        Self {
            entries: HashMap::new(),
            counted: HashSet::new(),
            profile_requested: HashSet::new(),
            cursor: PageCursor::new(page_size),
        }
    }

    /// Merge one raw page into the table.
    ///
    /// Records that cannot be attributed to a counterpart (no id, sender or
    /// recipient) are skipped one by one; the rest of the page still merges.
    /// Normalisation happens before any entry is touched, so the table moves
    /// from one consistent state to the next.
    pub fn merge_page(&mut self, raw: Vec<RawMessage>, current_user: UserId) -> MergeOutcome {
        let mut skipped = 0;
        let messages: Vec<Message> = raw
            .into_iter()
            .filter_map(|r| match r.normalize() {
                Ok(msg) => Some(msg),
                Err(e) => {
                    warn!("Skipping unattributable message in conversation page: {}", e);
                    skipped += 1;
                    None
                }
            })
            .collect();

        let groups = group_by_counterpart(&messages, current_user);
        let mut outcome = self.reconcile(groups);
        outcome.skipped = skipped;
        outcome
    }

    /// Fold page groups into the table. Display info already cached is
    /// never replaced here; it only changes through `apply_profile`.
    pub fn reconcile(&mut self, groups: Vec<PageGroup>) -> MergeOutcome {
        let mut outcome = MergeOutcome::default();

        for group in groups {
            let is_new = !self.entries.contains_key(&group.counterpart);
            let entry = self.entries.entry(group.counterpart).or_insert_with(|| Entry {
                last_message: group.last_message.clone(),
                unread_count: 0,
                display: DisplayInfo::default(),
                product_id: None,
            });

            let newer = !is_new && group.last_message.created_at > entry.last_message.created_at;
            if is_new {
                debug!("New conversation with {}", group.counterpart);
                outcome.new_counterparts.push(group.counterpart);
                outcome.changed = true;
            } else if newer {
                entry.last_message = group.last_message;
                outcome.changed = true;
            }

            // Product context follows the newest message, like last_message
            if group.product_id.is_some()
                && group.product_id != entry.product_id
                && (is_new || newer || entry.product_id.is_none())
            {
                entry.product_id = group.product_id;
                outcome.changed = true;
            }

            for id in group.unread_ids {
                if self.counted.insert(id) {
                    entry.unread_count += 1;
                    outcome.changed = true;
                }
            }
        }

        outcome.new_counterparts.sort_unstable();
        outcome
    }

    /// Descending by last message time, ties by counterpart id ascending
    pub fn sort_for_display(&self) -> Vec<Conversation> {
        let mut list: Vec<Conversation> = self
            .entries
            .iter()
            .map(|(&counterpart, entry)| Conversation {
                counterpart_user_id: counterpart,
                last_message: entry.last_message.clone(),
                unread_count: entry.unread_count,
                counterpart_display_name: entry.display.name.clone(),
                counterpart_avatar_url: entry.display.avatar_url.clone(),
                product_id: entry.product_id,
            })
            .collect();

        list.sort_by(|a, b| {
            b.last_message
                .created_at
                .cmp(&a.last_message.created_at)
                .then(a.counterpart_user_id.cmp(&b.counterpart_user_id))
        });
        list
    }

    /// Zero a counterpart's unread count locally. Returns whether it changed.
    pub fn mark_read(&mut self, counterpart: UserId) -> bool {
        match self.entries.get_mut(&counterpart) {
            Some(entry) if entry.unread_count > 0 => {
                entry.unread_count = 0;
                true
            }
            _ => false,
        }
    }

    /// Counterparts that still need a profile lookup. Each counterpart is
    /// returned once per session, whatever the lookup's outcome.
    pub fn take_profile_requests(&mut self) -> Vec<UserId> {
        let mut pending: Vec<UserId> = self
            .entries
            .iter()
            .filter(|(id, entry)| entry.display.is_empty() && !self.profile_requested.contains(*id))
            .map(|(&id, _)| id)
            .collect();
        pending.sort_unstable();
        self.profile_requested.extend(pending.iter().copied());
        pending
    }

    /// Store a looked-up profile, keeping any richer info already cached
    pub fn apply_profile(&mut self, counterpart: UserId, info: DisplayInfo) -> bool {
        match self.entries.get_mut(&counterpart) {
            Some(entry) => {
                let merged = DisplayInfo::richer(&entry.display, &info);
                let changed = merged != entry.display;
                entry.display = merged;
                changed
            }
            None => false,
        }
    }

    pub fn unread_count(&self, counterpart: UserId) -> Option<u32> {
        self.entries.get(&counterpart).map(|e| e.unread_count)
    }

    pub fn unread_counts(&self) -> impl Iterator<Item = u32> + '_ {
        self.entries.values().map(|e| e.unread_count)
    }

    pub fn get(&self, counterpart: UserId) -> Option<Conversation> {
        self.sort_for_display()
            .into_iter()
            .find(|c| c.counterpart_user_id == counterpart)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn cursor(&self) -> PageCursor {
        self.cursor
    }

    pub fn cursor_mut(&mut self) -> &mut PageCursor {
        &mut self.cursor
    }
}

/// Group a normalised page by counterpart
pub fn group_by_counterpart(messages: &[Message], current_user: UserId) -> Vec<PageGroup> {
    let mut groups: HashMap<UserId, PageGroup> = HashMap::new();

    for msg in messages {
        let counterpart = msg.counterpart(current_user);
        let group = groups.entry(counterpart).or_insert_with(|| PageGroup {
            counterpart,
            last_message: msg.clone(),
            unread_ids: Vec::new(),
            product_id: None,
        });

        if msg.created_at > group.last_message.created_at {
            group.last_message = msg.clone();
        }
        if msg.is_unread_for(current_user, counterpart) {
            group.unread_ids.push(msg.id);
        }
    }

    let mut out: Vec<PageGroup> = groups
        .into_values()
        .map(|mut g| {
            g.product_id = g.last_message.product_id.or_else(|| {
                messages
                    .iter()
                    .filter(|m| m.counterpart(current_user) == g.counterpart)
                    .filter_map(|m| m.product_id.map(|p| (m.created_at, p)))
                    .max()
                    .map(|(_, p)| p)
            });
            g
        })
        .collect();
    out.sort_by_key(|g| g.counterpart);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const ME: UserId = 2;
    const T0: i64 = 1_700_000_000_000;

    fn msg(id: i64, from: i64, to: i64, ms: i64, read: Option<u8>) -> RawMessage {
        RawMessage {
            id: Some(id),
            from_user: Some(from),
            to_user: Some(to),
            content: Some(format!("message {}", id)),
            created_at: Some(json!(ms)),
            read_flag: read.map(|r| json!(r)),
            product_id: None,
        }
    }

    #[test]
    fn test_new_contact() {
        let mut agg = ConversationAggregator::new(20);
        let outcome = agg.merge_page(vec![msg(1, 5, ME, T0, Some(0))], ME);

        assert_eq!(outcome.new_counterparts, vec![5]);
        let list = agg.sort_for_display();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].counterpart_user_id, 5);
        assert_eq!(list[0].unread_count, 1);
        assert_eq!(list[0].last_message.id, 1);
        assert_eq!(list[0].counterpart_display_name, "");
    }

    #[test]
    fn test_idempotent_merge() {
        let page = vec![
            msg(1, 5, ME, T0, Some(0)),
            msg(2, ME, 5, T0 + 10, Some(0)),
            msg(3, 7, ME, T0 + 5, None),
        ];

        let mut agg = ConversationAggregator::new(20);
        agg.merge_page(page.clone(), ME);
        let once = agg.sort_for_display();

        let outcome = agg.merge_page(page, ME);
        assert!(!outcome.changed);
        assert!(outcome.new_counterparts.is_empty());
        assert_eq!(agg.sort_for_display(), once);
    }

    #[test]
    fn test_out_of_order_page_does_not_regress() {
        let mut agg = ConversationAggregator::new(20);
        agg.merge_page(vec![msg(2, 5, ME, T0 + 100, None)], ME);
        agg.merge_page(vec![msg(1, 5, ME, T0, None)], ME);

        let conv = agg.get(5).unwrap();
        assert_eq!(conv.last_message.id, 2);
        assert_eq!(conv.unread_count, 2);
    }

    #[test]
    fn test_duplicate_across_pages_counted_once() {
        let mut agg = ConversationAggregator::new(20);
        agg.merge_page(vec![msg(7, 5, ME, T0, Some(0)), msg(8, 5, ME, T0 + 1, Some(0))], ME);
        agg.merge_page(vec![msg(7, 5, ME, T0, Some(0)), msg(9, 6, ME, T0 + 2, Some(0))], ME);

        assert_eq!(agg.unread_count(5), Some(2));
        assert_eq!(agg.unread_count(6), Some(1));
    }

    #[test]
    fn test_mark_read_zeroes_and_stays_zero() {
        let mut agg = ConversationAggregator::new(20);
        agg.merge_page(vec![msg(1, 5, ME, T0, Some(0))], ME);

        assert!(agg.mark_read(5));
        assert_eq!(agg.unread_count(5), Some(0));
        assert!(!agg.mark_read(5));
        assert!(!agg.mark_read(404));

        // Server may still report id 1 as unread; it was already counted
        agg.merge_page(vec![msg(1, 5, ME, T0, Some(0))], ME);
        assert_eq!(agg.unread_count(5), Some(0));

        // A genuinely new message counts again
        agg.merge_page(vec![msg(4, 5, ME, T0 + 50, Some(0))], ME);
        assert_eq!(agg.unread_count(5), Some(1));
    }

    #[test]
    fn test_only_incoming_unread_counts() {
        let mut agg = ConversationAggregator::new(20);
        agg.merge_page(
            vec![
                msg(1, ME, 5, T0, Some(0)),     // ours
                msg(2, 5, ME, T0 + 1, Some(1)), // already read
                msg(3, 5, ME, T0 + 2, None),    // unknown flag is unread
            ],
            ME,
        );
        assert_eq!(agg.unread_count(5), Some(1));
    }

    #[test]
    fn test_unattributable_record_is_skipped_alone() {
        let mut agg = ConversationAggregator::new(20);
        agg.merge_page(vec![msg(1, 5, ME, T0, Some(0))], ME);

        let broken = RawMessage {
            from_user: None,
            ..msg(3, 6, ME, T0, Some(0))
        };
        let outcome = agg.merge_page(vec![msg(2, 5, ME, T0 + 10, Some(0)), broken], ME);
        assert_eq!(outcome.skipped, 1);
        assert!(outcome.changed);

        let conv = agg.get(5).unwrap();
        assert_eq!(conv.last_message.id, 2);
        assert_eq!(conv.unread_count, 2);
        assert_eq!(agg.len(), 1);

        // A page made only of bad rows leaves the table as it was
        let outcome = agg.merge_page(vec![RawMessage::default()], ME);
        assert_eq!(outcome.skipped, 1);
        assert!(!outcome.changed);
        assert_eq!(agg.len(), 1);
    }

    #[test]
    fn test_sort_for_display_ties() {
        let mut agg = ConversationAggregator::new(20);
        agg.merge_page(
            vec![
                msg(1, 9, ME, T0, None),
                msg(2, 4, ME, T0, None),
                msg(3, 6, ME, T0 + 10, None),
            ],
            ME,
        );

        let order: Vec<_> = agg.sort_for_display().iter().map(|c| c.counterpart_user_id).collect();
        assert_eq!(order, vec![6, 4, 9]);
    }

    #[test]
    fn test_profiles_requested_once_and_not_overwritten() {
        let mut agg = ConversationAggregator::new(20);
        agg.merge_page(vec![msg(1, 5, ME, T0, None), msg(2, 6, ME, T0, None)], ME);

        assert_eq!(agg.take_profile_requests(), vec![5, 6]);
        assert!(agg.take_profile_requests().is_empty());

        assert!(agg.apply_profile(
            5,
            DisplayInfo {
                name: "Alice".into(),
                avatar_url: "https://cdn.test/a.png".into(),
            }
        ));

        // Later merges and empty lookups leave cached info alone
        agg.merge_page(vec![msg(3, 5, ME, T0 + 10, None)], ME);
        assert!(!agg.apply_profile(5, DisplayInfo::default()));
        let conv = agg.get(5).unwrap();
        assert_eq!(conv.counterpart_display_name, "Alice");
        assert_eq!(conv.counterpart_avatar_url, "https://cdn.test/a.png");
        assert!(agg.take_profile_requests().is_empty());
    }

    #[test]
    fn test_product_id_follows_latest() {
        let mut first = msg(1, 5, ME, T0, None);
        first.product_id = Some(11);
        let mut agg = ConversationAggregator::new(20);
        agg.merge_page(vec![first, msg(2, ME, 5, T0 + 5, None)], ME);
        assert_eq!(agg.get(5).unwrap().product_id, Some(11));

        let mut later = msg(3, 5, ME, T0 + 10, None);
        later.product_id = Some(12);
        agg.merge_page(vec![later], ME);
        assert_eq!(agg.get(5).unwrap().product_id, Some(12));

        // An older page arriving late does not move it back
        let mut stale = msg(4, 5, ME, T0 + 1, None);
        stale.product_id = Some(11);
        let outcome = agg.merge_page(vec![stale], ME);
        assert_eq!(agg.get(5).unwrap().product_id, Some(12));
        assert!(outcome.changed); // id 4 is a new unread

        let mut newest = msg(5, ME, 5, T0 + 20, None);
        newest.product_id = Some(13);
        let outcome = agg.merge_page(vec![newest], ME);
        assert!(outcome.changed);
        assert_eq!(agg.get(5).unwrap().product_id, Some(13));
    }

    #[test]
    fn test_product_id_filled_when_missing() {
        let mut agg = ConversationAggregator::new(20);
        agg.merge_page(vec![msg(1, ME, 5, T0 + 10, None)], ME);
        assert_eq!(agg.get(5).unwrap().product_id, None);

        let mut older = msg(2, ME, 5, T0, None);
        older.product_id = Some(7);
        let outcome = agg.merge_page(vec![older], ME);
        assert!(outcome.changed);
        assert_eq!(agg.get(5).unwrap().product_id, Some(7));
    }

    #[test]
    fn test_page_cursor() {
        let mut cursor = PageCursor::new(20);
        assert_eq!((cursor.page, cursor.has_more), (0, true));
        cursor.advance(0, true);
        assert_eq!(cursor.page, 1);
        cursor.advance(1, false);
        assert_eq!((cursor.page, cursor.has_more), (2, false));
        cursor.reset();
        assert_eq!((cursor.page, cursor.has_more), (0, true));
    }
}
