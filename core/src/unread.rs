/// Unread totals and the tab-bar badge
use crate::conversation::ConversationAggregator;
use std::sync::Arc;
use tracing::info;

/// External badge display (tab-bar icon)
pub trait BadgeSink: Send + Sync {
    fn set_badge(&self, text: &str);
    fn clear_badge(&self);
}

/// Badge sink that only logs; used by the headless binary
#[derive(Debug, Default, Clone)]
pub struct LogBadge;

impl BadgeSink for LogBadge {
    fn set_badge(&self, text: &str) {
        info!("🔔 Unread badge: {}", text);
    }

    fn clear_badge(&self) {
        info!("🔕 Unread badge cleared");
    }
}

/// Sum of per-counterpart unread counts. Pure; recomputed on every table
/// change because `mark_read` zeroes counts out of band.
pub fn recompute_global_total(table: &ConversationAggregator) -> u32 {
    table.unread_counts().sum()
}

/// Badge label, capped as `99+`
pub fn badge_text(count: u32, cap: u32) -> String {
    if count > cap {
        format!("{}+", cap)
    } else {
        count.to_string()
    }
}

pub struct UnreadCounter {
    badge: Arc<dyn BadgeSink>,
    cap: u32,
    last_published: Option<u32>,
}

impl UnreadCounter {
    pub fn new(badge: Arc<dyn BadgeSink>, cap: u32) -> Self {
        Self {
            badge,
            cap,
            last_published: None,
        }
    }

    /// Push `total` to the badge. Zero clears the badge instead of showing
    /// "0". Returns false when the badge already shows this total.
    pub fn publish(&mut self, total: u32) -> bool {
        if self.last_published == Some(total) {
            return false;
        }
        self.last_published = Some(total);

        if total == 0 {
            self.badge.clear_badge();
        } else {
            self.badge.set_badge(&badge_text(total, self.cap));
        }
        true
    }

    pub fn last_published(&self) -> Option<u32> {
        self.last_published
    }
}
