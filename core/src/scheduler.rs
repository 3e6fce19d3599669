/// Polling scheduler: two repeating timers (open thread, conversation list)
/// whose run state follows the active view and app visibility.
///
/// The two timers are never both `Running`; starting one stops the other.
use crate::messenger_types::UserId;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Run state of one timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimerState {
    Stopped,
    Running,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimerKind {
    /// Incremental fetch of the open thread
    Thread,
    /// Page-0 refresh of the conversation list
    List,
}

/// Which view is in front
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum View {
    List,
    Thread(UserId),
}

#[derive(Debug)]
pub struct PollingScheduler {
    view: View,
    visible: bool,
    thread_timer: TimerState,
    list_timer: TimerState,
    /// Thread whose request is pending, if any
    thread_in_flight: Option<UserId>,
    list_in_flight: bool,
}

impl Default for PollingScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl PollingScheduler {
    /// Starts on the list view, visible, with nothing running yet
    pub fn new() -> Self {
        Self {
            view: View::List,
            visible: true,
            thread_timer: TimerState::Stopped,
            list_timer: TimerState::Stopped,
            thread_in_flight: None,
            list_in_flight: false,
        }
    }

    pub fn view(&self) -> View {
        self.view
    }

    pub fn open_thread(&self) -> Option<UserId> {
        match self.view {
            View::Thread(counterpart) => Some(counterpart),
            View::List => None,
        }
    }

    pub fn is_visible(&self) -> bool {
        self.visible
    }

    pub fn state(&self, kind: TimerKind) -> TimerState {
        match kind {
            TimerKind::Thread => self.thread_timer,
            TimerKind::List => self.list_timer,
        }
    }

    pub fn is_running(&self, kind: TimerKind) -> bool {
        self.state(kind) == TimerState::Running
    }

    /// Conversation list comes to the front.
    /// Returns the stream to fetch immediately, if any.
    pub fn show_list(&mut self) -> Option<TimerKind> {
        self.view = View::List;
        self.activate_current_view()
    }

    /// Same as `show_list`; named for the back-navigation path
    pub fn close_thread(&mut self) -> Option<TimerKind> {
        self.show_list()
    }

    pub fn enter_thread(&mut self, counterpart: UserId) -> Option<TimerKind> {
        self.view = View::Thread(counterpart);
        self.activate_current_view()
    }

    /// App or page hidden: everything stops
    pub fn hide(&mut self) {
        self.visible = false;
        self.stop(TimerKind::Thread);
        self.stop(TimerKind::List);
    }

    /// App or page shown again: resume the current view's timer and fetch
    /// right away instead of waiting for the first tick
    pub fn show(&mut self) -> Option<TimerKind> {
        self.visible = true;
        self.activate_current_view()
    }

    /// Stop both timers for good
    pub fn dispose(&mut self) {
        self.hide();
        self.thread_in_flight = None;
        self.list_in_flight = false;
    }

    fn activate_current_view(&mut self) -> Option<TimerKind> {
        if !self.visible {
            debug!("View changed while hidden; timers stay stopped");
            return None;
        }
        let kind = match self.view {
            View::List => TimerKind::List,
            View::Thread(_) => TimerKind::Thread,
        };
        self.start(kind);
        Some(kind)
    }

    /// Idempotent start; enforces exclusivity by stopping the other timer
    fn start(&mut self, kind: TimerKind) -> bool {
        let other = match kind {
            TimerKind::Thread => TimerKind::List,
            TimerKind::List => TimerKind::Thread,
        };
        self.stop(other);

        let slot = self.slot(kind);
        if *slot == TimerState::Running {
            return false;
        }
        *slot = TimerState::Running;
        debug!("{:?} timer started", kind);
        true
    }

    fn stop(&mut self, kind: TimerKind) -> bool {
        let slot = self.slot(kind);
        if *slot == TimerState::Stopped {
            return false;
        }
        *slot = TimerState::Stopped;
        debug!("{:?} timer stopped", kind);
        true
    }

    fn slot(&mut self, kind: TimerKind) -> &mut TimerState {
        match kind {
            TimerKind::Thread => &mut self.thread_timer,
            TimerKind::List => &mut self.list_timer,
        }
    }

    /// Claim the thread stream for `counterpart`. False while a request for
    /// the same thread is still pending; a pending request for another
    /// thread is superseded (its response will be discarded as stale).
    pub fn begin_thread_fetch(&mut self, counterpart: UserId) -> bool {
        if self.thread_in_flight == Some(counterpart) {
            return false;
        }
        self.thread_in_flight = Some(counterpart);
        true
    }

    pub fn end_thread_fetch(&mut self, counterpart: UserId) {
        if self.thread_in_flight == Some(counterpart) {
            self.thread_in_flight = None;
        }
    }

    /// Forget any pending thread request; used when a thread view is
    /// (re)opened so its full load always goes out
    pub fn reset_thread_fetch(&mut self) {
        self.thread_in_flight = None;
    }

    pub fn begin_list_fetch(&mut self) -> bool {
        if self.list_in_flight {
            return false;
        }
        self.list_in_flight = true;
        true
    }

    pub fn end_list_fetch(&mut self) {
        self.list_in_flight = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_exclusive(s: &PollingScheduler) {
        assert!(
            !(s.is_running(TimerKind::Thread) && s.is_running(TimerKind::List)),
            "both timers running"
        );
    }

    #[test]
    fn test_view_transitions() {
        let mut s = PollingScheduler::new();
        assert_eq!(s.show_list(), Some(TimerKind::List));
        assert!(s.is_running(TimerKind::List));

        assert_eq!(s.enter_thread(5), Some(TimerKind::Thread));
        assert!(s.is_running(TimerKind::Thread));
        assert!(!s.is_running(TimerKind::List));
        assert_eq!(s.open_thread(), Some(5));

        assert_eq!(s.close_thread(), Some(TimerKind::List));
        assert!(s.is_running(TimerKind::List));
        assert!(!s.is_running(TimerKind::Thread));
        assert_eq!(s.open_thread(), None);
    }

    #[test]
    fn test_hide_and_show() {
        let mut s = PollingScheduler::new();
        s.enter_thread(5);
        s.hide();
        assert_eq!(s.state(TimerKind::Thread), TimerState::Stopped);
        assert_eq!(s.state(TimerKind::List), TimerState::Stopped);

        // Navigation while hidden does not start anything
        assert_eq!(s.close_thread(), None);
        assert!(!s.is_running(TimerKind::List));

        assert_eq!(s.show(), Some(TimerKind::List));
        assert!(s.is_running(TimerKind::List));
    }

    #[test]
    fn test_timer_exclusivity_under_any_sequence() {
        let mut s = PollingScheduler::new();

        // Walk a deterministic pseudo-random sequence of transitions
        let mut seed = 7u32;
        for _ in 0..500 {
            seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12_345);
            match (seed >> 16) % 6 {
                0 => {
                    s.show_list();
                }
                1 => {
                    s.enter_thread(3);
                }
                2 => {
                    s.enter_thread(4);
                }
                3 => s.hide(),
                4 => {
                    s.show();
                }
                _ => {
                    s.close_thread();
                }
            }
            assert_exclusive(&s);
        }
    }

    #[test]
    fn test_idempotent_start() {
        let mut s = PollingScheduler::new();
        assert!(s.start(TimerKind::List));
        assert!(!s.start(TimerKind::List));
        assert!(s.start(TimerKind::Thread));
        assert!(!s.is_running(TimerKind::List));
    }

    #[test]
    fn test_in_flight_guards() {
        let mut s = PollingScheduler::new();
        assert!(s.begin_list_fetch());
        assert!(!s.begin_list_fetch());
        s.end_list_fetch();
        assert!(s.begin_list_fetch());

        assert!(s.begin_thread_fetch(5));
        assert!(!s.begin_thread_fetch(5));
        // Switching threads supersedes the pending request
        assert!(s.begin_thread_fetch(6));
        // The old completion must not release the new claim
        s.end_thread_fetch(5);
        assert!(!s.begin_thread_fetch(6));
        s.end_thread_fetch(6);
        assert!(s.begin_thread_fetch(6));
    }

    #[test]
    fn test_reopen_releases_thread_claim() {
        let mut s = PollingScheduler::new();
        s.enter_thread(5);
        assert!(s.begin_thread_fetch(5));
        s.close_thread();
        s.enter_thread(5);
        s.reset_thread_fetch();
        assert!(s.begin_thread_fetch(5));
    }

    #[test]
    fn test_dispose_stops_everything() {
        let mut s = PollingScheduler::new();
        s.enter_thread(9);
        s.begin_thread_fetch(9);
        s.dispose();
        assert!(!s.is_running(TimerKind::Thread));
        assert!(!s.is_running(TimerKind::List));
        assert!(s.begin_thread_fetch(9));
    }
}
