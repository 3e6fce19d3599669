/// Conversation synchronizer runtime
///
/// One tokio task owns every piece of state (thread store, conversation
/// table, unread counter, scheduler). UI calls arrive as commands over a
/// channel; network work runs in spawned tasks whose results come back on a
/// completion channel and are applied by the same loop, so the table is only
/// ever touched from one place and each completion is applied whole.
use crate::api::MessageApi;
use crate::config::Config;
use crate::conversation::{ConversationAggregator, DisplayInfo, PageCursor};
use crate::error::{ErrorClass, Result, SyncError};
use crate::message_store::MessageStore;
use crate::messenger_types::{
    Conversation, ConversationPage, Message, RawMessage, SyncEvent, UserId, UserProfile,
};
use crate::scheduler::{PollingScheduler, TimerKind, View};
use crate::unread::{recompute_global_total, BadgeSink, UnreadCounter};
use crate::validation::build_send_request;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Point-in-time copy of the synchronizer state
#[derive(Debug, Clone)]
pub struct SyncSnapshot {
    pub view: View,
    pub current_user: Option<UserId>,
    pub conversations: Vec<Conversation>,
    pub thread: Vec<Message>,
    pub unread_total: u32,
    pub cursor: PageCursor,
    pub thread_timer_running: bool,
    pub list_timer_running: bool,
}

enum Command {
    ShowList,
    OpenThread {
        counterpart: UserId,
        product_id: Option<i64>,
    },
    CloseThread,
    AppShow,
    AppHide,
    LoadNextPage,
    Refresh,
    Send {
        content: String,
        reply: oneshot::Sender<Result<Message>>,
    },
    MarkRead(UserId),
    Snapshot(oneshot::Sender<SyncSnapshot>),
    Dispose(oneshot::Sender<()>),
}

/// Why a list page was requested
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListFetch {
    /// First page after create or pull-to-refresh; moves the cursor
    Initial,
    /// Timer-driven page-0 refresh; cursor untouched
    Poll,
    /// Explicit "load next page"
    Next,
}

enum Completion {
    CurrentUser(Result<UserProfile>),
    ThreadLoaded {
        counterpart: UserId,
        generation: u64,
        result: Result<Vec<RawMessage>>,
    },
    ThreadIncrement {
        counterpart: UserId,
        generation: u64,
        result: Result<Vec<RawMessage>>,
    },
    ListPage {
        page: u32,
        fetch: ListFetch,
        result: Result<ConversationPage>,
    },
    Profile {
        counterpart: UserId,
        result: Result<UserProfile>,
    },
    MarkedRead {
        counterpart: UserId,
        result: Result<()>,
    },
    Sent {
        counterpart: UserId,
        result: Result<RawMessage>,
        reply: oneshot::Sender<Result<Message>>,
    },
    UnreadCount(Result<u32>),
}

/// Cloneable front door to a running synchronizer
#[derive(Clone)]
pub struct SyncHandle {
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<SyncEvent>,
}

impl SyncHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    fn send(&self, command: Command) -> Result<()> {
        self.commands.send(command).map_err(|_| SyncError::Closed)
    }

    pub fn show_list(&self) -> Result<()> {
        self.send(Command::ShowList)
    }

    pub fn open_thread(&self, counterpart: UserId, product_id: Option<i64>) -> Result<()> {
        self.send(Command::OpenThread {
            counterpart,
            product_id,
        })
    }

    pub fn close_thread(&self) -> Result<()> {
        self.send(Command::CloseThread)
    }

    pub fn app_show(&self) -> Result<()> {
        self.send(Command::AppShow)
    }

    pub fn app_hide(&self) -> Result<()> {
        self.send(Command::AppHide)
    }

    pub fn load_next_page(&self) -> Result<()> {
        self.send(Command::LoadNextPage)
    }

    /// Pull-to-refresh: re-read the list from page 0
    pub fn refresh(&self) -> Result<()> {
        self.send(Command::Refresh)
    }

    /// Zero the counterpart's unread count now; the server is told in the
    /// background and a failure there is reported but not rolled back.
    pub fn mark_read(&self, counterpart: UserId) -> Result<()> {
        self.send(Command::MarkRead(counterpart))
    }

    /// Send to the open thread
    pub async fn send_message(&self, content: impl Into<String>) -> Result<Message> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Send {
            content: content.into(),
            reply,
        })?;
        rx.await.map_err(|_| SyncError::Closed)?
    }

    pub async fn snapshot(&self) -> Result<SyncSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Snapshot(tx))?;
        rx.await.map_err(|_| SyncError::Closed)
    }

    /// Stop both timers and end the runtime task
    pub async fn dispose(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Dispose(tx))?;
        rx.await.map_err(|_| SyncError::Closed)
    }
}

pub struct Synchronizer {
    config: Config,
    api: Arc<dyn MessageApi>,
    events: broadcast::Sender<SyncEvent>,
    commands: mpsc::UnboundedReceiver<Command>,
    completions_tx: mpsc::UnboundedSender<Completion>,
    completions: mpsc::UnboundedReceiver<Completion>,

    current_user: Option<UserId>,
    user_request_in_flight: bool,
    session_expired: bool,
    thread_product: Option<i64>,
    /// Bumped on every thread open and close; thread responses carrying an
    /// older value belong to a torn-down view
    thread_generation: u64,

    store: MessageStore,
    aggregator: ConversationAggregator,
    unread: UnreadCounter,
    scheduler: PollingScheduler,

    thread_ticker: Option<Interval>,
    list_ticker: Option<Interval>,
    unread_ticker: Option<Interval>,
}

impl Synchronizer {
    /// Mount on the conversation list: spawns the runtime task and starts
    /// the list timer. Must be called inside a tokio runtime.
    pub fn create(
        config: Config,
        api: Arc<dyn MessageApi>,
        badge: Arc<dyn BadgeSink>,
    ) -> Result<SyncHandle> {
        config.validate()?;

        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (completions_tx, completions) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let runtime = Synchronizer {
            aggregator: ConversationAggregator::new(config.page_size),
            unread: UnreadCounter::new(badge, config.badge_cap),
            config,
            api,
            events: events.clone(),
            commands,
            completions_tx,
            completions,
            current_user: None,
            user_request_in_flight: false,
            session_expired: false,
            thread_product: None,
            thread_generation: 0,
            store: MessageStore::new(),
            scheduler: PollingScheduler::new(),
            thread_ticker: None,
            list_ticker: None,
            unread_ticker: None,
        };

        tokio::spawn(runtime.run());

        Ok(SyncHandle {
            commands: commands_tx,
            events,
        })
    }

    async fn run(mut self) {
        info!("Conversation synchronizer started");
        self.request_current_user();
        if let Some(kind) = self.scheduler.show_list() {
            self.fetch_now(kind);
        }
        self.sync_timers();

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Dispose(ack)) => {
                        self.dispose();
                        let _ = ack.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command),
                    None => {
                        // Every handle dropped
                        self.dispose();
                        break;
                    }
                },
                Some(done) = self.completions.recv() => self.apply(done),
                _ = tick(&mut self.thread_ticker) => self.on_thread_tick(),
                _ = tick(&mut self.list_ticker) => self.on_list_tick(),
                _ = tick(&mut self.unread_ticker) => self.poll_unread(),
            }
        }

        info!("Conversation synchronizer stopped");
    }

    fn dispose(&mut self) {
        self.scheduler.dispose();
        self.store.close();
        self.sync_timers();
        self.unread_ticker = None;
    }

    // ─── Commands ────────────────────────────────────────────────────────────

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::ShowList | Command::CloseThread => {
                if self.store.counterpart().is_some() {
                    self.thread_generation += 1;
                }
                self.store.close();
                self.thread_product = None;
                if let Some(kind) = self.scheduler.close_thread() {
                    self.fetch_now(kind);
                }
            }
            Command::OpenThread {
                counterpart,
                product_id,
            } => self.open_thread(counterpart, product_id),
            Command::AppShow => {
                self.session_expired = false;
                if let Some(kind) = self.scheduler.show() {
                    self.fetch_now(kind);
                }
                self.poll_unread();
            }
            Command::AppHide => {
                self.scheduler.hide();
                self.unread_ticker = None;
            }
            Command::LoadNextPage => self.load_next_page(),
            Command::Refresh => {
                self.aggregator.cursor_mut().reset();
                self.fetch_list(0, ListFetch::Initial);
            }
            Command::Send { content, reply } => self.send(content, reply),
            Command::MarkRead(counterpart) => self.mark_read(counterpart),
            Command::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            // Intercepted by the run loop
            Command::Dispose(_) => {}
        }
        self.sync_timers();
    }

    fn open_thread(&mut self, counterpart: UserId, product_id: Option<i64>) {
        info!("Opening thread with {}", counterpart);
        self.thread_generation += 1;
        // Whatever is still pending belongs to the previous view
        self.scheduler.reset_thread_fetch();
        self.store.open(counterpart);
        self.thread_product = product_id;
        self.scheduler.enter_thread(counterpart);
        self.load_thread(counterpart);
        self.mark_read(counterpart);
    }

    fn load_next_page(&mut self) {
        let cursor = self.aggregator.cursor();
        if !cursor.has_more {
            debug!("No more conversation pages");
            return;
        }
        self.fetch_list(cursor.page, ListFetch::Next);
    }

    fn send(&mut self, content: String, reply: oneshot::Sender<Result<Message>>) {
        let Some(counterpart) = self.scheduler.open_thread() else {
            let _ = reply.send(Err(SyncError::Validation("no conversation is open".to_string())));
            return;
        };

        let request = match build_send_request(
            &content,
            counterpart,
            self.thread_product,
            self.config.max_message_len,
            &self.config.blocked_words,
        ) {
            Ok(request) => request,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };

        let api = self.api.clone();
        self.spawn(async move {
            Completion::Sent {
                counterpart,
                result: api.send(&request).await,
                reply,
            }
        });
    }

    fn mark_read(&mut self, counterpart: UserId) {
        // Optimistic: the local count drops now and stays dropped even if
        // the server call fails
        if self.aggregator.mark_read(counterpart) {
            self.publish_conversations();
        }

        let api = self.api.clone();
        self.spawn(async move {
            Completion::MarkedRead {
                counterpart,
                result: api.mark_conversation_read(counterpart).await,
            }
        });
    }

    // ─── Timers ──────────────────────────────────────────────────────────────

    /// Make the tokio intervals mirror the scheduler's timer states
    fn sync_timers(&mut self) {
        let thread_period = self.config.thread_poll_interval;
        let list_period = self.config.list_poll_interval;
        let unread_period = self.config.unread_poll_interval;
        let thread_running = self.scheduler.is_running(TimerKind::Thread);
        let list_running = self.scheduler.is_running(TimerKind::List);
        let visible = self.scheduler.is_visible();

        align(&mut self.thread_ticker, thread_running, thread_period);
        align(&mut self.list_ticker, list_running, list_period);
        align(&mut self.unread_ticker, visible, unread_period);
    }

    fn fetch_now(&mut self, kind: TimerKind) {
        match kind {
            TimerKind::Thread => self.on_thread_tick(),
            TimerKind::List => {
                let fetch = if self.aggregator.cursor().page == 0 {
                    ListFetch::Initial
                } else {
                    ListFetch::Poll
                };
                self.fetch_list(0, fetch);
            }
        }
    }

    fn on_thread_tick(&mut self) {
        let Some(counterpart) = self.scheduler.open_thread() else {
            return;
        };
        if self.store.is_empty() {
            // Nothing loaded yet (or the first load failed): full reload
            self.load_thread(counterpart);
            return;
        }
        if !self.scheduler.begin_thread_fetch(counterpart) {
            debug!("Thread poll skipped: previous request still pending");
            return;
        }

        let since_ms = self
            .store
            .last_seen_timestamp()
            .map(|t| t.timestamp_millis())
            .unwrap_or(0);
        let generation = self.thread_generation;
        let api = self.api.clone();
        self.spawn(async move {
            Completion::ThreadIncrement {
                counterpart,
                generation,
                result: api.thread_since(counterpart, since_ms).await,
            }
        });
    }

    fn on_list_tick(&mut self) {
        let fetch = if self.aggregator.cursor().page == 0 {
            ListFetch::Initial
        } else {
            ListFetch::Poll
        };
        self.fetch_list(0, fetch);
    }

    fn load_thread(&mut self, counterpart: UserId) {
        if !self.scheduler.begin_thread_fetch(counterpart) {
            return;
        }
        let generation = self.thread_generation;
        let api = self.api.clone();
        self.spawn(async move {
            Completion::ThreadLoaded {
                counterpart,
                generation,
                result: api.thread(counterpart).await,
            }
        });
    }

    fn fetch_list(&mut self, page: u32, fetch: ListFetch) {
        if self.current_user.is_none() {
            debug!("List fetch deferred until the current user is known");
            self.request_current_user();
            return;
        }
        if !self.scheduler.begin_list_fetch() {
            debug!("List fetch skipped: previous request still pending");
            return;
        }

        let size = self.config.page_size;
        let api = self.api.clone();
        self.spawn(async move {
            Completion::ListPage {
                page,
                fetch,
                result: api.conversations(page, size).await,
            }
        });
    }

    fn request_current_user(&mut self) {
        if self.user_request_in_flight || self.current_user.is_some() {
            return;
        }
        self.user_request_in_flight = true;
        let api = self.api.clone();
        self.spawn(async move { Completion::CurrentUser(api.current_user().await) });
    }

    fn poll_unread(&mut self) {
        let api = self.api.clone();
        self.spawn(async move { Completion::UnreadCount(api.unread_count().await) });
    }

    fn request_profiles(&mut self) {
        for counterpart in self.aggregator.take_profile_requests() {
            let api = self.api.clone();
            self.spawn(async move {
                Completion::Profile {
                    counterpart,
                    result: api.user_profile(counterpart).await,
                }
            });
        }
    }

    fn spawn<F>(&self, work: F)
    where
        F: Future<Output = Completion> + Send + 'static,
    {
        let tx = self.completions_tx.clone();
        tokio::spawn(async move {
            let done = work.await;
            // The loop is gone after dispose; late results are dropped
            let _ = tx.send(done);
        });
    }

    // ─── Completions ─────────────────────────────────────────────────────────

    fn apply(&mut self, done: Completion) {
        match done {
            Completion::CurrentUser(result) => {
                self.user_request_in_flight = false;
                match result {
                    Ok(UserProfile { id: Some(id), .. }) => {
                        info!("Signed in as user {}", id);
                        self.current_user = Some(id);
                        if self.scheduler.is_running(TimerKind::List) {
                            self.fetch_now(TimerKind::List);
                        }
                    }
                    Ok(_) => warn!("Current user response carried no id"),
                    Err(e) => self.report(e, false, "load current user"),
                }
            }
            Completion::ThreadLoaded {
                counterpart,
                generation,
                result,
            } => {
                if generation != self.thread_generation {
                    debug!("Discarding thread load for {} from a closed view", counterpart);
                    return;
                }
                self.scheduler.end_thread_fetch(counterpart);
                match result {
                    Ok(raw) => {
                        if self.store.load_all(counterpart, raw) {
                            self.emit(SyncEvent::ThreadLoaded {
                                counterpart,
                                messages: self.store.messages().to_vec(),
                            });
                        }
                    }
                    Err(e) => {
                        if self.store.is_current(counterpart) {
                            self.report(e, true, "load conversation");
                        }
                    }
                }
            }
            Completion::ThreadIncrement {
                counterpart,
                generation,
                result,
            } => {
                if generation != self.thread_generation {
                    debug!("Discarding thread poll for {} from a closed view", counterpart);
                    return;
                }
                self.scheduler.end_thread_fetch(counterpart);
                match result {
                    Ok(raw) => self.append_to_thread(counterpart, raw),
                    Err(e) => self.report(e, false, "poll conversation"),
                }
            }
            Completion::ListPage {
                page,
                fetch,
                result,
            } => {
                self.scheduler.end_list_fetch();
                match result {
                    Ok(body) => self.apply_list_page(page, fetch, body),
                    Err(e) => self.report(e, fetch == ListFetch::Next, "load conversations"),
                }
            }
            Completion::Profile {
                counterpart,
                result,
            } => {
                let placeholder = self.config.display_name_placeholder.clone();
                let info = match result {
                    Ok(profile) => DisplayInfo {
                        name: profile
                            .nickname
                            .filter(|n| !n.trim().is_empty())
                            .unwrap_or(placeholder),
                        avatar_url: profile.avatar_url.unwrap_or_default(),
                    },
                    Err(e) => {
                        debug!("Profile lookup for {} failed: {}", counterpart, e);
                        if e.is_auth() {
                            self.report(e, false, "load profile");
                        }
                        DisplayInfo {
                            name: placeholder,
                            avatar_url: String::new(),
                        }
                    }
                };
                if self.aggregator.apply_profile(counterpart, info) {
                    self.publish_conversations();
                }
            }
            Completion::MarkedRead {
                counterpart,
                result,
            } => match result {
                Ok(()) => {
                    debug!("Conversation with {} marked read", counterpart);
                    self.poll_unread();
                }
                Err(e) => {
                    // Local zero stays; server and client stay diverged until
                    // the next full resync
                    warn!("Mark read for {} failed, keeping local state: {}", counterpart, e);
                    self.report(e, true, "mark conversation read");
                }
            },
            Completion::Sent {
                counterpart,
                result,
                reply,
            } => self.apply_sent(counterpart, result, reply),
            Completion::UnreadCount(result) => match result {
                Ok(total) => {
                    if self.unread.publish(total) {
                        self.emit(SyncEvent::UnreadChanged { total });
                    }
                }
                Err(e) => self.report(e, false, "poll unread count"),
            },
        }
        self.sync_timers();
    }

    fn append_to_thread(&mut self, counterpart: UserId, raw: Vec<RawMessage>) {
        if let Some(added) = self.store.append_since(counterpart, raw) {
            if !added.is_empty() {
                debug!("{} new message(s) from thread {}", added.len(), counterpart);
                self.emit(SyncEvent::NewMessages {
                    counterpart,
                    messages: added,
                });
            }
        }
    }

    fn apply_list_page(&mut self, page: u32, fetch: ListFetch, body: ConversationPage) {
        let Some(me) = self.current_user else {
            return;
        };
        let has_next = body.has_next;

        let outcome = self.aggregator.merge_page(body.content, me);
        if outcome.skipped > 0 {
            warn!("Conversation page {}: {} record(s) skipped", page, outcome.skipped);
        }
        if fetch != ListFetch::Poll {
            self.aggregator.cursor_mut().advance(page, has_next);
        }
        if outcome.changed || fetch != ListFetch::Poll {
            self.publish_conversations();
        }
        if !outcome.new_counterparts.is_empty() {
            self.request_profiles();
        }
    }

    fn apply_sent(
        &mut self,
        counterpart: UserId,
        result: Result<RawMessage>,
        reply: oneshot::Sender<Result<Message>>,
    ) {
        let raw = match result {
            Ok(raw) => raw,
            Err(e) => {
                self.report_user_error(&e, "send message");
                let _ = reply.send(Err(e));
                return;
            }
        };

        let message = match raw.clone().normalize() {
            Ok(message) => message,
            Err(e) => {
                let _ = reply.send(Err(SyncError::Api {
                    code: 0,
                    message: e.to_string(),
                }));
                return;
            }
        };

        self.append_to_thread(counterpart, vec![raw.clone()]);
        if let Some(me) = self.current_user {
            let outcome = self.aggregator.merge_page(vec![raw], me);
            if outcome.changed {
                self.publish_conversations();
            }
            // First message to someone new: their name comes from a lookup
            if !outcome.new_counterparts.is_empty() {
                self.request_profiles();
            }
        }
        let _ = reply.send(Ok(message));

        // Pick up anything that arrived while we were sending
        if self.scheduler.open_thread() == Some(counterpart) {
            self.on_thread_tick();
        }
    }

    // ─── Publishing ──────────────────────────────────────────────────────────

    fn publish_conversations(&mut self) {
        self.emit(SyncEvent::ConversationsUpdated {
            conversations: self.aggregator.sort_for_display(),
        });
        let total = recompute_global_total(&self.aggregator);
        if self.unread.publish(total) {
            self.emit(SyncEvent::UnreadChanged { total });
        }
    }

    fn emit(&self, event: SyncEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn emit_notice(&self, class: ErrorClass, message: String) {
        self.emit(SyncEvent::Notice { class, message });
    }

    /// Route a failure by the taxonomy: polling failures stay quiet,
    /// user actions get a notice, expired sessions are surfaced once.
    fn report(&mut self, error: SyncError, user_initiated: bool, action: &str) {
        match error.classify(user_initiated) {
            ErrorClass::Authorization => self.expire_session(&error),
            ErrorClass::UserAction => self.report_user_error(&error, action),
            ErrorClass::Transient => debug!("{} failed, retrying next tick: {}", action, error),
            ErrorClass::Data => warn!("{} returned malformed data: {}", action, error),
        }
    }

    fn report_user_error(&mut self, error: &SyncError, action: &str) {
        if error.is_auth() {
            self.expire_session(error);
            return;
        }
        warn!("{} failed: {}", action, error);
        self.emit_notice(ErrorClass::UserAction, format!("Could not {}: {}", action, error));
    }

    fn expire_session(&mut self, error: &SyncError) {
        if self.session_expired {
            return;
        }
        self.session_expired = true;
        warn!("Session expired: {}", error);
        // No point polling with a dead token; AppShow resumes
        self.scheduler.hide();
        self.unread_ticker = None;
        self.emit(SyncEvent::SessionExpired {
            message: error.to_string(),
        });
    }

    fn snapshot(&self) -> SyncSnapshot {
        SyncSnapshot {
            view: self.scheduler.view(),
            current_user: self.current_user,
            conversations: self.aggregator.sort_for_display(),
            thread: self.store.messages().to_vec(),
            unread_total: recompute_global_total(&self.aggregator),
            cursor: self.aggregator.cursor(),
            thread_timer_running: self.scheduler.is_running(TimerKind::Thread),
            list_timer_running: self.scheduler.is_running(TimerKind::List),
        }
    }
}

/// Create or drop an interval so it exists exactly while `running`
fn align(ticker: &mut Option<Interval>, running: bool, period: Duration) {
    match (running, ticker.is_some()) {
        (true, false) => {
            let mut interval = interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            *ticker = Some(interval);
        }
        (false, true) => *ticker = None,
        _ => {}
    }
}

/// Resolves on the next tick, or never when the timer is stopped
async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
