use std::sync::{Arc, Mutex, PoisonError};

use std::time::Duration;

use tokio::{sync::watch, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use proxy_core::{
    EngineConfig, EngineError, FetchTask, FetchTaskQueue, FetchTaskReceiver, FetchTaskStore,
    Pulse, SessionIdentity, StoreError,
};

use crate::{fetcher, homeserver::HomeserverSession, sync_loop};

/// Lifecycle state of one engine instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Constructed but not started.
    Idle,
    /// Both loops are running.
    Syncing,
    /// The loops have exited; no further polling happens.
    Stopped,
}

/// State shared between the engine handle and its two loops.
pub(crate) struct EngineShared<S, T> {
    pub(crate) session: Arc<S>,
    pub(crate) store: Arc<T>,
    pub(crate) identity: SessionIdentity,
    pub(crate) config: EngineConfig,
    pub(crate) queue: FetchTaskQueue,
    pub(crate) synced: Pulse,
    pub(crate) fetch_loop: Pulse,
    pub(crate) cancel: CancellationToken,
    state: watch::Sender<EngineState>,
    terminal_error: Mutex<Option<EngineError>>,
}

impl<S, T> EngineShared<S, T>
where
    S: HomeserverSession + 'static,
    T: FetchTaskStore + 'static,
{
    pub(crate) fn load_tasks(&self) -> Result<Vec<FetchTask>, StoreError> {
        self.store
            .load_fetch_tasks(&self.identity.server_name, &self.identity.user_id)
    }

    pub(crate) fn save_task(&self, task: &FetchTask) -> Result<(), StoreError> {
        self.store
            .save_fetch_task(&self.identity.server_name, &self.identity.user_id, task)
    }

    pub(crate) fn delete_task(&self, room_id: &str) -> Result<(), StoreError> {
        self.store
            .delete_fetch_task(&self.identity.server_name, &self.identity.user_id, room_id)
    }

    pub(crate) fn set_state(&self, next: EngineState) {
        self.state.send_replace(next);
    }

    /// Record a terminal failure and shut both loops down.
    ///
    /// Only the first error is kept; later ones are logged and dropped.
    pub(crate) fn fail(&self, err: EngineError) {
        error!(error = %err, "engine loop hit a terminal error");
        let mut slot = self
            .terminal_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(err);
        }
        drop(slot);

        self.set_state(EngineState::Stopped);
        self.cancel.cancel();
    }
}

struct RunningLoops {
    sync: JoinHandle<()>,
    fetcher: JoinHandle<()>,
}

/// One logged-in session's sync/backfill engine.
///
/// Two loops run per started engine: the long-poll sync loop, which detects
/// rooms with a timeline gap and queues backfill work, and the history
/// fetcher, which drains that work one bounded request at a time. They
/// communicate only through the fetch-task queue and the durable task
/// store, so a restart resumes exactly where bookkeeping left off.
pub struct SyncEngine<S, T> {
    shared: Arc<EngineShared<S, T>>,
    receiver: Mutex<Option<FetchTaskReceiver>>,
    running: Mutex<Option<RunningLoops>>,
}

impl<S, T> SyncEngine<S, T>
where
    S: HomeserverSession + 'static,
    T: FetchTaskStore + 'static,
{
    /// Wrap an authenticated session and its task store.
    ///
    /// The engine does not log in; `session` must already be usable and
    /// `identity` must describe it.
    pub fn new(session: S, store: T, identity: SessionIdentity, config: EngineConfig) -> Self {
        let (queue, receiver) = FetchTaskQueue::new();

        Self {
            shared: Arc::new(EngineShared {
                session: Arc::new(session),
                store: Arc::new(store),
                identity,
                config,
                queue,
                synced: Pulse::new(),
                fetch_loop: Pulse::new(),
                cancel: CancellationToken::new(),
                state: watch::Sender::new(EngineState::Idle),
                terminal_error: Mutex::new(None),
            }),
            receiver: Mutex::new(Some(receiver)),
            running: Mutex::new(None),
        }
    }

    /// Start both loops. Callable once, from within a tokio runtime.
    ///
    /// Persists the session identity, rebuilds the work queue from the
    /// store so interrupted backfills resume with their pre-fetch tokens,
    /// then spawns the sync loop. `poll_timeout` overrides the configured
    /// long-poll timeout when given.
    pub fn start(&self, poll_timeout: Option<Duration>) -> Result<(), EngineError> {
        let poll_timeout = poll_timeout.unwrap_or(self.shared.config.sync_poll_timeout);
        let mut running = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if running.is_some() || self.state() != EngineState::Idle {
            return Err(EngineError::invalid_state(self.state(), "start"));
        }

        let receiver = self
            .receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| EngineError::invalid_state(self.state(), "start"))?;

        let shared = &self.shared;
        shared
            .store
            .save_server_user(&shared.identity.server_name, &shared.identity.user_id)?;

        let pending = shared.load_tasks()?;
        if !pending.is_empty() {
            info!(count = pending.len(), "resuming persisted fetch tasks");
        }
        for task in pending {
            shared.queue.push(task)?;
        }

        shared.set_state(EngineState::Syncing);
        let sync = tokio::spawn(sync_loop::run(Arc::clone(shared), poll_timeout));
        let fetcher = tokio::spawn(fetcher::run(Arc::clone(shared), receiver));
        *running = Some(RunningLoops { sync, fetcher });

        info!(
            server = %self.shared.identity.server_name,
            user = %self.shared.identity.user_id,
            "sync engine started"
        );
        Ok(())
    }

    /// Request shutdown and join both loops.
    ///
    /// In-flight network calls are abandoned, not awaited; a task
    /// interrupted mid-fetch stays persisted with its pre-fetch token.
    pub async fn stop(&self) -> Result<(), EngineError> {
        let running = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(running) = running else {
            return Err(EngineError::invalid_state(self.state(), "stop"));
        };

        self.shared.cancel.cancel();
        let _ = running.sync.await;
        let _ = running.fetcher.await;
        self.shared.set_state(EngineState::Stopped);

        info!(
            server = %self.shared.identity.server_name,
            user = %self.shared.identity.user_id,
            "sync engine stopped"
        );
        Ok(())
    }

    /// Wait for the next completed sync iteration.
    ///
    /// Fires once per successful long-poll round, whether or not any gap
    /// was found. Only iterations finishing after this call are observed.
    pub async fn wait_synced(&self) {
        self.shared.synced.subscribe().wait().await;
    }

    /// Wait for the next task enqueued on the backfill queue, for any
    /// reason: gap detection, continuation chaining, or a startup rebuild.
    pub async fn wait_new_fetch_task(&self) {
        self.shared.queue.subscribe_new_task().wait().await;
    }

    /// Wait for the history fetcher to finish processing one dequeued
    /// task, whatever the outcome.
    pub async fn wait_fetch_loop_iteration(&self) {
        self.shared.fetch_loop.subscribe().wait().await;
    }

    /// Pending backfill work for this session, straight from the store.
    pub fn list_pending_fetch_tasks(&self) -> Result<Vec<FetchTask>, EngineError> {
        Ok(self.shared.load_tasks()?)
    }

    pub fn state(&self) -> EngineState {
        *self.shared.state.borrow()
    }

    /// The error that stopped the engine, if it stopped on its own.
    pub fn terminal_error(&self) -> Option<EngineError> {
        self.shared
            .terminal_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn identity(&self) -> &SessionIdentity {
        &self.shared.identity
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        sync::{
            Mutex,
            atomic::{AtomicUsize, Ordering},
        },
        time::Duration,
    };

    use async_trait::async_trait;
    use tokio::time::timeout;

    use proxy_core::{ErrorCategory, MemoryTaskStore};

    use super::*;
    use crate::homeserver::{HistoryPage, RoomTimelineGap, SyncUpdate};

    const ROOM: &str = "!SVkFJHzfwvuaIEawgC:localhost";
    const ROOM2: &str = "!testroom:localhost";
    const ROOM3: &str = "!thirdroom:localhost";
    const PREV_BATCH: &str = "t392-516_47314_0_7_1_1_1_11444_1";
    const PAGE_END: &str = "t47409-4357353_219380_26003_2265";

    const WAIT: Duration = Duration::from_secs(2);

    #[derive(Default)]
    struct FakeState {
        syncs: Mutex<VecDeque<Result<SyncUpdate, EngineError>>>,
        history: Mutex<VecDeque<Result<HistoryPage, EngineError>>>,
        history_fallback: Option<HistoryPage>,
        history_calls: Mutex<Vec<(String, String, u16)>>,
        applied_pages: Mutex<Vec<(String, usize)>>,
        key_flushes: AtomicUsize,
        sync_count: AtomicUsize,
    }

    /// Scripted homeserver session: responses are played back in order,
    /// then a gap-free sync (and, when configured, a fallback history
    /// page) repeats forever. With no fallback page, history requests
    /// beyond the script block until shutdown.
    #[derive(Clone, Default)]
    struct FakeSession {
        state: Arc<FakeState>,
    }

    impl FakeSession {
        fn script_sync(&self, update: SyncUpdate) {
            self.state
                .syncs
                .lock()
                .expect("sync script lock")
                .push_back(Ok(update));
        }

        fn script_sync_error(&self, err: EngineError) {
            self.state
                .syncs
                .lock()
                .expect("sync script lock")
                .push_back(Err(err));
        }

        fn script_history(&self, page: HistoryPage) {
            self.state
                .history
                .lock()
                .expect("history script lock")
                .push_back(Ok(page));
        }

        fn script_history_error(&self, err: EngineError) {
            self.state
                .history
                .lock()
                .expect("history script lock")
                .push_back(Err(err));
        }

        fn with_history_fallback(mut self, page: HistoryPage) -> Self {
            let state = Arc::get_mut(&mut self.state).expect("fallback set before sharing");
            state.history_fallback = Some(page);
            self
        }

        fn history_calls(&self) -> Vec<(String, String, u16)> {
            self.state
                .history_calls
                .lock()
                .expect("history call lock")
                .clone()
        }

        fn applied_pages(&self) -> Vec<(String, usize)> {
            self.state
                .applied_pages
                .lock()
                .expect("applied pages lock")
                .clone()
        }
    }

    #[async_trait]
    impl HomeserverSession for FakeSession {
        async fn sync(
            &self,
            _since: Option<String>,
            _timeout: Duration,
        ) -> Result<SyncUpdate, EngineError> {
            // Model the long-poll: never resolve synchronously.
            tokio::time::sleep(Duration::from_millis(1)).await;

            let scripted = self
                .state
                .syncs
                .lock()
                .expect("sync script lock")
                .pop_front();
            match scripted {
                Some(result) => result,
                None => {
                    let round = self.state.sync_count.fetch_add(1, Ordering::SeqCst);
                    Ok(SyncUpdate {
                        next_batch: format!("s-empty-{round}"),
                        rooms: Vec::new(),
                    })
                }
            }
        }

        async fn room_history(
            &self,
            room_id: &str,
            from: &str,
            limit: u16,
        ) -> Result<HistoryPage, EngineError> {
            tokio::time::sleep(Duration::from_millis(1)).await;
            self.state
                .history_calls
                .lock()
                .expect("history call lock")
                .push((room_id.to_owned(), from.to_owned(), limit));

            let scripted = self
                .state
                .history
                .lock()
                .expect("history script lock")
                .pop_front();
            match scripted {
                Some(result) => result,
                None => match &self.state.history_fallback {
                    Some(page) => Ok(page.clone()),
                    None => std::future::pending().await,
                },
            }
        }

        async fn apply_history_page(
            &self,
            room_id: &str,
            page: &HistoryPage,
        ) -> Result<(), EngineError> {
            self.state
                .applied_pages
                .lock()
                .expect("applied pages lock")
                .push((room_id.to_owned(), page.events.len()));
            Ok(())
        }

        async fn flush_key_requests(&self) -> Result<(), EngineError> {
            self.state.key_flushes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn identity() -> SessionIdentity {
        SessionIdentity::new("example", "@example:example.org", "DEVICEID")
    }

    fn limited_sync(next_batch: &str, gaps: &[(&str, &str)]) -> SyncUpdate {
        SyncUpdate {
            next_batch: next_batch.to_owned(),
            rooms: gaps
                .iter()
                .map(|(room_id, prev_batch)| RoomTimelineGap {
                    room_id: (*room_id).to_owned(),
                    limited: true,
                    prev_batch: Some((*prev_batch).to_owned()),
                })
                .collect(),
        }
    }

    fn history_page(events: usize, start: &str, end: &str) -> HistoryPage {
        HistoryPage {
            start: start.to_owned(),
            end: Some(end.to_owned()),
            events: (0..events)
                .map(|n| serde_json::json!({"type": "m.room.message", "body": format!("m{n}")}))
                .collect(),
        }
    }

    fn empty_page() -> HistoryPage {
        history_page(0, "t-start", "t-start")
    }

    fn quick_config() -> EngineConfig {
        EngineConfig {
            history_fetch_delay: Duration::ZERO,
            backoff: proxy_core::BackoffPolicy::new(
                Duration::from_millis(1),
                Duration::from_millis(10),
            ),
            ..EngineConfig::default()
        }
    }

    fn build_engine(
        session: &FakeSession,
        store: &MemoryTaskStore,
        config: EngineConfig,
    ) -> SyncEngine<FakeSession, MemoryTaskStore> {
        SyncEngine::new(session.clone(), store.clone(), identity(), config)
    }

    fn pending_tasks(engine: &SyncEngine<FakeSession, MemoryTaskStore>) -> Vec<FetchTask> {
        engine
            .list_pending_fetch_tasks()
            .expect("task listing should work")
    }

    #[tokio::test]
    async fn start_is_rejected_while_already_syncing() {
        let session = FakeSession::default();
        let engine = build_engine(&session, &MemoryTaskStore::new(), quick_config());

        engine
            .start(Some(Duration::from_millis(100)))
            .expect("first start should work");
        let err = engine
            .start(Some(Duration::from_millis(100)))
            .expect_err("second start must fail");
        assert_eq!(err.code, "invalid_state_transition");

        engine.stop().await.expect("stop should work");
    }

    #[tokio::test]
    async fn stop_without_start_is_rejected() {
        let session = FakeSession::default();
        let engine = build_engine(&session, &MemoryTaskStore::new(), quick_config());

        let err = engine.stop().await.expect_err("stop must fail when idle");
        assert_eq!(err.code, "invalid_state_transition");
    }

    #[tokio::test]
    async fn limited_sync_persists_one_task_with_the_gap_token() {
        let session = FakeSession::default();
        session.script_sync(limited_sync("s1", &[(ROOM, PREV_BATCH)]));
        let store = MemoryTaskStore::new();
        // A huge delay freezes further automatic admissions; no history
        // fallback keeps the in-flight fetch suspended.
        let config = EngineConfig {
            history_fetch_delay: Duration::from_secs(10),
            ..EngineConfig::default()
        };
        let engine = build_engine(&session, &store, config);

        engine
            .start(Some(Duration::from_millis(100)))
            .expect("start should work");

        timeout(WAIT, engine.wait_new_fetch_task())
            .await
            .expect("gap task should be enqueued");
        assert_eq!(pending_tasks(&engine), vec![FetchTask::new(ROOM, PREV_BATCH)]);

        // Further sync rounds must not create more tasks for the same gap.
        timeout(WAIT, engine.wait_synced())
            .await
            .expect("second sync round");
        timeout(WAIT, engine.wait_synced())
            .await
            .expect("third sync round");
        assert_eq!(pending_tasks(&engine).len(), 1);

        engine.stop().await.expect("stop should work");
    }

    #[tokio::test]
    async fn continuation_replaces_the_persisted_task_token() {
        let session = FakeSession::default().with_history_fallback(empty_page());
        session.script_sync(limited_sync("s1", &[(ROOM, PREV_BATCH)]));
        session.script_history(history_page(3, PREV_BATCH, PAGE_END));
        let store = MemoryTaskStore::new();
        let engine = build_engine(&session, &store, quick_config());

        engine
            .start(Some(Duration::from_millis(100)))
            .expect("start should work");

        // First enqueue carries the sync response's prev_batch cursor.
        timeout(WAIT, engine.wait_new_fetch_task())
            .await
            .expect("gap task should be enqueued");
        assert_eq!(pending_tasks(&engine), vec![FetchTask::new(ROOM, PREV_BATCH)]);

        // The non-empty page replaces it with the page's end cursor.
        timeout(WAIT, engine.wait_new_fetch_task())
            .await
            .expect("continuation task should be enqueued");
        assert_eq!(pending_tasks(&engine), vec![FetchTask::new(ROOM, PAGE_END)]);

        // The empty page retires the room's backfill entirely.
        timeout(WAIT, engine.wait_fetch_loop_iteration())
            .await
            .expect("fetch iteration should complete");
        assert!(pending_tasks(&engine).is_empty());
        assert_eq!(session.applied_pages(), vec![(ROOM.to_owned(), 3)]);

        engine.stop().await.expect("stop should work");
    }

    #[tokio::test]
    async fn gap_free_syncs_complete_without_enqueueing_tasks() {
        let session = FakeSession::default();
        let engine = build_engine(&session, &MemoryTaskStore::new(), quick_config());

        engine
            .start(Some(Duration::from_millis(100)))
            .expect("start should work");

        for _ in 0..3 {
            timeout(WAIT, engine.wait_synced())
                .await
                .expect("sync round should complete");
        }

        assert!(pending_tasks(&engine).is_empty());
        assert!(session.history_calls().is_empty());
        let no_task = timeout(Duration::from_millis(50), engine.wait_new_fetch_task()).await;
        assert!(no_task.is_err(), "no fetch task should ever be enqueued");

        engine.stop().await.expect("stop should work");
    }

    #[tokio::test]
    async fn full_backfill_issues_one_request_per_page_then_terminates() {
        let session = FakeSession::default().with_history_fallback(empty_page());
        session.script_sync(limited_sync("s1", &[(ROOM, PREV_BATCH)]));
        session.script_history(history_page(2, PREV_BATCH, "t-page-2"));
        session.script_history(history_page(2, "t-page-2", "t-page-3"));
        session.script_history(history_page(0, "t-page-3", "t-page-3"));
        let engine = build_engine(&session, &MemoryTaskStore::new(), quick_config());

        engine
            .start(Some(Duration::from_millis(100)))
            .expect("start should work");

        for _ in 0..3 {
            timeout(WAIT, engine.wait_fetch_loop_iteration())
                .await
                .expect("fetch iteration should complete");
            assert!(pending_tasks(&engine).len() <= 1);
        }

        assert!(pending_tasks(&engine).is_empty());
        let calls = session.history_calls();
        let page_size = EngineConfig::default().page_size();
        assert_eq!(
            calls,
            vec![
                (ROOM.to_owned(), PREV_BATCH.to_owned(), page_size),
                (ROOM.to_owned(), "t-page-2".to_owned(), page_size),
                (ROOM.to_owned(), "t-page-3".to_owned(), page_size),
            ]
        );

        engine.stop().await.expect("stop should work");
    }

    #[tokio::test]
    async fn persisted_task_resumes_from_its_stored_token() {
        let session = FakeSession::default().with_history_fallback(empty_page());
        let store = MemoryTaskStore::new();
        store
            .save_server_user("example", "@example:example.org")
            .expect("account registration should work");
        store
            .save_fetch_task(
                "example",
                "@example:example.org",
                &FetchTask::new(ROOM, PAGE_END),
            )
            .expect("seeding should work");
        let engine = build_engine(&session, &store, quick_config());

        engine
            .start(Some(Duration::from_millis(100)))
            .expect("start should work");
        timeout(WAIT, engine.wait_fetch_loop_iteration())
            .await
            .expect("resumed task should be fetched");

        let calls = session.history_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, ROOM);
        assert_eq!(calls[0].1, PAGE_END);
        assert!(pending_tasks(&engine).is_empty());

        engine.stop().await.expect("stop should work");
    }

    #[tokio::test]
    async fn burst_of_gapped_rooms_is_throttled_to_one_task() {
        let session = FakeSession::default();
        session.script_sync(limited_sync(
            "s1",
            &[(ROOM, "t-a"), (ROOM2, "t-b"), (ROOM3, "t-c")],
        ));
        let config = EngineConfig {
            history_fetch_delay: Duration::from_secs(10),
            ..EngineConfig::default()
        };
        let engine = build_engine(&session, &MemoryTaskStore::new(), config);

        engine
            .start(Some(Duration::from_millis(100)))
            .expect("start should work");

        timeout(WAIT, engine.wait_synced())
            .await
            .expect("first sync round");
        assert_eq!(pending_tasks(&engine), vec![FetchTask::new(ROOM, "t-a")]);

        timeout(WAIT, engine.wait_synced())
            .await
            .expect("second sync round");
        assert_eq!(pending_tasks(&engine).len(), 1);

        engine.stop().await.expect("stop should work");
    }

    #[tokio::test]
    async fn zero_delay_admits_every_gap_immediately() {
        let session = FakeSession::default();
        session.script_sync(limited_sync(
            "s1",
            &[(ROOM, "t-a"), (ROOM2, "t-b"), (ROOM3, "t-c")],
        ));
        let engine = build_engine(&session, &MemoryTaskStore::new(), quick_config());

        engine
            .start(Some(Duration::from_millis(100)))
            .expect("start should work");
        timeout(WAIT, engine.wait_synced())
            .await
            .expect("first sync round");

        assert_eq!(
            pending_tasks(&engine),
            vec![
                FetchTask::new(ROOM, "t-a"),
                FetchTask::new(ROOM2, "t-b"),
                FetchTask::new(ROOM3, "t-c"),
            ]
        );

        engine.stop().await.expect("stop should work");
    }

    #[tokio::test]
    async fn transient_history_failure_retries_the_same_token() {
        let session = FakeSession::default().with_history_fallback(empty_page());
        session.script_sync(limited_sync("s1", &[(ROOM, PREV_BATCH)]));
        session.script_history_error(EngineError::new(
            ErrorCategory::Network,
            "connection_reset",
            "connection reset by peer",
        ));
        session.script_history(empty_page());
        let engine = build_engine(&session, &MemoryTaskStore::new(), quick_config());

        engine
            .start(Some(Duration::from_millis(100)))
            .expect("start should work");
        timeout(WAIT, engine.wait_fetch_loop_iteration())
            .await
            .expect("fetch iteration should complete");

        let calls = session.history_calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].1, PREV_BATCH);
        assert_eq!(calls[1].1, PREV_BATCH);
        assert!(pending_tasks(&engine).is_empty());

        engine.stop().await.expect("stop should work");
    }

    #[tokio::test]
    async fn invalid_token_drops_the_task_without_stopping_the_engine() {
        let session = FakeSession::default().with_history_fallback(empty_page());
        session.script_sync(limited_sync("s1", &[(ROOM, PREV_BATCH)]));
        session.script_history_error(EngineError::new(
            ErrorCategory::Config,
            "unknown_token",
            "invalid pagination token",
        ));
        let engine = build_engine(&session, &MemoryTaskStore::new(), quick_config());

        engine
            .start(Some(Duration::from_millis(100)))
            .expect("start should work");
        timeout(WAIT, engine.wait_fetch_loop_iteration())
            .await
            .expect("fetch iteration should complete");

        assert!(pending_tasks(&engine).is_empty());
        assert_eq!(session.history_calls().len(), 1);
        assert_eq!(engine.state(), EngineState::Syncing);
        timeout(WAIT, engine.wait_synced())
            .await
            .expect("sync loop should still be polling");

        engine.stop().await.expect("stop should work");
    }

    #[tokio::test]
    async fn auth_failure_stops_the_engine_with_a_terminal_error() {
        let session = FakeSession::default();
        session.script_sync_error(EngineError::new(
            ErrorCategory::Auth,
            "unknown_access_token",
            "access token expired",
        ));
        let engine = build_engine(&session, &MemoryTaskStore::new(), quick_config());

        engine
            .start(Some(Duration::from_millis(100)))
            .expect("start should work");

        let deadline = tokio::time::Instant::now() + WAIT;
        while engine.state() != EngineState::Stopped {
            assert!(
                tokio::time::Instant::now() < deadline,
                "engine should stop on auth failure"
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let err = engine
            .terminal_error()
            .expect("terminal error should be recorded");
        assert_eq!(err.category, ErrorCategory::Auth);
        assert_eq!(err.code, "unknown_access_token");

        engine.stop().await.expect("join after failure should work");
    }

    #[tokio::test]
    async fn stop_preserves_the_in_flight_task_for_resumption() {
        let session = FakeSession::default();
        session.script_sync(limited_sync("s1", &[(ROOM, PREV_BATCH)]));
        let engine = build_engine(&session, &MemoryTaskStore::new(), quick_config());

        engine
            .start(Some(Duration::from_millis(100)))
            .expect("start should work");
        timeout(WAIT, engine.wait_new_fetch_task())
            .await
            .expect("gap task should be enqueued");

        // The fetch for the task is suspended on the (never-resolving)
        // history call; shutdown must abandon it and keep the bookkeeping.
        timeout(WAIT, engine.stop())
            .await
            .expect("stop should not hang on the in-flight fetch")
            .expect("stop should work");

        assert_eq!(engine.state(), EngineState::Stopped);
        assert_eq!(pending_tasks(&engine), vec![FetchTask::new(ROOM, PREV_BATCH)]);
    }
}
