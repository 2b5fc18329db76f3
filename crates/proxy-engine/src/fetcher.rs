//! The history fetcher: single consumer of the backfill work queue.

use std::{sync::Arc, time::Duration};

use tracing::{debug, warn};

use proxy_core::{FetchTask, FetchTaskReceiver, FetchTaskStore};

use crate::{engine::EngineShared, homeserver::HomeserverSession};

enum TaskOutcome {
    Done,
    Cancelled,
    Fatal(proxy_core::EngineError),
}

/// Drain the queue until shutdown, one bounded history request per task.
pub(crate) async fn run<S, T>(shared: Arc<EngineShared<S, T>>, mut receiver: FetchTaskReceiver)
where
    S: HomeserverSession + 'static,
    T: FetchTaskStore + 'static,
{
    let cancel = shared.cancel.clone();

    loop {
        let task = tokio::select! {
            _ = cancel.cancelled() => break,
            task = receiver.recv() => match task {
                Some(task) => task,
                None => break,
            },
        };

        match process_task(&shared, &task).await {
            TaskOutcome::Done => shared.fetch_loop.emit(),
            TaskOutcome::Cancelled => break,
            TaskOutcome::Fatal(err) => {
                shared.fail(err);
                break;
            }
        }
    }

    debug!("history fetcher exited");
}

/// One fetch-loop iteration: fetch the page `task.token` points at, hand it
/// to the session, then either chain a continuation or retire the task.
///
/// The persisted task keeps its pre-fetch token until a page has been fully
/// applied, so an interruption anywhere in here resumes cleanly.
async fn process_task<S, T>(shared: &EngineShared<S, T>, task: &FetchTask) -> TaskOutcome
where
    S: HomeserverSession + 'static,
    T: FetchTaskStore + 'static,
{
    let mut attempt: u32 = 0;

    loop {
        let result = tokio::select! {
            _ = shared.cancel.cancelled() => return TaskOutcome::Cancelled,
            result = shared.session.room_history(
                &task.room_id,
                &task.token,
                shared.config.page_size(),
            ) => result,
        };

        let page = match result {
            Ok(page) => page,
            Err(err) if err.is_recoverable() => {
                let hint = err.retry_after_ms.map(Duration::from_millis);
                warn!(
                    room_id = %task.room_id,
                    error = %err,
                    attempt,
                    "history fetch failed, retrying with the same token"
                );
                match next_attempt(shared, task, &mut attempt, hint).await {
                    Some(outcome) => return outcome,
                    None => continue,
                }
            }
            Err(err) => {
                // Invalid/expired token or an inaccessible room; the work is
                // unrecoverable for this room.
                warn!(
                    room_id = %task.room_id,
                    error = %err,
                    "dropping history fetch for room"
                );
                if let Err(err) = shared.delete_task(&task.room_id) {
                    return TaskOutcome::Fatal(err.into());
                }
                return TaskOutcome::Done;
            }
        };

        if page.events.is_empty() {
            debug!(room_id = %task.room_id, "room history exhausted");
            if let Err(err) = shared.delete_task(&task.room_id) {
                return TaskOutcome::Fatal(err.into());
            }
            return TaskOutcome::Done;
        }

        if let Err(err) = shared.session.apply_history_page(&task.room_id, &page).await {
            // The page is only accepted in full; refetch it rather than
            // risking partial history.
            warn!(
                room_id = %task.room_id,
                error = %err,
                attempt,
                "session rejected history page, refetching"
            );
            match next_attempt(shared, task, &mut attempt, None).await {
                Some(outcome) => return outcome,
                None => continue,
            }
        }

        match page.continuation() {
            Some(end) => {
                let next = FetchTask::new(task.room_id.clone(), end);
                if let Err(err) = shared.save_task(&next) {
                    return TaskOutcome::Fatal(err.into());
                }
                debug!(
                    room_id = %next.room_id,
                    token = %next.token,
                    "chaining history fetch continuation"
                );
                if let Err(err) = shared.queue.push(next) {
                    return TaskOutcome::Fatal(err.into());
                }
            }
            None => {
                debug!(room_id = %task.room_id, "room history reached its start");
                if let Err(err) = shared.delete_task(&task.room_id) {
                    return TaskOutcome::Fatal(err.into());
                }
            }
        }

        return TaskOutcome::Done;
    }
}

/// Count one failed attempt; sleep out the backoff, or requeue the task at
/// the back once the attempt cap is reached.
///
/// Returns `None` when the caller should retry, `Some(outcome)` when the
/// iteration is over.
async fn next_attempt<S, T>(
    shared: &EngineShared<S, T>,
    task: &FetchTask,
    attempt: &mut u32,
    hint: Option<Duration>,
) -> Option<TaskOutcome>
where
    S: HomeserverSession + 'static,
    T: FetchTaskStore + 'static,
{
    let failed = *attempt;
    *attempt += 1;

    if *attempt >= shared.config.max_fetch_attempts {
        warn!(
            room_id = %task.room_id,
            attempts = *attempt,
            "history fetch keeps failing, requeueing at the back"
        );
        return Some(match shared.queue.push(task.clone()) {
            Ok(()) => TaskOutcome::Done,
            Err(err) => TaskOutcome::Fatal(err.into()),
        });
    }

    let delay = shared.config.backoff.delay(failed, hint);
    tokio::select! {
        _ = shared.cancel.cancelled() => Some(TaskOutcome::Cancelled),
        _ = tokio::time::sleep(delay) => None,
    }
}
