//! The long-poll sync loop: gap detection and task admission.

use std::{
    collections::{HashSet, VecDeque},
    sync::Arc,
    time::Duration,
};

use tracing::{debug, info, warn};

use proxy_core::{EngineError, FetchTask, FetchTaskStore, GapThrottle};

use crate::{
    engine::{EngineShared, EngineState},
    homeserver::{HomeserverSession, SyncUpdate},
};

/// Poll until shutdown or a terminal error.
pub(crate) async fn run<S, T>(shared: Arc<EngineShared<S, T>>, poll_timeout: Duration)
where
    S: HomeserverSession + 'static,
    T: FetchTaskStore + 'static,
{
    let cancel = shared.cancel.clone();
    let mut since: Option<String> = None;
    let mut attempt: u32 = 0;
    let mut throttle = GapThrottle::new(shared.config.history_fetch_delay);
    let mut deferred: VecDeque<FetchTask> = VecDeque::new();

    loop {
        let result = tokio::select! {
            _ = cancel.cancelled() => break,
            result = shared.session.sync(since.clone(), poll_timeout) => result,
        };

        match result {
            Ok(update) => {
                attempt = 0;

                let flushed = tokio::select! {
                    _ = cancel.cancelled() => break,
                    flushed = shared.session.flush_key_requests() => flushed,
                };
                if let Err(err) = flushed {
                    warn!(error = %err, "failed to flush pending key requests");
                }

                merge_gap_candidates(&mut deferred, &update);
                if let Err(err) = admit_gap_tasks(&shared, &mut deferred, &mut throttle) {
                    shared.fail(err);
                    break;
                }

                since = Some(update.next_batch);
                shared.synced.emit();
            }
            Err(err) if err.is_recoverable() => {
                let hint = err.retry_after_ms.map(Duration::from_millis);
                let delay = shared.config.backoff.delay(attempt, hint);
                attempt = attempt.saturating_add(1);
                warn!(
                    error = %err,
                    delay_ms = delay.as_millis() as u64,
                    "sync failed, backing off"
                );
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Err(err) => {
                // Expired token or another unrecoverable condition; the
                // session owner has to re-authenticate before syncing again.
                shared.fail(err);
                break;
            }
        }
    }

    shared.set_state(EngineState::Stopped);
    debug!("sync loop exited");
}

/// Fold the limited rooms of one sync response into the deferred gap list,
/// one slot per room, newest cursor winning.
fn merge_gap_candidates(deferred: &mut VecDeque<FetchTask>, update: &SyncUpdate) {
    for room in &update.rooms {
        if !room.limited {
            continue;
        }
        let Some(prev_batch) = &room.prev_batch else {
            continue;
        };

        if let Some(existing) = deferred.iter_mut().find(|t| t.room_id == room.room_id) {
            existing.token = prev_batch.clone();
        } else {
            deferred.push_back(FetchTask::new(room.room_id.clone(), prev_batch.clone()));
        }
    }
}

/// Persist and enqueue deferred gap tasks, at most one per throttle
/// interval, skipping rooms that already have a pending task.
fn admit_gap_tasks<S, T>(
    shared: &EngineShared<S, T>,
    deferred: &mut VecDeque<FetchTask>,
    throttle: &mut GapThrottle,
) -> Result<(), EngineError>
where
    S: HomeserverSession + 'static,
    T: FetchTaskStore + 'static,
{
    if deferred.is_empty() {
        return Ok(());
    }

    let pending: HashSet<String> = shared
        .load_tasks()?
        .into_iter()
        .map(|task| task.room_id)
        .collect();
    deferred.retain(|task| !pending.contains(&task.room_id));

    while !deferred.is_empty() && throttle.admit() {
        let Some(task) = deferred.pop_front() else {
            break;
        };
        info!(
            room_id = %task.room_id,
            token = %task.token,
            "queueing history fetch for limited room"
        );
        shared.save_task(&task)?;
        shared.queue.push(task)?;
    }

    Ok(())
}
