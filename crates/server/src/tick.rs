//! Tick engine
//!
//! One loop per sync group. Each iteration captures a snapshot tick in the
//! store, diffs it against the previous one and hands the change set to
//! fan-out. Pacing aims each tick exactly one interval after the previous
//! start; an overrun makes the next tick start immediately rather than
//! bursting to catch up.
//!
//! Store errors abandon the tick and the loop carries on. A broken
//! invariant (tick numbers going backwards) restarts just this group's
//! loop after a one-interval pause; other groups never notice.

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use worldsync_core::ChangeSet;
use worldsync_store::{CaptureOutcome, StoreError};

use crate::fanout;
use crate::metrics;
use crate::state::AppState;

/// Spawn one tick loop per currently-configured sync group.
pub fn spawn_tick_loops(state: &AppState, shutdown: &CancellationToken) -> Vec<JoinHandle<()>> {
    let groups = state.sync_groups.read().clone();

    groups
        .into_iter()
        .map(|group| {
            let state = state.clone();
            let shutdown = shutdown.clone();
            let name = group.sync_group.clone();
            tokio::spawn(async move {
                tracing::info!(
                    sync_group = %name,
                    tick_rate_ms = group.tick_rate_ms,
                    "Tick loop started"
                );
                run_group(state, name, shutdown).await;
            })
        })
        .collect()
}

enum LoopExit {
    Shutdown,
    GroupRemoved,
    InvariantViolation,
}

async fn run_group(state: AppState, name: String, shutdown: CancellationToken) {
    loop {
        match group_loop(&state, &name, &shutdown).await {
            LoopExit::Shutdown => {
                tracing::info!(sync_group = %name, "Tick loop stopped");
                return;
            }
            LoopExit::GroupRemoved => {
                tracing::info!(sync_group = %name, "Sync group removed from config; tick loop stopped");
                return;
            }
            LoopExit::InvariantViolation => {
                let pause = state
                    .sync_group(&name)
                    .map(|group| group.tick_interval())
                    .unwrap_or_default();
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(pause) => {}
                }
                // restart the loop fresh
            }
        }
    }
}

async fn group_loop(state: &AppState, name: &str, shutdown: &CancellationToken) -> LoopExit {
    let mut next_start = Instant::now();
    let mut last_number: Option<i64> = None;

    loop {
        if shutdown.is_cancelled() {
            return LoopExit::Shutdown;
        }

        if next_start > Instant::now() {
            tokio::select! {
                _ = shutdown.cancelled() => return LoopExit::Shutdown,
                _ = tokio::time::sleep_until(next_start) => {}
            }
        }

        // Re-read the config each iteration so an admin reload takes effect
        // without touching the loop.
        let Some(config) = state.sync_group(name) else {
            return LoopExit::GroupRemoved;
        };

        let started = Instant::now();
        next_start = started + config.tick_interval();

        match state.store.capture_tick(&config).await {
            Ok(CaptureOutcome::Captured(tick)) => {
                metrics::record_tick(name, tick.duration_ms, tick.delayed);

                if violates_monotonicity(last_number, tick.number) {
                    let correlation_id = Uuid::new_v4();
                    tracing::error!(
                        sync_group = %name,
                        %correlation_id,
                        last_number = last_number.unwrap_or_default(),
                        tick_number = tick.number,
                        "Tick numbering went backwards; restarting group loop"
                    );
                    return LoopExit::InvariantViolation;
                }
                last_number = Some(tick.number);

                if tick.delayed {
                    tracing::warn!(
                        sync_group = %name,
                        tick_number = tick.number,
                        duration_ms = tick.duration_ms,
                        headroom_ms = tick.headroom_ms,
                        "Tick capture overran its interval"
                    );
                }

                state.last_ticks.insert(name.to_string(), tick.clone());

                match collect_changes(state, name).await {
                    Ok(changes) => {
                        fanout::broadcast(state, name, &tick, &changes).await;
                    }
                    Err(error) => {
                        // The tick stands; the skipped deltas are recovered
                        // by the next snapshot diff.
                        tracing::warn!(sync_group = %name, %error, "Diff failed; deltas skipped this tick");
                    }
                }
            }
            Ok(CaptureOutcome::Contended) => {
                tracing::debug!(sync_group = %name, "Capture lock contended; skipping tick");
            }
            Err(error) => {
                tracing::warn!(sync_group = %name, %error, "Tick capture failed; tick abandoned");
            }
        }
    }
}

async fn collect_changes(state: &AppState, sync_group: &str) -> Result<ChangeSet, StoreError> {
    Ok(ChangeSet {
        entities: state.store.diff_entities(sync_group).await?,
        scripts: state.store.diff_scripts(sync_group).await?,
        assets: state.store.diff_assets(sync_group).await?,
    })
}

/// Per-group tick numbers must strictly increase.
pub(crate) fn violates_monotonicity(last: Option<i64>, next: i64) -> bool {
    matches!(last, Some(last) if next <= last)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monotonicity_guard() {
        assert!(!violates_monotonicity(None, 1));
        assert!(!violates_monotonicity(Some(1), 2));
        assert!(violates_monotonicity(Some(2), 2));
        assert!(violates_monotonicity(Some(5), 3));
    }
}
