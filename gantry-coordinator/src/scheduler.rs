//! Recurring mission scheduler
//!
//! Ticks once per tick interval (a minute in production) while at least one
//! mission carries a schedule, and not at all otherwise. Matching runs
//! against an internal virtual clock that advances exactly one tick per
//! wake-up; before every match the virtual clock is compared with the wall
//! clock and corrected, so a small clock adjustment neither double-fires a
//! minute nor silently skips one.

use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use chrono::{Local, NaiveDateTime};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::state::AppState;

/// Owns the tick task handle. Start and stop go through [`refresh`], which
/// compares the desired state (any scheduled missions?) with the running
/// state.
pub struct Scheduler {
    tick: Duration,
    task: StdMutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(tick: Duration) -> Self {
        Self {
            tick,
            task: StdMutex::new(None),
        }
    }

    pub fn is_ticking(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }
}

/// Reconcile the tick task with the mission registry: start it when a
/// scheduled mission exists and none is running, stop it when the last
/// schedule disappeared. Called after any mutation that can change schedule
/// presence.
pub async fn refresh(state: &Arc<AppState>) {
    let needed = state.missions.lock().await.has_scheduled_missions();

    let mut task = state
        .scheduler
        .task
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    let running = task.as_ref().is_some_and(|t| !t.is_finished());

    if needed && !running {
        info!("scheduler starting");
        *task = Some(tokio::spawn(run(state.clone())));
    } else if !needed && running {
        if let Some(handle) = task.take() {
            handle.abort();
        }
        info!("scheduler stopped, no scheduled missions");
    }
}

async fn run(state: Arc<AppState>) {
    let tick = state.scheduler.tick;
    let tick_span =
        chrono::Duration::from_std(tick).unwrap_or_else(|_| chrono::Duration::seconds(60));

    let mut interval = tokio::time::interval(tick);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately; consume it so the virtual clock
    // starts at "now" and the first match happens one full tick later.
    interval.tick().await;
    let mut virtual_now = Local::now().naive_local();
    info!(tick = ?tick, "scheduler ticking");

    loop {
        interval.tick().await;

        let mut missions = state.missions.lock().await;
        if !missions.has_scheduled_missions() {
            info!("scheduler idle, last schedule removed");
            // The slot must clear under the mission lock: a refresh between
            // this check and a later clear would see a live task here and
            // decline to replace it for a schedule added in that window.
            *state
                .scheduler
                .task
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = None;
            break;
        }

        virtual_now = virtual_now + tick_span;
        let wall = Local::now().naive_local();
        match assess_drift(virtual_now, wall, tick_span) {
            Correction::InSync => {
                missions.fire_due(virtual_now).await;
            }
            Correction::SnapToWall => {
                warn!(
                    virtual = %virtual_now,
                    %wall,
                    "virtual clock drifted, snapping to wall clock"
                );
                virtual_now = wall;
                missions.fire_due(virtual_now).await;
            }
            Correction::RollBackAndSkip => {
                debug!(
                    virtual = %virtual_now,
                    %wall,
                    "virtual clock ahead of wall clock, waiting for it to catch up"
                );
                virtual_now = virtual_now - tick_span;
            }
            Correction::MatchStaleThenAdvance => {
                debug!(
                    virtual = %virtual_now,
                    %wall,
                    "virtual clock behind wall clock, matching twice to catch up"
                );
                missions.fire_due(virtual_now).await;
                virtual_now = virtual_now + tick_span;
                missions.fire_due(virtual_now).await;
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Correction {
    /// Within one tick of the wall clock: match as-is.
    InSync,
    /// Too far gone in either direction: adopt the wall clock.
    SnapToWall,
    /// Wall clock slightly behind: undo this tick's advance and sit out one
    /// round.
    RollBackAndSkip,
    /// Wall clock slightly ahead: match the stale minute so it is not
    /// skipped, then advance one extra tick.
    MatchStaleThenAdvance,
}

/// Decide how to correct the virtual clock against the wall clock.
///
/// `virtual_now` has already been advanced for this tick. Gaps of at most
/// one tick need no correction. A wall clock behind by more than a tick is
/// an NTP blip up to 5 minutes (wait it out) and an operator clock change
/// beyond that (snap). A wall clock ahead by more than a tick is caught up
/// minute by minute below 2 minutes and snapped past that, accepting that
/// schedules inside the larger gap are skipped.
fn assess_drift(
    virtual_now: NaiveDateTime,
    wall: NaiveDateTime,
    tick: chrono::Duration,
) -> Correction {
    let delta = wall - virtual_now;
    if delta < -tick {
        if -delta > chrono::Duration::minutes(5) {
            Correction::SnapToWall
        } else {
            Correction::RollBackAndSkip
        }
    } else if delta > tick {
        if delta < chrono::Duration::minutes(2) {
            Correction::MatchStaleThenAdvance
        } else {
            Correction::SnapToWall
        }
    } else {
        Correction::InSync
    }
}
