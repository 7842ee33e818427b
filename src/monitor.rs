//! Background health monitor.
//!
//! Callbacks are the happy path; the monitor is the net underneath. Each
//! tick cross-references the store against external reality: dispatches past
//! the age threshold with a dead-quiet worktree are stale, in-flight phases
//! whose session mapping vanished are zombies, and old completed snapshots
//! are pruned. Every transition goes through the CAS engine, and a Conflict
//! just means a real callback won the race; the sweep logs it and moves on.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};

use crate::error::DispatchError;
use crate::probe::WorkspaceProbe;
use crate::store::Dispatch;
use crate::transition::{DispatchStatus, TransitionEngine, TransitionPatch};

/// Sweep thresholds.
#[derive(Debug, Clone, Copy)]
pub struct Thresholds {
    /// Age past which a quiet dispatch is stale.
    pub stale_after: Duration,
    /// Age past which a working/auditing dispatch with no live session
    /// mapping is a zombie.
    pub zombie_after: Duration,
    /// Retention for completed snapshots.
    pub retention: Duration,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            stale_after: Duration::hours(2),
            zombie_after: Duration::minutes(30),
            retention: Duration::days(7),
        }
    }
}

/// Summary of one monitor tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub stale: Vec<String>,
    pub zombies: Vec<String>,
    pub pruned: usize,
    pub conflicts: usize,
    pub errors: usize,
}

/// Periodic reconciler of store state against external liveness signals.
pub struct HealthMonitor<P> {
    engine: TransitionEngine,
    probe: P,
    thresholds: Thresholds,
}

impl<P: WorkspaceProbe> HealthMonitor<P> {
    pub const fn new(engine: TransitionEngine, probe: P, thresholds: Thresholds) -> Self {
        Self {
            engine,
            probe,
            thresholds,
        }
    }

    /// Run one full sweep. Never propagates per-dispatch failures; the
    /// report carries what happened.
    pub fn tick(&self) -> Result<TickReport, DispatchError> {
        let doc = self.engine.store().load()?;
        let now = Utc::now();
        let mut report = TickReport::default();

        for dispatch in doc.dispatches.active.values() {
            if dispatch.status.is_terminal() {
                continue;
            }
            let age = now - dispatch.dispatched_at;

            if age > self.thresholds.stale_after && self.is_stale(dispatch) {
                let reason = format!("stale_{}h", age.num_hours());
                match self.mark_stuck(dispatch, &reason) {
                    MarkResult::Marked => report.stale.push(dispatch.id.clone()),
                    MarkResult::Conflict => report.conflicts += 1,
                    MarkResult::Error => report.errors += 1,
                }
                continue;
            }

            if age > self.thresholds.zombie_after && self.is_zombie(dispatch, &doc.session_map) {
                match self.mark_stuck(dispatch, "zombie_session") {
                    MarkResult::Marked => report.zombies.push(dispatch.id.clone()),
                    MarkResult::Conflict => report.conflicts += 1,
                    MarkResult::Error => report.errors += 1,
                }
            }
        }

        report.pruned = self.prune_completed(now)?;

        tracing::info!(
            stale = report.stale.len(),
            zombies = report.zombies.len(),
            pruned = report.pruned,
            conflicts = report.conflicts,
            errors = report.errors,
            "health monitor tick"
        );
        Ok(report)
    }

    /// Sweep loop for the daemon. Checks `shutdown` between short sleeps so
    /// ctrl-c lands promptly.
    pub fn run(&self, interval: StdDuration, shutdown: &Arc<AtomicBool>) {
        tracing::info!(interval_secs = interval.as_secs(), "health monitor started");
        loop {
            if let Err(e) = self.tick() {
                // Tick-level failure: log and retry next interval.
                tracing::error!(error = %e, "health monitor tick failed");
            }
            let mut remaining = interval;
            while !remaining.is_zero() {
                if shutdown.load(Ordering::Relaxed) {
                    tracing::info!("health monitor stopping");
                    return;
                }
                let step = remaining.min(StdDuration::from_millis(250));
                thread::sleep(step);
                remaining -= step;
            }
        }
    }

    /// No observable worktree activity: not dirty, and no commit newer than
    /// the dispatch. A busy worktree past the age threshold is slow, not
    /// stale.
    fn is_stale(&self, dispatch: &Dispatch) -> bool {
        !self
            .probe
            .activity(&dispatch.worktree_path)
            .active_since(dispatch.dispatched_at)
    }

    /// The recorded phase implies an in-flight execution, but its session
    /// mapping is gone (or was never registered): the execution died without
    /// a callback.
    fn is_zombie(
        &self,
        dispatch: &Dispatch,
        session_map: &std::collections::BTreeMap<String, crate::store::SessionMapping>,
    ) -> bool {
        if !matches!(
            dispatch.status,
            DispatchStatus::Working | DispatchStatus::Auditing
        ) {
            return false;
        }
        dispatch.current_session_key().is_none_or(|key| {
            session_map
                .get(key)
                .is_none_or(|m| m.dispatch_id != dispatch.id || m.attempt != dispatch.attempt)
        })
    }

    fn mark_stuck(&self, dispatch: &Dispatch, reason: &str) -> MarkResult {
        let patch = TransitionPatch::stuck_reason(reason);
        match self
            .engine
            .transition(&dispatch.id, dispatch.status, DispatchStatus::Stuck, &patch)
        {
            Ok(_) => {
                tracing::warn!(id = %dispatch.id, reason, "dispatch marked stuck");
                MarkResult::Marked
            }
            Err(e) if e.is_conflict() => {
                // It moved under us, e.g. a real callback landed. Expected.
                tracing::debug!(id = %dispatch.id, error = %e, "sweep lost CAS race");
                MarkResult::Conflict
            }
            Err(e) => {
                tracing::warn!(id = %dispatch.id, error = %e, "sweep transition failed");
                MarkResult::Error
            }
        }
    }

    fn prune_completed(&self, now: chrono::DateTime<Utc>) -> Result<usize, DispatchError> {
        let cutoff = now - self.thresholds.retention;
        self.engine.store().update(|doc| {
            let before = doc.dispatches.completed.len();
            doc.dispatches
                .completed
                .retain(|_, c| c.completed_at >= cutoff);
            let pruned = before - doc.dispatches.completed.len();
            if pruned > 0 {
                tracing::info!(pruned, "pruned old completed dispatches");
            }
            Ok(pruned)
        })
    }
}

/// Outcome of one sweep transition attempt.
enum MarkResult {
    Marked,
    Conflict,
    Error,
}
