//! Dispatch state machine and compare-and-swap transition engine.
//!
//! The legal moves live in one adjacency table (`DispatchStatus::successors`)
//! so "what can follow X" is a single queryable artifact shared by the engine
//! and its tests. The CAS step itself is a pure function over the in-memory
//! document; `TransitionEngine` wraps it in lock + fresh read + persist.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DispatchError;
use crate::store::{CompletedDispatch, Dispatch, DispatchDocument, StateStore};

/// Lifecycle status of a dispatch.
///
/// `Done`, `Failed`, and `Stuck` are terminal for this engine. A stuck
/// dispatch can still be brought back by the explicit retry operation,
/// which re-registers it rather than transitioning it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchStatus {
    Dispatched,
    Working,
    Auditing,
    Done,
    Failed,
    Stuck,
}

impl DispatchStatus {
    /// Statuses legally reachable from this one in a single transition.
    ///
    /// Audit rework is modeled as a fresh dispatch entry, not an
    /// auditing-to-working back-edge, so the machine only has forward edges.
    pub const fn successors(self) -> &'static [Self] {
        match self {
            Self::Dispatched => &[Self::Working, Self::Stuck, Self::Failed],
            Self::Working => &[Self::Auditing, Self::Stuck, Self::Failed],
            Self::Auditing => &[Self::Done, Self::Stuck, Self::Failed],
            Self::Done | Self::Failed | Self::Stuck => &[],
        }
    }

    pub const fn is_terminal(self) -> bool {
        self.successors().is_empty()
    }

    /// Terminal statuses that move the record into the completed set.
    /// `Stuck` stays active so it remains visible and retryable.
    pub const fn finalizes(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Dispatched => "dispatched",
            Self::Working => "working",
            Self::Auditing => "auditing",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Stuck => "stuck",
        }
    }
}

impl std::fmt::Display for DispatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DispatchStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dispatched" => Ok(Self::Dispatched),
            "working" => Ok(Self::Working),
            "auditing" => Ok(Self::Auditing),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            "stuck" => Ok(Self::Stuck),
            other => Err(format!("unknown status: {other}")),
        }
    }
}

/// Fields a successful transition may set alongside the status change.
#[derive(Debug, Clone, Default)]
pub struct TransitionPatch {
    pub stuck_reason: Option<String>,
    pub worker_session_key: Option<String>,
    pub audit_session_key: Option<String>,
}

impl TransitionPatch {
    pub fn stuck_reason(reason: impl Into<String>) -> Self {
        Self {
            stuck_reason: Some(reason.into()),
            ..Self::default()
        }
    }

    pub fn worker_session(key: impl Into<String>) -> Self {
        Self {
            worker_session_key: Some(key.into()),
            ..Self::default()
        }
    }

    pub fn audit_session(key: impl Into<String>) -> Self {
        Self {
            audit_session_key: Some(key.into()),
            ..Self::default()
        }
    }
}

/// Apply one CAS transition to an in-memory document.
///
/// Pure with respect to I/O: the caller is responsible for having read the
/// document fresh under lock and for persisting the result. Fails with
/// `NotFound` when `id` has no active entry, `Conflict` when the current
/// status does not match `expected`, and `InvalidTransition` when `new` is
/// not a successor of `expected`. On failure the document is unchanged.
pub fn apply_transition(
    doc: &mut DispatchDocument,
    id: &str,
    expected: DispatchStatus,
    new: DispatchStatus,
    patch: &TransitionPatch,
    now: DateTime<Utc>,
) -> Result<Dispatch, DispatchError> {
    let Some(dispatch) = doc.dispatches.active.get(id) else {
        return Err(DispatchError::NotFound { id: id.to_string() });
    };
    if dispatch.status != expected {
        return Err(DispatchError::Conflict {
            id: id.to_string(),
            expected,
            actual: dispatch.status,
        });
    }
    if !expected.successors().contains(&new) {
        return Err(DispatchError::InvalidTransition {
            id: id.to_string(),
            status: expected,
            operation: format!("transition to {new}"),
        });
    }

    // Checks passed; now mutate.
    let dispatch = doc
        .dispatches
        .active
        .get_mut(id)
        .ok_or_else(|| DispatchError::NotFound { id: id.to_string() })?;
    dispatch.status = new;
    if let Some(reason) = &patch.stuck_reason {
        dispatch.stuck_reason = Some(reason.clone());
    }
    if let Some(key) = &patch.worker_session_key {
        dispatch.worker_session_key = Some(key.clone());
    }
    if let Some(key) = &patch.audit_session_key {
        dispatch.audit_session_key = Some(key.clone());
    }
    let updated = dispatch.clone();

    if new.finalizes() {
        doc.dispatches.active.remove(id);
        doc.dispatches.completed.insert(
            id.to_string(),
            CompletedDispatch {
                status: new,
                tier: updated.tier.clone(),
                total_attempts: updated.attempt + 1,
                completed_at: now,
            },
        );
        doc.session_map.retain(|_, m| m.dispatch_id != id);
    }

    Ok(updated)
}

/// CAS transition engine over the persisted dispatch store.
#[derive(Debug, Clone)]
pub struct TransitionEngine {
    store: StateStore,
}

impl TransitionEngine {
    pub const fn new(store: StateStore) -> Self {
        Self { store }
    }

    pub const fn store(&self) -> &StateStore {
        &self.store
    }

    /// Transition `id` from `expected` to `new`, applying `patch` on success.
    ///
    /// The store is re-read under lock immediately before the compare, so
    /// exactly one of two racing transitions on the same dispatch succeeds;
    /// the loser sees `Conflict` and must re-read before deciding anything.
    pub fn transition(
        &self,
        id: &str,
        expected: DispatchStatus,
        new: DispatchStatus,
        patch: &TransitionPatch,
    ) -> Result<Dispatch, DispatchError> {
        self.store.update(|doc| {
            let updated = apply_transition(doc, id, expected, new, patch, Utc::now())?;
            tracing::info!(id, from = %expected, to = %new, "dispatch transitioned");
            Ok(updated)
        })
    }

    /// Escalate a live dispatch to stuck with an operator-supplied reason.
    ///
    /// Reads the current status first so the caller does not have to guess
    /// the expected state; the CAS inside `update` still protects against a
    /// concurrent move.
    pub fn escalate(&self, id: &str, reason: &str) -> Result<Dispatch, DispatchError> {
        let patch = TransitionPatch::stuck_reason(reason);
        self.store.update(|doc| {
            let current = doc
                .dispatches
                .active
                .get(id)
                .map(|d| d.status)
                .ok_or_else(|| DispatchError::NotFound { id: id.to_string() })?;
            if current.is_terminal() {
                return Err(DispatchError::InvalidTransition {
                    id: id.to_string(),
                    status: current,
                    operation: "escalate".to_string(),
                });
            }
            let updated =
                apply_transition(doc, id, current, DispatchStatus::Stuck, &patch, Utc::now())?;
            tracing::warn!(id, reason, "dispatch escalated to stuck");
            Ok(updated)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_fixtures::{dispatch_with_status, empty_document};

    #[test]
    fn test_successor_table_forward_only() {
        assert!(DispatchStatus::Dispatched.successors().contains(&DispatchStatus::Working));
        assert!(DispatchStatus::Working.successors().contains(&DispatchStatus::Auditing));
        assert!(DispatchStatus::Auditing.successors().contains(&DispatchStatus::Done));
        // No rework back-edge.
        assert!(!DispatchStatus::Auditing.successors().contains(&DispatchStatus::Working));
        for terminal in [DispatchStatus::Done, DispatchStatus::Failed, DispatchStatus::Stuck] {
            assert!(terminal.is_terminal());
            assert!(terminal.successors().is_empty());
        }
    }

    #[test]
    fn test_apply_transition_happy_path() {
        let mut doc = empty_document();
        doc.dispatches.active.insert(
            "CT-1".to_string(),
            dispatch_with_status("CT-1", DispatchStatus::Dispatched),
        );

        let updated = apply_transition(
            &mut doc,
            "CT-1",
            DispatchStatus::Dispatched,
            DispatchStatus::Working,
            &TransitionPatch::worker_session("sess-a"),
            Utc::now(),
        )
        .unwrap();

        assert_eq!(updated.status, DispatchStatus::Working);
        assert_eq!(updated.worker_session_key.as_deref(), Some("sess-a"));
        assert_eq!(
            doc.dispatches.active["CT-1"].status,
            DispatchStatus::Working
        );
    }

    #[test]
    fn test_apply_transition_conflict_leaves_document_unchanged() {
        let mut doc = empty_document();
        doc.dispatches.active.insert(
            "CT-2".to_string(),
            dispatch_with_status("CT-2", DispatchStatus::Auditing),
        );

        let err = apply_transition(
            &mut doc,
            "CT-2",
            DispatchStatus::Working,
            DispatchStatus::Stuck,
            &TransitionPatch::default(),
            Utc::now(),
        )
        .unwrap_err();

        assert!(matches!(
            err,
            DispatchError::Conflict {
                expected: DispatchStatus::Working,
                actual: DispatchStatus::Auditing,
                ..
            }
        ));
        assert_eq!(
            doc.dispatches.active["CT-2"].status,
            DispatchStatus::Auditing
        );
    }

    #[test]
    fn test_apply_transition_missing_dispatch() {
        let mut doc = empty_document();
        let err = apply_transition(
            &mut doc,
            "CT-404",
            DispatchStatus::Working,
            DispatchStatus::Stuck,
            &TransitionPatch::default(),
            Utc::now(),
        )
        .unwrap_err();
        assert!(matches!(err, DispatchError::NotFound { .. }));
    }

    #[test]
    fn test_apply_transition_rejects_illegal_edge() {
        let mut doc = empty_document();
        doc.dispatches.active.insert(
            "CT-3".to_string(),
            dispatch_with_status("CT-3", DispatchStatus::Dispatched),
        );

        let err = apply_transition(
            &mut doc,
            "CT-3",
            DispatchStatus::Dispatched,
            DispatchStatus::Done,
            &TransitionPatch::default(),
            Utc::now(),
        )
        .unwrap_err();
        assert!(matches!(err, DispatchError::InvalidTransition { .. }));
    }

    #[test]
    fn test_done_moves_record_to_completed_and_drops_sessions() {
        let mut doc = empty_document();
        let mut d = dispatch_with_status("CT-4", DispatchStatus::Auditing);
        d.attempt = 2;
        doc.dispatches.active.insert("CT-4".to_string(), d);
        doc.session_map.insert(
            "sess-x".to_string(),
            crate::store::SessionMapping {
                dispatch_id: "CT-4".to_string(),
                phase: crate::store::Phase::Audit,
                attempt: 2,
            },
        );
        doc.session_map.insert(
            "sess-other".to_string(),
            crate::store::SessionMapping {
                dispatch_id: "CT-9".to_string(),
                phase: crate::store::Phase::Worker,
                attempt: 0,
            },
        );

        apply_transition(
            &mut doc,
            "CT-4",
            DispatchStatus::Auditing,
            DispatchStatus::Done,
            &TransitionPatch::default(),
            Utc::now(),
        )
        .unwrap();

        assert!(!doc.dispatches.active.contains_key("CT-4"));
        let completed = &doc.dispatches.completed["CT-4"];
        assert_eq!(completed.status, DispatchStatus::Done);
        assert_eq!(completed.total_attempts, 3);
        assert!(!doc.session_map.contains_key("sess-x"));
        assert!(doc.session_map.contains_key("sess-other"));
    }

    #[test]
    fn test_status_serializes_lowercase() {
        let json = serde_json::to_string(&DispatchStatus::Auditing).unwrap();
        assert_eq!(json, "\"auditing\"");
        let back: DispatchStatus = serde_json::from_str("\"stuck\"").unwrap();
        assert_eq!(back, DispatchStatus::Stuck);
    }
}
