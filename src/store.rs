//! Durable dispatch state.
//!
//! One JSON document holds every active and recently-completed dispatch, the
//! session-key index, and the processed-event dedup list. Every mutation
//! round-trips through disk under the lock manager: acquire, read fresh,
//! modify, write whole, release. Reads that do not write skip the lock and
//! may observe a state mid-update by another holder; that staleness window
//! is accepted because all authoritative mutations go through the locked
//! read-modify-write path.

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DispatchError;
use crate::lock::LockManager;
use crate::transition::DispatchStatus;

/// Dedup list cap; oldest event ids are dropped past this.
const PROCESSED_EVENTS_CAP: usize = 500;

/// One tracked unit of externally-executed work, keyed by issue id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dispatch {
    pub id: String,
    pub status: DispatchStatus,
    pub attempt: u32,
    pub tier: String,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_session_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audit_session_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stuck_reason: Option<String>,
    /// Set once at registration; staleness ages are measured from here.
    pub dispatched_at: DateTime<Utc>,
    pub worktree_path: PathBuf,
}

impl Dispatch {
    /// Session key recorded for the phase the dispatch is currently in,
    /// if that phase has one.
    pub fn current_session_key(&self) -> Option<&str> {
        match self.status {
            DispatchStatus::Working => self.worker_session_key.as_deref(),
            DispatchStatus::Auditing => self.audit_session_key.as_deref(),
            _ => None,
        }
    }
}

/// Terminal snapshot kept after a dispatch finalizes, until pruned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedDispatch {
    pub status: DispatchStatus,
    pub tier: String,
    pub total_attempts: u32,
    pub completed_at: DateTime<Utc>,
}

/// Which externally-executed phase a session key belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Worker,
    Audit,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Worker => "worker",
            Self::Audit => "audit",
        })
    }
}

/// Routes an execution session key back to its dispatch, phase, and the
/// attempt that launched it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMapping {
    pub dispatch_id: String,
    pub phase: Phase,
    pub attempt: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Dispatches {
    pub active: BTreeMap<String, Dispatch>,
    pub completed: BTreeMap<String, CompletedDispatch>,
}

/// The whole persisted dispatch-store document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DispatchDocument {
    pub dispatches: Dispatches,
    pub session_map: BTreeMap<String, SessionMapping>,
    pub processed_events: Vec<String>,
}

/// Inputs for registering a fresh dispatch.
#[derive(Debug, Clone)]
pub struct NewDispatch {
    pub id: String,
    pub tier: String,
    pub model: String,
    pub worktree_path: PathBuf,
}

/// Result of a by-id lookup across both active and completed sets.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchRecord {
    Active(Dispatch),
    Completed(CompletedDispatch),
}

/// Durable read/modify/write access to the dispatch document.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
    locks: LockManager,
}

impl StateStore {
    pub const fn new(path: PathBuf, locks: LockManager) -> Self {
        Self { path, locks }
    }

    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self::new(path.into(), LockManager::default())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the current document. A missing file is an empty state; any
    /// other read or parse failure propagates.
    pub fn load(&self) -> Result<DispatchDocument, DispatchError> {
        load_json(&self.path)
    }

    /// Locked read-modify-write. The closure sees the freshly-read document;
    /// the write happens only when it returns `Ok`.
    pub(crate) fn update<T>(
        &self,
        f: impl FnOnce(&mut DispatchDocument) -> Result<T, DispatchError>,
    ) -> Result<T, DispatchError> {
        let _guard = self.locks.acquire(&self.path)?;
        let mut doc = load_json(&self.path)?;
        let out = f(&mut doc)?;
        persist_json(&self.path, &doc)?;
        Ok(out)
    }

    /// Register a new dispatch with status `dispatched` and attempt 0.
    ///
    /// Fails when an active dispatch with the same id already exists. A
    /// leftover completed snapshot for the id is dropped so the
    /// one-of-active-or-completed invariant holds.
    pub fn register(&self, new: NewDispatch) -> Result<Dispatch, DispatchError> {
        self.update(|doc| {
            if let Some(existing) = doc.dispatches.active.get(&new.id) {
                return Err(DispatchError::InvalidTransition {
                    id: new.id.clone(),
                    status: existing.status,
                    operation: "register over active dispatch".to_string(),
                });
            }
            doc.dispatches.completed.remove(&new.id);
            let dispatch = Dispatch {
                id: new.id.clone(),
                status: DispatchStatus::Dispatched,
                attempt: 0,
                tier: new.tier.clone(),
                model: new.model.clone(),
                worker_session_key: None,
                audit_session_key: None,
                stuck_reason: None,
                dispatched_at: Utc::now(),
                worktree_path: new.worktree_path.clone(),
            };
            doc.dispatches
                .active
                .insert(new.id.clone(), dispatch.clone());
            tracing::info!(id = %new.id, tier = %new.tier, "dispatch registered");
            Ok(dispatch)
        })
    }

    /// Cancel: remove an active dispatch and its session mappings.
    pub fn remove(&self, id: &str) -> Result<Dispatch, DispatchError> {
        self.update(|doc| {
            let dispatch = doc
                .dispatches
                .active
                .remove(id)
                .ok_or_else(|| DispatchError::NotFound { id: id.to_string() })?;
            doc.session_map.retain(|_, m| m.dispatch_id != id);
            tracing::info!(id, "dispatch removed");
            Ok(dispatch)
        })
    }

    /// Operator retry of a stuck dispatch.
    ///
    /// Not a state-machine transition: the stuck record is removed and
    /// re-registered with the attempt bumped, status reset to `dispatched`,
    /// and the stuck reason and both session keys cleared.
    pub fn retry(&self, id: &str) -> Result<Dispatch, DispatchError> {
        self.update(|doc| {
            let current = doc
                .dispatches
                .active
                .get(id)
                .ok_or_else(|| DispatchError::NotFound { id: id.to_string() })?;
            if current.status != DispatchStatus::Stuck {
                return Err(DispatchError::InvalidTransition {
                    id: id.to_string(),
                    status: current.status,
                    operation: "retry".to_string(),
                });
            }
            let previous = doc
                .dispatches
                .active
                .remove(id)
                .ok_or_else(|| DispatchError::NotFound { id: id.to_string() })?;
            doc.session_map.retain(|_, m| m.dispatch_id != id);
            let dispatch = Dispatch {
                status: DispatchStatus::Dispatched,
                attempt: previous.attempt + 1,
                worker_session_key: None,
                audit_session_key: None,
                stuck_reason: None,
                dispatched_at: Utc::now(),
                ..previous
            };
            doc.dispatches.active.insert(id.to_string(), dispatch.clone());
            tracing::info!(id, attempt = dispatch.attempt, "stuck dispatch retried");
            Ok(dispatch)
        })
    }

    /// Record the session mapping for a phase launch, replacing any prior
    /// mapping held by the same dispatch for the same phase.
    pub fn register_session(
        &self,
        session_key: &str,
        mapping: SessionMapping,
    ) -> Result<(), DispatchError> {
        self.update(|doc| {
            if !doc.dispatches.active.contains_key(&mapping.dispatch_id) {
                return Err(DispatchError::NotFound {
                    id: mapping.dispatch_id.clone(),
                });
            }
            doc.session_map
                .retain(|_, m| !(m.dispatch_id == mapping.dispatch_id && m.phase == mapping.phase));
            doc.session_map.insert(session_key.to_string(), mapping);
            Ok(())
        })
    }

    /// Delete one session mapping. Missing keys are fine.
    pub fn remove_session(&self, session_key: &str) -> Result<(), DispatchError> {
        self.update(|doc| {
            doc.session_map.remove(session_key);
            Ok(())
        })
    }

    /// Unvalidated mapping lookup.
    pub fn lookup_session(&self, session_key: &str) -> Result<Option<SessionMapping>, DispatchError> {
        Ok(self.load()?.session_map.get(session_key).cloned())
    }

    /// Resolve a completion callback's session key.
    ///
    /// Returns `None` (discard) when the key is unknown, the dispatch is no
    /// longer active, or the mapped attempt is not the dispatch's current
    /// attempt — the execution belongs to a superseded attempt and must not
    /// touch the newer one's state.
    pub fn validate_callback(
        &self,
        session_key: &str,
    ) -> Result<Option<SessionMapping>, DispatchError> {
        let doc = self.load()?;
        let Some(mapping) = doc.session_map.get(session_key) else {
            tracing::debug!(session_key, "callback for unknown session, discarding");
            return Ok(None);
        };
        let Some(dispatch) = doc.dispatches.active.get(&mapping.dispatch_id) else {
            tracing::debug!(
                session_key,
                dispatch = %mapping.dispatch_id,
                "callback for inactive dispatch, discarding"
            );
            return Ok(None);
        };
        if mapping.attempt != dispatch.attempt {
            tracing::debug!(
                session_key,
                dispatch = %mapping.dispatch_id,
                mapped_attempt = mapping.attempt,
                current_attempt = dispatch.attempt,
                "stale callback from superseded attempt, discarding"
            );
            return Ok(None);
        }
        Ok(Some(mapping.clone()))
    }

    /// Record an event id; returns false when it was already processed.
    pub fn mark_event_processed(&self, event_id: &str) -> Result<bool, DispatchError> {
        self.update(|doc| {
            if doc.processed_events.iter().any(|e| e == event_id) {
                return Ok(false);
            }
            doc.processed_events.push(event_id.to_string());
            let len = doc.processed_events.len();
            if len > PROCESSED_EVENTS_CAP {
                doc.processed_events.drain(..len - PROCESSED_EVENTS_CAP);
            }
            Ok(true)
        })
    }

    /// Active dispatches, optionally filtered by status and tier.
    pub fn list_active(
        &self,
        status: Option<DispatchStatus>,
        tier: Option<&str>,
    ) -> Result<Vec<Dispatch>, DispatchError> {
        let doc = self.load()?;
        Ok(doc
            .dispatches
            .active
            .into_values()
            .filter(|d| status.is_none_or(|s| d.status == s))
            .filter(|d| tier.is_none_or(|t| d.tier == t))
            .collect())
    }

    /// Completed snapshots, optionally filtered by status and tier.
    pub fn list_completed(
        &self,
        status: Option<DispatchStatus>,
        tier: Option<&str>,
    ) -> Result<Vec<(String, CompletedDispatch)>, DispatchError> {
        let doc = self.load()?;
        Ok(doc
            .dispatches
            .completed
            .into_iter()
            .filter(|(_, d)| status.is_none_or(|s| d.status == s))
            .filter(|(_, d)| tier.is_none_or(|t| d.tier == t))
            .collect())
    }

    /// By-id lookup: active first, falling back to completed.
    pub fn get(&self, id: &str) -> Result<Option<DispatchRecord>, DispatchError> {
        let doc = self.load()?;
        if let Some(d) = doc.dispatches.active.get(id) {
            return Ok(Some(DispatchRecord::Active(d.clone())));
        }
        Ok(doc
            .dispatches
            .completed
            .get(id)
            .cloned()
            .map(DispatchRecord::Completed))
    }

    pub fn counts_by_status(&self) -> Result<BTreeMap<DispatchStatus, usize>, DispatchError> {
        let doc = self.load()?;
        let mut counts = BTreeMap::new();
        for d in doc.dispatches.active.values() {
            *counts.entry(d.status).or_insert(0) += 1;
        }
        Ok(counts)
    }

    pub fn counts_by_tier(&self) -> Result<BTreeMap<String, usize>, DispatchError> {
        let doc = self.load()?;
        let mut counts = BTreeMap::new();
        for d in doc.dispatches.active.values() {
            *counts.entry(d.tier.clone()).or_insert(0) += 1;
        }
        Ok(counts)
    }
}

/// Read a persisted JSON document; a missing file is the default (empty)
/// document, any other failure propagates.
pub(crate) fn load_json<T: serde::de::DeserializeOwned + Default>(
    path: &Path,
) -> Result<T, DispatchError> {
    match fs::read_to_string(path) {
        Ok(content) => {
            serde_json::from_str(&content).map_err(|source| DispatchError::Corrupt {
                path: path.to_path_buf(),
                source,
            })
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(T::default()),
        Err(e) => Err(e.into()),
    }
}

/// Write a whole JSON document, creating parent directories as needed.
pub(crate) fn persist_json<T: Serialize>(path: &Path, doc: &T) -> Result<(), DispatchError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let content = serde_json::to_string_pretty(doc).map_err(|source| DispatchError::Corrupt {
        path: path.to_path_buf(),
        source,
    })?;
    fs::write(path, content)?;
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::test_fixtures::dispatch_with_status;
    use super::*;

    fn store_in(dir: &tempfile::TempDir) -> StateStore {
        StateStore::at(dir.path().join("dispatches.json"))
    }

    fn new_dispatch(id: &str) -> NewDispatch {
        NewDispatch {
            id: id.to_string(),
            tier: "balanced".to_string(),
            model: "default".to_string(),
            worktree_path: PathBuf::from("/tmp/worktrees").join(id),
        }
    }

    #[test]
    fn test_missing_file_is_empty_state() {
        let dir = tempfile::tempdir().unwrap();
        let doc = store_in(&dir).load().unwrap();
        assert!(doc.dispatches.active.is_empty());
        assert!(doc.session_map.is_empty());
    }

    #[test]
    fn test_corrupt_file_propagates() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        fs::write(store.path(), "{not json").unwrap();
        assert!(matches!(
            store.load().unwrap_err(),
            DispatchError::Corrupt { .. }
        ));
    }

    #[test]
    fn test_register_and_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let dispatch = store.register(new_dispatch("CT-100")).unwrap();
        assert_eq!(dispatch.status, DispatchStatus::Dispatched);
        assert_eq!(dispatch.attempt, 0);

        let reloaded = store.load().unwrap();
        assert_eq!(reloaded.dispatches.active["CT-100"], dispatch);

        // The document round-trips structurally.
        let rewritten = store.load().unwrap();
        assert_eq!(reloaded, rewritten);
    }

    #[test]
    fn test_register_duplicate_active_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store.register(new_dispatch("CT-100")).unwrap();
        let err = store.register(new_dispatch("CT-100")).unwrap_err();
        assert!(matches!(err, DispatchError::InvalidTransition { .. }));
    }

    #[test]
    fn test_register_clears_completed_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store
            .update(|doc| {
                doc.dispatches.completed.insert(
                    "CT-1".to_string(),
                    CompletedDispatch {
                        status: DispatchStatus::Done,
                        tier: "fast".to_string(),
                        total_attempts: 1,
                        completed_at: Utc::now(),
                    },
                );
                Ok(())
            })
            .unwrap();

        store.register(new_dispatch("CT-1")).unwrap();
        let doc = store.load().unwrap();
        assert!(doc.dispatches.active.contains_key("CT-1"));
        assert!(!doc.dispatches.completed.contains_key("CT-1"));
    }

    #[test]
    fn test_retry_requires_stuck() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store.register(new_dispatch("CT-100")).unwrap();
        let err = store.retry("CT-100").unwrap_err();
        assert!(matches!(
            err,
            DispatchError::InvalidTransition {
                status: DispatchStatus::Dispatched,
                ..
            }
        ));
    }

    #[test]
    fn test_retry_resets_and_increments() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store
            .update(|doc| {
                let mut d = dispatch_with_status("CT-100", DispatchStatus::Stuck);
                d.attempt = 1;
                d.stuck_reason = Some("stale_3h".to_string());
                d.worker_session_key = Some("sess-1".to_string());
                d.audit_session_key = Some("sess-2".to_string());
                doc.dispatches.active.insert("CT-100".to_string(), d);
                doc.session_map.insert(
                    "sess-1".to_string(),
                    SessionMapping {
                        dispatch_id: "CT-100".to_string(),
                        phase: Phase::Worker,
                        attempt: 1,
                    },
                );
                Ok(())
            })
            .unwrap();

        let retried = store.retry("CT-100").unwrap();
        assert_eq!(retried.status, DispatchStatus::Dispatched);
        assert_eq!(retried.attempt, 2);
        assert_eq!(retried.stuck_reason, None);
        assert_eq!(retried.worker_session_key, None);
        assert_eq!(retried.audit_session_key, None);
        assert!(store.load().unwrap().session_map.is_empty());

        // A second retry before any transition fails: no longer stuck.
        let err = store.retry("CT-100").unwrap_err();
        assert!(matches!(err, DispatchError::InvalidTransition { .. }));
    }

    #[test]
    fn test_remove_drops_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store.register(new_dispatch("CT-7")).unwrap();
        store
            .register_session(
                "sess-7",
                SessionMapping {
                    dispatch_id: "CT-7".to_string(),
                    phase: Phase::Worker,
                    attempt: 0,
                },
            )
            .unwrap();

        store.remove("CT-7").unwrap();
        let doc = store.load().unwrap();
        assert!(doc.dispatches.active.is_empty());
        assert!(doc.session_map.is_empty());
        assert!(matches!(
            store.remove("CT-7").unwrap_err(),
            DispatchError::NotFound { .. }
        ));
    }

    #[test]
    fn test_register_session_supersedes_same_phase() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store.register(new_dispatch("CT-8")).unwrap();
        let mapping = |attempt| SessionMapping {
            dispatch_id: "CT-8".to_string(),
            phase: Phase::Worker,
            attempt,
        };
        store.register_session("sess-old", mapping(0)).unwrap();
        store.register_session("sess-new", mapping(0)).unwrap();

        let doc = store.load().unwrap();
        assert!(!doc.session_map.contains_key("sess-old"));
        assert!(doc.session_map.contains_key("sess-new"));
    }

    #[test]
    fn test_validate_callback_attempt_mismatch_discards() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store
            .update(|doc| {
                let mut d = dispatch_with_status("CT-9", DispatchStatus::Working);
                d.attempt = 2;
                doc.dispatches.active.insert("CT-9".to_string(), d);
                doc.session_map.insert(
                    "sess-stale".to_string(),
                    SessionMapping {
                        dispatch_id: "CT-9".to_string(),
                        phase: Phase::Worker,
                        attempt: 1,
                    },
                );
                doc.session_map.insert(
                    "sess-live".to_string(),
                    SessionMapping {
                        dispatch_id: "CT-9".to_string(),
                        phase: Phase::Worker,
                        attempt: 2,
                    },
                );
                Ok(())
            })
            .unwrap();

        assert_eq!(store.validate_callback("sess-stale").unwrap(), None);
        assert_eq!(store.validate_callback("sess-missing").unwrap(), None);
        let live = store.validate_callback("sess-live").unwrap().unwrap();
        assert_eq!(live.attempt, 2);
    }

    #[test]
    fn test_event_dedup() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        assert!(store.mark_event_processed("evt-1").unwrap());
        assert!(!store.mark_event_processed("evt-1").unwrap());
        assert!(store.mark_event_processed("evt-2").unwrap());
    }

    #[test]
    fn test_get_falls_back_to_completed() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store
            .update(|doc| {
                doc.dispatches.completed.insert(
                    "CT-2".to_string(),
                    CompletedDispatch {
                        status: DispatchStatus::Done,
                        tier: "strong".to_string(),
                        total_attempts: 2,
                        completed_at: Utc::now(),
                    },
                );
                Ok(())
            })
            .unwrap();

        assert!(matches!(
            store.get("CT-2").unwrap(),
            Some(DispatchRecord::Completed(_))
        ));
        assert_eq!(store.get("CT-404").unwrap(), None);
    }

    #[test]
    fn test_list_completed_filters_by_status_and_tier() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store
            .update(|doc| {
                for (id, status, tier) in [
                    ("CT-1", DispatchStatus::Done, "fast"),
                    ("CT-2", DispatchStatus::Failed, "fast"),
                    ("CT-3", DispatchStatus::Done, "strong"),
                ] {
                    doc.dispatches.completed.insert(
                        id.to_string(),
                        CompletedDispatch {
                            status,
                            tier: tier.to_string(),
                            total_attempts: 1,
                            completed_at: Utc::now(),
                        },
                    );
                }
                Ok(())
            })
            .unwrap();

        let failed = store
            .list_completed(Some(DispatchStatus::Failed), None)
            .unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].0, "CT-2");

        let done_fast = store
            .list_completed(Some(DispatchStatus::Done), Some("fast"))
            .unwrap();
        assert_eq!(done_fast.len(), 1);
        assert_eq!(done_fast[0].0, "CT-1");

        assert_eq!(store.list_completed(None, None).unwrap().len(), 3);
    }

    #[test]
    fn test_counts_and_filters() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store
            .update(|doc| {
                for (id, status, tier) in [
                    ("CT-1", DispatchStatus::Working, "fast"),
                    ("CT-2", DispatchStatus::Working, "strong"),
                    ("CT-3", DispatchStatus::Stuck, "fast"),
                ] {
                    let mut d = dispatch_with_status(id, status);
                    d.tier = tier.to_string();
                    doc.dispatches.active.insert(id.to_string(), d);
                }
                Ok(())
            })
            .unwrap();

        let by_status = store.counts_by_status().unwrap();
        assert_eq!(by_status[&DispatchStatus::Working], 2);
        assert_eq!(by_status[&DispatchStatus::Stuck], 1);
        let by_tier = store.counts_by_tier().unwrap();
        assert_eq!(by_tier["fast"], 2);

        let working_fast = store
            .list_active(Some(DispatchStatus::Working), Some("fast"))
            .unwrap();
        assert_eq!(working_fast.len(), 1);
        assert_eq!(working_fast[0].id, "CT-1");
    }
}
