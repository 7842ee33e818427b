//! Dependency-graph orchestration of a batch of related dispatches.
//!
//! A project batch is a set of issues with block/blocked-by relations.
//! The orchestrator walks the batch in topological order under a concurrency
//! cap: a node dispatches only when every dependency is done and a slot is
//! free. Node state is persisted before the launcher runs so a crash between
//! persist and launch cannot silently re-dispatch. Completion and failure
//! notices cascade through the graph; a batch ends `completed` when every
//! node is done, stuck, or skipped, and `stuck` when a stuck node exists and
//! no further progress is reachable.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DispatchError;
use crate::lock::LockManager;
use crate::notify::NotifierSet;
use crate::store::{load_json, persist_json};

/// Node state within a project batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueDispatchStatus {
    Pending,
    Dispatched,
    Done,
    Stuck,
    Skipped,
}

impl IssueDispatchStatus {
    /// Settled states: the batch never waits on these again.
    pub const fn is_settled(self) -> bool {
        matches!(self, Self::Done | Self::Stuck | Self::Skipped)
    }
}

/// One issue in a project batch with its resolved dependency edges.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssueStatus {
    pub identifier: String,
    pub issue_id: String,
    pub depends_on: Vec<String>,
    pub unblocks: Vec<String>,
    pub dispatch_status: IssueDispatchStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// Batch-level state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectStatus {
    Dispatching,
    Completed,
    Stuck,
    Paused,
}

impl std::fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Dispatching => "dispatching",
            Self::Completed => "completed",
            Self::Stuck => "stuck",
            Self::Paused => "paused",
        })
    }
}

/// The persisted aggregate for one project batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectDispatch {
    pub project_id: String,
    pub status: ProjectStatus,
    pub max_concurrent: usize,
    pub issues: BTreeMap<String, IssueStatus>,
}

impl ProjectDispatch {
    /// Nodes ready to dispatch: pending, with every dependency done.
    ///
    /// Identifier order; tie-breaking among ready nodes is arbitrary, and
    /// the sorted map gives a deterministic arbitrary.
    pub fn ready_nodes(&self) -> Vec<&IssueStatus> {
        self.issues
            .values()
            .filter(|issue| {
                issue.dispatch_status == IssueDispatchStatus::Pending
                    && issue.depends_on.iter().all(|dep| {
                        self.issues
                            .get(dep)
                            .is_some_and(|d| d.dispatch_status == IssueDispatchStatus::Done)
                    })
            })
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.issues
            .values()
            .filter(|i| i.dispatch_status == IssueDispatchStatus::Dispatched)
            .count()
    }

    pub fn is_complete(&self) -> bool {
        self.issues
            .values()
            .all(|i| i.dispatch_status.is_settled())
    }

    /// A batch is stuck when a stuck node exists and nothing can move:
    /// no ready nodes and no in-flight ones. A merely-blocked batch with
    /// active work is not stuck yet.
    pub fn is_stuck(&self) -> bool {
        self.issues
            .values()
            .any(|i| i.dispatch_status == IssueDispatchStatus::Stuck)
            && self.ready_nodes().is_empty()
            && self.active_count() == 0
    }
}

/// Raw task input for building a batch: relations reference identifiers of
/// other tasks, which may or may not be in the batch.
#[derive(Debug, Clone)]
pub struct ProjectTask {
    pub identifier: String,
    pub issue_id: String,
    pub blocks: Vec<String>,
    pub blocked_by: Vec<String>,
    /// Organizational-only marker (e.g. an epic label): the task is carried
    /// as `skipped` and its edges are elided, not propagated.
    pub organizational: bool,
}

/// Build the node map for a batch from raw task relations.
///
/// Relations to tasks outside the batch are ignored. Skipped tasks never
/// appear on either side of an edge.
pub fn build_project(
    project_id: &str,
    tasks: &[ProjectTask],
    max_concurrent: usize,
) -> ProjectDispatch {
    let in_batch: std::collections::BTreeSet<&str> = tasks
        .iter()
        .filter(|t| !t.organizational)
        .map(|t| t.identifier.as_str())
        .collect();

    let mut issues: BTreeMap<String, IssueStatus> = tasks
        .iter()
        .map(|task| {
            (
                task.identifier.clone(),
                IssueStatus {
                    identifier: task.identifier.clone(),
                    issue_id: task.issue_id.clone(),
                    depends_on: Vec::new(),
                    unblocks: Vec::new(),
                    dispatch_status: if task.organizational {
                        IssueDispatchStatus::Skipped
                    } else {
                        IssueDispatchStatus::Pending
                    },
                    completed_at: None,
                },
            )
        })
        .collect();

    // Both relation directions contribute edges; `blocks` on one task is
    // `blocked_by` on the other even when only one side declares it.
    for task in tasks.iter().filter(|t| !t.organizational) {
        for blocked in &task.blocks {
            if in_batch.contains(blocked.as_str()) {
                push_edge(&mut issues, &task.identifier, blocked);
            }
        }
        for blocker in &task.blocked_by {
            if in_batch.contains(blocker.as_str()) {
                push_edge(&mut issues, blocker, &task.identifier);
            }
        }
    }

    ProjectDispatch {
        project_id: project_id.to_string(),
        status: ProjectStatus::Dispatching,
        max_concurrent,
        issues,
    }
}

/// Record that `blocker` unblocks `blocked` (and the inverse), deduped.
fn push_edge(issues: &mut BTreeMap<String, IssueStatus>, blocker: &str, blocked: &str) {
    if let Some(node) = issues.get_mut(blocker) {
        if !node.unblocks.iter().any(|u| u == blocked) {
            node.unblocks.push(blocked.to_string());
        }
    }
    if let Some(node) = issues.get_mut(blocked) {
        if !node.depends_on.iter().any(|d| d == blocker) {
            node.depends_on.push(blocker.to_string());
        }
    }
}

/// Persisted project-dispatch document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProjectDocument {
    pub project_dispatches: BTreeMap<String, ProjectDispatch>,
}

/// Durable storage for project batches, same lock-guarded whole-document
/// facility as the dispatch store.
#[derive(Debug, Clone)]
pub struct ProjectStore {
    path: PathBuf,
    locks: LockManager,
}

impl ProjectStore {
    pub const fn new(path: PathBuf, locks: LockManager) -> Self {
        Self { path, locks }
    }

    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self::new(path.into(), LockManager::default())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<ProjectDocument, DispatchError> {
        load_json(&self.path)
    }

    pub fn get(&self, project_id: &str) -> Result<Option<ProjectDispatch>, DispatchError> {
        Ok(self.load()?.project_dispatches.get(project_id).cloned())
    }

    fn update<T>(
        &self,
        f: impl FnOnce(&mut ProjectDocument) -> Result<T, DispatchError>,
    ) -> Result<T, DispatchError> {
        let _guard = self.locks.acquire(&self.path)?;
        let mut doc = load_json(&self.path)?;
        let out = f(&mut doc)?;
        persist_json(&self.path, &doc)?;
        Ok(out)
    }
}

/// Creates the actual dispatch for a ready node. External collaborator:
/// the orchestrator decides *when*, the launcher decides *how*.
pub trait DispatchLauncher {
    fn launch(&self, project_id: &str, issue: &IssueStatus) -> anyhow::Result<()>;
}

/// In-memory mirror of hydrated project batches.
///
/// Explicitly injected rather than module-global: populate via `hydrate`
/// at startup, entries leave when their batch settles or via `clear`.
/// Disk is authoritative; the cache only serves lock-free reads.
#[derive(Debug, Default)]
pub struct ProjectCache {
    entries: BTreeMap<String, ProjectDispatch>,
}

impl ProjectCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hydrate(&mut self, store: &ProjectStore) -> Result<(), DispatchError> {
        self.entries = store.load()?.project_dispatches;
        Ok(())
    }

    pub fn get(&self, project_id: &str) -> Option<&ProjectDispatch> {
        self.entries.get(project_id)
    }

    fn put(&mut self, project: ProjectDispatch) {
        self.entries.insert(project.project_id.clone(), project);
    }

    fn remove(&mut self, project_id: &str) {
        self.entries.remove(project_id);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Walks project batches: readiness, concurrency cap, cascades.
pub struct Orchestrator {
    store: ProjectStore,
    launcher: Box<dyn DispatchLauncher>,
    notifiers: NotifierSet,
    cache: ProjectCache,
}

impl Orchestrator {
    pub fn new(
        store: ProjectStore,
        launcher: Box<dyn DispatchLauncher>,
        notifiers: NotifierSet,
        cache: ProjectCache,
    ) -> Self {
        Self {
            store,
            launcher,
            notifiers,
            cache,
        }
    }

    pub const fn cache(&self) -> &ProjectCache {
        &self.cache
    }

    /// Register a new batch and run its first scheduling pass.
    ///
    /// An id whose existing batch is still dispatching or paused is
    /// rejected; overwriting it would lose in-flight node state. Settled
    /// batches (completed or stuck) may be re-run.
    pub fn start_project(
        &mut self,
        project_id: &str,
        tasks: &[ProjectTask],
        max_concurrent: usize,
    ) -> Result<ProjectDispatch, DispatchError> {
        let project = build_project(project_id, tasks, max_concurrent);
        let stored = project.clone();
        self.store.update(move |doc| {
            if let Some(existing) = doc.project_dispatches.get(&stored.project_id)
                && !matches!(
                    existing.status,
                    ProjectStatus::Completed | ProjectStatus::Stuck
                )
            {
                return Err(DispatchError::ProjectActive {
                    id: stored.project_id.clone(),
                    status: existing.status,
                });
            }
            doc.project_dispatches
                .insert(stored.project_id.clone(), stored);
            Ok(())
        })?;
        self.cache.put(project.clone());
        tracing::info!(
            project_id,
            issues = project.issues.len(),
            max_concurrent,
            "project dispatch started"
        );
        self.run_scheduling_pass(project_id)?;
        Ok(project)
    }

    /// One scheduling pass: fill free slots with ready nodes.
    ///
    /// Nodes are flagged `dispatched` and persisted before the launcher runs
    /// for any of them, so a crash mid-pass cannot re-dispatch. Returns the
    /// identifiers launched.
    pub fn run_scheduling_pass(&mut self, project_id: &str) -> Result<Vec<String>, DispatchError> {
        let to_launch = self.store.update(|doc| {
            let project = doc
                .project_dispatches
                .get_mut(project_id)
                .ok_or_else(|| DispatchError::ProjectNotFound(project_id.to_string()))?;
            if project.status != ProjectStatus::Dispatching {
                return Ok(Vec::new());
            }
            let slots = project.max_concurrent.saturating_sub(project.active_count());
            if slots == 0 {
                return Ok(Vec::new());
            }
            let picked: Vec<String> = project
                .ready_nodes()
                .into_iter()
                .take(slots)
                .map(|i| i.identifier.clone())
                .collect();
            let mut launches = Vec::with_capacity(picked.len());
            for identifier in &picked {
                if let Some(node) = project.issues.get_mut(identifier) {
                    node.dispatch_status = IssueDispatchStatus::Dispatched;
                    launches.push(node.clone());
                }
            }
            Ok(launches)
        })?;

        self.refresh_cache(project_id)?;

        let mut launched = Vec::with_capacity(to_launch.len());
        for issue in &to_launch {
            tracing::info!(project_id, issue = %issue.identifier, "dispatching issue");
            if let Err(e) = self.launcher.launch(project_id, issue) {
                // The node stays flagged dispatched; the health monitor picks
                // up launches that never came to life.
                tracing::warn!(project_id, issue = %issue.identifier, error = %e, "launch failed");
            }
            launched.push(issue.identifier.clone());
        }
        Ok(launched)
    }

    /// Completion cascade for one issue.
    pub fn handle_issue_completed(
        &mut self,
        project_id: &str,
        identifier: &str,
    ) -> Result<(), DispatchError> {
        let outcome = self.settle_issue(project_id, identifier, IssueDispatchStatus::Done)?;
        self.after_settle(project_id, outcome)
    }

    /// Failure cascade for one issue. Dependents are not cascaded to stuck;
    /// they stay pending until the batch-stuck check proves them unreachable.
    pub fn handle_issue_stuck(
        &mut self,
        project_id: &str,
        identifier: &str,
    ) -> Result<(), DispatchError> {
        let outcome = self.settle_issue(project_id, identifier, IssueDispatchStatus::Stuck)?;
        self.after_settle(project_id, outcome)
    }

    /// Operator hold: paused batches are skipped by scheduling passes.
    pub fn pause(&mut self, project_id: &str) -> Result<(), DispatchError> {
        self.set_status(project_id, ProjectStatus::Paused)?;
        tracing::info!(project_id, "project paused");
        Ok(())
    }

    /// Lift a hold and immediately re-evaluate the batch.
    pub fn resume(&mut self, project_id: &str) -> Result<(), DispatchError> {
        self.set_status(project_id, ProjectStatus::Dispatching)?;
        tracing::info!(project_id, "project resumed");
        let outcome = self.evaluate_batch(project_id)?;
        self.after_settle(project_id, outcome)
    }

    /// Mark one node settled and re-evaluate the batch under the same lock.
    fn settle_issue(
        &mut self,
        project_id: &str,
        identifier: &str,
        status: IssueDispatchStatus,
    ) -> Result<BatchOutcome, DispatchError> {
        let outcome = self.store.update(|doc| {
            let project = doc
                .project_dispatches
                .get_mut(project_id)
                .ok_or_else(|| DispatchError::ProjectNotFound(project_id.to_string()))?;
            let node = project
                .issues
                .get_mut(identifier)
                .ok_or_else(|| DispatchError::NotFound {
                    id: identifier.to_string(),
                })?;
            node.dispatch_status = status;
            if status == IssueDispatchStatus::Done {
                node.completed_at = Some(Utc::now());
            }
            tracing::info!(project_id, issue = identifier, status = ?status, "issue settled");
            Ok(evaluate(project))
        })?;
        self.refresh_cache(project_id)?;
        Ok(outcome)
    }

    /// Re-evaluate a batch without settling a node (used by resume).
    fn evaluate_batch(&self, project_id: &str) -> Result<BatchOutcome, DispatchError> {
        self.store.update(|doc| {
            let project = doc
                .project_dispatches
                .get_mut(project_id)
                .ok_or_else(|| DispatchError::ProjectNotFound(project_id.to_string()))?;
            Ok(evaluate(project))
        })
    }

    fn after_settle(
        &mut self,
        project_id: &str,
        outcome: BatchOutcome,
    ) -> Result<(), DispatchError> {
        match outcome {
            BatchOutcome::Completed => {
                tracing::info!(project_id, "project batch completed");
                self.notifiers.notify(
                    "project_completed",
                    &serde_json::json!({ "projectId": project_id }),
                );
                self.cache.remove(project_id);
            }
            BatchOutcome::Stuck => {
                tracing::warn!(project_id, "project batch stuck, no further progress reachable");
                self.notifiers.notify(
                    "project_stuck",
                    &serde_json::json!({ "projectId": project_id }),
                );
                self.refresh_cache(project_id)?;
            }
            BatchOutcome::InProgress => {
                self.run_scheduling_pass(project_id)?;
            }
            BatchOutcome::Held => {
                self.refresh_cache(project_id)?;
            }
        }
        Ok(())
    }

    fn set_status(&mut self, project_id: &str, status: ProjectStatus) -> Result<(), DispatchError> {
        self.store.update(|doc| {
            let project = doc
                .project_dispatches
                .get_mut(project_id)
                .ok_or_else(|| DispatchError::ProjectNotFound(project_id.to_string()))?;
            project.status = status;
            Ok(())
        })?;
        self.refresh_cache(project_id)
    }

    fn refresh_cache(&mut self, project_id: &str) -> Result<(), DispatchError> {
        if let Some(project) = self.store.get(project_id)? {
            self.cache.put(project);
        } else {
            self.cache.remove(project_id);
        }
        Ok(())
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("store", &self.store)
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

/// What a batch evaluation concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BatchOutcome {
    Completed,
    Stuck,
    InProgress,
    Held,
}

/// Evaluate and record batch-level status after a node change.
///
/// Order matters: completion is checked before stuckness so a batch whose
/// last node went stuck with everything else settled still counts its done
/// work, and a paused batch only records node progress.
fn evaluate(project: &mut ProjectDispatch) -> BatchOutcome {
    if project.status == ProjectStatus::Paused {
        return BatchOutcome::Held;
    }
    if project.is_complete() {
        project.status = ProjectStatus::Completed;
        return BatchOutcome::Completed;
    }
    if project.is_stuck() {
        project.status = ProjectStatus::Stuck;
        return BatchOutcome::Stuck;
    }
    project.status = ProjectStatus::Dispatching;
    BatchOutcome::InProgress
}
