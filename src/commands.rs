//! Operator-facing commands for the `conductor` bin.
//!
//! These are thin renderings over the library surface: they load config,
//! build the store/engine, run one operation, and print. Failures come back
//! as distinguishable errors so the exit code and message can say whether
//! the id was unknown, the status was wrong, or something else broke.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Context;
use clap::Args;

use crate::config::Config;
use crate::error::DispatchError;
use crate::monitor::HealthMonitor;
use crate::probe::GitProbe;
use crate::store::{DispatchRecord, NewDispatch, StateStore};
use crate::transition::{DispatchStatus, TransitionEngine};

fn load_config() -> anyhow::Result<Config> {
    let cwd = std::env::current_dir().context("determining working directory")?;
    Config::load(&cwd)
}

fn open_store(config: &Config) -> StateStore {
    StateStore::new(config.dispatch_store_path(), config.lock_manager())
}

fn parse_status(s: &str) -> anyhow::Result<DispatchStatus> {
    s.parse().map_err(|e: String| anyhow::anyhow!(e))
}

#[derive(Debug, Args)]
pub struct MonitorArgs {
    /// Seconds between sweeps (overrides config).
    #[arg(long)]
    interval: Option<u64>,
    /// Run a single sweep and exit.
    #[arg(long)]
    once: bool,
}

impl MonitorArgs {
    pub fn execute(self) -> anyhow::Result<()> {
        let config = load_config()?;
        let engine = TransitionEngine::new(open_store(&config));
        let monitor = HealthMonitor::new(engine, GitProbe, config.thresholds());

        if self.once {
            let report = monitor.tick()?;
            println!(
                "stale: {}  zombies: {}  pruned: {}  conflicts: {}",
                report.stale.len(),
                report.zombies.len(),
                report.pruned,
                report.conflicts
            );
            return Ok(());
        }

        let interval = self
            .interval
            .map_or_else(|| config.monitor_interval(), std::time::Duration::from_secs);
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);
        ctrlc::set_handler(move || flag.store(true, Ordering::Relaxed))
            .context("installing signal handler")?;
        monitor.run(interval, &shutdown);
        Ok(())
    }
}

#[derive(Debug, Args)]
pub struct StatusArgs {}

impl StatusArgs {
    pub fn execute(self) -> anyhow::Result<()> {
        let config = load_config()?;
        let store = open_store(&config);

        let by_status = store.counts_by_status()?;
        if by_status.is_empty() {
            println!("no active dispatches");
        } else {
            println!("by status:");
            for (status, count) in &by_status {
                println!("  {status}: {count}");
            }
            println!("by tier:");
            for (tier, count) in store.counts_by_tier()? {
                println!("  {tier}: {count}");
            }
        }
        Ok(())
    }
}

#[derive(Debug, Args)]
pub struct ListArgs {
    /// Filter by status (dispatched, working, auditing, stuck, ...).
    #[arg(long)]
    status: Option<String>,
    /// Filter by tier.
    #[arg(long)]
    tier: Option<String>,
    /// List completed dispatches instead of active ones.
    #[arg(long)]
    completed: bool,
}

impl ListArgs {
    pub fn execute(self) -> anyhow::Result<()> {
        let config = load_config()?;
        let store = open_store(&config);

        let status = self.status.as_deref().map(parse_status).transpose()?;
        if self.completed {
            for (id, d) in store.list_completed(status, self.tier.as_deref())? {
                println!(
                    "{id}\t{}\t{}\tattempts={}\tcompleted={}",
                    d.status, d.tier, d.total_attempts, d.completed_at
                );
            }
            return Ok(());
        }


        for d in store.list_active(status, self.tier.as_deref())? {
            let reason = d
                .stuck_reason
                .as_deref()
                .map(|r| format!("\t({r})"))
                .unwrap_or_default();
            println!(
                "{}\t{}\t{}\tattempt={}{reason}",
                d.id, d.status, d.tier, d.attempt
            );
        }
        Ok(())
    }
}

#[derive(Debug, Args)]
pub struct ShowArgs {
    id: String,
}

impl ShowArgs {
    pub fn execute(self) -> anyhow::Result<()> {
        let config = load_config()?;
        let store = open_store(&config);
        match store.get(&self.id)? {
            Some(DispatchRecord::Active(d)) => {
                println!("{}", serde_json::to_string_pretty(&d)?);
                Ok(())
            }
            Some(DispatchRecord::Completed(d)) => {
                println!("{}", serde_json::to_string_pretty(&d)?);
                Ok(())
            }
            None => Err(DispatchError::NotFound { id: self.id }.into()),
        }
    }
}

#[derive(Debug, Args)]
pub struct RegisterArgs {
    id: String,
    #[arg(long)]
    tier: Option<String>,
    #[arg(long)]
    model: Option<String>,
    #[arg(long)]
    worktree: PathBuf,
}

impl RegisterArgs {
    pub fn execute(self) -> anyhow::Result<()> {
        let config = load_config()?;
        let store = open_store(&config);
        let dispatch = store.register(NewDispatch {
            id: self.id,
            tier: self.tier.unwrap_or_else(|| config.dispatch.default_tier.clone()),
            model: self
                .model
                .unwrap_or_else(|| config.dispatch.default_model.clone()),
            worktree_path: self.worktree,
        })?;
        println!("registered {} ({})", dispatch.id, dispatch.tier);
        Ok(())
    }
}

#[derive(Debug, Args)]
pub struct RetryArgs {
    id: String,
}

impl RetryArgs {
    pub fn execute(self) -> anyhow::Result<()> {
        let config = load_config()?;
        let dispatch = open_store(&config).retry(&self.id)?;
        println!("retrying {} (attempt {})", dispatch.id, dispatch.attempt);
        Ok(())
    }
}

#[derive(Debug, Args)]
pub struct EscalateArgs {
    id: String,
    #[arg(long)]
    reason: String,
}

impl EscalateArgs {
    pub fn execute(self) -> anyhow::Result<()> {
        let config = load_config()?;
        let engine = TransitionEngine::new(open_store(&config));
        let dispatch = engine.escalate(&self.id, &self.reason)?;
        println!("escalated {} to stuck", dispatch.id);
        Ok(())
    }
}

#[derive(Debug, Args)]
pub struct CancelArgs {
    id: String,
}

impl CancelArgs {
    pub fn execute(self) -> anyhow::Result<()> {
        let config = load_config()?;
        let dispatch = open_store(&config).remove(&self.id)?;
        println!("cancelled {} (was {})", dispatch.id, dispatch.status);
        Ok(())
    }
}
