//! Conductor - Orchestration core for issue-driven agent dispatch pipelines

pub mod commands;
pub mod config;
pub mod dag;
pub mod error;
pub mod lock;
pub mod monitor;
pub mod notify;
pub mod probe;
pub mod store;
pub mod telemetry;
pub mod transition;
