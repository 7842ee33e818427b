//! Outbound notifications.
//!
//! Notification delivery is fire-and-forget: a failing target is logged and
//! skipped, never propagated to the caller, so a flaky chat webhook cannot
//! break a transition or a scheduling pass.

use serde_json::Value;

/// One notification target.
pub trait Notifier: Send + Sync {
    fn notify(&self, event: &str, payload: &Value) -> anyhow::Result<()>;
}

/// Fans a notification out to every configured target, isolating failures
/// per target.
#[derive(Default)]
pub struct NotifierSet {
    targets: Vec<Box<dyn Notifier>>,
}

impl NotifierSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, target: Box<dyn Notifier>) -> Self {
        self.targets.push(target);
        self
    }

    pub fn notify(&self, event: &str, payload: &Value) {
        for target in &self.targets {
            if let Err(e) = target.notify(event, payload) {
                tracing::warn!(event, error = %e, "notification target failed");
            }
        }
    }
}

impl std::fmt::Debug for NotifierSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotifierSet")
            .field("targets", &self.targets.len())
            .finish()
    }
}

/// Default target: structured log lines.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, event: &str, payload: &Value) -> anyhow::Result<()> {
        tracing::info!(event, %payload, "notification");
        Ok(())
    }
}
