//! Notification router. Fans a transfer notice out to every target.
//! Lightweight: no queues. Delivery failures are logged and dropped.

use async_trait::async_trait;
use leadflow_core::config::NotifyConfig;
use leadflow_core::error::Result;
use leadflow_core::traits::notifier::{AuditNotifier, TransferNotice};
use std::sync::Mutex;
use std::time::Duration;

use crate::dispatch::{self, NotifyTarget};

/// Notice router with a bounded in-memory history.
pub struct NotifyRouter {
    targets: Vec<(String, NotifyTarget)>,
    history: Mutex<Vec<TransferNotice>>,
    history_size: usize,
    timeout: Duration,
}

impl NotifyRouter {
    pub fn new() -> Self {
        Self {
            targets: Vec::new(),
            history: Mutex::new(Vec::new()),
            history_size: 100,
            timeout: Duration::from_secs(10),
        }
    }

    pub fn from_config(config: &NotifyConfig) -> Self {
        Self {
            targets: dispatch::targets_from_config(config),
            history: Mutex::new(Vec::new()),
            history_size: config.history_size.max(1),
            timeout: Duration::from_secs(config.timeout_secs.max(1)),
        }
    }

    /// Register a named delivery target.
    pub fn register_target(&mut self, name: &str, target: NotifyTarget) {
        self.targets.push((name.to_string(), target));
    }

    pub fn target_names(&self) -> Vec<&str> {
        self.targets.iter().map(|(n, _)| n.as_str()).collect()
    }

    /// Record a notice in history.
    pub fn record(&self, notice: TransferNotice) {
        if let Ok(mut history) = self.history.lock() {
            history.push(notice);
            // ring buffer, keep the newest
            let overflow = history.len().saturating_sub(self.history_size);
            if overflow > 0 {
                history.drain(..overflow);
            }
        }
    }

    /// Notice history, oldest first.
    pub fn history(&self) -> Vec<TransferNotice> {
        self.history.lock().map(|h| h.clone()).unwrap_or_default()
    }
}

impl Default for NotifyRouter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AuditNotifier for NotifyRouter {
    fn name(&self) -> &str {
        "router"
    }

    async fn notify(&self, notice: &TransferNotice) -> Result<()> {
        self.record(notice.clone());
        let sends = self
            .targets
            .iter()
            .map(|(_, target)| dispatch::dispatch(notice, target, self.timeout));
        let results = futures::future::join_all(sends).await;
        for ((name, _), result) in self.targets.iter().zip(results) {
            if let Err(e) = result {
                tracing::warn!("⚠️ Notice to {} via {} failed: {}", notice.user_id, name, e);
            }
        }
        Ok(())
    }
}
