//! Host-side lifecycle reporting.
//!
//! Translates the callbacks an orchestration run goes through (play start,
//! per-task and per-item outcomes, final per-host stats) into relay events.
//! Every event carries the reporting machine's hostname and, once a play has
//! started, its name and id. Task failures are counted so the closing
//! `playbook-end` event reports `OK` or `FAILED`.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::domain::{Event, EventKind};
use crate::relay::{EventSink, RelayError};

/// Outcome label carried in the `status` field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Status {
    Ok,
    Failed,
    Unreachable,
    Skipped,
    Retry,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Failed => "FAILED",
            Self::Unreachable => "UNREACHABLE",
            Self::Skipped => "SKIPPED",
            Self::Retry => "RETRY",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of running one task (or loop item) against one host
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    /// Managed host the task ran against
    pub target_host: String,

    /// Task description
    pub task: String,

    /// Raw module result, relayed as compact JSON text
    #[serde(default)]
    pub result: serde_json::Value,
}

impl TaskResult {
    pub fn new(target_host: impl Into<String>, task: impl Into<String>) -> Self {
        Self {
            target_host: target_host.into(),
            task: task.into(),
            result: serde_json::Value::Null,
        }
    }

    pub fn with_result(mut self, result: serde_json::Value) -> Self {
        self.result = result;
        self
    }
}

/// Per-host counters reported when the playbook finishes
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostStats {
    #[serde(default)]
    pub ok: u32,
    #[serde(default)]
    pub changed: u32,
    #[serde(default)]
    pub failures: u32,
    #[serde(default)]
    pub unreachable: u32,
    #[serde(default)]
    pub skipped: u32,
}

#[derive(Debug, Default)]
struct PlayInfo {
    name: Option<String>,
    id: Option<String>,
}

/// Turns lifecycle callbacks into events on an `EventSink`
pub struct LifecycleReporter<S> {
    sink: S,
    hostname: String,
    play: Mutex<PlayInfo>,
    failures: AtomicU32,
}

impl<S: EventSink> LifecycleReporter<S> {
    /// Create a reporter stamping events with the local hostname
    pub fn new(sink: S) -> Self {
        Self::with_hostname(sink, local_hostname())
    }

    pub fn with_hostname(sink: S, hostname: impl Into<String>) -> Self {
        Self {
            sink,
            hostname: hostname.into(),
            play: Mutex::new(PlayInfo::default()),
            failures: AtomicU32::new(0),
        }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Number of task failures counted so far
    pub fn failures(&self) -> u32 {
        self.failures.load(Ordering::SeqCst)
    }

    pub async fn play_started(
        &self,
        name: impl Into<String>,
        id: impl Into<String>,
    ) -> Result<(), RelayError> {
        {
            let mut play = self.play.lock().await;
            play.name = Some(name.into());
            play.id = Some(id.into());
        }

        let event = self.base(EventKind::PlayStart, Status::Ok).await;
        self.sink.publish(&event).await
    }

    pub async fn task_ok(&self, result: &TaskResult) -> Result<(), RelayError> {
        self.task_outcome(EventKind::TaskOk, Status::Ok, result).await
    }

    pub async fn task_failed(&self, result: &TaskResult) -> Result<(), RelayError> {
        self.failures.fetch_add(1, Ordering::SeqCst);
        self.task_outcome(EventKind::TaskFailed, Status::Failed, result).await
    }

    pub async fn task_unreachable(&self, result: &TaskResult) -> Result<(), RelayError> {
        self.failures.fetch_add(1, Ordering::SeqCst);
        self.task_outcome(EventKind::TaskUnreachable, Status::Unreachable, result)
            .await
    }

    /// A background (async) task failed; reported as an ordinary task failure
    pub async fn task_async_failed(&self, result: &TaskResult) -> Result<(), RelayError> {
        self.task_failed(result).await
    }

    pub async fn item_ok(&self, result: &TaskResult) -> Result<(), RelayError> {
        self.task_outcome(EventKind::ItemOk, Status::Ok, result).await
    }

    pub async fn item_failed(&self, result: &TaskResult) -> Result<(), RelayError> {
        self.task_outcome(EventKind::ItemFailed, Status::Failed, result).await
    }

    pub async fn item_skipped(&self, result: &TaskResult) -> Result<(), RelayError> {
        self.task_outcome(EventKind::ItemSkipped, Status::Skipped, result).await
    }

    pub async fn item_retry(&self, result: &TaskResult) -> Result<(), RelayError> {
        self.task_outcome(EventKind::ItemRetry, Status::Retry, result).await
    }

    /// Report per-host stats (sorted by host) followed by the playbook summary.
    ///
    /// Returns the summary status.
    pub async fn stats(&self, per_host: &BTreeMap<String, HostStats>) -> Result<Status, RelayError> {
        for (host, stats) in per_host {
            let event = self
                .base_without_status(EventKind::HostStats)
                .await
                .with_field("target_host", host)
                .with_field("ok", stats.ok)
                .with_field("changed", stats.changed)
                .with_field("failures", stats.failures)
                .with_field("unreachable", stats.unreachable)
                .with_field("skipped", stats.skipped);
            self.sink.publish(&event).await?;
        }

        let failures = self.failures();
        let status = if failures > 0 { Status::Failed } else { Status::Ok };

        let event = self
            .base(EventKind::PlaybookEnd, status)
            .await
            .with_field("failures", failures);
        self.sink.publish(&event).await?;

        info!(failures, status = %status, "Playbook finished");
        Ok(status)
    }

    async fn task_outcome(
        &self,
        kind: EventKind,
        status: Status,
        result: &TaskResult,
    ) -> Result<(), RelayError> {
        let event = self
            .base(kind, status)
            .await
            .with_field("target_host", &result.target_host)
            .with_field("task", &result.task)
            .with_field("result", result.result.to_string());
        self.sink.publish(&event).await
    }

    async fn base(&self, kind: EventKind, status: Status) -> Event {
        self.base_without_status(kind)
            .await
            .with_field("status", status.as_str())
    }

    async fn base_without_status(&self, kind: EventKind) -> Event {
        let play = self.play.lock().await;
        Event::new(kind, self.sink.session())
            .with_field("host", &self.hostname)
            .with_optional_field("playbook_name", play.name.as_deref())
            .with_optional_field("playbook_id", play.id.as_deref())
    }
}

fn local_hostname() -> String {
    match nix::unistd::gethostname() {
        Ok(name) => name.to_string_lossy().into_owned(),
        Err(e) => {
            warn!(error = %e, "Could not determine hostname");
            "localhost".to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_labels() {
        assert_eq!(Status::Ok.to_string(), "OK");
        assert_eq!(Status::Unreachable.as_str(), "UNREACHABLE");
        assert_eq!(
            serde_json::to_string(&Status::Retry).unwrap(),
            "\"RETRY\""
        );
    }

    #[test]
    fn test_host_stats_defaults_missing_counters() {
        let stats: HostStats = serde_json::from_str(r#"{"ok": 3, "failures": 1}"#).unwrap();
        assert_eq!(stats.ok, 3);
        assert_eq!(stats.failures, 1);
        assert_eq!(stats.changed, 0);
    }

    #[test]
    fn test_local_hostname_not_empty() {
        assert!(!local_hostname().is_empty());
    }
}
