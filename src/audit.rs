//! Audit logging for changes applied to the live host
//!
//! Every command the CLI sends to `iptables` on behalf of a reconciliation is
//! recorded here, successful or not.
use crate::core::error::Result;
use crate::core::exec::Executor;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

/// Types of auditable events
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    InsertRule,
    ReplaceRule,
    DeleteRule,
    PersistRules,
}

/// A single audit log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// When the event occurred (UTC)
    pub timestamp: chrono::DateTime<chrono::Utc>,

    /// Type of event
    pub event_type: EventType,

    /// Whether the operation succeeded
    pub success: bool,

    /// Additional structured data about the event
    pub details: serde_json::Value,

    /// Error message if operation failed
    pub error: Option<String>,
}

impl AuditEvent {
    /// Creates a new audit event
    pub fn new(
        event_type: EventType,
        success: bool,
        details: serde_json::Value,
        error: Option<String>,
    ) -> Self {
        Self {
            timestamp: chrono::Utc::now(),
            event_type,
            success,
            details,
            error,
        }
    }
}

/// Audit log writer
pub struct AuditLog {
    log_path: PathBuf,
}

impl AuditLog {
    /// Creates a new audit log instance in the state directory
    ///
    /// # Errors
    ///
    /// Returns `Err` if state directory cannot be determined
    pub fn new() -> std::io::Result<Self> {
        let mut log_path = crate::utils::get_state_dir().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, "State directory not found")
        })?;
        log_path.push("audit.log");

        Ok(Self { log_path })
    }

    /// Audit log at an explicit path
    pub fn at(log_path: PathBuf) -> Self {
        Self { log_path }
    }

    /// Appends an event to the audit log
    ///
    /// Events are written as JSON-lines format (one JSON object per line)
    ///
    /// # Errors
    ///
    /// Returns `Err` if file cannot be opened or written
    pub async fn log(&self, event: AuditEvent) -> std::io::Result<()> {
        let json = serde_json::to_string(&event)?;

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .await?;

        file.write_all(json.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.sync_all().await?;

        Ok(())
    }

    /// Reads the most recent events from the log, newest first
    ///
    /// # Errors
    ///
    /// Returns `Err` if file cannot be read
    pub async fn read_recent(&self, count: usize) -> std::io::Result<Vec<AuditEvent>> {
        let content = tokio::fs::read_to_string(&self.log_path).await?;

        let events: Vec<AuditEvent> = content
            .lines()
            .rev()
            .take(count)
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect();

        Ok(events)
    }
}

impl AuditLog {
    /// Logs one `iptables` command issued for a rule
    ///
    /// # Arguments
    ///
    /// * `event_type` - Which kind of change the command makes
    /// * `rule` - Name of the rule the command is for
    /// * `args` - Arguments passed to `iptables`
    /// * `error` - Error message if the command failed
    pub async fn log_change(
        &self,
        event_type: EventType,
        rule: &str,
        args: &[String],
        error: Option<String>,
    ) {
        let event = AuditEvent::new(
            event_type,
            error.is_none(),
            serde_json::json!({
                "rule": rule,
                "args": args,
            }),
            error,
        );

        if let Err(e) = self.log(event).await {
            tracing::warn!("Failed to write audit log: {}", e);
        }
    }

    /// Logs a persist of the full rule set
    pub async fn log_persist(&self, path: Option<&Path>, error: Option<String>) {
        let event = AuditEvent::new(
            EventType::PersistRules,
            error.is_none(),
            serde_json::json!({ "path": path }),
            error,
        );

        if let Err(e) = self.log(event).await {
            tracing::warn!("Failed to write audit log: {}", e);
        }
    }
}

/// Kind of change an `iptables` argument list makes, if any.
fn event_type_for(args: &[String]) -> Option<EventType> {
    args.iter().find_map(|arg| match arg.as_str() {
        "-I" => Some(EventType::InsertRule),
        "-R" => Some(EventType::ReplaceRule),
        "-D" => Some(EventType::DeleteRule),
        _ => None,
    })
}

/// Rule name carried by the `--comment` argument.
fn rule_name(args: &[String]) -> &str {
    args.iter()
        .position(|arg| arg == "--comment")
        .and_then(|i| args.get(i + 1))
        .map_or("", String::as_str)
}

/// [`Executor`] that records every change made through `inner`
pub struct AuditedExecutor<E> {
    inner: E,
    log: AuditLog,
    persist_path: Option<PathBuf>,
}

impl<E: Executor> AuditedExecutor<E> {
    pub fn new(inner: E, log: AuditLog, persist_path: Option<PathBuf>) -> Self {
        Self {
            inner,
            log,
            persist_path,
        }
    }

    pub fn inner(&self) -> &E {
        &self.inner
    }
}

impl<E: Executor> Executor for AuditedExecutor<E> {
    async fn run(&self, args: &[String]) -> Result<String> {
        let result = self.inner.run(args).await;
        if let Some(event_type) = event_type_for(args) {
            let error = result.as_ref().err().map(ToString::to_string);
            self.log
                .log_change(event_type, rule_name(args), args, error)
                .await;
        }
        result
    }

    async fn save(&self) -> Result<String> {
        self.inner.save().await
    }

    async fn persist(&self) -> Result<()> {
        let result = self.inner.persist().await;
        let error = result.as_ref().err().map(ToString::to_string);
        self.log
            .log_persist(self.persist_path.as_deref(), error)
            .await;
        result
    }
}
