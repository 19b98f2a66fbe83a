//! # Call Event Monitoring
//!
//! Every decoded carrier event, every frame we send back and every turn-state
//! transition is reported as a [`CallRecord`]. Reporting is fire-and-forget: a
//! reporter must never block the session or hand an error back to it.
//!
//! ## Shipped Reporters:
//! - **TracingReporter**: Structured `tracing` events under the `call_events` target
//! - **CallLogReporter**: Same tracing output plus one JSON line per record appended to a
//!   call log file by a background writer task
//!
//! ## Rust Concepts:
//! - **Trait objects**: Sessions hold an `Arc<dyn EventReporter>` and do not care which
//!   reporter is behind it
//! - **Unbounded channel**: `report` only enqueues, so file I/O never stalls a call

use crate::protocol::{EventKind, OutboundFrame};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// What a [`CallRecord`] is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    SessionOpened,
    SessionClosed,
    Connected,
    Start,
    Media,
    Dtmf,
    Mark,
    Clear,
    Stop,
    Unknown,
    Malformed,
    MediaEcho,
    DtmfAck,
    MarkAck,
    ClearAck,
    Transition,
}

impl From<EventKind> for RecordKind {
    fn from(kind: EventKind) -> Self {
        match kind {
            EventKind::Connected => RecordKind::Connected,
            EventKind::Start => RecordKind::Start,
            EventKind::Media => RecordKind::Media,
            EventKind::Dtmf => RecordKind::Dtmf,
            EventKind::Mark => RecordKind::Mark,
            EventKind::Clear => RecordKind::Clear,
            EventKind::Stop => RecordKind::Stop,
            EventKind::Unknown => RecordKind::Unknown,
        }
    }
}

impl From<&OutboundFrame> for RecordKind {
    fn from(frame: &OutboundFrame) -> Self {
        match frame {
            OutboundFrame::MediaEcho { .. } => RecordKind::MediaEcho,
            OutboundFrame::DtmfAck { .. } => RecordKind::DtmfAck,
            OutboundFrame::MarkAck { .. } => RecordKind::MarkAck,
            OutboundFrame::ClearAck { .. } => RecordKind::ClearAck,
        }
    }
}

/// One entry in a call's event timeline.
#[derive(Debug, Clone, Serialize)]
pub struct CallRecord {
    pub timestamp: DateTime<Utc>,
    pub kind: RecordKind,
    pub connection_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_sid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub call_sid: Option<String>,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub details: Value,
}

impl CallRecord {
    pub fn new(kind: RecordKind, connection_id: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
            connection_id: connection_id.into(),
            stream_sid: None,
            call_sid: None,
            details: Value::Null,
        }
    }

    pub fn identity(mut self, stream_sid: Option<&str>, call_sid: Option<&str>) -> Self {
        self.stream_sid = stream_sid.map(str::to_string);
        self.call_sid = call_sid.map(str::to_string);
        self
    }

    pub fn details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }
}

/// Receiver of call records.
pub trait EventReporter: Send + Sync {
    fn report(&self, record: CallRecord);
}

/// Writes records to the tracing subscriber.
#[derive(Debug, Default, Clone)]
pub struct TracingReporter;

impl EventReporter for TracingReporter {
    fn report(&self, record: CallRecord) {
        let stream_sid = record.stream_sid.as_deref().unwrap_or("-");
        match record.kind {
            // Audio frames arrive ~50 times a second, keep them out of the default log level
            RecordKind::Media | RecordKind::MediaEcho => debug!(
                target: "call_events",
                kind = ?record.kind,
                connection_id = %record.connection_id,
                stream_sid = %stream_sid,
                details = %record.details,
                "call event"
            ),
            RecordKind::Unknown | RecordKind::Malformed => warn!(
                target: "call_events",
                kind = ?record.kind,
                connection_id = %record.connection_id,
                stream_sid = %stream_sid,
                details = %record.details,
                "call event"
            ),
            _ => info!(
                target: "call_events",
                kind = ?record.kind,
                connection_id = %record.connection_id,
                stream_sid = %stream_sid,
                call_sid = %record.call_sid.as_deref().unwrap_or("-"),
                details = %record.details,
                "call event"
            ),
        }
    }
}

/// Appends every record as a JSON line to a call log file.
///
/// ## How it works:
/// 1. `spawn` makes sure the log directory exists and starts a writer task
/// 2. `report` traces the record and pushes it onto an unbounded channel
/// 3. The writer task opens the file in append mode and writes one line per record
///
/// When the writer fails (disk full, permissions) it logs the error and keeps
/// draining the channel so callers are never affected.
#[derive(Debug, Clone)]
pub struct CallLogReporter {
    tx: mpsc::UnboundedSender<CallRecord>,
    tracing: TracingReporter,
}

impl CallLogReporter {
    /// Start the background writer. Must be called from within a tokio runtime.
    pub fn spawn(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(write_call_log(path, rx));

        Ok(Self { tx, tracing: TracingReporter })
    }
}

impl EventReporter for CallLogReporter {
    fn report(&self, record: CallRecord) {
        self.tracing.report(record.clone());
        if self.tx.send(record).is_err() {
            debug!("Call log writer has shut down, record dropped");
        }
    }
}

async fn write_call_log(path: PathBuf, mut rx: mpsc::UnboundedReceiver<CallRecord>) {
    let mut file = match tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .await
    {
        Ok(file) => file,
        Err(err) => {
            error!("Cannot open call log {}: {}", path.display(), err);
            // Drain so senders never notice
            while rx.recv().await.is_some() {}
            return;
        }
    };

    info!("Call log writing to {}", path.display());

    while let Some(record) = rx.recv().await {
        let mut line = match serde_json::to_string(&record) {
            Ok(line) => line,
            Err(err) => {
                error!("Cannot serialize call record: {}", err);
                continue;
            }
        };
        line.push('\n');

        if let Err(err) = file.write_all(line.as_bytes()).await {
            error!("Call log write to {} failed: {}", path.display(), err);
        }
    }

    let _ = file.flush().await;
}
