//! Progress events streamed to an observer while a run executes.
//!
//! # Why a channel instead of callbacks?
//!
//! The orchestrator only ever *sends an event* — it knows nothing about how
//! the host application delivers progress (SSE, WebSocket, log line, progress
//! bar). A bounded `tokio::sync::mpsc` channel decouples the two completely,
//! and `try_send` guarantees a slow or disconnected observer can never stall
//! the pipeline: when the buffer is full or the receiver is gone the event is
//! dropped with a debug log.
//!
//! Events are immutable once emitted. Ordering within one run is the emission
//! order; events from concurrent runs interleave freely (match on
//! `document_id`).

use crate::model::{RunStatus, Tier};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

/// One progress event. Emitted before each tier starts and once on its
/// completion or failure; a terminal event (percent 100) closes every run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingProgress {
    pub document_id: String,
    /// Tier the event refers to; `None` for queue/merge/terminal events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tier: Option<Tier>,
    pub status: RunStatus,
    /// Fixed per-tier percentages: 10→30 (tier 1), 40→60 (tier 2),
    /// 70→90 (tier 3), 100 on merge.
    pub percent: u8,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Write-only handle the orchestrator uses to emit events.
///
/// Cloneable and cheap; a sink built without a sender is a silent no-op so
/// call sites never branch on "is progress enabled".
#[derive(Clone)]
pub struct ProgressSink {
    document_id: String,
    tx: Option<mpsc::Sender<ProcessingProgress>>,
}

impl ProgressSink {
    pub fn new(document_id: impl Into<String>, tx: mpsc::Sender<ProcessingProgress>) -> Self {
        Self {
            document_id: document_id.into(),
            tx: Some(tx),
        }
    }

    /// A sink that discards everything.
    pub fn disabled(document_id: impl Into<String>) -> Self {
        Self {
            document_id: document_id.into(),
            tx: None,
        }
    }

    /// Emit one event. Never blocks and never fails the caller.
    pub fn emit(&self, tier: Option<Tier>, status: RunStatus, percent: u8, message: impl Into<String>) {
        let Some(tx) = &self.tx else { return };
        let event = ProcessingProgress {
            document_id: self.document_id.clone(),
            tier,
            status,
            percent,
            message: message.into(),
            timestamp: Utc::now(),
        };
        if let Err(e) = tx.try_send(event) {
            // Observer is slow or gone; processing must not stall.
            debug!(document_id = %self.document_id, "progress event dropped: {e}");
        }
    }
}

/// Adapt a progress receiver into a `Stream`, for consumers that compose
/// progress with other event sources (SSE endpoints, `select!` loops).
pub fn progress_stream(
    rx: mpsc::Receiver<ProcessingProgress>,
) -> impl futures::Stream<Item = ProcessingProgress> {
    tokio_stream::wrappers::ReceiverStream::new(rx)
}
