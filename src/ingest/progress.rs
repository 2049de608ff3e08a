//! Non-blocking ingestion progress events.
//!
//! The coordinator emits one event per stage transition; the transport
//! layer subscribes through the receiver. Emission never blocks the
//! pipeline: events go through an unbounded channel and are dropped
//! silently once every receiver is gone.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::tenant::TenantId;

/// Pipeline stage a document is currently in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestStage {
    Claimed,
    Fetching,
    Ocr,
    Chunking,
    Embedding,
    Indexing,
    Completed,
    Failed,
    Cancelled,
}

impl IngestStage {
    /// Rough completion percentage for transport progress bars.
    #[must_use]
    pub fn percent(self) -> u8 {
        match self {
            Self::Claimed => 0,
            Self::Fetching => 10,
            Self::Ocr => 30,
            Self::Chunking => 50,
            Self::Embedding => 70,
            Self::Indexing => 90,
            Self::Completed => 100,
            Self::Failed | Self::Cancelled => 100,
        }
    }
}

/// One progress observation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub tenant: TenantId,
    pub document_id: String,
    pub stage: IngestStage,
    pub percent: u8,
    pub when: DateTime<Utc>,
}

/// Emitter handle held by the coordinator.
#[derive(Clone)]
pub struct ProgressReporter {
    tx: flume::Sender<ProgressEvent>,
}

impl ProgressReporter {
    /// Create a reporter with its subscription side.
    #[must_use]
    pub fn channel() -> (Self, flume::Receiver<ProgressEvent>) {
        let (tx, rx) = flume::unbounded();
        (Self { tx }, rx)
    }

    /// Emit a stage transition. Never blocks; drops the event when no
    /// subscriber is listening.
    pub fn emit(&self, tenant: &TenantId, document_id: &str, stage: IngestStage) {
        let event = ProgressEvent {
            tenant: tenant.clone(),
            document_id: document_id.to_string(),
            stage,
            percent: stage.percent(),
            when: Utc::now(),
        };
        let _ = self.tx.try_send(event);
    }
}
