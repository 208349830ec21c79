//! Rebuild state machine as published to callers.

use crate::corpus::RunMode;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RebuildState {
    Idle,
    Running,
    /// Finished without doing anything (no new events).
    Warning,
    Success,
    /// Index rebuilt on disk but not swapped into the running process.
    SuccessWithWarning,
    Error,
}

impl RebuildState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, RebuildState::Idle | RebuildState::Running)
    }
}

/// Counters gathered over one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub events_fetched: u64,
    /// Agenda and event payloads that failed validation.
    pub records_rejected: u64,
    pub events_filtered_by_date: u64,
    pub failed_agendas: u64,
    pub duplicates_deleted: u64,
    pub thin_events_deleted: u64,
    pub events_processed: u64,
    pub chunks_created: u64,
    pub backups: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RebuildStatus {
    pub state: RebuildState,
    pub message: String,
    /// Identifies one rebuild across status updates and log lines.
    pub run_id: Option<Uuid>,
    pub mode: Option<RunMode>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Watermark of the most recent recorded run.
    pub last_watermark: Option<DateTime<Utc>>,
    pub details: Option<RunSummary>,
}

impl RebuildStatus {
    pub fn idle(last_watermark: Option<DateTime<Utc>>) -> Self {
        Self {
            state: RebuildState::Idle,
            message: "no rebuild has run since startup".into(),
            run_id: None,
            mode: None,
            started_at: None,
            finished_at: None,
            last_watermark,
            details: None,
        }
    }

    pub(crate) fn running(mode: RunMode, started_at: DateTime<Utc>, last_watermark: Option<DateTime<Utc>>) -> Self {
        Self {
            state: RebuildState::Running,
            message: format!("{} rebuild started", mode.as_str()),
            run_id: Some(Uuid::new_v4()),
            mode: Some(mode),
            started_at: Some(started_at),
            finished_at: None,
            last_watermark,
            details: None,
        }
    }

    /// Terminal transition; keeps mode and start time.
    pub(crate) fn finish(&self, state: RebuildState, message: impl Into<String>) -> Self {
        Self {
            state,
            message: message.into(),
            finished_at: Some(Utc::now()),
            ..self.clone()
        }
    }
}
