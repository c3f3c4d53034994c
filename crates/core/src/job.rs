//! Interface job state machine.
//!
//! A job is the durable record of one message exchange. State moves only
//! through the methods here; `done` and `cancel` are final, and the only
//! way back from `failed`/`dead_letter` is an explicit requeue.

use crate::{LabError, LabResult};
use chrono::{DateTime, Utc};
use lir_types::{AckCode, MessageKind};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// Direction of one job (endpoints may be bidirectional, jobs never are).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobDirection {
    Inbound,
    Outbound,
}

impl JobDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inbound => "inbound",
            Self::Outbound => "outbound",
        }
    }
}

/// Lifecycle state of an interface job.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Processing,
    Done,
    Failed,
    DeadLetter,
    Cancel,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Cancel)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::DeadLetter => "dead_letter",
            Self::Cancel => "cancel",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One message exchange: an inbound message processed, or an outbound
/// message attempted. Never hard-deleted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InterfaceJob {
    pub id: Uuid,
    /// Operator-facing reference, also used by remote ack matching.
    pub name: String,
    pub endpoint_id: Uuid,
    pub direction: JobDirection,
    pub message_type: MessageKind,
    pub state: JobState,
    pub ack_code: Option<AckCode>,
    pub error_message: Option<String>,
    pub dead_letter_reason: Option<String>,
    /// Canonical payload snapshot at ingest/enqueue time.
    pub payload: serde_json::Value,
    /// Raw wire text, when the message arrived over the raw entry point.
    pub raw_message: Option<String>,
    pub external_uid: Option<String>,
    pub source_ip: Option<String>,
    /// Loose reference to the domain entity this exchange touched.
    pub entity_ref: Option<String>,
    pub ack_received_at: Option<DateTime<Utc>>,
    pub ack_source_ip: Option<String>,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

static JOB_SEQ: AtomicU64 = AtomicU64::new(1);

fn next_job_name(now: DateTime<Utc>) -> String {
    let seq = JOB_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("IFJ/{}-{}", now.format("%Y%m%d%H%M%S"), seq)
}

impl InterfaceJob {
    pub fn new_inbound(
        endpoint_id: Uuid,
        message_type: MessageKind,
        payload: serde_json::Value,
        external_uid: Option<String>,
        source_ip: Option<String>,
        raw_message: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: next_job_name(now),
            endpoint_id,
            direction: JobDirection::Inbound,
            message_type,
            state: JobState::Pending,
            ack_code: None,
            error_message: None,
            dead_letter_reason: None,
            payload,
            raw_message,
            external_uid,
            source_ip,
            entity_ref: None,
            ack_received_at: None,
            ack_source_ip: None,
            retry_count: 0,
            created_at: now,
            processed_at: None,
        }
    }

    pub fn new_outbound(
        endpoint_id: Uuid,
        message_type: MessageKind,
        payload: serde_json::Value,
        entity_ref: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: next_job_name(now),
            endpoint_id,
            direction: JobDirection::Outbound,
            message_type,
            state: JobState::Pending,
            ack_code: None,
            error_message: None,
            dead_letter_reason: None,
            payload,
            raw_message: None,
            external_uid: None,
            source_ip: None,
            entity_ref,
            ack_received_at: None,
            ack_source_ip: None,
            retry_count: 0,
            created_at: now,
            processed_at: None,
        }
    }

    /// `pending` → `processing`.
    pub fn start_processing(&mut self) -> LabResult<()> {
        match self.state {
            JobState::Pending => {
                self.state = JobState::Processing;
                Ok(())
            }
            from => Err(LabError::InvalidTransition { from, action: "process" }),
        }
    }

    /// `processing` → `done`, with the acknowledgement outcome.
    ///
    /// `AE` marks a business rejection: received and understood, just not
    /// actionable. That is a terminal success of transport, not a failure.
    pub fn complete(&mut self, ack_code: AckCode, error_message: Option<String>) -> LabResult<()> {
        match self.state {
            JobState::Processing => {
                self.state = JobState::Done;
                self.ack_code = Some(ack_code);
                self.error_message = error_message;
                self.dead_letter_reason = None;
                self.processed_at = Some(Utc::now());
                Ok(())
            }
            from => Err(LabError::InvalidTransition { from, action: "complete" }),
        }
    }

    /// `pending`/`processing` → `failed`. Retry stays explicit: the count
    /// only moves on requeue.
    pub fn fail(&mut self, ack_code: AckCode, message: &str) -> LabResult<()> {
        match self.state {
            JobState::Pending | JobState::Processing => {
                self.state = JobState::Failed;
                self.ack_code = Some(ack_code);
                self.error_message = Some(message.to_string());
                self.processed_at = Some(Utc::now());
                Ok(())
            }
            from => Err(LabError::InvalidTransition { from, action: "fail" }),
        }
    }

    /// `failed`/`dead_letter` → `pending`; increments the retry count and
    /// clears the previous failure.
    pub fn requeue(&mut self) -> LabResult<()> {
        match self.state {
            JobState::Failed | JobState::DeadLetter => {
                self.state = JobState::Pending;
                self.retry_count += 1;
                self.error_message = None;
                self.dead_letter_reason = None;
                self.ack_code = None;
                Ok(())
            }
            from => Err(LabError::InvalidTransition { from, action: "requeue" }),
        }
    }

    /// `failed` → `dead_letter`; requires explicit requeue to move again.
    pub fn escalate_to_dead_letter(&mut self, reason: &str) -> LabResult<()> {
        match self.state {
            JobState::Failed => {
                self.state = JobState::DeadLetter;
                self.dead_letter_reason = Some(reason.to_string());
                Ok(())
            }
            from => Err(LabError::InvalidTransition { from, action: "escalate" }),
        }
    }

    /// Any non-terminal state → `cancel`, final.
    pub fn cancel(&mut self) -> LabResult<()> {
        match self.state {
            JobState::Done | JobState::Cancel => {
                Err(LabError::InvalidTransition { from: self.state, action: "cancel" })
            }
            _ => {
                self.state = JobState::Cancel;
                Ok(())
            }
        }
    }

    /// Applies a remote delivery acknowledgement to an outbound job.
    ///
    /// `AA` completes a still-open job. `AE`/`AR` fail a still-open job. On
    /// a job already `done` the code and message are recorded without
    /// reopening it: `done` is final, and the negative outcome lives in
    /// `ack_code`/`error_message` the same way inbound rejections do.
    pub fn record_remote_ack(
        &mut self,
        ack_code: AckCode,
        message: &str,
        source_ip: Option<String>,
    ) -> LabResult<()> {
        if self.direction != JobDirection::Outbound {
            return Err(LabError::InvalidInput(
                "only outbound jobs accept remote acknowledgements".into(),
            ));
        }
        if self.state == JobState::Cancel {
            return Err(LabError::InvalidTransition { from: self.state, action: "ack" });
        }

        self.ack_received_at = Some(Utc::now());
        self.ack_source_ip = source_ip;

        match ack_code {
            AckCode::Aa => {
                self.ack_code = Some(AckCode::Aa);
                if self.state != JobState::Done {
                    self.state = JobState::Done;
                    self.error_message = None;
                    self.dead_letter_reason = None;
                    self.processed_at = Some(Utc::now());
                }
            }
            AckCode::Ae | AckCode::Ar => {
                self.ack_code = Some(ack_code);
                if self.state == JobState::Done {
                    self.error_message = Some(message.to_string());
                } else {
                    self.state = JobState::Failed;
                    self.error_message = Some(message.to_string());
                    self.processed_at = Some(Utc::now());
                }
            }
        }
        Ok(())
    }
}
