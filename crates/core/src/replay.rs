//! Replay batches.
//!
//! An operator-facing bulk recovery tool: snapshot the failed and
//! dead-lettered jobs matching a filter, then requeue each exactly once.
//! Lines succeed or fail independently; the batch state only records that
//! execution has run, never whether every line recovered.

use crate::job::JobState;
use crate::pipeline::InterfaceService;
use crate::repository::{JobQuery, JobRepository};
use crate::{LabError, LabResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayState {
    Draft,
    Prepared,
    Executed,
}

/// One job snapshotted into a batch, with its per-line outcome.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReplayLine {
    pub job_id: Uuid,
    pub job_name: String,
    pub previous_state: JobState,
    /// Job state after the replay attempt; `None` until executed.
    pub outcome: Option<JobState>,
    pub note: Option<String>,
}

/// A prepared-then-executed bulk replay of failed work.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReplayBatch {
    pub id: Uuid,
    pub reason: String,
    pub endpoint_id: Option<Uuid>,
    pub include_failed: bool,
    pub include_dead_letter: bool,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub state: ReplayState,
    pub lines: Vec<ReplayLine>,
    pub prepared_at: Option<DateTime<Utc>>,
    pub executed_at: Option<DateTime<Utc>>,
}

impl ReplayBatch {
    pub fn new(reason: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            reason: reason.to_string(),
            endpoint_id: None,
            include_failed: true,
            include_dead_letter: true,
            from: None,
            to: None,
            state: ReplayState::Draft,
            lines: Vec::new(),
            prepared_at: None,
            executed_at: None,
        }
    }

    /// Snapshots the matching failed/dead-letter jobs into lines.
    ///
    /// Only non-terminal failure states are ever selected, so a replay can
    /// never touch a `done` or cancelled job.
    pub fn prepare(&mut self, jobs: &dyn JobRepository) -> LabResult<()> {
        if self.state != ReplayState::Draft {
            return Err(LabError::InvalidInput(format!(
                "replay batch is {:?}, expected draft",
                self.state
            )));
        }

        let mut states = Vec::new();
        if self.include_failed {
            states.push(JobState::Failed);
        }
        if self.include_dead_letter {
            states.push(JobState::DeadLetter);
        }
        if states.is_empty() {
            return Err(LabError::InvalidInput(
                "replay batch must include failed or dead-letter jobs".into(),
            ));
        }

        let query = JobQuery {
            endpoint_id: self.endpoint_id,
            states,
            from: self.from,
            to: self.to,
            ..Default::default()
        };
        self.lines = jobs
            .query(&query)?
            .into_iter()
            .map(|job| ReplayLine {
                job_id: job.id,
                job_name: job.name,
                previous_state: job.state,
                outcome: None,
                note: None,
            })
            .collect();
        self.state = ReplayState::Prepared;
        self.prepared_at = Some(Utc::now());
        info!(batch = %self.id, lines = self.lines.len(), "replay batch prepared");
        Ok(())
    }

    /// Requeues and re-attempts every line exactly once.
    ///
    /// A line whose job has moved on since preparation (or whose attempt
    /// fails again) records its outcome and the batch carries on.
    pub fn execute(&mut self, service: &InterfaceService) -> LabResult<()> {
        if self.state != ReplayState::Prepared {
            return Err(LabError::InvalidInput(format!(
                "replay batch is {:?}, expected prepared",
                self.state
            )));
        }

        for line in &mut self.lines {
            match service.requeue_job(line.job_id) {
                Ok(job) => {
                    line.outcome = Some(job.state);
                    line.note = job.error_message;
                }
                Err(err) => {
                    line.note = Some(err.to_string());
                }
            }
        }
        self.state = ReplayState::Executed;
        self.executed_at = Some(Utc::now());
        info!(batch = %self.id, lines = self.lines.len(), "replay batch executed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoreConfig;
    use crate::domain::{DeliveryTransport, DomainGateway};
    use crate::endpoint::{Direction, Endpoint, Protocol};
    use crate::memory::{
        InMemoryAuditLog, InMemoryDomainGateway, InMemoryEndpointRegistry, InMemoryJobStore,
        SimulatedTransport,
    };
    use crate::pipeline::InterfaceService;
    use lir_types::{MessageKind, OrderLine, OrderPayload, Payload};
    use std::sync::Arc;

    struct Fixture {
        service: InterfaceService,
        transport: Arc<SimulatedTransport>,
    }

    fn fixture(transport: SimulatedTransport) -> Fixture {
        let transport = Arc::new(transport);
        let service = InterfaceService::new(
            Arc::new(InMemoryEndpointRegistry::with_endpoints(vec![Endpoint::new(
                "EXT1",
                Direction::Outbound,
                Protocol::Hl7v2,
            )])),
            Arc::new(InMemoryJobStore::new()),
            Arc::new(InMemoryAuditLog::new()),
            Arc::new(InMemoryDomainGateway::with_defaults()) as Arc<dyn DomainGateway>,
            Arc::clone(&transport) as Arc<dyn DeliveryTransport>,
            CoreConfig::default(),
        );
        Fixture { service, transport }
    }

    fn order_payload() -> Payload {
        Payload::Order(OrderPayload {
            lines: vec![OrderLine { service_code: "GLU".into(), qty: 1 }],
            ..Default::default()
        })
    }

    #[test]
    fn prepare_selects_only_failed_and_dead_letter_jobs() {
        let fx = fixture(SimulatedTransport::failing("down"));

        let failed = fx
            .service
            .enqueue_outbound("EXT1", MessageKind::Order, &order_payload(), None)
            .expect("enqueue");
        fx.service.process_job(failed.id).expect("process");

        fx.transport.now_accepting();
        let done = fx
            .service
            .enqueue_outbound("EXT1", MessageKind::Order, &order_payload(), None)
            .expect("enqueue");
        fx.service.process_job(done.id).expect("process");

        let mut batch = ReplayBatch::new("network outage on 2026-08-20");
        batch.prepare(&*fx.service.job_repository()).expect("prepare");

        assert_eq!(batch.state, ReplayState::Prepared);
        assert_eq!(batch.lines.len(), 1);
        assert_eq!(batch.lines[0].job_id, failed.id);
        assert_eq!(batch.lines[0].previous_state, JobState::Failed);
    }

    #[test]
    fn execute_requeues_each_line_once_and_records_outcomes() {
        let fx = fixture(SimulatedTransport::failing("down"));
        let job = fx
            .service
            .enqueue_outbound("EXT1", MessageKind::Order, &order_payload(), None)
            .expect("enqueue");
        fx.service.process_job(job.id).expect("process");

        let mut batch = ReplayBatch::new("retry after remote recovered");
        batch.prepare(&*fx.service.job_repository()).expect("prepare");

        fx.transport.now_accepting();
        batch.execute(&fx.service).expect("execute");

        assert_eq!(batch.state, ReplayState::Executed);
        assert_eq!(batch.lines[0].outcome, Some(JobState::Done));

        let stored = fx
            .service
            .job_repository()
            .get(job.id)
            .expect("get")
            .expect("present");
        assert_eq!(stored.retry_count, 1);
        // The failed attempt never reached the remote; only the replay did.
        assert_eq!(fx.transport.delivered_bodies().len(), 1);
    }

    #[test]
    fn lines_fail_independently_without_stopping_the_batch() {
        let fx = fixture(SimulatedTransport::failing("down"));
        let first = fx
            .service
            .enqueue_outbound("EXT1", MessageKind::Order, &order_payload(), None)
            .expect("enqueue");
        fx.service.process_job(first.id).expect("process");
        let second = fx
            .service
            .enqueue_outbound("EXT1", MessageKind::Order, &order_payload(), None)
            .expect("enqueue");
        fx.service.process_job(second.id).expect("process");

        let mut batch = ReplayBatch::new("still down");
        batch.prepare(&*fx.service.job_repository()).expect("prepare");
        batch.execute(&fx.service).expect("execute");

        assert_eq!(batch.state, ReplayState::Executed);
        assert_eq!(batch.lines.len(), 2);
        for line in &batch.lines {
            assert_eq!(line.outcome, Some(JobState::Failed));
            assert_eq!(line.note.as_deref(), Some("down"));
        }
    }

    #[test]
    fn lifecycle_enforces_draft_then_prepared_then_executed() {
        let fx = fixture(SimulatedTransport::accepting());
        let mut batch = ReplayBatch::new("ordering check");

        assert!(batch.execute(&fx.service).is_err());
        batch.prepare(&*fx.service.job_repository()).expect("prepare");
        assert!(batch.prepare(&*fx.service.job_repository()).is_err());
        batch.execute(&fx.service).expect("execute");
        assert!(batch.execute(&fx.service).is_err());
    }

    #[test]
    fn a_batch_must_include_at_least_one_failure_state() {
        let fx = fixture(SimulatedTransport::accepting());
        let mut batch = ReplayBatch::new("empty filter");
        batch.include_failed = false;
        batch.include_dead_letter = false;
        assert!(batch.prepare(&*fx.service.job_repository()).is_err());
    }
}
