//! Reconciliation reports.
//!
//! A read-only comparison of what the domain expected to go out against
//! what the relay actually exchanged in a period. Generating a report
//! mutates nothing; its findings feed operators, who act through replay
//! batches or manual requeues.

use crate::domain::DomainGateway;
use crate::job::{JobDirection, JobState};
use crate::repository::{JobQuery, JobRepository};
use crate::LabResult;
use chrono::{DateTime, Utc};
use lir_types::MessageKind;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One expected-versus-actual count.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SummaryLine {
    pub label: String,
    pub expected: u64,
    pub actual: u64,
}

/// One expected domain event with no matching completed outbound job.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MismatchLine {
    pub entity_ref: String,
    pub kind: MessageKind,
    pub note: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReconciliationReport {
    pub id: Uuid,
    pub endpoint_id: Option<Uuid>,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub generated_at: DateTime<Utc>,
    pub summary: Vec<SummaryLine>,
    pub mismatches: Vec<MismatchLine>,
}

impl ReconciliationReport {
    pub fn generate(
        jobs: &dyn JobRepository,
        gateway: &dyn DomainGateway,
        endpoint_id: Option<Uuid>,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> LabResult<Self> {
        let outbound = jobs.query(&JobQuery {
            endpoint_id,
            direction: Some(JobDirection::Outbound),
            from: Some(from),
            to: Some(to),
            ..Default::default()
        })?;
        let inbound = jobs.query(&JobQuery {
            endpoint_id,
            direction: Some(JobDirection::Inbound),
            from: Some(from),
            to: Some(to),
            ..Default::default()
        })?;

        let outbound_done = outbound.iter().filter(|j| j.state == JobState::Done).count();
        let inbound_done = inbound.iter().filter(|j| j.state == JobState::Done).count();

        let expected = gateway.expected_outbound_events(from, to);
        let delivered_refs: Vec<&str> = outbound
            .iter()
            .filter(|j| j.state == JobState::Done)
            .filter_map(|j| j.entity_ref.as_deref())
            .collect();

        let mut mismatches = Vec::new();
        let mut matched = 0u64;
        for event in &expected {
            if delivered_refs.contains(&event.entity_ref.as_str()) {
                matched += 1;
            } else {
                mismatches.push(MismatchLine {
                    entity_ref: event.entity_ref.clone(),
                    kind: event.kind,
                    note: "expected delivery has no completed outbound job".into(),
                });
            }
        }

        let summary = vec![
            SummaryLine {
                label: "outbound jobs".into(),
                expected: outbound.len() as u64,
                actual: outbound_done as u64,
            },
            SummaryLine {
                label: "inbound jobs".into(),
                expected: inbound.len() as u64,
                actual: inbound_done as u64,
            },
            SummaryLine {
                label: "report deliveries".into(),
                expected: expected.len() as u64,
                actual: matched,
            },
        ];

        Ok(Self {
            id: Uuid::new_v4(),
            endpoint_id,
            from,
            to,
            generated_at: Utc::now(),
            summary,
            mismatches,
        })
    }
}
