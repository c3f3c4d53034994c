//! # API REST
//!
//! REST surface of the laboratory interface relay.
//!
//! Handles:
//! - HTTP endpoints with axum
//! - OpenAPI/Swagger documentation
//! - REST-specific concerns (JSON serialization, CORS)
//!
//! Business errors never become 500s here: the service reports them in the
//! response body (JSON `{ok, error}` or a protocol-level negative ack) and
//! the HTTP status only reflects transport-level success.

#![warn(rust_2018_idioms)]

use axum::{
    extract::{Path as AxumPath, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use lir_core::{
    AckRequest, AuthHeaders, InterfaceService, JobDirection, JobQuery,
    JobState, ReconciliationReport, ReplayBatch,
};
use lir_types::{AckCode, MessageKind};
use tower_http::cors::CorsLayer;
use utoipa::{IntoParams, OpenApi, ToSchema};
use utoipa_swagger_ui::SwaggerUi;

/// Application state shared by all request handlers.
#[derive(Clone)]
pub struct AppState {
    pub service: InterfaceService,
}

#[derive(OpenApi)]
#[openapi(
    paths(
        health,
        inbound_structured,
        inbound_raw,
        outbound_ack,
        list_jobs,
        cancel_job,
        list_audit,
        run_replay,
        run_reconciliation,
        run_escalation,
    ),
    components(schemas(
        HealthRes,
        InboundReq,
        IngestRes,
        AckReq,
        AckRes,
        JobRes,
        AuditRes,
        ReplayReq,
        ReplayRes,
        ReplayLineRes,
        ReconciliationReq,
        ReconciliationRes,
        SummaryLineRes,
        MismatchRes,
        EscalationRes,
    ))
)]
struct ApiDoc;

/// Builds the relay's REST router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/lab/interface/inbound/:endpoint_code", post(inbound_structured))
        .route("/lab/interface/inbound/:endpoint_code/raw", post(inbound_raw))
        .route("/lab/interface/outbound/:endpoint_code/ack", post(outbound_ack))
        .route("/lab/interface/jobs", get(list_jobs))
        .route("/lab/interface/jobs/:job_id/cancel", post(cancel_job))
        .route("/lab/interface/audit", get(list_audit))
        .route("/lab/interface/escalation", post(run_escalation))
        .route("/lab/interface/replay", post(run_replay))
        .route("/lab/interface/reconciliation", post(run_reconciliation))
        .merge(
            SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()),
        )
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[derive(serde::Serialize, ToSchema)]
struct HealthRes {
    ok: bool,
    message: String,
}

#[derive(serde::Deserialize, ToSchema)]
struct InboundReq {
    /// Message kind: order, result, report, ack, patient or qc.
    message_type: String,
    #[schema(value_type = Object)]
    payload: serde_json::Value,
    external_uid: Option<String>,
    /// Original wire text, kept on the job as its raw snapshot.
    raw_message: Option<String>,
}

#[derive(serde::Serialize, ToSchema)]
struct IngestRes {
    ok: bool,
    ack_code: Option<String>,
    job_id: Option<String>,
    job_name: Option<String>,
    state: Option<String>,
    error: Option<String>,
}

impl IngestRes {
    fn error(message: String) -> Self {
        Self {
            ok: false,
            ack_code: None,
            job_id: None,
            job_name: None,
            state: None,
            error: Some(message),
        }
    }
}

impl From<lir_core::IngestResponse> for IngestRes {
    fn from(r: lir_core::IngestResponse) -> Self {
        Self {
            ok: r.ok,
            ack_code: r.ack_code.map(|c| c.as_str().to_string()),
            job_id: r.job_id.map(|id| id.to_string()),
            job_name: r.job_name,
            state: r.state.map(|s| s.as_str().to_string()),
            error: r.error,
        }
    }
}

#[derive(serde::Deserialize, ToSchema)]
struct AckReq {
    /// AA, AE or AR.
    ack_code: String,
    job_id: Option<uuid::Uuid>,
    job_name: Option<String>,
    external_uid: Option<String>,
    message: Option<String>,
    #[schema(value_type = Object)]
    payload: Option<serde_json::Value>,
}

#[derive(serde::Serialize, ToSchema)]
struct AckRes {
    ok: bool,
    error: Option<String>,
}

#[derive(serde::Serialize, ToSchema)]
struct JobRes {
    id: String,
    name: String,
    endpoint_id: String,
    direction: String,
    message_type: String,
    state: String,
    ack_code: Option<String>,
    error_message: Option<String>,
    dead_letter_reason: Option<String>,
    external_uid: Option<String>,
    entity_ref: Option<String>,
    retry_count: u32,
    created_at: String,
    processed_at: Option<String>,
}

impl From<lir_core::InterfaceJob> for JobRes {
    fn from(job: lir_core::InterfaceJob) -> Self {
        Self {
            id: job.id.to_string(),
            name: job.name,
            endpoint_id: job.endpoint_id.to_string(),
            direction: job.direction.as_str().to_string(),
            message_type: job.message_type.as_str().to_string(),
            state: job.state.as_str().to_string(),
            ack_code: job.ack_code.map(|c| c.as_str().to_string()),
            error_message: job.error_message,
            dead_letter_reason: job.dead_letter_reason,
            external_uid: job.external_uid,
            entity_ref: job.entity_ref,
            retry_count: job.retry_count,
            created_at: job.created_at.to_rfc3339(),
            processed_at: job.processed_at.map(|t| t.to_rfc3339()),
        }
    }
}

#[derive(serde::Serialize, ToSchema)]
struct AuditRes {
    id: String,
    action: String,
    direction: String,
    endpoint_id: String,
    job_id: Option<String>,
    external_uid: Option<String>,
    source_ip: Option<String>,
    result: Option<String>,
    state: Option<String>,
    actor: String,
    at: String,
}

impl From<lir_core::AuditEntry> for AuditRes {
    fn from(entry: lir_core::AuditEntry) -> Self {
        Self {
            id: entry.id.to_string(),
            action: entry.action.as_str().to_string(),
            direction: entry.direction.as_str().to_string(),
            endpoint_id: entry.endpoint_id.to_string(),
            job_id: entry.job_id.map(|id| id.to_string()),
            external_uid: entry.external_uid,
            source_ip: entry.source_ip,
            result: entry.result,
            state: entry.state,
            actor: entry.actor,
            at: entry.at.to_rfc3339(),
        }
    }
}

#[derive(serde::Deserialize, IntoParams)]
struct JobsQuery {
    /// Filter by endpoint code.
    endpoint_code: Option<String>,
    /// Filter by job state (pending, processing, done, failed, dead_letter,
    /// cancel).
    state: Option<String>,
    /// Filter by direction (inbound, outbound).
    direction: Option<String>,
}

#[derive(serde::Deserialize, IntoParams)]
struct AuditQuery {
    endpoint_id: Option<uuid::Uuid>,
    job_id: Option<uuid::Uuid>,
}

#[derive(serde::Deserialize, ToSchema)]
struct ReplayReq {
    reason: String,
    endpoint_code: Option<String>,
    include_failed: Option<bool>,
    include_dead_letter: Option<bool>,
    /// RFC 3339 lower bound on job creation time.
    from: Option<String>,
    /// RFC 3339 upper bound on job creation time.
    to: Option<String>,
}

#[derive(serde::Serialize, ToSchema)]
struct ReplayRes {
    id: String,
    state: String,
    lines: Vec<ReplayLineRes>,
}

#[derive(serde::Serialize, ToSchema)]
struct ReplayLineRes {
    job_id: String,
    job_name: String,
    previous_state: String,
    outcome: Option<String>,
    note: Option<String>,
}

#[derive(serde::Deserialize, ToSchema)]
struct ReconciliationReq {
    endpoint_code: Option<String>,
    /// RFC 3339 period start; defaults to 24 hours ago.
    from: Option<String>,
    /// RFC 3339 period end; defaults to now.
    to: Option<String>,
}

#[derive(serde::Serialize, ToSchema)]
struct ReconciliationRes {
    id: String,
    from: String,
    to: String,
    summary: Vec<SummaryLineRes>,
    mismatches: Vec<MismatchRes>,
}

#[derive(serde::Serialize, ToSchema)]
struct SummaryLineRes {
    label: String,
    expected: u64,
    actual: u64,
}

#[derive(serde::Serialize, ToSchema)]
struct MismatchRes {
    entity_ref: String,
    kind: String,
    note: String,
}

#[derive(serde::Serialize, ToSchema)]
struct EscalationRes {
    /// Ids of the jobs moved to dead letter by this sweep.
    escalated: Vec<String>,
}

/// Pulls the relay's authentication material out of the request headers.
fn auth_headers(headers: &HeaderMap) -> AuthHeaders {
    AuthHeaders {
        authorization: headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
        api_key: headers
            .get("x-api-key")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
    }
}

/// Source IP as reported by the proxy in front of us.
fn source_ip(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_state(s: &str) -> Option<JobState> {
    match s {
        "pending" => Some(JobState::Pending),
        "processing" => Some(JobState::Processing),
        "done" => Some(JobState::Done),
        "failed" => Some(JobState::Failed),
        "dead_letter" => Some(JobState::DeadLetter),
        "cancel" => Some(JobState::Cancel),
        _ => None,
    }
}

fn parse_rfc3339(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Health check response", body = HealthRes)
    )
)]
/// Health check endpoint used by monitoring and load balancers.
#[axum::debug_handler]
async fn health(State(_state): State<AppState>) -> Json<HealthRes> {
    Json(HealthRes { ok: true, message: "laboratory interface relay is alive".into() })
}

#[utoipa::path(
    post,
    path = "/lab/interface/inbound/{endpoint_code}",
    request_body = InboundReq,
    params(("endpoint_code" = String, Path, description = "Endpoint code")),
    responses(
        (status = 200, description = "Ingestion outcome", body = IngestRes)
    )
)]
/// Ingest a structured (JSON) inbound message.
///
/// Always answers 200 with the outcome in the body: resolution and
/// authorisation failures come back as `{ok: false, error}` with the same
/// error tokens the raw entry point maps to HTTP statuses.
#[axum::debug_handler]
async fn inbound_structured(
    State(state): State<AppState>,
    AxumPath(endpoint_code): AxumPath<String>,
    headers: HeaderMap,
    Json(req): Json<InboundReq>,
) -> Json<IngestRes> {
    let kind = match MessageKind::parse(&req.message_type) {
        Ok(kind) => kind,
        Err(err) => return Json(IngestRes::error(err.to_string())),
    };

    let result = state.service.ingest_structured(
        &endpoint_code,
        &auth_headers(&headers),
        source_ip(&headers),
        kind,
        req.payload,
        req.external_uid,
        req.raw_message,
    );
    match result {
        Ok(response) => Json(response.into()),
        Err(err) => Json(IngestRes::error(err.to_string())),
    }
}

#[utoipa::path(
    post,
    path = "/lab/interface/inbound/{endpoint_code}/raw",
    request_body = String,
    params(("endpoint_code" = String, Path, description = "Endpoint code")),
    responses(
        (status = 200, description = "Protocol-level acknowledgement"),
        (status = 400, description = "Malformed message, negative acknowledgement"),
        (status = 401, description = "Unauthorized"),
        (status = 403, description = "Direction or source not allowed"),
        (status = 404, description = "Unknown endpoint")
    )
)]
/// Ingest a raw wire message and answer in the endpoint's protocol.
///
/// HL7 endpoints get a `text/plain` ACK, FHIR endpoints an OperationOutcome,
/// anything else a JSON echo of the ingestion outcome.
#[axum::debug_handler]
async fn inbound_raw(
    State(state): State<AppState>,
    AxumPath(endpoint_code): AxumPath<String>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let wire = state.service.ingest_raw(
        &endpoint_code,
        &auth_headers(&headers),
        source_ip(&headers),
        &body,
    );
    (
        StatusCode::from_u16(wire.status).unwrap_or(StatusCode::BAD_REQUEST),
        [(header::CONTENT_TYPE, wire.content_type)],
        wire.body,
    )
        .into_response()
}

#[utoipa::path(
    post,
    path = "/lab/interface/outbound/{endpoint_code}/ack",
    request_body = AckReq,
    params(("endpoint_code" = String, Path, description = "Endpoint code")),
    responses(
        (status = 200, description = "Acknowledgement registration outcome", body = AckRes)
    )
)]
/// Register a remote acknowledgement for an outbound job.
#[axum::debug_handler]
async fn outbound_ack(
    State(state): State<AppState>,
    AxumPath(endpoint_code): AxumPath<String>,
    headers: HeaderMap,
    Json(req): Json<AckReq>,
) -> Json<AckRes> {
    let ack_code = match AckCode::parse(&req.ack_code) {
        Ok(code) => code,
        Err(err) => return Json(AckRes { ok: false, error: Some(err.to_string()) }),
    };
    let request = AckRequest {
        ack_code: Some(ack_code),
        job_id: req.job_id,
        job_name: req.job_name,
        external_uid: req.external_uid,
        message: req.message,
        payload: req.payload,
    };

    let result = state.service.register_outbound_ack(
        &endpoint_code,
        &auth_headers(&headers),
        source_ip(&headers),
        &request,
    );
    match result {
        Ok(response) => Json(AckRes { ok: response.ok, error: response.error }),
        Err(err) => Json(AckRes { ok: false, error: Some(err.to_string()) }),
    }
}

#[utoipa::path(
    get,
    path = "/lab/interface/jobs",
    params(JobsQuery),
    responses(
        (status = 200, description = "Interface jobs matching the filter", body = [JobRes])
    )
)]
/// List interface jobs, filterable by endpoint, state and direction.
#[axum::debug_handler]
async fn list_jobs(
    State(state): State<AppState>,
    Query(params): Query<JobsQuery>,
) -> Result<Json<Vec<JobRes>>, (StatusCode, &'static str)> {
    let endpoint_id = match params.endpoint_code.as_deref() {
        Some(code) => {
            match state
                .service
                .endpoint_repository()
                .find_active_by_code(code)
            {
                Ok(Some(endpoint)) => Some(endpoint.id),
                // Unknown endpoint filter matches nothing.
                Ok(None) => return Ok(Json(Vec::new())),
                Err(err) => {
                    tracing::error!("endpoint lookup error: {err}");
                    return Err((StatusCode::INTERNAL_SERVER_ERROR, "Internal error"));
                }
            }
        }
        None => None,
    };

    let query = JobQuery {
        endpoint_id,
        direction: params.direction.as_deref().and_then(|d| match d {
            "inbound" => Some(JobDirection::Inbound),
            "outbound" => Some(JobDirection::Outbound),
            _ => None,
        }),
        states: params
            .state
            .as_deref()
            .and_then(parse_state)
            .map(|s| vec![s])
            .unwrap_or_default(),
        ..Default::default()
    };
    match state.service.list_jobs(&query) {
        Ok(jobs) => Ok(Json(jobs.into_iter().map(JobRes::from).collect())),
        Err(err) => {
            tracing::error!("job query error: {err}");
            Err((StatusCode::INTERNAL_SERVER_ERROR, "Internal error"))
        }
    }
}

#[utoipa::path(
    post,
    path = "/lab/interface/jobs/{job_id}/cancel",
    params(("job_id" = uuid::Uuid, Path, description = "Interface job id")),
    responses(
        (status = 200, description = "Cancelled job", body = JobRes),
        (status = 400, description = "Unknown job or terminal state")
    )
)]
/// Cancel a job that has not reached a terminal state.
#[axum::debug_handler]
async fn cancel_job(
    State(state): State<AppState>,
    AxumPath(job_id): AxumPath<uuid::Uuid>,
) -> Result<Json<JobRes>, (StatusCode, String)> {
    match state.service.cancel_job(job_id) {
        Ok(job) => Ok(Json(job.into())),
        Err(err) => Err((StatusCode::BAD_REQUEST, err.to_string())),
    }
}

#[utoipa::path(
    get,
    path = "/lab/interface/audit",
    params(AuditQuery),
    responses(
        (status = 200, description = "Audit entries matching the filter", body = [AuditRes])
    )
)]
/// List audit trail entries, optionally filtered by endpoint or job.
#[axum::debug_handler]
async fn list_audit(
    State(state): State<AppState>,
    Query(params): Query<AuditQuery>,
) -> Result<Json<Vec<AuditRes>>, (StatusCode, &'static str)> {
    match state.service.list_audit(params.endpoint_id, params.job_id) {
        Ok(entries) => Ok(Json(entries.into_iter().map(AuditRes::from).collect())),
        Err(err) => {
            tracing::error!("audit query error: {err}");
            Err((StatusCode::INTERNAL_SERVER_ERROR, "Internal error"))
        }
    }
}

#[utoipa::path(
    post,
    path = "/lab/interface/replay",
    request_body = ReplayReq,
    responses(
        (status = 200, description = "Replay batch executed", body = ReplayRes),
        (status = 400, description = "Invalid replay request")
    )
)]
/// Prepare and execute a replay batch over failed and dead-lettered jobs.
#[axum::debug_handler]
async fn run_replay(
    State(state): State<AppState>,
    Json(req): Json<ReplayReq>,
) -> Result<Json<ReplayRes>, (StatusCode, String)> {
    let mut batch = ReplayBatch::new(&req.reason);
    if let Some(include_failed) = req.include_failed {
        batch.include_failed = include_failed;
    }
    if let Some(include_dead_letter) = req.include_dead_letter {
        batch.include_dead_letter = include_dead_letter;
    }
    batch.from = req.from.as_deref().and_then(parse_rfc3339);
    batch.to = req.to.as_deref().and_then(parse_rfc3339);
    if let Some(code) = req.endpoint_code.as_deref() {
        match state.service.endpoint_repository().find_active_by_code(code) {
            Ok(Some(endpoint)) => batch.endpoint_id = Some(endpoint.id),
            Ok(None) => return Err((StatusCode::BAD_REQUEST, "unknown endpoint code".into())),
            Err(err) => {
                tracing::error!("endpoint lookup error: {err}");
                return Err((StatusCode::INTERNAL_SERVER_ERROR, "Internal error".into()));
            }
        }
    }

    batch
        .prepare(&*state.service.job_repository())
        .map_err(|err| (StatusCode::BAD_REQUEST, err.to_string()))?;
    batch
        .execute(&state.service)
        .map_err(|err| (StatusCode::BAD_REQUEST, err.to_string()))?;

    Ok(Json(ReplayRes {
        id: batch.id.to_string(),
        state: format!("{:?}", batch.state).to_lowercase(),
        lines: batch
            .lines
            .into_iter()
            .map(|line| ReplayLineRes {
                job_id: line.job_id.to_string(),
                job_name: line.job_name,
                previous_state: line.previous_state.as_str().to_string(),
                outcome: line.outcome.map(|s| s.as_str().to_string()),
                note: line.note,
            })
            .collect(),
    }))
}

#[utoipa::path(
    post,
    path = "/lab/interface/escalation",
    responses(
        (status = 200, description = "Dead-letter sweep outcome", body = EscalationRes)
    )
)]
/// Move failed jobs that have exhausted their retry budget to dead letter.
///
/// The binary runs this sweep on a timer; the route lets an operator force
/// one between ticks.
#[axum::debug_handler]
async fn run_escalation(
    State(state): State<AppState>,
) -> Result<Json<EscalationRes>, (StatusCode, &'static str)> {
    match state.service.run_escalation() {
        Ok(ids) => Ok(Json(EscalationRes {
            escalated: ids.into_iter().map(|id| id.to_string()).collect(),
        })),
        Err(err) => {
            tracing::error!("escalation sweep error: {err}");
            Err((StatusCode::INTERNAL_SERVER_ERROR, "Internal error"))
        }
    }
}

#[utoipa::path(
    post,
    path = "/lab/interface/reconciliation",
    request_body = ReconciliationReq,
    responses(
        (status = 200, description = "Reconciliation report", body = ReconciliationRes),
        (status = 400, description = "Invalid reconciliation request")
    )
)]
/// Generate a read-only reconciliation report for a period.
#[axum::debug_handler]
async fn run_reconciliation(
    State(state): State<AppState>,
    Json(req): Json<ReconciliationReq>,
) -> Result<Json<ReconciliationRes>, (StatusCode, String)> {
    let to = req
        .to
        .as_deref()
        .and_then(parse_rfc3339)
        .unwrap_or_else(Utc::now);
    let from = req
        .from
        .as_deref()
        .and_then(parse_rfc3339)
        .unwrap_or_else(|| to - chrono::Duration::hours(24));

    let endpoint_id = match req.endpoint_code.as_deref() {
        Some(code) => {
            match state.service.endpoint_repository().find_active_by_code(code) {
                Ok(Some(endpoint)) => Some(endpoint.id),
                Ok(None) => return Err((StatusCode::BAD_REQUEST, "unknown endpoint code".into())),
                Err(err) => {
                    tracing::error!("endpoint lookup error: {err}");
                    return Err((StatusCode::INTERNAL_SERVER_ERROR, "Internal error".into()));
                }
            }
        }
        None => None,
    };

    let report = ReconciliationReport::generate(
        &*state.service.job_repository(),
        &*state.service.domain_gateway(),
        endpoint_id,
        from,
        to,
    )
    .map_err(|err| (StatusCode::BAD_REQUEST, err.to_string()))?;

    Ok(Json(ReconciliationRes {
        id: report.id.to_string(),
        from: report.from.to_rfc3339(),
        to: report.to.to_rfc3339(),
        summary: report
            .summary
            .into_iter()
            .map(|line| SummaryLineRes {
                label: line.label,
                expected: line.expected,
                actual: line.actual,
            })
            .collect(),
        mismatches: report
            .mismatches
            .into_iter()
            .map(|line| MismatchRes {
                entity_ref: line.entity_ref,
                kind: line.kind.as_str().to_string(),
                note: line.note,
            })
            .collect(),
    }))
}
