//! Resource-level validation and translation.

use crate::{FhirError, FhirResult};
use lir_types::{
    CanonicalMessage, MessageKind, OrderLine, OrderPayload, Payload, ResultLine, ResultPayload,
};
use serde_json::{json, Value};
use std::collections::BTreeMap;

/// Coding system stamped into generated resources.
const SERVICE_CODING_SYSTEM: &str = "urn:lir:lab:service";

/// Name used when an inbound order carries no usable patient display.
const EXTERNAL_PATIENT: &str = "External Patient";

/// FHIR codec operations.
///
/// Zero-sized namespacing type; all methods are associated functions.
pub struct Fhir;

impl Fhir {
    /// Parses raw JSON text and translates it into a canonical message.
    pub fn parse_text(raw: &str) -> FhirResult<CanonicalMessage> {
        let data: Value = serde_json::from_str(raw)?;
        Self::parse_resource(&data)
    }

    /// Structural minimal-profile validation.
    ///
    /// # Errors
    ///
    /// Returns [`FhirError::ProfileViolation`] naming the missing field:
    /// - `ServiceRequest` requires `code.coding`
    /// - `Observation` requires `code.coding` and one of `valueString` /
    ///   `valueQuantity.value`
    /// - `DiagnosticReport` requires non-empty `result`
    pub fn validate_profile(data: &Value) -> FhirResult<()> {
        if !data.is_object() {
            return Err(FhirError::ProfileViolation(
                "payload must be a JSON object".into(),
            ));
        }
        let resource_type = resource_type_of(data);
        if resource_type.is_empty() {
            return Err(FhirError::ProfileViolation("missing resourceType".into()));
        }
        match resource_type {
            "ServiceRequest" => {
                if !has_coding(data) {
                    return Err(FhirError::ProfileViolation(
                        "ServiceRequest missing code.coding".into(),
                    ));
                }
            }
            "Observation" => {
                if !has_coding(data) {
                    return Err(FhirError::ProfileViolation(
                        "Observation missing code.coding".into(),
                    ));
                }
                if observation_value(data).is_none() {
                    return Err(FhirError::ProfileViolation(
                        "Observation missing valueString or valueQuantity.value".into(),
                    ));
                }
            }
            "DiagnosticReport" => {
                let empty = data
                    .get("result")
                    .and_then(Value::as_array)
                    .map(Vec::is_empty)
                    .unwrap_or(true);
                if empty {
                    return Err(FhirError::ProfileViolation(
                        "DiagnosticReport missing result entries".into(),
                    ));
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Validates then translates a supported resource into a canonical
    /// message.
    ///
    /// `ServiceRequest` becomes an order; `Observation` and
    /// `DiagnosticReport` become results. The resource `id` doubles as the
    /// external correlation id.
    ///
    /// # Errors
    ///
    /// Returns [`FhirError::ProfileViolation`] on a structurally short
    /// resource, or [`FhirError::UnsupportedResource`] for anything this
    /// relay does not handle.
    pub fn parse_resource(data: &Value) -> FhirResult<CanonicalMessage> {
        Self::validate_profile(data)?;
        let resource_type = resource_type_of(data);
        let external_uid = data
            .get("id")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        let mut meta = BTreeMap::new();
        meta.insert("resourceType".to_string(), resource_type.to_string());

        match resource_type {
            "ServiceRequest" => {
                let code = first_coding_code(data);
                let patient_name = data
                    .get("subject")
                    .and_then(|s| s.get("display"))
                    .and_then(Value::as_str)
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .unwrap_or(EXTERNAL_PATIENT)
                    .to_string();
                let lines = code
                    .map(|c| vec![OrderLine { service_code: c, qty: 1 }])
                    .unwrap_or_default();
                Ok(CanonicalMessage {
                    payload: Payload::Order(OrderPayload {
                        patient_name,
                        priority: "routine".into(),
                        sample_type: "blood".into(),
                        lines,
                        extra: serde_json::Map::new(),
                    }),
                    external_uid,
                    meta,
                })
            }
            "Observation" | "DiagnosticReport" => {
                let accession = data
                    .get("identifier")
                    .and_then(Value::as_array)
                    .and_then(|ids| ids.first())
                    .and_then(|id| id.get("value"))
                    .and_then(Value::as_str)
                    .filter(|s| !s.is_empty())
                    .or_else(|| data.get("id").and_then(Value::as_str))
                    .unwrap_or("")
                    .to_string();

                let results = if resource_type == "Observation" {
                    vec![observation_line(data)]
                } else {
                    data.get("result")
                        .and_then(Value::as_array)
                        .map(|items| items.iter().map(observation_line).collect())
                        .unwrap_or_default()
                };

                Ok(CanonicalMessage {
                    payload: Payload::Result(ResultPayload {
                        accession,
                        results,
                        extra: serde_json::Map::new(),
                    }),
                    external_uid,
                    meta,
                })
            }
            other => Err(FhirError::UnsupportedResource(other.to_string())),
        }
    }

    /// Renders an `OperationOutcome` — the FHIR-side equivalent of an HL7
    /// acknowledgement.
    pub fn build_outcome(ok: bool, detail: &str) -> Value {
        json!({
            "resourceType": "OperationOutcome",
            "issue": [{
                "severity": if ok { "information" } else { "error" },
                "code": if ok { "informational" } else { "exception" },
                "details": { "text": detail },
            }],
        })
    }

    /// Renders an outbound `ServiceRequest` (order) or `DiagnosticReport`
    /// with nested `Observation` list (result) from a canonical payload.
    pub fn build_resource(payload: &Payload, job_name: &str) -> Value {
        match payload {
            Payload::Order(order) => {
                let code = order
                    .lines
                    .first()
                    .map(|l| l.service_code.as_str())
                    .filter(|c| !c.is_empty())
                    .unwrap_or("LAB");
                let priority = if order.priority.is_empty() {
                    "routine".to_string()
                } else {
                    order.priority.to_lowercase()
                };
                let subject = if order.patient_name.is_empty() {
                    "Unknown Patient"
                } else {
                    &order.patient_name
                };
                json!({
                    "resourceType": "ServiceRequest",
                    "id": if job_name.is_empty() { "REQ" } else { job_name },
                    "status": "active",
                    "intent": "order",
                    "priority": priority,
                    "code": { "coding": [{ "system": SERVICE_CODING_SYSTEM, "code": code }] },
                    "subject": { "display": subject },
                })
            }
            Payload::Result(result) => {
                let accession = if result.accession.is_empty() { "ACC" } else { &result.accession };
                let observations: Vec<Value> = result
                    .results
                    .iter()
                    .enumerate()
                    .map(|(idx, row)| {
                        let code = if row.service_code.is_empty() { "LAB" } else { &row.service_code };
                        json!({
                            "resourceType": "Observation",
                            "id": format!("{accession}-{}", idx + 1),
                            "status": "final",
                            "code": { "coding": [{ "system": SERVICE_CODING_SYSTEM, "code": code }] },
                            "valueString": row.result,
                        })
                    })
                    .collect();
                json!({
                    "resourceType": "DiagnosticReport",
                    "id": accession,
                    "status": "final",
                    "result": observations,
                })
            }
            Payload::Other(map) => Value::Object(map.clone()),
        }
    }
}

fn resource_type_of(data: &Value) -> &str {
    data.get("resourceType").and_then(Value::as_str).unwrap_or("")
}

fn has_coding(data: &Value) -> bool {
    data.get("code")
        .and_then(|c| c.get("coding"))
        .and_then(Value::as_array)
        .map(|c| !c.is_empty())
        .unwrap_or(false)
}

/// Code of the first `code.coding` entry, if present.
fn first_coding_code(data: &Value) -> Option<String> {
    data.get("code")
        .and_then(|c| c.get("coding"))
        .and_then(Value::as_array)
        .and_then(|c| c.first())
        .and_then(|c| c.get("code"))
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Observation value as text, from `valueString` or `valueQuantity.value`.
fn observation_value(data: &Value) -> Option<String> {
    if let Some(s) = data.get("valueString").and_then(Value::as_str) {
        if !s.is_empty() {
            return Some(s.to_string());
        }
    }
    match data.get("valueQuantity").and_then(|q| q.get("value")) {
        Some(Value::Number(n)) => Some(n.to_string()),
        Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
        _ => None,
    }
}

fn observation_line(data: &Value) -> ResultLine {
    ResultLine {
        service_code: data
            .get("code")
            .and_then(|c| c.get("coding"))
            .and_then(Value::as_array)
            .and_then(|c| c.first())
            .and_then(|c| c.get("code"))
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string(),
        result: observation_value(data).unwrap_or_default(),
        note: String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn observation_without_coding_fails_profile_naming_the_field() {
        let data = json!({ "resourceType": "Observation", "code": {}, "valueString": "5" });
        let err = Fhir::validate_profile(&data).expect_err("should fail profile");
        match err {
            FhirError::ProfileViolation(msg) => assert!(msg.contains("code.coding")),
            other => panic!("expected profile violation, got {other:?}"),
        }
    }

    #[test]
    fn observation_without_value_fails_profile() {
        let data = json!({
            "resourceType": "Observation",
            "code": { "coding": [{ "code": "GLU" }] },
        });
        let err = Fhir::validate_profile(&data).expect_err("should fail profile");
        match err {
            FhirError::ProfileViolation(msg) => {
                assert!(msg.contains("valueString or valueQuantity.value"));
            }
            other => panic!("expected profile violation, got {other:?}"),
        }
    }

    #[test]
    fn diagnostic_report_requires_result_entries() {
        let data = json!({ "resourceType": "DiagnosticReport", "result": [] });
        assert!(Fhir::validate_profile(&data).is_err());
    }

    #[test]
    fn service_request_parses_to_canonical_order() {
        let data = json!({
            "resourceType": "ServiceRequest",
            "id": "SR-1",
            "code": { "coding": [{ "code": "GLU" }] },
            "subject": { "display": "John Doe" },
        });
        let parsed = Fhir::parse_resource(&data).expect("parse");
        assert_eq!(parsed.kind(), MessageKind::Order);
        assert_eq!(parsed.external_uid.as_deref(), Some("SR-1"));
        match parsed.payload {
            Payload::Order(order) => {
                assert_eq!(order.patient_name, "John Doe");
                assert_eq!(order.lines[0].service_code, "GLU");
            }
            other => panic!("expected order payload, got {other:?}"),
        }
    }

    #[test]
    fn observation_parses_to_single_result_line() {
        let data = json!({
            "resourceType": "Observation",
            "id": "OBS-1",
            "identifier": [{ "value": "ACC1" }],
            "code": { "coding": [{ "code": "GLU" }] },
            "valueQuantity": { "value": 5.4 },
        });
        let parsed = Fhir::parse_resource(&data).expect("parse");
        match parsed.payload {
            Payload::Result(result) => {
                assert_eq!(result.accession, "ACC1");
                assert_eq!(result.results.len(), 1);
                assert_eq!(result.results[0].result, "5.4");
            }
            other => panic!("expected result payload, got {other:?}"),
        }
    }

    #[test]
    fn diagnostic_report_accession_falls_back_to_resource_id() {
        let data = json!({
            "resourceType": "DiagnosticReport",
            "id": "DR-9",
            "result": [{
                "code": { "coding": [{ "code": "NA" }] },
                "valueString": "140",
            }],
        });
        let parsed = Fhir::parse_resource(&data).expect("parse");
        match parsed.payload {
            Payload::Result(result) => {
                assert_eq!(result.accession, "DR-9");
                assert_eq!(result.results[0].service_code, "NA");
            }
            other => panic!("expected result payload, got {other:?}"),
        }
    }

    #[test]
    fn unsupported_resource_type_is_rejected() {
        let data = json!({ "resourceType": "Patient", "id": "P-1" });
        let err = Fhir::parse_resource(&data).expect_err("should reject");
        assert!(matches!(err, FhirError::UnsupportedResource(t) if t == "Patient"));
    }

    #[test]
    fn outcome_reflects_success_and_failure() {
        let ok = Fhir::build_outcome(true, "accepted");
        assert_eq!(ok["issue"][0]["severity"], "information");
        let bad = Fhir::build_outcome(false, "no MSH");
        assert_eq!(bad["issue"][0]["severity"], "error");
        assert_eq!(bad["issue"][0]["details"]["text"], "no MSH");
    }

    #[test]
    fn result_resource_round_trips_through_parse() {
        let payload = Payload::Result(ResultPayload {
            accession: "ACC5".into(),
            results: vec![ResultLine {
                service_code: "GLU".into(),
                result: "5.4".into(),
                note: String::new(),
            }],
            extra: serde_json::Map::new(),
        });
        let resource = Fhir::build_resource(&payload, "IFJ/7");
        let parsed = Fhir::parse_resource(&resource).expect("reparse");
        match parsed.payload {
            Payload::Result(result) => {
                assert_eq!(result.accession, "ACC5");
                assert_eq!(result.results[0].service_code, "GLU");
                assert_eq!(result.results[0].result, "5.4");
            }
            other => panic!("expected result payload, got {other:?}"),
        }
    }
}
