//! Translation between HL7 wire text and the canonical message model.

use crate::segments::component;
use crate::{Hl7Message, Hl7Result};
use chrono::Utc;
use lir_types::{
    AckCode, CanonicalMessage, MessageKind, OrderLine, OrderPayload, Payload, ResultLine,
    ResultPayload,
};
use std::collections::BTreeMap;

/// Sending/receiving identities stamped into generated MSH segments.
const SENDING_APP: &str = "LIR";
const SENDING_FACILITY: &str = "LAB";
const RECEIVING_APP: &str = "EXT";
const RECEIVING_FACILITY: &str = "REMOTE";
const HL7_VERSION: &str = "2.5";

/// Name used when an inbound message carries no usable patient name.
const EXTERNAL_PATIENT: &str = "External Patient";

/// HL7 codec operations.
///
/// Zero-sized namespacing type; all methods are associated functions.
pub struct Hl7;

impl Hl7 {
    /// Parses raw HL7 wire text into a canonical message.
    ///
    /// ORM messages map to orders; ORU messages map to results. Any other
    /// type code also falls through to `result`.
    // TODO: reject unrecognised MSH-9 type codes once the partner message
    // inventory is confirmed; today they are all treated as results.
    ///
    /// `field_map` is an ordered list of `(output_key, path_expression)`
    /// overrides applied after the default extraction; a rule whose
    /// expression resolves to an empty value is skipped, otherwise the last
    /// write wins.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Hl7Error::MalformedMessage`] if the first segment is
    /// not `MSH`. Everything below segment level reads leniently.
    pub fn parse_message(raw: &str, field_map: &[(String, String)]) -> Hl7Result<CanonicalMessage> {
        let msg = Hl7Message::parse(raw)?;

        let msh = msg.first("MSH").ok_or(crate::Hl7Error::MalformedMessage)?;
        let type_field = msg.field(msh, 8).to_string();
        let control_id = msg.field(msh, 9).to_string();
        let type_code = component(&type_field, 0).to_string();
        let trigger = component(&type_field, 1).to_string();
        let kind = if type_code == "ORM" {
            MessageKind::Order
        } else {
            MessageKind::Result
        };

        let mut payload = match kind {
            MessageKind::Order => Payload::Order(OrderPayload {
                patient_name: parse_patient_name(&msg),
                priority: "routine".into(),
                sample_type: "blood".into(),
                lines: parse_order_lines(&msg),
                extra: serde_json::Map::new(),
            }),
            _ => Payload::Result(ResultPayload {
                accession: parse_accession(&msg),
                results: parse_result_lines(&msg),
                extra: serde_json::Map::new(),
            }),
        };

        for (key, expr) in field_map {
            let extracted = msg.get(expr);
            if !extracted.is_empty() {
                payload.set_field(key, extracted);
            }
        }

        let mut meta = BTreeMap::new();
        meta.insert("hl7_type".to_string(), type_code);
        meta.insert("hl7_trigger".to_string(), trigger);
        meta.insert("control_id".to_string(), control_id.clone());

        Ok(CanonicalMessage {
            payload,
            external_uid: (!control_id.is_empty()).then_some(control_id),
            meta,
        })
    }

    /// Renders an MSH/MSA acknowledgement, `\r`-terminated.
    ///
    /// Output is byte-stable for identical arguments except for the embedded
    /// UTC timestamp.
    pub fn build_ack(code: AckCode, control_id: &str, text: &str) -> String {
        let ts = Utc::now().format("%Y%m%d%H%M%S");
        let control = if control_id.is_empty() { "CTRL" } else { control_id };
        let msh = format!(
            "MSH|^~\\&|{SENDING_APP}|{SENDING_FACILITY}|{RECEIVING_APP}|{RECEIVING_FACILITY}|{ts}||ACK|{control}|P|{HL7_VERSION}"
        );
        let msa = format!("MSA|{}|{}|{}", code.as_str(), control, text);
        format!("{msh}\r{msa}\r")
    }

    /// Renders an outbound ORM (order) or ORU (result) message from a
    /// canonical payload, `\r`-terminated.
    pub fn build_message(
        payload: &Payload,
        endpoint_code: &str,
        job_name: &str,
    ) -> String {
        let ts = Utc::now().format("%Y%m%d%H%M%S");
        let endpoint = if endpoint_code.is_empty() { "ENDP" } else { endpoint_code };
        let job = if job_name.is_empty() { "JOB" } else { job_name };

        match payload {
            Payload::Order(order) => {
                let msh = format!(
                    "MSH|^~\\&|{SENDING_APP}|{SENDING_FACILITY}|{endpoint}|{RECEIVING_APP}|{ts}||ORM^O01|{job}|P|{HL7_VERSION}"
                );
                let request_no = extra_str(&order.extra, "request_no");
                let patient = if order.patient_name.is_empty() {
                    "Unknown^Patient"
                } else {
                    &order.patient_name
                };
                let pid = format!("PID|||{request_no}||{patient}");
                let mut segments = vec![msh, pid];
                for (idx, line) in order.lines.iter().enumerate() {
                    let n = idx + 1;
                    let code = if line.service_code.is_empty() {
                        "UNKNOWN"
                    } else {
                        &line.service_code
                    };
                    segments.push(format!("ORC|NW|{job}-{n}"));
                    segments.push(format!("OBR|{n}|{request_no}|{request_no}|{code}^{code}"));
                }
                segments.join("\r") + "\r"
            }
            Payload::Result(result) => {
                let msh = format!(
                    "MSH|^~\\&|{SENDING_APP}|{SENDING_FACILITY}|{endpoint}|{RECEIVING_APP}|{ts}||ORU^R01|{job}|P|{HL7_VERSION}"
                );
                let patient = extra_str(&result.extra, "patient_name");
                let patient = if patient.is_empty() { "Unknown^Patient".to_string() } else { patient };
                let pid = format!("PID|||{}||{patient}", result.accession);
                let obr = format!("OBR|1|{0}|{0}|LAB^RESULT", result.accession);
                let mut segments = vec![msh, pid, obr];
                for (idx, row) in result.results.iter().enumerate() {
                    let n = idx + 1;
                    let code = if row.service_code.is_empty() { "TEST" } else { &row.service_code };
                    segments.push(format!(
                        "OBX|{n}|ST|{code}^{code}||{}|||{}",
                        row.result, row.note
                    ));
                }
                segments.join("\r") + "\r"
            }
            // Passthrough payloads have no HL7 rendering; emit an empty ORU
            // frame so the wire still carries a well-formed message.
            Payload::Other(_) => {
                format!(
                    "MSH|^~\\&|{SENDING_APP}|{SENDING_FACILITY}|{endpoint}|{RECEIVING_APP}|{ts}||ORU^R01|{job}|P|{HL7_VERSION}\r"
                )
            }
        }
    }
}

fn parse_patient_name(msg: &Hl7Message) -> String {
    let Some(pid) = msg.first("PID") else {
        return EXTERNAL_PATIENT.to_string();
    };
    let name_field = msg.field(pid, 5);
    let family = component(name_field, 0);
    let given = component(name_field, 1);
    let name = format!("{given} {family}").trim().to_string();
    if name.is_empty() {
        EXTERNAL_PATIENT.to_string()
    } else {
        name
    }
}

fn parse_order_lines(msg: &Hl7Message) -> Vec<OrderLine> {
    msg.occurrences("OBR")
        .filter_map(|obr| {
            let service = component(msg.field(obr, 4), 0);
            (!service.is_empty()).then(|| OrderLine { service_code: service.to_string(), qty: 1 })
        })
        .collect()
}

fn parse_accession(msg: &Hl7Message) -> String {
    msg.occurrences("OBR")
        .map(|obr| msg.field(obr, 3))
        .find(|acc| !acc.is_empty())
        .unwrap_or("")
        .to_string()
}

fn parse_result_lines(msg: &Hl7Message) -> Vec<ResultLine> {
    msg.occurrences("OBX")
        .filter_map(|obx| {
            let service = component(msg.field(obx, 3), 0);
            (!service.is_empty()).then(|| ResultLine {
                service_code: service.to_string(),
                result: msg.field(obx, 5).to_string(),
                note: msg.field(obx, 8).to_string(),
            })
        })
        .collect()
}

fn extra_str(map: &serde_json::Map<String, serde_json::Value>, key: &str) -> String {
    map.get(key)
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string()
}
