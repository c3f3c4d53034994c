//! Segment-level HL7 message model.

use crate::{Hl7Error, Hl7Result};

/// One parsed segment: its name and the ordered pipe-delimited fields.
///
/// Field 0 is the segment name itself, matching raw pipe positions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Segment {
    pub name: String,
    pub fields: Vec<String>,
}

/// A parsed HL7 message: ordered segments, addressable by name and
/// occurrence.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Hl7Message {
    segments: Vec<Segment>,
}

impl Hl7Message {
    /// Parses raw wire text into segments.
    ///
    /// Segment terminators are normalised (`\r\n` and `\n` become `\r`) and
    /// blank lines are dropped. The only hard requirement is that the first
    /// segment is `MSH`; everything below segment level is read leniently.
    ///
    /// # Errors
    ///
    /// Returns [`Hl7Error::MalformedMessage`] if the message is empty or the
    /// first segment is not `MSH`.
    pub fn parse(raw: &str) -> Hl7Result<Self> {
        let normalised = raw.replace("\r\n", "\r").replace('\n', "\r");
        let segments: Vec<Segment> = normalised
            .split('\r')
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(|line| {
                let fields: Vec<String> = line.split('|').map(str::to_string).collect();
                Segment { name: fields[0].clone(), fields }
            })
            .collect();

        if segments.first().map(|s| s.name.as_str()) != Some("MSH") {
            return Err(Hl7Error::MalformedMessage);
        }
        Ok(Self { segments })
    }

    /// All occurrences of a segment, in message order.
    pub fn occurrences<'s, 'n>(&'s self, name: &'n str) -> impl Iterator<Item = &'s Segment> + use<'s, 'n> {
        self.segments.iter().filter(move |s| s.name == name)
    }

    /// First occurrence of a segment.
    pub fn first(&self, name: &str) -> Option<&Segment> {
        self.occurrences(name).next()
    }

    /// Raw field value at a 0-based pipe position, or empty.
    pub fn field<'a>(&'a self, segment: &'a Segment, index: usize) -> &'a str {
        segment.fields.get(index).map(String::as_str).unwrap_or("")
    }

    /// Resolves a field-path expression of the form
    /// `SEG[occurrence].field.component.subcomponent`.
    ///
    /// Occurrence, component and subcomponent indices are 1-based; the field
    /// index is the 0-based pipe position. Missing segments, fields,
    /// components or unparsable indices all resolve to the empty string —
    /// partial remote data degrades to missing fields, not errors.
    pub fn get(&self, expr: &str) -> String {
        if !expr.contains('.') {
            return String::new();
        }
        let mut parts = expr.split('.');
        let head = parts.next().unwrap_or("");

        let (name, occurrence) = match head.split_once('[') {
            Some((name, rest)) => {
                let occ = rest
                    .strip_suffix(']')
                    .and_then(|n| n.parse::<usize>().ok())
                    .unwrap_or(1);
                (name, occ.max(1))
            }
            None => (head, 1),
        };

        let Some(segment) = self.occurrences(name).nth(occurrence - 1) else {
            return String::new();
        };

        let Some(field_idx) = parts.next().and_then(|p| p.parse::<usize>().ok()) else {
            return String::new();
        };
        let mut value = self.field(segment, field_idx).to_string();

        if let Some(comp_part) = parts.next() {
            value = match comp_part.parse::<usize>() {
                Ok(idx) if idx >= 1 => component(&value, idx - 1).to_string(),
                _ => String::new(),
            };
        }
        if let Some(sub_part) = parts.next() {
            value = match sub_part.parse::<usize>() {
                Ok(idx) if idx >= 1 => subcomponent(&value, idx - 1).to_string(),
                _ => String::new(),
            };
        }
        value
    }
}

/// `^`-delimited component of a field value, or empty.
pub fn component(value: &str, index: usize) -> &str {
    value.split('^').nth(index).unwrap_or("")
}

/// `&`-delimited subcomponent of a component value, or empty.
pub fn subcomponent(value: &str, index: usize) -> &str {
    value.split('&').nth(index).unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "MSH|^~\\&|HIS|A|LAB|B|20240101120000||ORU^R01|CTRL9|P|2.5\rPID|||123||Doe^John\rOBR|1||ACC1|GLU^Glucose\rOBX|1|ST|GLU^Glucose||5.4|||N\rOBX|2|ST|NA^Sodium||140|||N\r";

    #[test]
    fn rejects_message_without_msh() {
        let err = Hl7Message::parse("PID|||123\r").expect_err("should reject");
        assert!(matches!(err, Hl7Error::MalformedMessage));
    }

    #[test]
    fn normalises_newline_variants() {
        let msg = Hl7Message::parse("MSH|^~\\&|A\nPID|||1\r\nOBR|1\n").expect("parse");
        assert_eq!(msg.occurrences("OBR").count(), 1);
        assert!(msg.first("PID").is_some());
    }

    #[test]
    fn resolves_field_component_and_occurrence_paths() {
        let msg = Hl7Message::parse(SAMPLE).expect("parse");
        assert_eq!(msg.get("PID.5.2"), "John");
        assert_eq!(msg.get("OBR.3"), "ACC1");
        assert_eq!(msg.get("OBX[2].3.1"), "NA");
        assert_eq!(msg.get("OBX[2].5"), "140");
    }

    #[test]
    fn missing_data_reads_as_empty_never_errors() {
        let msg = Hl7Message::parse(SAMPLE).expect("parse");
        assert_eq!(msg.get("ZZZ.1"), "");
        assert_eq!(msg.get("OBX[9].5"), "");
        assert_eq!(msg.get("PID.99"), "");
        assert_eq!(msg.get("PID.5.9"), "");
        assert_eq!(msg.get("PID.5.1.4"), "");
        assert_eq!(msg.get("PID"), "");
        assert_eq!(msg.get("PID.x"), "");
        assert_eq!(msg.get(""), "");
    }

    #[test]
    fn subcomponents_split_on_ampersand() {
        let msg =
            Hl7Message::parse("MSH|^~\\&|A\rOBX|1|ST|CODE||a&b^c\r").expect("parse");
        assert_eq!(msg.get("OBX.5.1.2"), "b");
        assert_eq!(msg.get("OBX.5.2"), "c");
    }

    #[test]
    fn malformed_occurrence_index_defaults_to_first() {
        let msg = Hl7Message::parse(SAMPLE).expect("parse");
        assert_eq!(msg.get("OBX[x].3.1"), "GLU");
    }
}
