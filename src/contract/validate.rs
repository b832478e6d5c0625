//! Envelope and registration validation.
//!
//! Every check runs; failures accumulate into one `CoreError::Validation`.

use serde_json::{Map, Value};

use super::envelope::{MessageKind, Priority, Registration, StateOp};
use crate::error::{CoreError, CoreResult, Violation};
use crate::logging::log_validation_failure;

/// Component and envelope ids: 1..=128 chars of `[A-Za-z0-9_.:-]`.
pub fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 128
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'))
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Accumulates violations for fields of one JSON object.
struct Fields<'a> {
    obj: &'a Map<String, Value>,
    prefix: &'a str,
    out: &'a mut Vec<Violation>,
}

impl<'a> Fields<'a> {
    fn path(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    fn push(&mut self, key: &str, problem: impl Into<String>) {
        let path = self.path(key);
        self.out.push(Violation::new(path, problem));
    }

    fn mistyped(&mut self, key: &str, expected: &str, got: &Value) {
        self.push(key, format!("expected {}, got {}", expected, type_name(got)));
    }

    fn required_str(&mut self, key: &str) -> Option<&'a str> {
        let obj = self.obj;
        match obj.get(key) {
            None => {
                self.push(key, "required");
                None
            }
            Some(Value::String(s)) if s.trim().is_empty() => {
                self.push(key, "must not be empty");
                None
            }
            Some(Value::String(s)) => Some(s.as_str()),
            Some(other) => {
                self.mistyped(key, "string", other);
                None
            }
        }
    }

    fn optional_str(&mut self, key: &str) -> Option<&'a str> {
        let obj = self.obj;
        match obj.get(key) {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s.as_str()),
            Some(other) => {
                self.mistyped(key, "string", other);
                None
            }
        }
    }

    fn optional_one_of(&mut self, key: &str, allowed: &[&str]) {
        if let Some(s) = self.optional_str(key) {
            if !allowed.contains(&s) {
                self.push(key, format!("must be one of {}", allowed.join("|")));
            }
        }
    }

    fn required_one_of(&mut self, key: &str, allowed: &[&str]) {
        if let Some(s) = self.required_str(key) {
            if !allowed.contains(&s) {
                self.push(key, format!("must be one of {}", allowed.join("|")));
            }
        }
    }

    fn required_present(&mut self, key: &str) {
        let obj = self.obj;
        if !obj.contains_key(key) {
            self.push(key, "required");
        }
    }

    fn required_uint(&mut self, key: &str) {
        let obj = self.obj;
        match obj.get(key) {
            None => self.push(key, "required"),
            Some(v) if v.as_u64().is_some() => {}
            Some(other) => self.mistyped(key, "non-negative integer", other),
        }
    }

    fn optional_uint(&mut self, key: &str) {
        let obj = self.obj;
        match obj.get(key) {
            None | Some(Value::Null) => {}
            Some(v) if v.as_u64().is_some() => {}
            Some(other) => self.mistyped(key, "non-negative integer", other),
        }
    }

    fn optional_object(&mut self, key: &str) -> Option<&'a Map<String, Value>> {
        let obj = self.obj;
        match obj.get(key) {
            None | Some(Value::Null) => None,
            Some(Value::Object(m)) => Some(m),
            Some(other) => {
                self.mistyped(key, "object", other);
                None
            }
        }
    }

    fn optional_string_array(&mut self, key: &str) {
        let obj = self.obj;
        match obj.get(key) {
            None | Some(Value::Null) => {}
            Some(Value::Array(items)) => {
                for (i, item) in items.iter().enumerate() {
                    if !item.is_string() {
                        let problem = format!("expected string, got {}", type_name(item));
                        self.push(&format!("{}[{}]", key, i), problem);
                    }
                }
            }
            Some(other) => self.mistyped(key, "array of strings", other),
        }
    }
}

fn finish(subject: &str, violations: Vec<Violation>) -> CoreResult<()> {
    if violations.is_empty() {
        return Ok(());
    }
    let lines: Vec<String> = violations.iter().map(|v| v.to_string()).collect();
    log_validation_failure(subject, &lines);
    Err(CoreError::Validation(violations))
}

/// Validate a raw envelope against the schema for `kind`.
///
/// `register` frames only need `type` and `payload`; every other kind needs
/// the full header (`id`, `from`, `to`, `timestamp`).
pub fn validate_envelope(raw: &Value, kind: MessageKind) -> CoreResult<()> {
    let Some(obj) = raw.as_object() else {
        return finish(
            "envelope",
            vec![Violation::new("envelope", format!("expected object, got {}", type_name(raw)))],
        );
    };
    let mut out = Vec::new();
    let mut f = Fields {
        obj,
        prefix: "",
        out: &mut out,
    };

    match obj.get("type") {
        None => f.push("type", "required"),
        Some(Value::String(t)) if t == kind.as_str() => {}
        Some(Value::String(t)) => f.push("type", format!("expected '{}', got '{}'", kind.as_str(), t)),
        Some(other) => f.mistyped("type", "string", other),
    }

    if kind == MessageKind::Register {
        f.optional_str("id");
        f.optional_str("from");
        f.optional_str("to");
        f.optional_uint("timestamp");
    } else {
        if let Some(id) = f.required_str("id") {
            if !is_valid_id(id) {
                f.push("id", "invalid id format");
            }
        }
        f.required_str("from");
        f.required_str("to");
        f.required_uint("timestamp");
    }
    f.optional_uint("ttl");
    f.optional_one_of("priority", &Priority::NAMES);
    f.optional_str("correlationId");
    f.optional_str("topic");
    f.optional_object("metadata");

    let payload = obj.get("payload");
    if payload.is_none() {
        f.push("payload", "required");
    }
    if let Some(payload) = payload {
        validate_payload(payload, kind, &mut out);
    }

    finish("envelope", out)
}

/// Validate a frame whose kind is taken from its own `type` field.
pub fn validate_frame(raw: &Value) -> CoreResult<MessageKind> {
    let kind = match raw.get("type") {
        Some(Value::String(t)) => MessageKind::parse(t),
        _ => None,
    };
    match kind {
        Some(kind) => validate_envelope(raw, kind).map(|_| kind),
        None => {
            // Report the header problems too, not just the unknown type.
            let mut violations = match validate_envelope(raw, MessageKind::Standard) {
                Err(CoreError::Validation(v)) => v
                    .into_iter()
                    .filter(|v| v.field != "type")
                    .collect(),
                _ => Vec::new(),
            };
            let names: Vec<&str> = MessageKind::ALL.iter().map(|k| k.as_str()).collect();
            violations.insert(0, Violation::new("type", format!("must be one of {}", names.join("|"))));
            Err(CoreError::Validation(violations))
        }
    }
}

fn validate_payload(payload: &Value, kind: MessageKind, out: &mut Vec<Violation>) {
    if kind == MessageKind::Standard {
        return;
    }
    let Some(obj) = payload.as_object() else {
        out.push(Violation::new(
            "payload",
            format!("expected object, got {}", type_name(payload)),
        ));
        return;
    };
    let mut f = Fields {
        obj,
        prefix: "payload.",
        out,
    };
    match kind {
        MessageKind::Standard => {}
        MessageKind::Command => {
            f.required_str("command");
            f.optional_object("parameters");
        }
        MessageKind::Event => {
            f.required_str("event");
        }
        MessageKind::State => {
            f.required_one_of("stateType", &StateOp::NAMES);
            f.required_present("stateData");
            f.optional_uint("version");
        }
        MessageKind::Register => registration_fields(&mut f),
    }
}

fn registration_fields(f: &mut Fields<'_>) {
    if let Some(id) = f.optional_str("id") {
        if !is_valid_id(id) {
            f.push("id", "invalid id format");
        }
    }
    f.required_str("name");
    f.required_str("type");
    f.optional_str("version");
    if let Some(endpoints) = f.optional_object("endpoints") {
        for (transport, address) in endpoints {
            match address.as_str() {
                Some(addr) => {
                    if let Some(problem) = endpoint_problem(addr) {
                        f.push(&format!("endpoints.{}", transport), problem);
                    }
                }
                None => f.mistyped(&format!("endpoints.{}", transport), "string", address),
            }
        }
    }
    f.optional_string_array("capabilities");
    f.optional_string_array("dependencies");
    f.optional_object("metadata");
}

fn endpoint_problem(address: &str) -> Option<String> {
    match url::Url::parse(address) {
        Ok(u) if matches!(u.scheme(), "http" | "https" | "ws" | "wss") => None,
        Ok(u) => Some(format!("unsupported scheme '{}'", u.scheme())),
        Err(e) => Some(format!("invalid url: {}", e)),
    }
}

/// Check an already-typed registration (API callers bypass the JSON layer).
pub fn validate_registration(reg: &Registration) -> CoreResult<()> {
    let mut out = Vec::new();
    if let Some(id) = &reg.id {
        if !is_valid_id(id) {
            out.push(Violation::new("id", "invalid id format"));
        }
    }
    if reg.name.trim().is_empty() {
        out.push(Violation::new("name", "required"));
    }
    if reg.kind.trim().is_empty() {
        out.push(Violation::new("type", "required"));
    }
    if let Some(version) = &reg.version {
        if version.trim().is_empty() {
            out.push(Violation::new("version", "must not be empty"));
        }
    }
    for (transport, address) in &reg.endpoints {
        if let Some(problem) = endpoint_problem(address) {
            out.push(Violation::new(format!("endpoints.{}", transport), problem));
        }
    }
    if reg.capabilities.iter().any(|c| c.trim().is_empty()) {
        out.push(Violation::new("capabilities", "must not contain empty entries"));
    }
    finish("registration", out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields_of(err: CoreError) -> Vec<String> {
        err.violations().iter().map(|v| v.field.clone()).collect()
    }

    fn good_standard() -> Value {
        json!({
            "id": "e-1", "from": "a", "to": "b", "type": "standard",
            "payload": {"symbol": "BTCUSDT"}, "timestamp": 10
        })
    }

    #[test]
    fn test_valid_standard_envelope_passes() {
        assert!(validate_envelope(&good_standard(), MessageKind::Standard).is_ok());
    }

    #[test]
    fn test_every_missing_field_is_reported() {
        let raw = json!({"type": "standard"});
        let fields = fields_of(validate_envelope(&raw, MessageKind::Standard).unwrap_err());
        for expected in ["id", "from", "to", "timestamp", "payload"] {
            assert!(fields.contains(&expected.to_string()), "missing {} in {:?}", expected, fields);
        }
    }

    #[test]
    fn test_each_required_field_reported_by_name() {
        for key in ["id", "from", "to", "type", "payload", "timestamp"] {
            let mut raw = good_standard();
            raw.as_object_mut().unwrap().remove(key);
            let fields = fields_of(validate_envelope(&raw, MessageKind::Standard).unwrap_err());
            assert!(fields.contains(&key.to_string()), "{} not reported: {:?}", key, fields);
        }
    }

    #[test]
    fn test_mistyped_fields_reported() {
        let raw = json!({
            "id": 7, "from": "a", "to": "b", "type": "standard",
            "payload": {}, "timestamp": "now", "ttl": -1, "priority": "urgent"
        });
        let fields = fields_of(validate_envelope(&raw, MessageKind::Standard).unwrap_err());
        assert_eq!(fields, vec!["id", "timestamp", "ttl", "priority"]);
    }

    #[test]
    fn test_command_payload_checked() {
        let raw = json!({
            "id": "e-1", "from": "a", "to": "b", "type": "command",
            "payload": {"parameters": []}, "timestamp": 1
        });
        let fields = fields_of(validate_envelope(&raw, MessageKind::Command).unwrap_err());
        assert_eq!(fields, vec!["payload.command", "payload.parameters"]);
    }

    #[test]
    fn test_state_payload_checked() {
        let raw = json!({
            "id": "e-1", "from": "a", "to": "b", "type": "state",
            "payload": {"stateType": "merge"}, "timestamp": 1
        });
        let fields = fields_of(validate_envelope(&raw, MessageKind::State).unwrap_err());
        assert_eq!(fields, vec!["payload.stateType", "payload.stateData"]);
    }

    #[test]
    fn test_kind_mismatch_reported() {
        let err = validate_envelope(&good_standard(), MessageKind::Event).unwrap_err();
        let v = &err.violations()[0];
        assert_eq!(v.field, "type");
        assert!(v.problem.contains("expected 'event'"));
    }

    #[test]
    fn test_register_frame_needs_only_payload() {
        let raw = json!({"type": "register", "payload": {"name": "scanner", "type": "analysis"}});
        assert_eq!(validate_frame(&raw).unwrap(), MessageKind::Register);

        let bad = json!({"type": "register", "payload": {
            "endpoints": {"http": "not a url"}, "capabilities": ["ok", 3]
        }});
        let fields = fields_of(validate_frame(&bad).unwrap_err());
        assert_eq!(
            fields,
            vec!["payload.name", "payload.type", "payload.endpoints.http", "payload.capabilities[1]"]
        );
    }

    #[test]
    fn test_unknown_type_still_reports_header() {
        let raw = json!({"type": "gossip", "payload": 1});
        let fields = fields_of(validate_frame(&raw).unwrap_err());
        assert_eq!(fields[0], "type");
        assert!(fields.contains(&"id".to_string()));
    }

    #[test]
    fn test_typed_registration() {
        let ok = Registration::new("scanner", "analysis").with_endpoint("http", "http://127.0.0.1:9000/in");
        assert!(validate_registration(&ok).is_ok());

        let bad = Registration::new(" ", "")
            .with_id("has space")
            .with_endpoint("ftp", "ftp://host/x");
        let fields = fields_of(validate_registration(&bad).unwrap_err());
        assert_eq!(fields, vec!["id", "name", "type", "endpoints.ftp"]);
    }

    #[test]
    fn test_id_format() {
        assert!(is_valid_id("trading-engine.v2:01"));
        assert!(!is_valid_id(""));
        assert!(!is_valid_id("a b"));
        assert!(!is_valid_id(&"x".repeat(129)));
    }
}
