//! Protocol-agnostic request model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

fn is_false(b: &bool) -> bool {
    !*b
}

/// A normalized inbound request: named fields plus resolution metadata.
///
/// The listener owns protocol framing and hands the core a flat mapping of
/// fields (`method`, `path`, `headers`, `body`, `data`, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    #[serde(flatten)]
    pub fields: Map<String, Value>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_dry_run: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(default = "Utc::now", skip_serializing)]
    pub timestamp: DateTime<Utc>,
}

impl Request {
    pub fn new(fields: Map<String, Value>) -> Self {
        Self {
            fields,
            is_dry_run: false,
            ip: None,
            timestamp: Utc::now(),
        }
    }

    /// Build from a JSON object; non-object values yield an empty request.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(mut fields) => {
                let is_dry_run = matches!(fields.remove("isDryRun"), Some(Value::Bool(true)));
                let ip = match fields.remove("ip") {
                    Some(Value::String(ip)) => Some(ip),
                    _ => None,
                };
                Self {
                    fields,
                    is_dry_run,
                    ip,
                    timestamp: Utc::now(),
                }
            }
            _ => Self::new(Map::new()),
        }
    }

    pub fn with_ip(mut self, ip: impl Into<String>) -> Self {
        self.ip = Some(ip.into());
        self
    }

    pub fn as_dry_run(mut self) -> Self {
        self.is_dry_run = true;
        self
    }

    /// Synthetic request used by the dry-run validator for a given protocol.
    pub fn dry_run(protocol: &str) -> Self {
        let fields = match protocol {
            "http" | "https" => json!({
                "requestFrom": "",
                "method": "GET",
                "path": "/",
                "query": {},
                "headers": {},
                "form": {},
                "body": ""
            }),
            "tcp" => json!({ "requestFrom": "", "data": "" }),
            "smtp" => json!({
                "requestFrom": "",
                "envelopeFrom": "",
                "envelopeTo": [],
                "from": {},
                "to": [],
                "cc": [],
                "bcc": [],
                "subject": "",
                "priority": "",
                "references": [],
                "inReplyTo": [],
                "text": "",
                "html": "",
                "attachments": []
            }),
            _ => json!({}),
        };
        Self::from_value(fields).as_dry_run()
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// The object predicates, behaviors and injected code observe.
    pub fn to_value(&self) -> Value {
        let mut object = self.fields.clone();
        if let Some(ip) = &self.ip {
            object.insert("ip".to_string(), Value::String(ip.clone()));
        }
        if self.is_dry_run {
            object.insert("isDryRun".to_string(), Value::Bool(true));
        }
        Value::Object(object)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_value_extracts_metadata() {
        let request = Request::from_value(json!({
            "method": "GET",
            "path": "/users",
            "ip": "127.0.0.1",
            "isDryRun": true
        }));
        assert!(request.is_dry_run);
        assert_eq!(request.ip.as_deref(), Some("127.0.0.1"));
        assert_eq!(request.fields.len(), 2);
        assert_eq!(request.get("path"), Some(&json!("/users")));
    }

    #[test]
    fn test_to_value_includes_ip() {
        let request = Request::from_value(json!({"data": "hello"})).with_ip("10.0.0.1");
        assert_eq!(request.to_value(), json!({"data": "hello", "ip": "10.0.0.1"}));
    }

    #[test]
    fn test_dry_run_requests_per_protocol() {
        let http = Request::dry_run("http");
        assert!(http.is_dry_run);
        assert_eq!(http.get("method"), Some(&json!("GET")));
        assert_eq!(http.get("query"), Some(&json!({})));

        let tcp = Request::dry_run("tcp");
        assert_eq!(tcp.get("data"), Some(&json!("")));

        let custom = Request::dry_run("grpc");
        assert!(custom.fields.is_empty());
        assert_eq!(custom.to_value(), json!({"isDryRun": true}));
    }

    #[test]
    fn test_serde_flattens_fields() {
        let request: Request =
            serde_json::from_value(json!({"method": "POST", "isDryRun": true})).unwrap();
        assert!(request.is_dry_run);
        assert_eq!(request.fields.get("method"), Some(&json!("POST")));
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({"method": "POST", "isDryRun": true})
        );
    }
}
