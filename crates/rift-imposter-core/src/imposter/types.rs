//! Stub and response template types.
//!
//! Templates keep the JSON they were configured with so they can be compared
//! structurally, patched in place and snapshotted verbatim. The typed view
//! ([`ResponseKind`]) is produced on demand and enforces that exactly one
//! response type is set.

use crate::behaviors::repeat_count;
use crate::error::{ImposterError, Result};
use crate::predicate::Predicate;
use crate::recording::{ProxyMode, PROXY_RESPONSE_TIME};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};

/// Keys that select a response type.
pub const RESPONSE_TYPES: [&str; 3] = ["is", "proxy", "inject"];

/// One entry of a stub's `responses` list.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(from = "Value")]
pub struct ResponseTemplate {
    value: Value,
}

impl From<Value> for ResponseTemplate {
    fn from(value: Value) -> Self {
        Self::new(value)
    }
}

impl Serialize for ResponseTemplate {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.value.serialize(serializer)
    }
}

/// Typed view of a response template.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseKind {
    Is(Value),
    Proxy(ProxyConfig),
    Inject(String),
}

impl ResponseTemplate {
    pub fn new(value: Value) -> Self {
        Self { value }
    }

    pub fn as_value(&self) -> &Value {
        &self.value
    }

    pub fn into_value(self) -> Value {
        self.value
    }

    /// Resolve the response type. A template without any type is an empty
    /// `is` response; more than one type is rejected.
    pub fn kind(&self) -> Result<ResponseKind> {
        let types = RESPONSE_TYPES
            .iter()
            .filter(|key| self.value.get(**key).is_some())
            .count();
        if types > 1 {
            return Err(ImposterError::validation_with_source(
                "each response object must have only one response type",
                self.value.clone(),
            ));
        }

        if let Some(proxy) = self.value.get("proxy") {
            return ProxyConfig::from_value(proxy).map(ResponseKind::Proxy);
        }
        if let Some(inject) = self.value.get("inject") {
            return match inject {
                Value::String(source) => Ok(ResponseKind::Inject(source.clone())),
                _ => Err(ImposterError::validation_with_source(
                    "inject must be a string holding a JavaScript function",
                    self.value.clone(),
                )),
            };
        }
        Ok(ResponseKind::Is(
            self.value
                .get("is")
                .cloned()
                .unwrap_or_else(|| Value::Object(Map::new())),
        ))
    }

    pub fn behaviors(&self) -> Option<&Value> {
        self.value.get("_behaviors")
    }

    /// Consecutive slots this response occupies in its stub's rotation.
    pub fn repeat(&self) -> usize {
        repeat_count(self.behaviors())
    }

    pub fn is_proxy(&self) -> bool {
        self.value.get("proxy").is_some()
    }

    /// An `is` response saved from a proxied call.
    pub fn is_recorded_proxy_response(&self) -> bool {
        self.value
            .get("is")
            .and_then(|is| is.get(PROXY_RESPONSE_TIME))
            .is_some()
    }

    /// Merge `patch` into the object under `field` (e.g. `proxy.mode`).
    pub fn patch(&mut self, field: &str, patch: &Map<String, Value>) {
        let Value::Object(object) = &mut self.value else {
            return;
        };
        let target = object
            .entry(field.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(target) = target {
            for (key, value) in patch {
                target.insert(key.clone(), value.clone());
            }
        }
    }

    /// The template as shown to users, without private markers.
    pub fn to_public_json(&self) -> Value {
        let mut value = self.value.clone();
        if let Some(Value::Object(is)) = value.get_mut("is") {
            is.remove(PROXY_RESPONSE_TIME);
        }
        value
    }
}

/// The `proxy` block of a response template.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyConfig {
    /// Destination, e.g. `http://origin:8080` or `tcp://host:port`
    pub to: String,
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub predicate_generators: Vec<Value>,
    #[serde(default)]
    pub add_wait_behavior: bool,
    #[serde(default)]
    pub add_decorate_behavior: Option<String>,
    /// The block as configured, handed to the proxy transport
    #[serde(skip)]
    pub raw: Value,
}

impl ProxyConfig {
    pub fn from_value(value: &Value) -> Result<Self> {
        let mut config: ProxyConfig =
            serde_json::from_value(value.clone()).map_err(|e| ImposterError::Validation {
                message: "malformed proxy response".to_string(),
                fragment: Some(value.clone()),
                data: Some(e.to_string()),
            })?;
        config.raw = value.clone();
        Ok(config)
    }

    /// Configured mode, if it is one of the known modes.
    pub fn proxy_mode(&self) -> Option<ProxyMode> {
        ProxyMode::parse(self.mode.as_deref())
    }
}

/// A stub definition: predicates plus responses.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StubDefinition {
    pub predicates: Vec<Predicate>,
    pub responses: Vec<ResponseTemplate>,
}

impl StubDefinition {
    pub fn new(predicates: Vec<Predicate>, responses: Vec<ResponseTemplate>) -> Self {
        Self {
            predicates,
            responses,
        }
    }

    /// Parse `{predicates?, responses?}`.
    pub fn from_value(value: &Value) -> Result<Self> {
        let predicates = Predicate::parse_all(value.get("predicates"))?;
        let responses = match value.get("responses") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => items.iter().cloned().map(ResponseTemplate::new).collect(),
            Some(_) => {
                return Err(ImposterError::validation_with_source(
                    "'responses' must be a non-empty array",
                    value.clone(),
                ))
            }
        };
        Ok(Self::new(predicates, responses))
    }

    /// JSON form; empty predicate lists are omitted.
    pub fn to_json(&self) -> Value {
        let mut object = Map::new();
        if !self.predicates.is_empty() {
            object.insert(
                "predicates".to_string(),
                Value::Array(self.predicates.iter().map(|p| p.source().clone()).collect()),
            );
        }
        object.insert(
            "responses".to_string(),
            Value::Array(self.responses.iter().map(ResponseTemplate::to_public_json).collect()),
        );
        Value::Object(object)
    }
}

/// Imposter configuration as accepted by the control plane.
///
/// Stubs stay raw JSON so they can be upcast, validated and reported
/// against the exact fragment the user sent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ImposterConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default = "default_protocol")]
    pub protocol: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// `binary` switches predicate matching to base64 decoding
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(default)]
    pub record_requests: bool,
    /// Record which stub matched each request
    #[serde(default)]
    pub record_matches: bool,
    #[serde(default)]
    pub stubs: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_of_request_resolver: Option<Value>,
}

fn default_protocol() -> String {
    "http".to_string()
}

impl ImposterConfig {
    /// Upcast, then parse.
    pub fn from_value(mut value: Value) -> Result<Self> {
        super::upcast::upcast(&mut value);
        serde_json::from_value(value.clone()).map_err(|e| ImposterError::Validation {
            message: "malformed imposter configuration".to_string(),
            fragment: Some(value),
            data: Some(e.to_string()),
        })
    }

    pub fn stub_definitions(&self) -> Result<Vec<StubDefinition>> {
        self.stubs.iter().map(StubDefinition::from_value).collect()
    }
}
