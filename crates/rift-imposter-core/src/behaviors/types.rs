//! Configuration types for response behaviors.

use super::extraction::ExtractionMethod;
use crate::error::{ImposterError, Result};
use serde::Deserialize;
use serde_json::Value;

/// Parsed `_behaviors` block of a response.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseBehaviors {
    /// Add latency before the response is produced
    #[serde(default)]
    pub wait: Option<WaitBehavior>,

    /// Number of consecutive times the response is served before rotating
    #[serde(default)]
    pub repeat: Option<u64>,

    /// Copy request values into response tokens.
    /// A single object is accepted as a one-element list.
    #[serde(default, deserialize_with = "one_or_many")]
    pub copy: Vec<CopyBehavior>,

    /// Replace tokens with a row from an external data source
    #[serde(default, deserialize_with = "one_or_many")]
    pub lookup: Vec<LookupBehavior>,

    /// External commands that rewrite the response, run in order
    #[serde(default, deserialize_with = "one_or_many")]
    pub shell_transform: Vec<String>,

    /// JavaScript function post-processing the response
    #[serde(default)]
    pub decorate: Option<String>,
}

impl ResponseBehaviors {
    pub fn from_value(config: &Value) -> Result<Self> {
        serde_json::from_value(config.clone()).map_err(|e| ImposterError::Validation {
            message: "malformed _behaviors".to_string(),
            fragment: Some(config.clone()),
            data: Some(e.to_string()),
        })
    }
}

/// `wait` accepts milliseconds, a `{min, max}` range, or text holding
/// either a number or a zero-argument function returning one.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum WaitBehavior {
    Millis(f64),
    Range { min: u64, max: u64 },
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CopyBehavior {
    /// Request field name, or a single-key object naming a nested field
    pub from: Value,
    /// Token to replace in response fields
    pub into: String,
    pub using: ExtractionMethod,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LookupBehavior {
    pub key: LookupKey,
    pub from_data_source: DataSource,
    pub into: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LookupKey {
    pub from: Value,
    pub using: ExtractionMethod,
    /// Which extracted value is the key
    #[serde(default)]
    pub index: usize,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DataSource {
    pub csv: CsvDataSource,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CsvDataSource {
    pub path: String,
    pub key_column: String,
    #[serde(default = "default_delimiter")]
    pub delimiter: String,
}

fn default_delimiter() -> String {
    ",".to_string()
}

fn one_or_many<'de, D, T>(deserializer: D) -> std::result::Result<Vec<T>, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Deserialize<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany<T> {
        Many(Vec<T>),
        One(T),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::Many(items) => items,
        OneOrMany::One(item) => vec![item],
    })
}

/// How many consecutive slots a response occupies in its stub's rotation.
pub fn repeat_count(behaviors: Option<&Value>) -> usize {
    behaviors
        .and_then(|b| b.get("repeat"))
        .and_then(Value::as_u64)
        .filter(|n| *n > 0)
        .map(|n| n as usize)
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_response_behaviors_serde() {
        let yaml = r#"
wait: 500
repeat: 3
copy:
  - from: path
    into: "${PATH}"
    using:
      method: regex
      selector: ".*"
"#;
        let behaviors: ResponseBehaviors = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(behaviors.wait, Some(WaitBehavior::Millis(500.0)));
        assert_eq!(behaviors.repeat, Some(3));
        assert_eq!(behaviors.copy.len(), 1);
    }

    #[test]
    fn test_single_copy_object_accepted() {
        let behaviors = ResponseBehaviors::from_value(&json!({
            "copy": {"from": "path", "into": "$P", "using": {"method": "regex", "selector": ".*"}}
        }))
        .unwrap();
        assert_eq!(behaviors.copy.len(), 1);
    }

    #[test]
    fn test_wait_variants() {
        let range: WaitBehavior = serde_json::from_value(json!({"min": 10, "max": 20})).unwrap();
        assert_eq!(range, WaitBehavior::Range { min: 10, max: 20 });
        let text: WaitBehavior = serde_json::from_value(json!("function () { return 5; }")).unwrap();
        assert!(matches!(text, WaitBehavior::Text(_)));
    }

    #[test]
    fn test_lookup_defaults() {
        let behaviors = ResponseBehaviors::from_value(&json!({
            "lookup": [{
                "key": {"from": "path", "using": {"method": "regex", "selector": "\\w+$"}},
                "fromDataSource": {"csv": {"path": "data.csv", "keyColumn": "name"}},
                "into": "${row}"
            }]
        }))
        .unwrap();
        assert_eq!(behaviors.lookup[0].key.index, 0);
        assert_eq!(behaviors.lookup[0].from_data_source.csv.delimiter, ",");
    }

    #[test]
    fn test_repeat_count() {
        assert_eq!(repeat_count(None), 1);
        assert_eq!(repeat_count(Some(&json!({"repeat": 3}))), 3);
        assert_eq!(repeat_count(Some(&json!({"repeat": 0}))), 1);
        assert_eq!(repeat_count(Some(&json!({"wait": 3}))), 1);
    }
}
