//! Extraction methods: regex, JSONPath, XPath.
//!
//! Shared by the copy and lookup behaviors, the predicate `xpath`/`jsonpath`
//! parameters and proxy predicate generators. Unparseable input never fails:
//! it yields no selection and a log line.

use crate::error::{ImposterError, Result};
use crate::logging::ScopedLogger;
use regex::RegexBuilder;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use serde_json_path::JsonPath;

/// XPath selector with an optional prefix -> namespace URI map.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct XPathSelector {
    pub selector: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub ns: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct JsonPathSelector {
    pub selector: String,
}

/// Regex flags accepted under `using.options`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegexOptions {
    #[serde(default)]
    pub ignore_case: bool,
    #[serde(default)]
    pub multiline: bool,
}

/// Method for extracting values from a request field (`using` block).
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "method", rename_all = "lowercase")]
pub enum ExtractionMethod {
    /// Regular expression; yields the full match followed by capture groups
    Regex {
        selector: String,
        #[serde(default)]
        options: RegexOptions,
    },
    /// JSONPath expression
    #[serde(rename = "jsonpath")]
    JsonPath { selector: String },
    /// XPath expression for XML
    #[serde(rename = "xpath")]
    XPath {
        selector: String,
        #[serde(default, skip_serializing_if = "Map::is_empty")]
        ns: Map<String, Value>,
    },
}

impl ExtractionMethod {
    pub fn selector(&self) -> &str {
        match self {
            ExtractionMethod::Regex { selector, .. }
            | ExtractionMethod::JsonPath { selector }
            | ExtractionMethod::XPath { selector, .. } => selector,
        }
    }

    /// Apply extraction to a value, returning every selected value in order.
    pub fn values(&self, text: &str, logger: &ScopedLogger) -> Result<Vec<String>> {
        let values = match self {
            ExtractionMethod::Regex { selector, options } => regex_values(text, selector, options)?,
            ExtractionMethod::JsonPath { selector } => match select_jsonpath(selector, text, logger) {
                Some(Value::Array(items)) => items.iter().map(value_to_string).collect(),
                Some(other) => vec![value_to_string(&other)],
                None => Vec::new(),
            },
            ExtractionMethod::XPath { selector, ns } => match select_xpath(selector, ns, text, logger) {
                Some(Value::Array(items)) => items.iter().map(value_to_string).collect(),
                Some(other) => vec![value_to_string(&other)],
                None => Vec::new(),
            },
        };

        if values.is_empty() {
            logger.debug(format!(
                "no match for {} against {}",
                Value::String(self.selector().to_string()),
                Value::String(text.to_string())
            ));
        }
        Ok(values)
    }
}

/// Render a scalar the way string concatenation would; structures as JSON.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

/// Full match followed by each capture group (unmatched groups are empty).
pub fn regex_values(text: &str, selector: &str, options: &RegexOptions) -> Result<Vec<String>> {
    let re = RegexBuilder::new(selector)
        .case_insensitive(options.ignore_case)
        .multi_line(options.multiline)
        .build()
        .map_err(|e| ImposterError::Validation {
            message: format!("invalid regular expression {}", Value::String(selector.to_string())),
            fragment: Some(Value::String(selector.to_string())),
            data: Some(e.to_string()),
        })?;

    Ok(match re.captures(text) {
        Some(caps) => caps
            .iter()
            .map(|m| m.map(|m| m.as_str().to_string()).unwrap_or_default())
            .collect(),
        None => Vec::new(),
    })
}

/// Select with JSONPath from text holding JSON.
///
/// Returns `None` when the text is not JSON, the selector is invalid or
/// nothing matched; a single match is unwrapped, several are an array.
pub fn select_jsonpath(selector: &str, text: &str, logger: &ScopedLogger) -> Option<Value> {
    let json: Value = match serde_json::from_str(text) {
        Ok(json) => json,
        Err(_) => {
            logger.warn(format!("Cannot parse as JSON: {}", Value::String(text.to_string())));
            return None;
        }
    };

    let path = match JsonPath::parse(selector) {
        Ok(path) => path,
        Err(e) => {
            logger.warn(format!("Invalid JSONPath selector {selector}: {e}"));
            return None;
        }
    };

    let nodes: Vec<Value> = path.query(&json).all().into_iter().cloned().collect();
    unwrap_single(nodes)
}

/// Select with XPath from text holding XML.
///
/// Node sets become the string values of their nodes in document order;
/// boolean, number and string results are returned as-is.
pub fn select_xpath(
    selector: &str,
    ns: &Map<String, Value>,
    text: &str,
    logger: &ScopedLogger,
) -> Option<Value> {
    use sxd_document::parser;
    use sxd_xpath::{Context, Factory, Value as XValue};

    let package = match parser::parse(text) {
        Ok(package) => package,
        Err(_) => {
            logger.warn(format!("Cannot parse as XML: {}", Value::String(text.to_string())));
            return None;
        }
    };
    let document = package.as_document();

    let xpath = match Factory::new().build(selector) {
        Ok(Some(xpath)) => xpath,
        Ok(None) | Err(_) => {
            logger.warn(format!("Invalid XPath selector {selector}"));
            return None;
        }
    };

    let mut context = Context::new();
    for (prefix, uri) in ns {
        if let Some(uri) = uri.as_str() {
            context.set_namespace(prefix, uri);
        }
    }

    match xpath.evaluate(&context, document.root()) {
        Ok(XValue::Nodeset(nodes)) => unwrap_single(
            nodes
                .document_order()
                .iter()
                .map(|node| Value::String(node.string_value()))
                .collect(),
        ),
        Ok(XValue::Boolean(b)) => Some(Value::Bool(b)),
        Ok(XValue::Number(n)) => serde_json::Number::from_f64(n).map(Value::Number),
        Ok(XValue::String(s)) => Some(Value::String(s)),
        Err(e) => {
            logger.warn(format!("XPath evaluation failed for {selector}: {e}"));
            None
        }
    }
}

fn unwrap_single(mut values: Vec<Value>) -> Option<Value> {
    match values.len() {
        0 => None,
        1 => values.pop(),
        _ => Some(Value::Array(values)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn logger() -> ScopedLogger {
        ScopedLogger::new("test")
    }

    #[test]
    fn test_regex_values_full_match_then_groups() {
        let values = regex_values("/users/123/orders/9", r"/users/(\d+)/orders/(\d+)", &RegexOptions::default()).unwrap();
        assert_eq!(values, vec!["/users/123/orders/9", "123", "9"]);
    }

    #[test]
    fn test_regex_values_no_match() {
        let values = regex_values("abc", r"\d+", &RegexOptions::default()).unwrap();
        assert!(values.is_empty());
    }

    #[test]
    fn test_regex_values_options() {
        let options = RegexOptions {
            ignore_case: true,
            multiline: true,
        };
        let values = regex_values("first\nSECOND", "^second$", &options).unwrap();
        assert_eq!(values, vec!["SECOND"]);
    }

    #[test]
    fn test_regex_values_invalid_pattern() {
        let err = regex_values("abc", "(", &RegexOptions::default()).unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn test_extraction_jsonpath() {
        let method = ExtractionMethod::JsonPath {
            selector: "$.user.name".to_string(),
        };
        let json = r#"{"user": {"name": "Alice", "age": 30}}"#;
        assert_eq!(method.values(json, &logger()).unwrap(), vec!["Alice"]);
    }

    #[test]
    fn test_extraction_jsonpath_multiple() {
        let method = ExtractionMethod::JsonPath {
            selector: "$.items[*].id".to_string(),
        };
        let json = r#"{"items": [{"id": 1}, {"id": 2}]}"#;
        assert_eq!(method.values(json, &logger()).unwrap(), vec!["1", "2"]);
    }

    #[test]
    fn test_select_jsonpath_non_json_is_none() {
        assert_eq!(select_jsonpath("$.a", "not json", &logger()), None);
    }

    #[test]
    fn test_select_xpath_nodes() {
        let xml = "<books><book>One</book><book>Two</book></books>";
        assert_eq!(
            select_xpath("//book", &Map::new(), xml, &logger()),
            Some(json!(["One", "Two"]))
        );
        assert_eq!(
            select_xpath("//book[1]", &Map::new(), xml, &logger()),
            Some(json!("One"))
        );
    }

    #[test]
    fn test_select_xpath_with_namespace() {
        let xml = r#"<root xmlns:b="http://example.com/book"><b:title>Rift</b:title></root>"#;
        let mut ns = Map::new();
        ns.insert("bk".to_string(), json!("http://example.com/book"));
        assert_eq!(
            select_xpath("//bk:title", &ns, xml, &logger()),
            Some(json!("Rift"))
        );
    }

    #[test]
    fn test_select_xpath_scalar_results() {
        let xml = "<a><b/><b/></a>";
        assert_eq!(
            select_xpath("count(//b)", &Map::new(), xml, &logger()),
            Some(json!(2.0))
        );
        assert_eq!(
            select_xpath("boolean(//c)", &Map::new(), xml, &logger()),
            Some(json!(false))
        );
    }

    #[test]
    fn test_select_xpath_invalid_xml_is_none() {
        assert_eq!(select_xpath("//a", &Map::new(), "{\"a\": 1}", &logger()), None);
    }

    #[test]
    fn test_extraction_method_deserialize() {
        let method: ExtractionMethod =
            serde_json::from_value(json!({"method": "regex", "selector": "\\w+", "options": {"ignoreCase": true}}))
                .unwrap();
        assert_eq!(
            method,
            ExtractionMethod::Regex {
                selector: "\\w+".to_string(),
                options: RegexOptions {
                    ignore_case: true,
                    multiline: false
                }
            }
        );
    }
}
