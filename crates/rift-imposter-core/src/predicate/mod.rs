//! Mountebank-compatible predicate system for request matching.
//!
//! A predicate is a tree: leaf operators (`equals`, `deepEquals`, `contains`,
//! `startsWith`, `endsWith`, `matches`, `exists`), the `inject` leaf running
//! user code, and the `not`/`or`/`and` combinators. Parameters
//! (`caseSensitive`, `keyCaseSensitive`, `except`, `xpath`, `jsonpath`) alter
//! how operand values are extracted and compared.
//!
//! # Module Structure
//!
//! - `normalize` - Key/value transforms applied before comparison
//! - `evaluator` - Operator semantics, combinators and predicate injection
//!
//! Predicates are parsed from JSON once, when a stub is created. The parsed
//! form keeps the original JSON so stubs can be compared and snapshotted
//! exactly as they were configured.

mod evaluator;
mod normalize;

pub use evaluator::{evaluate, stub_matches};

use crate::behaviors::extraction::{JsonPathSelector, XPathSelector};
use crate::error::{ImposterError, Result};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use std::fmt;

/// How string values in the request are encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Encoding {
    #[default]
    Utf8,
    /// Binary mode: values are base64 and decoded before comparison
    Base64,
}

impl Encoding {
    /// Encoding for an imposter `mode` (`binary` or `text`).
    pub fn for_mode(mode: Option<&str>) -> Self {
        match mode {
            Some("binary") => Encoding::Base64,
            _ => Encoding::Utf8,
        }
    }
}

/// Leaf comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PredicateOperator {
    Equals,
    DeepEquals,
    Contains,
    StartsWith,
    EndsWith,
    Matches,
    Exists,
}

impl PredicateOperator {
    pub fn key(&self) -> &'static str {
        match self {
            PredicateOperator::Equals => "equals",
            PredicateOperator::DeepEquals => "deepEquals",
            PredicateOperator::Contains => "contains",
            PredicateOperator::StartsWith => "startsWith",
            PredicateOperator::EndsWith => "endsWith",
            PredicateOperator::Matches => "matches",
            PredicateOperator::Exists => "exists",
        }
    }

    pub(crate) fn from_key(key: &str) -> Option<Self> {
        Some(match key {
            "equals" => PredicateOperator::Equals,
            "deepEquals" => PredicateOperator::DeepEquals,
            "contains" => PredicateOperator::Contains,
            "startsWith" => PredicateOperator::StartsWith,
            "endsWith" => PredicateOperator::EndsWith,
            "matches" => PredicateOperator::Matches,
            "exists" => PredicateOperator::Exists,
            _ => return None,
        })
    }
}

impl fmt::Display for PredicateOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// The shape of one predicate node.
#[derive(Debug, Clone)]
pub enum PredicateNode {
    Leaf {
        operator: PredicateOperator,
        fields: Value,
    },
    Not(Box<Predicate>),
    Or(Vec<Predicate>),
    And(Vec<Predicate>),
    Inject(String),
}

/// Parameters altering how values are extracted and compared.
#[derive(Debug, Clone, Default)]
pub struct PredicateOptions {
    pub case_sensitive: bool,
    pub key_case_sensitive: Option<bool>,
    pub except: Option<String>,
    pub xpath: Option<XPathSelector>,
    pub jsonpath: Option<JsonPathSelector>,
}

/// A parsed predicate together with the JSON it was parsed from.
#[derive(Debug, Clone, Deserialize)]
#[serde(try_from = "Value")]
pub struct Predicate {
    node: PredicateNode,
    options: PredicateOptions,
    source: Value,
}

impl PartialEq for Predicate {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl Serialize for Predicate {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.source.serialize(serializer)
    }
}

impl TryFrom<Value> for Predicate {
    type Error = ImposterError;

    fn try_from(value: Value) -> Result<Self> {
        Predicate::parse(&value)
    }
}

const OPERATOR_KEYS: &[&str] = &[
    "equals",
    "deepEquals",
    "contains",
    "startsWith",
    "endsWith",
    "matches",
    "exists",
    "not",
    "or",
    "and",
    "inject",
];

impl Predicate {
    /// Parse one predicate object.
    pub fn parse(value: &Value) -> Result<Self> {
        let object = value
            .as_object()
            .ok_or_else(|| ImposterError::validation_with_source("missing predicate", value.clone()))?;

        let operator = object
            .keys()
            .find(|key| OPERATOR_KEYS.contains(&key.as_str()))
            .ok_or_else(|| ImposterError::validation_with_source("missing predicate", value.clone()))?;
        let operand = &object[operator.as_str()];

        let node = match operator.as_str() {
            "not" => PredicateNode::Not(Box::new(Predicate::parse(operand)?)),
            "or" | "and" => {
                let children = operand
                    .as_array()
                    .ok_or_else(|| {
                        ImposterError::validation_with_source(
                            format!("the {operator} predicate must be an array"),
                            value.clone(),
                        )
                    })?
                    .iter()
                    .map(Predicate::parse)
                    .collect::<Result<Vec<_>>>()?;
                if operator == "or" {
                    PredicateNode::Or(children)
                } else {
                    PredicateNode::And(children)
                }
            }
            "inject" => {
                let source = operand.as_str().ok_or_else(|| {
                    ImposterError::validation_with_source(
                        "the inject predicate must be a function string",
                        value.clone(),
                    )
                })?;
                PredicateNode::Inject(source.to_string())
            }
            key => {
                let operator = PredicateOperator::from_key(key)
                    .ok_or_else(|| ImposterError::validation_with_source("missing predicate", value.clone()))?;
                if !operand.is_object() {
                    return Err(ImposterError::validation_with_source(
                        format!("the {operator} predicate must be an object"),
                        value.clone(),
                    ));
                }
                PredicateNode::Leaf {
                    operator,
                    fields: operand.clone(),
                }
            }
        };

        Ok(Predicate {
            node,
            options: parse_options(value)?,
            source: value.clone(),
        })
    }

    /// Parse a predicate list; a missing or null list is empty.
    pub fn parse_all(value: Option<&Value>) -> Result<Vec<Predicate>> {
        match value {
            None | Some(Value::Null) => Ok(Vec::new()),
            Some(Value::Array(items)) => items.iter().map(Predicate::parse).collect(),
            Some(other) => Err(ImposterError::validation_with_source(
                "'predicates' must be an array",
                other.clone(),
            )),
        }
    }

    pub fn node(&self) -> &PredicateNode {
        &self.node
    }

    pub fn options(&self) -> &PredicateOptions {
        &self.options
    }

    pub fn source(&self) -> &Value {
        &self.source
    }

    /// True when this predicate or any nested child runs injected code.
    pub fn has_injection(&self) -> bool {
        match &self.node {
            PredicateNode::Inject(_) => true,
            PredicateNode::Not(inner) => inner.has_injection(),
            PredicateNode::Or(children) | PredicateNode::And(children) => {
                children.iter().any(Predicate::has_injection)
            }
            PredicateNode::Leaf { .. } => false,
        }
    }
}

fn parse_options(value: &Value) -> Result<PredicateOptions> {
    let parse_selector = |key: &str| -> Result<Option<Value>> {
        match value.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(selector @ Value::Object(_)) => Ok(Some(selector.clone())),
            Some(_) => Err(ImposterError::validation_with_source(
                format!("the {key} predicate parameter must be an object with a selector"),
                value.clone(),
            )),
        }
    };

    let xpath = parse_selector("xpath")?
        .map(serde_json::from_value::<XPathSelector>)
        .transpose()
        .map_err(|e| invalid_parameter(value, "xpath", e))?;
    let jsonpath = parse_selector("jsonpath")?
        .map(serde_json::from_value::<JsonPathSelector>)
        .transpose()
        .map_err(|e| invalid_parameter(value, "jsonpath", e))?;

    Ok(PredicateOptions {
        case_sensitive: value.get("caseSensitive").map(is_truthy).unwrap_or(false),
        key_case_sensitive: value.get("keyCaseSensitive").map(is_truthy),
        except: value
            .get("except")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string),
        xpath,
        jsonpath,
    })
}

fn invalid_parameter(value: &Value, key: &str, e: serde_json::Error) -> ImposterError {
    ImposterError::Validation {
        message: format!("malformed {key} predicate parameter"),
        fragment: Some(value.clone()),
        data: Some(e.to_string()),
    }
}

/// JavaScript truthiness of a JSON value.
pub(crate) fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0 && !f.is_nan()).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}
