//! Key and value transforms applied to both sides of a comparison.
//!
//! For string values the order is: base64 decode, case fold, strip `except`
//! matches, then (request side only) apply the `xpath`/`jsonpath` selector.
//! Arrays are sorted so multi-valued fields compare independent of order.

use super::{Encoding, PredicateOptions};
use crate::behaviors::extraction::{select_jsonpath, select_xpath};
use crate::logging::ScopedLogger;
use base64::Engine;
use regex::{Regex, RegexBuilder};
use serde_json::{Map, Value};
use std::cmp::Ordering;

/// Resolved transform settings for one normalization pass.
pub(super) struct Normalizer<'a> {
    lower_keys: bool,
    lower_values: bool,
    except: Option<Regex>,
    encoding: Encoding,
    selectors: Option<&'a PredicateOptions>,
    force_selected_strings: bool,
    sort_arrays: bool,
    logger: &'a ScopedLogger,
}

impl<'a> Normalizer<'a> {
    /// Transforms for the given case rules and `except` pattern.
    pub(super) fn new(
        case_sensitive: bool,
        key_case_sensitive: Option<bool>,
        except: Option<&str>,
        encoding: Encoding,
        logger: &'a ScopedLogger,
    ) -> Self {
        let key_case_sensitive = key_case_sensitive.unwrap_or(case_sensitive);
        Self {
            lower_keys: !key_case_sensitive || !case_sensitive,
            lower_values: !case_sensitive,
            except: except.and_then(|pattern| compile_except(pattern, case_sensitive, logger)),
            encoding,
            selectors: None,
            force_selected_strings: false,
            sort_arrays: true,
            logger,
        }
    }

    /// Apply the predicate's xpath/jsonpath selector to string values.
    pub(super) fn with_selectors(mut self, options: &'a PredicateOptions) -> Self {
        if options.xpath.is_some() || options.jsonpath.is_some() {
            self.selectors = Some(options);
        }
        self
    }

    /// Coerce selected values to strings (deepEquals).
    pub(super) fn force_strings(mut self) -> Self {
        self.force_selected_strings = true;
        self
    }

    /// Keep array order (used when reaching into JSON-encoded strings).
    pub(super) fn without_sorting(mut self) -> Self {
        self.sort_arrays = false;
        self
    }

    /// Normalize a value; `None` means the value disappeared (failed selection).
    pub(super) fn apply(&self, value: &Value) -> Option<Value> {
        match value {
            Value::Array(items) => {
                let mut items: Vec<Value> = items.iter().filter_map(|item| self.apply(item)).collect();
                if self.sort_arrays {
                    sort_values(&mut items);
                }
                Some(Value::Array(items))
            }
            Value::Object(object) => {
                let mut result = Map::new();
                for (key, item) in object {
                    if let Some(item) = self.apply(item) {
                        result.insert(self.key(key), item);
                    }
                }
                Some(Value::Object(result))
            }
            Value::String(text) => self.string(text),
            other => Some(other.clone()),
        }
    }

    fn key(&self, key: &str) -> String {
        if self.lower_keys {
            key.to_lowercase()
        } else {
            key.to_string()
        }
    }

    fn string(&self, text: &str) -> Option<Value> {
        let mut text = match self.encoding {
            Encoding::Utf8 => text.to_string(),
            Encoding::Base64 => decode_base64(text),
        };
        if self.lower_values {
            text = text.to_lowercase();
        }
        if let Some(except) = &self.except {
            text = except.replace_all(&text, "").into_owned();
        }
        match self.selectors {
            Some(options) => self.select(options, &text),
            None => Some(Value::String(text)),
        }
    }

    fn select(&self, options: &PredicateOptions, text: &str) -> Option<Value> {
        let selected = if let Some(jsonpath) = &options.jsonpath {
            let selector = self.fold(&jsonpath.selector);
            select_jsonpath(&selector, text, self.logger)
        } else if let Some(xpath) = &options.xpath {
            let selector = self.fold(&xpath.selector);
            let ns = if self.lower_values {
                xpath
                    .ns
                    .iter()
                    .map(|(prefix, uri)| {
                        let uri = match uri {
                            Value::String(uri) => Value::String(uri.to_lowercase()),
                            other => other.clone(),
                        };
                        (prefix.to_lowercase(), uri)
                    })
                    .collect()
            } else {
                xpath.ns.clone()
            };
            select_xpath(&selector, &ns, text, self.logger)
        } else {
            Some(Value::String(text.to_string()))
        };

        selected.map(|value| {
            let value = if self.force_selected_strings {
                force_strings(&value)
            } else {
                value
            };
            match value {
                Value::Array(mut items) => {
                    sort_values(&mut items);
                    Value::Array(items)
                }
                other => other,
            }
        })
    }

    fn fold(&self, selector: &str) -> String {
        if self.lower_values {
            selector.to_lowercase()
        } else {
            selector.to_string()
        }
    }
}

fn compile_except(pattern: &str, case_sensitive: bool, logger: &ScopedLogger) -> Option<Regex> {
    match RegexBuilder::new(pattern)
        .case_insensitive(!case_sensitive)
        .build()
    {
        Ok(re) => Some(re),
        Err(e) => {
            logger.warn(format!(
                "Invalid except pattern {}: {e}",
                Value::String(pattern.to_string())
            ));
            None
        }
    }
}

fn decode_base64(text: &str) -> String {
    match base64::engine::general_purpose::STANDARD.decode(text) {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(_) => text.to_string(),
    }
}

/// Replace every scalar leaf with its string form (`null` -> `"null"`).
pub(super) fn force_strings(value: &Value) -> Value {
    match value {
        Value::Null => Value::String("null".to_string()),
        Value::Bool(b) => Value::String(b.to_string()),
        Value::Number(n) => Value::String(n.to_string()),
        Value::String(_) => value.clone(),
        Value::Array(items) => Value::Array(items.iter().map(force_strings).collect()),
        Value::Object(object) => Value::Object(
            object
                .iter()
                .map(|(key, item)| (key.clone(), force_strings(item)))
                .collect(),
        ),
    }
}

/// Stable textual form with sorted keys, used for deep comparison.
pub(super) fn canonical(value: &Value) -> String {
    // serde_json maps are ordered by key
    serde_json::to_string(value).unwrap_or_default()
}

/// Sort structures by canonical text and scalars by value.
pub(super) fn sort_values(items: &mut [Value]) {
    items.sort_by(compare_values);
}

fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::String(a), Value::String(b)) => a.cmp(b),
        (Value::Number(a), Value::Number(b)) => a
            .as_f64()
            .partial_cmp(&b.as_f64())
            .unwrap_or(Ordering::Equal),
        _ => canonical(a).cmp(&canonical(b)),
    }
}
