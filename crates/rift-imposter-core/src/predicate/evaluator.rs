//! Predicate evaluation against a normalized request.
//!
//! Expected and actual values are normalized with the same transforms, then
//! compared field by field. Request fields holding JSON text are parsed so
//! predicates can reach into encoded bodies. Array handling:
//!
//! - both sides arrays: every expected element must match some actual element
//! - only the actual side an array: the expected value must match one element
//!
//! `or`/`and` (and the implicit `and` over a stub's predicate list) evaluate
//! every child before combining, so a dry run exercises each injected
//! predicate even when an earlier child already decides the result.

use super::normalize::{canonical, force_strings, Normalizer};
use super::{is_truthy, Encoding, Predicate, PredicateNode, PredicateOperator, PredicateOptions};
use crate::error::{ImposterError, Result};
use crate::logging::ScopedLogger;
use crate::scripting::{
    check_syntax, downcast_injection_config, injection_failure, run_with_states, ScriptCall,
    SharedState,
};
use regex::RegexBuilder;
use serde_json::{json, Map, Value};

/// Check whether all predicates of a stub hold for the request.
///
/// An empty predicate list matches everything.
pub fn stub_matches(
    predicates: &[Predicate],
    request: &Value,
    encoding: Encoding,
    logger: &ScopedLogger,
    state: &SharedState,
) -> Result<bool> {
    let results = predicates
        .iter()
        .map(|predicate| evaluate(predicate, request, encoding, logger, state))
        .collect::<Result<Vec<bool>>>()?;
    Ok(results.into_iter().all(|matched| matched))
}

/// Evaluate one predicate tree.
pub fn evaluate(
    predicate: &Predicate,
    request: &Value,
    encoding: Encoding,
    logger: &ScopedLogger,
    state: &SharedState,
) -> Result<bool> {
    match predicate.node() {
        PredicateNode::Leaf { operator, fields } => {
            evaluate_leaf(*operator, fields, predicate, request, encoding, logger)
        }
        PredicateNode::Not(inner) => Ok(!evaluate(inner, request, encoding, logger, state)?),
        PredicateNode::Or(children) => {
            let results = evaluate_all(children, request, encoding, logger, state)?;
            Ok(results.into_iter().any(|matched| matched))
        }
        PredicateNode::And(children) => {
            let results = evaluate_all(children, request, encoding, logger, state)?;
            Ok(results.into_iter().all(|matched| matched))
        }
        PredicateNode::Inject(source) => evaluate_inject(source, request, logger, state),
    }
}

fn evaluate_all(
    children: &[Predicate],
    request: &Value,
    encoding: Encoding,
    logger: &ScopedLogger,
    state: &SharedState,
) -> Result<Vec<bool>> {
    let results: Vec<Result<bool>> = children
        .iter()
        .map(|child| evaluate(child, request, encoding, logger, state))
        .collect();
    results.into_iter().collect()
}

/// Comparison settings threaded through the recursive field walk.
struct Comparison<'a> {
    options: &'a PredicateOptions,
    exists: bool,
    logger: &'a ScopedLogger,
    source: &'a Value,
    compare: fn(&Value, &Value, &Comparison<'_>) -> Result<bool>,
}

impl Comparison<'_> {
    fn json_normalizer(&self) -> Normalizer<'_> {
        Normalizer::new(
            self.options.case_sensitive,
            self.options.key_case_sensitive,
            self.options.except.as_deref(),
            Encoding::Utf8,
            self.logger,
        )
        .without_sorting()
    }

    /// Parse JSON held in a string field, normalizing keys and values.
    fn try_json(&self, text: &str) -> Value {
        match serde_json::from_str::<Value>(text) {
            Ok(parsed) => self
                .json_normalizer()
                .apply(&parsed)
                .unwrap_or(Value::String(text.to_string())),
            Err(_) => Value::String(text.to_string()),
        }
    }
}

fn evaluate_leaf(
    operator: PredicateOperator,
    fields: &Value,
    predicate: &Predicate,
    request: &Value,
    encoding: Encoding,
    logger: &ScopedLogger,
) -> Result<bool> {
    let options = predicate.options();

    if encoding == Encoding::Base64 {
        if options.xpath.is_some() {
            return Err(binary_mode_error("the xpath predicate parameter", predicate));
        }
        if options.jsonpath.is_some() {
            return Err(binary_mode_error("the jsonpath predicate parameter", predicate));
        }
        if operator == PredicateOperator::Matches {
            return Err(binary_mode_error("the matches predicate", predicate));
        }
    }

    let mut comparison = Comparison {
        options,
        exists: operator == PredicateOperator::Exists,
        logger,
        source: predicate.source(),
        compare: equals,
    };

    match operator {
        PredicateOperator::DeepEquals => {
            return deep_equals(fields, request, encoding, &comparison);
        }
        PredicateOperator::Matches => {
            // Patterns keep their case; keys still fold unless caseSensitive
            let case_sensitive = options.case_sensitive;
            let expected = Normalizer::new(true, Some(case_sensitive), None, encoding, logger).apply(fields);
            let actual = Normalizer::new(
                true,
                Some(case_sensitive),
                options.except.as_deref(),
                encoding,
                logger,
            )
            .with_selectors(options)
            .apply(request);
            comparison.compare = matches;
            return satisfied(expected.as_ref(), actual.as_ref(), &comparison);
        }
        PredicateOperator::Equals => comparison.compare = equals,
        PredicateOperator::Contains => comparison.compare = contains,
        PredicateOperator::StartsWith => comparison.compare = starts_with,
        PredicateOperator::EndsWith => comparison.compare = ends_with,
        PredicateOperator::Exists => comparison.compare = exists,
    }

    let expected = Normalizer::new(
        options.case_sensitive,
        options.key_case_sensitive,
        options.except.as_deref(),
        encoding,
        logger,
    )
    .apply(fields);
    let actual = Normalizer::new(
        options.case_sensitive,
        options.key_case_sensitive,
        options.except.as_deref(),
        encoding,
        logger,
    )
    .with_selectors(options)
    .apply(request);

    satisfied(expected.as_ref(), actual.as_ref(), &comparison)
}

fn satisfied(expected: Option<&Value>, actual: Option<&Value>, comparison: &Comparison<'_>) -> Result<bool> {
    match expected {
        Some(expected) => predicate_satisfied(expected, actual, comparison),
        None => Ok(false),
    }
}

fn binary_mode_error(what: &str, predicate: &Predicate) -> ImposterError {
    ImposterError::validation_with_source(
        format!("{what} is not allowed in binary mode"),
        predicate.source().clone(),
    )
}

fn predicate_satisfied(expected: &Value, actual: Option<&Value>, comparison: &Comparison<'_>) -> Result<bool> {
    let actual = match actual {
        Some(actual) if is_truthy(actual) => actual,
        _ => return Ok(false),
    };

    let parsed;
    let actual = match actual {
        Value::String(text) => {
            parsed = comparison.try_json(text);
            &parsed
        }
        other => other,
    };

    for (field, expected_value) in entries(expected) {
        let actual_value = field_of(actual, &field);
        let matched = match (expected_value, actual_value) {
            (Value::Array(expected_items), Some(Value::Array(actual_items))) => {
                let mut all = true;
                for expected_item in expected_items {
                    if !any_matches(expected_item, actual_items, comparison)? {
                        all = false;
                        break;
                    }
                }
                all
            }
            (expected_value, Some(Value::Array(actual_items))) => {
                if comparison.exists && is_truthy(expected_value) {
                    true
                } else {
                    any_matches(expected_value, actual_items, comparison)?
                }
            }
            (expected_value @ (Value::Object(_) | Value::Array(_)), actual_value) => {
                predicate_satisfied(expected_value, actual_value, comparison)?
            }
            (expected_value, actual_value) => test_predicate(expected_value, actual_value, comparison)?,
        };

        if !matched {
            return Ok(false);
        }
    }
    Ok(true)
}

fn any_matches(expected: &Value, actual_items: &[Value], comparison: &Comparison<'_>) -> Result<bool> {
    for actual in actual_items {
        if test_predicate(expected, Some(actual), comparison)? {
            return Ok(true);
        }
    }
    Ok(false)
}

fn test_predicate(expected: &Value, actual: Option<&Value>, comparison: &Comparison<'_>) -> Result<bool> {
    let empty = Value::String(String::new());
    let actual = actual.unwrap_or(&empty);
    match expected {
        Value::Object(_) | Value::Array(_) => predicate_satisfied(expected, Some(actual), comparison),
        _ => (comparison.compare)(expected, actual, comparison),
    }
}

fn entries(value: &Value) -> Vec<(String, &Value)> {
    match value {
        Value::Object(object) => object.iter().map(|(k, v)| (k.clone(), v)).collect(),
        Value::Array(items) => items.iter().enumerate().map(|(i, v)| (i.to_string(), v)).collect(),
        _ => Vec::new(),
    }
}

fn field_of<'v>(value: &'v Value, field: &str) -> Option<&'v Value> {
    match value {
        Value::Object(object) => object.get(field),
        Value::Array(items) => field.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    }
}

/// String form of a scalar; structures have none.
fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null => Some("null".to_string()),
        Value::Array(_) | Value::Object(_) => None,
    }
}

fn compare_text(expected: &Value, actual: &Value, f: impl Fn(&str, &str) -> bool) -> Result<bool> {
    Ok(match (scalar_text(expected), scalar_text(actual)) {
        (Some(expected), Some(actual)) => f(&expected, &actual),
        _ => false,
    })
}

fn equals(expected: &Value, actual: &Value, _: &Comparison<'_>) -> Result<bool> {
    compare_text(expected, actual, |e, a| e == a)
}

fn contains(expected: &Value, actual: &Value, _: &Comparison<'_>) -> Result<bool> {
    compare_text(expected, actual, |e, a| a.contains(e))
}

fn starts_with(expected: &Value, actual: &Value, _: &Comparison<'_>) -> Result<bool> {
    compare_text(expected, actual, |e, a| a.starts_with(e))
}

fn ends_with(expected: &Value, actual: &Value, _: &Comparison<'_>) -> Result<bool> {
    compare_text(expected, actual, |e, a| a.ends_with(e))
}

fn exists(expected: &Value, actual: &Value, _: &Comparison<'_>) -> Result<bool> {
    let present = !matches!(actual, Value::String(s) if s.is_empty());
    Ok(if is_truthy(expected) { present } else { !present })
}

fn matches(expected: &Value, actual: &Value, comparison: &Comparison<'_>) -> Result<bool> {
    let (Some(pattern), Some(text)) = (scalar_text(expected), scalar_text(actual)) else {
        return Ok(false);
    };
    let re = RegexBuilder::new(&pattern)
        .case_insensitive(!comparison.options.case_sensitive)
        .build()
        .map_err(|e| ImposterError::Validation {
            message: format!("invalid regular expression {}", Value::String(pattern.clone())),
            fragment: Some(comparison.source.clone()),
            data: Some(e.to_string()),
        })?;
    Ok(re.is_match(&text))
}

fn deep_equals(fields: &Value, request: &Value, encoding: Encoding, comparison: &Comparison<'_>) -> Result<bool> {
    let options = comparison.options;
    let normalizer = || {
        Normalizer::new(
            options.case_sensitive,
            options.key_case_sensitive,
            options.except.as_deref(),
            encoding,
            comparison.logger,
        )
    };

    let Some(expected) = normalizer().apply(&force_strings(fields)) else {
        return Ok(false);
    };
    let actual = normalizer()
        .with_selectors(options)
        .force_strings()
        .apply(&force_strings(request))
        .unwrap_or(Value::Null);

    for (field, expected_value) in entries(&expected) {
        let mut actual_value = field_of(&actual, &field).cloned();

        // Reach into JSON-encoded string fields such as HTTP bodies
        if let (Value::Object(_) | Value::Array(_), Some(Value::String(text))) = (expected_value, &actual_value) {
            let possible_json = comparison.try_json(text);
            actual_value = Normalizer::new(
                options.case_sensitive,
                options.key_case_sensitive,
                options.except.as_deref(),
                Encoding::Utf8,
                comparison.logger,
            )
            .apply(&force_strings(&possible_json));
        }

        match actual_value {
            Some(actual_value) if canonical(&actual_value) == canonical(expected_value) => {}
            _ => return Ok(false),
        }
    }
    Ok(true)
}

fn evaluate_inject(source: &str, request: &Value, logger: &ScopedLogger, state: &SharedState) -> Result<bool> {
    let mut config = Map::new();
    config.insert("request".to_string(), request.clone());
    downcast_injection_config(&mut config);
    let config = Value::Object(config);

    let call = ScriptCall::new(source, "__config, __logger, __state")
        .global("__config", config.clone())
        .setup("__config.state = __state; __config.logger = __logger;");

    if request.get("isDryRun") == Some(&Value::Bool(true)) {
        // Dry runs compile the function but never invoke it
        return match check_syntax(source) {
            Ok(()) => Ok(true),
            Err(message) => {
                logger.error(format!("injection X=> {message}"));
                logger.error(format!("    source: {}", Value::String(call.injected())));
                Err(ImposterError::injection(
                    "invalid predicate injection",
                    json!(call.injected()),
                    message,
                ))
            }
        };
    }

    match run_with_states(call.clone(), &[(state, "__state")]) {
        Ok(outcome) => {
            logger.replay(&outcome.logs);
            Ok(outcome.value().map(is_truthy).unwrap_or(false))
        }
        Err(failure) => Err(injection_failure(
            "invalid predicate injection",
            &call,
            failure,
            logger,
            Some(&config),
        )),
    }
}
