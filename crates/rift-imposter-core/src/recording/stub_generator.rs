//! Stub generation from proxied requests and responses.
//!
//! `predicateGenerators` describe which request fields a recorded stub
//! should match on. Each generator either names fields under `matches`
//! (optionally with `predicateOperator`, `caseSensitive`, `except`, `xpath`
//! or `jsonpath`) or supplies an `inject` function returning predicates.

use crate::behaviors::extraction::{
    select_jsonpath, select_xpath, value_to_string, JsonPathSelector, XPathSelector,
};
use crate::error::{ImposterError, Result};
use crate::logging::ScopedLogger;
use crate::predicate::PredicateOperator;
use crate::scripting::{injection_failure, run_script_blocking, ScriptCall};
use serde_json::{Map, Value};

/// Marker carried by recorded proxy responses: proxy latency in ms.
pub const PROXY_RESPONSE_TIME: &str = "_proxyResponseTime";

/// Selector a generator applies to request fields before recording them.
enum Selector {
    Identity,
    XPath(XPathSelector),
    JsonPath(JsonPathSelector),
}

impl Selector {
    fn for_generator(generator: &Map<String, Value>) -> Self {
        if let Some(xpath) = generator
            .get("xpath")
            .and_then(|v| serde_json::from_value::<XPathSelector>(v.clone()).ok())
        {
            return Selector::XPath(xpath);
        }
        if let Some(jsonpath) = generator
            .get("jsonpath")
            .and_then(|v| serde_json::from_value::<JsonPathSelector>(v.clone()).ok())
        {
            return Selector::JsonPath(jsonpath);
        }
        Selector::Identity
    }

    /// Value to record for a request field; `None` leaves the field out.
    fn value_of(&self, field: Option<&Value>, logger: &ScopedLogger) -> Option<Value> {
        let text = || field.map(value_to_string).unwrap_or_default();
        match self {
            Selector::Identity => field.cloned(),
            Selector::XPath(xpath) => Some(selection_value(select_xpath(
                &xpath.selector,
                &xpath.ns,
                &text(),
                logger,
            ))),
            Selector::JsonPath(jsonpath) => Some(selection_value(select_jsonpath(
                &jsonpath.selector,
                &text(),
                logger,
            ))),
        }
    }
}

/// Empty string for no selection, the value for one, a sorted list for many.
fn selection_value(selected: Option<Value>) -> Value {
    match selected {
        None => Value::String(String::new()),
        Some(Value::Array(mut items)) => {
            items.sort_by_key(value_to_string);
            Value::Array(items)
        }
        Some(value) => value,
    }
}

/// Build the predicates a recorded stub matches on.
pub async fn predicates_for(
    request: &Value,
    generators: &[Value],
    logger: &ScopedLogger,
) -> Result<Vec<Value>> {
    let mut predicates = Vec::new();
    for generator in generators {
        let Some(generator) = generator.as_object() else {
            continue;
        };

        if let Some(source) = generator.get("inject").and_then(Value::as_str) {
            predicates.extend(injected_predicates(source, request, logger).await?);
            continue;
        }

        let selector = Selector::for_generator(generator);
        let operator = generator.get("predicateOperator").and_then(Value::as_str);
        let base: Map<String, Value> = generator
            .iter()
            .filter(|(key, _)| key.as_str() != "matches" && key.as_str() != "predicateOperator")
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();

        let Some(matches) = generator.get("matches").and_then(Value::as_object) else {
            continue;
        };

        for (field, matcher) in matches {
            let request_field = request.get(field);
            let mut operand = Map::new();
            let operator = match operator {
                None if matcher == &Value::Bool(true) => {
                    if let Some(value) = selector.value_of(request_field, logger) {
                        operand.insert(field.clone(), value);
                    }
                    "deepEquals"
                }
                Some("exists") => {
                    operand.insert(field.clone(), exists_map(request_field));
                    "exists"
                }
                Some(operator) => {
                    if let Some(value) = selector.value_of(request_field, logger) {
                        operand.insert(field.clone(), value);
                    }
                    match PredicateOperator::from_key(operator) {
                        Some(known) => known.key(),
                        None => {
                            logger.warn(format!("unknown predicateOperator '{operator}', recording with equals"));
                            "equals"
                        }
                    }
                }
                None => {
                    if let Some(value) = build_equals(request_field, matcher, &selector, logger) {
                        operand.insert(field.clone(), value);
                    }
                    "equals"
                }
            };

            let mut predicate = base.clone();
            predicate.insert(operator.to_string(), Value::Object(operand));
            predicates.push(Value::Object(predicate));
        }
    }
    Ok(predicates)
}

/// Mirror a request field's structure with `true` at every leaf.
fn exists_map(field: Option<&Value>) -> Value {
    match field {
        Some(Value::Object(object)) => Value::Object(
            object
                .iter()
                .map(|(key, value)| (key.clone(), exists_map(Some(value))))
                .collect(),
        ),
        Some(_) => Value::Bool(true),
        None => Value::Bool(false),
    }
}

/// Select the parts of a request field named by a nested matcher object.
fn build_equals(
    field: Option<&Value>,
    matcher: &Value,
    selector: &Selector,
    logger: &ScopedLogger,
) -> Option<Value> {
    match (field, matcher) {
        (Some(Value::Object(fields)), Value::Object(matchers)) => {
            let mut result = Map::new();
            for (key, sub_matcher) in matchers {
                if let Some(value) = build_equals(fields.get(key), sub_matcher, selector, logger) {
                    result.insert(key.clone(), value);
                }
            }
            Some(Value::Object(result))
        }
        _ => selector.value_of(field, logger),
    }
}

async fn injected_predicates(source: &str, request: &Value, logger: &ScopedLogger) -> Result<Vec<Value>> {
    let config = serde_json::json!({ "request": request });
    let call = ScriptCall::new(source, "__config")
        .global("__config", config.clone())
        .setup("__config.logger = __logger;");

    match run_script_blocking(call.clone()).await {
        Ok(outcome) => {
            logger.replay(&outcome.logs);
            match outcome.value() {
                Some(Value::Array(predicates)) => Ok(predicates.clone()),
                _ => {
                    logger.error("injection X=> predicate generator did not return an array");
                    Err(ImposterError::injection(
                        "invalid predicateGenerator injection",
                        Value::String(call.injected()),
                        "predicate generator must return an array of predicates",
                    ))
                }
            }
        }
        Err(failure) => Err(injection_failure(
            "invalid predicateGenerator injection",
            &call,
            failure,
            logger,
            Some(&config),
        )),
    }
}

/// Response entry for a recorded stub, tagged with the configured behaviors.
pub fn recorded_response(response: &Value, add_wait_behavior: bool, add_decorate_behavior: Option<&str>) -> Value {
    let mut entry = Map::new();
    entry.insert("is".to_string(), response.clone());

    let mut behaviors = Map::new();
    if add_wait_behavior {
        if let Some(elapsed) = response.get(PROXY_RESPONSE_TIME) {
            behaviors.insert("wait".to_string(), elapsed.clone());
        }
    }
    if let Some(decorate) = add_decorate_behavior {
        behaviors.insert("decorate".to_string(), Value::String(decorate.to_string()));
    }
    if !behaviors.is_empty() {
        entry.insert("_behaviors".to_string(), Value::Object(behaviors));
    }
    Value::Object(entry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn logger() -> ScopedLogger {
        ScopedLogger::new("test")
    }

    fn request() -> Value {
        json!({
            "method": "GET",
            "path": "/books",
            "query": {"author": "Herbert", "page": "2"},
            "headers": {"Accept": "application/json"},
            "body": "<book><title>Dune</title></book>"
        })
    }

    #[tokio::test]
    async fn test_matches_true_generates_deep_equals() {
        let predicates = predicates_for(
            &request(),
            &[json!({"matches": {"path": true, "query": true}})],
            &logger(),
        )
        .await
        .unwrap();
        assert_eq!(
            predicates,
            vec![
                json!({"deepEquals": {"path": "/books"}}),
                json!({"deepEquals": {"query": {"author": "Herbert", "page": "2"}}})
            ]
        );
    }

    #[tokio::test]
    async fn test_nested_matcher_generates_equals_and_copies_parameters() {
        let predicates = predicates_for(
            &request(),
            &[json!({"matches": {"query": {"author": true}}, "caseSensitive": true})],
            &logger(),
        )
        .await
        .unwrap();
        assert_eq!(
            predicates,
            vec![json!({"caseSensitive": true, "equals": {"query": {"author": "Herbert"}}})]
        );
    }

    #[tokio::test]
    async fn test_predicate_operator() {
        let predicates = predicates_for(
            &request(),
            &[
                json!({"matches": {"path": true}, "predicateOperator": "contains"}),
                json!({"matches": {"query": true}, "predicateOperator": "exists"}),
            ],
            &logger(),
        )
        .await
        .unwrap();
        assert_eq!(
            predicates,
            vec![
                json!({"contains": {"path": "/books"}}),
                json!({"exists": {"query": {"author": true, "page": true}}})
            ]
        );
    }

    #[tokio::test]
    async fn test_unknown_predicate_operator_records_equals() {
        let predicates = predicates_for(
            &request(),
            &[json!({"matches": {"path": true}, "predicateOperator": "foo"})],
            &logger(),
        )
        .await
        .unwrap();
        assert_eq!(predicates, vec![json!({"equals": {"path": "/books"}})]);
        assert!(crate::predicate::Predicate::parse_all(Some(&Value::Array(predicates))).is_ok());
    }

    #[tokio::test]
    async fn test_xpath_generator_selects_value() {
        let predicates = predicates_for(
            &request(),
            &[json!({"matches": {"body": true}, "xpath": {"selector": "//title"}})],
            &logger(),
        )
        .await
        .unwrap();
        assert_eq!(
            predicates,
            vec![json!({"xpath": {"selector": "//title"}, "deepEquals": {"body": "Dune"}})]
        );
    }

    #[tokio::test]
    async fn test_inject_generator() {
        let predicates = predicates_for(
            &request(),
            &[json!({"inject": "function (config) { return [{ equals: { method: config.request.method } }]; }"})],
            &logger(),
        )
        .await
        .unwrap();
        assert_eq!(predicates, vec![json!({"equals": {"method": "GET"}})]);
    }

    #[tokio::test]
    async fn test_inject_generator_error() {
        let err = predicates_for(&request(), &[json!({"inject": "function () { return 5; }"})], &logger())
            .await
            .unwrap_err();
        assert_eq!(err.message(), "invalid predicateGenerator injection");
    }

    #[test]
    fn test_recorded_response_behaviors() {
        let response = json!({"statusCode": 200, "_proxyResponseTime": 12});
        assert_eq!(
            recorded_response(&response, true, Some("function () {}")),
            json!({
                "is": {"statusCode": 200, "_proxyResponseTime": 12},
                "_behaviors": {"wait": 12, "decorate": "function () {}"}
            })
        );
        assert_eq!(recorded_response(&response, false, None), json!({"is": response}));
    }
}
