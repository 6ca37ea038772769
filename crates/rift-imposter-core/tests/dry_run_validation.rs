//! End-to-end validation of mixed imposter configurations.

use rift_imposter_core::{DryRunValidator, EngineConfig};
use serde_json::{json, Value};

fn validator(allow_injection: bool) -> DryRunValidator {
    DryRunValidator::new(&EngineConfig {
        allow_injection,
        ..Default::default()
    })
}

fn injection_stubs() -> Vec<Value> {
    vec![
        json!({"predicates": [{"inject": "function (config) { return true; }"}], "responses": [{"is": {}}]}),
        json!({"responses": [{"inject": "function (config) { return { statusCode: 200 }; }"}]}),
        json!({"responses": [{"is": {}, "_behaviors": {"wait": "function () { return 10; }"}}]}),
        json!({"responses": [{"is": {}, "_behaviors": {"decorate": "function (config) { config.response.body = 'x'; }"}}]}),
        json!({"responses": [{"is": {}, "_behaviors": {"shellTransform": ["cat"]}}]}),
        json!({"responses": [{"proxy": {"to": "http://origin", "predicateGenerators": [
            {"inject": "function (config) { return [{ equals: { path: config.request.path } }]; }"}
        ]}}]}),
        json!({"responses": [{"proxy": {"to": "http://origin", "addDecorateBehavior": "function (config) {}"}}]}),
    ]
}

#[tokio::test]
async fn test_every_injection_surface_is_gated() {
    for stub in injection_stubs() {
        let config = json!({"protocol": "http", "stubs": [stub.clone()]});

        let denied = validator(false).validate(&config).await;
        assert!(!denied.is_valid, "accepted {stub}");
        assert!(denied.errors.iter().all(|e| e.is_injection()), "{:?}", denied.errors);

        let allowed = validator(true).validate(&config).await;
        assert!(allowed.is_valid, "rejected {stub}: {:?}", allowed.errors);
    }
}

#[tokio::test]
async fn test_errors_accumulate_across_stubs() {
    let config = json!({
        "protocol": "http",
        "stubs": [
            {"responses": [{"is": {"body": "fine"}}]},
            {"responses": []},
            {"predicates": [{"equals": {"path": "/"}}], "responses": [{"is": {}, "_behaviors": {"repeat": "twice"}}]},
            {"responses": [{"is": {}, "_behaviors": {"copy": [
                {"from": "path", "into": "$P", "using": {"method": "regex", "selector": "\\w+"}},
                {"from": "path", "into": "$Q", "using": {"method": "sql", "selector": "x"}}
            ]}}]}
        ]
    });

    let result = validator(false).validate(&config).await;
    assert!(!result.is_valid);
    assert_eq!(result.errors.len(), 3);
    assert_eq!(result.errors[0].message(), "'responses' must be a non-empty array");
    assert!(result.errors[1].message().contains("repeat"));
    assert_eq!(
        result.errors[2].source_fragment(),
        Some(&json!({"from": "path", "into": "$Q", "using": {"method": "sql", "selector": "x"}}))
    );
}

#[tokio::test]
async fn test_legacy_shapes_are_upcast_before_validation() {
    let config = json!({
        "protocol": "tcp",
        "stubs": [{"responses": [
            {"is": {"data": "x"}, "behaviors": [{"wait": 5}, {"shellTransform": "cat"}]},
            {"proxy": {"to": {"host": "localhost", "port": 3000}}}
        ]}]
    });
    let original = config.clone();

    let result = validator(true).validate(&config).await;
    assert!(result.is_valid, "{:?}", result.errors);
    assert_eq!(config, original);
}

#[tokio::test]
async fn test_binary_mode_rejects_selectors() {
    let config = json!({
        "protocol": "tcp",
        "mode": "binary",
        "stubs": [{
            "predicates": [{"equals": {"data": "AQI="}, "jsonpath": {"selector": "$.a"}}],
            "responses": [{"is": {"data": "AQI="}}]
        }]
    });
    let result = validator(false).validate(&config).await;
    assert!(!result.is_valid);
    assert!(result.errors[0].message().contains("binary mode"));
}

#[tokio::test]
async fn test_broken_injections_are_reported_when_allowed() {
    let config = json!({
        "protocol": "http",
        "stubs": [
            {"responses": [{"is": {}, "_behaviors": {"decorate": "function () { throw new Error('bad'); }"}}]},
            {"responses": [{"is": {}, "_behaviors": {"wait": "function () { return ; ) }"}}]},
            {"responses": [{"inject": "function ( { broken"}]}
        ]
    });
    let result = validator(true).validate(&config).await;
    assert_eq!(result.errors.len(), 3, "{:?}", result.errors);
    assert!(result.errors.iter().all(|e| e.is_injection()));
}
