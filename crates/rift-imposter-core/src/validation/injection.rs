//! Detection of injection surfaces in raw stub JSON.

use crate::error::ImposterError;
use serde_json::Value;

pub(crate) const JAVASCRIPT_DISALLOWED: &str =
    "JavaScript injection is not allowed unless mb is run with the --allowInjection flag";
pub(crate) const SHELL_DISALLOWED: &str =
    "Shell execution is not allowed unless mb is run with the --allowInjection flag";

/// Injection errors for a stub when injection is not permitted.
pub fn disallowed_injections(stub: &Value) -> Vec<ImposterError> {
    let mut errors = Vec::new();
    if has_javascript_injection(stub) {
        errors.push(ImposterError::injection_disallowed(JAVASCRIPT_DISALLOWED, stub.clone()));
    }
    if has_shell_injection(stub) {
        errors.push(ImposterError::injection_disallowed(SHELL_DISALLOWED, stub.clone()));
    }
    errors
}

/// Injection error for an `endOfRequestResolver` that runs JavaScript.
pub fn disallowed_resolver_injection(resolver: &Value) -> Option<ImposterError> {
    resolver
        .get("inject")
        .map(|_| ImposterError::injection_disallowed(JAVASCRIPT_DISALLOWED, resolver.clone()))
}

/// True if the stub runs JavaScript anywhere: predicate `inject`, response
/// `inject`, `decorate`, a function-valued `wait`, a predicate generator
/// `inject` or a proxy `addDecorateBehavior`.
pub fn has_javascript_injection(stub: &Value) -> bool {
    let predicates = stub
        .get("predicates")
        .and_then(Value::as_array)
        .map(|predicates| predicates.iter().any(predicate_has_injection))
        .unwrap_or(false);

    predicates || responses(stub).any(response_has_injection)
}

/// True if any response pipes through external commands.
pub fn has_shell_injection(stub: &Value) -> bool {
    responses(stub).any(|response| {
        response
            .get("_behaviors")
            .and_then(|behaviors| behaviors.get("shellTransform"))
            .is_some()
    })
}

fn responses(stub: &Value) -> impl Iterator<Item = &Value> {
    stub.get("responses")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
}

fn predicate_has_injection(predicate: &Value) -> bool {
    if predicate.get("inject").is_some() {
        return true;
    }
    if let Some(inner) = predicate.get("not") {
        return predicate_has_injection(inner);
    }
    ["or", "and"].iter().any(|combinator| {
        predicate
            .get(*combinator)
            .and_then(Value::as_array)
            .map(|children| children.iter().any(predicate_has_injection))
            .unwrap_or(false)
    })
}

fn response_has_injection(response: &Value) -> bool {
    if response.get("inject").is_some() {
        return true;
    }
    if let Some(behaviors) = response.get("_behaviors") {
        if behaviors.get("decorate").is_some() || behaviors.get("wait").map(Value::is_string).unwrap_or(false) {
            return true;
        }
    }
    let Some(proxy) = response.get("proxy") else {
        return false;
    };
    let generator_inject = proxy
        .get("predicateGenerators")
        .and_then(Value::as_array)
        .map(|generators| generators.iter().any(|g| g.get("inject").is_some()))
        .unwrap_or(false);
    generator_inject || proxy.get("addDecorateBehavior").is_some()
}
