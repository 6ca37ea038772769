//! Dry-run validation of imposter configurations.
//!
//! Each response of each stub is resolved twice against a synthetic request
//! of the imposter's protocol: once under the stub's predicates and once
//! without them, so predicate errors surface even when the predicates would
//! not match and the response is always exercised. Every run uses its own
//! throwaway repository and resolver, a [`DryRunProxy`] and a logger that
//! only keeps errors.

use super::injection::{disallowed_injections, disallowed_resolver_injection};
use crate::behaviors;
use crate::config::EngineConfig;
use crate::error::{ImposterError, Result};
use crate::imposter::{upcast, DryRunProxy, ProxyTransport, Request, ResponseResolver, StubDefinition, StubRepository};
use crate::logging::ScopedLogger;
use crate::predicate::Encoding;
use crate::scripting::new_shared_state;
use futures::future::join_all;
use serde::Serialize;
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;

/// Extra caller-supplied check merged into the result.
pub type AdditionalValidator = Arc<dyn Fn(&Value) -> Vec<ImposterError> + Send + Sync>;

/// Outcome of validating one imposter configuration.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResult {
    pub is_valid: bool,
    pub errors: Vec<ImposterError>,
}

impl ValidationResult {
    fn from_errors(errors: Vec<ImposterError>) -> Self {
        Self {
            is_valid: errors.is_empty(),
            errors,
        }
    }
}

/// Validates imposter configurations without side effects.
#[derive(Clone)]
pub struct DryRunValidator {
    allow_injection: bool,
    additional: Option<AdditionalValidator>,
    logger: ScopedLogger,
}

impl fmt::Debug for DryRunValidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DryRunValidator")
            .field("allow_injection", &self.allow_injection)
            .field("additional", &self.additional.is_some())
            .finish()
    }
}

impl DryRunValidator {
    pub fn new(engine: &EngineConfig) -> Self {
        Self {
            allow_injection: engine.allow_injection,
            additional: None,
            logger: ScopedLogger::new("validator"),
        }
    }

    pub fn with_logger(mut self, logger: ScopedLogger) -> Self {
        self.logger = logger;
        self
    }

    pub fn with_additional_validator(mut self, validator: AdditionalValidator) -> Self {
        self.additional = Some(validator);
        self
    }

    /// Validate an imposter configuration (`{protocol, mode?, stubs,
    /// endOfRequestResolver?}`). The input is not modified.
    pub async fn validate(&self, config: &Value) -> ValidationResult {
        let mut config = config.clone();
        upcast(&mut config);

        let protocol = config
            .get("protocol")
            .and_then(Value::as_str)
            .unwrap_or("http")
            .to_string();
        let encoding = Encoding::for_mode(config.get("mode").and_then(Value::as_str));
        let test_request = Request::dry_run(&protocol).to_value();

        let mut errors = Vec::new();
        match config.get("stubs") {
            None | Some(Value::Null) => {}
            Some(Value::Array(stubs)) => {
                for stub in stubs {
                    let stub_errors = self.validate_stub(stub, encoding, &test_request).await;
                    push_unique(&mut errors, stub_errors);
                }
            }
            Some(other) => errors.push(ImposterError::validation_with_source(
                "'stubs' must be an array",
                other.clone(),
            )),
        }

        if let Some(resolver) = config.get("endOfRequestResolver") {
            if !self.allow_injection {
                errors.extend(disallowed_resolver_injection(resolver));
            }
        }

        if let Some(additional) = &self.additional {
            push_unique(&mut errors, additional(&config));
        }

        ValidationResult::from_errors(errors)
    }

    async fn validate_stub(&self, stub: &Value, encoding: Encoding, test_request: &Value) -> Vec<ImposterError> {
        let mut errors = Vec::new();

        let responses = stub.get("responses").and_then(Value::as_array);
        if responses.map(Vec::is_empty).unwrap_or(true) {
            errors.push(ImposterError::validation_with_source(
                "'responses' must be a non-empty array",
                stub.clone(),
            ));
        }
        if !self.allow_injection {
            errors.extend(disallowed_injections(stub));
        }
        for response in responses.into_iter().flatten() {
            errors.extend(behaviors::validate(response.get("_behaviors")));
        }

        if !errors.is_empty() {
            return errors;
        }

        let runs = responses.into_iter().flatten().flat_map(|response| {
            let with_predicates = json!({
                "predicates": stub.get("predicates").cloned().unwrap_or_else(|| json!([])),
                "responses": [response]
            });
            let without_predicates = json!({ "responses": [response] });
            [with_predicates, without_predicates]
        });
        let outcomes = join_all(runs.map(|variant| self.dry_run(variant, encoding, test_request))).await;

        for outcome in outcomes {
            if let Err(error) = outcome {
                push_unique(&mut errors, vec![error.or_source(stub)]);
            }
        }
        errors
    }

    /// Resolve a single-response stub in a disposable repository.
    async fn dry_run(&self, stub: Value, encoding: Encoding, test_request: &Value) -> Result<()> {
        let logger = self.logger.silenced();
        let definition = StubDefinition::from_value(&stub)?;

        let repository = StubRepository::new(encoding);
        repository.add_stub(definition, None);
        let transport: Arc<dyn ProxyTransport> = Arc::new(DryRunProxy);
        let resolver = ResponseResolver::new(repository.clone(), Some(transport), None);

        let state = new_shared_state();
        let mut matched = repository.get_response_for(test_request, &logger, &state)?;
        resolver
            .resolve(&mut matched, test_request, &logger, &state, None)
            .await?;
        Ok(())
    }
}

fn push_unique(errors: &mut Vec<ImposterError>, new: Vec<ImposterError>) {
    for error in new {
        if !errors.contains(&error) {
            errors.push(error);
        }
    }
}
