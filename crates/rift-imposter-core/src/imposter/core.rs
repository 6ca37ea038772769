//! Imposter runtime: one stub repository, its resolver and request history.

use super::proxy::ProxyTransport;
use super::repository::StubRepository;
use super::request::Request;
use super::resolver::ResponseResolver;
use super::types::ImposterConfig;
use crate::behaviors::PipelineOptions;
use crate::config::EngineConfig;
use crate::error::Result;
use crate::logging::ScopedLogger;
use crate::predicate::Encoding;
use crate::recording::{InMemoryRequestStore, RequestStore};
use crate::scripting::{new_shared_state, SharedState};
use crate::validation::{disallowed_injections, disallowed_resolver_injection};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::info;

/// Runtime state of an imposter
pub struct Imposter {
    config: ImposterConfig,
    resolver: ResponseResolver,
    requests: Arc<dyn RequestStore>,
    number_of_requests: AtomicU64,
    /// `imposterState` shared with injected predicates and responses
    state: SharedState,
    logger: ScopedLogger,
}

impl Imposter {
    /// Build an imposter from its configuration.
    ///
    /// With a `transport`, proxies run in-process; otherwise they go through
    /// the engine's callback URL. Configurations that inject JavaScript or
    /// shell commands are rejected unless the engine allows injection.
    pub fn new(
        config: ImposterConfig,
        engine: &EngineConfig,
        transport: Option<Arc<dyn ProxyTransport>>,
    ) -> Result<Self> {
        let scope = match config.port {
            Some(port) => format!("{}:{}", config.protocol, port),
            None => config.protocol.clone(),
        };
        let logger = match &config.name {
            Some(name) => ScopedLogger::new(format!("{scope} {name}")),
            None => ScopedLogger::new(scope),
        };

        if !engine.allow_injection {
            let resolver_error = config
                .end_of_request_resolver
                .as_ref()
                .and_then(disallowed_resolver_injection);
            let first = config
                .stubs
                .iter()
                .flat_map(disallowed_injections)
                .chain(resolver_error)
                .next();
            if let Some(error) = first {
                logger.error(format!("Rejected imposter: {}", error.message()));
                return Err(error);
            }
        }

        let stubs = StubRepository::new(Encoding::for_mode(config.mode.as_deref()));
        stubs.overwrite_stubs(config.stub_definitions()?);

        let resolver = ResponseResolver::new(stubs, transport, engine.callback_base())
            .with_pipeline_options(PipelineOptions {
                shell_transform_timeout: engine.shell_transform_timeout(),
            });

        info!(
            "Imposter {} created with {} stubs",
            logger.scope(),
            resolver.stubs().len()
        );

        Ok(Self {
            config,
            resolver,
            requests: Arc::new(InMemoryRequestStore::new()),
            number_of_requests: AtomicU64::new(0),
            state: new_shared_state(),
            logger,
        })
    }

    /// Use an external store for request history.
    pub fn with_request_store(mut self, store: Arc<dyn RequestStore>) -> Self {
        self.requests = store;
        self
    }

    pub fn config(&self) -> &ImposterConfig {
        &self.config
    }

    pub fn stubs(&self) -> &StubRepository {
        self.resolver.stubs()
    }

    pub fn resolver(&self) -> &ResponseResolver {
        &self.resolver
    }

    pub fn logger(&self) -> &ScopedLogger {
        &self.logger
    }

    pub fn state(&self) -> &SharedState {
        &self.state
    }

    /// Match and resolve a request, returning the wire response.
    pub async fn get_response_for(&self, request: &Request, request_details: Option<Value>) -> Result<Value> {
        self.number_of_requests.fetch_add(1, Ordering::SeqCst);
        let request = request.to_value();

        if self.config.record_requests {
            let mut recorded = request.clone();
            if let Value::Object(object) = &mut recorded {
                object.insert("timestamp".to_string(), json!(chrono::Utc::now().to_rfc3339()));
            }
            self.requests.save_request(recorded).await;
        }

        let mut matched = self
            .resolver
            .stubs()
            .get_response_for(&request, &self.logger, &self.state)?;
        let resolution = self
            .resolver
            .resolve(&mut matched, &request, &self.logger, &self.state, request_details)
            .await?;

        if self.config.record_matches {
            if let Some(response) = resolution.response() {
                matched.recorder().record(response).await;
            }
        }
        Ok(self.resolver.to_wire(&resolution))
    }

    /// Complete an out-of-process proxy call.
    pub async fn get_proxy_response_for(&self, proxy_response: Value, key: u64) -> Result<Value> {
        let resolution = self
            .resolver
            .resolve_proxy(proxy_response, key, &self.logger)
            .await?;
        if self.config.record_matches {
            resolution.recorder.record(&resolution.response).await;
        }
        Ok(resolution.response)
    }

    pub async fn get_requests(&self) -> Vec<Value> {
        self.requests.get_requests().await
    }

    pub async fn get_count(&self) -> usize {
        self.requests.get_count().await
    }

    /// Requests seen, recorded or not.
    pub fn number_of_requests(&self) -> u64 {
        self.number_of_requests.load(Ordering::SeqCst)
    }

    pub async fn reset_requests(&self) {
        self.requests.delete_requests().await;
        self.number_of_requests.store(0, Ordering::SeqCst);
    }

    /// Imposter configuration with the live stub list.
    pub async fn to_json(&self, include_matches: bool) -> Value {
        let mut value = serde_json::to_value(&self.config).unwrap_or_else(|_| json!({}));
        let stubs = self.stubs().to_json(include_matches).await;
        if let Value::Object(object) = &mut value {
            object.insert("stubs".to_string(), stubs);
            object.insert(
                "numberOfRequests".to_string(),
                json!(self.number_of_requests()),
            );
            if self.config.record_requests {
                object.insert("requests".to_string(), Value::Array(self.get_requests().await));
            }
        }
        value
    }
}
