//! Response resolution: turns a matched template into a response.
//!
//! `is` responses are cloned, `inject` responses run user code and `proxy`
//! responses are forwarded. Proxying is either in-process (a
//! [`ProxyTransport`] is configured) or two-phase: the resolver parks a
//! pending resolution under an integer key and hands the caller a callback
//! URL; the caller performs the network hop and reports back through
//! [`ResponseResolver::resolve_proxy`].

use super::proxy::ProxyTransport;
use super::repository::{MatchRecorder, MatchedResponse, StubRepository};
use super::types::{ProxyConfig, ResponseKind, ResponseTemplate, StubDefinition};
use crate::behaviors::{self, PipelineOptions};
use crate::error::{ImposterError, Result};
use crate::logging::ScopedLogger;
use crate::predicate::{is_truthy, Predicate};
use crate::recording::{predicates_for, recorded_response, ProxyMode, PROXY_RESPONSE_TIME};
use crate::scripting::{
    check_syntax, downcast_injection_config, injection_failure, new_shared_state, run_with_states_blocking,
    ScriptCall, SharedState,
};
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Outcome of [`ResponseResolver::resolve`].
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Final response
    Response(Value),
    /// Out-of-process proxy instruction; the caller proxies and calls back
    Proxy {
        proxy: Value,
        request: Value,
        callback_url: String,
    },
}

impl Resolution {
    pub fn response(&self) -> Option<&Value> {
        match self {
            Resolution::Response(response) => Some(response),
            Resolution::Proxy { .. } => None,
        }
    }

    pub fn is_proxy(&self) -> bool {
        matches!(self, Resolution::Proxy { .. })
    }
}

/// Response produced by a completed out-of-process proxy call.
#[derive(Debug, Clone)]
pub struct ProxyResolution {
    pub response: Value,
    /// Match recorder of the stub that issued the proxy
    pub recorder: MatchRecorder,
    /// Details the listener attached when the proxy was issued
    pub request_details: Option<Value>,
}

struct PendingProxyResolution {
    template: ResponseTemplate,
    request: Value,
    started: Instant,
    request_details: Option<Value>,
    recorder: MatchRecorder,
}

/// Resolves matched templates for one imposter.
pub struct ResponseResolver {
    stubs: StubRepository,
    transport: Option<Arc<dyn ProxyTransport>>,
    callback_url: Option<String>,
    pending: Mutex<HashMap<u64, PendingProxyResolution>>,
    next_key: AtomicU64,
    /// State private to response injections of this resolver
    inject_state: SharedState,
    options: PipelineOptions,
}

impl fmt::Debug for ResponseResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseResolver")
            .field("in_process", &self.transport.is_some())
            .field("callback_url", &self.callback_url)
            .field("pending", &self.pending.lock().len())
            .finish()
    }
}

impl ResponseResolver {
    pub fn new(
        stubs: StubRepository,
        transport: Option<Arc<dyn ProxyTransport>>,
        callback_url: Option<String>,
    ) -> Self {
        Self {
            stubs,
            transport,
            callback_url,
            pending: Mutex::new(HashMap::new()),
            next_key: AtomicU64::new(0),
            inject_state: new_shared_state(),
            options: PipelineOptions::default(),
        }
    }

    pub fn with_pipeline_options(mut self, options: PipelineOptions) -> Self {
        self.options = options;
        self
    }

    pub fn stubs(&self) -> &StubRepository {
        &self.stubs
    }

    /// Without an in-process transport, proxies go through callbacks and
    /// final responses are wrapped as `{response}`.
    pub fn is_out_of_process(&self) -> bool {
        self.transport.is_none()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Resolve a matched template against the request.
    pub async fn resolve(
        &self,
        matched: &mut MatchedResponse,
        request: &Value,
        logger: &ScopedLogger,
        imposter_state: &SharedState,
        request_details: Option<Value>,
    ) -> Result<Resolution> {
        let template = matched.template().clone();
        let request = request.clone();

        match template.kind()? {
            ResponseKind::Is(mut response) => {
                strip_proxy_time(&mut response);
                let response = self.run_behaviors(&request, response, &template, logger).await?;
                Ok(Resolution::Response(response))
            }
            ResponseKind::Inject(source) => {
                let response = self.inject(&source, &request, logger, imposter_state).await?;
                let response = self.run_behaviors(&request, response, &template, logger).await?;
                Ok(Resolution::Response(response))
            }
            ResponseKind::Proxy(config) => {
                self.proxy_and_record(matched, config, request, logger, request_details)
                    .await
            }
        }
    }

    /// Wire form: out-of-process callers get `{response}` or
    /// `{proxy, request, callbackURL}`.
    pub fn to_wire(&self, resolution: &Resolution) -> Value {
        match resolution {
            Resolution::Response(response) if self.is_out_of_process() => json!({ "response": response }),
            Resolution::Response(response) => response.clone(),
            Resolution::Proxy {
                proxy,
                request,
                callback_url,
            } => json!({
                "proxy": proxy,
                "request": request,
                "callbackURL": callback_url
            }),
        }
    }

    /// Complete a pending out-of-process proxy call. Each key resolves once.
    pub async fn resolve_proxy(
        &self,
        proxy_response: Value,
        key: u64,
        logger: &ScopedLogger,
    ) -> Result<ProxyResolution> {
        let pending = self.pending.lock().remove(&key);
        let Some(pending) = pending else {
            logger.error(format!("Invalid proxy resolution key: {key}"));
            return Err(ImposterError::missing_resource(
                "invalid proxy resolution key",
                Value::String(self.callback_for(key)),
            ));
        };

        let config = match pending.template.kind()? {
            ResponseKind::Proxy(config) => config,
            _ => {
                return Err(ImposterError::validation_with_source(
                    "pending proxy resolution does not hold a proxy response",
                    pending.template.as_value().clone(),
                ))
            }
        };

        let elapsed = pending.started.elapsed();
        let mut response = proxy_response;
        stamp_proxy_time(&mut response, elapsed);
        let mut response = self
            .run_behaviors(&pending.request, response, &pending.template, logger)
            .await?;
        stamp_proxy_time(&mut response, elapsed);
        self.record_proxy_response(&pending.template, &config, &pending.request, &response, logger)
            .await?;

        strip_proxy_time(&mut response);
        Ok(ProxyResolution {
            response,
            recorder: pending.recorder,
            request_details: pending.request_details,
        })
    }

    async fn run_behaviors(
        &self,
        request: &Value,
        response: Value,
        template: &ResponseTemplate,
        logger: &ScopedLogger,
    ) -> Result<Value> {
        behaviors::execute(request, response, template.behaviors(), logger, &self.options).await
    }

    async fn proxy_and_record(
        &self,
        matched: &mut MatchedResponse,
        mut config: ProxyConfig,
        request: Value,
        logger: &ScopedLogger,
        request_details: Option<Value>,
    ) -> Result<Resolution> {
        let started = Instant::now();
        if config.proxy_mode().is_none() {
            let mut patch = Map::new();
            patch.insert("mode".to_string(), Value::String(ProxyMode::ProxyOnce.to_string()));
            matched.set_metadata("proxy", patch);
            if let Some(raw) = matched.template().as_value().get("proxy") {
                config = ProxyConfig::from_value(raw)?;
            }
        }
        let template = matched.template().clone();

        if let Some(transport) = &self.transport {
            let mut response = transport
                .to(&config.to, &request, &config.raw, request_details.as_ref())
                .await?;
            let elapsed = started.elapsed();
            stamp_proxy_time(&mut response, elapsed);
            let mut response = self.run_behaviors(&request, response, &template, logger).await?;
            stamp_proxy_time(&mut response, elapsed);
            self.record_proxy_response(&template, &config, &request, &response, logger)
                .await?;
            strip_proxy_time(&mut response);
            return Ok(Resolution::Response(response));
        }

        if self.callback_url.is_none() {
            return Err(ImposterError::validation_with_source(
                "proxy responses need a proxy transport or a callback URL",
                template.as_value().clone(),
            ));
        }

        let key = self.next_key.fetch_add(1, Ordering::SeqCst);
        self.pending.lock().insert(
            key,
            PendingProxyResolution {
                template,
                request: request.clone(),
                started,
                request_details,
                recorder: matched.recorder().clone(),
            },
        );
        let callback_url = self.callback_for(key);
        logger.debug(format!("proxying out of process, callback {callback_url}"));
        Ok(Resolution::Proxy {
            proxy: config.raw,
            request,
            callback_url,
        })
    }

    fn callback_for(&self, key: u64) -> String {
        format!("{}/{}", self.callback_url.as_deref().unwrap_or(""), key)
    }

    /// Save a proxied response according to the proxy mode.
    async fn record_proxy_response(
        &self,
        template: &ResponseTemplate,
        config: &ProxyConfig,
        request: &Value,
        response: &Value,
        logger: &ScopedLogger,
    ) -> Result<()> {
        let mode = config.proxy_mode().unwrap_or_default();
        if !mode.records() {
            return Ok(());
        }

        let predicates = predicates_for(request, &config.predicate_generators, logger).await?;
        let entry = ResponseTemplate::new(recorded_response(
            response,
            config.add_wait_behavior,
            config.add_decorate_behavior.as_deref(),
        ));

        if mode == ProxyMode::ProxyAlways {
            if let Some(index) = self.stubs.index_of_stub_to_add_response_to(template, &predicates) {
                logger.debug(format!("appending proxied response to stub {index}"));
                return self.stubs.add_response_to(index, entry);
            }
        }

        let definition = StubDefinition::new(
            Predicate::parse_all(Some(&Value::Array(predicates)))?,
            vec![entry],
        );
        match mode {
            ProxyMode::ProxyOnce => self.stubs.add_stub(definition, Some(template)),
            _ => self.stubs.add_stub(definition, None),
        };
        Ok(())
    }

    /// Run a response injection.
    ///
    /// Called as `(config, injectState, logger, callback, imposterState)`.
    /// Either a returned value or a value passed to `callback` is the
    /// response. Dry runs only compile the function.
    async fn inject(
        &self,
        source: &str,
        request: &Value,
        logger: &ScopedLogger,
        imposter_state: &SharedState,
    ) -> Result<Value> {
        let mut config = Map::new();
        config.insert("request".to_string(), request.clone());
        downcast_injection_config(&mut config);
        let config = Value::Object(config);

        let call = ScriptCall::new(source, "__config, __injectState, __logger, __callback, __state")
            .global("__config", config.clone())
            .setup("__config.state = __state; __config.logger = __logger; __config.callback = __callback;");

        if request.get("isDryRun").map(is_truthy).unwrap_or(false) {
            if let Err(message) = check_syntax(source) {
                logger.error(format!("injection X=> {message}"));
                return Err(ImposterError::injection(
                    "invalid response injection",
                    Value::String(call.injected()),
                    message,
                ));
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
            return Ok(Value::Object(Map::new()));
        }

        let states = vec![
            (self.inject_state.clone(), "__injectState"),
            (imposter_state.clone(), "__state"),
        ];
        match run_with_states_blocking(call.clone(), states).await {
            Ok(outcome) => {
                logger.replay(&outcome.logs);
                match outcome.value() {
                    Some(response) if !response.is_null() => Ok(response.clone()),
                    _ => {
                        logger.error("injection X=> injected function produced no response");
                        Err(ImposterError::injection(
                            "invalid response injection",
                            Value::String(call.injected()),
                            "injected function must return a response or pass one to the callback",
                        ))
                    }
                }
            }
            Err(failure) => Err(injection_failure(
                "invalid response injection",
                &call,
                failure,
                logger,
                Some(&config),
            )),
        }
    }
}

fn stamp_proxy_time(response: &mut Value, elapsed: Duration) {
    if let Value::Object(object) = response {
        object.insert(
            PROXY_RESPONSE_TIME.to_string(),
            Value::from(elapsed.as_millis() as u64),
        );
    }
}

fn strip_proxy_time(response: &mut Value) {
    if let Value::Object(object) = response {
        object.remove(PROXY_RESPONSE_TIME);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::predicate::Encoding;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    struct FakeTransport {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ProxyTransport for FakeTransport {
        async fn to(&self, destination: &str, request: &Value, _: &Value, _: Option<&Value>) -> Result<Value> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(json!({
                "statusCode": 200,
                "body": format!("{} {} #{}", destination, request["path"].as_str().unwrap_or(""), n)
            }))
        }
    }

    fn logger() -> ScopedLogger {
        ScopedLogger::new("test")
    }

    fn repository(stubs: Value) -> StubRepository {
        let repository = StubRepository::new(Encoding::Utf8);
        for stub in stubs.as_array().unwrap() {
            repository.add_stub(StubDefinition::from_value(stub).unwrap(), None);
        }
        repository
    }

    fn in_process(stubs: Value) -> ResponseResolver {
        let transport: Arc<dyn ProxyTransport> = Arc::new(FakeTransport {
            calls: AtomicUsize::new(0),
        });
        ResponseResolver::new(repository(stubs), Some(transport), None)
    }

    fn out_of_process(stubs: Value) -> ResponseResolver {
        ResponseResolver::new(repository(stubs), None, Some("http://localhost:2525/imposters/3000/_requests".to_string()))
    }

    async fn resolve(resolver: &ResponseResolver, request: Value) -> Result<Resolution> {
        let state = new_shared_state();
        let mut matched = resolver.stubs().get_response_for(&request, &logger(), &state)?;
        resolver.resolve(&mut matched, &request, &logger(), &state, None).await
    }

    #[tokio::test]
    async fn test_is_response_is_cloned_through_behaviors() {
        let resolver = in_process(json!([{
            "responses": [{"is": {"body": "${name}"}, "_behaviors": {
                "copy": {"from": "path", "into": "${name}", "using": {"method": "regex", "selector": "\\w+$"}}
            }}]
        }]));
        let resolution = resolve(&resolver, json!({"path": "/hello/world"})).await.unwrap();
        assert_eq!(resolution, Resolution::Response(json!({"body": "world"})));
        assert_eq!(
            resolver.stubs().stubs()[0].responses[0].as_value()["is"]["body"],
            "${name}"
        );
    }

    #[tokio::test]
    async fn test_multiple_response_types_rejected() {
        let resolver = in_process(json!([{"responses": [{"is": {}, "proxy": {"to": "http://x"}}]}]));
        let err = resolve(&resolver, json!({})).await.unwrap_err();
        assert!(err.is_validation());
        assert_eq!(err.message(), "each response object must have only one response type");
    }

    #[tokio::test]
    async fn test_inject_state_persists_across_calls() {
        let resolver = in_process(json!([{"responses": [{"inject":
            "function (config, injectState) { injectState.n = (injectState.n || 0) + 1; config.state.total = injectState.n; return { body: String(injectState.n) }; }"
        }]}]));
        let state = new_shared_state();
        for expected in ["1", "2"] {
            let mut matched = resolver.stubs().get_response_for(&json!({}), &logger(), &state).unwrap();
            let resolution = resolver.resolve(&mut matched, &json!({}), &logger(), &state, None).await.unwrap();
            assert_eq!(resolution.response().unwrap()["body"], expected);
        }
        assert_eq!(state.lock()["total"], 2);
    }

    #[tokio::test]
    async fn test_inject_callback_and_downcast() {
        let resolver = in_process(json!([{"responses": [{"inject":
            "function (request, state, logger, callback) { callback({ body: request.method + ' ' + request.request.path }); }"
        }]}]));
        let resolution = resolve(&resolver, json!({"method": "GET", "path": "/x"})).await.unwrap();
        assert_eq!(resolution.response().unwrap()["body"], "GET /x");
    }

    #[tokio::test]
    async fn test_inject_errors() {
        let resolver = in_process(json!([{"responses": [{"inject": "function () { throw new Error('boom'); }"}]}]));
        let err = resolve(&resolver, json!({})).await.unwrap_err();
        assert!(err.is_injection());
        assert_eq!(err.message(), "invalid response injection");
        assert_eq!(err.data(), Some("boom"));

        let silent = in_process(json!([{"responses": [{"inject": "function () { }"}]}]));
        assert!(resolve(&silent, json!({})).await.unwrap_err().is_injection());
    }

    #[tokio::test]
    async fn test_inject_dry_run_does_not_execute() {
        let resolver = in_process(json!([{"responses": [{"inject": "function () { throw new Error('ran'); }"}]}]));
        let resolution = resolve(&resolver, json!({"isDryRun": true})).await.unwrap();
        assert_eq!(resolution, Resolution::Response(json!({})));

        let broken = in_process(json!([{"responses": [{"inject": "function ( {"}]}]));
        assert!(resolve(&broken, json!({"isDryRun": true})).await.unwrap_err().is_injection());
    }

    #[tokio::test]
    async fn test_proxy_once_in_process_records_before_proxy() {
        let resolver = in_process(json!([{"responses": [{"proxy": {
            "to": "http://origin",
            "predicateGenerators": [{"matches": {"path": true}}]
        }}]}]));

        let first = resolve(&resolver, json!({"path": "/a"})).await.unwrap();
        assert_eq!(first.response().unwrap()["body"], "http://origin /a #0");
        assert!(first.response().unwrap().get(PROXY_RESPONSE_TIME).is_none());

        let replay = resolve(&resolver, json!({"path": "/a"})).await.unwrap();
        assert_eq!(replay.response().unwrap()["body"], "http://origin /a #0");

        let snapshot = resolver.stubs().to_json(false).await;
        assert_eq!(
            snapshot,
            json!([
                {"predicates": [{"deepEquals": {"path": "/a"}}], "responses": [{"is": {"statusCode": 200, "body": "http://origin /a #0"}}]},
                {"responses": [{"proxy": {"to": "http://origin", "predicateGenerators": [{"matches": {"path": true}}], "mode": "proxyOnce"}}]}
            ])
        );
    }

    #[tokio::test]
    async fn test_proxy_always_appends_to_sibling() {
        let resolver = in_process(json!([{"responses": [{"proxy": {
            "to": "http://origin",
            "mode": "proxyAlways",
            "predicateGenerators": [{"matches": {"path": true}}]
        }}]}]));

        for _ in 0..2 {
            resolve(&resolver, json!({"path": "/a"})).await.unwrap();
        }
        resolve(&resolver, json!({"path": "/b"})).await.unwrap();

        let stubs = resolver.stubs().stubs();
        assert_eq!(stubs.len(), 3);
        assert!(stubs[0].responses[0].is_proxy());
        assert_eq!(stubs[1].responses.len(), 2);
        assert_eq!(stubs[2].responses.len(), 1);
    }

    #[tokio::test]
    async fn test_proxy_transparent_records_nothing() {
        let resolver = in_process(json!([{"responses": [{"proxy": {"to": "http://origin", "mode": "proxyTransparent"}}]}]));
        resolve(&resolver, json!({"path": "/a"})).await.unwrap();
        let second = resolve(&resolver, json!({"path": "/a"})).await.unwrap();
        assert_eq!(second.response().unwrap()["body"], "http://origin /a #1");
        assert_eq!(resolver.stubs().len(), 1);
    }

    #[tokio::test]
    async fn test_recorded_stub_carries_behaviors() {
        let resolver = in_process(json!([{"responses": [{"proxy": {
            "to": "http://origin",
            "addWaitBehavior": true,
            "addDecorateBehavior": "function (config) { config.response.headers = { replayed: 'yes' }; }"
        }}]}]));
        resolve(&resolver, json!({"path": "/"})).await.unwrap();

        let recorded = resolver.stubs().stubs()[0].responses[0].clone();
        let behaviors = recorded.behaviors().unwrap();
        assert!(behaviors["wait"].is_u64());
        assert!(behaviors["decorate"].is_string());

        let replay = resolve(&resolver, json!({"path": "/"})).await.unwrap();
        assert_eq!(replay.response().unwrap()["headers"]["replayed"], "yes");
    }

    #[tokio::test]
    async fn test_out_of_process_proxy_once_round_trip() {
        let resolver = out_of_process(json!([{"responses": [{"proxy": {"to": "http://x", "mode": "proxyOnce"}}]}]));
        let request = json!({"method": "GET", "path": "/"});

        let resolution = resolve(&resolver, request.clone()).await.unwrap();
        let wire = resolver.to_wire(&resolution);
        assert_eq!(wire["proxy"], json!({"to": "http://x", "mode": "proxyOnce"}));
        assert_eq!(wire["request"], request);
        assert_eq!(wire["callbackURL"], "http://localhost:2525/imposters/3000/_requests/0");
        assert_eq!(resolver.pending_count(), 1);

        let resolved = resolver.resolve_proxy(json!({"data": "R"}), 0, &logger()).await.unwrap();
        assert_eq!(resolved.response, json!({"data": "R"}));
        assert_eq!(
            resolver.stubs().to_json(false).await,
            json!([
                {"responses": [{"is": {"data": "R"}}]},
                {"responses": [{"proxy": {"to": "http://x", "mode": "proxyOnce"}}]}
            ])
        );
    }

    #[tokio::test]
    async fn test_proxy_key_is_single_use() {
        let resolver = out_of_process(json!([{"responses": [{"proxy": {"to": "http://x", "mode": "proxyTransparent"}}]}]));
        resolve(&resolver, json!({})).await.unwrap();

        assert!(resolver.resolve_proxy(json!({}), 0, &logger()).await.is_ok());
        let err = resolver.resolve_proxy(json!({}), 0, &logger()).await.unwrap_err();
        assert!(err.is_missing_resource());
        assert_eq!(err.message(), "invalid proxy resolution key");
        assert!(resolver.resolve_proxy(json!({}), 7, &logger()).await.unwrap_err().is_missing_resource());
    }

    #[tokio::test]
    async fn test_resolve_proxy_runs_original_behaviors() {
        let resolver = out_of_process(json!([{"responses": [{
            "proxy": {"to": "http://x", "mode": "proxyTransparent"},
            "_behaviors": {"decorate": "function (config) { config.response.seen = config.request.path; }"}
        }]}]));
        resolve(&resolver, json!({"path": "/orig"})).await.unwrap();
        let resolved = resolver.resolve_proxy(json!({"data": "R"}), 0, &logger()).await.unwrap();
        assert_eq!(resolved.response, json!({"data": "R", "seen": "/orig"}));
    }

    #[tokio::test]
    async fn test_unknown_mode_normalized_to_proxy_once() {
        let resolver = out_of_process(json!([{"responses": [{"proxy": {"to": "http://x", "mode": "bogus"}}]}]));
        resolve(&resolver, json!({})).await.unwrap();
        assert_eq!(
            resolver.stubs().stubs()[0].responses[0].as_value()["proxy"]["mode"],
            "proxyOnce"
        );
    }

    #[tokio::test]
    async fn test_out_of_process_wraps_final_response() {
        let resolver = out_of_process(json!([{"responses": [{"is": {"body": "x"}}]}]));
        let resolution = resolve(&resolver, json!({})).await.unwrap();
        assert_eq!(resolver.to_wire(&resolution), json!({"response": {"body": "x"}}));
    }

    #[tokio::test]
    async fn test_proxy_without_transport_or_callback_fails() {
        let resolver = ResponseResolver::new(
            repository(json!([{"responses": [{"proxy": {"to": "http://x"}}]}])),
            None,
            None,
        );
        assert!(resolve(&resolver, json!({})).await.unwrap_err().is_validation());
    }
}
