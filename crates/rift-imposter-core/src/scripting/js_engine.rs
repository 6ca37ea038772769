//! Embedded JavaScript execution for injected functions using Boa Engine.
//!
//! Every call runs in a fresh [`Context`]. Values cross the boundary as JSON:
//! globals are converted on the way in and a single `JSON.stringify` of the
//! outcome is parsed on the way out, so nothing script-side leaks between
//! calls.
//!
//! # Calling convention
//!
//! A [`ScriptCall`] names the user function source, the globals it needs,
//! a setup snippet that wires those globals together (e.g. making
//! `config.state` the same object as `imposterState`) and the argument list
//! the function is invoked with. The wrapper provides:
//!
//! - `__logger`: `debug/info/warn/error` methods buffering into `__logs`
//! - `__callback`: records an asynchronously delivered result
//!
//! Promises returned by the function are settled through the job queue
//! before the outcome is collected.

use crate::logging::LogEntry;
use boa_engine::{
    js_string, object::builtins::JsArray, property::Attribute, Context, JsObject, JsResult,
    JsString, JsValue, Script, Source,
};
use serde::Deserialize;
use serde_json::{Map, Value};

/// Create a JavaScript object with proper Object.prototype
fn create_js_object(context: &Context) -> JsObject {
    JsObject::with_object_proto(context.intrinsics())
}

/// Convert JSON Value to JavaScript value
fn json_to_js(context: &mut Context, value: &Value) -> JsResult<JsValue> {
    match value {
        Value::Null => Ok(JsValue::null()),
        Value::Bool(b) => Ok(JsValue::from(*b)),
        Value::Number(n) => {
            if let Some(i) = n.as_i64().and_then(|i| i32::try_from(i).ok()) {
                Ok(JsValue::from(i))
            } else if let Some(f) = n.as_f64() {
                Ok(JsValue::from(f))
            } else {
                Ok(JsValue::null())
            }
        }
        Value::String(s) => Ok(JsValue::from(js_string!(s.clone()))),
        Value::Array(arr) => {
            let js_arr = JsArray::new(context);
            for v in arr {
                let js_val = json_to_js(context, v)?;
                js_arr.push(js_val, context)?;
            }
            Ok(js_arr.into())
        }
        Value::Object(obj) => {
            let js_obj = create_js_object(context);
            for (k, v) in obj {
                let js_val = json_to_js(context, v)?;
                js_obj.set(js_string!(k.clone()), js_val, false, context)?;
            }
            Ok(js_obj.into())
        }
    }
}

const PRELUDE: &str = r#"
var __logs = [];
var __format = function (args) {
    var parts = [];
    for (var i = 0; i < args.length; i += 1) {
        var arg = args[i];
        parts.push(typeof arg === 'string' ? arg : JSON.stringify(arg));
    }
    return parts.join(' ');
};
var __logAt = function (level) {
    return function () { __logs.push({ level: level, message: __format(arguments) }); };
};
var __logger = {
    debug: __logAt('debug'),
    info: __logAt('info'),
    warn: __logAt('warn'),
    error: __logAt('error')
};
var __outcome = { threw: false, called: false };
var __callback = function (value) {
    __outcome.called = true;
    __outcome.callback = value;
};
var __describe = function (e) {
    if (e && e.message !== undefined) { return String(e.message); }
    return String(e);
};
"#;

/// A single invocation of a user-supplied function.
#[derive(Debug, Clone)]
pub struct ScriptCall {
    source: String,
    globals: Vec<(String, Value)>,
    setup: String,
    arguments: String,
    read_back: Vec<String>,
}

impl ScriptCall {
    /// `source` is the function expression, `arguments` the JS argument list.
    pub fn new(source: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            globals: Vec::new(),
            setup: String::new(),
            arguments: arguments.into(),
            read_back: Vec::new(),
        }
    }

    pub fn global(mut self, name: impl Into<String>, value: Value) -> Self {
        self.globals.push((name.into(), value));
        self
    }

    /// JS statements run after globals are defined and before the call.
    pub fn setup(mut self, snippet: impl Into<String>) -> Self {
        self.setup.push_str(&snippet.into());
        self.setup.push('\n');
        self
    }

    /// Globals whose final values are returned in [`ScriptOutcome::globals`].
    pub fn read_back(mut self, name: impl Into<String>) -> Self {
        self.read_back.push(name.into());
        self
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// The literal expression executed, for error reporting.
    pub fn injected(&self) -> String {
        format!("({})({});", self.source, self.arguments)
    }

    fn wrapper(&self) -> String {
        format!(
            r#"
{setup}
try {{
    var __fn = (
{source}
);
    var __result = __fn({arguments});
    if (__result && typeof __result.then === 'function') {{
        __result.then(__callback, function (e) {{
            __outcome.threw = true;
            __outcome.error = __describe(e);
        }});
    }} else {{
        __outcome.result = __result;
    }}
}} catch (e) {{
    __outcome.threw = true;
    __outcome.error = __describe(e);
}}
"#,
            setup = self.setup,
            source = self.source,
            arguments = self.arguments,
        )
    }

    fn finisher(&self) -> String {
        let globals = self
            .read_back
            .iter()
            .map(|name| format!("{name:?}: (typeof {name} === 'undefined' ? null : {name})"))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "JSON.stringify({{ outcome: __outcome, logs: __logs, globals: {{ {globals} }} }});"
        )
    }
}

/// What a script produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScriptOutcome {
    /// Direct return value, `None` when the function returned `undefined`.
    pub result: Option<Value>,
    /// Value passed to the callback (or resolved by a returned promise).
    pub callback: Option<Value>,
    pub globals: Map<String, Value>,
    pub logs: Vec<LogEntry>,
}

impl ScriptOutcome {
    /// Callback value if the function used one, else its return value.
    pub fn value(&self) -> Option<&Value> {
        self.callback.as_ref().or(self.result.as_ref())
    }
}

/// Script failure with the logs gathered before it.
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptFailure {
    pub message: String,
    pub logs: Vec<LogEntry>,
}

impl ScriptFailure {
    pub(crate) fn bare(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            logs: Vec::new(),
        }
    }
}

#[derive(Deserialize)]
struct RawOutcome {
    outcome: RawState,
    #[serde(default)]
    logs: Vec<LogEntry>,
    #[serde(default)]
    globals: Map<String, Value>,
}

#[derive(Deserialize)]
struct RawState {
    #[serde(default)]
    threw: bool,
    #[serde(default)]
    called: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    callback: Option<Value>,
}

/// Run a script call to completion on the current thread.
pub fn run_script(call: &ScriptCall) -> Result<ScriptOutcome, ScriptFailure> {
    let mut context = Context::default();

    for (name, value) in &call.globals {
        let js_value = json_to_js(&mut context, value)
            .map_err(|e| ScriptFailure::bare(format!("Failed to convert {name}: {e}")))?;
        context
            .register_global_property(JsString::from(name.as_str()), js_value, Attribute::all())
            .map_err(|e| ScriptFailure::bare(format!("Failed to set {name}: {e}")))?;
    }

    context
        .eval(Source::from_bytes(PRELUDE))
        .map_err(|e| ScriptFailure::bare(format!("Failed to prepare script context: {e}")))?;

    let wrapper = call.wrapper();
    context
        .eval(Source::from_bytes(wrapper.as_bytes()))
        .map_err(|e| ScriptFailure::bare(e.to_string()))?;

    // Settle promise-based results
    context.run_jobs();

    let finisher = call.finisher();
    let serialized = context
        .eval(Source::from_bytes(finisher.as_bytes()))
        .map_err(|e| ScriptFailure::bare(format!("Failed to serialize script result: {e}")))?;

    let text = serialized
        .as_string()
        .map(|s| s.to_std_string_escaped())
        .ok_or_else(|| ScriptFailure::bare("Script result is not serializable"))?;

    let raw: RawOutcome = serde_json::from_str(&text)
        .map_err(|e| ScriptFailure::bare(format!("Failed to parse script result: {e}")))?;

    if raw.outcome.threw {
        return Err(ScriptFailure {
            message: raw
                .outcome
                .error
                .unwrap_or_else(|| "unknown error".to_string()),
            logs: raw.logs,
        });
    }

    Ok(ScriptOutcome {
        result: raw.outcome.result,
        callback: if raw.outcome.called {
            Some(raw.outcome.callback.unwrap_or(Value::Null))
        } else {
            None
        },
        globals: raw.globals,
        logs: raw.logs,
    })
}

/// Run a script call on the blocking pool.
pub async fn run_script_blocking(call: ScriptCall) -> Result<ScriptOutcome, ScriptFailure> {
    tokio::task::spawn_blocking(move || run_script(&call))
        .await
        .unwrap_or_else(|e| Err(ScriptFailure::bare(format!("Script task failed: {e}"))))
}

/// Parse a function source without running it.
pub fn check_syntax(source: &str) -> Result<(), String> {
    let mut context = Context::default();
    let wrapped = format!("var __fn = (\n{source}\n);");
    Script::parse(Source::from_bytes(wrapped.as_bytes()), None, &mut context)
        .map(|_| ())
        .map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::LogLevel;
    use serde_json::json;

    #[test]
    fn test_direct_return_value() {
        let call = ScriptCall::new("function (config) { return config.a + 1; }", "__config")
            .global("__config", json!({"a": 41}));
        let outcome = run_script(&call).unwrap();
        assert_eq!(outcome.result, Some(json!(42)));
        assert_eq!(outcome.value(), Some(&json!(42)));
    }

    #[test]
    fn test_undefined_return_is_none() {
        let call = ScriptCall::new("function () {}", "");
        let outcome = run_script(&call).unwrap();
        assert_eq!(outcome.result, None);
        assert_eq!(outcome.callback, None);
    }

    #[test]
    fn test_callback_result() {
        let call = ScriptCall::new(
            "function (config, cb) { cb({ statusCode: 201 }); }",
            "__config, __callback",
        )
        .global("__config", json!({}));
        let outcome = run_script(&call).unwrap();
        assert_eq!(outcome.callback, Some(json!({"statusCode": 201})));
        assert_eq!(outcome.value(), Some(&json!({"statusCode": 201})));
    }

    #[test]
    fn test_promise_result_is_settled() {
        let call = ScriptCall::new(
            "function () { return Promise.resolve({ body: 'later' }); }",
            "",
        );
        let outcome = run_script(&call).unwrap();
        assert_eq!(outcome.value(), Some(&json!({"body": "later"})));
    }

    #[test]
    fn test_thrown_error_is_reported_with_logs() {
        let call = ScriptCall::new(
            "function (logger) { logger.warn('about to fail', 3); throw new Error('boom'); }",
            "__logger",
        );
        let failure = run_script(&call).unwrap_err();
        assert_eq!(failure.message, "boom");
        assert_eq!(failure.logs.len(), 1);
        assert_eq!(failure.logs[0].level, LogLevel::Warn);
        assert_eq!(failure.logs[0].message, "about to fail 3");
    }

    #[test]
    fn test_syntax_error_is_failure() {
        let call = ScriptCall::new("function ( { return 1; }", "");
        assert!(run_script(&call).is_err());
    }

    #[test]
    fn test_read_back_mutated_global() {
        let call = ScriptCall::new(
            "function (state) { state.count = (state.count || 0) + 1; }",
            "__state",
        )
        .global("__state", json!({"count": 1}))
        .read_back("__state");
        let outcome = run_script(&call).unwrap();
        assert_eq!(outcome.globals.get("__state"), Some(&json!({"count": 2})));
    }

    #[test]
    fn test_setup_links_objects() {
        let call = ScriptCall::new(
            "function (config) { config.state.seen = true; }",
            "__config",
        )
        .global("__config", json!({}))
        .global("__state", json!({}))
        .setup("__config.state = __state;")
        .read_back("__state");
        let outcome = run_script(&call).unwrap();
        assert_eq!(outcome.globals.get("__state"), Some(&json!({"seen": true})));
    }

    #[test]
    fn test_check_syntax() {
        assert!(check_syntax("function (config) { return {}; }").is_ok());
        assert!(check_syntax("function (config) { return {; }").is_err());
    }

    #[test]
    fn test_injected_expression() {
        let call = ScriptCall::new("function () {}", "__config, __logger");
        assert_eq!(call.injected(), "(function () {})(__config, __logger);");
    }

    #[tokio::test]
    async fn test_run_script_blocking() {
        let call = ScriptCall::new("function () { return [1, 2]; }", "");
        let outcome = run_script_blocking(call).await.unwrap();
        assert_eq!(outcome.result, Some(json!([1, 2])));
    }
}
