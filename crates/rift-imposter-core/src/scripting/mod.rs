//! Dynamic code boundary for injected functions.
//!
//! # Module Structure
//!
//! - `js_engine` - Boa-backed runner with a JSON-in/JSON-out contract
//! - `compat` - Downcast adapter for the single-parameter calling convention
//!
//! Every injection surface (predicate `inject`, response `inject`,
//! `decorate`, function-valued `wait`, proxy `predicateGenerators[].inject`)
//! goes through [`js_engine::ScriptCall`]. Whether injection is permitted at
//! all is decided when a configuration is validated or an imposter is
//! built, not here. Scripts that see `imposterState` or `injectState` run
//! while holding that state's lock, so concurrent updates are never lost.

pub mod compat;
pub mod js_engine;

pub use compat::downcast_injection_config;
pub use js_engine::{check_syntax, run_script, run_script_blocking, ScriptCall, ScriptFailure, ScriptOutcome};

use crate::error::ImposterError;
use crate::logging::ScopedLogger;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::sync::Arc;

/// Mutable state shared with injected code across calls.
pub type SharedState = Arc<Mutex<Value>>;

/// Fresh empty state object.
pub fn new_shared_state() -> SharedState {
    Arc::new(Mutex::new(Value::Object(Map::new())))
}

/// Run a script with exclusive access to shared states.
///
/// Each `(state, global)` pair is locked for the whole run, exposed to the
/// script as `global` and replaced by the object the script leaves there.
/// States are locked in the order given.
pub(crate) fn run_with_states(
    call: ScriptCall,
    states: &[(&SharedState, &str)],
) -> Result<ScriptOutcome, ScriptFailure> {
    let mut guards: Vec<_> = states.iter().map(|(state, global)| (state.lock(), *global)).collect();
    let mut call = call;
    for (guard, global) in &guards {
        call = call.global(*global, (**guard).clone()).read_back(*global);
    }
    let outcome = run_script(&call)?;
    for (guard, global) in &mut guards {
        if let Some(value @ Value::Object(_)) = outcome.globals.get(*global) {
            **guard = value.clone();
        }
    }
    Ok(outcome)
}

/// [`run_with_states`] on the blocking pool.
pub(crate) async fn run_with_states_blocking(
    call: ScriptCall,
    states: Vec<(SharedState, &'static str)>,
) -> Result<ScriptOutcome, ScriptFailure> {
    tokio::task::spawn_blocking(move || {
        let borrowed: Vec<(&SharedState, &str)> = states.iter().map(|(state, global)| (state, *global)).collect();
        run_with_states(call, &borrowed)
    })
    .await
    .unwrap_or_else(|e| Err(ScriptFailure::bare(format!("Script task failed: {e}"))))
}

/// Log a failed injection at error level and build the matching error.
pub(crate) fn injection_failure(
    message: &str,
    call: &ScriptCall,
    failure: ScriptFailure,
    logger: &ScopedLogger,
    config: Option<&Value>,
) -> ImposterError {
    let injected = call.injected();
    logger.replay(&failure.logs);
    logger.error(format!("injection X=> {}", failure.message));
    logger.error(format!("    source: {}", Value::String(injected.clone())));
    if let Some(config) = config {
        logger.error(format!("    config: {config}"));
    }
    ImposterError::injection(message, Value::String(injected), failure.message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tracing_test::traced_test;

    #[test]
    fn test_run_with_states_keeps_non_object_state() {
        let state = new_shared_state();
        *state.lock() = json!({"kept": true});
        let call = ScriptCall::new("function (s) { __state = null; return 1; }", "__state");
        run_with_states(call, &[(&state, "__state")]).unwrap();
        assert_eq!(*state.lock(), json!({"kept": true}));
    }

    #[test]
    fn test_run_with_states_writes_back_each_state() {
        let first = new_shared_state();
        let second = new_shared_state();
        let call = ScriptCall::new("function (a, b) { a.x = 1; b.y = 2; }", "__a, __b");
        run_with_states(call, &[(&first, "__a"), (&second, "__b")]).unwrap();
        assert_eq!(*first.lock(), json!({"x": 1}));
        assert_eq!(*second.lock(), json!({"y": 2}));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_scripts_serialize_on_state() {
        let state = new_shared_state();
        let tasks: Vec<_> = (0..32)
            .map(|_| {
                let state = state.clone();
                tokio::spawn(async move {
                    let call = ScriptCall::new("function (s) { s.n = (s.n || 0) + 1; }", "__state");
                    run_with_states_blocking(call, vec![(state, "__state")]).await
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(state.lock()["n"], 32);
    }

    #[traced_test]
    #[test]
    fn test_injection_failure_logs_source() {
        let call = ScriptCall::new("function () { throw 1; }", "");
        let failure = run_script(&call).unwrap_err();
        let err = injection_failure(
            "invalid response injection",
            &call,
            failure,
            &ScopedLogger::new("http:3000"),
            None,
        );
        assert!(err.is_injection());
        assert_eq!(err.message(), "invalid response injection");
        assert_eq!(err.data(), Some("1"));
        assert!(logs_contain("injection X=>"));
    }
}
