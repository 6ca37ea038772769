//! Compatibility adapters for the injection calling convention.
//!
//! Older injected functions took a single parameter and read request fields
//! directly from it (`config.method`, `config.data`). The current convention
//! nests them under `config.request`. The adapter runs right before the call
//! and copies the request fields onto the config object.

use serde_json::{Map, Value};

/// Keys owned by the calling convention itself; request fields never override them.
const RESERVED_KEYS: &[&str] = &["request", "state", "logger", "callback", "response"];

/// Spread top-level request fields into `config` for single-parameter functions.
///
/// Only applies to protocols that used the old convention: requests carrying a
/// `method` (http/https) or `data` (tcp) field.
pub fn downcast_injection_config(config: &mut Map<String, Value>) {
    let fields = match config.get("request") {
        Some(Value::Object(request)) if request.contains_key("method") || request.contains_key("data") => {
            request.clone()
        }
        _ => return,
    };

    for (key, value) in fields {
        if !RESERVED_KEYS.contains(&key.as_str()) {
            config.insert(key, value);
        }
    }
}
