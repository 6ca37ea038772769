//! In-place upgrade of older imposter configuration shapes.
//!
//! Runs before validation and resolution. Every rewrite is idempotent:
//!
//! - array-form `behaviors: [{..}, {..}]` becomes the object-form `_behaviors`
//! - a single-string `shellTransform` becomes a one-element array
//! - a TCP proxy `to: {host, port}` becomes `tcp://host:port`

use serde_json::{Map, Value};

/// Upgrade an imposter configuration (`{protocol, stubs}`) in place.
pub fn upcast(config: &mut Value) {
    let protocol = config
        .get("protocol")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let Some(stubs) = config.get_mut("stubs").and_then(Value::as_array_mut) else {
        return;
    };
    for stub in stubs {
        upcast_stub(stub, &protocol);
    }
}

/// Upgrade one stub definition in place.
pub fn upcast_stub(stub: &mut Value, protocol: &str) {
    let Some(responses) = stub.get_mut("responses").and_then(Value::as_array_mut) else {
        return;
    };
    for response in responses {
        let Value::Object(response) = response else {
            continue;
        };
        merge_behavior_list(response);
        shell_transform_to_array(response);
        if protocol == "tcp" {
            tcp_destination_to_url(response);
        }
    }
}

/// Fold `behaviors` into `_behaviors`; keys already in `_behaviors` win.
fn merge_behavior_list(response: &mut Map<String, Value>) {
    let Some(list) = response.remove("behaviors") else {
        return;
    };
    let mut merged = Map::new();
    match list {
        Value::Array(items) => {
            for item in items {
                if let Value::Object(object) = item {
                    merged.extend(object);
                }
            }
        }
        Value::Object(object) => merged = object,
        _ => {}
    }
    if let Some(Value::Object(existing)) = response.remove("_behaviors") {
        merged.extend(existing);
    }
    if !merged.is_empty() {
        response.insert("_behaviors".to_string(), Value::Object(merged));
    }
}

fn shell_transform_to_array(response: &mut Map<String, Value>) {
    let Some(Value::Object(behaviors)) = response.get_mut("_behaviors") else {
        return;
    };
    if let Some(command) = behaviors.get_mut("shellTransform") {
        if command.is_string() {
            let single = command.take();
            *command = Value::Array(vec![single]);
        }
    }
}

fn tcp_destination_to_url(response: &mut Map<String, Value>) {
    let Some(Value::Object(proxy)) = response.get_mut("proxy") else {
        return;
    };
    let Some(Value::Object(to)) = proxy.get("to") else {
        return;
    };
    let part = |key: &str| match to.get(key) {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    };
    let url = format!("tcp://{}:{}", part("host"), part("port"));
    proxy.insert("to".to_string(), Value::String(url));
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn legacy() -> Value {
        json!({
            "protocol": "tcp",
            "stubs": [{
                "responses": [
                    {"is": {"data": "x"}, "_behaviors": {"shellTransform": "transform.sh"}},
                    {"proxy": {"to": {"host": "localhost", "port": 3000}}},
                    {"is": {}, "behaviors": [{"wait": 10}, {"decorate": "function () {}"}]}
                ]
            }]
        })
    }

    #[test]
    fn test_upcast_legacy_shapes() {
        let mut config = legacy();
        upcast(&mut config);
        let responses = &config["stubs"][0]["responses"];
        assert_eq!(responses[0]["_behaviors"]["shellTransform"], json!(["transform.sh"]));
        assert_eq!(responses[1]["proxy"]["to"], "tcp://localhost:3000");
        assert_eq!(
            responses[2],
            json!({"is": {}, "_behaviors": {"wait": 10, "decorate": "function () {}"}})
        );
    }

    #[test]
    fn test_upcast_is_idempotent() {
        let mut once = legacy();
        upcast(&mut once);
        let mut twice = once.clone();
        upcast(&mut twice);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_existing_behaviors_take_precedence() {
        let mut stub = json!({"responses": [{
            "is": {},
            "_behaviors": {"wait": 5},
            "behaviors": [{"wait": 100, "shellTransform": "a.sh"}]
        }]});
        upcast_stub(&mut stub, "http");
        assert_eq!(
            stub["responses"][0]["_behaviors"],
            json!({"wait": 5, "shellTransform": ["a.sh"]})
        );
    }

    #[test]
    fn test_http_proxy_destination_untouched() {
        let mut config = json!({"protocol": "http", "stubs": [{"responses": [{"proxy": {"to": "http://origin"}}]}]});
        let before = config.clone();
        upcast(&mut config);
        assert_eq!(config, before);
    }
}
