//! Proxy transport collaborator.
//!
//! The resolver forwards in-process proxy calls through a [`ProxyTransport`].
//! The protocol layer supplies the implementation; [`HttpProxyTransport`]
//! covers HTTP and [`DryRunProxy`] stands in during validation.

use crate::error::{ImposterError, Result};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::time::Duration;
use tracing::debug;

/// Carries a request to a proxy destination and returns the reply.
#[async_trait]
pub trait ProxyTransport: Send + Sync {
    async fn to(
        &self,
        destination: &str,
        request: &Value,
        config: &Value,
        request_details: Option<&Value>,
    ) -> Result<Value>;
}

/// Proxy that never performs I/O and answers `{}`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DryRunProxy;

#[async_trait]
impl ProxyTransport for DryRunProxy {
    async fn to(&self, _: &str, _: &Value, _: &Value, _: Option<&Value>) -> Result<Value> {
        Ok(Value::Object(Map::new()))
    }
}

/// HTTP proxy transport backed by reqwest.
///
/// Sends `{method, path, query, headers, body}` to `destination` and maps
/// the reply to `{statusCode, headers, body}`.
#[derive(Debug, Clone)]
pub struct HttpProxyTransport {
    client: reqwest::Client,
}

impl HttpProxyTransport {
    pub fn new() -> Result<Self> {
        Self::with_timeout(Duration::from_secs(30))
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(0)
            .build()
            .map_err(|e| ImposterError::invalid_proxy("unable to create HTTP client", e.to_string()))?;
        Ok(Self { client })
    }
}

/// Destination plus request path and query string.
fn target_url(destination: &str, request: &Value) -> String {
    let path = request.get("path").and_then(Value::as_str).unwrap_or("");
    let query: Vec<String> = request
        .get("query")
        .and_then(Value::as_object)
        .map(|query| {
            query
                .iter()
                .flat_map(|(key, value)| {
                    let values = match value {
                        Value::Array(items) => items.clone(),
                        other => vec![other.clone()],
                    };
                    values.into_iter().map(move |value| {
                        let value = match value {
                            Value::String(s) => s,
                            other => other.to_string(),
                        };
                        format!("{}={}", urlencoding::encode(key), urlencoding::encode(&value))
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    let base = destination.trim_end_matches('/');
    if query.is_empty() {
        format!("{base}{path}")
    } else {
        format!("{base}{path}?{}", query.join("&"))
    }
}

#[async_trait]
impl ProxyTransport for HttpProxyTransport {
    async fn to(
        &self,
        destination: &str,
        request: &Value,
        _config: &Value,
        _request_details: Option<&Value>,
    ) -> Result<Value> {
        let url = target_url(destination, request);
        let method = request.get("method").and_then(Value::as_str).unwrap_or("GET");
        let method = reqwest::Method::from_bytes(method.to_uppercase().as_bytes())
            .map_err(|e| ImposterError::invalid_proxy(format!("invalid method {method}"), e.to_string()))?;
        debug!("Proxy request to: {} {}", method, url);

        let mut outbound = self.client.request(method, &url);
        if let Some(headers) = request.get("headers").and_then(Value::as_object) {
            for (key, value) in headers {
                let lower = key.to_lowercase();
                if lower == "host" || lower == "content-length" {
                    continue;
                }
                match value {
                    Value::String(value) => outbound = outbound.header(key, value),
                    Value::Array(values) => {
                        for value in values.iter().filter_map(Value::as_str) {
                            outbound = outbound.header(key, value);
                        }
                    }
                    _ => {}
                }
            }
        }
        match request.get("body") {
            None | Some(Value::Null) => {}
            Some(Value::String(body)) if body.is_empty() => {}
            Some(Value::String(body)) => outbound = outbound.body(body.clone()),
            Some(other) => outbound = outbound.body(other.to_string()),
        }

        let response = outbound
            .send()
            .await
            .map_err(|e| ImposterError::invalid_proxy(format!("Failed to send proxy request to {url}"), e.to_string()))?;

        let status = response.status().as_u16();
        let mut headers = Map::new();
        for (name, value) in response.headers() {
            headers.insert(
                name.to_string(),
                Value::String(value.to_str().unwrap_or("").to_string()),
            );
        }
        let body = response
            .bytes()
            .await
            .map_err(|e| ImposterError::invalid_proxy(format!("Failed to read response body from {url}"), e.to_string()))?;

        let mut reply = Map::new();
        reply.insert("statusCode".to_string(), Value::from(status));
        reply.insert("headers".to_string(), Value::Object(headers));
        reply.insert(
            "body".to_string(),
            Value::String(String::from_utf8_lossy(&body).to_string()),
        );
        Ok(Value::Object(reply))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_target_url_encodes_query() {
        let url = target_url(
            "http://origin:8080/",
            &json!({"path": "/search", "query": {"q": "a b", "tag": ["x", "y"]}}),
        );
        assert_eq!(url, "http://origin:8080/search?q=a%20b&tag=x&tag=y");
        assert_eq!(target_url("http://origin", &json!({"path": "/"})), "http://origin/");
    }

    #[tokio::test]
    async fn test_dry_run_proxy_answers_empty() {
        let reply = DryRunProxy
            .to("http://unreachable", &json!({}), &json!({}), None)
            .await
            .unwrap();
        assert_eq!(reply, json!({}));
    }

    #[tokio::test]
    async fn test_unreachable_destination_is_invalid_proxy() {
        let transport = HttpProxyTransport::with_timeout(Duration::from_secs(2)).unwrap();
        let err = transport
            .to("http://127.0.0.1:1", &json!({"method": "GET", "path": "/"}), &json!({}), None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "invalid proxy");
    }
}
