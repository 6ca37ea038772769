//! Shell transform and decorate behaviors.

use crate::error::{ImposterError, Result};
use crate::logging::ScopedLogger;
use crate::scripting::{downcast_injection_config, injection_failure, run_script_blocking, ScriptCall};
use serde_json::{Map, Value};
use std::time::Duration;
use tokio::process::Command;

/// Pipe the response through each command in turn.
///
/// Each command receives the request and current response as JSON, both as
/// two single-quoted arguments and as `MB_REQUEST`/`MB_RESPONSE`, and must
/// print the new response as JSON on stdout.
pub(super) async fn apply_shell_transform(
    request: &Value,
    response: Value,
    commands: &[String],
    timeout: Option<Duration>,
    logger: &ScopedLogger,
) -> Result<Value> {
    let mut current = response;
    for command in commands {
        current = run_command(command, request, &current, timeout, logger).await?;
    }
    Ok(current)
}

async fn run_command(
    command: &str,
    request: &Value,
    response: &Value,
    timeout: Option<Duration>,
    logger: &ScopedLogger,
) -> Result<Value> {
    let request_json = request.to_string();
    let response_json = response.to_string();
    let full_command = format!(
        "{command} '{}' '{}'",
        shell_safe(&request_json),
        shell_safe(&response_json)
    );
    logger.debug(format!("Shelling out to {command}"));
    logger.debug(full_command.clone());

    let mut child = Command::new("sh");
    child
        .arg("-c")
        .arg(&full_command)
        .env("MB_REQUEST", &request_json)
        .env("MB_RESPONSE", &response_json)
        .kill_on_drop(true);

    let output = match timeout {
        Some(limit) => match tokio::time::timeout(limit, child.output()).await {
            Ok(output) => output,
            Err(_) => {
                logger.error(format!("{command} timed out after {}ms", limit.as_millis()));
                return Err(ImposterError::injection(
                    "Command timed out",
                    Value::String(command.to_string()),
                    format!("no output after {}ms", limit.as_millis()),
                ));
            }
        },
        None => child.output().await,
    }
    .map_err(|e| ImposterError::injection("Command failed", Value::String(command.to_string()), e.to_string()))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if !stderr.is_empty() {
            logger.error(stderr.clone());
        }
        return Err(ImposterError::injection(
            "Command failed",
            Value::String(command.to_string()),
            format!("{}: {stderr}", output.status),
        ));
    }

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    logger.debug(format!("Shell returned '{stdout}'"));
    serde_json::from_str(&stdout).map_err(|e| {
        ImposterError::injection(
            format!("Shell command returned invalid JSON: '{}'", stdout.trim()),
            Value::String(command.to_string()),
            e.to_string(),
        )
    })
}

/// Escape a string for use inside single quotes.
fn shell_safe(text: &str) -> String {
    text.replace('\'', "'\\''")
}

/// Run a decorate function.
///
/// The function is called as `(config, response, logger)` where
/// `config.response` is the same object as `response`. A returned value
/// replaces the response; otherwise the mutated response is kept.
pub(super) async fn apply_decorate(
    request: &Value,
    response: Value,
    source: &str,
    logger: &ScopedLogger,
) -> Result<Value> {
    let mut config = Map::new();
    config.insert("request".to_string(), request.clone());
    config.insert("response".to_string(), response.clone());
    downcast_injection_config(&mut config);
    let config = Value::Object(config);

    let call = ScriptCall::new(source, "__config, __response, __logger")
        .global("__config", config.clone())
        .global("__response", response)
        .setup("__config.response = __response; __config.logger = __logger;")
        .read_back("__response");

    match run_script_blocking(call.clone()).await {
        Ok(outcome) => {
            logger.replay(&outcome.logs);
            match outcome.value() {
                Some(result) if !result.is_null() => Ok(result.clone()),
                _ => Ok(outcome.globals.get("__response").cloned().unwrap_or(Value::Null)),
            }
        }
        Err(failure) => Err(injection_failure(
            "invalid decorator injection",
            &call,
            failure,
            logger,
            Some(&config),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn logger() -> ScopedLogger {
        ScopedLogger::new("test")
    }

    #[test]
    fn test_shell_safe() {
        assert_eq!(shell_safe("it's"), "it'\\''s");
    }

    #[tokio::test]
    async fn test_shell_transform_reads_environment() {
        let commands = vec![
            "f() { printf '%s' \"$MB_RESPONSE\" | sed 's/original/changed/'; }; f".to_string(),
        ];
        let result = apply_shell_transform(
            &json!({"path": "/"}),
            json!({"body": "original"}),
            &commands,
            None,
            &logger(),
        )
        .await
        .unwrap();
        assert_eq!(result, json!({"body": "changed"}));
    }

    #[tokio::test]
    async fn test_shell_transform_reads_arguments() {
        // Second positional argument is the response JSON
        let commands = vec!["f() { printf '%s' \"$2\"; }; f".to_string()];
        let response = json!({"body": "it's quoted"});
        let result = apply_shell_transform(&json!({}), response.clone(), &commands, None, &logger())
            .await
            .unwrap();
        assert_eq!(result, response);
    }

    #[tokio::test]
    async fn test_shell_transform_chains_commands() {
        let commands = vec![
            "f() { echo '{\"body\": \"one\"}'; }; f".to_string(),
            "f() { printf '%s' \"$MB_RESPONSE\" | sed 's/one/two/'; }; f".to_string(),
        ];
        let result = apply_shell_transform(&json!({}), json!({}), &commands, None, &logger())
            .await
            .unwrap();
        assert_eq!(result, json!({"body": "two"}));
    }

    #[tokio::test]
    async fn test_shell_transform_failure() {
        let commands = vec!["f() { echo broken >&2; return 3; }; f".to_string()];
        let err = apply_shell_transform(&json!({}), json!({}), &commands, None, &logger())
            .await
            .unwrap_err();
        assert!(err.is_injection());
        assert_eq!(err.message(), "Command failed");
        assert!(err.data().unwrap().contains("broken"));
    }

    #[tokio::test]
    async fn test_shell_transform_invalid_json() {
        let commands = vec!["echo not-json".to_string()];
        let err = apply_shell_transform(&json!({}), json!({}), &commands, None, &logger())
            .await
            .unwrap_err();
        assert!(err.message().starts_with("Shell command returned invalid JSON"));
    }

    #[tokio::test]
    async fn test_shell_transform_timeout() {
        let commands = vec!["f() { sleep 5; }; f".to_string()];
        let err = apply_shell_transform(
            &json!({}),
            json!({}),
            &commands,
            Some(Duration::from_millis(50)),
            &logger(),
        )
        .await
        .unwrap_err();
        assert_eq!(err.message(), "Command timed out");
    }

    #[tokio::test]
    async fn test_decorate_mutates_response() {
        let result = apply_decorate(
            &json!({"path": "/hello"}),
            json!({"statusCode": 200, "body": ""}),
            "function (config) { config.response.body = 'path was ' + config.request.path; }",
            &logger(),
        )
        .await
        .unwrap();
        assert_eq!(result, json!({"statusCode": 200, "body": "path was /hello"}));
    }

    #[tokio::test]
    async fn test_decorate_response_argument_and_return() {
        let result = apply_decorate(
            &json!({}),
            json!({"body": "a"}),
            "function (config, response) { response.body += 'b'; return { body: response.body + 'c' }; }",
            &logger(),
        )
        .await
        .unwrap();
        assert_eq!(result, json!({"body": "abc"}));
    }

    #[tokio::test]
    async fn test_decorate_error() {
        let err = apply_decorate(&json!({}), json!({}), "function () { throw new Error('bad'); }", &logger())
            .await
            .unwrap_err();
        assert_eq!(err.message(), "invalid decorator injection");
        assert_eq!(err.data(), Some("bad"));
    }
}
