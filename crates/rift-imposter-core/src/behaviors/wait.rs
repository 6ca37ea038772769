//! Wait behavior - add latency before response.

use super::types::WaitBehavior;
use crate::error::{ImposterError, Result};
use crate::logging::ScopedLogger;
use crate::scripting::{check_syntax, injection_failure, run_script_blocking, ScriptCall};
use rand::Rng;
use serde_json::Value;
use std::time::Duration;

/// Sleep for the configured delay. Dry runs only check function syntax.
pub(super) async fn apply_wait(wait: &WaitBehavior, dry_run: bool, logger: &ScopedLogger) -> Result<()> {
    let Some(millis) = wait_millis(wait, dry_run, logger).await? else {
        return Ok(());
    };
    logger.debug(format!("Waiting {millis} ms..."));
    tokio::time::sleep(Duration::from_millis(millis)).await;
    Ok(())
}

/// Delay in milliseconds; `None` during a dry run.
async fn wait_millis(wait: &WaitBehavior, dry_run: bool, logger: &ScopedLogger) -> Result<Option<u64>> {
    let millis = match wait {
        WaitBehavior::Millis(ms) => ms.max(0.0) as u64,
        WaitBehavior::Range { min, max } => {
            if max > min {
                rand::thread_rng().gen_range(*min..=*max)
            } else {
                *min
            }
        }
        WaitBehavior::Text(text) => match parse_leading_int(text) {
            Some(ms) => ms,
            None if dry_run => {
                check_syntax(text).map_err(|e| wait_error(text, e, logger))?;
                return Ok(None);
            }
            None => function_millis(text, logger).await?,
        },
    };
    Ok((!dry_run).then_some(millis))
}

async fn function_millis(source: &str, logger: &ScopedLogger) -> Result<u64> {
    let call = ScriptCall::new(source, "");
    match run_script_blocking(call.clone()).await {
        Ok(outcome) => {
            logger.replay(&outcome.logs);
            match outcome.value().and_then(Value::as_f64) {
                Some(ms) if ms.is_finite() => Ok(ms.max(0.0) as u64),
                _ => Err(wait_error(source, "wait function did not return a number".to_string(), logger)),
            }
        }
        Err(failure) => Err(injection_failure("invalid wait injection", &call, failure, logger, None)),
    }
}

fn wait_error(source: &str, data: String, logger: &ScopedLogger) -> ImposterError {
    logger.error(format!("injection X=> {data}"));
    logger.error(format!("    full source: {}", Value::String(format!("({source})()"))));
    ImposterError::injection("invalid wait injection", Value::String(source.to_string()), data)
}

/// Integer prefix of a string, ignoring leading whitespace (`"100ms"` is 100).
fn parse_leading_int(text: &str) -> Option<u64> {
    let digits: String = text
        .trim_start()
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}
