//! Mountebank-compatible response behaviors.
//!
//! This module implements the `_behaviors` post-processing applied to a
//! resolved response.
//!
//! # Supported Behaviors
//!
//! - `wait` - Add latency before response (fixed ms, {min, max} range or function)
//! - `repeat` - Serve a response N times before rotating (applied by the stub repository)
//! - `lookup` - Replace tokens with a row of a CSV data source
//! - `copy` - Copy request fields into response using regex/jsonpath/xpath
//! - `shellTransform` - External programs transform the response
//! - `decorate` - JavaScript function post-processes the response
//!
//! Steps run in the order listed. During a dry run `wait` only checks
//! function syntax and `shellTransform` is skipped; the others run so
//! validation exercises them.

mod copy;
pub mod extraction;
mod lookup;
mod transform;
mod types;
mod validate;
mod wait;

pub use extraction::ExtractionMethod;
pub use types::{
    repeat_count, CopyBehavior, CsvDataSource, DataSource, LookupBehavior, LookupKey,
    ResponseBehaviors, WaitBehavior,
};
pub use validate::validate;

use crate::error::Result;
use crate::logging::ScopedLogger;
use crate::predicate::is_truthy;
use serde_json::Value;
use std::time::Duration;

/// Settings for running the pipeline.
#[derive(Debug, Clone, Default)]
pub struct PipelineOptions {
    /// Kill `shellTransform` commands running longer than this
    pub shell_transform_timeout: Option<Duration>,
}

/// Apply the behaviors configured for a response.
///
/// The configuration is validated first; the first schema error is
/// returned without running any step.
pub async fn execute(
    request: &Value,
    response: Value,
    behaviors: Option<&Value>,
    logger: &ScopedLogger,
    options: &PipelineOptions,
) -> Result<Value> {
    let Some(config) = behaviors else {
        return Ok(response);
    };
    if let Some(error) = validate(Some(config)).into_iter().next() {
        return Err(error);
    }
    let behaviors = ResponseBehaviors::from_value(config)?;
    let dry_run = request.get("isDryRun").map(is_truthy).unwrap_or(false);
    let mut response = response;

    if let Some(wait) = &behaviors.wait {
        wait::apply_wait(wait, dry_run, logger).await?;
    }
    if !behaviors.lookup.is_empty() {
        lookup::apply_lookup(request, &mut response, &behaviors.lookup, logger).await?;
    }
    if !behaviors.copy.is_empty() {
        copy::apply_copy(request, &mut response, &behaviors.copy, logger)?;
    }
    if !behaviors.shell_transform.is_empty() && !dry_run {
        response = transform::apply_shell_transform(
            request,
            response,
            &behaviors.shell_transform,
            options.shell_transform_timeout,
            logger,
        )
        .await?;
    }
    if let Some(decorate) = &behaviors.decorate {
        response = transform::apply_decorate(request, response, decorate, logger).await?;
    }

    Ok(response)
}
