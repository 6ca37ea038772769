//! Copy behavior - copy request values into response tokens.

use super::extraction::value_to_string;
use super::types::CopyBehavior;
use crate::error::Result;
use crate::logging::ScopedLogger;
use serde_json::Value;

pub(super) fn apply_copy(
    request: &Value,
    response: &mut Value,
    copies: &[CopyBehavior],
    logger: &ScopedLogger,
) -> Result<()> {
    for copy in copies {
        let values = match select_from(request, &copy.from) {
            Some(text) => copy.using.values(&text, logger)?,
            None => {
                logger.debug(format!("No request field matching {}", copy.from));
                Vec::new()
            }
        };
        replace_array_values(response, &copy.into, &values, logger);
    }
    Ok(())
}

/// Resolve `from` against the request.
///
/// Keys match case-insensitively, nested single-key objects walk down one
/// level each, multi-valued fields yield their first value and structured
/// values are rendered as JSON.
pub(super) fn select_from(request: &Value, from: &Value) -> Option<String> {
    let mut current = request;
    let mut from = from;
    loop {
        match from {
            Value::Object(path) => {
                let (key, next) = path.iter().next()?;
                current = get_case_insensitive(current, key)?;
                from = next;
            }
            Value::String(key) => {
                let value = match get_case_insensitive(current, key)? {
                    Value::Array(items) => items.first()?,
                    other => other,
                };
                return Some(value_to_string(value));
            }
            _ => return None,
        }
    }
}

fn get_case_insensitive<'v>(value: &'v Value, key: &str) -> Option<&'v Value> {
    let object = value.as_object()?;
    object.get(key).or_else(|| {
        let key = key.to_lowercase();
        object
            .iter()
            .find(|(candidate, _)| candidate.to_lowercase() == key)
            .map(|(_, value)| value)
    })
}

/// Replace `token[i]` with each value, then the bare token with the first.
fn replace_array_values(response: &mut Value, token: &str, values: &[String], logger: &ScopedLogger) {
    if values.is_empty() {
        return;
    }
    replace_in_strings(response, &|field: &str| {
        let mut field = field.to_string();
        for (index, replacement) in values.iter().enumerate() {
            field = replace_all(&field, &format!("{token}[{index}]"), replacement, logger);
        }
        replace_all(&field, token, &values[0], logger)
    });
}

/// Apply a replacer to every string inside a value, recursively.
pub(super) fn replace_in_strings(value: &mut Value, replacer: &dyn Fn(&str) -> String) {
    match value {
        Value::String(text) => *text = replacer(text),
        Value::Array(items) => items.iter_mut().for_each(|item| replace_in_strings(item, replacer)),
        Value::Object(object) => object
            .values_mut()
            .for_each(|item| replace_in_strings(item, replacer)),
        _ => {}
    }
}

pub(super) fn replace_all(text: &str, token: &str, replacement: &str, logger: &ScopedLogger) -> String {
    if token.is_empty() || token == replacement || !text.contains(token) {
        return text.to_string();
    }
    logger.debug(format!("Replacing {token} with {replacement}"));
    text.replace(token, replacement)
}
