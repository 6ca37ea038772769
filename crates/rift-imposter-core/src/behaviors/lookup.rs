//! Lookup behavior - replace tokens with a row from an external data source.
//!
//! The data source is a delimited file with a header row. It is read on
//! every lookup, so edits to the file take effect without a restart. Read
//! failures and unknown key columns are logged and leave the response
//! untouched.

use super::copy::{replace_all, replace_in_strings, select_from};
use super::types::{CsvDataSource, LookupBehavior, LookupKey};
use crate::error::Result;
use crate::logging::ScopedLogger;
use serde_json::Value;

/// One data row as (column, value) pairs in header order.
type Row = Vec<(String, String)>;

pub(super) async fn apply_lookup(
    request: &Value,
    response: &mut Value,
    lookups: &[LookupBehavior],
    logger: &ScopedLogger,
) -> Result<()> {
    for lookup in lookups {
        let Some(key) = lookup_key(request, &lookup.key, logger)? else {
            continue;
        };
        if let Some(row) = find_row(&lookup.from_data_source.csv, &key, logger).await {
            replace_object_values(response, &lookup.into, &row, logger);
        }
    }
    Ok(())
}

fn lookup_key(request: &Value, key: &LookupKey, logger: &ScopedLogger) -> Result<Option<String>> {
    let Some(text) = select_from(request, &key.from) else {
        logger.debug(format!("No request field matching {}", key.from));
        return Ok(None);
    };
    let values = key.using.values(&text, logger)?;
    Ok(values.into_iter().nth(key.index).filter(|value| !value.is_empty()))
}

async fn find_row(source: &CsvDataSource, key: &str, logger: &ScopedLogger) -> Option<Row> {
    let contents = match tokio::fs::read_to_string(&source.path).await {
        Ok(contents) => contents,
        Err(e) => {
            logger.error(format!("Cannot read {}: {e}", source.path));
            return None;
        }
    };

    let mut lines = contents.lines().filter(|line| !line.trim().is_empty());
    let headers = split_line(lines.next()?, &source.delimiter);
    let Some(key_index) = headers.iter().position(|h| h == &source.key_column) else {
        logger.error(format!(
            "Column {} not found in {}",
            source.key_column, source.path
        ));
        return None;
    };

    for line in lines {
        let fields = split_line(line, &source.delimiter);
        if fields.get(key_index).map(String::as_str) == Some(key) {
            return Some(
                headers
                    .iter()
                    .cloned()
                    .zip(fields.into_iter().chain(std::iter::repeat(String::new())))
                    .collect(),
            );
        }
    }

    logger.debug(format!("No row in {} with {} = {key}", source.path, source.key_column));
    None
}

/// Split a delimited line, honoring double-quoted fields with `""` escapes.
fn split_line(line: &str, delimiter: &str) -> Vec<String> {
    let delimiter = if delimiter.is_empty() { "," } else { delimiter };
    let mut fields = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut rest = line.trim_end_matches('\r');

    while let Some(c) = rest.chars().next() {
        if in_quotes {
            if rest.starts_with("\"\"") {
                field.push('"');
                rest = &rest[2..];
                continue;
            }
            if c == '"' {
                in_quotes = false;
            } else {
                field.push(c);
            }
        } else if c == '"' && field.trim().is_empty() {
            field.clear();
            in_quotes = true;
        } else if rest.starts_with(delimiter) {
            fields.push(field.trim().to_string());
            field.clear();
            rest = &rest[delimiter.len()..];
            continue;
        } else {
            field.push(c);
        }
        rest = &rest[c.len_utf8()..];
    }
    fields.push(field.trim().to_string());
    fields
}

/// Replace `token["col"]`, `token['col']` and `token[col]` with row values.
fn replace_object_values(response: &mut Value, token: &str, row: &Row, logger: &ScopedLogger) {
    replace_in_strings(response, &|field: &str| {
        let mut field = field.to_string();
        for (column, value) in row {
            for quote in ["\"", "'", ""] {
                let quoted = format!("{token}[{quote}{column}{quote}]");
                field = replace_all(&field, &quoted, value, logger);
            }
        }
        field
    });
}
