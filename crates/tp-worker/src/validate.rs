// SPDX-License-Identifier: MIT OR Apache-2.0
//! Schema-driven parameter validation.
//!
//! Requests are validated against the plugin's stored parameter schema.
//! A failure yields a single human-readable message with one line per
//! validation error:
//!
//! ```text
//! <field_title>[,<field_title>...]: <reason>. You provided: <value>.
//! ```
//!
//! Field titles come from the schema; when a segment has no title the
//! raw field name is used. Map values referenced by an error have their
//! keys rewritten from schema names to titles.

use serde_json::Value;
use tp_error::PlatformError;

/// Validate `params` against `schema`, producing an
/// [`ErrorCode::InputValidation`](tp_error::ErrorCode::InputValidation)
/// error with one message line per violation.
pub fn validate_params(schema: &Value, params: &Value) -> Result<(), PlatformError> {
    if schema.is_null() {
        return Ok(());
    }
    let validator = jsonschema::validator_for(schema)
        .map_err(|e| PlatformError::internal(format!("plugin parameter schema is invalid: {e}")))?;

    let lines: Vec<String> = validator
        .iter_errors(params)
        .map(|error| {
            let segments = pointer_segments(&error.instance_path.to_string());
            let prefix = title_prefix(schema, &segments);
            let value = render_value(schema, &segments, &error.instance);
            format!("{prefix}{error}. You provided: {value}.")
        })
        .collect();

    if lines.is_empty() {
        Ok(())
    } else {
        Err(PlatformError::input_validation(lines.join("\n")))
    }
}

fn pointer_segments(pointer: &str) -> Vec<String> {
    pointer
        .split('/')
        .filter(|s| !s.is_empty())
        .map(|s| s.replace("~1", "/").replace("~0", "~"))
        .collect()
}

/// Walk the schema along the instance path and collect field titles,
/// falling back to the raw segment name. Array indices are skipped.
fn title_prefix(schema: &Value, segments: &[String]) -> String {
    if segments.is_empty() {
        return String::new();
    }
    let mut titles = Vec::new();
    let mut node = schema;
    for segment in segments {
        if segment.parse::<usize>().is_ok() {
            // An array index has no title of its own; descend into items.
            if let Some(items) = node.get("items") {
                node = items;
            }
            continue;
        }
        match node.get("properties").and_then(|p| p.get(segment)) {
            Some(field) => {
                titles.push(
                    field
                        .get("title")
                        .and_then(Value::as_str)
                        .unwrap_or(segment)
                        .to_string(),
                );
                node = field;
            }
            None => titles.push(segment.clone()),
        }
    }
    if titles.is_empty() {
        String::new()
    } else {
        format!("{}: ", titles.join(","))
    }
}

/// Render the offending value: bare strings without quotes, objects
/// with their keys rewritten to schema titles.
fn render_value(schema: &Value, segments: &[String], instance: &Value) -> String {
    match instance {
        Value::String(s) => s.clone(),
        Value::Object(map) => {
            let node = schema_node_at(schema, segments);
            let rewritten: serde_json::Map<String, Value> = map
                .iter()
                .map(|(key, value)| {
                    let title = node
                        .and_then(|n| n.get("properties"))
                        .and_then(|p| p.get(key))
                        .and_then(|f| f.get("title"))
                        .and_then(Value::as_str)
                        .unwrap_or(key);
                    (title.to_string(), value.clone())
                })
                .collect();
            Value::Object(rewritten).to_string()
        }
        other => other.to_string(),
    }
}

fn schema_node_at<'a>(schema: &'a Value, segments: &[String]) -> Option<&'a Value> {
    let mut node = schema;
    for segment in segments {
        if segment.parse::<usize>().is_ok() {
            node = node.get("items")?;
            continue;
        }
        node = node.get("properties")?.get(segment)?;
    }
    Some(node)
}
