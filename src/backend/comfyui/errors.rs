//! Readable messages from the workflow server's error payloads

use serde_json::Value;

use crate::backend::http;

fn str_field<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value.get(key).and_then(Value::as_str).filter(|s| !s.is_empty())
}

/// Message for a rejected submission (`POST /prompt` with status 400, or a
/// non-empty `node_errors` map)
pub fn describe_submission_error(body: &Value) -> String {
    let node_errors = body
        .get("node_errors")
        .and_then(Value::as_object)
        .into_iter()
        .flatten();

    for (node_id, node) in node_errors {
        let class_type = str_field(node, "class_type").unwrap_or(node_id.as_str());
        let first = node
            .get("errors")
            .and_then(Value::as_array)
            .and_then(|errors| errors.first());
        if let Some(error) = first {
            let message = str_field(error, "message").unwrap_or("invalid input");
            let text = match str_field(error, "details") {
                Some(details) => format!("{}: {}: {}", class_type, message, details),
                None => format!("{}: {}", class_type, message),
            };
            return normalize(&text);
        }
    }

    let error = body.get("error").unwrap_or(body);
    if let Some(message) = error.as_str() {
        return normalize(message);
    }
    let text = match (str_field(error, "message"), str_field(error, "details")) {
        (Some(message), Some(details)) => format!("{}: {}", message, details),
        (Some(message), None) => message.to_string(),
        _ => "the workflow was rejected".to_string(),
    };
    normalize(&text)
}

/// Message for an `execution_error` push payload or history entry
pub fn describe_execution_error(data: &Value) -> String {
    let node_type = str_field(data, "node_type").unwrap_or("unknown node");
    let node_id = str_field(data, "node_id").unwrap_or("?");
    let exception = str_field(data, "exception_message").unwrap_or("execution failed");
    let text = match str_field(data, "exception_type") {
        Some(kind) => format!("{} (node {}) raised {}: {}", node_type, node_id, kind, exception.trim()),
        None => format!("{} (node {}): {}", node_type, node_id, exception.trim()),
    };
    normalize(&text)
}

/// Message for a history entry whose status is `error`
pub fn describe_history_error(entry: &Value) -> String {
    let messages = entry
        .pointer("/status/messages")
        .and_then(Value::as_array)
        .into_iter()
        .flatten();

    for message in messages {
        let Some(pair) = message.as_array() else {
            continue;
        };
        if pair.first().and_then(Value::as_str) == Some("execution_error") {
            if let Some(data) = pair.get(1) {
                return describe_execution_error(data);
            }
        }
    }
    "the workflow finished with an error".to_string()
}

/// Rewrite well-known failure text into something a caller can act on
pub fn normalize(message: &str) -> String {
    let lowered = message.to_lowercase();

    if lowered.contains("out of memory") || lowered.contains("outofmemory") {
        return "The workflow server ran out of GPU memory; try a smaller resolution".to_string();
    }
    if lowered.contains("ckpt_name") && lowered.contains("not in") {
        return match quoted_after(message, "ckpt_name") {
            Some(name) => format!("Model '{}' is not installed on the workflow server", name),
            None => "The requested model is not installed on the workflow server".to_string(),
        };
    }

    http::truncate(message)
}

/// First single-quoted value after `key`
fn quoted_after<'a>(text: &'a str, key: &str) -> Option<&'a str> {
    let rest = &text[text.find(key)? + key.len()..];
    let start = rest.find('\'')? + 1;
    let len = rest[start..].find('\'')?;
    Some(&rest[start..start + len])
}
