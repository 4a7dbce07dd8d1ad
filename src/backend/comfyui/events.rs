//! Translation of push messages and history records into run signals

use serde_json::Value;

use super::errors::{describe_execution_error, describe_history_error};
use super::graph::SAVE_NODE;
use super::run::{OutputRef, RunSignal};

/// A push message that concerns some run
#[derive(Debug, Clone, PartialEq)]
pub struct PushEvent {
    /// `None` when the server did not say which run the message is about
    pub prompt_id: Option<String>,
    pub signal: RunSignal,
}

impl PushEvent {
    /// Messages without a run id are attributed to whoever is listening
    pub fn concerns(&self, run_id: &str) -> bool {
        self.prompt_id.as_deref().map_or(true, |id| id == run_id)
    }
}

/// What the history endpoint says about a run
#[derive(Debug, Clone, PartialEq)]
pub enum HistoryState {
    /// Not recorded yet, or still running
    Pending,
    Completed(Option<OutputRef>),
    Failed(String),
}

/// Parse one text frame from the push channel. Frames that carry nothing
/// relevant to run progress yield `None`.
pub fn parse_push_message(text: &str) -> Option<PushEvent> {
    let value: Value = serde_json::from_str(text).ok()?;
    let kind = value.get("type")?.as_str()?;
    let data = value.get("data").unwrap_or(&Value::Null);
    let prompt_id = data
        .get("prompt_id")
        .and_then(Value::as_str)
        .map(str::to_string);

    let signal = match kind {
        "execution_start" => RunSignal::ExecutionStarted,
        "executing" => RunSignal::Executing {
            node: data.get("node").and_then(Value::as_str).map(str::to_string),
        },
        "progress" => RunSignal::Progress {
            value: data.get("value").and_then(Value::as_u64).unwrap_or(0),
            max: data.get("max").and_then(Value::as_u64).unwrap_or(0),
        },
        "executed" => RunSignal::Output(first_output_image(data.get("output")?)?),
        "execution_error" => RunSignal::Failed(describe_execution_error(data)),
        "execution_interrupted" => RunSignal::Failed("Execution was interrupted".to_string()),
        "execution_success" => RunSignal::Finished,
        _ => return None,
    };

    Some(PushEvent { prompt_id, signal })
}

/// Interpret `GET /history/{run_id}`
pub fn parse_history(run_id: &str, body: &Value) -> HistoryState {
    let Some(entry) = body.get(run_id) else {
        return HistoryState::Pending;
    };

    let status = entry.get("status");
    if status.and_then(|s| s.get("status_str")).and_then(Value::as_str) == Some("error") {
        return HistoryState::Failed(describe_history_error(entry));
    }

    let outputs = entry.get("outputs").and_then(Value::as_object);
    let output = outputs.and_then(|outputs| {
        outputs
            .get(SAVE_NODE)
            .and_then(first_output_image)
            .or_else(|| outputs.values().find_map(first_output_image))
    });

    let completed = status
        .and_then(|s| s.get("completed"))
        .and_then(Value::as_bool)
        .unwrap_or(output.is_some());

    if completed {
        HistoryState::Completed(output)
    } else {
        HistoryState::Pending
    }
}

/// First saved image in a node's output, preferring final outputs over previews
fn first_output_image(node_output: &Value) -> Option<OutputRef> {
    let images = node_output.get("images")?.as_array()?;
    let parsed: Vec<OutputRef> = images
        .iter()
        .filter_map(|image| {
            Some(OutputRef {
                filename: image.get("filename")?.as_str()?.to_string(),
                subfolder: image
                    .get("subfolder")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                kind: image
                    .get("type")
                    .and_then(Value::as_str)
                    .unwrap_or("output")
                    .to_string(),
            })
        })
        .collect();

    let preferred = parsed.iter().position(|image| image.kind == "output");
    match preferred {
        Some(index) => parsed.into_iter().nth(index),
        None => parsed.into_iter().next(),
    }
}
