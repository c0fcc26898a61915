//! Typed view of the ComfyUI `/history/{prompt_id}` response.
//!
//! The endpoint returns `{}` while a prompt is still queued or running
//! and `{"<prompt_id>": {...}}` once it has finished.

use std::collections::BTreeMap;

use serde::Deserialize;

/// Finished-prompt record.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PromptHistory {
    /// Per-node outputs keyed by node id.
    #[serde(default)]
    pub outputs: BTreeMap<String, NodeOutput>,
    #[serde(default)]
    pub status: Option<HistoryStatus>,
}

/// Files produced by one output node.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NodeOutput {
    #[serde(default)]
    pub images: Vec<OutputFile>,
    #[serde(default)]
    pub gifs: Vec<OutputFile>,
}

/// Reference to a file retrievable through `GET /view`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct OutputFile {
    pub filename: String,
    #[serde(default)]
    pub subfolder: String,
    #[serde(rename = "type", default = "default_folder_type")]
    pub folder_type: String,
}

fn default_folder_type() -> String {
    "output".to_string()
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HistoryStatus {
    #[serde(default)]
    pub status_str: Option<String>,
    #[serde(default)]
    pub completed: bool,
    /// `[event_name, payload]` pairs recorded during execution.
    #[serde(default)]
    pub messages: Vec<(String, serde_json::Value)>,
}

impl PromptHistory {
    /// First output file, visiting nodes in ascending numeric id order.
    pub fn first_output(&self) -> Option<&OutputFile> {
        let mut nodes: Vec<(&String, &NodeOutput)> = self.outputs.iter().collect();
        nodes.sort_by_key(|(id, _)| (id.parse::<u64>().unwrap_or(u64::MAX), id.as_str()));
        nodes
            .into_iter()
            .find_map(|(_, out)| out.images.first().or_else(|| out.gifs.first()))
    }

    /// True when the engine recorded the prompt as failed.
    pub fn is_error(&self) -> bool {
        self.status
            .as_ref()
            .and_then(|s| s.status_str.as_deref())
            .is_some_and(|s| s == "error")
    }

    /// The `exception_message` of the recorded execution error, if any.
    pub fn error_message(&self) -> Option<String> {
        let status = self.status.as_ref()?;
        status
            .messages
            .iter()
            .find(|(event, _)| event == "execution_error")
            .and_then(|(_, payload)| payload.get("exception_message"))
            .and_then(|m| m.as_str())
            .map(|m| m.trim().to_string())
    }
}

/// Extract the record for `prompt_id` from a raw history response.
///
/// Returns `Ok(None)` while the prompt has no history entry yet.
pub fn parse_history(
    prompt_id: &str,
    body: &serde_json::Value,
) -> Result<Option<PromptHistory>, serde_json::Error> {
    match body.get(prompt_id) {
        Some(entry) => serde_json::from_value(entry.clone()).map(Some),
        None => Ok(None),
    }
}
