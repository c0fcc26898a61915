//! Normalization of completed-job output into artifacts.
//!
//! Image workers return either an inline base64 payload
//! (`images[0].type == "base64"`, or the legacy `message` field) or a
//! reference URL (`type == "s3_url"`). Transcription workers return text
//! under `transcription` or `text`, which is stored as a JSON artifact.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::Deserialize;
use serde_json::{json, Map, Value};

use atelier_core::types::Artifact;

use crate::client::ServerlessError;
use crate::status::StatusResponse;

const JSON_CONTENT_TYPE: &str = "application/json";

/// What a completed job produced, before any reference is fetched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutput {
    Inline(Artifact),
    /// The bytes live at `url` and still need to be fetched.
    Reference { url: String, filename: String },
    /// The worker reported an error inside a completed job's output.
    Error(String),
}

#[derive(Debug, Deserialize)]
struct ImageEntry {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    data: Option<String>,
    #[serde(default)]
    filename: Option<String>,
}

/// Default filename for an image that did not name itself.
pub fn default_image_name(job_id: &str) -> String {
    format!("runpod_{job_id}.png")
}

/// Interpret the output of a COMPLETED status.
///
/// Returns `Ok(None)` when the response carries no output at all.
pub fn normalize(job_id: &str, status: &StatusResponse) -> Result<Option<JobOutput>, ServerlessError> {
    if let Some(output) = status.output() {
        return normalize_value(job_id, output).map(Some);
    }

    // Some transcription workers put the text at the top level.
    match status.transcription.as_deref().or(status.text.as_deref()) {
        Some(text) => Ok(Some(transcript(job_id, text, &Map::new()))),
        None => Ok(None),
    }
}

fn normalize_value(job_id: &str, output: &Value) -> Result<JobOutput, ServerlessError> {
    let obj = match output {
        Value::String(text) => return Ok(transcript(job_id, text, &Map::new())),
        Value::Object(obj) => obj,
        other => {
            return Err(ServerlessError::InvalidResponse(format!(
                "unexpected output type: {other}"
            )))
        }
    };

    if let Some(images) = obj.get("images").and_then(Value::as_array) {
        if let Some(first) = images.first() {
            return image(job_id, first);
        }
    }

    if let Some(message) = obj.get("message").and_then(Value::as_str) {
        let data = decode_base64(message)?;
        return Ok(JobOutput::Inline(
            Artifact::new(default_image_name(job_id), data).with_content_type("image/png"),
        ));
    }

    let text = obj
        .get("transcription")
        .or_else(|| obj.get("text"))
        .and_then(Value::as_str);
    if let Some(text) = text {
        return Ok(transcript(job_id, text, obj));
    }

    if let Some(error) = obj.get("error").and_then(Value::as_str) {
        return Ok(JobOutput::Error(error.to_string()));
    }

    Err(ServerlessError::InvalidResponse(
        "completed job output has no image or transcription".to_string(),
    ))
}

fn image(job_id: &str, entry: &Value) -> Result<JobOutput, ServerlessError> {
    let entry: ImageEntry = serde_json::from_value(entry.clone())
        .map_err(|e| ServerlessError::InvalidResponse(format!("image entry: {e}")))?;
    let filename = entry.filename.unwrap_or_else(|| default_image_name(job_id));
    let data = entry
        .data
        .filter(|d| !d.is_empty())
        .ok_or_else(|| ServerlessError::InvalidResponse("image entry without data".to_string()))?;

    match entry.kind.as_str() {
        "base64" => {
            let bytes = decode_base64(&data)?;
            let content_type = content_type_for(&filename);
            Ok(JobOutput::Inline(
                Artifact::new(filename, bytes).with_content_type(content_type),
            ))
        }
        "s3_url" => Ok(JobOutput::Reference { url: data, filename }),
        other => Err(ServerlessError::InvalidResponse(format!(
            "unsupported image output type '{other}'"
        ))),
    }
}

fn transcript(job_id: &str, text: &str, extra: &Map<String, Value>) -> JobOutput {
    let mut doc = json!({ "transcription": text });
    for key in ["segments", "language", "duration"] {
        if let Some(v) = extra.get(key).filter(|v| !v.is_null()) {
            doc[key] = v.clone();
        }
    }
    let bytes = serde_json::to_vec(&doc).unwrap_or_default();
    JobOutput::Inline(
        Artifact::new(format!("transcription_{job_id}.json"), bytes)
            .with_content_type(JSON_CONTENT_TYPE),
    )
}

/// Decode a base64 payload, accepting an optional `data:...;base64,` prefix.
fn decode_base64(data: &str) -> Result<Vec<u8>, ServerlessError> {
    let payload = match data.find(";base64,") {
        Some(idx) => &data[idx + ";base64,".len()..],
        None => data,
    };
    BASE64
        .decode(payload.trim())
        .map_err(|e| ServerlessError::InvalidResponse(format!("invalid base64 image: {e}")))
}

pub(crate) fn content_type_for(filename: &str) -> &'static str {
    let ext = filename.rsplit_once('.').map(|(_, e)| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("webp") => "image/webp",
        Some("gif") => "image/gif",
        Some("json") => JSON_CONTENT_TYPE,
        _ => "image/png",
    }
}
