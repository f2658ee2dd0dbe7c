use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

/// Inbound message on either envelope socket.
#[derive(Clone, Debug, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    pub event: String,
    #[serde(default)]
    pub payload: Value,
}

/// Outbound frame. Success frames carry `payload`, failures carry `error`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Frame {
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Frame {
    pub fn ok(kind: &str, event: &str, payload: Value) -> Self {
        Self {
            kind: Some(kind.to_string()),
            event: Some(format!("{event}Response")),
            success: Some(true),
            payload: Some(payload),
            error: None,
        }
    }

    pub fn failure(kind: Option<&str>, event: Option<&str>, error: impl Into<String>) -> Self {
        Self {
            kind: kind.map(str::to_string),
            event: event.map(|e| format!("{e}Response")),
            success: Some(false),
            payload: None,
            error: Some(error.into()),
        }
    }

    /// Server-initiated push without a success flag, e.g. terminal output.
    pub fn push(kind: &str, event: &str, payload: Value) -> Self {
        Self {
            kind: Some(kind.to_string()),
            event: Some(event.to_string()),
            success: None,
            payload: Some(payload),
            error: None,
        }
    }

    pub fn to_json(&self) -> String {
        // Frame only holds strings, bools and JSON values.
        serde_json::to_string(self).unwrap_or_else(|_| {
            r#"{"success":false,"error":"failed to encode frame"}"#.to_string()
        })
    }
}

/// One node of the workspace tree, rebuilt from a stat on every request.
///
/// `children` is `Some` (possibly empty) exactly when the node is a directory.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct File {
    pub name: String,
    pub absolute_path: String,
    pub is_directory: bool,
    pub is_file: bool,
    pub is_symlink: bool,
    pub extension: Option<String>,
    pub size_in_bytes: Option<u64>,
    pub modified_at: Option<DateTime<Utc>>,
    pub created_at: Option<DateTime<Utc>>,
    pub children: Option<Vec<File>>,
}

impl File {
    /// Depth-first list of this node and all of its descendants.
    pub fn flatten(&self) -> Vec<&File> {
        let mut out = vec![self];
        if let Some(children) = &self.children {
            for child in children {
                out.extend(child.flatten());
            }
        }
        out
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchTextResult {
    pub file: File,
    pub number_of_matches: usize,
    pub preview_content: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchTextResponse {
    pub results: Vec<SearchTextResult>,
    pub total_matches: usize,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchFileResult {
    pub file: File,
    pub match_score: usize,
    pub preview_content: String,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SearchOptions {
    pub use_regex: bool,
    pub match_case: bool,
    pub match_whole_word: bool,
}

/// Per-path outcome of a batch move or copy.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BatchEntry {
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<File>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DeleteFailure {
    pub path: String,
    pub error: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DeleteReport {
    pub deleted: Vec<String>,
    pub failed: Vec<DeleteFailure>,
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, ToSchema, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "camelCase")]
pub struct PortMapping {
    #[schema(example = 8080)]
    pub internal_port: u16,
    #[schema(example = 3000)]
    pub external_port: u16,
}

#[derive(Clone, Debug, Deserialize, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreatePortMappingRequest {
    pub internal_port: u16,
    pub external_port: u16,
    /// Reload the reverse proxy after writing (defaults to true)
    #[serde(default)]
    pub reload: Option<bool>,
}

#[derive(Clone, Debug, Deserialize, Serialize, ToSchema)]
pub struct AvailablePortsResponse {
    pub ports: Vec<u16>,
}

#[derive(Clone, Debug, Deserialize, Serialize, ToSchema)]
pub struct PingResponse {
    pub message: String,
}
