//! IPC protocol types for slot agent ↔ model runner communication.
//!
//! Uses JSON Lines (one JSON object per line) over stdin/stdout pipes.
//! Checkpoint blobs travel base64-encoded.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::swapper::error::{Result, SwapperError};
use crate::swapper::types::{InferenceResult, ModelInputRow};

/// Request sent from the slot agent to the runner via stdin.
#[derive(Serialize, Deserialize, Debug)]
pub struct RunnerRequest {
    /// Monotonic request ID for correlating responses.
    pub id: u64,
    pub command: RunnerCommand,
}

/// Commands the slot agent can send to the runner.
#[derive(Serialize, Deserialize, Debug)]
#[serde(tag = "type")]
pub enum RunnerCommand {
    /// First request after spawn: which model to host and its saved state.
    Init {
        model_id: String,
        #[serde(default)]
        checkpoint: Option<String>,
    },
    /// Model parameters from a `DefineModel` command.
    DefineModel { args: serde_json::Value },
    /// Process one batch of ordered rows.
    ProcessBatch {
        batch_id: String,
        rows: Vec<ModelInputRow>,
    },
    /// Orderly shutdown. The runner replies with `Checkpoint` when asked to save.
    Shutdown { save_checkpoint: bool },
}

/// Response sent from the runner via stdout.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RunnerResponse {
    /// Matches the request ID. 0 for unsolicited messages.
    pub id: u64,
    pub payload: RunnerPayload,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "type")]
pub enum RunnerPayload {
    /// Model state restored (or freshly created) and ready for batches.
    Ready { model_id: String, restored: bool },
    ModelDefined,
    BatchProcessed {
        batch_id: String,
        results: Vec<InferenceResult>,
    },
    /// Final model state, sent in reply to `Shutdown { save_checkpoint: true }`.
    Checkpoint { data: String },
    Error { message: String },
}

impl RunnerResponse {
    pub fn ok(id: u64, payload: RunnerPayload) -> Self {
        Self { id, payload }
    }

    pub fn error(id: u64, message: impl Into<String>) -> Self {
        Self {
            id,
            payload: RunnerPayload::Error {
                message: message.into(),
            },
        }
    }
}

pub fn encode_checkpoint(blob: &[u8]) -> String {
    STANDARD.encode(blob)
}

pub fn decode_checkpoint(data: &str) -> Result<Vec<u8>> {
    STANDARD
        .decode(data)
        .map_err(|e| SwapperError::RunnerProtocol(format!("bad checkpoint encoding: {e}")))
}
