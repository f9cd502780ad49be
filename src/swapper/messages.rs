//! Wire messages carried by the queue fabric.
//!
//! Commands travel as a broker-agnostic JSON envelope
//! `{commandID, modelID, type, payload}` and are decoded into the closed
//! [`Command`] enum at the queue boundary.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::Result;
use super::types::{InferenceResult, ModelId, ModelInputRow};

/// Queue carrying "model has new input" hints to the scheduler.
pub const NOTIFICATION_QUEUE: &str = "model_swapper.notifications";
/// Queue carrying inference and command results to upstream consumers.
pub const RESULTS_QUEUE: &str = "model_swapper.results";
/// Prefix of every per-model input queue.
pub const INPUT_QUEUE_PREFIX: &str = "model_swapper.input.";

/// Name of the input queue for `model_id`.
pub fn input_queue_name(model_id: &ModelId) -> String {
    format!("{INPUT_QUEUE_PREFIX}{model_id}")
}

/// Inverse of [`input_queue_name`]. `None` for queues that are not model inputs.
pub fn model_id_from_queue(queue: &str) -> Option<ModelId> {
    queue
        .strip_prefix(INPUT_QUEUE_PREFIX)
        .and_then(|id| ModelId::new(id).ok())
}

/// Fresh client-side idempotency token.
pub fn new_command_id() -> String {
    Uuid::new_v4().to_string()
}

/// A decoded model command.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    DefineModel {
        model_id: ModelId,
        command_id: String,
        args: serde_json::Value,
    },
    DeleteModel {
        model_id: ModelId,
        command_id: String,
    },
    DataBatch {
        model_id: ModelId,
        command_id: String,
        rows: Vec<ModelInputRow>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
enum CommandKind {
    DefineModel,
    DeleteModel,
    DataBatch,
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    #[serde(rename = "commandID")]
    command_id: String,
    #[serde(rename = "modelID")]
    model_id: ModelId,
    #[serde(rename = "type")]
    kind: CommandKind,
    #[serde(default)]
    payload: serde_json::Value,
}

impl Command {
    pub fn model_id(&self) -> &ModelId {
        match self {
            Command::DefineModel { model_id, .. }
            | Command::DeleteModel { model_id, .. }
            | Command::DataBatch { model_id, .. } => model_id,
        }
    }

    pub fn command_id(&self) -> &str {
        match self {
            Command::DefineModel { command_id, .. }
            | Command::DeleteModel { command_id, .. }
            | Command::DataBatch { command_id, .. } => command_id,
        }
    }

    /// Method name used in command results.
    pub fn method(&self) -> &'static str {
        match self {
            Command::DefineModel { .. } => "defineModel",
            Command::DeleteModel { .. } => "deleteModel",
            Command::DataBatch { .. } => "dataBatch",
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let (kind, payload) = match self {
            Command::DefineModel { args, .. } => (CommandKind::DefineModel, args.clone()),
            Command::DeleteModel { .. } => (CommandKind::DeleteModel, serde_json::Value::Null),
            Command::DataBatch { rows, .. } => {
                (CommandKind::DataBatch, serde_json::to_value(rows)?)
            }
        };
        let envelope = Envelope {
            command_id: self.command_id().to_string(),
            model_id: self.model_id().clone(),
            kind,
            payload,
        };
        Ok(serde_json::to_vec(&envelope)?)
    }

    pub fn decode(body: &[u8]) -> Result<Self> {
        let Envelope {
            command_id,
            model_id,
            kind,
            payload,
        } = serde_json::from_slice(body)?;

        Ok(match kind {
            CommandKind::DefineModel => Command::DefineModel {
                model_id,
                command_id,
                args: payload,
            },
            CommandKind::DeleteModel => Command::DeleteModel {
                model_id,
                command_id,
            },
            CommandKind::DataBatch => Command::DataBatch {
                model_id,
                command_id,
                rows: serde_json::from_value(payload)?,
            },
        })
    }
}

/// Hint that a model's input queue received new messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    #[serde(rename = "modelID")]
    pub model_id: ModelId,
}

impl Notification {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(body: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(body)?)
    }
}

/// Outcome of a define/delete command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CommandStatus {
    Ok,
    Error,
}

/// Message published on [`RESULTS_QUEUE`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ModelResult {
    Inference {
        #[serde(rename = "modelID")]
        model_id: ModelId,
        #[serde(rename = "commandID")]
        command_id: String,
        results: Vec<InferenceResult>,
    },
    Command {
        #[serde(rename = "modelID")]
        model_id: ModelId,
        #[serde(rename = "commandID")]
        command_id: String,
        method: String,
        status: CommandStatus,
        #[serde(default)]
        message: Option<String>,
    },
}

impl ModelResult {
    pub fn model_id(&self) -> &ModelId {
        match self {
            ModelResult::Inference { model_id, .. } | ModelResult::Command { model_id, .. } => {
                model_id
            }
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(body: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(body)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn model(id: &str) -> ModelId {
        ModelId::new(id).unwrap()
    }

    #[test]
    fn test_envelope_wire_shape() {
        let cmd = Command::DeleteModel {
            model_id: model("m1"),
            command_id: "c-1".to_string(),
        };
        let value: serde_json::Value = serde_json::from_slice(&cmd.encode().unwrap()).unwrap();
        assert_eq!(value["commandID"], "c-1");
        assert_eq!(value["modelID"], "m1");
        assert_eq!(value["type"], "deleteModel");
        assert!(value["payload"].is_null());
    }

    #[test]
    fn test_decode_data_batch_preserves_row_order() {
        let ts = Utc::now();
        let rows: Vec<_> = (1..=3).map(|i| ModelInputRow::new(i, ts, i as f64)).collect();
        let cmd = Command::DataBatch {
            model_id: model("m1"),
            command_id: new_command_id(),
            rows: rows.clone(),
        };
        match Command::decode(&cmd.encode().unwrap()).unwrap() {
            Command::DataBatch { rows: decoded, .. } => assert_eq!(decoded, rows),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_decode_rejects_unknown_type() {
        let body = br#"{"commandID":"x","modelID":"m","type":"explode","payload":null}"#;
        assert!(Command::decode(body).is_err());
    }

    #[test]
    fn test_queue_names() {
        let id = model("cpu.load");
        let queue = input_queue_name(&id);
        assert_eq!(queue, "model_swapper.input.cpu.load");
        assert_eq!(model_id_from_queue(&queue), Some(id));
        assert_eq!(model_id_from_queue(RESULTS_QUEUE), None);
    }

    #[test]
    fn test_result_tagging() {
        let result = ModelResult::Command {
            model_id: model("m1"),
            command_id: "c".to_string(),
            method: "defineModel".to_string(),
            status: CommandStatus::Ok,
            message: None,
        };
        let value: serde_json::Value = serde_json::from_slice(&result.encode().unwrap()).unwrap();
        assert_eq!(value["kind"], "command");
        assert_eq!(value["status"], "ok");
    }
}
