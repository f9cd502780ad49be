//! Core data types: model ids, input rows and inference results.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::{Result, SwapperError};

const MAX_MODEL_ID_LEN: usize = 200;

/// Identifier of one logical model.
///
/// Used verbatim as a checkpoint file name and as a queue name suffix, so the
/// character set is restricted to `[A-Za-z0-9_.-]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ModelId(String);

impl ModelId {
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        let invalid = |reason| SwapperError::InvalidModelId {
            id: id.clone(),
            reason,
        };
        if id.is_empty() {
            return Err(invalid("must not be empty"));
        }
        if id.len() > MAX_MODEL_ID_LEN {
            return Err(invalid("longer than 200 characters"));
        }
        if id == "." || id == ".." {
            return Err(invalid("reserved path component"));
        }
        if !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
        {
            return Err(invalid("only [A-Za-z0-9_.-] are allowed"));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ModelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ModelId {
    type Error = SwapperError;

    fn try_from(value: String) -> Result<Self> {
        ModelId::new(value)
    }
}

impl From<ModelId> for String {
    fn from(id: ModelId) -> Self {
        id.0
    }
}

impl std::str::FromStr for ModelId {
    type Err = SwapperError;

    fn from_str(s: &str) -> Result<Self> {
        ModelId::new(s)
    }
}

/// One row of model input. `row_id` is strictly increasing per model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInputRow {
    #[serde(rename = "rowID")]
    pub row_id: i64,
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    /// Fields the swapper does not interpret; passed through to the runner.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ModelInputRow {
    pub fn new(row_id: i64, timestamp: DateTime<Utc>, value: f64) -> Self {
        Self {
            row_id,
            timestamp,
            value,
            extra: serde_json::Map::new(),
        }
    }
}

/// Inference output for one input row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InferenceResult {
    #[serde(rename = "rowID")]
    pub row_id: i64,
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    pub anomaly_score: f64,
}

/// Checks that row ids are strictly increasing, optionally continuing from
/// `previous`.
pub fn check_row_order(previous: Option<i64>, rows: &[ModelInputRow]) -> Result<()> {
    let mut last = previous;
    for row in rows {
        if let Some(prev) = last {
            if row.row_id <= prev {
                return Err(SwapperError::RowsOutOfOrder {
                    previous: prev,
                    row_id: row.row_id,
                });
            }
        }
        last = Some(row.row_id);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_id_validation() {
        assert!(ModelId::new("cpu.host-1_A").is_ok());
        assert!(ModelId::new("").is_err());
        assert!(ModelId::new("..").is_err());
        assert!(ModelId::new("a/b").is_err());
        assert!(ModelId::new("x".repeat(201)).is_err());
    }

    #[test]
    fn test_model_id_deserialize_rejects_bad_ids() {
        let ok: ModelId = serde_json::from_str("\"abc\"").unwrap();
        assert_eq!(ok.as_str(), "abc");
        assert!(serde_json::from_str::<ModelId>("\"../etc\"").is_err());
    }

    #[test]
    fn test_row_wire_names() {
        let json = r#"{"rowID": 7, "timestamp": "2024-01-01T00:00:00Z", "value": 1.5, "host": "a"}"#;
        let row: ModelInputRow = serde_json::from_str(json).unwrap();
        assert_eq!(row.row_id, 7);
        assert_eq!(row.extra.get("host").and_then(|v| v.as_str()), Some("a"));

        let back = serde_json::to_value(&row).unwrap();
        assert_eq!(back["rowID"], 7);
        assert_eq!(back["host"], "a");
    }

    #[test]
    fn test_check_row_order() {
        let ts = Utc::now();
        let rows = vec![ModelInputRow::new(1, ts, 0.0), ModelInputRow::new(2, ts, 0.0)];
        assert!(check_row_order(None, &rows).is_ok());
        assert!(check_row_order(Some(1), &rows).is_err());

        let swapped = vec![ModelInputRow::new(2, ts, 0.0), ModelInputRow::new(2, ts, 0.0)];
        assert!(matches!(
            check_row_order(None, &swapped),
            Err(SwapperError::RowsOutOfOrder { previous: 2, row_id: 2 })
        ));
    }
}
