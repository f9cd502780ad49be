//! Producer-facing client. Talks only to the queue fabric, never to a slot.

use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::swapper::config::ClientConfig;
use crate::swapper::error::{Result, SwapperError};
use crate::swapper::fabric::{Consumer, Persistence, QueueFabric};
use crate::swapper::messages::{
    input_queue_name, new_command_id, Command, ModelResult, Notification, NOTIFICATION_QUEUE,
    RESULTS_QUEUE,
};
use crate::swapper::types::{check_row_order, ModelId, ModelInputRow};

/// Producer API of the model swapper.
///
/// All calls are fire-and-forget: they return once the command is durably
/// queued, not when a runner has processed it. Results arrive on the results
/// queue (see [`ModelSwapperClient::consume_results`]).
#[derive(Debug, Clone)]
pub struct ModelSwapperClient {
    fabric: QueueFabric,
    config: ClientConfig,
}

impl ModelSwapperClient {
    pub fn new(fabric: QueueFabric, config: ClientConfig) -> Result<Self> {
        fabric.declare_queue(NOTIFICATION_QUEUE)?;
        fabric.declare_queue(RESULTS_QUEUE)?;
        Ok(Self { fabric, config })
    }

    pub fn batch_size(&self) -> usize {
        self.config.batch_size
    }

    /// Create the model's input queue if needed and queue `DefineModel`.
    pub fn define_model(&self, model_id: &ModelId, args: serde_json::Value) -> Result<String> {
        self.fabric.create_model_input_queue(model_id)?;
        let command = Command::DefineModel {
            model_id: model_id.clone(),
            command_id: new_command_id(),
            args,
        };
        self.send(&command)
    }

    /// Queue `DeleteModel`. Fails with `ModelNotFound` if the model has no queue.
    pub fn delete_model(&self, model_id: &ModelId) -> Result<String> {
        let command = Command::DeleteModel {
            model_id: model_id.clone(),
            command_id: new_command_id(),
        };
        self.send(&command)
    }

    /// Queue one batch of rows.
    ///
    /// `rows` must be non-empty, at most `batch_size` long and strictly
    /// increasing in `rowID`; use [`chunk_rows`] for longer sequences.
    /// `ModelNotFound` means the model was deleted concurrently; callers should
    /// log it and stop feeding that model.
    pub fn submit_requests(&self, model_id: &ModelId, rows: Vec<ModelInputRow>) -> Result<String> {
        if rows.is_empty() {
            return Err(SwapperError::EmptyBatch);
        }
        if rows.len() > self.config.batch_size {
            return Err(SwapperError::BatchTooLarge {
                len: rows.len(),
                max: self.config.batch_size,
            });
        }
        check_row_order(None, &rows)?;

        let command = Command::DataBatch {
            model_id: model_id.clone(),
            command_id: new_command_id(),
            rows,
        };
        self.send(&command)
    }

    /// Start consuming inference and command results.
    pub fn consume_results(&self) -> Result<ResultConsumer> {
        Ok(ResultConsumer {
            consumer: self.fabric.consume(RESULTS_QUEUE)?,
        })
    }

    fn send(&self, command: &Command) -> Result<String> {
        let model_id = command.model_id();
        let body = command.encode()?;
        match self
            .fabric
            .publish(&input_queue_name(model_id), &body, Persistence::Persistent)
        {
            Ok(_) => {}
            Err(SwapperError::QueueNotFound(_)) => {
                return Err(SwapperError::ModelNotFound(model_id.clone()))
            }
            Err(e) => return Err(e),
        }
        debug!("[CLIENT] Queued {} {} for {model_id}", command.method(), command.command_id());
        self.notify(model_id);
        Ok(command.command_id().to_string())
    }

    /// Best effort: the scheduler's periodic rescan finds the work anyway.
    fn notify(&self, model_id: &ModelId) {
        let notification = Notification {
            model_id: model_id.clone(),
        };
        let published = notification
            .encode()
            .and_then(|body| self.fabric.publish(NOTIFICATION_QUEUE, &body, Persistence::Transient));
        if let Err(e) = published {
            warn!("[CLIENT] Notification for {model_id} not sent: {e}");
        }
    }
}

/// Split `rows` into consecutive batches of at most `batch_size` rows.
pub fn chunk_rows(rows: Vec<ModelInputRow>, batch_size: usize) -> Vec<Vec<ModelInputRow>> {
    let batch_size = batch_size.max(1);
    let mut batches = Vec::with_capacity(rows.len().div_ceil(batch_size));
    let mut rows = rows.into_iter().peekable();
    while rows.peek().is_some() {
        batches.push(rows.by_ref().take(batch_size).collect());
    }
    batches
}

/// Decoded view of the results queue.
#[derive(Debug)]
pub struct ResultConsumer {
    consumer: Consumer,
}

impl ResultConsumer {
    /// Next result within `timeout`. Each result is acknowledged on return.
    pub fn next(&self, timeout: Duration) -> Result<Option<ModelResult>> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let Some(delivery) = self.consumer.next(remaining)? else {
                return Ok(None);
            };
            let decoded = ModelResult::decode(&delivery.body);
            self.consumer.ack(delivery)?;
            match decoded {
                Ok(result) => return Ok(Some(result)),
                Err(e) => warn!("[CLIENT] Skipping malformed result: {e}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn create_test_client(batch_size: usize) -> (QueueFabric, ModelSwapperClient) {
        let fabric = QueueFabric::open_in_memory(Duration::from_millis(1)).unwrap();
        let client = ModelSwapperClient::new(fabric.clone(), ClientConfig { batch_size }).unwrap();
        (fabric, client)
    }

    fn rows(ids: std::ops::RangeInclusive<i64>) -> Vec<ModelInputRow> {
        ids.map(|id| ModelInputRow::new(id, Utc::now(), id as f64)).collect()
    }

    fn model(id: &str) -> ModelId {
        ModelId::new(id).unwrap()
    }

    #[test]
    fn test_define_creates_queue_and_notifies() {
        let (fabric, client) = create_test_client(10);
        let command_id = client.define_model(&model("m"), serde_json::json!({"k": 1})).unwrap();

        let queue = input_queue_name(&model("m"));
        assert!(fabric.queue_exists(&queue).unwrap());
        let head = Command::decode(&fabric.peek(&queue).unwrap().unwrap()).unwrap();
        assert_eq!(head.command_id(), command_id);
        assert_eq!(fabric.ready_count(NOTIFICATION_QUEUE).unwrap(), 1);
    }

    #[test]
    fn test_submit_to_unknown_model_is_model_not_found() {
        let (_, client) = create_test_client(10);
        let result = client.submit_requests(&model("ghost"), rows(1..=3));
        assert!(matches!(result, Err(SwapperError::ModelNotFound(m)) if m.as_str() == "ghost"));
        assert!(matches!(
            client.delete_model(&model("ghost")),
            Err(SwapperError::ModelNotFound(_))
        ));
    }

    #[test]
    fn test_submit_validates_batches() {
        let (_, client) = create_test_client(3);
        let m = model("m");
        client.define_model(&m, serde_json::Value::Null).unwrap();

        assert!(matches!(client.submit_requests(&m, Vec::new()), Err(SwapperError::EmptyBatch)));
        assert!(matches!(
            client.submit_requests(&m, rows(1..=4)),
            Err(SwapperError::BatchTooLarge { len: 4, max: 3 })
        ));
        let mut shuffled = rows(1..=3);
        shuffled.swap(0, 2);
        assert!(matches!(
            client.submit_requests(&m, shuffled),
            Err(SwapperError::RowsOutOfOrder { .. })
        ));
        assert!(client.submit_requests(&m, rows(1..=3)).is_ok());
    }

    #[test]
    fn test_chunk_rows() {
        let batches = chunk_rows(rows(1..=7), 3);
        let sizes: Vec<usize> = batches.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![3, 3, 1]);
        assert_eq!(batches[2][0].row_id, 7);
        assert!(chunk_rows(Vec::new(), 3).is_empty());
    }

    #[test]
    fn test_result_consumer_skips_malformed() {
        let (fabric, client) = create_test_client(3);
        fabric.publish(RESULTS_QUEUE, b"not json", Persistence::Persistent).unwrap();
        let result = ModelResult::Inference {
            model_id: model("m"),
            command_id: "c".to_string(),
            results: Vec::new(),
        };
        fabric
            .publish(RESULTS_QUEUE, &result.encode().unwrap(), Persistence::Persistent)
            .unwrap();

        let consumer = client.consume_results().unwrap();
        assert_eq!(consumer.next(Duration::from_millis(50)).unwrap(), Some(result));
        assert_eq!(consumer.next(Duration::from_millis(5)).unwrap(), None);
    }
}
