//! Durable queue fabric backed by SQLite.
//!
//! Provides the broker semantics the swapper relies on: named durable queues,
//! publisher-confirmed publishing, per-queue FIFO delivery with explicit
//! acknowledgement, and redelivery of everything a consumer had not
//! acknowledged when it disconnects. Producer processes and the scheduler
//! share one database file (WAL mode).

pub mod schema;

use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use uuid::Uuid;

use super::config::QueueConfig;
use super::error::{Result, SwapperError};
use super::messages::input_queue_name;
use super::types::ModelId;

/// Helper to attach the failed operation to SQLite errors.
///
/// Usage: `.map_err(fabric_error("publish message"))?`
pub fn fabric_error(context: &str) -> impl Fn(rusqlite::Error) -> SwapperError + '_ {
    move |source| SwapperError::Fabric {
        context: context.to_string(),
        source,
    }
}

/// Delivery mode of a published message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Persistence {
    /// Survives a broker restart.
    Persistent,
    /// Dropped by [`QueueFabric::recover`].
    Transient,
}

/// A message handed to a consumer and not yet acknowledged.
#[derive(Debug)]
pub struct Delivery {
    pub tag: i64,
    pub body: Vec<u8>,
    /// True when an earlier delivery of this message was never acknowledged.
    pub redelivered: bool,
}

/// What [`QueueFabric::recover`] cleaned up.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    pub transient_dropped: usize,
    pub deliveries_released: usize,
}

struct FabricInner {
    conn: Mutex<Connection>,
    poll_interval: Duration,
}

/// Cloneable handle to the queue fabric.
#[derive(Clone)]
pub struct QueueFabric {
    inner: Arc<FabricInner>,
}

impl std::fmt::Debug for QueueFabric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueFabric")
            .field("poll_interval", &self.inner.poll_interval)
            .finish()
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl QueueFabric {
    /// Open (or create) the fabric database described by `config`.
    pub fn open(config: &QueueConfig) -> Result<Self> {
        if let Some(parent) = config.db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(&config.db_path).map_err(fabric_error("open database"))?;
        conn.busy_timeout(config.busy_timeout())
            .map_err(fabric_error("set busy timeout"))?;
        let mode: String = conn
            .query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))
            .map_err(fabric_error("enable WAL"))?;
        debug!("[FABRIC] journal_mode={mode}");
        conn.execute_batch("PRAGMA synchronous = FULL")
            .map_err(fabric_error("set synchronous mode"))?;
        Self::from_connection(conn, config.poll_interval())
    }

    /// Private in-memory fabric, for tests and single-process tools.
    pub fn open_in_memory(poll_interval: Duration) -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(fabric_error("open database"))?;
        Self::from_connection(conn, poll_interval)
    }

    fn from_connection(conn: Connection, poll_interval: Duration) -> Result<Self> {
        conn.execute("PRAGMA foreign_keys = ON", [])
            .map_err(fabric_error("enable foreign keys"))?;
        schema::initialize(&conn)?;
        Ok(Self {
            inner: Arc::new(FabricInner {
                conn: Mutex::new(conn),
                poll_interval,
            }),
        })
    }

    fn connection(&self) -> MutexGuard<'_, Connection> {
        // A panic while holding the lock cannot leave SQLite half-written.
        self.inner
            .conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn poll_interval(&self) -> Duration {
        self.inner.poll_interval
    }

    /// Declare a durable queue. Returns `true` if it did not exist before.
    pub fn declare_queue(&self, name: &str) -> Result<bool> {
        let created = self
            .connection()
            .execute(
                "INSERT OR IGNORE INTO queues (name, created_at) VALUES (?1, ?2)",
                params![name, now_millis()],
            )
            .map_err(fabric_error("declare queue"))?;
        if created > 0 {
            debug!("[FABRIC] Declared queue {name}");
        }
        Ok(created > 0)
    }

    /// Delete a queue and every message in it. Returns `true` if it existed.
    pub fn delete_queue(&self, name: &str) -> Result<bool> {
        let mut conn = self.connection();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(fabric_error("begin delete queue"))?;
        tx.execute("DELETE FROM messages WHERE queue = ?1", params![name])
            .map_err(fabric_error("purge queue"))?;
        let removed = tx
            .execute("DELETE FROM queues WHERE name = ?1", params![name])
            .map_err(fabric_error("delete queue"))?;
        tx.commit().map_err(fabric_error("commit delete queue"))?;
        if removed > 0 {
            debug!("[FABRIC] Deleted queue {name}");
        }
        Ok(removed > 0)
    }

    pub fn queue_exists(&self, name: &str) -> Result<bool> {
        self.connection()
            .query_row(
                "SELECT 1 FROM queues WHERE name = ?1",
                params![name],
                |_| Ok(()),
            )
            .optional()
            .map(|found| found.is_some())
            .map_err(fabric_error("look up queue"))
    }

    /// Names of all queues starting with `prefix`, sorted.
    pub fn list_queues(&self, prefix: &str) -> Result<Vec<String>> {
        let conn = self.connection();
        let mut stmt = conn
            .prepare("SELECT name FROM queues WHERE substr(name, 1, ?2) = ?1 ORDER BY name")
            .map_err(fabric_error("prepare list queues"))?;
        let names = stmt
            .query_map(params![prefix, prefix.len() as i64], |row| row.get(0))
            .map_err(fabric_error("list queues"))?
            .collect::<std::result::Result<Vec<String>, _>>()
            .map_err(fabric_error("read queue name"))?;
        Ok(names)
    }

    pub fn create_model_input_queue(&self, model_id: &ModelId) -> Result<bool> {
        self.declare_queue(&input_queue_name(model_id))
    }

    pub fn delete_model_input_queue(&self, model_id: &ModelId) -> Result<bool> {
        self.delete_queue(&input_queue_name(model_id))
    }

    /// Publish `body` to `queue`. Returns once the message is committed.
    pub fn publish(&self, queue: &str, body: &[u8], persistence: Persistence) -> Result<i64> {
        let mut conn = self.connection();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(fabric_error("begin publish"))?;

        let exists = tx
            .query_row("SELECT 1 FROM queues WHERE name = ?1", params![queue], |_| Ok(()))
            .optional()
            .map_err(fabric_error("look up queue"))?
            .is_some();
        if !exists {
            return Err(SwapperError::QueueNotFound(queue.to_string()));
        }

        tx.execute(
            "INSERT INTO messages (queue, body, persistent, published_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                queue,
                body,
                persistence == Persistence::Persistent,
                now_millis()
            ],
        )
        .map_err(fabric_error("publish message"))?;
        let id = tx.last_insert_rowid();
        tx.commit().map_err(fabric_error("commit publish"))?;
        Ok(id)
    }

    /// Body of the oldest ready message without claiming it.
    pub fn peek(&self, queue: &str) -> Result<Option<Vec<u8>>> {
        self.connection()
            .query_row(
                "SELECT body FROM messages WHERE queue = ?1 AND consumer_tag IS NULL
                 ORDER BY id LIMIT 1",
                params![queue],
                |row| row.get(0),
            )
            .optional()
            .map_err(fabric_error("peek queue"))
    }

    /// Bodies of the ready messages in delivery order, without claiming them.
    pub fn browse(&self, queue: &str) -> Result<Vec<Vec<u8>>> {
        let conn = self.connection();
        let mut stmt = conn
            .prepare(
                "SELECT body FROM messages WHERE queue = ?1 AND consumer_tag IS NULL ORDER BY id",
            )
            .map_err(fabric_error("browse queue"))?;
        let bodies = stmt
            .query_map(params![queue], |row| row.get(0))
            .and_then(|rows| rows.collect::<rusqlite::Result<Vec<Vec<u8>>>>())
            .map_err(fabric_error("browse queue"))?;
        Ok(bodies)
    }

    /// Messages waiting for delivery (not counting in-flight deliveries).
    pub fn ready_count(&self, queue: &str) -> Result<u64> {
        self.connection()
            .query_row(
                "SELECT COUNT(*) FROM messages WHERE queue = ?1 AND consumer_tag IS NULL",
                params![queue],
                |row| row.get::<_, i64>(0),
            )
            .map(|n| n as u64)
            .map_err(fabric_error("count ready messages"))
    }

    /// All messages in the queue, delivered or not.
    pub fn message_count(&self, queue: &str) -> Result<u64> {
        self.connection()
            .query_row(
                "SELECT COUNT(*) FROM messages WHERE queue = ?1",
                params![queue],
                |row| row.get::<_, i64>(0),
            )
            .map(|n| n as u64)
            .map_err(fabric_error("count messages"))
    }

    /// Start consuming `queue`.
    pub fn consume(&self, queue: &str) -> Result<Consumer> {
        if !self.queue_exists(queue)? {
            return Err(SwapperError::QueueNotFound(queue.to_string()));
        }
        let tag = format!("ctag-{}", Uuid::new_v4());
        self.connection()
            .execute(
                "INSERT INTO consumers (tag, queue, pid, started_at) VALUES (?1, ?2, ?3, ?4)",
                params![tag, queue, std::process::id(), now_millis()],
            )
            .map_err(fabric_error("register consumer"))?;
        Ok(Consumer {
            fabric: self.clone(),
            queue: queue.to_string(),
            tag,
        })
    }

    /// Broker-restart boundary: drop transient messages and release every
    /// delivery held by a consumer whose process is gone.
    pub fn recover(&self) -> Result<RecoveryReport> {
        let mut conn = self.connection();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(fabric_error("begin recovery"))?;

        let transient_dropped = tx
            .execute(
                "DELETE FROM messages WHERE persistent = 0 AND consumer_tag IS NULL",
                [],
            )
            .map_err(fabric_error("drop transient messages"))?;

        let consumers: Vec<(String, i64)> = {
            let mut stmt = tx
                .prepare("SELECT tag, pid FROM consumers")
                .map_err(fabric_error("prepare consumer scan"))?;
            let rows = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
                .map_err(fabric_error("scan consumers"))?
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(fabric_error("read consumer"))?;
            rows
        };
        for (tag, pid) in consumers {
            if !process_alive(pid) {
                tx.execute("DELETE FROM consumers WHERE tag = ?1", params![tag])
                    .map_err(fabric_error("remove dead consumer"))?;
            }
        }

        let deliveries_released = tx
            .execute(
                "UPDATE messages SET consumer_tag = NULL
                 WHERE consumer_tag IS NOT NULL
                   AND consumer_tag NOT IN (SELECT tag FROM consumers)",
                [],
            )
            .map_err(fabric_error("release orphaned deliveries"))?;

        tx.commit().map_err(fabric_error("commit recovery"))?;

        let report = RecoveryReport {
            transient_dropped,
            deliveries_released,
        };
        if report != RecoveryReport::default() {
            info!(
                "[FABRIC] Recovery dropped {transient_dropped} transient message(s), \
                 released {deliveries_released} unacknowledged delivery(ies)"
            );
        }
        Ok(report)
    }
}

fn process_alive(pid: i64) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Consumer of one queue. Dropping it releases every unacknowledged delivery.
pub struct Consumer {
    fabric: QueueFabric,
    queue: String,
    tag: String,
}

impl std::fmt::Debug for Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer")
            .field("queue", &self.queue)
            .field("tag", &self.tag)
            .finish()
    }
}

impl Consumer {
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Claim the oldest ready message, if any.
    pub fn try_next(&self) -> Result<Option<Delivery>> {
        let mut conn = self.fabric.connection();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(fabric_error("begin claim"))?;

        let claimed: Option<(i64, Vec<u8>, i64)> = tx
            .query_row(
                "SELECT id, body, delivery_count FROM messages
                 WHERE queue = ?1 AND consumer_tag IS NULL
                 ORDER BY id LIMIT 1",
                params![self.queue],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()
            .map_err(fabric_error("select next message"))?;

        let Some((id, body, delivery_count)) = claimed else {
            return Ok(None);
        };

        tx.execute(
            "UPDATE messages SET consumer_tag = ?1, delivery_count = delivery_count + 1
             WHERE id = ?2",
            params![self.tag, id],
        )
        .map_err(fabric_error("claim message"))?;
        tx.commit().map_err(fabric_error("commit claim"))?;

        Ok(Some(Delivery {
            tag: id,
            body,
            redelivered: delivery_count > 0,
        }))
    }

    /// Wait up to `timeout` for the next message.
    pub fn next(&self, timeout: Duration) -> Result<Option<Delivery>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(delivery) = self.try_next()? {
                return Ok(Some(delivery));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            thread::sleep(self.fabric.poll_interval().min(deadline - now));
        }
    }

    /// Acknowledge a delivery, removing the message for good.
    pub fn ack(&self, delivery: Delivery) -> Result<()> {
        let removed = self
            .fabric
            .connection()
            .execute(
                "DELETE FROM messages WHERE id = ?1 AND consumer_tag = ?2",
                params![delivery.tag, self.tag],
            )
            .map_err(fabric_error("ack message"))?;
        if removed == 0 {
            debug!(
                "[FABRIC] Ack for message {} on {} matched nothing (queue purged?)",
                delivery.tag, self.queue
            );
        }
        Ok(())
    }

    /// Negative acknowledgement: put the message back or drop it.
    pub fn reject(&self, delivery: Delivery, requeue: bool) -> Result<()> {
        let conn = self.fabric.connection();
        let result = if requeue {
            conn.execute(
                "UPDATE messages SET consumer_tag = NULL WHERE id = ?1 AND consumer_tag = ?2",
                params![delivery.tag, self.tag],
            )
        } else {
            conn.execute(
                "DELETE FROM messages WHERE id = ?1 AND consumer_tag = ?2",
                params![delivery.tag, self.tag],
            )
        };
        result.map_err(fabric_error("reject message"))?;
        Ok(())
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        let conn = self.fabric.connection();
        let released = conn.execute(
            "UPDATE messages SET consumer_tag = NULL WHERE consumer_tag = ?1",
            params![self.tag],
        );
        match released {
            Ok(n) if n > 0 => debug!(
                "[FABRIC] Consumer on {} disconnected, {n} delivery(ies) released",
                self.queue
            ),
            Ok(_) => {}
            Err(e) => warn!("[FABRIC] Failed to release deliveries for {}: {e}", self.queue),
        }
        let _ = conn.execute("DELETE FROM consumers WHERE tag = ?1", params![self.tag]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_fabric() -> QueueFabric {
        QueueFabric::open_in_memory(Duration::from_millis(1)).unwrap()
    }

    #[test]
    fn test_publish_to_missing_queue_fails() {
        let fabric = create_test_fabric();
        let result = fabric.publish("nope", b"x", Persistence::Persistent);
        assert!(matches!(result, Err(SwapperError::QueueNotFound(q)) if q == "nope"));
    }

    #[test]
    fn test_fifo_delivery_and_ack() {
        let fabric = create_test_fabric();
        fabric.declare_queue("q").unwrap();
        for body in [b"1", b"2", b"3"] {
            fabric.publish("q", body, Persistence::Persistent).unwrap();
        }

        let consumer = fabric.consume("q").unwrap();
        let mut seen = Vec::new();
        while let Some(delivery) = consumer.try_next().unwrap() {
            seen.push(delivery.body.clone());
            assert!(!delivery.redelivered);
            consumer.ack(delivery).unwrap();
        }
        assert_eq!(seen, vec![b"1".to_vec(), b"2".to_vec(), b"3".to_vec()]);
        assert_eq!(fabric.message_count("q").unwrap(), 0);
    }

    #[test]
    fn test_dropped_consumer_redelivers_in_order() {
        let fabric = create_test_fabric();
        fabric.declare_queue("q").unwrap();
        fabric.publish("q", b"a", Persistence::Persistent).unwrap();
        fabric.publish("q", b"b", Persistence::Persistent).unwrap();

        {
            let consumer = fabric.consume("q").unwrap();
            let first = consumer.try_next().unwrap().unwrap();
            assert_eq!(first.body, b"a");
            assert_eq!(fabric.ready_count("q").unwrap(), 1);
            // dropped without ack
        }

        assert_eq!(fabric.ready_count("q").unwrap(), 2);
        let consumer = fabric.consume("q").unwrap();
        let again = consumer.try_next().unwrap().unwrap();
        assert_eq!(again.body, b"a");
        assert!(again.redelivered);
    }

    #[test]
    fn test_reject_requeue_and_drop() {
        let fabric = create_test_fabric();
        fabric.declare_queue("q").unwrap();
        fabric.publish("q", b"a", Persistence::Persistent).unwrap();

        let consumer = fabric.consume("q").unwrap();
        let d = consumer.try_next().unwrap().unwrap();
        consumer.reject(d, true).unwrap();
        assert_eq!(fabric.ready_count("q").unwrap(), 1);

        let d = consumer.try_next().unwrap().unwrap();
        consumer.reject(d, false).unwrap();
        assert_eq!(fabric.message_count("q").unwrap(), 0);
    }

    #[test]
    fn test_peek_does_not_claim() {
        let fabric = create_test_fabric();
        fabric.declare_queue("q").unwrap();
        assert_eq!(fabric.peek("q").unwrap(), None);
        fabric.publish("q", b"head", Persistence::Persistent).unwrap();
        assert_eq!(fabric.peek("q").unwrap(), Some(b"head".to_vec()));
        assert_eq!(fabric.ready_count("q").unwrap(), 1);
    }

    #[test]
    fn test_browse_skips_claimed_messages() {
        let fabric = create_test_fabric();
        fabric.declare_queue("q").unwrap();
        for body in [b"a", b"b", b"c"] {
            fabric.publish("q", body, Persistence::Persistent).unwrap();
        }
        let consumer = fabric.consume("q").unwrap();
        let claimed = consumer.try_next().unwrap().unwrap();
        assert_eq!(claimed.body, b"a".to_vec());
        assert_eq!(fabric.browse("q").unwrap(), vec![b"b".to_vec(), b"c".to_vec()]);
        assert!(fabric.browse("missing").unwrap().is_empty());
    }

    #[test]
    fn test_delete_queue_purges_messages() {
        let fabric = create_test_fabric();
        fabric.declare_queue("q").unwrap();
        fabric.publish("q", b"a", Persistence::Persistent).unwrap();
        assert!(fabric.delete_queue("q").unwrap());
        assert!(!fabric.queue_exists("q").unwrap());
        assert_eq!(fabric.message_count("q").unwrap(), 0);
        assert!(!fabric.delete_queue("q").unwrap());
    }

    #[test]
    fn test_list_queues_by_prefix() {
        let fabric = create_test_fabric();
        for name in ["in.b", "in.a", "other"] {
            fabric.declare_queue(name).unwrap();
        }
        assert_eq!(
            fabric.list_queues("in.").unwrap(),
            vec!["in.a".to_string(), "in.b".to_string()]
        );
    }

    #[test]
    fn test_recover_drops_transient_and_orphans() {
        let fabric = create_test_fabric();
        fabric.declare_queue("q").unwrap();
        fabric.publish("q", b"keep", Persistence::Persistent).unwrap();
        fabric.publish("q", b"hint", Persistence::Transient).unwrap();

        // Simulate a delivery held by a consumer from a process that is gone.
        fabric
            .connection()
            .execute(
                "UPDATE messages SET consumer_tag = 'ctag-dead' WHERE body = x'6b656570'",
                [],
            )
            .unwrap();

        let report = fabric.recover().unwrap();
        assert_eq!(report.transient_dropped, 1);
        assert_eq!(report.deliveries_released, 1);
        assert_eq!(fabric.ready_count("q").unwrap(), 1);
    }

    #[test]
    fn test_next_times_out_on_empty_queue() {
        let fabric = create_test_fabric();
        fabric.declare_queue("q").unwrap();
        let consumer = fabric.consume("q").unwrap();
        let started = Instant::now();
        assert!(consumer.next(Duration::from_millis(20)).unwrap().is_none());
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_file_backed_fabric_is_durable() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = QueueConfig {
            db_path: dir.path().join("queues.db"),
            ..QueueConfig::default()
        };
        {
            let fabric = QueueFabric::open(&config).unwrap();
            fabric.declare_queue("q").unwrap();
            fabric.publish("q", b"persisted", Persistence::Persistent).unwrap();
        }
        let reopened = QueueFabric::open(&config).unwrap();
        assert_eq!(reopened.peek("q").unwrap(), Some(b"persisted".to_vec()));
    }
}
