//! Redis Streams implementation of the log client.
//!
//! Wire commands: `XGROUP CREATE … MKSTREAM`, `XREADGROUP`, `XADD`, `XACK`,
//! `XAUTOCLAIM`, `XPENDING`. Replies are parsed from raw protocol values;
//! entry field maps stay flat string-to-string pairs end to end.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, RedisError, Value};
use tracing::warn;

use super::{DeliveredEntry, StreamLog, StreamLogError};

/// Log client over a shared Redis connection.
///
/// The connection manager multiplexes and reconnects internally, so one
/// clone per call is cheap and every loop can hold the same client.
#[derive(Clone)]
pub struct RedisStreamLog {
    manager: ConnectionManager,
}

impl RedisStreamLog {
    pub fn new(manager: ConnectionManager) -> Self {
        Self { manager }
    }

    /// Open a connection. The caller treats a failure here as fatal; it is
    /// the only error that may abort worker startup.
    pub async fn connect(url: &str) -> Result<Self, StreamLogError> {
        let client = Client::open(url).map_err(StreamLogError::Transport)?;
        let manager = ConnectionManager::new(client)
            .await
            .map_err(StreamLogError::Transport)?;
        Ok(Self::new(manager))
    }
}

#[async_trait]
impl StreamLog for RedisStreamLog {
    async fn ensure_group(&self, partition: &str, group: &str) -> Result<(), StreamLogError> {
        let mut conn = self.manager.clone();
        let created: Result<String, RedisError> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(partition)
            .arg(group)
            .arg("$")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match created {
            Ok(_) => Ok(()),
            // Group already exists; creation is idempotent.
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn read_batch(
        &self,
        partitions: &[String],
        group: &str,
        consumer: &str,
        max_count: usize,
        block: Duration,
    ) -> Result<Vec<DeliveredEntry>, StreamLogError> {
        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP")
            .arg(group)
            .arg(consumer)
            .arg("COUNT")
            .arg(max_count)
            .arg("BLOCK")
            .arg(block.as_millis() as u64)
            .arg("STREAMS");
        for partition in partitions {
            cmd.arg(partition);
        }
        for _ in partitions {
            cmd.arg(">");
        }

        let mut conn = self.manager.clone();
        let reply: Value = cmd
            .query_async(&mut conn)
            .await
            .map_err(|e| classify(e, partitions.join(",")))?;

        parse_read_reply(reply)
    }

    async fn append(
        &self,
        partition: &str,
        fields: &[(String, String)],
    ) -> Result<String, StreamLogError> {
        let mut cmd = redis::cmd("XADD");
        cmd.arg(partition).arg("*");
        for (key, value) in fields {
            cmd.arg(key).arg(value);
        }

        let mut conn = self.manager.clone();
        let id: String = cmd.query_async(&mut conn).await?;
        Ok(id)
    }

    async fn acknowledge(
        &self,
        partition: &str,
        group: &str,
        entry_ids: &[String],
    ) -> Result<(), StreamLogError> {
        if entry_ids.is_empty() {
            return Ok(());
        }

        let mut conn = self.manager.clone();
        // XACK returns how many ids were actually pending; unknown or
        // already-acknowledged ids just do not count, which is the
        // idempotency we want.
        let _acked: i64 = redis::cmd("XACK")
            .arg(partition)
            .arg(group)
            .arg(entry_ids)
            .query_async(&mut conn)
            .await
            .map_err(|e| classify(e, partition.to_string()))?;
        Ok(())
    }

    async fn reclaim_stale(
        &self,
        partition: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        max_count: usize,
    ) -> Result<Vec<DeliveredEntry>, StreamLogError> {
        let mut conn = self.manager.clone();
        let reply: Value = redis::cmd("XAUTOCLAIM")
            .arg(partition)
            .arg(group)
            .arg(consumer)
            .arg(min_idle.as_millis() as u64)
            .arg("0-0")
            .arg("COUNT")
            .arg(max_count)
            .query_async(&mut conn)
            .await
            .map_err(|e| classify(e, partition.to_string()))?;

        parse_autoclaim_reply(partition, reply)
    }

    async fn pending_count(&self, partition: &str, group: &str) -> Result<u64, StreamLogError> {
        let mut conn = self.manager.clone();
        let reply: Value = redis::cmd("XPENDING")
            .arg(partition)
            .arg(group)
            .query_async(&mut conn)
            .await
            .map_err(|e| classify(e, partition.to_string()))?;

        match reply {
            Value::Bulk(summary) => match summary.first() {
                Some(Value::Int(count)) => Ok((*count).max(0) as u64),
                _ => Ok(0),
            },
            _ => Ok(0),
        }
    }
}

/// Map NOGROUP responses to the distinguished error; everything else is
/// transport and propagates undecorated.
fn classify(error: RedisError, scope: String) -> StreamLogError {
    if error.code() == Some("NOGROUP") {
        StreamLogError::GroupMissing(scope)
    } else {
        StreamLogError::Transport(error)
    }
}

fn malformed(what: &str) -> StreamLogError {
    StreamLogError::Transport(RedisError::from((
        redis::ErrorKind::TypeError,
        "malformed stream reply",
        what.to_string(),
    )))
}

fn as_string(value: &Value) -> Result<String, StreamLogError> {
    match value {
        Value::Data(bytes) => Ok(String::from_utf8_lossy(bytes).into_owned()),
        Value::Status(s) => Ok(s.clone()),
        _ => Err(malformed("expected string")),
    }
}

/// `XREADGROUP` reply: nil on timeout, otherwise
/// `[[stream, [[id, [k, v, …]], …]], …]`.
fn parse_read_reply(reply: Value) -> Result<Vec<DeliveredEntry>, StreamLogError> {
    let streams = match reply {
        Value::Nil => return Ok(Vec::new()),
        Value::Bulk(streams) => streams,
        _ => return Err(malformed("XREADGROUP reply")),
    };

    let mut delivered = Vec::new();
    for stream in streams {
        let Value::Bulk(pair) = stream else {
            return Err(malformed("stream element"));
        };
        if pair.len() < 2 {
            return Err(malformed("stream element"));
        }
        let partition = as_string(&pair[0])?;
        let Value::Bulk(entries) = &pair[1] else {
            return Err(malformed("stream entries"));
        };
        for entry in entries {
            if let Some(parsed) = parse_entry(&partition, entry) {
                delivered.push(parsed);
            }
        }
    }
    Ok(delivered)
}

/// `XAUTOCLAIM` reply: `[cursor, [entry, …], …]`; entries deleted from the
/// stream surface as nils and are skipped.
fn parse_autoclaim_reply(
    partition: &str,
    reply: Value,
) -> Result<Vec<DeliveredEntry>, StreamLogError> {
    let Value::Bulk(parts) = reply else {
        return Err(malformed("XAUTOCLAIM reply"));
    };
    let Some(Value::Bulk(entries)) = parts.get(1) else {
        return Err(malformed("XAUTOCLAIM entries"));
    };

    Ok(entries
        .iter()
        .filter_map(|entry| parse_entry(partition, entry))
        .collect())
}

/// One `[id, [k, v, …]]` element. Malformed entries are dropped with a
/// warning rather than poisoning the whole batch.
fn parse_entry(partition: &str, entry: &Value) -> Option<DeliveredEntry> {
    let Value::Bulk(pair) = entry else {
        return None;
    };
    let entry_id = as_string(pair.first()?).ok()?;
    let Some(Value::Bulk(flat)) = pair.get(1) else {
        warn!(partition, entry_id, "stream entry without field map");
        return None;
    };

    let mut fields = Vec::with_capacity(flat.len() / 2);
    for kv in flat.chunks(2) {
        if let [key, value] = kv {
            if let (Ok(key), Ok(value)) = (as_string(key), as_string(value)) {
                fields.push((key, value));
            }
        }
    }

    Some(DeliveredEntry {
        partition: partition.to_string(),
        entry_id,
        fields,
    })
}
