//! Durable pull-queue over a Redis stream consumer group
//!
//! One entry at a time: read, hold the lease while processing, publish the
//! reply tagged with the inbound delivery id, then acknowledge. An entry is
//! only acknowledged once its reply is in the output stream, so a crash at
//! any point before the ack leaves it pending and it is delivered again,
//! either to this consumer on restart or to another one once the lease
//! lapses.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use eduseal::DocumentService;
use redis::AsyncCommands;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::streams::{
    StreamClaimOptions, StreamClaimReply, StreamId, StreamPendingCountReply, StreamReadOptions,
    StreamReadReply,
};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::message::{BODY_FIELD, DELIVERY_ID_FIELD, dispatch_body};
use crate::config::StreamConfig;
use crate::error::TransportError;

/// Read position for entries never delivered to any consumer of the group
const NEW_ENTRIES: &str = ">";
/// Read position for this consumer's own delivered-but-unacknowledged entries
const OWN_PENDING: &str = "0";
const RECLAIM_BATCH: usize = 10;
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

pub struct StreamConsumer {
    service: Arc<dyn DocumentService>,
    config: StreamConfig,
    /// Dedicated to blocking reads so they never stall writes; cloned per read
    reader: MultiplexedConnection,
    writer: ConnectionManager,
}

impl StreamConsumer {
    pub async fn connect(
        service: Arc<dyn DocumentService>,
        config: StreamConfig,
    ) -> Result<Self, TransportError> {
        info!("Connecting to Redis at {}", config.redis_url);
        let client = redis::Client::open(config.redis_url.as_str())?;
        let reader = client.get_multiplexed_async_connection().await?;
        let writer = ConnectionManager::new(client).await?;
        info!("Connected to Redis");

        let consumer = Self {
            service,
            config,
            reader,
            writer,
        };
        consumer.ensure_group().await?;
        Ok(consumer)
    }

    /// Create the consumer group (and the stream) unless it already exists.
    async fn ensure_group(&self) -> Result<(), TransportError> {
        let mut conn = self.writer.clone();
        let created: Result<(), redis::RedisError> = conn
            .xgroup_create_mkstream(&self.config.input_stream, &self.config.group, "$")
            .await;
        match created {
            Ok(()) => {
                info!(
                    "Created consumer group {} on {}",
                    self.config.group, self.config.input_stream
                );
                Ok(())
            }
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Consume until `shutdown` resolves. An entry being processed when the
    /// signal arrives is finished first.
    ///
    /// Stale entries are reclaimed between reads, at most once per lease.
    /// A blocking read is never abandoned for anything but shutdown: the
    /// command would stay queued on the server and swallow the next entry.
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> Result<(), TransportError> {
        info!(
            "Consuming {} as {}/{}",
            self.config.input_stream, self.config.group, self.config.consumer
        );
        self.drain_own_pending().await?;

        tokio::pin!(shutdown);
        let mut last_reclaim: Option<Instant> = None;

        loop {
            if last_reclaim.is_none_or(|at| at.elapsed() >= self.config.lease) {
                if let Err(e) = self.reclaim_stale().await {
                    warn!("Reclaiming stale entries failed: {}", e);
                }
                last_reclaim = Some(Instant::now());
            }

            tokio::select! {
                _ = &mut shutdown => break,
                read = Self::read_one(self.reader.clone(), &self.config, NEW_ENTRIES) => {
                    match read {
                        Ok(Some(entry)) => {
                            if let Err(e) = self.handle(entry).await {
                                error!("Entry left pending for redelivery: {}", e);
                                tokio::time::sleep(ERROR_BACKOFF).await;
                            }
                        }
                        Ok(None) => {}
                        Err(e) => {
                            error!("Stream read failed: {}", e);
                            tokio::time::sleep(ERROR_BACKOFF).await;
                        }
                    }
                }
            }
        }

        info!("Stream consumer stopped");
        Ok(())
    }

    /// Entries delivered to this consumer before a restart come first.
    async fn drain_own_pending(&self) -> Result<(), TransportError> {
        let mut drained = 0usize;
        while let Some(entry) =
            Self::read_one(self.reader.clone(), &self.config, OWN_PENDING).await?
        {
            self.handle(entry).await?;
            drained += 1;
        }
        if drained > 0 {
            info!("Reprocessed {} pending entries", drained);
        }
        Ok(())
    }

    async fn read_one(
        mut conn: MultiplexedConnection,
        config: &StreamConfig,
        position: &str,
    ) -> Result<Option<StreamId>, TransportError> {
        let mut options = StreamReadOptions::default()
            .group(&config.group, &config.consumer)
            .count(1);
        if position == NEW_ENTRIES {
            options = options.block(config.block.as_millis() as usize);
        }

        let reply: Option<StreamReadReply> = conn
            .xread_options(&[&config.input_stream], &[position], &options)
            .await?;

        Ok(reply
            .and_then(|r| r.keys.into_iter().next())
            .and_then(|key| key.ids.into_iter().next()))
    }

    /// Take over entries other consumers have held past the lease.
    async fn reclaim_stale(&self) -> Result<(), TransportError> {
        let mut conn = self.writer.clone();
        let pending: StreamPendingCountReply = conn
            .xpending_count(
                &self.config.input_stream,
                &self.config.group,
                "-",
                "+",
                RECLAIM_BATCH,
            )
            .await?;

        let lease_ms = self.config.lease.as_millis() as usize;
        let stale: Vec<String> = pending
            .ids
            .into_iter()
            .filter(|p| p.last_delivered_ms >= lease_ms)
            .map(|p| p.id)
            .collect();
        if stale.is_empty() {
            return Ok(());
        }

        let claimed: StreamClaimReply = conn
            .xclaim(
                &self.config.input_stream,
                &self.config.group,
                &self.config.consumer,
                lease_ms,
                &stale,
            )
            .await?;

        info!("Reclaimed {} stale entries", claimed.ids.len());
        for entry in claimed.ids {
            self.handle(entry).await?;
        }
        Ok(())
    }

    async fn handle(&self, entry: StreamId) -> Result<(), TransportError> {
        let delivery_id: String = entry
            .get(DELIVERY_ID_FIELD)
            .unwrap_or_else(|| entry.id.clone());
        let body: String = entry.get(BODY_FIELD).unwrap_or_default();
        debug!("Processing entry {} (delivery {})", entry.id, delivery_id);

        let processing = dispatch_body(self.service.as_ref(), self.config.operation, &body);
        let reply = self.holding_lease(&entry.id, processing).await?;

        let mut conn = self.writer.clone();
        let _: String = conn
            .xadd(
                &self.config.output_stream,
                "*",
                &[(DELIVERY_ID_FIELD, delivery_id.as_str()), (BODY_FIELD, reply.as_str())],
            )
            .await?;
        let _: i64 = conn
            .xack(&self.config.input_stream, &self.config.group, &[&entry.id])
            .await?;

        debug!("Acknowledged entry {}", entry.id);
        Ok(())
    }

    /// Drive `work` to completion while periodically resetting the entry's
    /// idle time so no other consumer claims it.
    async fn holding_lease<T>(&self, id: &str, work: impl Future<Output = T>) -> T {
        tokio::pin!(work);
        let mut ticker = tokio::time::interval(self.config.lease / 2);
        ticker.tick().await;

        loop {
            tokio::select! {
                done = &mut work => return done,
                _ = ticker.tick() => {
                    if let Err(e) = self.extend_lease(id).await {
                        warn!("Failed to extend lease on {}: {}", id, e);
                    }
                }
            }
        }
    }

    async fn extend_lease(&self, id: &str) -> Result<(), TransportError> {
        let mut conn = self.writer.clone();
        let _: redis::Value = conn
            .xclaim_options(
                &self.config.input_stream,
                &self.config.group,
                &self.config.consumer,
                0,
                &[id],
                StreamClaimOptions::default().with_justid(),
            )
            .await?;
        Ok(())
    }
}

/// Producer half of the durable queue.
///
/// A delivery id seen within the dedup window is dropped instead of being
/// enqueued twice.
#[derive(Clone)]
pub struct StreamProducer {
    conn: ConnectionManager,
    stream: String,
    dedup_window: Duration,
}

impl StreamProducer {
    pub fn new(conn: ConnectionManager, stream: &str, dedup_window: Duration) -> Self {
        Self {
            conn,
            stream: stream.to_string(),
            dedup_window,
        }
    }

    fn dedup_key(&self, delivery_id: &str) -> String {
        format!("{}:dedup:{}", self.stream, delivery_id)
    }

    /// Enqueue a request. Returns the entry id, or `None` when the delivery
    /// id was already published within the window.
    pub async fn publish<T: Serialize>(
        &self,
        delivery_id: &str,
        request: &T,
    ) -> Result<Option<String>, TransportError> {
        let mut conn = self.conn.clone();
        let body = serde_json::to_string(request)?;

        let fresh: Option<String> = redis::cmd("SET")
            .arg(self.dedup_key(delivery_id))
            .arg(1)
            .arg("NX")
            .arg("EX")
            .arg(self.dedup_window.as_secs().max(1))
            .query_async(&mut conn)
            .await?;
        if fresh.is_none() {
            debug!("Dropping duplicate delivery {}", delivery_id);
            return Ok(None);
        }

        let id: String = conn
            .xadd(
                &self.stream,
                "*",
                &[(DELIVERY_ID_FIELD, delivery_id), (BODY_FIELD, body.as_str())],
            )
            .await?;
        Ok(Some(id))
    }
}
