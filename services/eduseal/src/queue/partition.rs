//! Streaming queue: consume, process, forward
//!
//! Every configured partition is a Redis stream read from its committed
//! offset. Entries are handled strictly in order within a partition; the
//! offset is committed only after the reply has been forwarded, which gives
//! at-least-once delivery. There is no ordering across partitions.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use eduseal::DocumentService;
use redis::AsyncCommands;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::streams::{StreamId, StreamReadOptions, StreamReadReply};
use tracing::{debug, error, info};

use super::message::{BODY_FIELD, DELIVERY_ID_FIELD, dispatch_body};
use crate::config::PartitionConfig;
use crate::error::TransportError;

const START_OFFSET: &str = "0";
const READ_BATCH: usize = 16;

pub struct PartitionConsumer {
    service: Arc<dyn DocumentService>,
    config: PartitionConfig,
    reader: MultiplexedConnection,
    writer: ConnectionManager,
    offsets: HashMap<String, String>,
}

impl PartitionConsumer {
    pub async fn connect(
        service: Arc<dyn DocumentService>,
        config: PartitionConfig,
    ) -> Result<Self, TransportError> {
        info!("Connecting to Redis at {}", config.redis_url);
        let client = redis::Client::open(config.redis_url.as_str())?;
        let reader = client.get_multiplexed_async_connection().await?;
        let mut writer = ConnectionManager::new(client).await?;

        let committed: HashMap<String, String> = writer.hgetall(&config.offsets_key).await?;
        let offsets = config
            .partitions
            .iter()
            .map(|p| {
                let offset = committed
                    .get(p)
                    .cloned()
                    .unwrap_or_else(|| START_OFFSET.to_string());
                (p.clone(), offset)
            })
            .collect();
        info!("Resuming partitions from {:?}", offsets);

        Ok(Self {
            service,
            config,
            reader,
            writer,
            offsets,
        })
    }

    pub async fn run(mut self, shutdown: impl Future<Output = ()>) -> Result<(), TransportError> {
        info!("Consuming partitions {:?}", self.config.partitions);
        tokio::pin!(shutdown);

        loop {
            let read = {
                let ids: Vec<&str> = self
                    .config
                    .partitions
                    .iter()
                    .map(|p| self.offsets.get(p).map(String::as_str).unwrap_or(START_OFFSET))
                    .collect();
                let options = StreamReadOptions::default()
                    .count(READ_BATCH)
                    .block(self.config.block.as_millis() as usize);

                tokio::select! {
                    _ = &mut shutdown => break,
                    read = read_batch(self.reader.clone(), &self.config.partitions, &ids, &options) => read,
                }
            };

            match read {
                Ok(Some(reply)) => {
                    for key in reply.keys {
                        self.process_partition(&key.key, key.ids).await?;
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    error!("Partition read failed: {}", e);
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                }
            }
        }

        info!("Partition consumer stopped");
        Ok(())
    }

    async fn process_partition(
        &mut self,
        partition: &str,
        entries: Vec<StreamId>,
    ) -> Result<(), TransportError> {
        for entry in entries {
            let delivery_id: String = entry
                .get(DELIVERY_ID_FIELD)
                .unwrap_or_else(|| entry.id.clone());
            let body: String = entry.get(BODY_FIELD).unwrap_or_default();
            debug!("Processing {} entry {}", partition, entry.id);

            let reply = dispatch_body(self.service.as_ref(), self.config.operation, &body).await?;

            let _: String = self
                .writer
                .xadd(
                    &self.config.output_stream,
                    "*",
                    &[(DELIVERY_ID_FIELD, delivery_id.as_str()), (BODY_FIELD, reply.as_str())],
                )
                .await?;
            let _: () = self
                .writer
                .hset(&self.config.offsets_key, partition, &entry.id)
                .await?;
            self.offsets.insert(partition.to_string(), entry.id);
        }
        Ok(())
    }
}

async fn read_batch(
    mut conn: MultiplexedConnection,
    partitions: &[String],
    ids: &[&str],
    options: &StreamReadOptions,
) -> redis::RedisResult<Option<StreamReadReply>> {
    conn.xread_options(partitions, ids, options).await
}
