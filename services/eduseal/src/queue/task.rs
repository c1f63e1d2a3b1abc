//! Blocking task queue over Redis lists
//!
//! Producers `LPUSH` tasks onto the queue and the worker `BLMOVE`s them into
//! its own processing list, so tasks are served first in, first out and a
//! task is never only in the worker's memory. The result is written back
//! under the task's `urn` key, where the producer waits for it, unless a
//! result queue is configured, in which case it is pushed there instead.
//! Only then is the task removed from the processing list. Whatever is left
//! there after a crash or a failed write is handled again on the next pass,
//! so delivery is at least once.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use eduseal::DocumentService;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::{AsyncCommands, Direction};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, error, info, warn};

use super::message::{Task, TaskResult, dispatch};
use crate::config::TaskConfig;
use crate::error::TransportError;

const ERROR_BACKOFF: Duration = Duration::from_secs(1);

pub struct TaskWorker {
    service: Arc<dyn DocumentService>,
    config: TaskConfig,
    processing: String,
    reader: MultiplexedConnection,
    writer: ConnectionManager,
}

impl TaskWorker {
    pub async fn connect(
        service: Arc<dyn DocumentService>,
        config: TaskConfig,
    ) -> Result<Self, TransportError> {
        info!("Connecting to Redis at {}", config.redis_url);
        let client = redis::Client::open(config.redis_url.as_str())?;
        let reader = client.get_multiplexed_async_connection().await?;
        let writer = ConnectionManager::new(client).await?;
        info!("Connected to Redis");

        Ok(Self {
            service,
            processing: config.processing_queue(),
            config,
            reader,
            writer,
        })
    }

    pub async fn run(self, shutdown: impl Future<Output = ()>) -> Result<(), TransportError> {
        info!(
            "Waiting for tasks on {} (processing list {})",
            self.config.queue, self.processing
        );
        self.drain_processing().await?;
        tokio::pin!(shutdown);
        let mut retry = false;

        loop {
            if retry {
                match self.drain_processing().await {
                    Ok(()) => retry = false,
                    Err(e) => {
                        error!("Retrying unfinished tasks failed: {}", e);
                        tokio::time::sleep(ERROR_BACKOFF).await;
                    }
                }
            }

            tokio::select! {
                _ = &mut shutdown => break,
                taken = take(
                    self.reader.clone(),
                    &self.config.queue,
                    &self.processing,
                    self.config.block,
                ) => {
                    match taken {
                        Ok(Some(raw)) => {
                            if let Err(e) = self.complete(&raw).await {
                                error!("Task left in {} for retry: {}", self.processing, e);
                                tokio::time::sleep(ERROR_BACKOFF).await;
                                retry = true;
                            }
                        }
                        Ok(None) => {}
                        Err(e) => {
                            error!("Task queue read failed: {}", e);
                            tokio::time::sleep(ERROR_BACKOFF).await;
                        }
                    }
                }
            }
        }

        info!("Task worker stopped");
        Ok(())
    }

    /// Handle every task still in the processing list, oldest first.
    async fn drain_processing(&self) -> Result<(), TransportError> {
        let mut conn = self.writer.clone();
        let unfinished: Vec<String> = conn.lrange(&self.processing, 0, -1).await?;
        if unfinished.is_empty() {
            return Ok(());
        }

        info!("Resuming {} unfinished tasks", unfinished.len());
        for raw in unfinished.iter().rev() {
            self.complete(raw).await?;
        }
        Ok(())
    }

    /// Answer a task, then drop it from the processing list.
    async fn complete(&self, raw: &str) -> Result<(), TransportError> {
        self.handle(raw).await?;
        let mut conn = self.writer.clone();
        let _: i64 = conn.lrem(&self.processing, 1, raw).await?;
        Ok(())
    }

    async fn handle(&self, raw: &str) -> Result<(), TransportError> {
        let task: Task = match serde_json::from_str(raw) {
            Ok(task) => task,
            Err(e) => {
                // Without a urn there is nowhere to write a reply
                warn!("Dropping task: {}", TransportError::Malformed(e.to_string()));
                return Ok(());
            }
        };
        debug!("Processing task {}", task.urn);

        let reply = dispatch(self.service.as_ref(), self.config.operation, task.data).await;
        if !reply.error().is_empty() {
            debug!("Task {} failed: {}", task.urn, reply.error());
        }

        let result = TaskResult {
            urn: task.urn,
            delivery_id: task.delivery_id,
            data: serde_json::to_value(&reply)?,
        };
        self.write_result(&result).await
    }

    async fn write_result(&self, result: &TaskResult) -> Result<(), TransportError> {
        let mut conn = self.writer.clone();
        let json = serde_json::to_string(result)?;

        match &self.config.result_queue {
            Some(queue) => {
                let _: () = conn.lpush(queue, &json).await?;
            }
            None => {
                let _: () = redis::pipe()
                    .atomic()
                    .lpush(&result.urn, &json)
                    .expire(&result.urn, self.config.result_ttl.as_secs() as i64)
                    .query_async(&mut conn)
                    .await?;
            }
        }
        debug!("Result written for task {}", result.urn);
        Ok(())
    }
}

/// Move the oldest task into `processing`, waiting up to `block`.
async fn take(
    mut conn: MultiplexedConnection,
    queue: &str,
    processing: &str,
    block: Duration,
) -> redis::RedisResult<Option<String>> {
    conn.blmove(
        queue,
        processing,
        Direction::Right,
        Direction::Left,
        block.as_secs_f64(),
    )
    .await
}

async fn pop(
    mut conn: MultiplexedConnection,
    key: &str,
    block: Duration,
) -> redis::RedisResult<Option<(String, String)>> {
    conn.brpop(key, block.as_secs_f64()).await
}

/// Producer half of the task queue.
#[derive(Clone)]
pub struct TaskProducer {
    client: redis::Client,
    conn: ConnectionManager,
    queue: String,
}

impl TaskProducer {
    pub async fn connect(redis_url: &str, queue: &str) -> Result<Self, TransportError> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client.clone()).await?;
        Ok(Self {
            client,
            conn,
            queue: queue.to_string(),
        })
    }

    /// Enqueue a request under a fresh urn and return that urn.
    pub async fn submit<T: Serialize>(
        &self,
        request: &T,
        delivery_id: Option<&str>,
    ) -> Result<String, TransportError> {
        let task = Task {
            urn: format!("urn:uuid:{}", uuid::Uuid::new_v4()),
            data: serde_json::to_value(request)?,
            delivery_id: delivery_id.map(String::from),
        };
        let mut conn = self.conn.clone();
        let _: () = conn
            .lpush(&self.queue, serde_json::to_string(&task)?)
            .await?;
        Ok(task.urn)
    }

    /// Wait up to `timeout` for the result written back under `urn`.
    pub async fn wait(
        &self,
        urn: &str,
        timeout: Duration,
    ) -> Result<Option<TaskResult>, TransportError> {
        let conn = self.client.get_multiplexed_async_connection().await?;
        match pop(conn, urn, timeout).await? {
            Some((_, raw)) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Reply record of a result, for callers that know the operation.
    pub fn reply<R: DeserializeOwned>(result: TaskResult) -> Result<R, TransportError> {
        Ok(serde_json::from_value(result.data)?)
    }
}

impl std::fmt::Debug for TaskProducer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskProducer")
            .field("queue", &self.queue)
            .finish_non_exhaustive()
    }
}
