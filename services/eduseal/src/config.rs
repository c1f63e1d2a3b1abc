//! Transport selection and per-transport settings

use std::str::FromStr;
use std::time::Duration;

use crate::error::TransportError;

pub const DEFAULT_PORT: u16 = 80;
pub const DEFAULT_RPC_MAX_WORKERS: usize = 10;
pub const DEFAULT_REDIS_URL: &str = "redis://redis:6379";

pub const DEFAULT_STREAM_INPUT: &str = "eduseal:requests";
pub const DEFAULT_STREAM_OUTPUT: &str = "eduseal:replies";
pub const DEFAULT_STREAM_GROUP: &str = "eduseal";
pub const DEFAULT_STREAM_LEASE_SECS: u64 = 30;
pub const DEFAULT_BLOCK_MS: u64 = 5000;

pub const DEFAULT_PARTITIONS: &str = "eduseal:partition:0";
pub const DEFAULT_PARTITION_OUTPUT: &str = "eduseal:partition-replies";
pub const DEFAULT_PARTITION_OFFSETS: &str = "eduseal:offsets";

pub const DEFAULT_TASK_QUEUE: &str = "eduseal:tasks";
pub const DEFAULT_TASK_RESULT_TTL_SECS: u64 = 3600;

/// Which core a queue consumer drives. A queue carries one kind of request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueOperation {
    Seal,
    Validate,
}

impl FromStr for QueueOperation {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "seal" => Ok(QueueOperation::Seal),
            "validate" => Ok(QueueOperation::Validate),
            other => Err(TransportError::Config(format!(
                "QUEUE_OPERATION must be seal or validate, got {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcConfig {
    pub port: u16,
    /// Upper bound on requests served at once
    pub max_workers: usize,
}

/// Durable pull-queue over a Redis stream consumer group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamConfig {
    pub redis_url: String,
    pub operation: QueueOperation,
    pub input_stream: String,
    pub output_stream: String,
    pub group: String,
    pub consumer: String,
    /// How long a delivered entry may sit idle before another consumer may
    /// claim it. Held entries are refreshed at half this interval.
    pub lease: Duration,
    pub block: Duration,
}

/// Streaming consume-process-forward loop over partition streams.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionConfig {
    pub redis_url: String,
    pub operation: QueueOperation,
    pub partitions: Vec<String>,
    pub output_stream: String,
    /// Hash of committed offsets, one field per partition
    pub offsets_key: String,
    pub block: Duration,
}

/// Blocking task queue over a Redis list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskConfig {
    pub redis_url: String,
    pub operation: QueueOperation,
    pub queue: String,
    /// Names this worker's processing list
    pub worker: String,
    /// When set, results go here instead of back under the task's urn
    pub result_queue: Option<String>,
    pub result_ttl: Duration,
    pub block: Duration,
}

impl TaskConfig {
    /// List holding the tasks this worker has taken but not yet answered
    pub fn processing_queue(&self) -> String {
        format!("{}:processing:{}", self.queue, self.worker)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transport {
    Rpc(RpcConfig),
    Stream(StreamConfig),
    Partitions(PartitionConfig),
    Tasks(TaskConfig),
}

impl Transport {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, TransportError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, TransportError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let or = |name: &str, default: &str| var(name).unwrap_or_else(|| default.to_string());

        let kind = or("TRANSPORT", "rpc").to_ascii_lowercase();
        if kind == "rpc" {
            return Ok(Transport::Rpc(RpcConfig {
                port: parse(&var, "PORT", DEFAULT_PORT)?,
                max_workers: parse(&var, "RPC_MAX_WORKERS", DEFAULT_RPC_MAX_WORKERS)?,
            }));
        }

        let redis_url = or("REDIS_URL", DEFAULT_REDIS_URL);
        let operation: QueueOperation = or("QUEUE_OPERATION", "seal").parse()?;
        let block = Duration::from_millis(parse(&var, "QUEUE_BLOCK_MS", DEFAULT_BLOCK_MS)?);

        match kind.as_str() {
            "stream" => {
                let consumer = var("STREAM_CONSUMER")
                    .or_else(|| var("HOSTNAME"))
                    .unwrap_or_else(|| format!("eduseal-{}", uuid::Uuid::new_v4()));
                let lease_secs: u64 =
                    parse(&var, "STREAM_LEASE_SECS", DEFAULT_STREAM_LEASE_SECS)?;
                if lease_secs == 0 {
                    return Err(TransportError::Config(
                        "STREAM_LEASE_SECS must be at least 1".to_string(),
                    ));
                }
                Ok(Transport::Stream(StreamConfig {
                    redis_url,
                    operation,
                    input_stream: or("STREAM_INPUT", DEFAULT_STREAM_INPUT),
                    output_stream: or("STREAM_OUTPUT", DEFAULT_STREAM_OUTPUT),
                    group: or("STREAM_GROUP", DEFAULT_STREAM_GROUP),
                    consumer,
                    lease: Duration::from_secs(lease_secs),
                    block,
                }))
            }
            "partitions" => {
                let partitions: Vec<String> = or("PARTITIONS", DEFAULT_PARTITIONS)
                    .split(',')
                    .map(|p| p.trim().to_string())
                    .filter(|p| !p.is_empty())
                    .collect();
                if partitions.is_empty() {
                    return Err(TransportError::Config(
                        "PARTITIONS must name at least one stream".to_string(),
                    ));
                }
                Ok(Transport::Partitions(PartitionConfig {
                    redis_url,
                    operation,
                    partitions,
                    output_stream: or("PARTITION_OUTPUT", DEFAULT_PARTITION_OUTPUT),
                    offsets_key: or("PARTITION_OFFSETS_KEY", DEFAULT_PARTITION_OFFSETS),
                    block,
                }))
            }
            "tasks" => Ok(Transport::Tasks(TaskConfig {
                redis_url,
                operation,
                queue: or("TASK_QUEUE", DEFAULT_TASK_QUEUE),
                worker: var("TASK_WORKER")
                    .or_else(|| var("HOSTNAME"))
                    .unwrap_or_else(|| format!("eduseal-{}", uuid::Uuid::new_v4())),
                result_queue: var("TASK_RESULT_QUEUE"),
                result_ttl: Duration::from_secs(parse(
                    &var,
                    "TASK_RESULT_TTL_SECS",
                    DEFAULT_TASK_RESULT_TTL_SECS,
                )?),
                block,
            })),
            other => Err(TransportError::Config(format!(
                "TRANSPORT must be one of rpc, stream, partitions, tasks, got {}",
                other
            ))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Transport::Rpc(_) => "rpc",
            Transport::Stream(_) => "stream",
            Transport::Partitions(_) => "partitions",
            Transport::Tasks(_) => "tasks",
        }
    }
}

fn parse<F, T>(var: &F, name: &str, default: T) -> Result<T, TransportError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match var(name) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|e| TransportError::Config(format!("{} must be a valid number: {}", name, e))),
        None => Ok(default),
    }
}
