//! Eduseal Service
//!
//! Puts the sealing and validation core behind one of four transports:
//!
//! - **rpc**: JSON over HTTP, a bounded number of requests at once
//! - **stream**: durable pull-queue on a Redis stream consumer group, with
//!   lease extension and acknowledgement after the reply is published
//! - **partitions**: consume-process-forward over several Redis streams with
//!   committed offsets, ordered within each partition
//! - **tasks**: blocking task queue on a Redis list, results written back
//!   under the task's urn or pushed to a result queue
//!
//! A process runs exactly one transport. Every transport talks to the core
//! only through [`eduseal::DocumentService`].

#![cfg_attr(
    test,
    allow(clippy::unwrap_used, clippy::expect_used, clippy::unwrap_in_result)
)]

pub mod config;
pub mod error;
pub mod handlers;
pub mod queue;
pub mod readiness;
pub mod server;

pub use config::{QueueOperation, Transport};
pub use error::TransportError;
pub use server::shutdown_signal;

use std::future::Future;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use eduseal::{Config, CryptokiDriver, DocumentService, Eduseal, RemoteEngine};
use tracing::info;

use queue::{PartitionConsumer, StreamConsumer, TaskWorker};

/// Bring up the core from `config` and serve it over `transport` until a
/// shutdown signal arrives.
pub async fn run(config: Config, transport: Transport) -> Result<(), TransportError> {
    info!(
        "Starting {} as {:?} over {}",
        config.service_name,
        config.role,
        transport.name()
    );

    let engine = Arc::new(RemoteEngine::new(&config.engine_url));
    let service: Arc<dyn DocumentService> =
        Arc::new(Eduseal::bootstrap(&config, Arc::new(CryptokiDriver), engine)?);

    let result = serve(service, transport, &config.healthcheck_path, shutdown_signal()).await;
    readiness::clear(&config.healthcheck_path);
    result
}

/// Serve an already bootstrapped service. The readiness sentinel is written
/// once the listener is bound or the broker connection is up.
pub async fn serve(
    service: Arc<dyn DocumentService>,
    transport: Transport,
    healthcheck: &Path,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), TransportError> {
    match transport {
        Transport::Rpc(rpc) => {
            let addr = SocketAddr::from(([0, 0, 0, 0], rpc.port));
            let listener = tokio::net::TcpListener::bind(addr).await?;
            readiness::mark_ready(healthcheck)?;
            server::run(listener, service, rpc.max_workers, shutdown).await?;
        }
        Transport::Stream(stream) => {
            let consumer = StreamConsumer::connect(service, stream).await?;
            readiness::mark_ready(healthcheck)?;
            consumer.run(shutdown).await?;
        }
        Transport::Partitions(partitions) => {
            let consumer = PartitionConsumer::connect(service, partitions).await?;
            readiness::mark_ready(healthcheck)?;
            consumer.run(shutdown).await?;
        }
        Transport::Tasks(tasks) => {
            let worker = TaskWorker::connect(service, tasks).await?;
            readiness::mark_ready(healthcheck)?;
            worker.run(shutdown).await?;
        }
    }
    Ok(())
}
