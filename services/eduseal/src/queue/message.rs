//! Queue message bodies
//!
//! Stream entries carry two fields: `delivery_id`, copied unchanged from
//! inbound to outbound entry for downstream deduplication, and `body`, the
//! JSON request or reply. Tasks on the blocking queue are JSON documents
//! holding the request under `data` and the result address under `urn`.

use eduseal::{DocumentService, SealReply, SealRequest, ValidateReply, ValidateRequest};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::config::QueueOperation;
use crate::error::TransportError;

pub const DELIVERY_ID_FIELD: &str = "delivery_id";
pub const BODY_FIELD: &str = "body";

/// Reply of whichever operation the queue carries. Serialized as the bare
/// reply record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum QueueReply {
    Seal(SealReply),
    Validate(ValidateReply),
}

impl QueueReply {
    pub fn error(&self) -> &str {
        match self {
            QueueReply::Seal(reply) => &reply.error,
            QueueReply::Validate(reply) => &reply.error,
        }
    }
}

/// A unit of work on the blocking task queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub urn: String,
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery_id: Option<String>,
}

/// What a task worker writes back. `data` is the reply record of the
/// queue's operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub urn: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery_id: Option<String>,
    pub data: Value,
}

/// Run one request through the service. A request that does not decode is
/// answered with an error reply like any other failed transaction.
pub async fn dispatch(
    service: &dyn DocumentService,
    operation: QueueOperation,
    request: Value,
) -> QueueReply {
    match operation {
        QueueOperation::Seal => match serde_json::from_value::<SealRequest>(request) {
            Ok(request) => QueueReply::Seal(service.seal(request).await),
            Err(e) => {
                warn!("Undecodable seal request: {}", e);
                QueueReply::Seal(SealReply::failed(
                    String::new(),
                    format!("invalid request: {}", e),
                    service.backend(),
                ))
            }
        },
        QueueOperation::Validate => match serde_json::from_value::<ValidateRequest>(request) {
            Ok(request) => QueueReply::Validate(service.validate(request).await),
            Err(e) => {
                warn!("Undecodable validate request: {}", e);
                QueueReply::Validate(ValidateReply::failed(
                    format!("invalid request: {}", e),
                    service.backend(),
                ))
            }
        },
    }
}

/// [`dispatch`] for a stream entry body, returning the serialized reply.
pub async fn dispatch_body(
    service: &dyn DocumentService,
    operation: QueueOperation,
    body: &str,
) -> Result<String, TransportError> {
    let request = serde_json::from_str(body).unwrap_or(Value::Null);
    let reply = dispatch(service, operation, request).await;
    Ok(serde_json::to_string(&reply)?)
}
