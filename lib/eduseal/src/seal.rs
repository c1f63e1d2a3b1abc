//! Seal transactions

use std::sync::Arc;

use tracing::{debug, error, info};

use crate::config::HsmConfig;
use crate::engine::{EngineError, PdfEngine, SignatureMetadata};
use crate::error::RequestError;
use crate::hsm::{HsmError, HsmSession};
use crate::signer::{DigestSigner, HsmSigner};
use crate::transaction;
use crate::types::{SealReply, SealRequest, decode_document, encode_document};

/// Token objects used for sealing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigningLabels {
    pub key_label: String,
    pub cert_label: String,
}

impl From<&HsmConfig> for SigningLabels {
    fn from(config: &HsmConfig) -> Self {
        Self {
            key_label: config.key_label.clone(),
            cert_label: config.cert_label.clone(),
        }
    }
}

/// Orchestrates one signing transaction per call.
///
/// Holds only shared, read-only state; a failing transaction leaves nothing
/// behind for the next one.
pub struct SealCore {
    engine: Arc<dyn PdfEngine>,
    session: Arc<HsmSession>,
    labels: SigningLabels,
    metadata: SignatureMetadata,
    backend: String,
}

impl SealCore {
    pub fn new(
        engine: Arc<dyn PdfEngine>,
        session: Arc<HsmSession>,
        labels: SigningLabels,
        metadata: SignatureMetadata,
        backend: &str,
    ) -> Self {
        Self {
            engine,
            session,
            labels,
            metadata,
            backend: backend.to_string(),
        }
    }

    /// Seal a document. Every outcome, failure included, is a reply.
    pub async fn seal(&self, request: SealRequest) -> SealReply {
        debug!("start sealing");
        debug!("transaction_id: {}", request.transaction_id);

        match self.try_seal(&request).await {
            Ok(signed) => {
                info!("signing done, transaction_id: {}", request.transaction_id);
                SealReply::sealed(request.transaction_id, encode_document(&signed), &self.backend)
            }
            Err(e) => {
                match &e {
                    RequestError::EncryptedDocument(_)
                    | RequestError::SigningFailed(_)
                    | RequestError::EngineUnavailable(_) => {
                        error!("transaction_id: {}, error: {}", request.transaction_id, e)
                    }
                    _ => debug!("transaction_id: {}, error: {}", request.transaction_id, e),
                }
                SealReply::failed(request.transaction_id, e.to_string(), &self.backend)
            }
        }
    }

    async fn try_seal(&self, request: &SealRequest) -> Result<Vec<u8>, RequestError> {
        if request.transaction_id.trim().is_empty() {
            return Err(RequestError::MissingTransactionId);
        }

        let bytes = decode_document(&request.data)?;

        let mut document = self
            .engine
            .open_incremental(bytes)
            .await
            .map_err(|e| RequestError::from_engine(e, RequestError::DocumentParse))?;

        document.set_keywords(vec![transaction::keyword(&request.transaction_id)]);
        debug!("add meta data to pdf");

        let signer = self.signer().await.map_err(RequestError::SignerConstruction)?;
        debug!("pkcs11 signer created");

        document
            .sign(&self.metadata, signer)
            .await
            .map_err(|e| match e {
                EngineError::KeyNotAvailable(msg) => RequestError::EncryptedDocument(msg),
                other => RequestError::from_engine(other, RequestError::SigningFailed),
            })
    }

    async fn signer(&self) -> Result<Arc<dyn DigestSigner>, HsmError> {
        let session = self.session.clone();
        let labels = self.labels.clone();

        let signer = tokio::task::spawn_blocking(move || {
            HsmSigner::new(session, &labels.key_label, &labels.cert_label)
        })
        .await
        .map_err(|e| HsmError::InternalError(format!("signer task failed: {}", e)))??;

        Ok(Arc::new(signer))
    }
}
