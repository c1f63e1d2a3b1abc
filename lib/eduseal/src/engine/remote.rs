//! HTTP client for an out-of-process PDF engine
//!
//! The engine never sees key material. Signing is split in two calls:
//! `prepare` returns the digest of the signed attributes together with an
//! opaque context, the HSM signs that digest, and `finish` embeds the
//! signature and returns the new revision.

use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{
    DocumentReader, EngineError, IncrementalDocument, PdfEngine, SignatureMetadata,
    SignatureStatus,
};
use crate::signer::DigestSigner;
use crate::trust_roots::TrustRootSet;

// ==================== Engine API Types ====================

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct InspectRequest {
    pub pdf: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct InspectResponse {
    pub signatures: usize,
    #[serde(default)]
    pub keywords: Vec<String>,
    /// Set when the metadata dictionary exists but cannot be read
    #[serde(default)]
    pub metadata_error: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct PrepareRequest {
    pub pdf: String,
    pub keywords: Option<Vec<String>>,
    pub metadata: SignatureMetadata,
    /// Base64 DER signing certificate
    pub certificate: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct PrepareResponse {
    pub context: String,
    /// Base64 SHA-256 digest to sign
    pub digest: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct FinishRequest {
    pub context: String,
    pub signature: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct FinishResponse {
    pub pdf: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ValidateSignatureRequest {
    pub pdf: String,
    pub index: usize,
    /// Base64 DER trust anchors
    pub trust_roots: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ErrorResponse {
    pub error: String,
    #[serde(default)]
    pub kind: Option<String>,
}

fn classify(error: ErrorResponse, fallback: fn(String) -> EngineError) -> EngineError {
    match error.kind.as_deref() {
        Some("parse") => EngineError::Parse(error.error),
        Some("key_not_available") => EngineError::KeyNotAvailable(error.error),
        Some("metadata") => EngineError::Metadata(error.error),
        Some("signing") => EngineError::Signing(error.error),
        Some("validation") => EngineError::Validation(error.error),
        _ => fallback(error.error),
    }
}

// ==================== Engine Client ====================

/// HTTP client for the PDF engine service.
#[derive(Clone)]
pub struct RemoteEngine {
    client: Client,
    base_url: String,
}

impl RemoteEngine {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    async fn post<Req, Resp>(
        &self,
        path: &str,
        body: &Req,
        fallback: fn(String) -> EngineError,
    ) -> Result<Resp, EngineError>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let url = format!("{}{}", self.base_url, path);

        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| EngineError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let error = response
                .json::<ErrorResponse>()
                .await
                .unwrap_or_else(|_| ErrorResponse {
                    error: format!("engine returned {}", status),
                    kind: None,
                });
            return Err(classify(error, fallback));
        }

        response
            .json()
            .await
            .map_err(|e| EngineError::Transport(format!("invalid engine response: {}", e)))
    }

    async fn inspect(&self, pdf: &str) -> Result<InspectResponse, EngineError> {
        let request = InspectRequest {
            pdf: pdf.to_string(),
        };
        self.post("/v1/inspect", &request, EngineError::Parse).await
    }
}

#[async_trait]
impl PdfEngine for RemoteEngine {
    async fn open_incremental(
        &self,
        document: Vec<u8>,
    ) -> Result<Box<dyn IncrementalDocument>, EngineError> {
        let pdf = BASE64.encode(&document);
        let inspection = self.inspect(&pdf).await?;
        debug!(
            "Opened document for update with {} existing signatures",
            inspection.signatures
        );

        Ok(Box::new(RemoteDocument {
            engine: self.clone(),
            pdf,
            keywords: None,
        }))
    }

    async fn open_reader(&self, document: Vec<u8>) -> Result<Box<dyn DocumentReader>, EngineError> {
        let pdf = BASE64.encode(&document);
        let inspection = self.inspect(&pdf).await?;

        Ok(Box::new(RemoteReader {
            engine: self.clone(),
            pdf,
            inspection,
        }))
    }
}

struct RemoteDocument {
    engine: RemoteEngine,
    pdf: String,
    keywords: Option<Vec<String>>,
}

#[async_trait]
impl IncrementalDocument for RemoteDocument {
    fn set_keywords(&mut self, keywords: Vec<String>) {
        self.keywords = Some(keywords);
    }

    async fn sign(
        self: Box<Self>,
        metadata: &SignatureMetadata,
        signer: Arc<dyn DigestSigner>,
    ) -> Result<Vec<u8>, EngineError> {
        let prepare = PrepareRequest {
            pdf: self.pdf,
            keywords: self.keywords,
            metadata: metadata.clone(),
            certificate: BASE64.encode(signer.certificate()),
        };
        let prepared: PrepareResponse = self
            .engine
            .post("/v1/prepare", &prepare, EngineError::Signing)
            .await?;

        let digest = BASE64
            .decode(&prepared.digest)
            .map_err(|e| EngineError::Signing(format!("invalid digest from engine: {}", e)))?;

        let signature = signer
            .sign_digest(&digest)
            .await
            .map_err(|e| EngineError::Signing(e.to_string()))?;

        let finish = FinishRequest {
            context: prepared.context,
            signature: BASE64.encode(signature),
        };
        let finished: FinishResponse = self
            .engine
            .post("/v1/finish", &finish, EngineError::Signing)
            .await?;

        BASE64
            .decode(&finished.pdf)
            .map_err(|e| EngineError::Signing(format!("invalid document from engine: {}", e)))
    }
}

struct RemoteReader {
    engine: RemoteEngine,
    pdf: String,
    inspection: InspectResponse,
}

#[async_trait]
impl DocumentReader for RemoteReader {
    fn signature_count(&self) -> usize {
        self.inspection.signatures
    }

    fn keywords(&self) -> Result<Vec<String>, EngineError> {
        match &self.inspection.metadata_error {
            Some(error) => Err(EngineError::Metadata(error.clone())),
            None => Ok(self.inspection.keywords.clone()),
        }
    }

    async fn validate_signature(
        &self,
        index: usize,
        trust_roots: &TrustRootSet,
    ) -> Result<SignatureStatus, EngineError> {
        let request = ValidateSignatureRequest {
            pdf: self.pdf.clone(),
            index,
            trust_roots: trust_roots.iter().map(|r| BASE64.encode(r.der())).collect(),
        };
        self.engine
            .post("/v1/validate", &request, EngineError::Validation)
            .await
    }
}
