//! PDF-signing engine interface
//!
//! Incremental updates, byte-range digests, CMS construction and chain
//! building belong to the engine. The cores only drive it through these
//! traits: open a document, set its keywords, sign it with a
//! [`DigestSigner`], or read back its signatures and validate one.

mod remote;

pub use remote::RemoteEngine;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::SignatureMetadataConfig;
use crate::signer::DigestSigner;
use crate::trust_roots::TrustRootSet;

/// Name of the signature field every seal fills
pub const SIGNATURE_FIELD_NAME: &str = "Signature1";

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Parse error: {0}")]
    Parse(String),
    /// The document is encrypted and cannot be opened for writing
    #[error("Key not available: {0}")]
    KeyNotAvailable(String),
    #[error("Signing error: {0}")]
    Signing(String),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Metadata error: {0}")]
    Metadata(String),
    #[error("Engine unavailable: {0}")]
    Transport(String),
}

/// Signature dictionary `/SubFilter`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubFilter {
    /// Detached CMS; the most widely accepted by external verifiers
    #[serde(rename = "adbe.pkcs7.detached")]
    AdbePkcs7Detached,
}

/// Placement and descriptive fields of a new signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignatureMetadata {
    pub field_name: String,
    pub location: String,
    pub reason: String,
    pub name: String,
    pub contact_info: String,
    pub sub_filter: SubFilter,
}

impl SignatureMetadata {
    pub fn from_config(config: &SignatureMetadataConfig) -> Self {
        Self {
            field_name: SIGNATURE_FIELD_NAME.to_string(),
            location: config.location.clone(),
            reason: config.reason.clone(),
            name: config.name.clone(),
            contact_info: config.contact_info.clone(),
            sub_filter: SubFilter::AdbePkcs7Detached,
        }
    }
}

/// Outcome of validating one embedded signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureStatus {
    /// The digest over the signed byte range matches
    pub intact: bool,
    /// The certificate chains to a trust root and the signature verifies
    pub valid: bool,
}

#[async_trait]
pub trait PdfEngine: Send + Sync {
    /// Open a document for an incremental-update signing pass.
    async fn open_incremental(
        &self,
        document: Vec<u8>,
    ) -> Result<Box<dyn IncrementalDocument>, EngineError>;

    /// Open a document for reading its signatures and metadata.
    async fn open_reader(&self, document: Vec<u8>) -> Result<Box<dyn DocumentReader>, EngineError>;
}

#[async_trait]
pub trait IncrementalDocument: Send {
    /// Replace the document keyword list in the revision about to be written.
    fn set_keywords(&mut self, keywords: Vec<String>);

    /// Append a signed revision. Existing bytes, revisions and signatures are
    /// left untouched. Fails with [`EngineError::KeyNotAvailable`] for
    /// encrypted input.
    async fn sign(
        self: Box<Self>,
        metadata: &SignatureMetadata,
        signer: Arc<dyn DigestSigner>,
    ) -> Result<Vec<u8>, EngineError>;
}

#[async_trait]
pub trait DocumentReader: Send + Sync {
    /// Number of embedded signatures, in document order
    fn signature_count(&self) -> usize;

    /// Keyword list from the document metadata
    fn keywords(&self) -> Result<Vec<String>, EngineError>;

    async fn validate_signature(
        &self,
        index: usize,
        trust_roots: &TrustRootSet,
    ) -> Result<SignatureStatus, EngineError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_from_config_uses_fixed_field_and_subfilter() {
        let config = SignatureMetadataConfig {
            location: "Stockholm".to_string(),
            reason: "Sealed".to_string(),
            name: "Eduseal".to_string(),
            contact_info: "ops@example.org".to_string(),
        };

        let metadata = SignatureMetadata::from_config(&config);

        assert_eq!(metadata.field_name, "Signature1");
        assert_eq!(metadata.sub_filter, SubFilter::AdbePkcs7Detached);
        assert_eq!(metadata.location, "Stockholm");
    }

    #[test]
    fn test_subfilter_wire_name() {
        let json = serde_json::to_string(&SubFilter::AdbePkcs7Detached).unwrap();
        assert_eq!(json, "\"adbe.pkcs7.detached\"");
    }
}
