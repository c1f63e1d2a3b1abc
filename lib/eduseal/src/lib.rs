//! Eduseal PDF sealing core
//!
//! Seals PDF documents with a key held in a PKCS#11 token and validates
//! sealed documents against a directory of trust roots. Transports live in
//! the service crate; everything here is transport agnostic.

#![cfg_attr(
    test,
    allow(clippy::unwrap_used, clippy::expect_used, clippy::unwrap_in_result)
)]

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub mod config;
pub mod engine;
pub mod error;
pub mod hsm;
pub mod seal;
pub mod service;
pub mod signer;
pub mod transaction;
pub mod trust_roots;
pub mod types;
pub mod validate;

pub use config::{Config, HsmConfig, Role, SignatureMetadataConfig};
pub use engine::{PdfEngine, RemoteEngine, SignatureMetadata, SignatureStatus};
pub use error::{RequestError, ServiceError};
pub use hsm::{CryptokiDriver, HsmError, HsmSession, Pkcs11Driver, SessionManager};
pub use seal::{SealCore, SigningLabels};
pub use service::{DocumentService, Eduseal};
pub use signer::{DigestSigner, HsmSigner};
pub use trust_roots::{TrustRoot, TrustRootBuilder, TrustRootSet};
pub use types::{
    SealReply, SealRequest, ValidateReply, ValidateRequest, decode_document, encode_document,
};
pub use validate::ValidateCore;
