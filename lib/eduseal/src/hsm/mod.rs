//! HSM access
//!
//! The PKCS#11 module is reached through [`Pkcs11Driver`], which opens a
//! [`TokenSession`] on the configured token. [`SessionManager`] owns the one
//! authenticated session of the process and hands it out as an
//! [`HsmSession`], which serializes every token operation behind a mutex.

mod pkcs11;
mod session;

pub use pkcs11::CryptokiDriver;
pub use session::{HsmSession, SessionManager};

use thiserror::Error;

use crate::config::HsmConfig;

#[derive(Error, Debug)]
pub enum HsmError {
    #[error("PKCS#11 error: {0}")]
    Pkcs11(#[from] cryptoki::error::Error),
    #[error("No slot available")]
    NoSlotAvailable,
    #[error("Token not found: {0}")]
    TokenNotFound(String),
    #[error("User already logged in")]
    AlreadyLoggedIn,
    #[error("Key not found: {0}")]
    KeyNotFound(String),
    #[error("Certificate not found: {0}")]
    CertificateNotFound(String),
    #[error("Invalid certificate: {0}")]
    InvalidCertificate(String),
    #[error("Unsupported key: {0}")]
    UnsupportedKey(String),
    #[error("Signing failed: {0}")]
    SigningFailed(String),
    #[error("Internal error: {0}")]
    InternalError(String),
}

/// Entry point into a PKCS#11 module.
pub trait Pkcs11Driver: Send + Sync {
    /// Load the module, select the configured token and open a read-write
    /// session on it. Authentication is a separate step.
    fn open_session(&self, config: &HsmConfig) -> Result<Box<dyn TokenSession>, HsmError>;
}

/// An open session on a token.
///
/// Implementations need not be thread safe; [`HsmSession`] guarantees a
/// single caller at a time.
pub trait TokenSession: Send {
    /// Authenticate as the normal user. A token that reports the user as
    /// already authenticated returns [`HsmError::AlreadyLoggedIn`].
    fn login(&self, pin: &str) -> Result<(), HsmError>;

    /// Fails with [`HsmError::KeyNotFound`] unless a private key carries the label
    fn find_private_key(&self, label: &str) -> Result<(), HsmError>;

    /// DER encoding of the certificate object carrying the label
    fn certificate(&self, label: &str) -> Result<Vec<u8>, HsmError>;

    /// Raw RSA private-key operation (`CKM_RSA_X_509`) over a block the
    /// caller has already padded to the modulus length.
    fn sign_raw(&self, key_label: &str, block: &[u8]) -> Result<Vec<u8>, HsmError>;
}
