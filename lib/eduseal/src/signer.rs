//! HSM-backed digest signer
//!
//! The token performs a raw RSA operation only. EMSA-PKCS1-v1_5 encoding of
//! the SHA-256 digest happens here, so the padding is applied exactly once no
//! matter what the module would otherwise add.

use std::sync::Arc;

use async_trait::async_trait;
use x509_parser::prelude::*;
use x509_parser::public_key::PublicKey;

use crate::hsm::{HsmError, HsmSession};

/// DER prefix of a SHA-256 DigestInfo (RFC 8017 section 9.2, note 1)
const SHA256_DIGEST_INFO_PREFIX: [u8; 19] = [
    0x30, 0x31, 0x30, 0x0d, 0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x01, 0x05,
    0x00, 0x04, 0x20,
];

pub const SHA256_DIGEST_LEN: usize = 32;

/// What the PDF engine needs from a signer.
#[async_trait]
pub trait DigestSigner: Send + Sync {
    /// DER encoded signing certificate
    fn certificate(&self) -> &[u8];

    /// RSA PKCS#1 v1.5 signature over a SHA-256 digest
    async fn sign_digest(&self, digest: &[u8]) -> Result<Vec<u8>, HsmError>;
}

/// EMSA-PKCS1-v1_5 encoding of a SHA-256 digest for a modulus of
/// `modulus_len` bytes: `00 01 FF.. 00 DigestInfo`.
pub fn emsa_pkcs1_v15_sha256(digest: &[u8], modulus_len: usize) -> Result<Vec<u8>, HsmError> {
    if digest.len() != SHA256_DIGEST_LEN {
        return Err(HsmError::SigningFailed(format!(
            "expected a {}-byte SHA-256 digest, got {} bytes",
            SHA256_DIGEST_LEN,
            digest.len()
        )));
    }

    let t_len = SHA256_DIGEST_INFO_PREFIX.len() + digest.len();
    if modulus_len < t_len + 11 {
        return Err(HsmError::UnsupportedKey(format!(
            "modulus of {} bytes is too short for PKCS#1 v1.5",
            modulus_len
        )));
    }

    let mut block = Vec::with_capacity(modulus_len);
    block.extend_from_slice(&[0x00, 0x01]);
    block.resize(modulus_len - t_len - 1, 0xff);
    block.push(0x00);
    block.extend_from_slice(&SHA256_DIGEST_INFO_PREFIX);
    block.extend_from_slice(digest);
    Ok(block)
}

/// Modulus length in bytes of the RSA key certified by `certificate`.
pub fn rsa_modulus_len(certificate: &[u8]) -> Result<usize, HsmError> {
    let (_, cert) = X509Certificate::from_der(certificate)
        .map_err(|e| HsmError::InvalidCertificate(e.to_string()))?;

    match cert.public_key().parsed() {
        Ok(PublicKey::RSA(rsa)) => {
            let significant = rsa.modulus.iter().skip_while(|b| **b == 0).count();
            if significant == 0 {
                return Err(HsmError::InvalidCertificate("empty RSA modulus".into()));
            }
            Ok(significant)
        }
        Ok(_) => Err(HsmError::UnsupportedKey(
            "raw signing mechanism requires an RSA key".into(),
        )),
        Err(e) => Err(HsmError::InvalidCertificate(e.to_string())),
    }
}

/// Signer bound to the shared session and a key/certificate pair on the token.
pub struct HsmSigner {
    session: Arc<HsmSession>,
    key_label: String,
    certificate: Vec<u8>,
    modulus_len: usize,
}

impl std::fmt::Debug for HsmSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HsmSigner")
            .field("key_label", &self.key_label)
            .field("modulus_len", &self.modulus_len)
            .finish_non_exhaustive()
    }
}

impl HsmSigner {
    /// Look up the private key and certificate by label.
    ///
    /// Blocks on the session lock; call from a blocking context.
    pub fn new(
        session: Arc<HsmSession>,
        key_label: &str,
        cert_label: &str,
    ) -> Result<Self, HsmError> {
        session.find_private_key(key_label)?;
        let certificate = session.certificate(cert_label)?;
        let modulus_len = rsa_modulus_len(&certificate)?;

        Ok(Self {
            session,
            key_label: key_label.to_string(),
            certificate,
            modulus_len,
        })
    }
}

#[async_trait]
impl DigestSigner for HsmSigner {
    fn certificate(&self) -> &[u8] {
        &self.certificate
    }

    async fn sign_digest(&self, digest: &[u8]) -> Result<Vec<u8>, HsmError> {
        let block = emsa_pkcs1_v15_sha256(digest, self.modulus_len)?;
        let session = self.session.clone();
        let key_label = self.key_label.clone();

        tokio::task::spawn_blocking(move || session.sign_raw(&key_label, &block))
            .await
            .map_err(|e| HsmError::InternalError(format!("signing task failed: {}", e)))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{self, FakeDriver};

    #[test]
    fn test_emsa_block_layout() {
        let digest = [0xab; 32];
        let block = emsa_pkcs1_v15_sha256(&digest, 256).unwrap();

        assert_eq!(block.len(), 256);
        assert_eq!(&block[..2], &[0x00, 0x01]);
        let separator = 256 - 32 - SHA256_DIGEST_INFO_PREFIX.len() - 1;
        assert!(block[2..separator].iter().all(|b| *b == 0xff));
        assert_eq!(block[separator], 0x00);
        assert_eq!(&block[256 - 32..], &digest);
    }

    #[test]
    fn test_emsa_rejects_wrong_digest_length() {
        assert!(emsa_pkcs1_v15_sha256(&[0u8; 20], 256).is_err());
    }

    #[test]
    fn test_emsa_rejects_tiny_modulus() {
        assert!(matches!(
            emsa_pkcs1_v15_sha256(&[0u8; 32], 61),
            Err(HsmError::UnsupportedKey(_))
        ));
        assert!(emsa_pkcs1_v15_sha256(&[0u8; 32], 62).is_ok());
    }

    #[test]
    fn test_modulus_len_of_rsa_2048_certificate() {
        assert_eq!(rsa_modulus_len(&testing::signer_certificate()).unwrap(), 256);
    }

    #[test]
    fn test_ec_certificate_is_unsupported() {
        let der = testing::fixture_der("ec_signer.crt");
        assert!(matches!(
            rsa_modulus_len(&der),
            Err(HsmError::UnsupportedKey(_))
        ));
    }

    #[test]
    fn test_garbage_certificate_is_invalid() {
        assert!(matches!(
            rsa_modulus_len(b"not a certificate"),
            Err(HsmError::InvalidCertificate(_))
        ));
    }

    #[test]
    fn test_construction_fails_for_unknown_key() {
        let session = FakeDriver::with_fixture_signer().open_test_session();
        let err = HsmSigner::new(session, "missing", testing::SIGNER_LABEL).unwrap_err();
        assert!(matches!(err, HsmError::KeyNotFound(_)));
    }

    #[tokio::test]
    async fn test_sign_digest_pads_before_raw_operation() {
        let session = FakeDriver::with_fixture_signer().open_test_session();
        let signer =
            HsmSigner::new(session, testing::SIGNER_LABEL, testing::SIGNER_LABEL).unwrap();
        let digest = [7u8; 32];

        let signature = signer.sign_digest(&digest).await.unwrap();

        let block = emsa_pkcs1_v15_sha256(&digest, 256).unwrap();
        assert_eq!(
            signature,
            testing::fake_raw_signature(signer.certificate(), &block)
        );
    }
}
