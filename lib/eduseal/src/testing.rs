//! In-memory doubles for the HSM and the PDF engine
//!
//! [`FakeDriver`] stands in for a PKCS#11 module holding one RSA key and its
//! certificate. Its "raw signature" is a SHA-256 over certificate and padded
//! block, which is enough to check that the padded block reached the token
//! unchanged.
//!
//! [`FakeEngine`] understands a line-oriented toy document: a `%PDF-` header,
//! `%Keywords: <json>` lines (the last one wins) and one `%Sig: <json>` line
//! per signature, each followed by `%%EOF`. Every signature covers all bytes
//! before its own line.
//!
//! [`SlowService`] replaces the whole document service where only timing
//! and concurrency matter.
#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use x509_parser::prelude::*;

use crate::config::{HsmConfig, SignatureMetadataConfig};
use crate::engine::{
    DocumentReader, EngineError, IncrementalDocument, PdfEngine, SignatureMetadata,
    SignatureStatus, SubFilter,
};
use crate::hsm::{HsmError, HsmSession, Pkcs11Driver, SessionManager, TokenSession};
use crate::seal::SigningLabels;
use crate::service::DocumentService;
use crate::signer::{DigestSigner, HsmSigner, emsa_pkcs1_v15_sha256, rsa_modulus_len};
use crate::transaction;
use crate::trust_roots::{TrustRootSet, parse_certificate_file};
use crate::types::{SealReply, SealRequest, ValidateReply, ValidateRequest};

pub const SIGNER_LABEL: &str = "eduseal-sealer";
pub const TEST_PIN: &str = "1234";

const PDF_HEADER: &[u8] = b"%PDF-";
const KEYWORDS_PREFIX: &[u8] = b"%Keywords: ";
const SIGNATURE_PREFIX: &[u8] = b"%Sig: ";
const ENCRYPT_MARKER: &[u8] = b"/Encrypt";
const DAMAGED_MARKER: &[u8] = b"/DamagedXref";
const TAMPER_TARGET: &[u8] = b"(Hello)";

// ==================== Fixtures ====================

pub fn fixture_path(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name)
}

/// First certificate of a fixture file, as DER
pub fn fixture_der(name: &str) -> Vec<u8> {
    let bytes = std::fs::read(fixture_path(name)).expect("fixture readable");
    parse_certificate_file(&bytes)
        .expect("fixture parses")
        .remove(0)
}

pub fn signer_certificate() -> Vec<u8> {
    fixture_der("signer.crt")
}

/// Temporary directory holding copies of the named fixtures.
pub fn trust_root_dir(fixtures: &[&str]) -> tempfile::TempDir {
    let dir = tempfile::tempdir().expect("tempdir");
    for name in fixtures {
        std::fs::copy(fixture_path(name), dir.path().join(name)).expect("copy fixture");
    }
    dir
}

pub fn test_hsm_config() -> HsmConfig {
    HsmConfig {
        module: PathBuf::from("/usr/lib/softhsm/libsofthsm2.so"),
        slot: Some(0),
        token_label: Some("eduseal".to_string()),
        pin: TEST_PIN.to_string(),
        key_label: SIGNER_LABEL.to_string(),
        cert_label: SIGNER_LABEL.to_string(),
    }
}

pub fn signing_labels() -> SigningLabels {
    SigningLabels::from(&test_hsm_config())
}

pub fn signature_metadata() -> SignatureMetadata {
    SignatureMetadata::from_config(&SignatureMetadataConfig {
        location: "Test Lab".to_string(),
        reason: "Sealed for testing".to_string(),
        name: "Eduseal".to_string(),
        contact_info: "test@example.org".to_string(),
    })
}

pub fn minimal_pdf() -> Vec<u8> {
    b"%PDF-1.7\n1 0 obj << /Type /Catalog >> endobj\n2 0 obj (Hello) endobj\n%%EOF\n".to_vec()
}

pub fn pdf_with_keywords(keywords: &[&str]) -> Vec<u8> {
    let mut pdf = minimal_pdf();
    append_keywords(&mut pdf, keywords);
    pdf
}

pub fn encrypted_pdf() -> Vec<u8> {
    b"%PDF-1.7\n1 0 obj << /Type /Catalog >> endobj\n<< /Encrypt 3 0 R >>\n%%EOF\n".to_vec()
}

/// Opens fine but cannot be signed
pub fn unsignable_pdf() -> Vec<u8> {
    b"%PDF-1.7\n1 0 obj << /Type /Catalog >> endobj\n/DamagedXref\n%%EOF\n".to_vec()
}

/// Flip one byte inside the original body of a document built from
/// [`minimal_pdf`], invalidating every signature over it.
pub fn tamper(document: &mut [u8]) {
    let at = document
        .windows(TAMPER_TARGET.len())
        .position(|w| w == TAMPER_TARGET)
        .expect("document has a tamper target");
    document[at + 1] = b'J';
}

pub async fn sign_with_fixture(pdf: &[u8], transaction_id: &str) -> Vec<u8> {
    sign_with(FakeDriver::with_fixture_signer(), pdf, Some(transaction_id)).await
}

pub async fn sign_without_keywords(pdf: &[u8]) -> Vec<u8> {
    sign_with(FakeDriver::with_fixture_signer(), pdf, None).await
}

/// Signed by a self-signed certificate no trust root vouches for
pub async fn sign_with_rogue(pdf: &[u8], transaction_id: &str) -> Vec<u8> {
    sign_with(FakeDriver::with_rogue_signer(), pdf, Some(transaction_id)).await
}

async fn sign_with(driver: FakeDriver, pdf: &[u8], transaction_id: Option<&str>) -> Vec<u8> {
    let signer = HsmSigner::new(driver.open_test_session(), SIGNER_LABEL, SIGNER_LABEL)
        .expect("fixture signer");
    let mut document = FakeEngine::new()
        .open_incremental(pdf.to_vec())
        .await
        .expect("document opens");
    if let Some(id) = transaction_id {
        document.set_keywords(vec![transaction::keyword(id)]);
    }
    document
        .sign(&signature_metadata(), Arc::new(signer))
        .await
        .expect("document signs")
}

// ==================== HSM ====================

/// Stand-in for the raw RSA private-key operation
pub fn fake_raw_signature(certificate: &[u8], block: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(certificate);
    hasher.update(block);
    hasher.finalize().to_vec()
}

/// Token state shared by every session a [`FakeDriver`] opens.
#[derive(Debug, Default)]
pub struct FakeTokenState {
    logged_in: AtomicBool,
    sessions_opened: AtomicUsize,
    logins: AtomicUsize,
    signatures: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    sign_delay_ms: AtomicU64,
    fail_next_open: Mutex<Option<String>>,
}

impl FakeTokenState {
    pub fn sessions_opened(&self) -> usize {
        self.sessions_opened.load(Ordering::SeqCst)
    }

    pub fn logins(&self) -> usize {
        self.logins.load(Ordering::SeqCst)
    }

    pub fn signatures(&self) -> usize {
        self.signatures.load(Ordering::SeqCst)
    }

    /// Highest number of raw signing operations ever observed at once
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Behave as if another process already authenticated the user
    pub fn mark_logged_in(&self) {
        self.logged_in.store(true, Ordering::SeqCst);
    }

    pub fn fail_next_open(&self, reason: &str) {
        *self.fail_next_open.lock().unwrap() = Some(reason.to_string());
    }

    pub fn set_sign_delay(&self, delay: Duration) {
        self.sign_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }
}

/// PKCS#11 module double holding one key/certificate pair.
#[derive(Debug, Clone)]
pub struct FakeDriver {
    state: Arc<FakeTokenState>,
    objects: Arc<HashMap<String, Vec<u8>>>,
}

impl FakeDriver {
    pub fn with_certificate(label: &str, certificate: Vec<u8>) -> Self {
        Self {
            state: Arc::new(FakeTokenState::default()),
            objects: Arc::new(HashMap::from([(label.to_string(), certificate)])),
        }
    }

    /// Key and certificate under [`SIGNER_LABEL`], issued by the test root CA
    pub fn with_fixture_signer() -> Self {
        Self::with_certificate(SIGNER_LABEL, signer_certificate())
    }

    pub fn with_rogue_signer() -> Self {
        Self::with_certificate(SIGNER_LABEL, fixture_der("rogue_signer.crt"))
    }

    pub fn state(&self) -> Arc<FakeTokenState> {
        self.state.clone()
    }

    /// Authenticated session on this driver using [`test_hsm_config`]
    pub fn open_test_session(self) -> Arc<HsmSession> {
        SessionManager::new(Arc::new(self), test_hsm_config())
            .open()
            .expect("fake session opens")
    }
}

impl Pkcs11Driver for FakeDriver {
    fn open_session(&self, _config: &HsmConfig) -> Result<Box<dyn TokenSession>, HsmError> {
        if let Some(reason) = self.state.fail_next_open.lock().unwrap().take() {
            return Err(HsmError::TokenNotFound(reason));
        }
        self.state.sessions_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeToken {
            state: self.state.clone(),
            objects: self.objects.clone(),
        }))
    }
}

struct FakeToken {
    state: Arc<FakeTokenState>,
    objects: Arc<HashMap<String, Vec<u8>>>,
}

impl TokenSession for FakeToken {
    fn login(&self, pin: &str) -> Result<(), HsmError> {
        if self.state.logged_in.load(Ordering::SeqCst) {
            return Err(HsmError::AlreadyLoggedIn);
        }
        if pin != TEST_PIN {
            return Err(HsmError::InternalError("CKR_PIN_INCORRECT".to_string()));
        }
        self.state.logged_in.store(true, Ordering::SeqCst);
        self.state.logins.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn find_private_key(&self, label: &str) -> Result<(), HsmError> {
        if self.objects.contains_key(label) {
            Ok(())
        } else {
            Err(HsmError::KeyNotFound(label.to_string()))
        }
    }

    fn certificate(&self, label: &str) -> Result<Vec<u8>, HsmError> {
        self.objects
            .get(label)
            .cloned()
            .ok_or_else(|| HsmError::CertificateNotFound(label.to_string()))
    }

    fn sign_raw(&self, key_label: &str, block: &[u8]) -> Result<Vec<u8>, HsmError> {
        let certificate = self
            .objects
            .get(key_label)
            .ok_or_else(|| HsmError::KeyNotFound(key_label.to_string()))?;

        let now = self.state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let delay = self.state.sign_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            std::thread::sleep(Duration::from_millis(delay));
        }
        let signature = fake_raw_signature(certificate, block);

        self.state.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.state.signatures.fetch_add(1, Ordering::SeqCst);
        Ok(signature)
    }
}

// ==================== PDF engine ====================

#[derive(Debug, Serialize, Deserialize)]
struct SignatureRecord {
    field: String,
    sub_filter: SubFilter,
    range: usize,
    digest: String,
    signature: String,
    certificate: String,
}

fn lines(document: &[u8]) -> impl Iterator<Item = &[u8]> {
    document.split(|b| *b == b'\n')
}

fn contains(document: &[u8], needle: &[u8]) -> bool {
    document.windows(needle.len()).any(|w| w == needle)
}

fn append_keywords<S: AsRef<str>>(document: &mut Vec<u8>, keywords: &[S]) {
    let keywords: Vec<&str> = keywords.iter().map(|k| k.as_ref()).collect();
    document.extend_from_slice(KEYWORDS_PREFIX);
    document.extend(serde_json::to_vec(&keywords).unwrap());
    document.push(b'\n');
}

fn check_header(document: &[u8]) -> Result<(), EngineError> {
    if document.starts_with(PDF_HEADER) {
        Ok(())
    } else {
        Err(EngineError::Parse("missing %PDF- header".to_string()))
    }
}

/// Engine double for the toy document format described in the module docs.
#[derive(Debug, Clone, Default)]
pub struct FakeEngine;

impl FakeEngine {
    pub fn new() -> Self {
        Self
    }

    /// Keywords in effect for the latest revision
    pub fn read_keywords(document: &[u8]) -> Result<Vec<String>, EngineError> {
        match lines(document)
            .filter_map(|line| line.strip_prefix(KEYWORDS_PREFIX))
            .last()
        {
            Some(json) => {
                serde_json::from_slice(json).map_err(|e| EngineError::Metadata(e.to_string()))
            }
            None => Ok(Vec::new()),
        }
    }

    pub fn count_signatures(document: &[u8]) -> usize {
        lines(document)
            .filter(|line| line.starts_with(SIGNATURE_PREFIX))
            .count()
    }

    fn signatures(document: &[u8]) -> Result<Vec<SignatureRecord>, EngineError> {
        lines(document)
            .filter_map(|line| line.strip_prefix(SIGNATURE_PREFIX))
            .map(|json| {
                serde_json::from_slice(json)
                    .map_err(|e| EngineError::Parse(format!("damaged signature: {}", e)))
            })
            .collect()
    }
}

#[async_trait]
impl PdfEngine for FakeEngine {
    async fn open_incremental(
        &self,
        document: Vec<u8>,
    ) -> Result<Box<dyn IncrementalDocument>, EngineError> {
        check_header(&document)?;
        Ok(Box::new(FakeDocument {
            bytes: document,
            keywords: None,
        }))
    }

    async fn open_reader(&self, document: Vec<u8>) -> Result<Box<dyn DocumentReader>, EngineError> {
        check_header(&document)?;
        let signatures = Self::signatures(&document)?;
        Ok(Box::new(FakeReader {
            bytes: document,
            signatures,
        }))
    }
}

struct FakeDocument {
    bytes: Vec<u8>,
    keywords: Option<Vec<String>>,
}

#[async_trait]
impl IncrementalDocument for FakeDocument {
    fn set_keywords(&mut self, keywords: Vec<String>) {
        self.keywords = Some(keywords);
    }

    async fn sign(
        self: Box<Self>,
        metadata: &SignatureMetadata,
        signer: Arc<dyn DigestSigner>,
    ) -> Result<Vec<u8>, EngineError> {
        let FakeDocument { bytes, keywords } = *self;
        if contains(&bytes, ENCRYPT_MARKER) {
            return Err(EngineError::KeyNotAvailable(
                "document is encrypted".to_string(),
            ));
        }
        if contains(&bytes, DAMAGED_MARKER) {
            return Err(EngineError::Signing(
                "cross-reference table is damaged".to_string(),
            ));
        }

        let mut output = bytes;
        if !output.ends_with(b"\n") {
            output.push(b'\n');
        }
        if let Some(keywords) = &keywords {
            append_keywords(&mut output, keywords);
        }

        let range = output.len();
        let digest = Sha256::digest(&output);
        let signature = signer
            .sign_digest(&digest)
            .await
            .map_err(|e| EngineError::Signing(e.to_string()))?;

        let record = SignatureRecord {
            field: metadata.field_name.clone(),
            sub_filter: metadata.sub_filter,
            range,
            digest: hex::encode(digest),
            signature: hex::encode(signature),
            certificate: hex::encode(signer.certificate()),
        };
        output.extend_from_slice(SIGNATURE_PREFIX);
        output.extend(serde_json::to_vec(&record).map_err(|e| EngineError::Signing(e.to_string()))?);
        output.extend_from_slice(b"\n%%EOF\n");
        Ok(output)
    }
}

struct FakeReader {
    bytes: Vec<u8>,
    signatures: Vec<SignatureRecord>,
}

impl FakeReader {
    fn chains_to(certificate: &[u8], trust_roots: &TrustRootSet) -> bool {
        if trust_roots.contains(certificate) {
            return true;
        }
        match X509Certificate::from_der(certificate) {
            Ok((_, cert)) => {
                let issuer = cert.issuer().to_string();
                trust_roots.iter().any(|root| root.subject() == issuer)
            }
            Err(_) => false,
        }
    }
}

#[async_trait]
impl DocumentReader for FakeReader {
    fn signature_count(&self) -> usize {
        self.signatures.len()
    }

    fn keywords(&self) -> Result<Vec<String>, EngineError> {
        FakeEngine::read_keywords(&self.bytes)
    }

    async fn validate_signature(
        &self,
        index: usize,
        trust_roots: &TrustRootSet,
    ) -> Result<SignatureStatus, EngineError> {
        let record = self
            .signatures
            .get(index)
            .ok_or_else(|| EngineError::Validation(format!("no signature at index {}", index)))?;

        let decode = |field: &str| {
            hex::decode(field).map_err(|e| EngineError::Validation(e.to_string()))
        };
        let digest = decode(&record.digest)?;
        let signature = decode(&record.signature)?;
        let certificate = decode(&record.certificate)?;

        let intact = record.range <= self.bytes.len()
            && Sha256::digest(&self.bytes[..record.range]).as_slice() == digest.as_slice();
        if !intact {
            return Ok(SignatureStatus {
                intact: false,
                valid: false,
            });
        }

        let modulus_len =
            rsa_modulus_len(&certificate).map_err(|e| EngineError::Validation(e.to_string()))?;
        let block = emsa_pkcs1_v15_sha256(&digest, modulus_len)
            .map_err(|e| EngineError::Validation(e.to_string()))?;
        let verifies = fake_raw_signature(&certificate, &block) == signature;

        Ok(SignatureStatus {
            intact,
            valid: verifies && Self::chains_to(&certificate, trust_roots),
        })
    }
}

// ==================== Document service ====================

/// [`DocumentService`] that takes a fixed time per request and records how
/// many requests it was serving at once. Seal echoes the input document.
#[derive(Debug)]
pub struct SlowService {
    delay: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    handled: AtomicUsize,
}

impl SlowService {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            handled: AtomicUsize::new(0),
        }
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn handled(&self) -> usize {
        self.handled.load(Ordering::SeqCst)
    }

    async fn work(&self) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.handled.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl DocumentService for SlowService {
    async fn seal(&self, request: SealRequest) -> SealReply {
        self.work().await;
        SealReply::sealed(request.transaction_id, request.data, self.backend())
    }

    async fn validate(&self, _request: ValidateRequest) -> ValidateReply {
        self.work().await;
        ValidateReply::verdict(String::new(), true, true, self.backend())
    }

    fn backend(&self) -> &str {
        "slow"
    }
}
