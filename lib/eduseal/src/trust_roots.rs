//! Trust-root set construction
//!
//! Built once at startup from every `.crt` file in a directory and shared
//! read-only by all validations afterwards.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::{info, warn};
use x509_parser::prelude::*;

use crate::error::ServiceError;

const TRUST_ROOT_EXTENSION: &str = ".crt";
const PEM_CERTIFICATE_TAG: &str = "CERTIFICATE";

/// A parsed certificate authority certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustRoot {
    der: Vec<u8>,
    subject: String,
    fingerprint: [u8; 32],
}

impl TrustRoot {
    pub fn from_der(der: Vec<u8>) -> Result<Self, String> {
        let subject = {
            let (_, cert) = X509Certificate::from_der(&der).map_err(|e| e.to_string())?;
            cert.subject().to_string()
        };
        let fingerprint = Sha256::digest(&der).into();
        Ok(Self {
            der,
            subject,
            fingerprint,
        })
    }

    pub fn der(&self) -> &[u8] {
        &self.der
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn fingerprint_hex(&self) -> String {
        hex::encode(self.fingerprint)
    }
}

/// Immutable collection of trust anchors.
#[derive(Debug, Clone, Default)]
pub struct TrustRootSet {
    roots: Vec<TrustRoot>,
}

impl TrustRootSet {
    /// Union of the given roots; identical certificates collapse to one.
    pub fn from_roots(roots: impl IntoIterator<Item = TrustRoot>) -> Self {
        let mut seen = HashSet::new();
        let roots = roots
            .into_iter()
            .filter(|root| seen.insert(root.fingerprint))
            .collect();
        Self { roots }
    }

    pub fn len(&self) -> usize {
        self.roots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TrustRoot> {
        self.roots.iter()
    }

    pub fn contains(&self, der: &[u8]) -> bool {
        let fingerprint: [u8; 32] = Sha256::digest(der).into();
        self.roots.iter().any(|root| root.fingerprint == fingerprint)
    }
}

/// Split a certificate file into DER certificates.
///
/// PEM files may hold several `CERTIFICATE` blocks; anything else is taken to
/// be a single DER certificate.
pub fn parse_certificate_file(bytes: &[u8]) -> Result<Vec<Vec<u8>>, String> {
    let looks_like_pem = bytes
        .iter()
        .skip_while(|b| b.is_ascii_whitespace())
        .take(5)
        .eq(b"-----".iter());

    if !looks_like_pem {
        return Ok(vec![bytes.to_vec()]);
    }

    let blocks = ::pem::parse_many(bytes).map_err(|e| e.to_string())?;
    let certificates: Vec<Vec<u8>> = blocks
        .into_iter()
        .filter(|block| block.tag() == PEM_CERTIFICATE_TAG)
        .map(|block| block.into_contents())
        .collect();

    if certificates.is_empty() {
        return Err("no CERTIFICATE block found".to_string());
    }
    Ok(certificates)
}

/// Builds a [`TrustRootSet`] from a directory of certificate files.
pub struct TrustRootBuilder {
    dir: PathBuf,
}

impl TrustRootBuilder {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Every regular `.crt` file directly inside the directory contributes
    /// all of its certificates. Subdirectories are not searched.
    pub fn build(&self) -> Result<TrustRootSet, ServiceError> {
        let mut files = self.certificate_files()?;
        files.sort();

        let mut roots = Vec::new();
        for path in &files {
            info!("found trust root file: {}", path.display());
            roots.extend(load_file(path)?);
        }

        let set = TrustRootSet::from_roots(roots);
        if set.is_empty() {
            warn!(
                "no trust roots found in {}, every signature will be untrusted",
                self.dir.display()
            );
        }
        info!("Loaded {} trust roots from {} files", set.len(), files.len());
        Ok(set)
    }

    fn certificate_files(&self) -> Result<Vec<PathBuf>, ServiceError> {
        let entries = std::fs::read_dir(&self.dir).map_err(|e| {
            ServiceError::TrustRoots(format!("cannot read {}: {}", self.dir.display(), e))
        })?;

        let mut files = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| ServiceError::TrustRoots(e.to_string()))?;
            let path = entry.path();
            let name = entry.file_name();
            if path.is_file() && name.to_string_lossy().ends_with(TRUST_ROOT_EXTENSION) {
                files.push(path);
            }
        }
        Ok(files)
    }
}

fn load_file(path: &Path) -> Result<Vec<TrustRoot>, ServiceError> {
    let bytes = std::fs::read(path)
        .map_err(|e| ServiceError::TrustRoots(format!("{}: {}", path.display(), e)))?;

    parse_certificate_file(&bytes)
        .and_then(|ders| ders.into_iter().map(TrustRoot::from_der).collect())
        .map_err(|e| ServiceError::TrustRoots(format!("{}: {}", path.display(), e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::fixture_path;

    fn copy_fixture(dir: &Path, fixture: &str, name: &str) {
        std::fs::copy(fixture_path(fixture), dir.join(name)).unwrap();
    }

    #[test]
    fn test_every_crt_file_contributes() {
        let dir = tempfile::tempdir().unwrap();
        copy_fixture(dir.path(), "root_ca.crt", "root_ca.crt");
        copy_fixture(dir.path(), "other_ca_1.crt", "other_ca_1.crt");
        copy_fixture(dir.path(), "other_ca_2.crt", "other_ca_2.crt");

        let set = TrustRootBuilder::new(dir.path()).build().unwrap();

        assert_eq!(set.len(), 3);
        let subjects: Vec<&str> = set.iter().map(|r| r.subject()).collect();
        assert!(subjects.iter().any(|s| s.contains("Eduseal Test Root CA")));
        assert!(subjects.iter().any(|s| s.contains("Other CA One")));
        assert!(subjects.iter().any(|s| s.contains("Other CA Two")));
    }

    #[test]
    fn test_other_extensions_and_subdirectories_ignored() {
        let dir = tempfile::tempdir().unwrap();
        copy_fixture(dir.path(), "root_ca.crt", "root_ca.crt");
        copy_fixture(dir.path(), "other_ca_1.crt", "other_ca_1.pem");
        std::fs::write(dir.path().join("README"), "not a certificate").unwrap();
        let nested = dir.path().join("nested");
        std::fs::create_dir(&nested).unwrap();
        copy_fixture(&nested, "other_ca_2.crt", "other_ca_2.crt");

        let set = TrustRootBuilder::new(dir.path()).build().unwrap();

        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_pem_bundle_contributes_every_block() {
        let dir = tempfile::tempdir().unwrap();
        let mut bundle = std::fs::read(fixture_path("root_ca.crt")).unwrap();
        bundle.extend(std::fs::read(fixture_path("other_ca_1.crt")).unwrap());
        std::fs::write(dir.path().join("bundle.crt"), bundle).unwrap();

        let set = TrustRootBuilder::new(dir.path()).build().unwrap();

        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_duplicate_certificates_collapse() {
        let dir = tempfile::tempdir().unwrap();
        copy_fixture(dir.path(), "root_ca.crt", "a.crt");
        copy_fixture(dir.path(), "root_ca.crt", "b.crt");

        let set = TrustRootBuilder::new(dir.path()).build().unwrap();

        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_empty_directory_yields_empty_set() {
        let dir = tempfile::tempdir().unwrap();
        let set = TrustRootBuilder::new(dir.path()).build().unwrap();
        assert!(set.is_empty());
    }

    #[test]
    fn test_missing_directory_is_fatal() {
        let err = TrustRootBuilder::new("/nonexistent/eduseal/roots")
            .build()
            .unwrap_err();
        assert!(matches!(err, ServiceError::TrustRoots(_)));
    }

    #[test]
    fn test_unparsable_crt_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("broken.crt"), "garbage").unwrap();
        assert!(TrustRootBuilder::new(dir.path()).build().is_err());
    }

    #[test]
    fn test_contains_by_der() {
        let der = crate::testing::fixture_der("root_ca.crt");
        let set = TrustRootSet::from_roots([TrustRoot::from_der(der.clone()).unwrap()]);
        assert!(set.contains(&der));
        assert!(!set.contains(&crate::testing::fixture_der("other_ca_1.crt")));
    }
}
