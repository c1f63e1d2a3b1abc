//! Process configuration
//!
//! Everything is read once from the environment at startup and is immutable
//! afterwards. Transport settings are owned by the service crate; this module
//! covers the HSM, signature metadata, trust roots and the PDF engine.

use std::path::PathBuf;
use std::str::FromStr;

use crate::error::ServiceError;

pub const DEFAULT_SERVICE_NAME: &str = "eduseal";
pub const DEFAULT_TRUST_ROOTS_DIR: &str = "/validation_certificates";
pub const DEFAULT_HEALTHCHECK_PATH: &str = "/tmp/healthcheck";
pub const DEFAULT_ENGINE_URL: &str = "http://pdf-engine:8080";

/// Which operations this backend serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Sealer,
    Validator,
    All,
}

impl Role {
    pub fn seals(self) -> bool {
        matches!(self, Role::Sealer | Role::All)
    }

    pub fn validates(self) -> bool {
        matches!(self, Role::Validator | Role::All)
    }
}

impl FromStr for Role {
    type Err = ServiceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sealer" | "seal" => Ok(Role::Sealer),
            "validator" | "validate" => Ok(Role::Validator),
            "all" => Ok(Role::All),
            other => Err(ServiceError::Config(format!("Unknown role: {}", other))),
        }
    }
}

/// PKCS#11 token and object selection.
#[derive(Clone)]
pub struct HsmConfig {
    /// Path to the PKCS#11 module shared object
    pub module: PathBuf,
    /// Slot index among slots with a token present
    pub slot: Option<usize>,
    /// Token label
    pub token_label: Option<String>,
    pub pin: String,
    pub key_label: String,
    pub cert_label: String,
}

impl std::fmt::Debug for HsmConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HsmConfig")
            .field("module", &self.module)
            .field("slot", &self.slot)
            .field("token_label", &self.token_label)
            .field("pin", &"<redacted>")
            .field("key_label", &self.key_label)
            .field("cert_label", &self.cert_label)
            .finish()
    }
}

/// Strings placed in the signature dictionary.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SignatureMetadataConfig {
    pub location: String,
    pub reason: String,
    pub name: String,
    pub contact_info: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Backend identity reported in every reply
    pub service_name: String,
    pub role: Role,
    /// Present whenever the role seals
    pub hsm: Option<HsmConfig>,
    pub metadata: SignatureMetadataConfig,
    pub trust_roots_dir: PathBuf,
    pub engine_url: String,
    pub healthcheck_path: PathBuf,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ServiceError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration from an arbitrary variable source.
    ///
    /// Empty values are treated as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ServiceError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let service_name =
            var("EDUSEAL_SERVICE_NAME").unwrap_or_else(|| DEFAULT_SERVICE_NAME.to_string());

        let role = match var("EDUSEAL_ROLE") {
            Some(r) => r.parse()?,
            None => Role::All,
        };

        let hsm = if role.seals() {
            Some(hsm_from_lookup(&var)?)
        } else {
            None
        };

        let metadata = SignatureMetadataConfig {
            location: var("SIGNATURE_LOCATION").unwrap_or_default(),
            reason: var("SIGNATURE_REASON").unwrap_or_default(),
            name: var("SIGNATURE_NAME").unwrap_or_default(),
            contact_info: var("SIGNATURE_CONTACT_INFO").unwrap_or_default(),
        };

        let trust_roots_dir = PathBuf::from(
            var("TRUST_ROOTS_DIR").unwrap_or_else(|| DEFAULT_TRUST_ROOTS_DIR.to_string()),
        );

        let engine_url = var("PDF_ENGINE_URL").unwrap_or_else(|| DEFAULT_ENGINE_URL.to_string());

        let healthcheck_path = PathBuf::from(
            var("HEALTHCHECK_PATH").unwrap_or_else(|| DEFAULT_HEALTHCHECK_PATH.to_string()),
        );

        Ok(Self {
            service_name,
            role,
            hsm,
            metadata,
            trust_roots_dir,
            engine_url,
            healthcheck_path,
        })
    }
}

fn hsm_from_lookup<F>(var: &F) -> Result<HsmConfig, ServiceError>
where
    F: Fn(&str) -> Option<String>,
{
    let required = |name: &str| {
        var(name).ok_or_else(|| ServiceError::Config(format!("{} is required", name)))
    };

    let module = PathBuf::from(required("PKCS11_MODULE")?);
    let slot = var("PKCS11_SLOT")
        .map(|s| {
            s.trim()
                .parse::<usize>()
                .map_err(|e| ServiceError::Config(format!("PKCS11_SLOT must be a valid number: {}", e)))
        })
        .transpose()?;
    let token_label = var("PKCS11_TOKEN_LABEL");

    if slot.is_none() && token_label.is_none() {
        return Err(ServiceError::Config(
            "one of PKCS11_SLOT or PKCS11_TOKEN_LABEL is required".to_string(),
        ));
    }

    let pin = required("PKCS11_PIN")?;
    let key_label = required("PKCS11_KEY_LABEL")?;
    let cert_label = var("PKCS11_CERT_LABEL").unwrap_or_else(|| key_label.clone());

    Ok(HsmConfig {
        module,
        slot,
        token_label,
        pin,
        key_label,
        cert_label,
    })
}
