//! The single contract every transport adapter talks to

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::config::Config;
use crate::engine::{PdfEngine, SignatureMetadata};
use crate::error::{RequestError, ServiceError};
use crate::hsm::{Pkcs11Driver, SessionManager};
use crate::seal::{SealCore, SigningLabels};
use crate::trust_roots::TrustRootBuilder;
use crate::types::{SealReply, SealRequest, ValidateReply, ValidateRequest};
use crate::validate::ValidateCore;

/// Seal and Validate. Neither ever fails at the call level; errors travel
/// inside the reply, so redelivering a request is always safe.
#[async_trait]
pub trait DocumentService: Send + Sync {
    async fn seal(&self, request: SealRequest) -> SealReply;

    async fn validate(&self, request: ValidateRequest) -> ValidateReply;

    /// Backend identity reported in replies
    fn backend(&self) -> &str;
}

/// Composition of the cores enabled for this process.
pub struct Eduseal {
    backend: String,
    sealer: Option<SealCore>,
    validator: Option<ValidateCore>,
}

impl Eduseal {
    pub fn new(backend: &str) -> Self {
        Self {
            backend: backend.to_string(),
            sealer: None,
            validator: None,
        }
    }

    pub fn with_sealer(mut self, core: SealCore) -> Self {
        self.sealer = Some(core);
        self
    }

    pub fn with_validator(mut self, core: ValidateCore) -> Self {
        self.validator = Some(core);
        self
    }

    /// Open the HSM session and build the trust roots the configured role
    /// needs. Any failure here means the process must not serve.
    pub fn bootstrap(
        config: &Config,
        driver: Arc<dyn Pkcs11Driver>,
        engine: Arc<dyn PdfEngine>,
    ) -> Result<Self, ServiceError> {
        let mut service = Self::new(&config.service_name);

        if config.role.seals() {
            let hsm = config
                .hsm
                .clone()
                .ok_or_else(|| ServiceError::Config("sealer role requires HSM settings".into()))?;
            let labels = SigningLabels::from(&hsm);
            let session = SessionManager::new(driver, hsm).open()?;
            service = service.with_sealer(SealCore::new(
                engine.clone(),
                session,
                labels,
                SignatureMetadata::from_config(&config.metadata),
                &config.service_name,
            ));
            info!("Sealer ready");
        }

        if config.role.validates() {
            let trust_roots = TrustRootBuilder::new(&config.trust_roots_dir).build()?;
            service = service.with_validator(ValidateCore::new(
                engine,
                Arc::new(trust_roots),
                &config.service_name,
            ));
            info!("Validator ready");
        }

        Ok(service)
    }
}

#[async_trait]
impl DocumentService for Eduseal {
    async fn seal(&self, request: SealRequest) -> SealReply {
        match &self.sealer {
            Some(core) => core.seal(request).await,
            None => SealReply::failed(
                request.transaction_id,
                RequestError::OperationDisabled("seal").to_string(),
                &self.backend,
            ),
        }
    }

    async fn validate(&self, request: ValidateRequest) -> ValidateReply {
        match &self.validator {
            Some(core) => core.validate(request).await,
            None => ValidateReply::failed(
                RequestError::OperationDisabled("validate").to_string(),
                &self.backend,
            ),
        }
    }

    fn backend(&self) -> &str {
        &self.backend
    }
}
