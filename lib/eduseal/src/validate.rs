//! Validate transactions

use std::sync::Arc;

use tracing::{error, info};

use crate::engine::{PdfEngine, SignatureStatus};
use crate::error::RequestError;
use crate::transaction;
use crate::trust_roots::TrustRootSet;
use crate::types::{ValidateReply, ValidateRequest, decode_document};

/// Orchestrates one validation per call against the process trust roots.
pub struct ValidateCore {
    engine: Arc<dyn PdfEngine>,
    trust_roots: Arc<TrustRootSet>,
    backend: String,
}

impl ValidateCore {
    pub fn new(engine: Arc<dyn PdfEngine>, trust_roots: Arc<TrustRootSet>, backend: &str) -> Self {
        Self {
            engine,
            trust_roots,
            backend: backend.to_string(),
        }
    }

    /// Validate the first embedded signature and recover the transaction id.
    pub async fn validate(&self, request: ValidateRequest) -> ValidateReply {
        match self.try_validate(request).await {
            Ok((transaction_id, status)) => {
                info!(
                    "Validate a signed base64 PDF, transaction_id:{}, intact:{}, valid:{}",
                    transaction_id, status.intact, status.valid
                );
                ValidateReply::verdict(transaction_id, status.intact, status.valid, &self.backend)
            }
            Err(e) => {
                error!("{}", e);
                ValidateReply::failed(e.to_string(), &self.backend)
            }
        }
    }

    async fn try_validate(
        &self,
        request: ValidateRequest,
    ) -> Result<(String, SignatureStatus), RequestError> {
        let bytes = decode_document(&request.data)?;

        let document = self
            .engine
            .open_reader(bytes)
            .await
            .map_err(|e| RequestError::from_engine(e, RequestError::DocumentParse))?;

        if document.signature_count() == 0 {
            return Err(RequestError::SignatureNotFound);
        }

        let status = document
            .validate_signature(0, &self.trust_roots)
            .await
            .map_err(|e| RequestError::from_engine(e, RequestError::SignatureValidation))?;

        let keywords = document
            .keywords()
            .map_err(RequestError::TransactionIdRecovery)?;
        let transaction_id = transaction::recover(&keywords).unwrap_or_default();
        if !transaction_id.is_empty() {
            info!("found transaction_id: {}", transaction_id);
        }

        Ok((transaction_id, status))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{self, FakeEngine};
    use crate::trust_roots::TrustRoot;
    use crate::types::encode_document;

    fn core_trusting(fixtures: &[&str]) -> ValidateCore {
        let roots = fixtures
            .iter()
            .map(|f| TrustRoot::from_der(testing::fixture_der(f)).unwrap());
        ValidateCore::new(
            Arc::new(FakeEngine::new()),
            Arc::new(TrustRootSet::from_roots(roots)),
            "validator-test",
        )
    }

    fn request(bytes: &[u8]) -> ValidateRequest {
        ValidateRequest {
            data: encode_document(bytes),
        }
    }

    #[tokio::test]
    async fn test_unsigned_document() {
        let core = core_trusting(&["root_ca.crt"]);

        let reply = core.validate(request(&testing::minimal_pdf())).await;

        assert_eq!(reply.error, "no signature found");
        assert!(!reply.intact_signature);
        assert!(!reply.valid_signature);
        assert_eq!(reply.backend, "validator-test");
    }

    #[tokio::test]
    async fn test_trusted_signature() {
        let core = core_trusting(&["root_ca.crt"]);
        let signed = testing::sign_with_fixture(&testing::minimal_pdf(), "tx-7").await;

        let reply = core.validate(request(&signed)).await;

        assert!(reply.is_ok(), "{}", reply.error);
        assert!(reply.intact_signature);
        assert!(reply.valid_signature);
        assert_eq!(reply.transaction_id, "tx-7");
    }

    #[tokio::test]
    async fn test_untrusted_signer_is_intact_but_invalid() {
        let core = core_trusting(&["other_ca_1.crt"]);
        let signed = testing::sign_with_fixture(&testing::minimal_pdf(), "tx-8").await;

        let reply = core.validate(request(&signed)).await;

        assert!(reply.intact_signature);
        assert!(!reply.valid_signature);
    }

    #[tokio::test]
    async fn test_altered_signed_range_is_not_intact() {
        let core = core_trusting(&["root_ca.crt"]);
        let mut signed = testing::sign_with_fixture(&testing::minimal_pdf(), "tx-9").await;
        testing::tamper(&mut signed);

        let reply = core.validate(request(&signed)).await;

        assert!(!reply.intact_signature);
        assert!(!reply.valid_signature);
        assert_eq!(reply.transaction_id, "tx-9");
    }

    #[tokio::test]
    async fn test_missing_transaction_keyword_is_empty_not_error() {
        let core = core_trusting(&["root_ca.crt"]);
        let signed = testing::sign_without_keywords(&testing::minimal_pdf()).await;

        let reply = core.validate(request(&signed)).await;

        assert!(reply.is_ok(), "{}", reply.error);
        assert!(reply.transaction_id.is_empty());
    }

    #[tokio::test]
    async fn test_unreadable_input() {
        let core = core_trusting(&["root_ca.crt"]);

        let garbage = core.validate(request(b"plain text")).await;
        assert!(garbage.error.starts_with("input pdf is not valid"));

        let not_base64 = core
            .validate(ValidateRequest {
                data: "***".to_string(),
            })
            .await;
        assert!(not_base64.error.starts_with("input is not valid base64"));
    }

    #[tokio::test]
    async fn test_unreadable_keywords_is_recovery_error() {
        let core = core_trusting(&["root_ca.crt"]);
        let mut signed = testing::sign_with_fixture(&testing::minimal_pdf(), "tx-3").await;
        signed.extend_from_slice(b"%Keywords: {broken\n");

        let reply = core.validate(request(&signed)).await;

        assert!(reply.error.starts_with("error getting transaction_id"));
    }

    #[tokio::test]
    async fn test_only_first_signature_is_validated() {
        let core = core_trusting(&["root_ca.crt"]);
        let once = testing::sign_with_fixture(&testing::minimal_pdf(), "first").await;
        let mut twice = testing::sign_with_rogue(&once, "second").await;
        // The trailing rogue signature is untrusted, the first one is not
        assert_eq!(FakeEngine::count_signatures(&twice), 2);

        let reply = core.validate(request(&twice)).await;
        assert!(reply.valid_signature);

        testing::tamper(&mut twice);
        let reply = core.validate(request(&twice)).await;
        assert!(!reply.intact_signature);
    }
}
