#![allow(clippy::unwrap_used, clippy::expect_used)]
//! Every certificate file in the trust-root directory must contribute.

use std::sync::Arc;

use eduseal::testing::{self, FakeEngine};
use eduseal::{TrustRootBuilder, ValidateCore, ValidateRequest, encode_document};

#[test]
fn test_n_files_yield_n_roots() {
    let dir = testing::trust_root_dir(&["other_ca_1.crt", "root_ca.crt", "other_ca_2.crt"]);

    let roots = TrustRootBuilder::new(dir.path()).build().unwrap();

    assert_eq!(roots.len(), 3);
}

#[tokio::test]
async fn test_signer_validates_whatever_position_its_root_has() {
    // root_ca.crt sorts after both other roots
    let dir = testing::trust_root_dir(&["other_ca_1.crt", "root_ca.crt", "other_ca_2.crt"]);
    let roots = TrustRootBuilder::new(dir.path()).build().unwrap();
    let core = ValidateCore::new(Arc::new(FakeEngine::new()), Arc::new(roots), "validator");

    let signed = testing::sign_with_fixture(&testing::minimal_pdf(), "tx-roots").await;
    let reply = core
        .validate(ValidateRequest {
            data: encode_document(&signed),
        })
        .await;

    assert!(reply.valid_signature, "{}", reply.error);
    assert_eq!(reply.transaction_id, "tx-roots");
}
