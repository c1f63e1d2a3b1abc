#![allow(clippy::unwrap_used, clippy::expect_used)]
//! RemoteEngine against an in-process engine sidecar
//!
//! The sidecar speaks the engine wire protocol on a random local port and
//! records what it was asked to do, so the tests can check what crossed the
//! wire as well as what came back.

use std::sync::{Arc, Mutex};

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use eduseal::testing::{self, FakeDriver};
use eduseal::{
    RemoteEngine, SealCore, SealRequest, TrustRoot, TrustRootSet, ValidateCore, ValidateRequest,
    decode_document, encode_document,
};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};

const ENCRYPTED_MARKER: &str = "ENCRYPTED";

#[derive(Default)]
struct Sidecar {
    prepared_keywords: Mutex<Option<Value>>,
    prepared_metadata: Mutex<Option<Value>>,
    finished_signature: Mutex<Option<String>>,
    trust_roots_seen: Mutex<usize>,
}

fn error(status: StatusCode, kind: &str, message: &str) -> Response {
    (status, Json(json!({ "error": message, "kind": kind }))).into_response()
}

fn pdf_of(body: &Value) -> Vec<u8> {
    BASE64.decode(body["pdf"].as_str().unwrap()).unwrap()
}

async fn inspect(Json(body): Json<Value>) -> Response {
    let pdf = pdf_of(&body);
    if !pdf.starts_with(b"%PDF-") {
        return error(StatusCode::UNPROCESSABLE_ENTITY, "parse", "not a pdf");
    }
    let signed = pdf.ends_with(b"%SIGNED\n");
    Json(json!({
        "signatures": usize::from(signed),
        "keywords": if signed { json!(["transaction_id:remote-1"]) } else { json!([]) },
    }))
    .into_response()
}

async fn prepare(State(sidecar): State<Arc<Sidecar>>, Json(body): Json<Value>) -> Response {
    let pdf = pdf_of(&body);
    if String::from_utf8_lossy(&pdf).contains(ENCRYPTED_MARKER) {
        return error(
            StatusCode::UNPROCESSABLE_ENTITY,
            "key_not_available",
            "document is encrypted",
        );
    }
    *sidecar.prepared_keywords.lock().unwrap() = Some(body["keywords"].clone());
    *sidecar.prepared_metadata.lock().unwrap() = Some(body["metadata"].clone());

    Json(json!({
        "context": body["pdf"],
        "digest": BASE64.encode(Sha256::digest(&pdf)),
    }))
    .into_response()
}

async fn finish(State(sidecar): State<Arc<Sidecar>>, Json(body): Json<Value>) -> Response {
    let mut pdf = BASE64.decode(body["context"].as_str().unwrap()).unwrap();
    *sidecar.finished_signature.lock().unwrap() = body["signature"].as_str().map(String::from);
    pdf.extend_from_slice(b"%SIGNED\n");
    Json(json!({ "pdf": BASE64.encode(pdf) })).into_response()
}

async fn validate(State(sidecar): State<Arc<Sidecar>>, Json(body): Json<Value>) -> Response {
    let roots = body["trustRoots"].as_array().map(Vec::len).unwrap_or(0);
    *sidecar.trust_roots_seen.lock().unwrap() = roots;
    Json(json!({ "intact": true, "valid": roots > 0 })).into_response()
}

async fn start_sidecar() -> (RemoteEngine, Arc<Sidecar>) {
    let sidecar = Arc::new(Sidecar::default());
    let app = Router::new()
        .route("/v1/inspect", post(inspect))
        .route("/v1/prepare", post(prepare))
        .route("/v1/finish", post(finish))
        .route("/v1/validate", post(validate))
        .with_state(sidecar.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (RemoteEngine::new(&format!("http://{}/", addr)), sidecar)
}

fn sealer(engine: RemoteEngine) -> SealCore {
    SealCore::new(
        Arc::new(engine),
        FakeDriver::with_fixture_signer().open_test_session(),
        testing::signing_labels(),
        testing::signature_metadata(),
        "remote-sealer",
    )
}

// ==================== Seal ====================

#[tokio::test]
async fn test_seal_through_remote_engine() {
    let (engine, sidecar) = start_sidecar().await;
    let original = testing::minimal_pdf();

    let reply = sealer(engine)
        .seal(SealRequest {
            transaction_id: "remote-1".to_string(),
            data: encode_document(&original),
        })
        .await;

    assert!(reply.is_ok(), "{}", reply.error);
    let sealed = decode_document(&reply.data).unwrap();
    assert!(sealed.starts_with(&original));

    let keywords = sidecar.prepared_keywords.lock().unwrap().clone().unwrap();
    assert_eq!(keywords, json!(["transaction_id:remote-1"]));

    let metadata = sidecar.prepared_metadata.lock().unwrap().clone().unwrap();
    assert_eq!(metadata["fieldName"], "Signature1");
    assert_eq!(metadata["subFilter"], "adbe.pkcs7.detached");

    // The token received the padded digest the sidecar asked for
    let digest = Sha256::digest(&original);
    let block = eduseal::signer::emsa_pkcs1_v15_sha256(&digest, 256).unwrap();
    let expected = testing::fake_raw_signature(&testing::signer_certificate(), &block);
    let signature = sidecar.finished_signature.lock().unwrap().clone().unwrap();
    assert_eq!(BASE64.decode(signature).unwrap(), expected);
}

#[tokio::test]
async fn test_encrypted_error_kind_maps_to_encrypted_reply() {
    let (engine, _sidecar) = start_sidecar().await;
    let mut pdf = testing::minimal_pdf();
    pdf.extend_from_slice(ENCRYPTED_MARKER.as_bytes());

    let reply = sealer(engine)
        .seal(SealRequest {
            transaction_id: "remote-2".to_string(),
            data: encode_document(&pdf),
        })
        .await;

    assert!(reply.error.starts_with("input pdf is encrypted"), "{}", reply.error);
}

#[tokio::test]
async fn test_parse_error_kind_maps_to_invalid_input() {
    let (engine, _sidecar) = start_sidecar().await;

    let reply = sealer(engine)
        .seal(SealRequest {
            transaction_id: "remote-3".to_string(),
            data: encode_document(b"no header"),
        })
        .await;

    assert!(reply.error.starts_with("input pdf is not valid"), "{}", reply.error);
}

#[tokio::test]
async fn test_unreachable_engine_is_reply_error() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let reply = sealer(RemoteEngine::new(&format!("http://{}", addr)))
        .seal(SealRequest {
            transaction_id: "remote-4".to_string(),
            data: encode_document(&testing::minimal_pdf()),
        })
        .await;

    assert!(
        reply.error.starts_with("pdf engine unavailable"),
        "{}",
        reply.error
    );
    assert!(reply.data.is_empty());
    assert_eq!(reply.transaction_id, "remote-4");
}

// ==================== Validate ====================

#[tokio::test]
async fn test_validate_sends_trust_roots_and_recovers_id() {
    let (engine, sidecar) = start_sidecar().await;
    let roots = TrustRootSet::from_roots([
        TrustRoot::from_der(testing::fixture_der("root_ca.crt")).unwrap(),
        TrustRoot::from_der(testing::fixture_der("other_ca_2.crt")).unwrap(),
    ]);
    let core = ValidateCore::new(Arc::new(engine), Arc::new(roots), "remote-validator");
    let mut signed = testing::minimal_pdf();
    signed.extend_from_slice(b"%SIGNED\n");

    let reply = core
        .validate(ValidateRequest {
            data: encode_document(&signed),
        })
        .await;

    assert!(reply.is_ok(), "{}", reply.error);
    assert!(reply.intact_signature);
    assert!(reply.valid_signature);
    assert_eq!(reply.transaction_id, "remote-1");
    assert_eq!(*sidecar.trust_roots_seen.lock().unwrap(), 2);
}

#[tokio::test]
async fn test_validate_unsigned_through_remote_engine() {
    let (engine, _sidecar) = start_sidecar().await;
    let core = ValidateCore::new(
        Arc::new(engine),
        Arc::new(TrustRootSet::default()),
        "remote-validator",
    );

    let reply = core
        .validate(ValidateRequest {
            data: encode_document(&testing::minimal_pdf()),
        })
        .await;

    assert_eq!(reply.error, "no signature found");
}
