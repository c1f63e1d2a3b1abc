//! Seal and Validate request/reply contracts
//!
//! These are the records every transport carries. Document bytes travel as
//! base64 text; decoding happens inside the cores so that a malformed payload
//! becomes a reply error instead of a transport fault.

use base64::Engine;
use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig, STANDARD};
use base64::engine::DecodePaddingMode;
use serde::{Deserialize, Serialize};

const LENIENT: GeneralPurposeConfig = GeneralPurposeConfig::new()
    .with_encode_padding(true)
    .with_decode_padding_mode(DecodePaddingMode::Indifferent)
    .with_decode_allow_trailing_bits(true);

const LENIENT_URL_SAFE: GeneralPurpose = GeneralPurpose::new(&alphabet::URL_SAFE, LENIENT);
const LENIENT_STANDARD: GeneralPurpose = GeneralPurpose::new(&alphabet::STANDARD, LENIENT);

/// Decode an inbound document.
///
/// Accepts both the URL-safe and standard alphabets, with or without padding,
/// and ignores embedded whitespace (line-wrapped base64 is common in queue
/// payloads).
pub fn decode_document(data: &str) -> Result<Vec<u8>, base64::DecodeError> {
    let compact: String = data.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    LENIENT_URL_SAFE
        .decode(&compact)
        .or_else(|_| LENIENT_STANDARD.decode(&compact))
}

/// Encode an outbound document with the standard padded alphabet.
pub fn encode_document(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealRequest {
    pub transaction_id: String,
    /// Base64 encoded PDF
    pub data: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealReply {
    pub transaction_id: String,
    /// Base64 encoded signed PDF, empty on failure
    #[serde(default)]
    pub data: String,
    /// Empty on success
    #[serde(default)]
    pub error: String,
    #[serde(rename = "sealer_backend", default)]
    pub backend: String,
}

impl SealReply {
    pub fn sealed(transaction_id: String, data: String, backend: &str) -> Self {
        Self {
            transaction_id,
            data,
            error: String::new(),
            backend: backend.to_string(),
        }
    }

    pub fn failed(transaction_id: String, error: String, backend: &str) -> Self {
        Self {
            transaction_id,
            data: String::new(),
            error,
            backend: backend.to_string(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidateRequest {
    /// Base64 encoded signed PDF
    pub data: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidateReply {
    /// Recovered from the document keywords; empty when absent
    #[serde(default)]
    pub transaction_id: String,
    /// The signed byte range digest matches
    #[serde(default)]
    pub intact_signature: bool,
    /// The signer chains to a trust root and the signature verifies
    #[serde(default)]
    pub valid_signature: bool,
    #[serde(default)]
    pub error: String,
    #[serde(rename = "validation_backend", default)]
    pub backend: String,
}

impl ValidateReply {
    pub fn verdict(transaction_id: String, intact: bool, valid: bool, backend: &str) -> Self {
        Self {
            transaction_id,
            intact_signature: intact,
            valid_signature: valid,
            error: String::new(),
            backend: backend.to_string(),
        }
    }

    pub fn failed(error: String, backend: &str) -> Self {
        Self {
            error,
            backend: backend.to_string(),
            ..Self::default()
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_accepts_url_safe_without_padding() {
        // 0xfb 0xff encodes to "-_8" in the URL-safe alphabet
        assert_eq!(decode_document("-_8").unwrap(), vec![0xfb, 0xff]);
    }

    #[test]
    fn test_decode_accepts_standard_alphabet() {
        assert_eq!(decode_document("+/8=").unwrap(), vec![0xfb, 0xff]);
    }

    #[test]
    fn test_decode_ignores_line_wrapping() {
        let wrapped = "JVBE\nRi0x\r\nLjc=";
        assert_eq!(decode_document(wrapped).unwrap(), b"%PDF-1.7".to_vec());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode_document("not base64 at all!").is_err());
    }

    #[test]
    fn test_seal_reply_wire_names() {
        let reply = SealReply::sealed("tx-1".to_string(), "AAAA".to_string(), "sealer-a");
        let json = serde_json::to_value(&reply).unwrap();
        assert_eq!(json["transaction_id"], "tx-1");
        assert_eq!(json["sealer_backend"], "sealer-a");
        assert_eq!(json["error"], "");
    }

    #[test]
    fn test_validate_reply_failed_has_no_verdict() {
        let reply = ValidateReply::failed("no signature found".to_string(), "validator-a");
        assert!(!reply.intact_signature);
        assert!(!reply.valid_signature);
        assert!(reply.transaction_id.is_empty());
        let json = serde_json::to_value(&reply).unwrap();
        assert_eq!(json["validation_backend"], "validator-a");
    }

    #[test]
    fn test_validate_reply_missing_fields_default() {
        let reply: ValidateReply = serde_json::from_str(r#"{"error":"x"}"#).unwrap();
        assert_eq!(reply.error, "x");
        assert!(!reply.valid_signature);
    }
}
