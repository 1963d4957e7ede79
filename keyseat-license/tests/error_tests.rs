use keyseat_license::{CertificateError, LicenseError, SignatureError, is_transient_status};
use std::collections::HashSet;

fn all_errors() -> Vec<LicenseError> {
    vec![
        LicenseError::InvalidSignature(SignatureError::BadSignature),
        LicenseError::Network("timeout".into()),
        LicenseError::Http {
            status: 422,
            code: Some("FINGERPRINT_TAKEN".into()),
            detail: "taken".into(),
        },
        LicenseError::Unauthorized("bad token".into()),
        LicenseError::NotLoggedIn,
        LicenseError::InvalidFingerprint("empty".into()),
        LicenseError::InvalidProductId("..".into()),
        LicenseError::InvalidPayload("missing data".into()),
        LicenseError::Fingerprint("helper failed".into()),
        LicenseError::Storage("disk full".into()),
        LicenseError::Config("bad key".into()),
        LicenseError::Serialization(serde_json::from_str::<u8>("x").unwrap_err()),
        LicenseError::Certificate(CertificateError::Decryption),
    ]
}

#[test]
fn exit_codes_are_distinct_and_avoid_reserved_values() {
    let codes: Vec<i32> = all_errors().iter().map(LicenseError::exit_code).collect();
    let unique: HashSet<_> = codes.iter().collect();
    assert_eq!(unique.len(), codes.len());
    // 0 is success, 1 an invalid key, 11 pool exhaustion.
    assert!(codes.iter().all(|c| ![0, 1, 11].contains(c)));
}

#[test]
fn tags_are_distinct() {
    let tags: HashSet<_> = all_errors().iter().map(LicenseError::tag).collect();
    assert_eq!(tags.len(), all_errors().len());
}

#[test]
fn documented_exit_codes() {
    assert_eq!(LicenseError::Unauthorized(String::new()).exit_code(), 10);
    assert_eq!(LicenseError::Network(String::new()).exit_code(), 12);
    assert_eq!(
        LicenseError::InvalidSignature(SignatureError::DigestMismatch).exit_code(),
        14
    );
    assert_eq!(LicenseError::NotLoggedIn.exit_code(), 15);
    assert_eq!(LicenseError::from(CertificateError::Unsigned).exit_code(), 23);
}

#[test]
fn transient_classification() {
    assert!(LicenseError::Network("x".into()).is_transient());
    let http = |status| LicenseError::Http {
        status,
        code: None,
        detail: String::new(),
    };
    assert!(http(503).is_transient());
    assert!(http(429).is_transient());
    assert!(!http(404).is_transient());
    assert!(!LicenseError::InvalidSignature(SignatureError::BadSignature).is_transient());
}

#[test]
fn retry_status_classification_matches_errors() {
    for status in [200, 400, 401, 404, 422, 429, 500, 502, 503] {
        let err = LicenseError::Http {
            status,
            code: None,
            detail: String::new(),
        };
        assert_eq!(is_transient_status(status), err.is_transient(), "{status}");
    }
}

#[test]
fn remote_code_only_for_http() {
    let err = LicenseError::Http {
        status: 422,
        code: Some("FINGERPRINT_TAKEN".into()),
        detail: String::new(),
    };
    assert_eq!(err.remote_code(), Some("FINGERPRINT_TAKEN"));
    assert_eq!(LicenseError::NotLoggedIn.remote_code(), None);
}

#[test]
fn signature_errors_convert() {
    let err: LicenseError = SignatureError::Stale { age_secs: 900 }.into();
    assert!(err.to_string().contains("900"));
    assert_eq!(err.tag(), "invalid-signature");
}

#[test]
fn io_errors_become_storage_errors() {
    let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
    let err: LicenseError = io.into();
    assert!(matches!(err, LicenseError::Storage(_)));
}
