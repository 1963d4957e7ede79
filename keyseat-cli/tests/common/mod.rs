//! Shared helpers for CLI tests: a signing key matching `--public-key` and
//! signed wiremock responses.

#![allow(dead_code)]

use base64::{Engine, engine::general_purpose::STANDARD};
use ed25519_dalek::{Signer, SigningKey};
use keyseat_license::{SIGNATURE_HEADER, digest_header, signing_string};
use reqwest::Method;
use wiremock::{MockServer, ResponseTemplate};

pub const ACCOUNT: &str = "acct-1";

pub fn signing_key() -> SigningKey {
    let seed: [u8; 32] = [
        1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24,
        25, 26, 27, 28, 29, 30, 31, 32,
    ];
    SigningKey::from_bytes(&seed)
}

pub fn public_key_hex() -> String {
    hex::encode(signing_key().verifying_key().to_bytes())
}

pub fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

pub fn server_host(server: &MockServer) -> String {
    let addr = server.address();
    format!("{}:{}", addr.ip(), addr.port())
}

/// A response to `method target` signed for the mock server's host.
pub fn signed(server: &MockServer, method: Method, target: &str, status: u16, body: &serde_json::Value) -> ResponseTemplate {
    let bytes = serde_json::to_vec(body).unwrap();
    let date = chrono::Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string();
    let digest = digest_header(&bytes);
    let message = signing_string(&method, target, &server_host(server), &date, &digest);
    let signature = STANDARD.encode(signing_key().sign(message.as_bytes()).to_bytes());

    ResponseTemplate::new(status)
        .insert_header(
            SIGNATURE_HEADER,
            format!(r#"keyid="{ACCOUNT}", algorithm="ed25519", signature="{signature}""#).as_str(),
        )
        .insert_header("Digest", digest.as_str())
        .insert_header("Date", date.as_str())
        .set_body_raw(bytes, "application/vnd.api+json")
}
