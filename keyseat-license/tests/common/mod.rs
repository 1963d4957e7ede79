//! Shared test helpers: a fixed signing key, signed responses and a
//! scripted transport.

#![allow(dead_code)]

use base64::{Engine, engine::general_purpose::STANDARD};
use chrono::Utc;
use ed25519_dalek::{Signer, SigningKey};
use keyseat_license::{
    ApiRequest, ClientConfig, RawResponse, RetryPolicy, SIGNATURE_HEADER, SignedClient, Transport,
    TransportError, digest_header, signing_string,
};
use reqwest::Method;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

pub const TEST_HOST: &str = "licensing.test";
pub const TEST_ACCOUNT: &str = "acct-1";

/// Returns a deterministic Ed25519 key pair from a fixed seed.
pub fn test_keypair() -> (SigningKey, [u8; 32]) {
    let seed: [u8; 32] = [
        1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24,
        25, 26, 27, 28, 29, 30, 31, 32,
    ];
    let signing_key = SigningKey::from_bytes(&seed);
    let verifying_key = signing_key.verifying_key();
    (signing_key, verifying_key.to_bytes())
}

pub fn public_key_hex() -> String {
    hex::encode(test_keypair().1)
}

/// `Date` header value for a timestamp offset from now.
pub fn http_date(offset_secs: i64) -> String {
    (Utc::now() + chrono::Duration::seconds(offset_secs))
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string()
}

/// Signature headers for a response to `method target` on `host`.
pub fn signed_headers(method: &Method, target: &str, host: &str, body: &[u8], date: &str) -> Vec<(String, String)> {
    let (sk, _) = test_keypair();
    let digest = digest_header(body);
    let message = signing_string(method, target, host, date, &digest);
    let signature = STANDARD.encode(sk.sign(message.as_bytes()).to_bytes());
    vec![
        (
            SIGNATURE_HEADER.to_string(),
            format!(
                r#"keyid="{TEST_ACCOUNT}", algorithm="ed25519", signature="{signature}", headers="(request-target) host date digest""#
            ),
        ),
        ("Digest".to_string(), digest),
        ("Date".to_string(), date.to_string()),
    ]
}

/// A fresh response signed for `host`, as served by `host`.
pub fn signed_raw(method: &Method, target: &str, host: &str, status: u16, body: &[u8]) -> RawResponse {
    let mut headers = HeaderMap::new();
    for (name, value) in signed_headers(method, target, host, body, &http_date(0)) {
        headers.insert(
            HeaderName::from_bytes(name.as_bytes()).unwrap(),
            HeaderValue::from_str(&value).unwrap(),
        );
    }
    RawResponse {
        status,
        headers,
        body: body.to_vec(),
        served_host: host.to_string(),
    }
}

/// Client config pointing at `base_url` with the test key and fast retries.
pub fn test_config(base_url: &str) -> ClientConfig {
    let mut config = ClientConfig::new(base_url, TEST_ACCOUNT, &public_key_hex()).unwrap();
    config.retry = RetryPolicy {
        max_attempts: 3,
        base_delay: Duration::from_millis(1),
    };
    config
}

/// One scripted reply.
pub enum Reply {
    Json(u16, Value),
    /// Signed over a fixed request-target instead of the request's own.
    SignedFor(String, u16, Value),
    Fail(TransportError),
}

/// Transport answering from a queue, signing each reply for the request
/// it answers. Records every request it receives.
#[derive(Default)]
pub struct ScriptedTransport {
    replies: Mutex<VecDeque<Reply>>,
    requests: Mutex<Vec<ApiRequest>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply(self, status: u16, body: Value) -> Self {
        self.replies.lock().unwrap().push_back(Reply::Json(status, body));
        self
    }

    pub fn reply_signed_for(self, target: &str, status: u16, body: Value) -> Self {
        self.replies
            .lock()
            .unwrap()
            .push_back(Reply::SignedFor(target.to_string(), status, body));
        self
    }

    pub fn fail(self, err: TransportError) -> Self {
        self.replies.lock().unwrap().push_back(Reply::Fail(err));
        self
    }

    pub fn requests(&self) -> Vec<ApiRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// `METHOD path` of each request, without the query.
    pub fn calls(&self) -> Vec<String> {
        self.requests()
            .iter()
            .map(|r| format!("{} {}", r.method, r.url.path()))
            .collect()
    }

    pub fn remaining(&self) -> usize {
        self.replies.lock().unwrap().len()
    }
}

impl Transport for ScriptedTransport {
    fn send(&self, request: &ApiRequest) -> Result<RawResponse, TransportError> {
        self.requests.lock().unwrap().push(request.clone());
        let reply = self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| panic!("unexpected request {} {}", request.method, request.url));
        match reply {
            Reply::Json(status, body) => {
                let bytes = serde_json::to_vec(&body).unwrap();
                Ok(signed_raw(&request.method, &request.target(), TEST_HOST, status, &bytes))
            }
            Reply::SignedFor(target, status, body) => {
                let bytes = serde_json::to_vec(&body).unwrap();
                Ok(signed_raw(&request.method, &target, TEST_HOST, status, &bytes))
            }
            Reply::Fail(err) => Err(err),
        }
    }
}

pub fn scripted_client(transport: ScriptedTransport) -> SignedClient<ScriptedTransport> {
    SignedClient::with_transport(test_config(&format!("https://{TEST_HOST}")), transport).unwrap()
}

// ── JSON:API fixtures ────────────────────────────────────────────

pub fn machine_doc(id: &str, fingerprint: &str, license_id: &str) -> Value {
    serde_json::json!({
        "id": id,
        "type": "machines",
        "attributes": { "fingerprint": fingerprint },
        "relationships": {
            "license": { "data": { "type": "licenses", "id": license_id } }
        }
    })
}

pub fn license_doc(id: &str, key: &str, product_id: &str) -> Value {
    serde_json::json!({
        "id": id,
        "type": "licenses",
        "attributes": { "key": key, "status": "ACTIVE", "suspended": false },
        "relationships": {
            "product": { "data": { "type": "products", "id": product_id } },
            "machines": { "meta": { "count": 0 } }
        }
    })
}

pub fn error_doc(code: &str, title: &str) -> Value {
    serde_json::json!({ "errors": [{ "title": title, "detail": title, "code": code }] })
}

/// Current-thread runtime for driving wiremock from blocking tests.
pub fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}
