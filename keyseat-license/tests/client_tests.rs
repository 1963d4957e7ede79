mod common;

use common::{
    ScriptedTransport, TEST_HOST, error_doc, http_date, license_doc, machine_doc, runtime,
    scripted_client, signed_headers, test_config,
};
use keyseat_license::{
    Credential, CredentialSource, LicenseError, MachineFingerprint, SignedClient, TransportError,
    ValidationReason, fingerprint_from_parts,
};
use reqwest::Method;
use serde_json::json;
use std::time::Duration;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn credential() -> Credential {
    Credential::new("test-token", CredentialSource::Flag)
}

fn fingerprint() -> MachineFingerprint {
    fingerprint_from_parts(Some("abc123"), None)
}

// ── Retry policy (scripted) ─────────────────────────────────────

#[test]
fn get_retries_transient_failures_then_succeeds() {
    let transport = ScriptedTransport::new()
        .fail(TransportError::Connect("refused".into()))
        .reply(503, json!({}))
        .reply(200, json!({ "data": [] }));
    let client = scripted_client(transport);

    let found = client.find_machine(&credential(), &fingerprint(), "prod-1").unwrap();
    assert!(found.is_none());
    assert_eq!(client.transport().requests().len(), 3);
}

#[test]
fn rate_limited_get_is_retried() {
    let transport = ScriptedTransport::new()
        .reply(429, json!({ "errors": [] }))
        .reply(200, json!({ "data": [] }));
    let client = scripted_client(transport);

    assert!(client.find_machine(&credential(), &fingerprint(), "prod-1").unwrap().is_none());
    assert_eq!(client.transport().requests().len(), 2);
}

#[test]
fn exhausted_transport_failures_are_network_errors() {
    let transport = ScriptedTransport::new()
        .fail(TransportError::Timeout("slow".into()))
        .fail(TransportError::Timeout("slow".into()))
        .fail(TransportError::Timeout("slow".into()));
    let client = scripted_client(transport);

    let err = client.find_machine(&credential(), &fingerprint(), "prod-1").unwrap_err();
    assert!(matches!(err, LicenseError::Network(_)));
    assert_eq!(client.transport().requests().len(), 3);
}

#[test]
fn exhausted_server_errors_keep_the_status() {
    let transport = ScriptedTransport::new()
        .reply(502, json!({}))
        .reply(502, json!({}))
        .reply(502, json!({}));
    let client = scripted_client(transport);

    let err = client.whoami(&credential()).unwrap_err();
    assert!(matches!(err, LicenseError::Http { status: 502, .. }));
}

#[test]
fn activation_claim_is_attempted_once_on_5xx() {
    let transport = ScriptedTransport::new().reply(500, json!({}));
    let client = scripted_client(transport);

    let err = client
        .activate_machine(&credential(), &fingerprint(), "lic-1", &json!({}))
        .unwrap_err();
    assert!(matches!(err, LicenseError::Http { status: 500, .. }));
    assert_eq!(client.transport().calls(), vec!["POST /v1/accounts/acct-1/machines"]);
}

#[test]
fn token_creation_is_attempted_once() {
    let transport = ScriptedTransport::new().fail(TransportError::Connect("refused".into()));
    let client = scripted_client(transport);

    let err = client.create_token("me@example.com", "pw").unwrap_err();
    assert!(matches!(err, LicenseError::Network(_)));
    assert_eq!(client.transport().requests().len(), 1);
}

#[test]
fn client_errors_are_not_retried() {
    let transport =
        ScriptedTransport::new().reply(404, error_doc("NOT_FOUND", "Not found"));
    let client = scripted_client(transport);

    let err = client.retrieve_license(&credential(), "lic-x").unwrap_err();
    match err {
        LicenseError::Http { status, code, .. } => {
            assert_eq!(status, 404);
            assert_eq!(code.as_deref(), Some("NOT_FOUND"));
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(client.transport().requests().len(), 1);
}

#[test]
fn unauthorized_maps_from_401_and_403() {
    for status in [401, 403] {
        let transport =
            ScriptedTransport::new().reply(status, error_doc("TOKEN_INVALID", "Unauthorized"));
        let client = scripted_client(transport);
        let err = client.whoami(&credential()).unwrap_err();
        assert!(matches!(err, LicenseError::Unauthorized(_)), "{status}: {err:?}");
    }
}

// ── Typed endpoints (scripted) ──────────────────────────────────

#[test]
fn requests_carry_bearer_token() {
    let transport = ScriptedTransport::new().reply(
        200,
        json!({ "data": { "id": "u1", "type": "users",
            "attributes": { "firstName": "Ada", "lastName": "Lovelace", "email": "ada@example.com" } } }),
    );
    let client = scripted_client(transport);

    let me = client.whoami(&credential()).unwrap();
    assert_eq!(me.name.as_deref(), Some("Ada Lovelace"));
    assert_eq!(me.email.as_deref(), Some("ada@example.com"));
    assert_eq!(me.kind, "users");

    let request = &client.transport().requests()[0];
    assert_eq!(request.auth, keyseat_license::Auth::Bearer("test-token".into()));
    assert_eq!(request.url.path(), "/v1/accounts/acct-1/me");
}

#[test]
fn create_token_uses_basic_auth() {
    let transport = ScriptedTransport::new().reply(
        201,
        json!({ "data": { "id": "t1", "type": "tokens", "attributes": { "token": "prod-xyz" } } }),
    );
    let client = scripted_client(transport);

    assert_eq!(client.create_token("me@example.com", "pw").unwrap(), "prod-xyz");
    let request = &client.transport().requests()[0];
    assert!(matches!(request.auth, keyseat_license::Auth::Basic { .. }));
    assert_eq!(request.method, Method::POST);
}

#[test]
fn list_products_follows_next_links() {
    let transport = ScriptedTransport::new()
        .reply(
            200,
            json!({
                "data": [{ "id": "p1", "type": "products", "attributes": { "name": "One" } }],
                "links": { "next": "/v1/accounts/acct-1/products?page%5Bnumber%5D=2&page%5Bsize%5D=100" }
            }),
        )
        .reply(
            200,
            json!({
                "data": [{ "id": "p2", "type": "products", "attributes": { "name": "Two" } }],
                "links": { "next": null }
            }),
        );
    let client = scripted_client(transport);

    let products = client.list_products(&credential()).unwrap();
    let names: Vec<_> = products.iter().map(|p| p.name.as_str()).collect();
    assert_eq!(names, ["One", "Two"]);
    assert_eq!(client.transport().remaining(), 0);
}

#[test]
fn next_link_with_raw_brackets_verifies_against_escaped_target() {
    let transport = ScriptedTransport::new()
        .reply_signed_for(
            "/v1/accounts/acct-1/products?page%5Bsize%5D=100&page%5Bnumber%5D=1",
            200,
            json!({
                "data": [{ "id": "p1", "type": "products", "attributes": { "name": "One" } }],
                "links": { "next": "/v1/accounts/acct-1/products?page[number]=2&page[size]=100" }
            }),
        )
        .reply_signed_for(
            "/v1/accounts/acct-1/products?page%5Bnumber%5D=2&page%5Bsize%5D=100",
            200,
            json!({
                "data": [{ "id": "p2", "type": "products", "attributes": { "name": "Two" } }],
                "links": { "next": null }
            }),
        );
    let client = scripted_client(transport);

    let products = client.list_products(&credential()).unwrap();
    assert_eq!(products.len(), 2);
    assert_eq!(
        client.transport().requests()[1].target(),
        "/v1/accounts/acct-1/products?page%5Bnumber%5D=2&page%5Bsize%5D=100"
    );
}

#[test]
fn pool_status_tallies_per_product() {
    let mut bound = license_doc("l1", "K1", "prod-a");
    bound["relationships"]["machines"]["meta"]["count"] = json!(1);
    let transport = ScriptedTransport::new().reply(
        200,
        json!({ "data": [bound, license_doc("l2", "K2", "prod-a"), license_doc("l3", "K3", "prod-b")] }),
    );
    let client = scripted_client(transport);

    let status = client.pool_status(&credential()).unwrap();
    assert_eq!(status.overall.total, 3);
    assert_eq!(status.overall.activated, 1);
    assert_eq!(status.by_product["prod-a"].inactive(), 1);
    assert_eq!(status.by_product["prod-b"].activated, 0);
}

#[test]
fn find_machine_reads_license_relationship() {
    let fp = fingerprint();
    let transport = ScriptedTransport::new()
        .reply(200, json!({ "data": [machine_doc("m1", fp.as_str(), "lic-1")] }));
    let client = scripted_client(transport);

    let machine = client.find_machine(&credential(), &fp, "prod-1").unwrap().unwrap();
    assert_eq!(machine.id, "m1");
    assert_eq!(machine.license_id.as_deref(), Some("lic-1"));

    let url = &client.transport().requests()[0].url;
    let query: Vec<_> = url.query_pairs().map(|(k, v)| (k.into_owned(), v.into_owned())).collect();
    assert!(query.contains(&("fingerprint".into(), fp.as_str().into())));
    assert!(query.contains(&("product".into(), "prod-1".into())));
}

#[test]
fn invalid_validation_carries_reason() {
    let transport = ScriptedTransport::new().reply(
        200,
        json!({ "meta": { "valid": false, "code": "FINGERPRINT_SCOPE_MISMATCH", "detail": "x" }, "data": null }),
    );
    let client = scripted_client(transport);

    let validation = client.validate_key(None, "KEY", &fingerprint()).unwrap();
    assert!(!validation.valid);
    assert_eq!(validation.reason, Some(ValidationReason::WrongMachine));
    assert_eq!(client.transport().requests()[0].auth, keyseat_license::Auth::None);
}

#[test]
fn unsigned_body_is_never_parsed() {
    struct Unsigned;
    impl keyseat_license::Transport for Unsigned {
        fn send(
            &self,
            _request: &keyseat_license::ApiRequest,
        ) -> Result<keyseat_license::RawResponse, TransportError> {
            Ok(keyseat_license::RawResponse {
                status: 200,
                headers: reqwest::header::HeaderMap::new(),
                body: b"not even json".to_vec(),
                served_host: TEST_HOST.to_string(),
            })
        }
    }
    let client =
        SignedClient::with_transport(test_config(&format!("https://{TEST_HOST}")), Unsigned).unwrap();
    let err = client.whoami(&credential()).unwrap_err();
    assert!(matches!(err, LicenseError::InvalidSignature(_)));
}

// ── Real HTTP (wiremock) ────────────────────────────────────────

fn signed_template(status: u16, method: &Method, target: &str, host: &str, body: &serde_json::Value) -> ResponseTemplate {
    let bytes = serde_json::to_vec(body).unwrap();
    let mut template = ResponseTemplate::new(status);
    for (name, value) in signed_headers(method, target, host, &bytes, &http_date(0)) {
        template = template.insert_header(name.as_str(), value.as_str());
    }
    template.set_body_raw(bytes, "application/vnd.api+json")
}

fn server_host(server: &MockServer) -> String {
    let addr = server.address();
    format!("{}:{}", addr.ip(), addr.port())
}

#[test]
fn validate_key_over_http() {
    let rt = runtime();
    let server = rt.block_on(MockServer::start());
    let host = server_host(&server);
    let target = "/v1/accounts/acct-1/licenses/actions/validate-key";
    let body = json!({ "meta": { "valid": true, "code": "VALID" }, "data": null });
    rt.block_on(
        Mock::given(method("POST"))
            .and(path(target))
            .respond_with(signed_template(200, &Method::POST, target, &host, &body))
            .expect(1)
            .mount(&server),
    );

    let client = SignedClient::connect(test_config(&server.uri())).unwrap();
    let validation = client.validate_key(Some(&credential()), "KEY", &fingerprint()).unwrap();
    assert!(validation.valid);
    assert_eq!(validation.reason, None);
    rt.block_on(server.verify());
}

#[test]
fn validate_key_timeout_retries_then_network_error() {
    let rt = runtime();
    let server = rt.block_on(MockServer::start());
    rt.block_on(
        Mock::given(method("POST"))
            .and(path("/v1/accounts/acct-1/licenses/actions/validate-key"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
            .mount(&server),
    );

    let mut config = test_config(&server.uri());
    config.timeout = Duration::from_millis(200);
    let max_attempts = config.retry.max_attempts as usize;
    let client = SignedClient::connect(config).unwrap();

    let err = client.validate_key(None, "KEY", &fingerprint()).unwrap_err();
    assert!(matches!(err, LicenseError::Network(_)), "{err:?}");

    let received = rt.block_on(server.received_requests()).unwrap();
    assert_eq!(received.len(), max_attempts);
}

#[test]
fn query_filters_reach_the_server() {
    let rt = runtime();
    let server = rt.block_on(MockServer::start());
    let host = server_host(&server);
    let fp = fingerprint();
    let target = format!(
        "/v1/accounts/acct-1/machines?fingerprint={}&product=prod-1&limit=1",
        fp.as_str()
    );
    rt.block_on(
        Mock::given(method("GET"))
            .and(path("/v1/accounts/acct-1/machines"))
            .and(query_param("fingerprint", fp.as_str()))
            .and(query_param("product", "prod-1"))
            .respond_with(signed_template(200, &Method::GET, &target, &host, &json!({ "data": [] })))
            .expect(1)
            .mount(&server),
    );

    let client = SignedClient::connect(test_config(&server.uri())).unwrap();
    assert!(client.find_machine(&credential(), &fp, "prod-1").unwrap().is_none());
    rt.block_on(server.verify());
}
