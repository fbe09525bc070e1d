//! End-to-end tests against the real router: minted tokens, live HTTP,
//! JSON assertions.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use once_cell::sync::Lazy;
use ring::rand::SystemRandom;
use ring::signature::{EcdsaKeyPair, KeyPair, ECDSA_P256_SHA256_FIXED_SIGNING};
use serde_json::json;
use tokio::net::TcpListener;

use ezoidc::config::Jwks;
use ezoidc::models::{ErrorResponse, StringList, Variable, VariableValue, Variables, VariablesResponse};
use ezoidc::{Configuration, Engine, Issuer};

const ISSUER: &str = "http://issuer.test";
const AUDIENCE: &str = "http://audience.test";
const KID: &str = "test-key";

static KEY: Lazy<TestKey> = Lazy::new(TestKey::generate);

struct TestKey {
    pkcs8: Vec<u8>,
    jwks: String,
}

impl TestKey {
    fn generate() -> TestKey {
        let rng = SystemRandom::new();
        let document = EcdsaKeyPair::generate_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, &rng)
            .expect("generate p-256 key");
        let pair =
            EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, document.as_ref(), &rng)
                .expect("parse generated key");

        // Uncompressed point: 0x04 || x || y.
        let public = pair.public_key().as_ref();
        let jwks = json!({
            "keys": [{
                "kty": "EC",
                "crv": "P-256",
                "kid": KID,
                "use": "sig",
                "alg": "ES256",
                "x": URL_SAFE_NO_PAD.encode(&public[1..33]),
                "y": URL_SAFE_NO_PAD.encode(&public[33..65]),
            }]
        });

        TestKey {
            pkcs8: document.as_ref().to_vec(),
            jwks: jwks.to_string(),
        }
    }

    fn sign_with_kid(&self, kid: Option<&str>, claims: &serde_json::Value) -> String {
        let mut header = Header::new(Algorithm::ES256);
        header.kid = kid.map(str::to_string);
        encode(&header, claims, &EncodingKey::from_ec_der(&self.pkcs8)).expect("sign token")
    }

    fn sign(&self, claims: &serde_json::Value) -> String {
        self.sign_with_kid(Some(KID), claims)
    }
}

fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock")
        .as_secs() as i64
}

fn valid_claims() -> serde_json::Value {
    json!({
        "iss": ISSUER,
        "aud": AUDIENCE,
        "sub": "test-subject",
        "exp": now() + 300,
        "nbf": now() - 10,
        "iat": now() - 10,
    })
}

fn string_variable(name: &str, value: &str) -> Variable {
    Variable {
        name: name.to_string(),
        value: VariableValue::new("string", value),
        ..Variable::default()
    }
}

fn test_config(policy: &str, variables: Vec<Variable>) -> Configuration {
    let keys: JwkSet = serde_json::from_str(&KEY.jwks).expect("parse test jwks");
    let issuer = Issuer {
        name: "test".to_string(),
        issuer: ISSUER.to_string(),
        jwks_uri: None,
        jwks: Some(Jwks(keys)),
    };

    Configuration {
        policy: policy.to_string(),
        variables: Variables(variables),
        audience: StringList(vec![AUDIENCE.to_string()]),
        issuers: HashMap::from([("test".to_string(), issuer)]),
        algorithms: vec![Algorithm::ES256],
        ..Configuration::default()
    }
}

async fn spawn(config: Configuration) -> String {
    let engine = Arc::new(Engine::new(Arc::new(config)).expect("compile engine"));
    let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, ezoidc::app(engine)).await.unwrap() });
    format!("http://{addr}")
}

fn sorted(mut variables: Vec<Variable>) -> Vec<Variable> {
    variables.sort_by(|a, b| a.name.cmp(&b.name));
    variables
}

async fn get_variables(base: &str, token: &str) -> reqwest::Response {
    reqwest::Client::new()
        .get(format!("{base}/ezoidc/1.0/variables"))
        .bearer_auth(token)
        .send()
        .await
        .unwrap()
}

async fn post_variables(base: &str, token: &str, body: serde_json::Value) -> reqwest::Response {
    reqwest::Client::new()
        .post(format!("{base}/ezoidc/1.0/variables"))
        .bearer_auth(token)
        .json(&body)
        .send()
        .await
        .unwrap()
}

#[tokio::test]
async fn metadata_route_is_public() {
    let base = spawn(test_config("allow.read(_)", vec![])).await;

    let response = reqwest::get(format!("{base}/ezoidc/")).await.unwrap();
    assert_eq!(response.status(), 200);
    let request_id = response
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .unwrap()
        .to_string();
    assert!(!request_id.is_empty());

    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body, json!({"ezoidc": true, "api_version": "1.0"}));
}

#[tokio::test]
async fn simple_allow_round_trip() {
    let base = spawn(test_config(
        r#"allow.read("foo")"#,
        vec![string_variable("foo", "bar")],
    ))
    .await;

    let response = get_variables(&base, &KEY.sign(&valid_claims())).await;
    assert_eq!(response.status(), 200);
    assert!(response.headers().contains_key("x-request-id"));

    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(
        body,
        json!({"variables": [{"name": "foo", "value": {"string": "bar"}}]})
    );
}

#[tokio::test]
async fn params_gate_access() {
    let config = test_config(
        r#"allow.read("x") if params.k == "v""#,
        vec![string_variable("x", "1")],
    );
    let base = spawn(config).await;
    let token = KEY.sign(&valid_claims());

    let granted = post_variables(&base, &token, json!({"params": {"k": "v"}})).await;
    assert_eq!(granted.status(), 200);
    let body: VariablesResponse = granted.json().await.unwrap();
    assert_eq!(body.variables.len(), 1);
    assert_eq!(body.variables[0].name, "x");

    let denied = post_variables(&base, &token, json!({"params": {}})).await;
    assert_eq!(denied.status(), 200);
    let body: VariablesResponse = denied.json().await.unwrap();
    assert!(body.variables.is_empty());

    // The GET form carries no params.
    let get = get_variables(&base, &token).await;
    assert_eq!(get.status(), 200);
    let body: VariablesResponse = get.json().await.unwrap();
    assert!(body.variables.is_empty());
}

#[tokio::test]
async fn policy_defined_value_keeps_configured_export() {
    let config = test_config(
        r#"
allow.read(_)
define.dupe.value = "from-policy"
"#,
        vec![Variable {
            export: "VAR".to_string(),
            ..string_variable("dupe", "from-var")
        }],
    );
    let base = spawn(config).await;

    let response = get_variables(&base, &KEY.sign(&valid_claims())).await;
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(
        body,
        json!({"variables": [{
            "name": "dupe",
            "value": {"string": "from-policy"},
            "export": "VAR",
        }]})
    );
}

#[tokio::test]
async fn internal_variable_feeds_derived_value_only() {
    let config = test_config(
        r#"
allow.read("derived")
allow.internal("secret")
define.derived.value = read("secret")
"#,
        vec![string_variable("secret", "s3cr")],
    );
    let base = spawn(config).await;

    let response = get_variables(&base, &KEY.sign(&valid_claims())).await;
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(
        body,
        json!({"variables": [{"name": "derived", "value": {"string": "s3cr"}}]})
    );
}

#[tokio::test]
async fn redact_flag_propagates() {
    let config = test_config(
        "allow.read(_)",
        vec![Variable {
            redact: Some(true),
            ..string_variable("secret", "v")
        }],
    );
    let base = spawn(config).await;

    let response = get_variables(&base, &KEY.sign(&valid_claims())).await;
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(
        body,
        json!({"variables": [{
            "name": "secret",
            "value": {"string": "v"},
            "redact": true,
        }]})
    );
}

#[tokio::test]
async fn unknown_provider_is_silently_dropped() {
    let config = test_config(
        "allow.read(_)",
        vec![
            Variable {
                name: "ghost".to_string(),
                value: VariableValue::new("does-not-exist", "id"),
                ..Variable::default()
            },
            string_variable("real", "v"),
        ],
    );
    let base = spawn(config).await;

    let response = get_variables(&base, &KEY.sign(&valid_claims())).await;
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(
        body,
        json!({"variables": [{"name": "real", "value": {"string": "v"}}]})
    );
}

#[tokio::test]
async fn repeated_requests_are_idempotent() {
    let config = test_config(
        "allow.read(_)",
        vec![
            string_variable("a", "1"),
            string_variable("b", "2"),
            string_variable("c", "3"),
        ],
    );
    let base = spawn(config).await;
    let token = KEY.sign(&valid_claims());

    let first: VariablesResponse = get_variables(&base, &token).await.json().await.unwrap();
    let second: VariablesResponse = get_variables(&base, &token).await.json().await.unwrap();
    assert_eq!(sorted(first.variables), sorted(second.variables));
}

#[tokio::test]
async fn expired_token_is_rejected() {
    let base = spawn(test_config("allow.read(_)", vec![])).await;

    let mut claims = valid_claims();
    claims["exp"] = (now() - 120).into();

    let response = get_variables(&base, &KEY.sign(&claims)).await;
    assert_eq!(response.status(), 401);
    let body: ErrorResponse = response.json().await.unwrap();
    assert_eq!(body.reason.as_deref(), Some("invalid:claims:exp"));
    assert!(body.error.contains("expired"));
}

#[tokio::test]
async fn expiry_within_leeway_is_accepted() {
    let base = spawn(test_config("allow.read(_)", vec![])).await;

    let mut claims = valid_claims();
    claims["exp"] = (now() - 30).into();

    let response = get_variables(&base, &KEY.sign(&claims)).await;
    assert_eq!(response.status(), 200);
}

#[tokio::test]
async fn auth_failures_carry_stable_reasons() {
    let base = spawn(test_config("allow.read(_)", vec![])).await;
    let client = reqwest::Client::new();
    let url = format!("{base}/ezoidc/1.0/variables");

    // Missing header.
    let response = client.get(&url).send().await.unwrap();
    assert_eq!(response.status(), 401);
    let body: ErrorResponse = response.json().await.unwrap();
    assert_eq!(body.reason.as_deref(), Some("invalid:jwt"));
    assert_eq!(body.error, "Authorization header is empty");

    // Wrong scheme.
    let response = client
        .get(&url)
        .header("Authorization", "Basic dXNlcjpwYXNz")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);
    let body: ErrorResponse = response.json().await.unwrap();
    assert_eq!(body.reason.as_deref(), Some("invalid:jwt"));
    assert_eq!(body.error, "Authorization header scheme must be Bearer");

    // Not a token at all.
    let response = get_variables(&base, "garbage").await;
    assert_eq!(response.status(), 401);
    let body: ErrorResponse = response.json().await.unwrap();
    assert_eq!(body.reason.as_deref(), Some("invalid:jwt"));

    // Unknown issuer.
    let mut claims = valid_claims();
    claims["iss"] = "http://unknown.test".into();
    let response = get_variables(&base, &KEY.sign(&claims)).await;
    assert_eq!(response.status(), 401);
    let body: ErrorResponse = response.json().await.unwrap();
    assert_eq!(body.reason.as_deref(), Some("invalid:claims:iss"));

    // Unknown key id.
    let response =
        get_variables(&base, &KEY.sign_with_kid(Some("unknown"), &valid_claims())).await;
    assert_eq!(response.status(), 401);
    let body: ErrorResponse = response.json().await.unwrap();
    assert_eq!(body.reason.as_deref(), Some("invalid:kid"));

    // Missing key id.
    let response = get_variables(&base, &KEY.sign_with_kid(None, &valid_claims())).await;
    assert_eq!(response.status(), 401);
    let body: ErrorResponse = response.json().await.unwrap();
    assert_eq!(body.reason.as_deref(), Some("invalid:kid"));

    // Wrong audience.
    let mut claims = valid_claims();
    claims["aud"] = "http://wrong.test".into();
    let response = get_variables(&base, &KEY.sign(&claims)).await;
    assert_eq!(response.status(), 401);
    let body: ErrorResponse = response.json().await.unwrap();
    assert_eq!(body.reason.as_deref(), Some("invalid:claims:aud"));

    // Not valid yet.
    let mut claims = valid_claims();
    claims["nbf"] = (now() + 120).into();
    let response = get_variables(&base, &KEY.sign(&claims)).await;
    assert_eq!(response.status(), 401);
    let body: ErrorResponse = response.json().await.unwrap();
    assert_eq!(body.reason.as_deref(), Some("invalid:claims:nbf"));

    // Issued in the future.
    let mut claims = valid_claims();
    claims["iat"] = (now() + 120).into();
    let response = get_variables(&base, &KEY.sign(&claims)).await;
    assert_eq!(response.status(), 401);
    let body: ErrorResponse = response.json().await.unwrap();
    assert_eq!(body.reason.as_deref(), Some("invalid:claims:iat"));
}

#[tokio::test]
async fn disallowed_algorithm_is_rejected() {
    let mut config = test_config("allow.read(_)", vec![]);
    config.algorithms = vec![Algorithm::RS256];
    let base = spawn(config).await;

    let response = get_variables(&base, &KEY.sign(&valid_claims())).await;
    assert_eq!(response.status(), 401);
    let body: ErrorResponse = response.json().await.unwrap();
    assert_eq!(body.reason.as_deref(), Some("invalid:jwt"));
    assert_eq!(body.error, "invalid token or algorithm");
}

#[tokio::test]
async fn oversized_body_is_rejected_before_evaluation() {
    let base = spawn(test_config("allow.read(_)", vec![])).await;

    let response = reqwest::Client::new()
        .post(format!("{base}/ezoidc/1.0/variables"))
        .bearer_auth(KEY.sign(&valid_claims()))
        .header("Content-Type", "application/json")
        .body(vec![b' '; 80 * 1024])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    let body: ErrorResponse = response.json().await.unwrap();
    assert_eq!(body.error, "request body too large");
}

#[tokio::test]
async fn invalid_json_body_is_rejected() {
    let base = spawn(test_config("allow.read(_)", vec![])).await;

    let response = reqwest::Client::new()
        .post(format!("{base}/ezoidc/1.0/variables"))
        .bearer_auth(KEY.sign(&valid_claims()))
        .header("Content-Type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    let body: ErrorResponse = response.json().await.unwrap();
    assert!(body.error.starts_with("invalid JSON request body"));
}

#[tokio::test]
async fn issuer_binding_is_visible_to_the_policy() {
    let config = test_config(
        r#"allow.read("x") if issuer == "test""#,
        vec![string_variable("x", "1")],
    );
    let base = spawn(config).await;

    let response = get_variables(&base, &KEY.sign(&valid_claims())).await;
    assert_eq!(response.status(), 200);
    let body: VariablesResponse = response.json().await.unwrap();
    assert_eq!(body.variables.len(), 1);
}
