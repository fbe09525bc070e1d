//! Error types and their HTTP response mapping.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Stable reason tags returned alongside authentication failures.
pub const REASON_INVALID_JWT: &str = "invalid:jwt";
pub const REASON_INVALID_KID: &str = "invalid:kid";
pub const REASON_INVALID_CLAIMS: &str = "invalid:claims";

/// Errors raised while loading the server configuration at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse configuration: {source}")]
    Parse {
        #[from]
        source: serde_yaml::Error,
    },

    #[error("failed to build http client: {source}")]
    HttpClient {
        #[source]
        source: reqwest::Error,
    },

    #[error("failed to get openid-configuration for issuer {issuer}: {source}")]
    Discovery {
        issuer: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("failed to decode openid-configuration for issuer {issuer}: {source}")]
    DiscoveryDecode {
        issuer: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("openid-configuration for issuer {issuer} has no jwks_uri")]
    MissingJwksUri { issuer: String },

    #[error("failed to get jwks from {uri}: {source}")]
    JwksFetch {
        uri: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("jwks uri {uri} returned status code {status}")]
    JwksStatus { uri: String, status: u16 },

    #[error("failed to decode jwks as json: {source}")]
    JwksDecode {
        uri: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("jwks uri {uri} returned no keys")]
    JwksEmpty { uri: String },
}

/// Claim validation failures, each with its reason tag suffix.
#[derive(Debug, Error)]
pub enum ClaimError {
    #[error("invalid token issuer")]
    Issuer,
    #[error("invalid audience claim (aud)")]
    Audience,
    #[error("token is expired (exp)")]
    Expired,
    #[error("token not valid yet (nbf)")]
    NotYetValid,
    #[error("token issued in the future (iat)")]
    IssuedInFuture,
}

impl ClaimError {
    fn suffix(&self) -> &'static str {
        match self {
            ClaimError::Issuer => ":iss",
            ClaimError::Audience => ":aud",
            ClaimError::Expired => ":exp",
            ClaimError::NotYetValid => ":nbf",
            ClaimError::IssuedInFuture => ":iat",
        }
    }
}

/// Token validation failures. Every variant maps to a 401 with a stable
/// reason tag.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Authorization header is empty")]
    MissingHeader,

    #[error("Authorization header scheme must be Bearer")]
    NotBearer,

    #[error("invalid token or algorithm")]
    Malformed,

    #[error("invalid token issuer")]
    UnknownIssuer { issuer: String },

    #[error("{message}")]
    Signature { message: String },

    #[error("{0}")]
    Claims(#[from] ClaimError),
}

impl AuthError {
    pub fn reason(&self) -> String {
        match self {
            AuthError::MissingHeader | AuthError::NotBearer | AuthError::Malformed => {
                REASON_INVALID_JWT.to_string()
            }
            AuthError::UnknownIssuer { .. } => format!("{REASON_INVALID_CLAIMS}:iss"),
            AuthError::Signature { .. } => REASON_INVALID_KID.to_string(),
            AuthError::Claims(claim) => format!("{}{}", REASON_INVALID_CLAIMS, claim.suffix()),
        }
    }
}

/// Errors raised by variable providers. A provider error fails the whole
/// batch; per-key misses are logged and dropped instead.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("not running in a kubernetes cluster")]
    NotInCluster,

    #[error("invalid kubernetes secret id: {0}")]
    InvalidSecretId(String),

    #[error("kubernetes api error: {0}")]
    Kubernetes(String),

    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by the policy engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{0}")]
    Compile(String),

    #[error("no result set")]
    NoResultSet,

    #[error("{0}")]
    Eval(String),

    #[error("failed to decode policy result: {source}")]
    Decode {
        #[from]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Provider(#[from] ProviderError),
}

/// Request-level error returned by the HTTP handlers.
#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("invalid JSON request body: {0}")]
    InvalidBody(serde_json::Error),

    #[error("request body too large")]
    BodyTooLarge,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::Auth(err) => {
                let body = json!({"error": err.to_string(), "reason": err.reason()});
                (StatusCode::UNAUTHORIZED, Json(body)).into_response()
            }
            AppError::Engine(err) => {
                let body = json!({"error": err.to_string()});
                (StatusCode::BAD_REQUEST, Json(body)).into_response()
            }
            AppError::InvalidBody(err) => {
                let body = json!({"error": format!("invalid JSON request body: {err}")});
                (StatusCode::BAD_REQUEST, Json(body)).into_response()
            }
            AppError::BodyTooLarge => {
                let body = json!({"error": "request body too large"});
                (StatusCode::BAD_REQUEST, Json(body)).into_response()
            }
        }
    }
}
