//! Bearer-token validation gating the variables route.

use std::collections::HashSet;

use axum::extract::{Request, State};
use axum::http::header;
use axum::middleware::Next;
use axum::response::Response;
use chrono::Utc;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Header, Validation};
use tracing::warn;

use crate::config::{Configuration, Issuer};
use crate::errors::{AppError, AuthError, ClaimError};
use crate::models::JsonMap;

use super::AppState;

/// Symmetric clock-skew tolerance for time-based claims.
const LEEWAY_SECS: i64 = 60;

/// The validated identity of a request, attached as a request extension.
#[derive(Debug, Clone)]
pub struct AuthContext {
    /// Signature-verified claims.
    pub claims: JsonMap,
    /// Name of the configured issuer that signed the token.
    pub issuer: String,
}

/// Middleware: every request past this point carries a verified
/// [`AuthContext`].
pub async fn authenticate(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let authorization = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();

    match validate_token(&state.engine.configuration, &authorization) {
        Ok(auth) => {
            request.extensions_mut().insert(auth);
            Ok(next.run(request).await)
        }
        Err(err) => {
            warn!(reason = %err.reason(), error = %err, "request authentication failed");
            Err(err.into())
        }
    }
}

/// Validate a bearer token end to end: scheme, algorithm, issuer, signature,
/// claims.
pub fn validate_token(
    config: &Configuration,
    authorization: &str,
) -> Result<AuthContext, AuthError> {
    if authorization.is_empty() {
        return Err(AuthError::MissingHeader);
    }
    let token = match authorization.split_once(' ') {
        Some(("Bearer", token)) => token,
        _ => return Err(AuthError::NotBearer),
    };

    let header = decode_header(token).map_err(|_| AuthError::Malformed)?;
    if !config.algorithms.contains(&header.alg) {
        return Err(AuthError::Malformed);
    }

    // Read the issuer claim before any verification so the right key set
    // can be chosen. These claims are never used beyond the lookup.
    let preview = insecure_claims(token, header.alg)?;
    let iss = preview
        .get("iss")
        .and_then(serde_json::Value::as_str)
        .unwrap_or_default();
    let Some(issuer) = config.issuer_by_uri(iss) else {
        return Err(AuthError::UnknownIssuer {
            issuer: iss.to_string(),
        });
    };

    let claims = verify_signature(token, &header, issuer)?;
    validate_claims(&claims, issuer, &config.audience.0, Utc::now().timestamp())?;

    Ok(AuthContext {
        claims,
        issuer: issuer.name.clone(),
    })
}

/// Decode the payload without signature verification.
fn insecure_claims(token: &str, alg: Algorithm) -> Result<JsonMap, AuthError> {
    let mut validation = Validation::new(alg);
    validation.insecure_disable_signature_validation();
    validation.required_spec_claims = HashSet::new();
    validation.validate_exp = false;
    validation.validate_nbf = false;
    validation.validate_aud = false;

    let data = decode::<JsonMap>(token, &DecodingKey::from_secret(&[]), &validation)
        .map_err(|_| AuthError::Malformed)?;
    Ok(data.claims)
}

/// Verify the token signature against the issuer's JWKS, selecting the key
/// by `kid`. Claim checks are done separately so failures map to their own
/// reason tags.
fn verify_signature(
    token: &str,
    header: &Header,
    issuer: &Issuer,
) -> Result<JsonMap, AuthError> {
    let jwks = issuer.jwks.as_ref().ok_or_else(|| AuthError::Signature {
        message: format!("issuer {} has no jwks", issuer.name),
    })?;

    let kid = header.kid.as_deref().ok_or_else(|| AuthError::Signature {
        message: "token has no key id".to_string(),
    })?;
    let jwk = jwks.0.find(kid).ok_or_else(|| AuthError::Signature {
        message: format!("no key found for kid {kid}"),
    })?;
    let key = DecodingKey::from_jwk(jwk).map_err(|e| AuthError::Signature {
        message: e.to_string(),
    })?;

    let mut validation = Validation::new(header.alg);
    validation.required_spec_claims = HashSet::new();
    validation.validate_exp = false;
    validation.validate_nbf = false;
    validation.validate_aud = false;

    let data = decode::<JsonMap>(token, &key, &validation).map_err(|e| AuthError::Signature {
        message: e.to_string(),
    })?;
    Ok(data.claims)
}

/// Validate standard claims with symmetric one-minute leeway.
fn validate_claims(
    claims: &JsonMap,
    issuer: &Issuer,
    audiences: &[String],
    now: i64,
) -> Result<(), AuthError> {
    if claims.get("iss").and_then(serde_json::Value::as_str) != Some(issuer.issuer.as_str()) {
        return Err(ClaimError::Issuer.into());
    }

    let audience_ok = match claims.get("aud") {
        Some(serde_json::Value::String(aud)) => audiences.contains(aud),
        Some(serde_json::Value::Array(items)) => items
            .iter()
            .filter_map(serde_json::Value::as_str)
            .any(|aud| audiences.iter().any(|a| a == aud)),
        _ => false,
    };
    if !audience_ok {
        return Err(ClaimError::Audience.into());
    }

    let exp = numeric_claim(claims, "exp").ok_or(ClaimError::Expired)?;
    if now > exp + LEEWAY_SECS {
        return Err(ClaimError::Expired.into());
    }

    if let Some(nbf) = numeric_claim(claims, "nbf") {
        if now < nbf - LEEWAY_SECS {
            return Err(ClaimError::NotYetValid.into());
        }
    }

    if let Some(iat) = numeric_claim(claims, "iat") {
        if now < iat - LEEWAY_SECS {
            return Err(ClaimError::IssuedInFuture.into());
        }
    }

    Ok(())
}

fn numeric_claim(claims: &JsonMap, name: &str) -> Option<i64> {
    let value = claims.get(name)?;
    value.as_i64().or_else(|| value.as_f64().map(|f| f as i64))
}
