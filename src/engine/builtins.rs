//! Host builtins exposed to the policy: `totp_verify` and the internal
//! read-back `read`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use data_encoding::BASE32_NOPAD;
use hmac::{Hmac, Mac};
use regorus::Value;
use serde::Deserialize;
use sha1::Sha1;
use tokio::runtime::{Handle, RuntimeFlavor};
use tracing::warn;

use crate::errors::EngineError;
use crate::models::{AllowMap, Variable};
use crate::providers::Resolver;

type HmacSha1 = Hmac<Sha1>;

/// Per-request capability handed to the `read` builtin: the allow map, the
/// values already resolved for this request, and the resolver for a direct
/// single lookup when the batch missed a name.
#[derive(Clone)]
pub(crate) struct ReadContext {
    pub allow: AllowMap,
    pub resolved: HashMap<String, String>,
    pub variables: Vec<Variable>,
    pub resolver: Arc<Resolver>,
}

impl ReadContext {
    pub fn empty(resolver: Arc<Resolver>) -> ReadContext {
        ReadContext {
            allow: AllowMap::new(),
            resolved: HashMap::new(),
            variables: Vec::new(),
            resolver,
        }
    }
}

/// Register the builtins on a per-evaluation engine clone.
pub(crate) fn register(
    engine: &mut regorus::Engine,
    ctx: ReadContext,
) -> Result<(), EngineError> {
    engine
        .add_extension("totp_verify".to_string(), 1, Box::new(totp_verify))
        .map_err(|e| EngineError::Eval(e.to_string()))?;
    engine
        .add_extension(
            "read".to_string(),
            1,
            Box::new(move |args: Vec<Value>| read(&ctx, args)),
        )
        .map_err(|e| EngineError::Eval(e.to_string()))?;
    Ok(())
}

/// `read(name)` succeeds only for names the allow map grants `read` or
/// `internal`; anything else is undefined.
fn read(ctx: &ReadContext, args: Vec<Value>) -> anyhow::Result<Value> {
    let Some(name) = args.first().and_then(|v| v.as_string().ok()) else {
        return Ok(Value::Undefined);
    };
    let name = name.to_string();

    if !ctx.allow.contains_key(&name) {
        return Ok(Value::Undefined);
    }

    if let Some(value) = ctx.resolved.get(&name) {
        return Ok(Value::from(value.clone()));
    }

    // The name was allowed but missing from the batch; fall back to a single
    // provider lookup.
    let Ok(handle) = Handle::try_current() else {
        return Ok(Value::Undefined);
    };
    if handle.runtime_flavor() == RuntimeFlavor::CurrentThread {
        return Ok(Value::Undefined);
    }

    let result = tokio::task::block_in_place(|| {
        handle.block_on(ctx.resolver.resolve_one(&ctx.variables, &name))
    });
    match result {
        Ok(Some(value)) => Ok(Value::from(value)),
        Ok(None) => Ok(Value::Undefined),
        Err(err) => {
            warn!(error = %err, variable = %name, "read builtin failed to resolve variable");
            Ok(Value::Undefined)
        }
    }
}

#[derive(Deserialize)]
struct TotpArgs {
    secret: Option<String>,
    code: Option<String>,
    /// Nanoseconds since the epoch; defaults to now.
    time: Option<i64>,
    skew: Option<u32>,
    period: Option<u64>,
}

/// `totp_verify({secret, code, time?, skew?, period?})` — RFC 6238 with
/// HMAC-SHA1 and 6 digits. Argument errors are logged and evaluate to
/// undefined.
fn totp_verify(args: Vec<Value>) -> anyhow::Result<Value> {
    let parsed = args
        .first()
        .ok_or(())
        .and_then(|v| v.to_json_str().map_err(|_| ()))
        .and_then(|json| serde_json::from_str::<TotpArgs>(&json).map_err(|_| ()));
    let Ok(args) = parsed else {
        warn!("totp_verify: argument must be an object of {{secret, code, time?, skew?, period?}}");
        return Ok(Value::Undefined);
    };

    let (Some(secret), Some(code)) = (args.secret, args.code) else {
        warn!("totp_verify: argument `code` and `secret` must not be empty");
        return Ok(Value::Undefined);
    };
    if secret.is_empty() || code.is_empty() {
        warn!("totp_verify: argument `code` and `secret` must not be empty");
        return Ok(Value::Undefined);
    }

    let time = args.time.unwrap_or_else(now_nanos);
    let skew = args.skew.unwrap_or(1);
    let period = match args.period {
        Some(0) | None => 30,
        Some(period) => period,
    };

    Ok(Value::from(verify_totp(&secret, &code, time, skew, period)))
}

fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or_default()
}

/// Check a code against the time window `[counter - skew, counter + skew]`.
pub(crate) fn verify_totp(secret: &str, code: &str, time_ns: i64, skew: u32, period: u64) -> bool {
    let Some(key) = decode_secret(secret) else {
        warn!("totp_verify: secret is not valid base32");
        return false;
    };

    let counter = (time_ns / 1_000_000_000).max(0) as u64 / period;
    let start = counter.saturating_sub(skew as u64);
    let end = counter.saturating_add(skew as u64);
    (start..=end).any(|c| format_code(hotp(&key, c), 6) == code)
}

fn decode_secret(secret: &str) -> Option<Vec<u8>> {
    let normalized = secret.trim().trim_end_matches('=').to_ascii_uppercase();
    BASE32_NOPAD.decode(normalized.as_bytes()).ok()
}

fn hotp(secret: &[u8], counter: u64) -> u32 {
    let mut mac = match HmacSha1::new_from_slice(secret) {
        Ok(mac) => mac,
        Err(_) => return 0,
    };
    mac.update(&counter.to_be_bytes());
    let hash = mac.finalize().into_bytes();
    let offset = (hash[19] & 0x0f) as usize;
    ((hash[offset] as u32 & 0x7f) << 24)
        | ((hash[offset + 1] as u32) << 16)
        | ((hash[offset + 2] as u32) << 8)
        | (hash[offset + 3] as u32)
}

fn format_code(code: u32, digits: u32) -> String {
    format!("{:0width$}", code % 10u32.pow(digits), width = digits as usize)
}

/// The valid code for an instant, for tests that need a known-good input.
#[cfg(test)]
pub(crate) fn test_code(secret: &str, time_ns: i64, period: u64) -> String {
    let key = decode_secret(secret).expect("valid base32 secret");
    let counter = (time_ns / 1_000_000_000) as u64 / period;
    format_code(hotp(&key, counter), 6)
}
