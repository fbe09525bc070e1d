//! Policy engine: compiles the built-in prelude together with the user
//! policy, then answers the two per-request queries.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use regorus::Value;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::Configuration;
use crate::errors::EngineError;
use crate::models::{AllowMap, JsonMap, Variable};
use crate::providers::Resolver;

mod builtins;

use builtins::ReadContext;

pub const QUERY_ALLOW_VARIABLES: &str = "allow_variables";
pub const QUERY_VARIABLES_RESPONSE: &str = "variables_response";

/// Built-in portion of the policy module, shipped with the binary.
static PRELUDE: &str = include_str!("prelude.rego");

/// The policy engine. Compiled once at startup; evaluation clones the
/// prepared evaluator, so one engine serves concurrent requests.
pub struct Engine {
    pub configuration: Arc<Configuration>,
    pub resolver: Arc<Resolver>,
    /// Variable names defined by the policy itself.
    pub definitions: Vec<String>,
    base: regorus::Engine,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine").finish_non_exhaustive()
    }
}

/// Claims and params of one request.
#[derive(Debug, Clone, Default)]
pub struct ReadRequest {
    pub claims: Option<JsonMap>,
    pub params: Option<JsonMap>,
}

/// Outcome of the two-phase evaluation.
#[derive(Debug, Serialize)]
pub struct ReadResponse {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub variables: Vec<Variable>,
    pub allowed: AllowMap,
}

#[derive(Serialize)]
struct EngineInput<'a> {
    query: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    variables: Option<&'a [Variable]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    claims: Option<&'a JsonMap>,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<&'a JsonMap>,
    #[serde(skip_serializing_if = "Option::is_none")]
    allow: Option<&'a AllowMap>,
}

impl Engine {
    /// Compile an engine with the default provider set.
    pub fn new(configuration: Arc<Configuration>) -> Result<Engine, EngineError> {
        Engine::with_resolver(configuration, Arc::new(Resolver::with_default_providers()))
    }

    /// Compile the prelude and the configured policy into a prepared
    /// evaluator, extract policy-defined variable names, and attach the
    /// compile-time data document.
    pub fn with_resolver(
        configuration: Arc<Configuration>,
        resolver: Arc<Resolver>,
    ) -> Result<Engine, EngineError> {
        let definitions = scan_definitions(&configuration.policy)?;

        let mut base = regorus::Engine::new();
        base.set_rego_v1(true);
        base.add_policy("ezoidc.rego".to_string(), PRELUDE.to_string())
            .map_err(|e| EngineError::Compile(e.to_string()))?;
        base.add_policy(
            "policy.rego".to_string(),
            format!("package ezoidc\n{}", configuration.policy),
        )
        .map_err(|e| EngineError::Compile(e.to_string()))?;

        let mut variable_names = definitions.clone();
        variable_names.extend(configuration.variables.iter().map(|v| v.name.clone()));

        let issuers: HashMap<&str, serde_json::Value> = configuration
            .issuers
            .values()
            .map(|i| (i.name.as_str(), serde_json::json!({"issuer": i.issuer})))
            .collect();
        let data = serde_json::json!({
            "issuers": issuers,
            "variable_names": variable_names,
            "version": env!("CARGO_PKG_VERSION"),
        });
        base.add_data(
            Value::from_json_str(&data.to_string())
                .map_err(|e| EngineError::Compile(e.to_string()))?,
        )
        .map_err(|e| EngineError::Compile(e.to_string()))?;

        let engine = Engine {
            configuration,
            resolver,
            definitions,
            base,
        };

        // Probe the allow query so policy errors abort startup instead of
        // the first request.
        engine
            .eval::<AllowMap>(
                &EngineInput {
                    query: QUERY_ALLOW_VARIABLES,
                    variables: None,
                    claims: None,
                    params: None,
                    allow: None,
                },
                ReadContext::empty(engine.resolver.clone()),
            )
            .map_err(|e| EngineError::Compile(e.to_string()))?;

        Ok(engine)
    }

    /// Determine the variables the caller may see, and at what scope.
    pub fn allowed_variables(&self, request: &ReadRequest) -> Result<AllowMap, EngineError> {
        let input = EngineInput {
            query: QUERY_ALLOW_VARIABLES,
            variables: None,
            claims: request.claims.as_ref(),
            params: request.params.as_ref(),
            allow: None,
        };
        self.eval(&input, ReadContext::empty(self.resolver.clone()))
    }

    /// Two-phase evaluation: discover the allow set, resolve the allowed
    /// declared variables, then shape the response through the policy.
    pub async fn read_variables(&self, request: &ReadRequest) -> Result<ReadResponse, EngineError> {
        let allowed = self.allowed_variables(request)?;

        let selected: Vec<Variable> = self
            .configuration
            .variables
            .iter()
            .filter(|v| allowed.contains_key(&v.name))
            .cloned()
            .collect();

        let resolved = self.resolver.resolve(&selected).await?;

        let ctx = ReadContext {
            allow: allowed.clone(),
            resolved: resolved
                .iter()
                .map(|v| (v.name.clone(), v.value.string.clone()))
                .collect(),
            variables: self.configuration.variables.0.clone(),
            resolver: self.resolver.clone(),
        };

        let input = EngineInput {
            query: QUERY_VARIABLES_RESPONSE,
            variables: Some(&resolved),
            claims: request.claims.as_ref(),
            params: request.params.as_ref(),
            allow: Some(&allowed),
        };
        let variables: Vec<Variable> = self.eval(&input, ctx)?;

        // The policy emits plain values; clear any provider reference the
        // decoder reconstructed so responses carry strings only.
        let variables = variables
            .into_iter()
            .map(|variable| {
                let value = variable.value.string.clone();
                variable.resolve(value)
            })
            .collect();

        Ok(ReadResponse {
            variables,
            allowed,
        })
    }

    fn eval<T: DeserializeOwned>(
        &self,
        input: &EngineInput<'_>,
        ctx: ReadContext,
    ) -> Result<T, EngineError> {
        let mut rego = self.base.clone();
        builtins::register(&mut rego, ctx)?;
        rego.set_gather_prints(true);

        let encoded = serde_json::to_string(input)?;
        rego.set_input(
            Value::from_json_str(&encoded).map_err(|e| EngineError::Eval(e.to_string()))?,
        );

        let result = rego.eval_rule("data.ezoidc._queries".to_string());

        // Route print output even when evaluation failed.
        if let Ok(prints) = rego.take_prints() {
            for line in prints {
                log_print(&line);
            }
        }

        let value = result.map_err(|e| EngineError::Eval(e.to_string()))?;
        let json: serde_json::Value = serde_json::from_str(
            &value
                .to_json_str()
                .map_err(|e| EngineError::Eval(e.to_string()))?,
        )?;
        let output = json.get(input.query).ok_or(EngineError::NoResultSet)?;
        Ok(serde_json::from_value(output.clone())?)
    }
}

static DEFINE_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^define\.([A-Za-z_][A-Za-z0-9_]*)").expect("define name pattern"));
static DEFINE_BRACKET: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"^define\[\s*"([^"]+)"\s*\]"#).expect("define bracket pattern"));

/// Extract the names of policy-defined variables from top-level
/// `define.<name>` rule heads. Names must be scalar literals so the
/// compile-time variable universe stays closed.
fn scan_definitions(policy: &str) -> Result<Vec<String>, EngineError> {
    let mut names = BTreeSet::new();
    for (index, raw) in policy.lines().enumerate() {
        let line = raw.trim_start();
        if let Some(captures) = DEFINE_NAME.captures(line) {
            names.insert(captures[1].to_string());
        } else if line.starts_with("define[") {
            match DEFINE_BRACKET.captures(line) {
                Some(captures) => {
                    names.insert(captures[1].to_string());
                }
                None => {
                    // The user policy is compiled below a one-line package
                    // header, so reported lines are offset by one.
                    return Err(EngineError::Compile(format!(
                        "policy.rego:{}: defined variable names must be a scalar",
                        index + 2
                    )));
                }
            }
        }
    }
    Ok(names.into_iter().collect())
}

/// Route a gathered print line to the log. A `level: ` prefix on the message
/// selects the level; the default is debug.
fn log_print(line: &str) {
    static LOCATION: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"^(\S+:\d+):\s*(.*)$").expect("print location pattern"));

    let (location, message) = match LOCATION.captures(line) {
        Some(captures) => (
            captures.get(1).map(|m| m.as_str()).unwrap_or_default(),
            captures.get(2).map(|m| m.as_str()).unwrap_or_default(),
        ),
        None => ("", line),
    };

    let (level, message) = split_level(message);
    match level {
        "info" => info!(location, "{message}"),
        "warn" => warn!(location, "{message}"),
        "error" => error!(location, "{message}"),
        _ => debug!(location, "{message}"),
    }
}

/// Split a recognized level token off the front of a print message.
fn split_level(message: &str) -> (&str, &str) {
    if let Some((level, rest)) = message.split_once(": ") {
        if matches!(level, "debug" | "info" | "warn" | "error") {
            return (level, rest);
        }
    }
    ("debug", message)
}
