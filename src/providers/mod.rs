//! Variable providers and the resolver that batches reads across them.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::errors::ProviderError;
use crate::models::Variable;

mod aws_ssm;
mod env;
mod file;
pub mod kubernetes;
mod string;

pub use aws_ssm::SsmProvider;
pub use env::EnvProvider;
pub use file::FileProvider;
pub use kubernetes::KubernetesSecretsProvider;
pub use string::StringProvider;

/// A backend able to materialize values for a batch of variables.
///
/// `requests` maps caller-chosen names to backend-specific identifiers; the
/// result maps those names back to values. Missing keys may be omitted, but
/// a single missing key must not fail the whole batch.
#[async_trait]
pub trait Provider: Send + Sync {
    async fn read(
        &self,
        requests: &HashMap<String, String>,
    ) -> Result<HashMap<String, String>, ProviderError>;
}

/// Registry of providers keyed by provider-kind tag.
#[derive(Default)]
pub struct Resolver {
    providers: HashMap<String, Arc<dyn Provider>>,
}

impl Resolver {
    pub fn new() -> Resolver {
        Resolver::default()
    }

    /// A resolver with every built-in provider registered.
    pub fn with_default_providers() -> Resolver {
        let mut resolver = Resolver::new();
        resolver.add("string", Arc::new(StringProvider));
        resolver.add("env", Arc::new(EnvProvider));
        resolver.add("file", Arc::new(FileProvider));
        resolver.add("aws.ssm", Arc::new(SsmProvider::new()));
        resolver.add("kubernetes.secret", Arc::new(KubernetesSecretsProvider::new()));
        resolver
    }

    pub fn add(&mut self, id: impl Into<String>, provider: Arc<dyn Provider>) {
        self.providers.insert(id.into(), provider);
    }

    /// Resolve a batch of declared variables, invoking each provider once.
    ///
    /// Variables with an unknown provider kind are dropped with a warning.
    /// Names a provider did not return are absent from the output.
    pub async fn resolve(&self, variables: &[Variable]) -> Result<Vec<Variable>, ProviderError> {
        let mut batches: HashMap<&str, HashMap<String, String>> = HashMap::new();
        let mut by_name: HashMap<&str, &Variable> = HashMap::new();

        for variable in variables {
            let kind = variable.value.provider.as_str();
            if !self.providers.contains_key(kind) {
                warn!(
                    provider = kind,
                    id = %variable.value.id,
                    "unknown variable provider"
                );
                continue;
            }
            batches
                .entry(kind)
                .or_default()
                .insert(variable.name.clone(), variable.value.id.clone());
            by_name.insert(variable.name.as_str(), variable);
        }

        let mut resolved = Vec::with_capacity(variables.len());
        for (kind, requests) in &batches {
            let provider = &self.providers[*kind];
            let values = provider.read(requests).await?;
            for (name, value) in values {
                if let Some(variable) = by_name.get(name.as_str()) {
                    resolved.push((*variable).clone().resolve(value));
                }
            }
        }

        Ok(resolved)
    }

    /// Resolve a single declared variable by name, for the policy's internal
    /// read-back. Returns `None` when the name is not declared or the
    /// provider did not return it.
    pub async fn resolve_one(
        &self,
        variables: &[Variable],
        name: &str,
    ) -> Result<Option<String>, ProviderError> {
        let Some(variable) = variables.iter().find(|v| v.name == name) else {
            return Ok(None);
        };
        let Some(provider) = self.providers.get(variable.value.provider.as_str()) else {
            warn!(
                provider = %variable.value.provider,
                id = %variable.value.id,
                "unknown variable provider"
            );
            return Ok(None);
        };

        let mut requests = HashMap::new();
        requests.insert(variable.name.clone(), variable.value.id.clone());
        let mut values = provider.read(&requests).await?;
        Ok(values.remove(name))
    }
}
