use std::collections::HashMap;

use async_trait::async_trait;
use tracing::warn;

use crate::errors::ProviderError;

use super::Provider;

/// Reads values from the server's environment.
pub struct EnvProvider;

#[async_trait]
impl Provider for EnvProvider {
    async fn read(
        &self,
        requests: &HashMap<String, String>,
    ) -> Result<HashMap<String, String>, ProviderError> {
        let mut values = HashMap::new();
        for (name, env) in requests {
            let value = std::env::var(env).unwrap_or_default();
            if value.is_empty() {
                warn!(variable = %name, env = %env, "env variable is empty");
            }
            values.insert(name.clone(), value);
        }
        Ok(values)
    }
}
