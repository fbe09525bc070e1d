use std::collections::HashMap;

use async_trait::async_trait;
use tracing::warn;

use crate::errors::ProviderError;

use super::Provider;

/// Reads values from files on the server's filesystem.
pub struct FileProvider;

#[async_trait]
impl Provider for FileProvider {
    async fn read(
        &self,
        requests: &HashMap<String, String>,
    ) -> Result<HashMap<String, String>, ProviderError> {
        let mut values = HashMap::new();
        for (name, path) in requests {
            match tokio::fs::read_to_string(path).await {
                Ok(content) => {
                    values.insert(name.clone(), content);
                }
                Err(err) => {
                    warn!(error = %err, variable = %name, file = %path, "failed to read file");
                }
            }
        }
        Ok(values)
    }
}
