use std::collections::HashMap;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use crate::errors::ProviderError;

use super::Provider;

/// GetParameters accepts at most 10 names per call.
const BATCH_SIZE: usize = 10;

/// Reads parameters from AWS Systems Manager Parameter Store. The client is
/// built lazily from the default AWS configuration on first use.
pub struct SsmProvider {
    client: OnceCell<aws_sdk_ssm::Client>,
}

impl SsmProvider {
    pub fn new() -> SsmProvider {
        SsmProvider {
            client: OnceCell::new(),
        }
    }

    async fn client(&self) -> &aws_sdk_ssm::Client {
        self.client
            .get_or_init(|| async {
                let config = aws_config::load_defaults(BehaviorVersion::latest()).await;
                aws_sdk_ssm::Client::new(&config)
            })
            .await
    }
}

impl Default for SsmProvider {
    fn default() -> Self {
        SsmProvider::new()
    }
}

#[async_trait]
impl Provider for SsmProvider {
    async fn read(
        &self,
        requests: &HashMap<String, String>,
    ) -> Result<HashMap<String, String>, ProviderError> {
        let client = self.client().await;

        // Several variables may reference the same parameter.
        let mut names_by_param: HashMap<&str, Vec<&str>> = HashMap::new();
        for (name, param) in requests {
            names_by_param.entry(param).or_default().push(name);
        }
        let params: Vec<String> = names_by_param.keys().map(|p| p.to_string()).collect();

        let mut values = HashMap::new();
        for chunk in params.chunks(BATCH_SIZE) {
            debug!(parameters = chunk.len(), "get ssm parameters");
            let response = match client
                .get_parameters()
                .set_names(Some(chunk.to_vec()))
                .with_decryption(true)
                .send()
                .await
            {
                Ok(response) => response,
                Err(err) => {
                    warn!(error = %err, "failed to get ssm parameters");
                    continue;
                }
            };

            if !response.invalid_parameters().is_empty() {
                warn!(parameters = ?response.invalid_parameters(), "invalid ssm parameters");
            }

            for parameter in response.parameters() {
                let (Some(param), Some(value)) = (parameter.name(), parameter.value()) else {
                    continue;
                };
                for name in names_by_param.get(param).into_iter().flatten() {
                    values.insert(name.to_string(), value.to_string());
                }
            }
        }

        Ok(values)
    }
}
