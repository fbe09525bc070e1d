use std::collections::HashMap;

use async_trait::async_trait;

use crate::errors::ProviderError;

use super::Provider;

/// Identity provider: the backend id is the value.
pub struct StringProvider;

#[async_trait]
impl Provider for StringProvider {
    async fn read(
        &self,
        requests: &HashMap<String, String>,
    ) -> Result<HashMap<String, String>, ProviderError> {
        Ok(requests.clone())
    }
}
