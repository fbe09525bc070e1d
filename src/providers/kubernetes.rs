//! Cluster secret provider and the minimal in-cluster API access it needs.

use std::collections::HashMap;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::Deserialize;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use crate::errors::ProviderError;

use super::Provider;

const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

/// Credentials and endpoint of the cluster the server runs in.
pub struct InCluster {
    base: String,
    token: String,
    pub namespace: String,
    client: reqwest::Client,
}

impl InCluster {
    /// Load in-cluster credentials from the pod's service account. Returns
    /// `ProviderError::NotInCluster` when the environment is absent.
    pub fn load() -> Result<InCluster, ProviderError> {
        let host = std::env::var("KUBERNETES_SERVICE_HOST").ok();
        let port = std::env::var("KUBERNETES_SERVICE_PORT").ok();
        let (Some(host), Some(port)) = (host, port) else {
            return Err(ProviderError::NotInCluster);
        };

        let token = std::fs::read_to_string(format!("{SERVICE_ACCOUNT_DIR}/token"))
            .map_err(|_| ProviderError::NotInCluster)?;

        let ca = std::fs::read(format!("{SERVICE_ACCOUNT_DIR}/ca.crt"))?;
        let certificate = reqwest::Certificate::from_pem(&ca)?;
        let client = reqwest::Client::builder()
            .add_root_certificate(certificate)
            .build()?;

        let namespace = std::env::var("KUBERNETES_POD_NAMESPACE")
            .ok()
            .or_else(|| {
                std::fs::read_to_string(format!("{SERVICE_ACCOUNT_DIR}/namespace")).ok()
            })
            .map(|ns| ns.trim().to_string())
            .filter(|ns| !ns.is_empty())
            .unwrap_or_else(|| {
                debug!("failed to obtain current kubernetes namespace, using default");
                "default".to_string()
            });

        Ok(InCluster {
            base: format!("https://{host}:{port}"),
            token: token.trim().to_string(),
            namespace,
            client,
        })
    }

    /// GET a JSON document from the cluster API server.
    pub async fn get_json(&self, path: &str) -> Result<serde_json::Value, ProviderError> {
        let response = self
            .client
            .get(format!("{}{}", self.base, path))
            .bearer_auth(&self.token)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ProviderError::Kubernetes(format!(
                "{path} returned status code {}",
                response.status().as_u16()
            )));
        }

        Ok(response.json().await?)
    }

    /// Fetch a secret's data, base64-decoded.
    pub async fn get_secret(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<HashMap<String, Vec<u8>>, ProviderError> {
        #[derive(Deserialize)]
        struct Secret {
            #[serde(default)]
            data: HashMap<String, String>,
        }

        let path = format!("/api/v1/namespaces/{namespace}/secrets/{name}");
        let secret: Secret = serde_json::from_value(self.get_json(&path).await?)
            .map_err(|e| ProviderError::Kubernetes(e.to_string()))?;

        let mut data = HashMap::new();
        for (property, encoded) in secret.data {
            match BASE64.decode(&encoded) {
                Ok(bytes) => {
                    data.insert(property, bytes);
                }
                Err(err) => {
                    warn!(error = %err, property = %property, "failed to decode secret data");
                }
            }
        }
        Ok(data)
    }
}

/// Reads properties of cluster secrets. Ids are `namespace/secret/property`
/// or `secret/property`, defaulting to the pod's own namespace.
pub struct KubernetesSecretsProvider {
    cluster: OnceCell<InCluster>,
}

impl KubernetesSecretsProvider {
    pub fn new() -> KubernetesSecretsProvider {
        KubernetesSecretsProvider {
            cluster: OnceCell::new(),
        }
    }
}

impl Default for KubernetesSecretsProvider {
    fn default() -> Self {
        KubernetesSecretsProvider::new()
    }
}

/// Split a secret id into namespace, secret name and property.
fn parse_secret_id<'a>(
    id: &'a str,
    own_namespace: &'a str,
) -> Result<(&'a str, &'a str, &'a str), ProviderError> {
    let parts: Vec<&str> = id.split('/').collect();
    match parts.as_slice() {
        [namespace, secret, property] => Ok((namespace, secret, property)),
        [secret, property] => Ok((own_namespace, secret, property)),
        _ => Err(ProviderError::InvalidSecretId(id.to_string())),
    }
}

#[async_trait]
impl Provider for KubernetesSecretsProvider {
    async fn read(
        &self,
        requests: &HashMap<String, String>,
    ) -> Result<HashMap<String, String>, ProviderError> {
        let cluster = self
            .cluster
            .get_or_try_init(|| async { InCluster::load() })
            .await?;

        // Group requested properties per secret so each secret is fetched
        // once.
        type PropertyGroup<'a> = HashMap<&'a str, Vec<&'a str>>;
        let mut groups: HashMap<(&str, &str), PropertyGroup<'_>> = HashMap::new();
        for (variable, id) in requests {
            let (namespace, secret, property) = parse_secret_id(id, &cluster.namespace)?;
            groups
                .entry((namespace, secret))
                .or_default()
                .entry(property)
                .or_default()
                .push(variable);
        }

        let mut values = HashMap::new();
        for (&(namespace, secret), properties) in &groups {
            let data = match cluster.get_secret(namespace, secret).await {
                Ok(data) => {
                    debug!(namespace, secret, "get kubernetes secret");
                    data
                }
                Err(err) => {
                    warn!(error = %err, namespace, secret, "could not get kubernetes secret");
                    continue;
                }
            };

            for (&property, variables) in properties {
                for &variable in variables {
                    match data.get(property) {
                        Some(bytes) => {
                            values.insert(
                                variable.to_string(),
                                String::from_utf8_lossy(bytes).to_string(),
                            );
                        }
                        None => {
                            warn!(
                                namespace,
                                secret,
                                property,
                                variable,
                                "property not found in kubernetes secret"
                            );
                            values.insert(variable.to_string(), String::new());
                        }
                    }
                }
            }
        }

        Ok(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_secret_ids() {
        assert_eq!(
            parse_secret_id("ns/secret/prop", "own").unwrap(),
            ("ns", "secret", "prop")
        );
        assert_eq!(
            parse_secret_id("secret/prop", "own").unwrap(),
            ("own", "secret", "prop")
        );
        assert!(parse_secret_id("secret", "own").is_err());
        assert!(parse_secret_id("a/b/c/d", "own").is_err());
    }
}
