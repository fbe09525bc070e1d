//! Server configuration: YAML ingest, defaults and JWKS preloading.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::Algorithm;
use serde::de::{self, Deserializer};
use serde::Deserialize;
use tracing::{debug, error};

use crate::errors::{ConfigError, ProviderError};
use crate::models::{StringList, Variables};
use crate::providers::kubernetes::InCluster;

/// Timeout for outgoing requests to issuer endpoints.
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

const DEFAULT_PORT: &str = "3501";

/// Server configuration, immutable once the server is running.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Configuration {
    /// Policy used to control access to variables.
    #[serde(default)]
    pub policy: String,
    /// Variables available to the policy.
    #[serde(default)]
    pub variables: Variables,
    /// Audiences to accept.
    #[serde(default)]
    pub audience: StringList,
    /// Allowed OIDC issuers.
    #[serde(default)]
    pub issuers: HashMap<String, Issuer>,
    /// Permitted JWT signature algorithms.
    #[serde(default)]
    pub algorithms: Vec<Algorithm>,
    /// IP address and port to listen on.
    #[serde(default, rename = "host")]
    pub listen: String,
    /// Log level (debug, info, warn, error).
    #[serde(default)]
    pub log_level: String,
}

/// A trusted OIDC issuer.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Issuer {
    /// Name of the issuer, as exposed to the policy. Set from the
    /// configuration key.
    #[serde(skip)]
    pub name: String,
    /// The issuer URI, matched exactly against the `iss` claim.
    #[serde(default)]
    pub issuer: String,
    /// Where to obtain the JWKS from.
    #[serde(default)]
    pub jwks_uri: Option<String>,
    /// Embedded JWKS content.
    #[serde(default)]
    pub jwks: Option<Jwks>,
}

/// A JWKS embedded in the configuration as a JSON string.
#[derive(Debug, Clone)]
pub struct Jwks(pub JwkSet);

impl<'de> Deserialize<'de> for Jwks {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct JwksVisitor;

        impl de::Visitor<'_> for JwksVisitor {
            type Value = Jwks;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a string containing JWKS JSON")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
                let keys: JwkSet = serde_json::from_str(v)
                    .map_err(|e| de::Error::custom(format!("failed to unmarshal JWKS: {e}")))?;
                Ok(Jwks(keys))
            }
        }

        deserializer.deserialize_str(JwksVisitor)
    }
}

impl Configuration {
    /// Load a YAML configuration file and apply defaults.
    pub fn load(path: &str) -> Result<Configuration, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        Configuration::parse(&content)
    }

    /// Parse a YAML configuration document and apply defaults.
    pub fn parse(content: &str) -> Result<Configuration, ConfigError> {
        let mut config: Configuration = serde_yaml::from_str(content)?;

        if config.algorithms.is_empty() {
            config.algorithms = vec![Algorithm::RS256, Algorithm::ES256];
        }

        if config.listen.is_empty() {
            let port = std::env::var("PORT").unwrap_or_else(|_| DEFAULT_PORT.to_string());
            config.listen = format!("0.0.0.0:{port}");
        }

        if config.log_level.is_empty() {
            config.log_level = "info".to_string();
        }

        for (name, issuer) in &mut config.issuers {
            issuer.name = name.clone();
        }

        Ok(config)
    }

    /// Find the configured issuer whose URI matches the `iss` claim.
    pub fn issuer_by_uri(&self, uri: &str) -> Option<&Issuer> {
        self.issuers.values().find(|issuer| issuer.issuer == uri)
    }

    /// Resolve the JWKS of every configured issuer, then probe for an
    /// implicit in-cluster issuer. Must complete before the first request.
    pub async fn preload_jwks(&mut self) -> Result<(), ConfigError> {
        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|source| ConfigError::HttpClient { source })?;

        for (name, issuer) in &mut self.issuers {
            issuer.name = name.clone();
            issuer.load_jwks(&client).await?;
        }

        self.detect_k8s().await;
        Ok(())
    }

    /// Register the workload orchestrator's own issuer as `k8s` when running
    /// inside a cluster. Never fails startup.
    async fn detect_k8s(&mut self) {
        if self.issuers.contains_key("k8s") {
            return;
        }

        let cluster = match InCluster::load() {
            Ok(cluster) => cluster,
            Err(ProviderError::NotInCluster) => return,
            Err(err) => {
                error!(error = %err, "failed to load k8s issuer");
                return;
            }
        };

        match k8s_issuer(&cluster).await {
            Ok(issuer) => {
                debug!(issuer = %issuer.issuer, "loaded k8s issuer");
                self.issuers.insert("k8s".to_string(), issuer);
            }
            Err(err) => error!(error = %err, "failed to load k8s issuer"),
        }
    }
}

#[derive(Deserialize)]
struct OidcDiscovery {
    #[serde(default)]
    issuer: String,
    #[serde(default)]
    jwks_uri: String,
}

async fn k8s_issuer(cluster: &InCluster) -> Result<Issuer, ProviderError> {
    let discovery: OidcDiscovery = serde_json::from_value(
        cluster.get_json("/.well-known/openid-configuration").await?,
    )
    .map_err(|e| ProviderError::Kubernetes(e.to_string()))?;

    let keys: JwkSet = serde_json::from_value(cluster.get_json("/openid/v1/jwks").await?)
        .map_err(|e| ProviderError::Kubernetes(format!("failed to unmarshal k8s jwks: {e}")))?;

    Ok(Issuer {
        name: "k8s".to_string(),
        issuer: discovery.issuer,
        jwks_uri: Some(discovery.jwks_uri),
        jwks: Some(Jwks(keys)),
    })
}

impl Issuer {
    /// Resolve this issuer's JWKS using OIDC discovery or the configured
    /// JWKS URI. Embedded key sets are used as-is.
    pub async fn load_jwks(&mut self, client: &reqwest::Client) -> Result<(), ConfigError> {
        if self.jwks_uri.is_none() && self.jwks.is_none() {
            let url = format!("{}/.well-known/openid-configuration", self.issuer);
            let response =
                client
                    .get(&url)
                    .send()
                    .await
                    .map_err(|source| ConfigError::Discovery {
                        issuer: self.issuer.clone(),
                        source,
                    })?;
            let discovery: OidcDiscovery =
                response
                    .json()
                    .await
                    .map_err(|source| ConfigError::DiscoveryDecode {
                        issuer: self.issuer.clone(),
                        source,
                    })?;
            if discovery.jwks_uri.is_empty() {
                return Err(ConfigError::MissingJwksUri {
                    issuer: self.issuer.clone(),
                });
            }
            debug!(issuer = %self.issuer, jwks_uri = %discovery.jwks_uri, "discovered jwks_uri of issuer");
            self.jwks_uri = Some(discovery.jwks_uri);
        }

        if self.jwks.is_some() {
            return Ok(());
        }

        let uri = self.jwks_uri.clone().unwrap_or_default();
        let response = client
            .get(&uri)
            .send()
            .await
            .map_err(|source| ConfigError::JwksFetch {
                uri: uri.clone(),
                source,
            })?;

        if response.status() != reqwest::StatusCode::OK {
            return Err(ConfigError::JwksStatus {
                uri,
                status: response.status().as_u16(),
            });
        }

        let keys: JwkSet = response
            .json()
            .await
            .map_err(|source| ConfigError::JwksDecode {
                uri: uri.clone(),
                source,
            })?;

        if keys.keys.is_empty() {
            return Err(ConfigError::JwksEmpty { uri });
        }

        debug!(issuer = %self.issuer, keys = keys.keys.len(), "loaded jwks of issuer");
        self.jwks = Some(Jwks(keys));
        Ok(())
    }
}
