//! Credential providers
//!
//! The engine asks a [`CredentialProvider`] for a connector's auth map right
//! before calling it. Secrets are expected to be decrypted already.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::transforms::Params;

/// Environment variable prefix read by [`EnvCredentials`]
pub const ENV_PREFIX: &str = "MARKETFLOW_CREDENTIALS_";

/// Source of connector auth maps
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Auth map for a connector, `None` when nothing is stored
    async fn get_credentials(&self, connector_id: &str) -> Result<Option<Params>>;
}

/// Fixed credentials, typically from the project file
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    entries: HashMap<String, Params>,
}

impl StaticCredentials {
    /// Create an empty provider
    pub fn new() -> Self {
        Self::default()
    }

    /// Add credentials for a connector
    pub fn with(mut self, connector_id: impl Into<String>, auth: Params) -> Self {
        self.entries.insert(connector_id.into(), auth);
        self
    }
}

impl From<HashMap<String, Params>> for StaticCredentials {
    fn from(entries: HashMap<String, Params>) -> Self {
        Self { entries }
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentials {
    async fn get_credentials(&self, connector_id: &str) -> Result<Option<Params>> {
        Ok(self.entries.get(connector_id).cloned())
    }
}

/// Reads `MARKETFLOW_CREDENTIALS_<CONNECTOR_ID>` holding a JSON object.
///
/// The connector id is upper-cased and anything other than ASCII letters and
/// digits becomes `_`, so `google-ads` reads `MARKETFLOW_CREDENTIALS_GOOGLE_ADS`.
#[derive(Debug, Clone, Default)]
pub struct EnvCredentials;

impl EnvCredentials {
    /// Variable name for a connector
    pub fn variable(connector_id: &str) -> String {
        let suffix: String = connector_id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect();
        format!("{}{}", ENV_PREFIX, suffix)
    }

    fn parse(variable: &str, raw: &str) -> Result<Params> {
        match serde_json::from_str::<Value>(raw) {
            Ok(Value::Object(map)) => Ok(map),
            _ => Err(Error::ConfigInvalid {
                message: format!("{} must hold a JSON object", variable),
            }),
        }
    }
}

#[async_trait]
impl CredentialProvider for EnvCredentials {
    async fn get_credentials(&self, connector_id: &str) -> Result<Option<Params>> {
        let variable = Self::variable(connector_id);
        match std::env::var(&variable) {
            Ok(raw) => Self::parse(&variable, &raw).map(Some),
            Err(_) => Ok(None),
        }
    }
}

/// Asks each provider in turn; the first hit wins
#[derive(Clone, Default)]
pub struct ChainedCredentials {
    providers: Vec<Arc<dyn CredentialProvider>>,
}

impl ChainedCredentials {
    /// Create an empty chain
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a provider
    pub fn then(mut self, provider: impl CredentialProvider + 'static) -> Self {
        self.providers.push(Arc::new(provider));
        self
    }
}

#[async_trait]
impl CredentialProvider for ChainedCredentials {
    async fn get_credentials(&self, connector_id: &str) -> Result<Option<Params>> {
        for provider in &self.providers {
            if let Some(auth) = provider.get_credentials(connector_id).await? {
                return Ok(Some(auth));
            }
        }
        Ok(None)
    }
}
