// Connection Provider
// Resolves connection names bound to tool parameters into connection objects

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("connection '{0}' not found")]
    NotFound(String),

    #[error("connection '{name}' is unavailable: {message}")]
    Unavailable { name: String, message: String },

    #[error("no connection provider configured, cannot resolve '{0}'")]
    NoProvider(String),
}

/// A resolved connection: plain configuration plus secrets
#[derive(Clone, PartialEq)]
pub struct Connection {
    pub name: String,
    pub kind: String,
    pub config: BTreeMap<String, String>,
    secrets: BTreeMap<String, String>,
}

impl Connection {
    pub fn new(name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            config: BTreeMap::new(),
            secrets: BTreeMap::new(),
        }
    }

    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }

    pub fn with_secret(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.secrets.insert(key.into(), value.into());
        self
    }

    pub fn secret(&self, key: &str) -> Option<&str> {
        self.secrets.get(key).map(String::as_str)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redacted: Vec<&String> = self.secrets.keys().collect();
        f.debug_struct("Connection")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("config", &self.config)
            .field("secrets", &redacted)
            .finish()
    }
}

/// External source of connections
#[async_trait]
pub trait ConnectionProvider: Send + Sync {
    async fn get(&self, name: &str) -> Result<Connection, ConnectionError>;
}

/// Connection provider backed by an in-memory table
#[derive(Debug, Default)]
pub struct MemoryConnectionProvider {
    connections: HashMap<String, Connection>,
}

impl MemoryConnectionProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_connection(mut self, connection: Connection) -> Self {
        self.connections.insert(connection.name.clone(), connection);
        self
    }
}

#[async_trait]
impl ConnectionProvider for MemoryConnectionProvider {
    async fn get(&self, name: &str) -> Result<Connection, ConnectionError> {
        self.connections
            .get(name)
            .cloned()
            .ok_or_else(|| ConnectionError::NotFound(name.to_string()))
    }
}

/// Per-line view of the provider: each name is fetched at most once
#[derive(Clone)]
pub struct LineConnections {
    provider: Option<Arc<dyn ConnectionProvider>>,
    resolved: Arc<Mutex<HashMap<String, Connection>>>,
}

impl LineConnections {
    pub fn new(provider: Option<Arc<dyn ConnectionProvider>>) -> Self {
        Self {
            provider,
            resolved: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn resolve(&self, name: &str) -> Result<Connection, ConnectionError> {
        let mut resolved = self.resolved.lock().await;
        if let Some(connection) = resolved.get(name) {
            return Ok(connection.clone());
        }

        let provider = self
            .provider
            .as_ref()
            .ok_or_else(|| ConnectionError::NoProvider(name.to_string()))?;
        let connection = provider.get(name).await?;
        resolved.insert(name.to_string(), connection.clone());
        Ok(connection)
    }
}
