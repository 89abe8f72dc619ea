//! Database credentials from a secret store.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::Deserialize;
use sqlx::postgres::PgConnectOptions;
use tracing::debug;

use crate::error::SecretError;

#[derive(Clone, PartialEq)]
pub struct DbCredentials {
    pub username: String,
    pub password: String,
    pub host: String,
    pub port: u16,
    pub database: String,
}

impl std::fmt::Debug for DbCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .finish()
    }
}

impl DbCredentials {
    pub fn connect_options(&self) -> PgConnectOptions {
        PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(&self.username)
            .password(&self.password)
            .database(&self.database)
    }
}

#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn get(&self, secret_id: &str) -> Result<DbCredentials, SecretError>;
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Port {
    Number(u16),
    Text(String),
}

#[derive(Deserialize)]
struct SecretDocument {
    username: String,
    password: String,
    host: String,
    port: Port,
    dbname: String,
}

/// Parses the JSON secret layout `{username, password, host, port, dbname}`,
/// where `port` may be a number or a string.
pub fn parse_secret(secret_id: &str, text: &str) -> Result<DbCredentials, SecretError> {
    let document: SecretDocument =
        serde_json::from_str(text).map_err(|source| SecretError::Malformed {
            id: secret_id.to_string(),
            source,
        })?;

    let port = match document.port {
        Port::Number(port) => port,
        Port::Text(text) => parse_port(secret_id, &text)?,
    };

    Ok(DbCredentials {
        username: document.username,
        password: document.password,
        host: document.host,
        port,
        database: document.dbname,
    })
}

fn parse_port(secret_id: &str, text: &str) -> Result<u16, SecretError> {
    text.trim().parse().map_err(|_| SecretError::InvalidPort {
        id: secret_id.to_string(),
        port: text.to_string(),
    })
}

/// Reads `<dir>/<secret_id>.json`, the layout of mounted container secrets.
pub struct FileSecretStore {
    dir: PathBuf,
}

impl FileSecretStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl SecretStore for FileSecretStore {
    async fn get(&self, secret_id: &str) -> Result<DbCredentials, SecretError> {
        let path = self.dir.join(format!("{secret_id}.json"));
        let text = tokio::fs::read_to_string(&path)
            .await
            .map_err(|source| SecretError::Io {
                id: secret_id.to_string(),
                source,
            })?;
        parse_secret(secret_id, &text)
    }
}

type Lookup = Box<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Credentials from the `USERNAME`, `PASSWORD`, `HOST`, `PORT` and `DB`
/// variables. The secret id is not consulted.
pub struct EnvSecretStore {
    lookup: Lookup,
}

impl EnvSecretStore {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String> + Send + Sync + 'static) -> Self {
        Self {
            lookup: Box::new(lookup),
        }
    }

    fn var(&self, name: &'static str) -> Result<String, SecretError> {
        (self.lookup)(name)
            .filter(|value| !value.trim().is_empty())
            .ok_or(SecretError::MissingVariable { name })
    }
}

#[async_trait]
impl SecretStore for EnvSecretStore {
    async fn get(&self, secret_id: &str) -> Result<DbCredentials, SecretError> {
        debug!(secret_id, "reading database credentials from the environment");
        Ok(DbCredentials {
            username: self.var("USERNAME")?,
            password: self.var("PASSWORD")?,
            host: self.var("HOST")?,
            port: parse_port(secret_id, &self.var("PORT")?)?,
            database: self.var("DB")?,
        })
    }
}
