//! Credential loading from environment variables or a TOML file.
//!
//! Environment variables win over file values so a checked-in file can be
//! overridden per shell.

use crate::auth::Grant;
use crate::error::{Result, VaasError};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Production websocket gateway
pub const DEFAULT_VAAS_URL: &str = "wss://gateway.production.vaas.gdatasecurity.de";

/// Production OpenID Connect token endpoint
pub const DEFAULT_TOKEN_URL: &str =
    "https://account.gdata.de/realms/vaas-production/protocol/openid-connect/token";

#[derive(Clone, Default, Deserialize)]
#[serde(default)]
pub struct Credentials {
    pub vaas_url: Option<String>,
    pub token_url: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub user_name: Option<String>,
    pub password: Option<String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("vaas_url", &self.vaas_url)
            .field("token_url", &self.token_url)
            .field("client_id", &self.client_id)
            .field("client_secret", &self.client_secret.as_ref().map(|_| "<redacted>"))
            .field("user_name", &self.user_name)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl Credentials {
    /// Default file location (`~/.config/vaas/credentials.toml`)
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("vaas").join("credentials.toml"))
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        toml::from_str(&text)
            .map_err(|e| VaasError::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn from_env() -> Self {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());
        Self {
            vaas_url: var("VAAS_URL"),
            token_url: var("TOKEN_URL"),
            client_id: var("CLIENT_ID"),
            client_secret: var("CLIENT_SECRET"),
            user_name: var("VAAS_USER_NAME"),
            password: var("VAAS_PASSWORD"),
        }
    }

    /// Load `path` (or the default file when it exists), then apply env overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let base = match path {
            Some(path) => Self::from_file(path)?,
            None => match Self::default_path() {
                Some(path) if path.exists() => Self::from_file(&path)?,
                _ => Self::default(),
            },
        };
        Ok(base.merge(Self::from_env()))
    }

    /// Fields set in `other` replace ours.
    pub fn merge(self, other: Self) -> Self {
        Self {
            vaas_url: other.vaas_url.or(self.vaas_url),
            token_url: other.token_url.or(self.token_url),
            client_id: other.client_id.or(self.client_id),
            client_secret: other.client_secret.or(self.client_secret),
            user_name: other.user_name.or(self.user_name),
            password: other.password.or(self.password),
        }
    }

    pub fn vaas_url(&self) -> &str {
        self.vaas_url.as_deref().unwrap_or(DEFAULT_VAAS_URL)
    }

    pub fn token_url(&self) -> &str {
        self.token_url.as_deref().unwrap_or(DEFAULT_TOKEN_URL)
    }

    /// Pick the OAuth grant: a client secret selects client credentials,
    /// otherwise user name and password select the password grant.
    pub fn grant(&self) -> Result<Grant> {
        let client_id = self
            .client_id
            .clone()
            .ok_or_else(|| VaasError::Config("CLIENT_ID is not set".to_string()))?;

        if let Some(client_secret) = &self.client_secret {
            return Ok(Grant::ClientCredentials {
                client_id,
                client_secret: client_secret.clone(),
            });
        }

        match (&self.user_name, &self.password) {
            (Some(user_name), Some(password)) => Ok(Grant::Password {
                client_id,
                user_name: user_name.clone(),
                password: password.clone(),
            }),
            _ => Err(VaasError::Config(
                "either CLIENT_SECRET or VAAS_USER_NAME and VAAS_PASSWORD must be set".to_string(),
            )),
        }
    }
}
