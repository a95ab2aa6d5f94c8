use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use url::Url;

use crate::error::ConfigError;

pub const ENCRYPTED_PREFIX: &str = "__SYSTEMENCRYPTED__";

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    pub listen_addr: String,
    pub host_name: String,
    // empty: stderr
    pub log: String,
    pub log_level: String,
    pub fallback_smtp_user: String,
    pub fallback_smtp_pass: String,
    pub save_to_sent: bool,
    pub read_timeout_secs: u64,
    pub http_timeout_secs: u64,
    pub max_message_bytes: usize,
    pub oauth2: OAuth2Config,
    pub graph: GraphConfig,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct OAuth2Config {
    pub client_id: String,
    pub client_secret: String,
    pub tenant_id: String,
    pub scopes: Vec<String>,
    pub authority: String,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    pub endpoint: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:25".to_string(),
            host_name: "smtpRelay".to_string(),
            log: String::new(),
            log_level: "info".to_string(),
            fallback_smtp_user: String::new(),
            fallback_smtp_pass: String::new(),
            save_to_sent: false,
            read_timeout_secs: 300,
            http_timeout_secs: 10,
            max_message_bytes: 35 * 1024 * 1024,
            oauth2: OAuth2Config::default(),
            graph: GraphConfig::default(),
        }
    }
}

impl Default for OAuth2Config {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: String::new(),
            tenant_id: String::new(),
            scopes: vec!["https://graph.microsoft.com/.default".to_string()],
            authority: "https://login.microsoftonline.com".to_string(),
        }
    }
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://graph.microsoft.com/v1.0".to_string(),
        }
    }
}

/// Turns a stored secret into its usable form.
///
/// Called once per sensitive field while the configuration is loaded.
pub trait SecretUnwrapper {
    fn unwrap_secret(&self, field: &'static str, value: String) -> Result<String, ConfigError>;
}

/// Takes secrets as written. Values encrypted for a platform key store are
/// refused, since nothing here can decrypt them.
pub struct PlainSecrets;

impl SecretUnwrapper for PlainSecrets {
    fn unwrap_secret(&self, field: &'static str, value: String) -> Result<String, ConfigError> {
        if value.starts_with(ENCRYPTED_PREFIX) {
            return Err(ConfigError::Secret {
                field,
                reason: "value is encrypted but no decryptor is available on this platform".to_string(),
            });
        }

        Ok(value)
    }
}

impl Config {
    pub fn load(path: &Path, secrets: &dyn SecretUnwrapper) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_owned(),
            source,
        })?;

        let mut config = Self::parse(&text, secrets)?;

        if !config.log.is_empty() {
            let log = PathBuf::from(&config.log);
            if log.is_relative() {
                if let Some(dir) = path.parent() {
                    config.log = dir.join(log).to_string_lossy().into_owned();
                }
            }
        }

        Ok(config)
    }

    pub fn parse(text: &str, secrets: &dyn SecretUnwrapper) -> Result<Self, ConfigError> {
        let mut config: Config = toml::from_str(text)?;

        config.fallback_smtp_user =
            secrets.unwrap_secret("fallback_smtp_user", config.fallback_smtp_user)?;
        config.fallback_smtp_pass =
            secrets.unwrap_secret("fallback_smtp_pass", config.fallback_smtp_pass)?;
        config.oauth2.client_id =
            secrets.unwrap_secret("oauth2.client_id", config.oauth2.client_id)?;
        config.oauth2.client_secret =
            secrets.unwrap_secret("oauth2.client_secret", config.oauth2.client_secret)?;
        config.oauth2.tenant_id =
            secrets.unwrap_secret("oauth2.tenant_id", config.oauth2.tenant_id)?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.oauth2.client_id.is_empty() {
            return Err(ConfigError::Invalid("oauth2.client_id is required".to_string()));
        }
        if self.oauth2.tenant_id.is_empty() {
            return Err(ConfigError::Invalid("oauth2.tenant_id is required".to_string()));
        }
        if self.oauth2.scopes.is_empty() {
            return Err(ConfigError::Invalid("oauth2.scopes must not be empty".to_string()));
        }
        self.token_url()?;
        self.graph_endpoint()?;
        Ok(())
    }

    /// `{authority}/{tenant}/oauth2/v2.0/token`
    pub fn token_url(&self) -> Result<Url, ConfigError> {
        let mut url = parse_url("oauth2.authority", &self.oauth2.authority)?;

        url.path_segments_mut()
            .map_err(|_| ConfigError::Invalid("oauth2.authority cannot take a path".to_string()))?
            .pop_if_empty()
            .extend(&[self.oauth2.tenant_id.as_str(), "oauth2", "v2.0", "token"]);

        Ok(url)
    }

    pub fn graph_endpoint(&self) -> Result<Url, ConfigError> {
        parse_url("graph.endpoint", &self.graph.endpoint)
    }

    /// Both halves must be set for the fallback to apply.
    pub fn fallback_credentials(&self) -> Option<(String, String)> {
        if self.fallback_smtp_user.is_empty() || self.fallback_smtp_pass.is_empty() {
            return None;
        }

        Some((self.fallback_smtp_user.clone(), self.fallback_smtp_pass.clone()))
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        match self.read_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}

fn parse_url(field: &str, value: &str) -> Result<Url, ConfigError> {
    Url::parse(value).map_err(|err| ConfigError::Invalid(format!("{field} `{value}`: {err}")))
}
