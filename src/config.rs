//! Process-environment configuration. All knobs come from the environment
//! (the service runs in a container); a missing mandatory variable is a
//! startup failure and exits with code 1.

use std::env::{self, VarError};
use std::net::IpAddr;

use thiserror::Error;

pub const DEFAULT_BASE_URL: &str = "https://app.affine.pro";
pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 3000;

/// Credentials and endpoint of the upstream collaboration backend.
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub base_url: String,
    pub email: String,
    pub password: String,
}

/// Everything the `serve` command needs, resolved once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub upstream: UpstreamConfig,
    pub host: IpAddr,
    pub port: u16,
    /// Optional bookmark-ingestion webhook block. Parsed here, consumed by an
    /// external collaborator; absent unless the whole block is configured.
    pub karakeep: Option<KarakeepConfig>,
}

#[derive(Debug, Clone)]
pub struct KarakeepConfig {
    pub api_url: String,
    pub api_key: String,
    pub webhook_secret: String,
    pub gemini_api_key: Option<String>,
    pub workspace_id: Option<String>,
    pub folder_id: Option<String>,
    pub zettels_folder_id: Option<String>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing mandatory environment variable {0}")]
    Missing(&'static str),

    #[error("environment variable {0} is not valid unicode")]
    NotUnicode(&'static str),

    #[error("environment variable {0} has invalid value {1:?}")]
    Invalid(&'static str, String),
}

fn optional(name: &'static str) -> Result<Option<String>, ConfigError> {
    match env::var(name) {
        Ok(value) if value.is_empty() => Ok(None),
        Ok(value) => Ok(Some(value)),
        Err(VarError::NotPresent) => Ok(None),
        Err(VarError::NotUnicode(_)) => Err(ConfigError::NotUnicode(name)),
    }
}

fn mandatory(name: &'static str) -> Result<String, ConfigError> {
    optional(name)?.ok_or(ConfigError::Missing(name))
}

impl Config {
    pub fn from_env() -> Result<Config, ConfigError> {
        let base_url = optional("AFFINE_BASE_URL")?
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_owned())
            .trim_end_matches('/')
            .to_owned();

        let upstream = UpstreamConfig {
            base_url,
            email: mandatory("AFFINE_EMAIL")?,
            password: mandatory("AFFINE_PASSWORD")?,
        };

        let host = match optional("HOST")? {
            Some(raw) => raw
                .parse()
                .map_err(|_| ConfigError::Invalid("HOST", raw))?,
            None => DEFAULT_HOST.parse().unwrap(),
        };

        let port = match optional("PORT")? {
            Some(raw) => raw
                .parse()
                .map_err(|_| ConfigError::Invalid("PORT", raw))?,
            None => DEFAULT_PORT,
        };

        Ok(Config {
            upstream,
            host,
            port,
            karakeep: Self::karakeep_from_env()?,
        })
    }

    /// The webhook block is all-or-nothing: it only activates when the API
    /// endpoint, key and webhook secret are all present.
    fn karakeep_from_env() -> Result<Option<KarakeepConfig>, ConfigError> {
        let (api_url, api_key, webhook_secret) = match (
            optional("KARAKEEP_API_URL")?,
            optional("KARAKEEP_API_KEY")?,
            optional("KARAKEEP_WEBHOOK_SECRET")?,
        ) {
            (Some(url), Some(key), Some(secret)) => (url, key, secret),
            _ => return Ok(None),
        };

        Ok(Some(KarakeepConfig {
            api_url,
            api_key,
            webhook_secret,
            gemini_api_key: optional("GEMINI_API_KEY")?,
            workspace_id: optional("AFFINE_WORKSPACE_ID")?,
            folder_id: optional("AFFINE_KARAKEEP_FOLDER_ID")?,
            zettels_folder_id: optional("AFFINE_KARAKEEP_ZETTELS_FOLDER_ID")?,
        }))
    }
}
