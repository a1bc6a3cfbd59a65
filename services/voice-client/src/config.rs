use std::time::Duration;
use voice_session_core::{
    ConfigProvider, ConnectionConfig,
    config::{DEFAULT_ICE_SERVER, DEFAULT_NEGOTIATION_TIMEOUT, DEFAULT_TOOL_VISIBILITY},
};

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Loads connection settings from environment variables.
///
/// `endpoint_override` takes precedence over `VOICE_ENDPOINT_URL`.
pub fn load_connection_config(
    endpoint_override: Option<&str>,
) -> Result<ConnectionConfig, ConfigError> {
    // Only load from .env in non-test mode to avoid contamination
    if !cfg!(test) {
        dotenvy::dotenv().ok();
    }

    let endpoint_url = match endpoint_override {
        Some(url) => url.to_string(),
        None => std::env::var("VOICE_ENDPOINT_URL")
            .map_err(|_| ConfigError::MissingVar("VOICE_ENDPOINT_URL".to_string()))?,
    };
    let scheme = endpoint_url
        .split_once("://")
        .map(|(scheme, _)| scheme.to_ascii_lowercase())
        .unwrap_or_default();
    if !matches!(scheme.as_str(), "ws" | "wss" | "http" | "https") {
        return Err(ConfigError::InvalidValue(
            "VOICE_ENDPOINT_URL".to_string(),
            format!("'{endpoint_url}' is not a ws(s):// or http(s):// URL"),
        ));
    }

    let mut config = ConnectionConfig::new(endpoint_url);

    if let Some(key) = std::env::var("VOICE_CREDENTIAL_KEY")
        .ok()
        .filter(|k| !k.is_empty())
    {
        config = config.with_credential_key(key);
    }

    let ice_servers = std::env::var("VOICE_ICE_SERVERS")
        .map(|list| {
            list.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_else(|_| vec![DEFAULT_ICE_SERVER.to_string()]);
    config = config.with_ice_servers(ice_servers);

    let tool_visibility = duration_var("VOICE_TOOL_VISIBILITY_MS", Duration::from_millis)?
        .unwrap_or(DEFAULT_TOOL_VISIBILITY);
    let negotiation_timeout =
        duration_var("VOICE_NEGOTIATION_TIMEOUT_SECS", Duration::from_secs)?
            .unwrap_or(DEFAULT_NEGOTIATION_TIMEOUT);

    Ok(config
        .with_tool_visibility(tool_visibility)
        .with_negotiation_timeout(negotiation_timeout))
}

fn duration_var(
    name: &str,
    unit: fn(u64) -> Duration,
) -> Result<Option<Duration>, ConfigError> {
    let Ok(raw) = std::env::var(name) else {
        return Ok(None);
    };
    match raw.trim().parse::<u64>() {
        Ok(value) if value > 0 => Ok(Some(unit(value))),
        _ => Err(ConfigError::InvalidValue(
            name.to_string(),
            format!("'{raw}' is not a positive integer"),
        )),
    }
}

/// Reads a fresh snapshot from the environment on every connect.
#[derive(Debug, Default, Clone)]
pub struct EnvConfigProvider {
    endpoint_override: Option<String>,
}

impl EnvConfigProvider {
    pub fn new(endpoint_override: Option<String>) -> Self {
        Self { endpoint_override }
    }
}

impl ConfigProvider for EnvConfigProvider {
    type Error = ConfigError;

    fn snapshot(&self) -> Result<ConnectionConfig, ConfigError> {
        load_connection_config(self.endpoint_override.as_deref())
    }
}
