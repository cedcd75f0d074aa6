use anyhow::{Context, Result};
use keyring::Entry;

const KEYRING_SERVICE: &str = "streamchat_api_key";

const DEFAULT_API_URL: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL: &str = "gpt-4o-mini";

// Settings for the generation backend. Model choice lives here, not in the
// per-turn contract; everything is overridable from the environment.
#[derive(Clone, Debug)]
pub struct BackendConfig {
    pub name: String,
    pub api_url: String,
    pub model: String,
    // Reference to the key, not the key itself - 'keyring' or 'env:MY_API_KEY'
    pub api_key_ref: Option<String>,
}

impl BackendConfig {
    pub fn from_env() -> Self {
        Self {
            name: std::env::var("STREAMCHAT_BACKEND_NAME")
                .unwrap_or_else(|_| "OpenAI Compatible".to_string()),
            api_url: std::env::var("STREAMCHAT_API_URL")
                .unwrap_or_else(|_| DEFAULT_API_URL.to_string()),
            model: std::env::var("STREAMCHAT_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string()),
            api_key_ref: Some(
                std::env::var("STREAMCHAT_API_KEY_REF")
                    .unwrap_or_else(|_| "env:OPENAI_API_KEY".to_string()),
            ),
        }
    }
}

// --- API Key Retrieval ---

/// Retrieves the API key for the configured backend. The `api_key_ref`
/// field determines whether to read from an environment variable or the
/// OS keyring.
pub fn get_api_key(config: &BackendConfig) -> Result<String> {
    match config.api_key_ref.as_deref() {
        Some(ref_str) if ref_str.starts_with("env:") => {
            let env_var_name = ref_str.trim_start_matches("env:");
            log::debug!("Retrieving API key from environment variable: {}", env_var_name);
            std::env::var(env_var_name).context(format!(
                "Failed to get API key from environment variable '{}'",
                env_var_name
            ))
        }
        Some("keyring") => {
            let entry = Entry::new(KEYRING_SERVICE, &config.name)
                .context("Failed to create keyring entry")?;
            log::debug!("Retrieving API key from keyring for backend: {}", config.name);
            entry.get_password().context(format!(
                "Failed to get API key from keyring for '{}'. Please store one first.",
                config.name
            ))
        }
        Some(other) => Err(anyhow::anyhow!("Unsupported api_key_ref format: {}", other)),
        None => Err(anyhow::anyhow!(
            "API key reference not set for backend '{}'",
            config.name
        )),
    }
}

/// Stores an API key in the OS keyring for the given backend.
pub fn set_api_key_in_keyring(config: &BackendConfig, api_key: &str) -> Result<()> {
    let entry = Entry::new(KEYRING_SERVICE, &config.name)
        .context("Failed to create keyring entry for setting password")?;
    log::info!("Setting API key in keyring for backend: {}", config.name);
    entry
        .set_password(api_key)
        .context(format!("Failed to set API key in keyring for '{}'", config.name))
}
