use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;

use confab_core::{Error, SecretResolver};

use crate::config::ProviderEntry;

/// Resolves bearer tokens from configuration: a literal `api_key`, the
/// stdout of `api_key_cmd`, or an environment variable. Resolved keys
/// are cached for the life of the process so password-manager commands
/// run at most once.
pub struct ConfigSecretResolver {
    providers: HashMap<String, ProviderEntry>,
    cache: Mutex<HashMap<String, String>>,
}

impl ConfigSecretResolver {
    pub fn new(providers: HashMap<String, ProviderEntry>) -> Self {
        Self {
            providers,
            cache: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl SecretResolver for ConfigSecretResolver {
    async fn resolve(&self, provider: &str) -> Result<String, Error> {
        if let Some(cached) = self.cache.lock().unwrap().get(provider) {
            return Ok(cached.clone());
        }

        let entry = self.providers.get(provider).cloned().unwrap_or_default();
        let secret = resolve_entry(provider, &entry).await?;

        self.cache
            .lock()
            .unwrap()
            .insert(provider.to_string(), secret.clone());
        Ok(secret)
    }
}

async fn resolve_entry(provider: &str, entry: &ProviderEntry) -> Result<String, Error> {
    if let Some(key) = &entry.api_key {
        return Ok(key.clone());
    }

    if let Some(cmd) = &entry.api_key_cmd {
        debug!(provider, "resolving api key via command");
        return run_key_command(provider, cmd).await;
    }

    let var = entry
        .api_key_env
        .clone()
        .unwrap_or_else(|| default_env_var(provider));
    match std::env::var(&var) {
        Ok(key) if !key.trim().is_empty() => Ok(key.trim().to_string()),
        _ => Err(Error::secret(format!(
            "no api key for provider '{provider}': set api_key or api_key_cmd under \
             [providers.{provider}], or export {var}"
        ))),
    }
}

async fn run_key_command(provider: &str, cmd: &str) -> Result<String, Error> {
    let output = tokio::process::Command::new("/bin/sh")
        .arg("-c")
        .arg(cmd)
        .output()
        .await
        .map_err(|e| Error::secret(format!("api_key_cmd failed to start: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::secret(format!(
            "api_key_cmd for provider '{provider}' exited with {}: {}",
            output.status,
            stderr.trim()
        )));
    }

    let key = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if key.is_empty() {
        return Err(Error::secret(format!(
            "api_key_cmd for provider '{provider}' produced no output"
        )));
    }
    Ok(key)
}

/// `my-provider` resolves through `MY_PROVIDER_API_KEY`.
fn default_env_var(provider: &str) -> String {
    let upper: String = provider
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("{upper}_API_KEY")
}
