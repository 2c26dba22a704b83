use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use confab_core::{ProviderConfig, WireKind};
use confab_engine::{TransportConfig, DEFAULT_PAYLOAD_CAP};
use confab_transcript::{MemoryPolicy, ParserConfig};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Provider used when neither the CLI nor the transcript names one
    #[serde(default)]
    pub default_provider: Option<String>,

    #[serde(default)]
    pub providers: HashMap<String, ProviderEntry>,

    #[serde(default)]
    pub memory: MemoryEntry,

    #[serde(default)]
    pub transcript: TranscriptEntry,

    #[serde(default)]
    pub transport: TransportEntry,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProviderEntry {
    /// Wire family: "chat-completions", "native-messages", or
    /// "contents-parts". Inferred from well-known provider names when
    /// omitted.
    #[serde(default)]
    pub kind: Option<WireKind>,

    /// Endpoint override; the family default is used when omitted
    #[serde(default)]
    pub endpoint: Option<String>,

    #[serde(default)]
    pub api_key: Option<String>,

    /// Command whose stdout is the API key (e.g. a password manager)
    #[serde(default)]
    pub api_key_cmd: Option<String>,

    /// Environment variable holding the API key; defaults to
    /// <NAME>_API_KEY
    #[serde(default)]
    pub api_key_env: Option<String>,

    /// Model used when the transcript header names none
    #[serde(default)]
    pub default_model: Option<String>,

    #[serde(default)]
    pub default_max_tokens: Option<u32>,

    #[serde(default)]
    pub supports_reasoning_effort: bool,

    /// Attach the provider's server-side web search tool
    #[serde(default)]
    pub web_search: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEntry {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Recent exchanges always sent in full
    #[serde(default = "default_max_full_exchanges")]
    pub max_full_exchanges: usize,

    /// Stands in for the question of a compacted exchange
    #[serde(default)]
    pub placeholder: Option<String>,
}

impl Default for MemoryEntry {
    fn default() -> Self {
        Self {
            enabled: true,
            max_full_exchanges: default_max_full_exchanges(),
            placeholder: None,
        }
    }
}

impl MemoryEntry {
    pub fn to_policy(&self) -> MemoryPolicy {
        let defaults = MemoryPolicy::default();
        MemoryPolicy {
            enabled: self.enabled,
            max_full_exchanges: self.max_full_exchanges,
            placeholder: self.placeholder.clone().unwrap_or(defaults.placeholder),
        }
    }
}

/// Transcript marker overrides. Anything left out keeps the stock
/// marker.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TranscriptEntry {
    #[serde(default)]
    pub separator: Option<String>,

    #[serde(default)]
    pub user_prefix: Option<String>,

    #[serde(default)]
    pub assistant_prefix: Option<String>,

    #[serde(default)]
    pub summary_prefix: Option<String>,

    #[serde(default)]
    pub reasoning_prefix: Option<String>,

    #[serde(default)]
    pub local_prefix: Option<String>,
}

impl TranscriptEntry {
    pub fn to_parser_config(&self) -> ParserConfig {
        let mut config = ParserConfig::default();
        if let Some(separator) = &self.separator {
            config.separator = separator.clone();
        }
        if let Some(prefix) = &self.user_prefix {
            config.user_prefix = prefix.clone();
        }
        if let Some(prefix) = &self.assistant_prefix {
            config.assistant_prefix = prefix.clone();
        }
        if let Some(prefix) = &self.summary_prefix {
            config.summary_prefix = prefix.clone();
        }
        if let Some(prefix) = &self.reasoning_prefix {
            config.reasoning_prefix = prefix.clone();
        }
        if let Some(prefix) = &self.local_prefix {
            config.local_prefix = prefix.clone();
        }
        config
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportEntry {
    /// Program invoked once per request (tests substitute /bin/sh)
    #[serde(default = "default_program")]
    pub program: String,

    /// Per-request timeout in seconds; 0 disables the timeout
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Directory for payload artifacts (supports $VAR, ~)
    #[serde(default)]
    pub payload_dir: Option<String>,

    /// Prune the artifact directory oldest-first past this size
    #[serde(default = "default_payload_cap")]
    pub payload_cap_bytes: u64,
}

impl Default for TransportEntry {
    fn default() -> Self {
        Self {
            program: default_program(),
            timeout_secs: default_timeout_secs(),
            payload_dir: None,
            payload_cap_bytes: default_payload_cap(),
        }
    }
}

impl TransportEntry {
    pub fn to_transport_config(&self) -> TransportConfig {
        let payload_dir = match &self.payload_dir {
            Some(dir) => expand_path(dir),
            None => dirs::cache_dir()
                .map(|d| d.join("confab").join("payloads"))
                .unwrap_or_else(|| std::env::temp_dir().join("confab-payloads")),
        };
        TransportConfig {
            program: self.program.clone(),
            payload_dir,
            payload_cap_bytes: self.payload_cap_bytes,
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs))
    }
}

fn default_true() -> bool {
    true
}

fn default_max_full_exchanges() -> usize {
    2
}

fn default_program() -> String {
    "curl".to_string()
}

fn default_timeout_secs() -> u64 {
    120
}

fn default_payload_cap() -> u64 {
    DEFAULT_PAYLOAD_CAP
}

/// Expand environment variables in a path string
/// Supports: $VAR, ${VAR}, ~
pub fn expand_path(path: &str) -> PathBuf {
    let mut result = path.to_string();

    // Expand ~ at the start
    if result.starts_with("~/") {
        if let Some(home) = dirs::home_dir() {
            result = format!("{}{}", home.display(), &result[1..]);
        }
    } else if result == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }

    // Expand $VAR and ${VAR}
    let re = regex::Regex::new(r"\$\{?([A-Za-z_][A-Za-z0-9_]*)\}?").unwrap();
    let expanded = re.replace_all(&result, |caps: &regex::Captures| {
        std::env::var(&caps[1]).unwrap_or_else(|_| caps[0].to_string())
    });

    PathBuf::from(expanded.to_string())
}

impl Config {
    /// Load from an explicit path, or from ~/.config/confab/config.toml.
    /// An explicit path must exist; the default path falls back to an
    /// empty configuration so well-known providers still work off
    /// environment keys alone.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let config_path = match explicit {
            Some(path) => path.to_path_buf(),
            None => Self::config_path()?,
        };

        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            let config: Config = toml::from_str(&content)?;
            Ok(config)
        } else if explicit.is_some() {
            anyhow::bail!("config file not found: {}", config_path.display())
        } else {
            Ok(Config::default())
        }
    }

    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        Ok(config_dir.join("confab").join("config.toml"))
    }

    /// Resolve a provider name to a full provider configuration.
    pub fn provider_config(&self, name: &str) -> Result<ProviderConfig> {
        let entry = self.providers.get(name).cloned().unwrap_or_default();

        let kind = match entry.kind.or_else(|| infer_kind(name)) {
            Some(kind) => kind,
            None => anyhow::bail!(
                "provider '{name}' has no wire family. Add to ~/.config/confab/config.toml:\n\n\
                 [providers.{name}]\n\
                 kind = \"chat-completions\"  # or native-messages, contents-parts\n"
            ),
        };

        let mut config = ProviderConfig::new(name, kind);
        if let Some(endpoint) = &entry.endpoint {
            config = config.with_endpoint(endpoint.clone());
        }
        if let Some(max_tokens) = entry.default_max_tokens {
            config = config.with_default_max_tokens(max_tokens);
        }
        if entry.supports_reasoning_effort {
            config = config.with_reasoning_effort_support();
        }
        if entry.web_search {
            config = config.with_web_search();
        }
        Ok(config)
    }
}

/// Well-known provider names imply their wire family, so a bare
/// `- provider: anthropic` header works without any config entry.
fn infer_kind(name: &str) -> Option<WireKind> {
    match name.to_ascii_lowercase().as_str() {
        "openai" => Some(WireKind::ChatCompletions),
        "anthropic" | "claude" => Some(WireKind::NativeMessages),
        "gemini" | "google" => Some(WireKind::ContentsParts),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
            default_provider = "anthropic"

            [providers.anthropic]
            api_key_env = "ANTHROPIC_API_KEY"
            default_model = "claude-sonnet-4-5"

            [providers.corp]
            kind = "chat-completions"
            endpoint = "https://llm.corp.example/v1/chat/completions"

            [memory]
            max_full_exchanges = 4
        "#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.default_provider.as_deref(), Some("anthropic"));
        assert!(config.providers.contains_key("anthropic"));
        assert!(config.providers.contains_key("corp"));
        assert_eq!(config.memory.max_full_exchanges, 4);
        assert!(config.memory.enabled);
    }

    #[test]
    fn test_provider_kind_inferred_from_name() {
        let config = Config::default();

        let provider = config.provider_config("anthropic").unwrap();
        assert_eq!(provider.kind, WireKind::NativeMessages);
        assert!(provider.endpoint.contains("api.anthropic.com"));

        let provider = config.provider_config("gemini").unwrap();
        assert_eq!(provider.kind, WireKind::ContentsParts);

        assert!(config.provider_config("mystery").is_err());
    }

    #[test]
    fn test_provider_entry_overrides_flow_through() {
        let toml = r#"
            [providers.corp]
            kind = "openai"
            endpoint = "https://llm.corp.example/v1/chat/completions"
            default_max_tokens = 2048
            supports_reasoning_effort = true
        "#;

        let config: Config = toml::from_str(toml).unwrap();
        let provider = config.provider_config("corp").unwrap();
        assert_eq!(provider.kind, WireKind::ChatCompletions);
        assert_eq!(
            provider.endpoint,
            "https://llm.corp.example/v1/chat/completions"
        );
        assert_eq!(provider.default_max_tokens, Some(2048));
        assert!(provider.supports_reasoning_effort);
        assert!(!provider.web_search);
    }

    #[test]
    fn test_memory_policy_from_entry() {
        let toml = r#"
            [memory]
            enabled = false
            placeholder = "(omitted)"
        "#;

        let config: Config = toml::from_str(toml).unwrap();
        let policy = config.memory.to_policy();
        assert!(!policy.enabled);
        assert_eq!(policy.placeholder, "(omitted)");

        let policy = Config::default().memory.to_policy();
        assert!(policy.enabled);
        assert_eq!(policy.max_full_exchanges, 2);
        assert!(!policy.placeholder.is_empty());
    }

    #[test]
    fn test_transcript_prefix_overrides() {
        let toml = r#"
            [transcript]
            user_prefix = "Q: "
        "#;

        let config: Config = toml::from_str(toml).unwrap();
        let parser = config.transcript.to_parser_config();
        assert_eq!(parser.user_prefix, "Q: ");
        assert_eq!(parser.assistant_prefix, "<<< ");
    }

    #[test]
    fn test_timeout_zero_disables() {
        let toml = r#"
            [transport]
            timeout_secs = 0
        "#;

        let config: Config = toml::from_str(toml).unwrap();
        assert!(config.transport.timeout().is_none());

        let config = Config::default();
        assert_eq!(config.transport.timeout(), Some(Duration::from_secs(120)));
        assert_eq!(config.transport.program, "curl");
    }

    #[test]
    fn test_expand_path_home() {
        let home = dirs::home_dir().unwrap();
        assert_eq!(expand_path("~"), home);
        assert!(expand_path("~/notes").starts_with(&home));
        assert!(expand_path("$HOME/notes").starts_with(&home));
    }
}
