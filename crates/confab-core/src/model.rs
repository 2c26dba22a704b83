use serde::{Deserialize, Serialize};

/// A model as written in a transcript header or a config file: either a
/// bare name or a table carrying per-model generation parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ModelDescriptor {
    Named(String),
    Configured(ModelTable),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelTable {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_effort: Option<String>,
}

impl ModelDescriptor {
    pub fn name(&self) -> &str {
        match self {
            ModelDescriptor::Named(name) => name,
            ModelDescriptor::Configured(table) => &table.name,
        }
    }

    /// Flatten to the normalized form adapters consume.
    pub fn normalize(&self) -> ModelParams {
        match self {
            ModelDescriptor::Named(name) => ModelParams::new(name.clone()),
            ModelDescriptor::Configured(table) => ModelParams {
                name: table.name.clone(),
                temperature: table.temperature,
                top_p: table.top_p,
                max_tokens: table.max_tokens,
                reasoning_effort: table.reasoning_effort.clone(),
            },
        }
    }
}

impl From<&str> for ModelDescriptor {
    fn from(name: &str) -> Self {
        ModelDescriptor::Named(name.to_string())
    }
}

/// Normalized model parameters. Absent fields mean "let the provider
/// pick its own default".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelParams {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_effort: Option<String>,
}

impl ModelParams {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_top_p(mut self, top_p: f32) -> Self {
        self.top_p = Some(top_p);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_reasoning_effort(mut self, effort: impl Into<String>) -> Self {
        self.reasoning_effort = Some(effort.into());
        self
    }

    /// O-series models reject sampling parameters and have no system
    /// role, so adapters treat them differently.
    pub fn is_reasoning(&self) -> bool {
        let mut chars = self.name.chars();
        chars.next() == Some('o') && chars.next().is_some_and(|c| c.is_ascii_digit())
    }

    /// Overlay transcript-level overrides onto config-level defaults.
    /// The override's name always wins; parameter fields win when set.
    pub fn overlay(&self, over: &ModelParams) -> ModelParams {
        ModelParams {
            name: over.name.clone(),
            temperature: over.temperature.or(self.temperature),
            top_p: over.top_p.or(self.top_p),
            max_tokens: over.max_tokens.or(self.max_tokens),
            reasoning_effort: over.reasoning_effort.clone().or_else(|| self.reasoning_effort.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_from_bare_string() {
        let desc: ModelDescriptor = serde_json::from_str("\"gpt-4o\"").unwrap();
        assert_eq!(desc.name(), "gpt-4o");
        let params = desc.normalize();
        assert!(params.temperature.is_none());
    }

    #[test]
    fn test_descriptor_from_table() {
        let desc: ModelDescriptor =
            serde_json::from_str(r#"{"name": "gpt-4o", "temperature": 0.2, "max_tokens": 512}"#)
                .unwrap();
        let params = desc.normalize();
        assert_eq!(params.name, "gpt-4o");
        assert_eq!(params.temperature, Some(0.2));
        assert_eq!(params.max_tokens, Some(512));
    }

    #[test]
    fn test_is_reasoning() {
        assert!(ModelParams::new("o1").is_reasoning());
        assert!(ModelParams::new("o3-mini").is_reasoning());
        assert!(ModelParams::new("o4-mini-high").is_reasoning());
        assert!(!ModelParams::new("gpt-4o").is_reasoning());
        assert!(!ModelParams::new("olmo-7b").is_reasoning());
        assert!(!ModelParams::new("claude-sonnet-4").is_reasoning());
    }

    #[test]
    fn test_overlay() {
        let base = ModelParams::new("gpt-4o")
            .with_temperature(0.7)
            .with_max_tokens(1024);
        let over = ModelParams::new("gpt-4.1").with_temperature(0.2);
        let merged = base.overlay(&over);
        assert_eq!(merged.name, "gpt-4.1");
        assert_eq!(merged.temperature, Some(0.2));
        assert_eq!(merged.max_tokens, Some(1024));
    }
}
