use std::path::PathBuf;

use anyhow::{Context, Result};

use confab_transcript::ParserConfig;

/// Create a transcript skeleton. Refuses to overwrite; returns the path
/// it wrote.
pub fn create(path: Option<PathBuf>, config: &ParserConfig) -> Result<PathBuf> {
    let path = path.unwrap_or_else(default_path);
    if path.exists() {
        anyhow::bail!("{} already exists", path.display());
    }
    std::fs::write(&path, skeleton(config))
        .with_context(|| format!("failed to create {}", path.display()))?;
    Ok(path)
}

fn default_path() -> PathBuf {
    PathBuf::from(format!("chat-{}.md", chrono::Local::now().format("%Y-%m-%d")))
}

fn skeleton(config: &ParserConfig) -> String {
    let date = chrono::Local::now().format("%Y-%m-%d");
    format!(
        "# Chat {date}\n\
         \n\
         %% Uncomment to override config defaults:\n\
         %% - provider: anthropic\n\
         %% - model: claude-sonnet-4-5\n\
         \n\
         {separator}\n\
         \n\
         {user}user\n\
         \n",
        separator = config.separator,
        user = config.user_prefix,
    )
}
