use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Session settings, layered from defaults, `patchup.toml`, and
/// `PATCHUP_*` environment variables. CLI flags override on top.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Chat model for the main edit loop
    pub model: String,

    /// Model used by the LLM feature selector
    pub feature_selection_model: String,

    /// Embedding model for similarity ranking
    pub embedding_model: String,

    /// Total prompt token budget (context window minus response headroom)
    pub prompt_tokens: usize,

    /// Tokens reserved for the model response
    pub response_buffer: usize,

    /// Whether auto-context is enabled
    pub auto_context: bool,

    /// Token budget for auto-selected features
    pub auto_tokens: usize,

    /// Rank features by embedding similarity when a prompt is available
    pub use_embeddings: bool,

    /// Let an LLM pass pick features in auto mode
    pub use_llm_selector: bool,

    /// Edit stream format: "block" or "git-diff"
    pub format: String,

    /// Files larger than this many bytes are never auto-included
    pub max_file_chars: usize,

    /// Sampling temperature for chat requests
    pub temperature: f32,

    /// Mirror pre-edit file content under `.patchup_backups`
    pub backups: bool,

    /// Chat completions endpoint (OpenAI-compatible)
    pub base_url: String,

    /// Extra ignore globs for auto-context
    pub ignore_patterns: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            model: "gpt-4o".to_string(),
            feature_selection_model: "gpt-4o".to_string(),
            embedding_model: "text-embedding-3-small".to_string(),
            prompt_tokens: 32_000,
            response_buffer: 1_000,
            auto_context: false,
            auto_tokens: 8_000,
            use_embeddings: true,
            use_llm_selector: false,
            format: "block".to_string(),
            max_file_chars: 200_000,
            temperature: 0.2,
            backups: true,
            base_url: "https://api.openai.com/v1".to_string(),
            ignore_patterns: vec![
                "target/**".to_string(),
                "node_modules/**".to_string(),
                "dist/**".to_string(),
                "build/**".to_string(),
                "__pycache__/**".to_string(),
            ],
        }
    }
}

pub fn load_settings(cwd: &Path) -> Result<Settings> {
    let mut builder = config::Config::builder();

    // Load from config files in priority order
    let config_paths = ["patchup.toml", ".patchup.toml"];

    for name in &config_paths {
        let path = cwd.join(name);
        if path.exists() {
            builder = builder.add_source(config::File::from(path));
            break;
        }
    }

    // Add environment variables with PATCHUP_ prefix
    builder = builder.add_source(config::Environment::with_prefix("PATCHUP").separator("__"));

    let defaults = config::Config::try_from(&Settings::default())
        .context("Failed to seed default configuration")?;
    let cfg = config::Config::builder()
        .add_source(defaults)
        .add_source(builder.build().context("Failed to load configuration")?)
        .build()
        .context("Failed to merge configuration")?;

    let parsed: Settings = cfg
        .try_deserialize()
        .context("Failed to parse configuration")?;

    Ok(parsed)
}

/// Write a `patchup.toml` seeded with the defaults, for editing.
pub fn init_config_file(dir: &Path, force: bool) -> Result<PathBuf> {
    let config_path = dir.join("patchup.toml");
    if config_path.exists() && !force {
        anyhow::bail!(
            "Config file already exists at {}",
            config_path.display()
        );
    }

    let toml_string = toml::to_string_pretty(&Settings::default())
        .context("Failed to serialize default config")?;
    std::fs::write(&config_path, toml_string).context("Failed to write config file")?;
    Ok(config_path)
}

/// Resolve the chat API key: PATCHUP_API_KEY, then OPENAI_API_KEY,
/// with `.env` consulted first (dotenvy is a no-op when absent).
pub fn api_key() -> Option<String> {
    dotenvy::dotenv().ok();
    std::env::var("PATCHUP_API_KEY")
        .or_else(|_| std::env::var("OPENAI_API_KEY"))
        .ok()
}

/// Per-user state directory holding transcripts and logs.
pub fn state_dir() -> Result<PathBuf> {
    let base = dirs::data_dir()
        .or_else(dirs::home_dir)
        .context("Could not determine a per-user state directory")?;
    let dir = base.join("patchup");
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create state dir {}", dir.display()))?;
    Ok(dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let s = Settings::default();
        assert!(s.prompt_tokens > s.auto_tokens);
        assert!(s.response_buffer > 0);
        assert_eq!(s.format, "block");
    }

    #[test]
    fn test_init_writes_parseable_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = init_config_file(dir.path(), false).unwrap();
        assert!(path.exists());

        // A second init without --force refuses to clobber
        assert!(init_config_file(dir.path(), false).is_err());
        assert!(init_config_file(dir.path(), true).is_ok());

        // The generated file round-trips through the loader
        let settings = load_settings(dir.path()).unwrap();
        assert_eq!(settings.model, Settings::default().model);
    }

    #[test]
    fn test_toml_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("patchup.toml"),
            "model = \"gpt-4o-mini\"\nauto_context = true\n",
        )
        .unwrap();

        let s = load_settings(dir.path()).unwrap();
        assert_eq!(s.model, "gpt-4o-mini");
        assert!(s.auto_context);
        // Untouched keys keep their defaults
        assert_eq!(s.format, "block");
    }
}
