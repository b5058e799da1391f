use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::db::{ConnectionConfig, PoolSettings};
use crate::pagination::DEFAULT_PAGE_SIZE;
use crate::synth::LlmProvider;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub database: ConnectionConfig,
    pub pool: PoolSettings,
    pub limits: LimitSettings,
    pub synthesizer: SynthesizerSettings,
    /// Optional TOML overlay for the business rule table.
    pub rules_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitSettings {
    pub page_size: usize,
    pub synthesis_timeout_ms: u64,
    pub query_timeout_ms: u64,
}

impl Default for LimitSettings {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            synthesis_timeout_ms: 20_000,
            query_timeout_ms: 10_000,
        }
    }
}

impl LimitSettings {
    pub fn synthesis_timeout(&self) -> Duration {
        Duration::from_millis(self.synthesis_timeout_ms)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SynthesizerKind {
    #[default]
    Rules,
    Llm,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SynthesizerSettings {
    pub kind: SynthesizerKind,
    pub provider: LlmProvider,
    pub model: Option<String>,
    pub api_url: Option<String>,
    pub max_tokens: u32,
    /// Environment variable holding the generation service API key.
    pub api_key_env: String,
}

impl Default for SynthesizerSettings {
    fn default() -> Self {
        Self {
            kind: SynthesizerKind::default(),
            provider: LlmProvider::default(),
            model: None,
            api_url: None,
            max_tokens: 4096,
            api_key_env: "FILLGATE_LLM_API_KEY".to_string(),
        }
    }
}

impl ServiceConfig {
    /// Load from `path`, or the default location when `None`. A missing
    /// default file means defaults; a missing explicit file is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, explicit) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => match default_path() {
                Ok(p) => (p, false),
                Err(_) => return Ok(Self::default().with_env()),
            },
        };
        if !explicit && !path.exists() {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default().with_env());
        }
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config = Self::parse(&text)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        Ok(config.with_env())
    }

    pub fn parse(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// `PGPASSWORD` fills an empty password.
    fn with_env(mut self) -> Self {
        if self.database.password.is_empty() {
            if let Ok(pw) = std::env::var("PGPASSWORD") {
                self.database.password = pw;
            }
        }
        self
    }
}

pub fn default_path() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
    Ok(config_dir.join("fillgate").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SslMode;

    #[test]
    fn test_defaults() {
        let c = ServiceConfig::default();
        assert_eq!(c.limits.page_size, 1000);
        assert_eq!(c.pool.max_size, 10);
        assert_eq!(c.synthesizer.kind, SynthesizerKind::Rules);
        assert!(c.rules_path.is_none());
    }

    #[test]
    fn test_parse_sections() {
        let c = ServiceConfig::parse(
            r#"
            rules_path = "/etc/fillgate/rules.toml"

            [database]
            host = "db.internal"
            database = "hr"
            username = "reader"
            ssl_mode = "require"

            [pool]
            max_size = 4

            [limits]
            page_size = 250
            query_timeout_ms = 1500

            [synthesizer]
            kind = "llm"
            provider = "openai"
            model = "gpt-4o-mini"
            "#,
        )
        .unwrap();
        assert_eq!(c.database.host, "db.internal");
        assert_eq!(c.database.ssl_mode, SslMode::Require);
        assert_eq!(c.pool.max_size, 4);
        assert_eq!(c.pool.wait_timeout_ms, PoolSettings::default().wait_timeout_ms);
        assert_eq!(c.limits.page_size, 250);
        assert_eq!(c.limits.query_timeout(), Duration::from_millis(1500));
        assert_eq!(c.limits.synthesis_timeout_ms, 20_000);
        assert_eq!(c.synthesizer.kind, SynthesizerKind::Llm);
        assert_eq!(c.synthesizer.provider, LlmProvider::OpenAI);
        assert_eq!(c.synthesizer.model.as_deref(), Some("gpt-4o-mini"));
        assert_eq!(c.rules_path, Some(PathBuf::from("/etc/fillgate/rules.toml")));
    }

    #[test]
    fn test_unknown_kind_is_an_error() {
        assert!(ServiceConfig::parse("[synthesizer]\nkind = \"magic\"").is_err());
    }

    #[test]
    fn test_explicit_missing_file_is_an_error() {
        assert!(ServiceConfig::load(Some(Path::new("/nonexistent/fillgate.toml"))).is_err());
    }
}
