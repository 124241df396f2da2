// src/config/ai.rs
use serde::{Deserialize, Serialize};
use std::{env, fs, path::Path, path::PathBuf};

const ENV_PATH: &str = "AI_CONFIG_PATH";

fn default_provider() -> String {
    "openai".into()
}
fn default_daily_limit() -> u32 {
    500
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AiConfig {
    #[serde(default)]
    pub enabled: bool,
    /// "openai" | "deepseek" | "compatible" (case-insensitive)
    #[serde(default = "default_provider")]
    pub provider: String,
    /// Model name; each provider has a default.
    #[serde(default)]
    pub model: Option<String>,
    /// Chat-completions base URL, e.g. `https://api.openai.com/v1`.
    #[serde(default)]
    pub base_url: Option<String>,
    /// "ENV" means: read from OPENAI_API_KEY / DEEPSEEK_API_KEY (by provider)
    #[serde(default)]
    pub api_key: String,
    /// Upstream calls allowed per UTC day.
    #[serde(default = "default_daily_limit")]
    pub daily_limit: u32,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            provider: default_provider(),
            model: None,
            base_url: None,
            api_key: String::new(),
            daily_limit: default_daily_limit(),
        }
    }
}

impl AiConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let data = fs::read_to_string(path)?;
        let cfg: AiConfig = serde_json::from_str(&data)?;
        cfg.resolved()
    }

    /// 1) $AI_CONFIG_PATH 2) config/ai.json 3) defaults (disabled)
    pub fn load_default() -> anyhow::Result<Self> {
        if let Ok(p) = env::var(ENV_PATH) {
            let pb = PathBuf::from(p);
            if !pb.exists() {
                anyhow::bail!("AI_CONFIG_PATH points to non-existent path");
            }
            return Self::load_from_file(pb);
        }
        let p = PathBuf::from("config/ai.json");
        if p.exists() {
            return Self::load_from_file(p);
        }
        Ok(Self::default())
    }

    /// Normalize the provider name and resolve an "ENV" api key.
    pub fn resolved(mut self) -> anyhow::Result<Self> {
        self.provider = self.provider.trim().to_lowercase();
        if self.api_key.trim().eq_ignore_ascii_case("env") {
            let var = match self.provider.as_str() {
                "openai" | "compatible" => "OPENAI_API_KEY",
                "deepseek" => "DEEPSEEK_API_KEY",
                other => anyhow::bail!("Unsupported provider in config: {other}"),
            };
            self.api_key =
                env::var(var).map_err(|_| anyhow::anyhow!("Missing {var} env var"))?;
        }
        Ok(self)
    }

    pub fn model_or_default(&self) -> String {
        if let Some(m) = self.model.as_deref().filter(|m| !m.trim().is_empty()) {
            return m.trim().to_string();
        }
        match self.provider.as_str() {
            "deepseek" => "deepseek-chat".into(),
            _ => "gpt-4o-mini".into(),
        }
    }

    pub fn base_url_or_default(&self) -> String {
        if let Some(u) = self.base_url.as_deref().filter(|u| !u.trim().is_empty()) {
            return u.trim().trim_end_matches('/').to_string();
        }
        match self.provider.as_str() {
            "deepseek" => "https://api.deepseek.com/v1".into(),
            _ => "https://api.openai.com/v1".into(),
        }
    }
}
