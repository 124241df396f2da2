// src/config/app.rs
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

const ENV_PATH: &str = "SIGNALBOARD_CONFIG_PATH";
const DEFAULT_PATH: &str = "config/signalboard.toml";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub database_url: String,
    /// Bearer secret for the cron endpoints. Unset disables them.
    pub cron_secret: Option<String>,
    pub ingest: IngestConfig,
    pub enrich: EnrichConfig,
    pub reader: ReaderConfig,
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct IngestConfig {
    pub concurrency: usize,
    pub user_agent: String,
    pub timeout_secs: u64,
    /// Responses larger than this are rejected.
    pub max_body_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EnrichConfig {
    pub batch_size: usize,
    pub max_attempts: i64,
    pub concurrency: usize,
    /// Language for the `*_localized` fields and translated titles.
    pub target_language: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReaderConfig {
    pub chunk_tokens: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ApiConfig {
    pub rate_limit_per_minute: u32,
    pub max_page_size: i64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://signalboard.db".into(),
            cron_secret: None,
            ingest: IngestConfig::default(),
            enrich: EnrichConfig::default(),
            reader: ReaderConfig::default(),
            api: ApiConfig::default(),
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            user_agent: concat!("signalboard/", env!("CARGO_PKG_VERSION")).into(),
            timeout_secs: 15,
            max_body_bytes: 5 * 1024 * 1024,
        }
    }
}

impl Default for EnrichConfig {
    fn default() -> Self {
        Self {
            batch_size: 20,
            max_attempts: 5,
            concurrency: 4,
            target_language: "Chinese".into(),
        }
    }
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self { chunk_tokens: 3000 }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            rate_limit_per_minute: 60,
            max_page_size: 100,
        }
    }
}

impl AppConfig {
    /// Load TOML from an explicit path, then apply env overrides.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        let cfg: AppConfig = toml::from_str(&content)
            .with_context(|| format!("parsing config {}", path.display()))?;
        Ok(cfg.with_env_overrides())
    }

    /// Load config using env var + fallbacks:
    /// 1) $SIGNALBOARD_CONFIG_PATH
    /// 2) config/signalboard.toml
    /// 3) built-in defaults
    pub fn load_default() -> Result<Self> {
        if let Ok(p) = std::env::var(ENV_PATH) {
            let pb = PathBuf::from(p);
            if !pb.exists() {
                return Err(anyhow!("{ENV_PATH} points to non-existent path"));
            }
            return Self::load_from(&pb);
        }
        let p = PathBuf::from(DEFAULT_PATH);
        if p.exists() {
            return Self::load_from(&p);
        }
        Ok(Self::default().with_env_overrides())
    }

    /// `DATABASE_URL` and `CRON_SECRET` win over the file.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(url) = non_empty_env("DATABASE_URL") {
            self.database_url = url;
        }
        if let Some(secret) = non_empty_env("CRON_SECRET") {
            self.cron_secret = Some(secret);
        }
        self.cron_secret = self.cron_secret.filter(|s| !s.trim().is_empty());
        self
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    #[test]
    fn partial_toml_keeps_defaults() {
        let cfg: AppConfig = toml::from_str(
            r#"
            database_url = "sqlite://x.db"
            [enrich]
            max_attempts = 2
            "#,
        )
        .unwrap();
        assert_eq!(cfg.database_url, "sqlite://x.db");
        assert_eq!(cfg.enrich.max_attempts, 2);
        assert_eq!(cfg.enrich.batch_size, 20);
        assert_eq!(cfg.ingest.concurrency, 4);
        assert_eq!(cfg.reader.chunk_tokens, 3000);
    }

    #[serial_test::serial]
    #[test]
    fn default_uses_env_then_fallbacks() {
        let old = env::current_dir().unwrap();
        let tmp = tempfile::tempdir().unwrap();
        env::set_current_dir(tmp.path()).unwrap();
        env::remove_var(ENV_PATH);
        env::remove_var("DATABASE_URL");
        env::remove_var("CRON_SECRET");

        // No files in the temp cwd: defaults.
        let cfg = AppConfig::load_default().unwrap();
        assert_eq!(cfg, AppConfig::default());

        let p = tmp.path().join("custom.toml");
        fs::write(&p, "cron_secret = \"from-file\"\n[api]\nrate_limit_per_minute = 5\n").unwrap();
        env::set_var(ENV_PATH, p.display().to_string());
        let cfg = AppConfig::load_default().unwrap();
        assert_eq!(cfg.cron_secret.as_deref(), Some("from-file"));
        assert_eq!(cfg.api.rate_limit_per_minute, 5);

        env::set_var("CRON_SECRET", "from-env");
        env::set_var("DATABASE_URL", "sqlite::memory:");
        let cfg = AppConfig::load_default().unwrap();
        assert_eq!(cfg.cron_secret.as_deref(), Some("from-env"));
        assert_eq!(cfg.database_url, "sqlite::memory:");

        env::set_var(ENV_PATH, tmp.path().join("missing.toml").display().to_string());
        assert!(AppConfig::load_default().is_err());

        env::remove_var(ENV_PATH);
        env::remove_var("CRON_SECRET");
        env::remove_var("DATABASE_URL");
        env::set_current_dir(&old).unwrap();
    }
}
