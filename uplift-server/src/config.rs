use std::{
    env, fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, anyhow};
use serde::{Deserialize, Serialize};
use uplift_core::config::PipelineConfig;
use zeroize::Zeroizing;

/// Source that produced the configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum AppConfigSource {
    #[default]
    Default,
    EnvPath(PathBuf),
    EnvInline,
    File(PathBuf),
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub cors: CorsConfig,
    /// Feed, retry, provisioning, storage and upload tuning.
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

/// Origins allowed on the ingestion routes. Object routes accept any origin.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CorsConfig {
    pub allowed_origins: Vec<String>,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: vec!["http://localhost:3000".to_string()],
        }
    }
}

impl AppConfig {
    /// Load configuration from `explicit` when given, otherwise from the
    /// environment (see [`AppConfig::load_from_env`]).
    ///
    /// `$UPLIFT_SIGNING_KEY` overrides the upload signing key in every case.
    pub fn load(explicit: Option<&Path>) -> anyhow::Result<(Self, AppConfigSource)> {
        let (mut config, source) = match explicit {
            Some(path) => (
                Self::load_from_file(path)?,
                AppConfigSource::File(path.to_path_buf()),
            ),
            None => Self::load_base()?,
        };
        config.apply_signing_key(env::var("UPLIFT_SIGNING_KEY").ok());
        Ok((config, source))
    }

    /// Load configuration using environment variables.
    /// Evaluation order:
    /// 1) `$UPLIFT_CONFIG_PATH` (TOML or JSON file),
    /// 2) `$UPLIFT_CONFIG_JSON` (inline JSON),
    /// 3) `uplift.toml` / `config/uplift.toml` in the working directory,
    /// 4) defaults.
    pub fn load_from_env() -> anyhow::Result<(Self, AppConfigSource)> {
        Self::load(None)
    }

    /// Blank keys are ignored so an empty variable cannot wipe a configured key.
    fn apply_signing_key(&mut self, key: Option<String>) {
        if let Some(key) = key
            && !key.trim().is_empty()
        {
            self.pipeline.uploads.signing_key = Zeroizing::new(key);
        }
    }

    fn load_base() -> anyhow::Result<(Self, AppConfigSource)> {
        if let Ok(path_str) = env::var("UPLIFT_CONFIG_PATH")
            && !path_str.trim().is_empty()
        {
            let path = PathBuf::from(path_str);
            let config = Self::load_from_file(&path)?;
            return Ok((config, AppConfigSource::EnvPath(path)));
        }

        if let Ok(raw) = env::var("UPLIFT_CONFIG_JSON")
            && !raw.trim().is_empty()
        {
            let parsed = Self::parse_json(&raw)
                .context("failed to parse UPLIFT_CONFIG_JSON")?;
            return Ok((parsed, AppConfigSource::EnvInline));
        }

        if let Some(path) = Self::find_default_file() {
            let config = Self::load_from_file(&path)?;
            return Ok((config, AppConfigSource::File(path)));
        }

        Ok((Self::default(), AppConfigSource::Default))
    }

    pub fn load_from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path).with_context(|| {
            format!("failed to read config from {}", path.display())
        })?;

        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::parse_json(&contents)
                .with_context(|| format!("invalid config {}", path.display())),
            Some("toml") => toml::from_str(&contents).map_err(|err| {
                anyhow!("invalid config {}: {}", path.display(), err)
            }),
            _ => Self::parse_from_str(&contents, &path.display().to_string()),
        }
    }

    pub fn parse_from_str(contents: &str, origin: &str) -> anyhow::Result<Self> {
        // Try TOML first, then JSON.
        toml::from_str(contents).or_else(|toml_err| {
            serde_json::from_str(contents).map_err(|json_err| {
                anyhow!(
                    "failed to parse config {}: toml error: {}; json error: {}",
                    origin,
                    toml_err,
                    json_err
                )
            })
        })
    }

    pub fn parse_json(raw: &str) -> anyhow::Result<Self> {
        serde_json::from_str(raw).map_err(|err| anyhow!("invalid config json: {err}"))
    }

    fn find_default_file() -> Option<PathBuf> {
        const CANDIDATES: &[&str] = &["uplift.toml", "config/uplift.toml"];

        CANDIDATES
            .iter()
            .map(Path::new)
            .find(|path| path.exists())
            .map(|path| path.to_path_buf())
    }
}
