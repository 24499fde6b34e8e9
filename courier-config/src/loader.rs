use std::{
    env, fs,
    net::SocketAddr,
    path::{Path, PathBuf},
};

use anyhow::{Context, anyhow};
use tracing::debug;

use crate::models::CourierConfig;

/// Source that produced the configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum CourierConfigSource {
    #[default]
    Default,
    EnvPath(PathBuf),
    EnvInline,
    File(PathBuf),
}

const DEFAULT_CANDIDATES: &[&str] = &[
    "courier.toml",
    "courier.json",
    "config/courier.toml",
    "config/courier.json",
];

impl CourierConfig {
    /// Load configuration using environment variables.
    /// Evaluation order:
    /// 1) `$COURIER_CONFIG_PATH` (TOML or JSON file),
    /// 2) `$COURIER_CONFIG_JSON` (inline JSON),
    /// 3) `courier.toml`, `courier.json`, `config/courier.{toml,json}`,
    /// 4) defaults.
    ///
    /// `DATABASE_URL` and `COURIER_METRICS_LISTEN` then override the loaded
    /// values. Call `dotenvy::dotenv()` first to pick them up from `.env`.
    pub fn load_from_env() -> anyhow::Result<(Self, CourierConfigSource)> {
        let cwd = env::current_dir().context("failed to resolve working directory")?;
        Self::load_with(|key| env::var(key).ok(), &cwd)
    }

    /// [`CourierConfig::load_from_env`] with an injectable variable lookup
    /// and base directory for the default file candidates.
    pub fn load_with<F>(lookup: F, base_dir: &Path) -> anyhow::Result<(Self, CourierConfigSource)>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let (mut config, source) = if let Some(path) = var("COURIER_CONFIG_PATH") {
            let path = PathBuf::from(path);
            (Self::load_from_file(&path)?, CourierConfigSource::EnvPath(path))
        } else if let Some(raw) = var("COURIER_CONFIG_JSON") {
            let parsed = Self::parse_json(&raw).context("failed to parse COURIER_CONFIG_JSON")?;
            (parsed, CourierConfigSource::EnvInline)
        } else if let Some(path) = Self::find_default_file(base_dir) {
            (Self::load_from_file(&path)?, CourierConfigSource::File(path))
        } else {
            (Self::default(), CourierConfigSource::Default)
        };

        if let Some(url) = var("DATABASE_URL") {
            debug!("database url taken from DATABASE_URL");
            config.database.url = Some(url);
        }
        if let Some(listen) = var("COURIER_METRICS_LISTEN") {
            let addr: SocketAddr = listen
                .trim()
                .parse()
                .with_context(|| format!("invalid COURIER_METRICS_LISTEN {listen:?}"))?;
            config.telemetry.metrics_listen = Some(addr);
        }

        Ok((config, source))
    }

    pub fn load_from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path).with_context(|| {
            format!("failed to read courier config from {}", path.display())
        })?;

        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::parse_json(&contents)
                .with_context(|| format!("invalid courier config {}", path.display())),
            Some("toml") => toml::from_str(&contents)
                .map_err(|err| anyhow!("invalid courier config {}: {}", path.display(), err)),
            _ => Self::parse_from_str(&contents, &path.display().to_string()),
        }
    }

    pub fn parse_from_str(contents: &str, origin: &str) -> anyhow::Result<Self> {
        // Try TOML first, then JSON.
        toml::from_str(contents).or_else(|toml_err| {
            serde_json::from_str(contents).map_err(|json_err| {
                anyhow!(
                    "failed to parse courier config {}: toml error: {}; json error: {}",
                    origin,
                    toml_err,
                    json_err
                )
            })
        })
    }

    pub fn parse_json(raw: &str) -> anyhow::Result<Self> {
        serde_json::from_str(raw).map_err(|err| anyhow!("invalid courier config json: {err}"))
    }

    fn find_default_file(base_dir: &Path) -> Option<PathBuf> {
        DEFAULT_CANDIDATES
            .iter()
            .map(|candidate| base_dir.join(candidate))
            .find(|path| path.exists())
    }
}
