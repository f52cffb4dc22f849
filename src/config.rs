use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub scan: ScanConfig,
    #[serde(default)]
    pub mutation: MutationConfig,
    #[serde(default)]
    pub display: DisplayConfig,
}

/// Graph store location and retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Overridden by `KATA_DB_PATH`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub db_path: Option<PathBuf>,
    #[serde(default = "StoreConfig::default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "StoreConfig::default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl StoreConfig {
    fn default_max_retries() -> u32 {
        3
    }
    fn default_busy_timeout_ms() -> u64 {
        2500
    }

    /// Priority: `KATA_DB_PATH` env var > config file > default location.
    pub fn resolved_db_path(&self) -> PathBuf {
        if let Ok(p) = std::env::var("KATA_DB_PATH") {
            if !p.trim().is_empty() {
                return PathBuf::from(p);
            }
        }
        if let Some(p) = &self.db_path {
            return p.clone();
        }
        dirs::data_local_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("kata")
            .join("graph.db")
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            max_retries: Self::default_max_retries(),
            busy_timeout_ms: Self::default_busy_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    pub extensions: Vec<String>,
    pub ignore_dirs: Vec<String>,
    /// Lines after an async declaration searched for try/catch.
    pub async_window: usize,
    /// Detection threads; 0 = one per core.
    pub jobs: usize,
}

impl ScanConfig {
    fn default_async_window() -> usize {
        50
    }
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            extensions: ["js", "ts", "jsx", "tsx", "mjs", "cjs"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            ignore_dirs: vec![
                ".git".into(),
                "node_modules".into(),
                "target".into(),
                "dist".into(),
                "build".into(),
                "coverage".into(),
            ],
            async_window: Self::default_async_window(),
            jobs: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MutationConfig {
    /// Per-mutant wall-clock limit in seconds; 0 disables it.
    #[serde(default = "MutationConfig::default_timeout_secs")]
    pub timeout_secs: u64,
    /// Files mutated concurrently (never two mutants of one file).
    #[serde(default = "MutationConfig::default_jobs")]
    pub jobs: usize,
}

impl MutationConfig {
    fn default_timeout_secs() -> u64 {
        300
    }
    fn default_jobs() -> usize {
        1
    }
}

impl Default for MutationConfig {
    fn default() -> Self {
        Self {
            timeout_secs: Self::default_timeout_secs(),
            jobs: Self::default_jobs(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    pub colors: bool,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self { colors: true }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let path = get_config_path()?;

        if path.exists() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config {}", path.display()))?;
            let config: Config = toml::from_str(&content)
                .with_context(|| format!("Invalid config {}", path.display()))?;
            Ok(config)
        } else {
            Ok(Config::default())
        }
    }

    pub fn save(&self) -> Result<()> {
        let path = get_config_path()?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(&path, content)?;
        Ok(())
    }

    pub fn create_default() -> Result<PathBuf> {
        let config = Config::default();
        config.save()?;
        get_config_path()
    }
}

/// `KATA_CONFIG` overrides the per-user location.
fn get_config_path() -> Result<PathBuf> {
    if let Ok(p) = std::env::var("KATA_CONFIG") {
        if !p.trim().is_empty() {
            return Ok(PathBuf::from(p));
        }
    }
    let config_dir = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
    Ok(config_dir.join("kata").join("config.toml"))
}

pub fn show_config(init: bool) -> Result<()> {
    if init {
        let path = Config::create_default()?;
        println!("Wrote default config to {}", path.display());
        return Ok(());
    }

    let path = get_config_path()?;
    println!("Config: {}", path.display());

    let config = if path.exists() {
        Config::load()?
    } else {
        println!("(default config, file not created)");
        Config::default()
    };
    println!("Database: {}", config.store.resolved_db_path().display());
    println!();
    println!("{}", toml::to_string_pretty(&config)?);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_js_family_and_fifty_line_window() {
        let cfg = Config::default();
        assert!(cfg.scan.extensions.iter().any(|e| e == "ts"));
        assert!(cfg.scan.ignore_dirs.iter().any(|d| d == "node_modules"));
        assert_eq!(cfg.scan.async_window, 50);
        assert_eq!(cfg.mutation.timeout_secs, 300);
        assert_eq!(cfg.mutation.jobs, 1);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let cfg: Config = toml::from_str(
            "[mutation]\ntimeout_secs = 12\n\n[store]\ndb_path = \"/tmp/k.db\"\n",
        )
        .unwrap();
        assert_eq!(cfg.mutation.timeout_secs, 12);
        assert_eq!(cfg.mutation.jobs, 1);
        assert_eq!(cfg.store.db_path, Some(PathBuf::from("/tmp/k.db")));
        assert_eq!(cfg.store.max_retries, 3);
        assert_eq!(cfg.scan.async_window, 50);
    }

    #[test]
    fn config_round_trips_through_toml() {
        let text = toml::to_string_pretty(&Config::default()).unwrap();
        let back: Config = toml::from_str(&text).unwrap();
        assert_eq!(back.scan.extensions, Config::default().scan.extensions);
    }
}
