//! Configuration for deepdive.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (DEEPDIVE_HOME)
//! 2. Config file (.deepdive/config.yaml)
//! 3. Defaults (~/.deepdive)
//!
//! Config file discovery:
//! - Searches current directory and parents for .deepdive/config.yaml
//! - `paths.home` in the config file is relative to the .deepdive/ directory
//!
//! The binary resolves configuration once and passes it down explicitly.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::adapters::FabricPatterns;
use crate::core::{BudgetLimits, ResearchSettings};
use crate::dedup::DedupSettings;
use crate::merge::MergeSettings;

/// Environment variable overriding the state directory
pub const HOME_ENV: &str = "DEEPDIVE_HOME";

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub research: ResearchSettings,
    #[serde(default)]
    pub budget: BudgetLimits,
    #[serde(default)]
    pub dedup: DedupSettings,
    #[serde(default)]
    pub merge: MergeSettings,
    #[serde(default)]
    pub providers: ProvidersConfig,
}

fn default_version() -> String {
    "1.0".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PathsConfig {
    /// State directory (relative to .deepdive/)
    pub home: Option<String>,
}

/// External services
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvidersConfig {
    /// Fabric binary used for reasoning
    #[serde(default = "default_fabric_binary")]
    pub fabric_binary: String,

    /// Fabric pattern names per reasoning call
    #[serde(default)]
    pub patterns: FabricPatterns,

    /// SearxNG-compatible search endpoint
    #[serde(default = "default_search_url")]
    pub search_url: String,

    /// Ollama-compatible embeddings endpoint
    #[serde(default = "default_embedding_url")]
    pub embedding_url: String,

    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
}

fn default_fabric_binary() -> String {
    "fabric".to_string()
}
fn default_search_url() -> String {
    "http://localhost:8888".to_string()
}
fn default_embedding_url() -> String {
    "http://localhost:11434".to_string()
}
fn default_embedding_model() -> String {
    "nomic-embed-text".to_string()
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            fabric_binary: default_fabric_binary(),
            patterns: FabricPatterns::default(),
            search_url: default_search_url(),
            embedding_url: default_embedding_url(),
            embedding_model: default_embedding_model(),
        }
    }
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Absolute path to the state directory
    pub home: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    pub research: ResearchSettings,
    pub budget: BudgetLimits,
    pub dedup: DedupSettings,
    pub merge: MergeSettings,
    pub providers: ProvidersConfig,
}

impl ResolvedConfig {
    /// Defaults rooted at `home`
    pub fn with_home(home: impl Into<PathBuf>) -> Self {
        Self::from_file(home.into(), None, ConfigFile::default())
    }

    fn from_file(home: PathBuf, config_file: Option<PathBuf>, file: ConfigFile) -> Self {
        Self {
            home,
            config_file,
            research: file.research,
            budget: file.budget,
            dedup: file.dedup,
            merge: file.merge,
            providers: file.providers,
        }
    }

    /// Session journals ($DEEPDIVE_HOME/sessions)
    pub fn sessions_dir(&self) -> PathBuf {
        self.home.join("sessions")
    }

    /// Stored artifacts ($DEEPDIVE_HOME/artifacts)
    pub fn artifacts_dir(&self) -> PathBuf {
        self.home.join("artifacts")
    }

    /// Similarity index snapshot ($DEEPDIVE_HOME/index.json)
    pub fn index_path(&self) -> PathBuf {
        self.home.join("index.json")
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        self.research.validate().context("Invalid research settings")?;
        self.dedup.validate().context("Invalid dedup settings")?;

        let budget = &self.budget;
        if budget.session_limit_usd < 0.0 || budget.global_limit_usd < 0.0 {
            anyhow::bail!("budget limits must be non-negative");
        }
        if !(0.0..=1.0).contains(&budget.warn_fraction) {
            anyhow::bail!("budget.warn_fraction must be in [0, 1], got {}", budget.warn_fraction);
        }
        if !(0.0..=1.0).contains(&self.merge.section_match_threshold) {
            anyhow::bail!(
                "merge.section_match_threshold must be in [0, 1], got {}",
                self.merge.section_match_threshold
            );
        }
        Ok(())
    }
}

/// Find config file by searching `start` and its parents
fn find_config_file(start: &Path) -> Option<PathBuf> {
    let mut current = start.to_path_buf();

    loop {
        let config_path = current.join(".deepdive").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to `base`
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

/// Load configuration for the current directory
pub fn load_config() -> Result<ResolvedConfig> {
    let cwd = std::env::current_dir().context("Failed to determine current directory")?;
    let env_home = std::env::var(HOME_ENV).ok().map(PathBuf::from);
    load_config_from(&cwd, env_home)
}

/// Load configuration, discovering the config file from `start`
pub fn load_config_from(start: &Path, env_home: Option<PathBuf>) -> Result<ResolvedConfig> {
    let default_home = || -> Result<PathBuf> {
        Ok(dirs::home_dir()
            .context("Failed to determine home directory")?
            .join(".deepdive"))
    };

    let config_file = find_config_file(start);

    let config = match config_file {
        Some(ref config_path) => {
            let file = load_config_file(config_path)?;

            let home = match (env_home, &file.paths.home) {
                (Some(home), _) => home,
                (None, Some(home_path)) => {
                    let deepdive_dir = config_path.parent().unwrap_or(Path::new("."));
                    resolve_path(deepdive_dir, home_path)
                }
                (None, None) => default_home()?,
            };

            ResolvedConfig::from_file(home, config_file.clone(), file)
        }
        None => {
            let home = match env_home {
                Some(home) => home,
                None => default_home()?,
            };
            ResolvedConfig::with_home(home)
        }
    };

    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_without_file() {
        let temp = TempDir::new().unwrap();
        let config = load_config_from(temp.path(), Some(temp.path().join("state"))).unwrap();

        assert_eq!(config.home, temp.path().join("state"));
        assert!(config.config_file.is_none());
        assert_eq!(config.research.max_hops, 5);
        assert_eq!(config.dedup.thresholds.update, 0.85);
        assert_eq!(config.dedup.thresholds.merge, 0.70);
        assert_eq!(config.merge.section_match_threshold, 0.60);
        assert_eq!(config.sessions_dir(), temp.path().join("state").join("sessions"));
    }

    #[test]
    fn test_config_file_parsing() {
        let temp = TempDir::new().unwrap();
        let deepdive_dir = temp.path().join(".deepdive");
        std::fs::create_dir_all(&deepdive_dir).unwrap();

        let config_path = deepdive_dir.join("config.yaml");
        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(
            file,
            r#"
version: "1.0"
paths:
  home: ./state
research:
  max_hops: 3
budget:
  session_limit_usd: 0.5
dedup:
  thresholds:
    update: 0.9
providers:
  search_url: http://search.local
"#
        )
        .unwrap();

        let nested = temp.path().join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();
        let config = load_config_from(&nested, None).unwrap();

        assert_eq!(config.config_file, Some(config_path));
        assert_eq!(config.home, deepdive_dir.join("state"));
        assert_eq!(config.research.max_hops, 3);
        assert_eq!(config.research.confidence_target, 0.70);
        assert_eq!(config.budget.session_limit_usd, 0.5);
        assert_eq!(config.budget.global_limit_usd, 10.0);
        assert_eq!(config.dedup.thresholds.update, 0.9);
        assert_eq!(config.dedup.thresholds.merge, 0.70);
        assert_eq!(config.providers.search_url, "http://search.local");
        assert_eq!(config.providers.fabric_binary, "fabric");
    }

    #[test]
    fn test_env_home_wins_over_file() {
        let temp = TempDir::new().unwrap();
        let deepdive_dir = temp.path().join(".deepdive");
        std::fs::create_dir_all(&deepdive_dir).unwrap();
        std::fs::write(deepdive_dir.join("config.yaml"), "paths:\n  home: ./state\n").unwrap();

        let config = load_config_from(temp.path(), Some(PathBuf::from("/tmp/elsewhere"))).unwrap();
        assert_eq!(config.home, PathBuf::from("/tmp/elsewhere"));
    }

    #[test]
    fn test_invalid_thresholds_rejected() {
        let temp = TempDir::new().unwrap();
        let deepdive_dir = temp.path().join(".deepdive");
        std::fs::create_dir_all(&deepdive_dir).unwrap();
        std::fs::write(
            deepdive_dir.join("config.yaml"),
            "dedup:\n  thresholds:\n    update: 0.5\n    merge: 0.7\n",
        )
        .unwrap();

        assert!(load_config_from(temp.path(), Some(temp.path().to_path_buf())).is_err());
    }

    #[test]
    fn test_resolve_relative_path() {
        let base = PathBuf::from("/home/user/project");

        assert_eq!(
            resolve_path(&base, "../sibling"),
            PathBuf::from("/home/user/project/../sibling")
        );
        assert_eq!(
            resolve_path(&base, "/absolute/path"),
            PathBuf::from("/absolute/path")
        );
    }
}
