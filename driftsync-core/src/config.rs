//! Local repository configuration.
//!
//! One JSON file per local repository directory, holding the replica's
//! identity. The machine name is the key into every vector clock, so it is
//! generated once at init and never changed afterwards.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use uuid::Uuid;

const CONFIG_FILE: &str = "config.json";

/// Identity and settings of one local replica.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoConfig {
    /// Unique replica id, alphanumeric. Orders conflict resolution and keys
    /// the vector clocks, so two replicas must never share it.
    pub machine_name: String,
    /// Human-readable name shown in logs and conflict-copy file names.
    pub display_name: String,
}

impl RepoConfig {
    /// Fresh config with a generated machine name.
    pub fn generate(display_name: impl Into<String>) -> Self {
        let machine_name = Uuid::new_v4().simple().to_string();
        Self {
            machine_name,
            display_name: display_name.into(),
        }
    }

    pub fn new(machine_name: impl Into<String>, display_name: impl Into<String>) -> Result<Self> {
        let config = Self {
            machine_name: machine_name.into(),
            display_name: display_name.into(),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.machine_name.is_empty()
            || !self.machine_name.chars().all(|c| c.is_ascii_alphanumeric())
        {
            bail!(
                "invalid machine name {:?}: must be non-empty and alphanumeric",
                self.machine_name
            );
        }
        Ok(())
    }

    /// Load config from a local repository directory.
    pub fn load(repo_dir: &Path) -> Result<Self> {
        let config_path = repo_dir.join(CONFIG_FILE);
        let data = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config from {:?}", config_path))?;
        let config: RepoConfig =
            serde_json::from_str(&data).with_context(|| "Failed to parse config JSON")?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to a local repository directory.
    pub fn save(&self, repo_dir: &Path) -> Result<()> {
        self.validate()?;
        fs::create_dir_all(repo_dir)?;
        let config_path = repo_dir.join(CONFIG_FILE);
        let tmp_path = config_path.with_extension("tmp");
        let data = serde_json::to_string_pretty(self)?;
        fs::write(&tmp_path, &data)?;
        fs::rename(&tmp_path, &config_path)?;
        Ok(())
    }

    pub fn exists(repo_dir: &Path) -> bool {
        repo_dir.join(CONFIG_FILE).exists()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_config_save_and_load() {
        let tmp = TempDir::new().unwrap();
        let config = RepoConfig::new("A", "alice-laptop").unwrap();
        config.save(tmp.path()).unwrap();

        assert!(RepoConfig::exists(tmp.path()));
        let loaded = RepoConfig::load(tmp.path()).unwrap();
        assert_eq!(loaded.machine_name, "A");
        assert_eq!(loaded.display_name, "alice-laptop");
    }

    #[test]
    fn test_generated_machine_name_is_valid_and_unique() {
        let a = RepoConfig::generate("a");
        let b = RepoConfig::generate("b");
        assert!(a.machine_name.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(a.machine_name, b.machine_name);
    }

    #[test]
    fn test_rejects_invalid_machine_name() {
        assert!(RepoConfig::new("", "x").is_err());
        assert!(RepoConfig::new("has space", "x").is_err());
        assert!(RepoConfig::new("has/slash", "x").is_err());
    }
}
