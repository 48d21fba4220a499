use anyhow::{Context, Result};
use dchat_core::{utils::generate_user_id, ChatCoreOptions};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// CLI configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Stable local user id, generated on first use
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub nickname: Option<String>,

    /// Drop messages we sent ourselves when the transport echoes them back
    #[serde(default = "default_ignore_own_echo")]
    pub ignore_own_echo: bool,

    /// Path to the config file
    #[serde(skip)]
    pub path: PathBuf,
}

fn default_ignore_own_echo() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            local_id: None,
            nickname: None,
            ignore_own_echo: default_ignore_own_echo(),
            path: PathBuf::new(),
        }
    }
}

impl Config {
    /// Load config from the data directory
    pub fn load(data_dir: &Path) -> Result<Self> {
        let config_path = data_dir.join("config.json");

        if config_path.exists() {
            let content =
                std::fs::read_to_string(&config_path).context("Failed to read config file")?;
            let mut config: Config =
                serde_json::from_str(&content).context("Failed to parse config file")?;
            config.path = config_path;
            Ok(config)
        } else {
            Ok(Config {
                path: config_path,
                ..Default::default()
            })
        }
    }

    /// Save config to disk
    pub fn save(&self) -> Result<()> {
        let content = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(&self.path, content).context("Failed to write config file")?;
        Ok(())
    }

    /// Return the local id, generating and saving one if missing.
    /// The flag is true when a new id was generated.
    pub fn ensure_identity(&mut self) -> Result<(String, bool)> {
        if let Some(id) = &self.local_id {
            return Ok((id.clone(), false));
        }
        let id = generate_user_id();
        self.local_id = Some(id.clone());
        self.save()?;
        Ok((id, true))
    }

    pub fn set_nickname(&mut self, nickname: &str) -> Result<()> {
        let nickname = nickname.trim();
        if nickname.is_empty() {
            anyhow::bail!("Nickname must not be empty");
        }
        self.nickname = Some(nickname.to_string());
        self.save()
    }

    /// Forget the local id and nickname
    pub fn clear_identity(&mut self) -> Result<()> {
        self.local_id = None;
        self.nickname = None;
        self.save()
    }

    pub fn core_options(&self) -> ChatCoreOptions {
        ChatCoreOptions {
            local_id: self.local_id.clone(),
            nickname: self.nickname.clone(),
            ignore_own_echo: self.ignore_own_echo,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert!(config.local_id.is_none());
        assert!(config.ignore_own_echo);
    }

    #[test]
    fn test_config_load_nonexistent() {
        let temp = TempDir::new().unwrap();
        let config = Config::load(temp.path()).unwrap();
        assert!(config.local_id.is_none());
        assert_eq!(config.path, temp.path().join("config.json"));
    }

    #[test]
    fn test_ensure_identity_persists() {
        let temp = TempDir::new().unwrap();
        let mut config = Config::load(temp.path()).unwrap();

        let (id, generated) = config.ensure_identity().unwrap();
        assert!(generated);
        assert!(id.starts_with(dchat_core::USER_ID_PREFIX));

        let mut reloaded = Config::load(temp.path()).unwrap();
        let (same, generated) = reloaded.ensure_identity().unwrap();
        assert!(!generated);
        assert_eq!(same, id);
    }

    #[test]
    fn test_nickname_round_trip() {
        let temp = TempDir::new().unwrap();
        let mut config = Config::load(temp.path()).unwrap();
        assert!(config.set_nickname("   ").is_err());
        config.set_nickname(" Alice ").unwrap();

        let reloaded = Config::load(temp.path()).unwrap();
        assert_eq!(reloaded.nickname.as_deref(), Some("Alice"));
        assert_eq!(reloaded.core_options().nickname.as_deref(), Some("Alice"));
    }

    #[test]
    fn test_clear_identity() {
        let temp = TempDir::new().unwrap();
        let mut config = Config::load(temp.path()).unwrap();
        config.ensure_identity().unwrap();
        config.clear_identity().unwrap();

        let reloaded = Config::load(temp.path()).unwrap();
        assert!(reloaded.local_id.is_none());
    }

    #[test]
    fn test_missing_echo_flag_defaults_on() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("config.json"), r#"{"localId":"user_x"}"#).unwrap();
        let config = Config::load(temp.path()).unwrap();
        assert!(config.ignore_own_echo);
        assert_eq!(config.local_id.as_deref(), Some("user_x"));
    }
}
