use anyhow::{Context, Result};
use nostr::{Keys, SecretKey};
use nostr_rooms::PollConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const RELAYS_ENV: &str = "NROOMS_RELAYS";

/// CLI configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// User's private key (hex encoded)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,

    /// Default relays
    #[serde(default = "default_relays")]
    pub relays: Vec<String>,

    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_secs: u64,

    #[serde(default = "default_publish_timeout")]
    pub publish_timeout_secs: u64,

    /// Path to the config file
    #[serde(skip)]
    pub path: PathBuf,
}

fn default_relays() -> Vec<String> {
    vec![
        "wss://relay.damus.io".to_string(),
        "wss://nos.lol".to_string(),
        "wss://relay.primal.net".to_string(),
        "wss://relay.snort.social".to_string(),
    ]
}

fn default_poll_interval() -> u64 {
    nostr_rooms::DEFAULT_POLL_INTERVAL.as_secs()
}

fn default_fetch_timeout() -> u64 {
    nostr_rooms::DEFAULT_FETCH_TIMEOUT.as_secs()
}

fn default_publish_timeout() -> u64 {
    nostr_rooms::DEFAULT_PUBLISH_TIMEOUT.as_secs()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            private_key: None,
            relays: default_relays(),
            poll_interval_secs: default_poll_interval(),
            fetch_timeout_secs: default_fetch_timeout(),
            publish_timeout_secs: default_publish_timeout(),
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

    pub fn save(&self) -> Result<()> {
        let content = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(&self.path, content).context("Failed to write config file")?;
        Ok(())
    }

    pub fn set_private_key(&mut self, key: &str) -> Result<()> {
        self.private_key = Some(key.to_string());
        self.save()
    }

    pub fn clear_private_key(&mut self) -> Result<()> {
        self.private_key = None;
        self.save()
    }

    pub fn is_logged_in(&self) -> bool {
        self.private_key.is_some()
    }

    /// Generates and saves a new identity when none is configured.
    /// Returns the public key hex and whether it was generated.
    pub fn ensure_identity(&mut self) -> Result<(String, bool)> {
        if self.is_logged_in() {
            return Ok((self.public_key()?, false));
        }
        let keys = Keys::generate();
        self.set_private_key(&keys.secret_key().to_secret_hex())?;
        Ok((keys.public_key().to_hex(), true))
    }

    pub fn keys(&self) -> Result<Keys> {
        let key = self.private_key.as_ref().context("Not logged in")?;
        let bytes = hex::decode(key).context("Invalid private key format")?;
        let sk = SecretKey::from_slice(&bytes).context("Invalid secret key")?;
        Ok(Keys::new(sk))
    }

    /// Get the public key (hex)
    pub fn public_key(&self) -> Result<String> {
        Ok(self.keys()?.public_key().to_hex())
    }

    /// Relays from `NROOMS_RELAYS` (comma separated) when set, else the configured list.
    pub fn resolved_relays(&self) -> Vec<String> {
        if let Ok(value) = std::env::var(RELAYS_ENV) {
            let relays = parse_relay_list(&value);
            if !relays.is_empty() {
                return relays;
            }
        }
        self.relays.clone()
    }

    pub fn poll_config(&self) -> PollConfig {
        PollConfig {
            interval: Duration::from_secs(self.poll_interval_secs.max(1)),
            fetch_timeout: Duration::from_secs(self.fetch_timeout_secs.max(1)),
            publish_timeout: Duration::from_secs(self.publish_timeout_secs.max(1)),
        }
    }
}

fn parse_relay_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|relay| !relay.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const TEST_KEY: &str = "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef";

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert!(config.private_key.is_none());
        assert!(!config.relays.is_empty());
        assert!(!config.is_logged_in());
        assert_eq!(config.poll_config(), PollConfig::default());
    }

    #[test]
    fn test_config_load_nonexistent() {
        let temp = TempDir::new().unwrap();
        let config = Config::load(temp.path()).unwrap();
        assert!(config.private_key.is_none());
    }

    #[test]
    fn test_config_save_and_load() {
        let temp = TempDir::new().unwrap();
        let mut config = Config::load(temp.path()).unwrap();
        config.poll_interval_secs = 3;
        config.set_private_key(TEST_KEY).unwrap();

        let loaded = Config::load(temp.path()).unwrap();
        assert_eq!(loaded.private_key, Some(TEST_KEY.to_string()));
        assert!(loaded.is_logged_in());
        assert_eq!(loaded.poll_config().interval, Duration::from_secs(3));
    }

    #[test]
    fn test_config_missing_fields_use_defaults() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("config.json"), r#"{"relays":["wss://a"]}"#).unwrap();
        let config = Config::load(temp.path()).unwrap();
        assert_eq!(config.relays, vec!["wss://a".to_string()]);
        assert_eq!(config.fetch_timeout_secs, 10);
        assert_eq!(config.publish_timeout_secs, 5);
    }

    #[test]
    fn test_config_clear_private_key() {
        let temp = TempDir::new().unwrap();
        let mut config = Config::load(temp.path()).unwrap();
        config.set_private_key(TEST_KEY).unwrap();
        assert!(config.is_logged_in());

        config.clear_private_key().unwrap();
        assert!(!config.is_logged_in());
    }

    #[test]
    fn test_ensure_identity_generates_once() {
        let temp = TempDir::new().unwrap();
        let mut config = Config::load(temp.path()).unwrap();

        let (first, generated) = config.ensure_identity().unwrap();
        assert!(generated);
        let (second, generated) = config.ensure_identity().unwrap();
        assert!(!generated);
        assert_eq!(first, second);
        assert_eq!(Config::load(temp.path()).unwrap().public_key().unwrap(), first);
    }

    #[test]
    fn test_config_public_key() {
        let temp = TempDir::new().unwrap();
        let mut config = Config::load(temp.path()).unwrap();
        config.set_private_key(TEST_KEY).unwrap();

        let pubkey = config.public_key().unwrap();
        assert_eq!(pubkey.len(), 64);
    }

    #[test]
    fn test_parse_relay_list() {
        assert_eq!(
            parse_relay_list(" wss://a , ,wss://b"),
            vec!["wss://a".to_string(), "wss://b".to_string()]
        );
        assert!(parse_relay_list(" , ").is_empty());
    }
}
