use anyhow::{Context, Result};
use nostr::nips::nip19::FromBech32;
use nostr::{Keys, SecretKey, ToBech32};
use serde::Serialize;
use std::path::Path;

use super::open_cache;
use crate::config::Config;
use crate::output::Output;

#[derive(Serialize)]
struct LoginResult {
    pubkey: String,
    npub: String,
}

#[derive(Serialize)]
struct WhoamiResult {
    pubkey: String,
    npub: String,
    logged_in: bool,
}

/// Login with a private key (nsec or hex)
pub async fn login(key: &str, config: &Config, output: &Output) -> Result<()> {
    let sk = if key.starts_with("nsec1") {
        SecretKey::from_bech32(key).context("Invalid nsec key")?
    } else {
        if key.len() != 64 {
            anyhow::bail!("Invalid key length. Expected 64 hex characters or nsec.");
        }
        let bytes = hex::decode(key).context("Invalid hex key")?;
        SecretKey::from_slice(&bytes).context("Invalid secret key")?
    };
    let keys = Keys::new(sk);
    let pubkey = keys.public_key();

    let mut config = config.clone();
    config.set_private_key(&keys.secret_key().to_secret_hex())?;

    output.success(
        "login",
        LoginResult {
            pubkey: pubkey.to_hex(),
            npub: pubkey.to_bech32().unwrap_or_default(),
        },
    );
    Ok(())
}

/// Logout and clear all cached room data
pub async fn logout(data_dir: &Path, output: &Output) -> Result<()> {
    let mut config = Config::load(data_dir)?;
    config.clear_private_key()?;
    open_cache(data_dir)?.clear()?;

    output.success_message("logout", "Logged out and cleared all data");
    Ok(())
}

pub async fn whoami(config: &Config, output: &Output) -> Result<()> {
    if !config.is_logged_in() {
        output.success(
            "whoami",
            WhoamiResult {
                pubkey: String::new(),
                npub: String::new(),
                logged_in: false,
            },
        );
        return Ok(());
    }

    let pubkey = config.keys()?.public_key();
    output.success(
        "whoami",
        WhoamiResult {
            pubkey: pubkey.to_hex(),
            npub: pubkey.to_bech32().unwrap_or_default(),
            logged_in: true,
        },
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nostr_rooms::RoomKey;
    use tempfile::TempDir;

    const TEST_KEY: &str = "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef";

    #[tokio::test]
    async fn test_login_with_hex() {
        let temp = TempDir::new().unwrap();
        let config = Config::load(temp.path()).unwrap();
        let output = Output::new(true);

        login(TEST_KEY, &config, &output).await.unwrap();

        let loaded = Config::load(temp.path()).unwrap();
        assert_eq!(loaded.private_key.as_deref(), Some(TEST_KEY));
    }

    #[tokio::test]
    async fn test_login_with_nsec() {
        let temp = TempDir::new().unwrap();
        let config = Config::load(temp.path()).unwrap();
        let output = Output::new(true);

        let keys = Keys::generate();
        let nsec = keys.secret_key().to_bech32().unwrap();
        login(&nsec, &config, &output).await.unwrap();

        let loaded = Config::load(temp.path()).unwrap();
        assert_eq!(loaded.keys().unwrap().public_key(), keys.public_key());
    }

    #[tokio::test]
    async fn test_login_rejects_bad_keys() {
        let temp = TempDir::new().unwrap();
        let config = Config::load(temp.path()).unwrap();
        let output = Output::new(true);

        assert!(login("abc", &config, &output).await.is_err());
        assert!(login(&"zz".repeat(32), &config, &output).await.is_err());
        assert!(!Config::load(temp.path()).unwrap().is_logged_in());
    }

    #[tokio::test]
    async fn test_logout_clears_key_and_cache() {
        let temp = TempDir::new().unwrap();
        let config = Config::load(temp.path()).unwrap();
        let output = Output::new(true);
        login(TEST_KEY, &config, &output).await.unwrap();

        let cache = open_cache(temp.path()).unwrap();
        cache.put_room_key(&RoomKey::generate("room", 1)).unwrap();

        logout(temp.path(), &output).await.unwrap();

        assert!(!Config::load(temp.path()).unwrap().is_logged_in());
        let cache = open_cache(temp.path()).unwrap();
        assert!(cache.latest_room_key("room").unwrap().is_none());
    }
}
