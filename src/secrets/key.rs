use std::fs;
use std::path::PathBuf;

use age::secrecy::ExposeSecret;
use age::x25519;
use anyhow::{Context, Result};

use crate::config::SecretsConfig;

/// Generate a new age x25519 keypair.
pub fn generate_keypair() -> (x25519::Identity, x25519::Recipient) {
    let identity = x25519::Identity::generate();
    let recipient = identity.to_public();
    (identity, recipient)
}

/// Directory where private keys are stored: ~/.config/azud/keys/
fn keys_dir() -> Result<PathBuf> {
    let config_dir = dirs::config_dir().context("could not determine config directory")?;
    Ok(config_dir.join("azud").join("keys"))
}

/// Path to the private key file for a given service.
fn key_path(service: &str) -> Result<PathBuf> {
    Ok(keys_dir()?.join(format!("{}.key", service)))
}

/// Save identity (private key) to ~/.config/azud/keys/{service}.key with
/// permissions 600.
pub fn save_identity(service: &str, identity: &x25519::Identity) -> Result<PathBuf> {
    let dir = keys_dir()?;
    fs::create_dir_all(&dir).context("failed to create keys directory")?;

    let path = key_path(service)?;
    let content = identity.to_string();
    fs::write(&path, content.expose_secret().as_bytes()).context("failed to write identity file")?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o600))
            .context("failed to set key file permissions")?;
    }

    Ok(path)
}

/// Load identity from `AZUD_AGE_KEY` (CI/CD) or from
/// `~/.config/azud/keys/{service}.key`.
pub fn load_identity(service: &str) -> Result<x25519::Identity> {
    if let Ok(key_str) = std::env::var("AZUD_AGE_KEY") {
        let identity: x25519::Identity = key_str
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid AZUD_AGE_KEY: {}", e))?;
        return Ok(identity);
    }

    let path = key_path(service)?;
    let content = fs::read_to_string(&path)
        .with_context(|| format!("key not found at {}. Run `azud init` first.", path.display()))?;

    let identity: x25519::Identity = content
        .trim()
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid key file {}: {}", path.display(), e))?;

    Ok(identity)
}

/// Parse recipients from config (public keys).
pub fn load_recipients(config: &SecretsConfig) -> Result<Vec<x25519::Recipient>> {
    config
        .recipients
        .iter()
        .map(|r| {
            r.parse::<x25519::Recipient>()
                .map_err(|e| anyhow::anyhow!("invalid recipient '{}': {}", r, e))
        })
        .collect()
}
