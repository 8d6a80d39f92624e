use std::collections::BTreeMap;
use std::fs;
use std::io::{Read as _, Write as _};
use std::path::{Path, PathBuf};

use age::x25519;
use anyhow::{Context, Result};
use sha2::{Digest, Sha256};

/// Directory where encrypted secrets are stored: `.azud/secrets/`.
pub fn secrets_dir(project_root: &Path) -> PathBuf {
    project_root.join(".azud").join("secrets")
}

/// Path to the encrypted secrets file for the service.
pub fn secrets_path(project_root: &Path, service: &str) -> PathBuf {
    secrets_dir(project_root).join(format!("{}.age", service))
}

/// Encrypt plaintext for the given recipients, returning armored age output.
pub fn encrypt(plaintext: &str, recipients: &[x25519::Recipient]) -> Result<Vec<u8>> {
    let encryptor = age::Encryptor::with_recipients(recipients.iter().map(|r| r as &dyn age::Recipient))
        .map_err(|e| anyhow::anyhow!("encryption setup failed: {}", e))?;

    let mut output = vec![];
    let armor_writer =
        age::armor::ArmoredWriter::wrap_output(&mut output, age::armor::Format::AsciiArmor)?;
    let mut writer = encryptor
        .wrap_output(armor_writer)
        .context("failed to create age encryptor")?;

    writer
        .write_all(plaintext.as_bytes())
        .context("failed to write encrypted data")?;

    let armor_writer = writer.finish().context("failed to finalize encryption")?;
    armor_writer.finish()?;

    Ok(output)
}

/// Decrypt armored age ciphertext using the given identity.
pub fn decrypt(ciphertext: &[u8], identity: &x25519::Identity) -> Result<String> {
    let decryptor = age::Decryptor::new(age::armor::ArmoredReader::new(ciphertext))
        .context("failed to parse age file")?;

    let mut reader = decryptor
        .decrypt(std::iter::once(identity as &dyn age::Identity))
        .map_err(|e| anyhow::anyhow!("decryption failed: {}", e))?;

    let mut plaintext = String::new();
    reader
        .read_to_string(&mut plaintext)
        .context("failed to read decrypted data")?;

    Ok(plaintext)
}

/// Parse dotenv content into a sorted map. Honors a leading `export ` and
/// skips blank/`#` lines, matching what a shell `source` of the same file
/// would define.
pub fn parse_dotenv(content: &str) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);
        if let Some((key, value)) = line.split_once('=') {
            let value = value.trim();
            let value = value
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .unwrap_or(value);
            map.insert(key.trim().to_string(), value.to_string());
        }
    }
    map
}

/// Serialize a sorted map back to dotenv format.
pub fn serialize_dotenv(map: &BTreeMap<String, String>) -> String {
    map.iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Read and decrypt secrets for the service.
pub fn read_secrets(
    project_root: &Path,
    service: &str,
    identity: &x25519::Identity,
) -> Result<BTreeMap<String, String>> {
    let path = secrets_path(project_root, service);

    if !path.exists() {
        return Ok(BTreeMap::new());
    }

    let ciphertext =
        fs::read(&path).with_context(|| format!("failed to read secrets file: {}", path.display()))?;

    let plaintext = decrypt(&ciphertext, identity)?;
    Ok(parse_dotenv(&plaintext))
}

/// Encrypt and write secrets for the service.
pub fn write_secrets(
    project_root: &Path,
    service: &str,
    secrets: &BTreeMap<String, String>,
    recipients: &[x25519::Recipient],
) -> Result<()> {
    let dir = secrets_dir(project_root);
    fs::create_dir_all(&dir).context("failed to create .azud/secrets/ directory")?;

    let plaintext = serialize_dotenv(secrets);
    let ciphertext = encrypt(&plaintext, recipients)?;

    let path = secrets_path(project_root, service);
    fs::write(&path, &ciphertext)
        .with_context(|| format!("failed to write secrets file: {}", path.display()))?;

    Ok(())
}

/// SHA-256 hash of the encrypted secrets file, used to skip re-pushing
/// unchanged secrets to a host that already has them.
pub fn compute_hash(project_root: &Path, service: &str) -> Result<Option<String>> {
    let path = secrets_path(project_root, service);

    if !path.exists() {
        return Ok(None);
    }

    let content =
        fs::read(&path).with_context(|| format!("failed to read secrets file: {}", path.display()))?;

    let mut hasher = Sha256::new();
    hasher.update(&content);
    let hash = hex::encode(hasher.finalize());

    Ok(Some(hash))
}
