use std::io::Write as _;
use std::path::Path;

use anyhow::{bail, Context, Result};

use crate::config::AzudConfig;
use crate::output;
use crate::quote::quote;
use crate::secrets::{key, store, validate::validate_all};
use crate::ssh::Pool;

pub fn init(config: &AzudConfig) -> Result<()> {
    let service = &config.service;
    let (identity, recipient) = key::generate_keypair();

    let key_path = key::save_identity(service, &identity)?;

    output::success(&format!("Key pair generated for '{}'", service));
    println!();
    output::info(&format!("Private key saved to: {}", key_path.display()));
    output::info("Add this line to [secrets] in azud.toml:");
    println!();
    println!("  [secrets]");
    println!("  recipients = [\"{}\"]", recipient);
    println!();
    output::info("For CI/CD, set the env var AZUD_AGE_KEY with the private key content.");
    output::warning("Keep the private key safe! Do not commit it to the repository.");

    Ok(())
}

pub fn set(config: &AzudConfig, pair: &str, project_root: &Path) -> Result<()> {
    let (key_name, value) = pair.split_once('=').context("expected KEY=VALUE format")?;

    let service = &config.service;
    let identity = key::load_identity(service)?;
    let recipients = key::load_recipients(&config.secrets)?;

    if recipients.is_empty() {
        bail!("no recipients configured. Add recipients to [secrets] in azud.toml.");
    }

    let mut secrets = store::read_secrets(project_root, service, &identity)?;
    secrets.insert(key_name.trim().to_string(), value.trim().to_string());
    store::write_secrets(project_root, service, &secrets, &recipients)?;

    output::success(&format!("Set {}", key_name.trim()));
    Ok(())
}

pub fn unset(config: &AzudConfig, key_name: &str, project_root: &Path) -> Result<()> {
    let service = &config.service;
    let identity = key::load_identity(service)?;
    let recipients = key::load_recipients(&config.secrets)?;

    if recipients.is_empty() {
        bail!("no recipients configured. Add recipients to [secrets] in azud.toml.");
    }

    let mut secrets = store::read_secrets(project_root, service, &identity)?;

    if secrets.remove(key_name).is_none() {
        output::warning(&format!("key '{}' not found", key_name));
        return Ok(());
    }

    store::write_secrets(project_root, service, &secrets, &recipients)?;

    output::success(&format!("Removed {}", key_name));
    Ok(())
}

pub fn list(config: &AzudConfig, reveal: bool, project_root: &Path) -> Result<()> {
    let service = &config.service;
    let identity = key::load_identity(service)?;
    let secrets = store::read_secrets(project_root, service, &identity)?;

    if secrets.is_empty() {
        output::info(&format!("No secrets for '{}'", service));
        return Ok(());
    }

    output::header(&format!("Secrets for '{}'", service));
    for (key_name, value) in &secrets {
        if reveal {
            println!("  {}={}", key_name, value);
        } else {
            println!("  {}={}", key_name, mask_value(value));
        }
    }
    Ok(())
}

pub fn edit(config: &AzudConfig, project_root: &Path) -> Result<()> {
    let service = &config.service;
    let identity = key::load_identity(service)?;
    let recipients = key::load_recipients(&config.secrets)?;

    if recipients.is_empty() {
        bail!("no recipients configured. Add recipients to [secrets] in azud.toml.");
    }

    let secrets = store::read_secrets(project_root, service, &identity)?;
    let content = store::serialize_dotenv(&secrets);

    let mut tmpfile = tempfile::Builder::new()
        .prefix("azud-secrets-")
        .suffix(".env")
        .tempfile()
        .context("failed to create temp file")?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(tmpfile.path(), std::fs::Permissions::from_mode(0o600))?;
    }

    tmpfile
        .write_all(content.as_bytes())
        .context("failed to write temp file")?;
    tmpfile.flush()?;

    let editor = std::env::var("EDITOR").unwrap_or_else(|_| "vi".to_string());
    let status = std::process::Command::new(&editor)
        .arg(tmpfile.path())
        .status()
        .with_context(|| format!("failed to open editor '{}'", editor))?;

    if !status.success() {
        bail!("editor exited with error");
    }

    let edited = std::fs::read_to_string(tmpfile.path()).context("failed to read edited file")?;
    let new_secrets = store::parse_dotenv(&edited);

    store::write_secrets(project_root, service, &new_secrets, &recipients)?;

    output::success(&format!("Secrets updated for '{}'", service));
    Ok(())
}

/// Push the local encrypted secrets store to `/etc/azud/<service>/.env` on
/// every host, mode 600, then run the C7 remote validator against it.
pub async fn push(
    config: &AzudConfig,
    pool: &std::sync::Arc<Pool>,
    hosts: &[String],
    project_root: &Path,
) -> Result<()> {
    let service = &config.service;
    let identity = key::load_identity(service)?;
    let secrets = store::read_secrets(project_root, service, &identity)?;

    if secrets.is_empty() {
        output::warning(&format!("no local secrets for '{}', nothing to push", service));
        return Ok(());
    }

    let content = store::serialize_dotenv(&secrets);
    let remote_dir = format!("/etc/azud/{}", service);
    let remote_path = format!("{}/.env", remote_dir);

    let results = pool
        .for_each_host(hosts, {
            let content = content.clone();
            let remote_dir = remote_dir.clone();
            let remote_path = remote_path.clone();
            move |conn| {
                let content = content.clone();
                let remote_dir = remote_dir.clone();
                let remote_path = remote_path.clone();
                async move {
                    conn.exec(&format!("mkdir -p {}", quote(&remote_dir))).await?;
                    conn.write_file(&remote_path, &content).await?;
                    conn.exec(&format!("chmod 600 {}", quote(&remote_path))).await?;
                    Ok::<(), anyhow::Error>(())
                }
            }
        })
        .await;

    let mut failures = Vec::new();
    for (host, result) in results {
        if let Err(err) = result {
            failures.push(format!("{}: {}", host, err));
        }
    }
    if !failures.is_empty() {
        bail!("failed to push secrets to host(s):\n{}", failures.join("\n"));
    }

    let required_keys: Vec<String> = config.env.secret.clone();
    if !required_keys.is_empty() {
        let validation_failures = validate_all(pool, hosts, &remote_path, &required_keys).await?;
        if !validation_failures.is_empty() {
            for f in &validation_failures {
                output::error(&f.to_string());
            }
            bail!("remote secrets validation failed after push");
        }
    }

    output::success(&format!("pushed secrets for '{}' to {} host(s)", service, hosts.len()));
    Ok(())
}

fn mask_value(value: &str) -> String {
    if value.len() <= 4 {
        "****".to_string()
    } else {
        format!("{}****", &value[..4])
    }
}
