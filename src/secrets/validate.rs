//! Remote validation that the `.env` file a deploy is about to rely on
//! actually exists, is owned/permissioned safely, and defines every key
//! the config's `env.secret` list expects. Modeled on the `stat`-based
//! ownership checks in `os/mod.rs::detect`, generalized from OS detection
//! to a secrets-file audit, run in parallel across every target host
//! before any container is started.

use std::collections::HashMap;

use anyhow::{Context, Result};

use crate::quote::quote;
use crate::ssh::Connection;

#[derive(Debug, Clone)]
pub enum ValidationFailure {
    MissingFile { host: String, path: String },
    Unreadable { host: String, path: String, detail: String },
    InsecurePermissions { host: String, path: String, mode: String },
    MissingKeys { host: String, keys: Vec<String> },
    EmptyValues { host: String, keys: Vec<String> },
}

impl std::fmt::Display for ValidationFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationFailure::MissingFile { host, path } => {
                write!(f, "{}: secrets file {} does not exist", host, path)
            }
            ValidationFailure::Unreadable { host, path, detail } => {
                write!(f, "{}: secrets file {} is unreadable: {}", host, path, detail)
            }
            ValidationFailure::InsecurePermissions { host, path, mode } => write!(
                f,
                "{}: secrets file {} has insecure permissions {} (expected 600 or stricter)",
                host, path, mode
            ),
            ValidationFailure::MissingKeys { host, keys } => {
                write!(f, "{}: missing required secret keys: {}", host, keys.join(", "))
            }
            ValidationFailure::EmptyValues { host, keys } => {
                write!(f, "{}: secret keys have empty values: {}", host, keys.join(", "))
            }
        }
    }
}

/// `stat`'s mode-printing format differs between GNU coreutils and BSD/
/// busybox; try each in turn.
async fn stat_mode(conn: &Connection, path: &str) -> Result<Option<String>> {
    let candidates = [
        format!("stat -c '%a %U' {} 2>/dev/null", quote(path)),
        format!("stat -f '%Lp %Su' {} 2>/dev/null", quote(path)),
        format!("busybox stat -c '%a %U' {} 2>/dev/null", quote(path)),
    ];
    for cmd in candidates {
        if let Ok(out) = conn.exec(&cmd).await {
            let out = out.trim();
            if !out.is_empty() {
                return Ok(Some(out.to_string()));
            }
        }
    }
    Ok(None)
}

fn is_secure_mode(mode: &str) -> bool {
    match mode.parse::<u32>() {
        Ok(m) => m & 0o077 == 0,
        Err(_) => false,
    }
}

/// Validate the remote `.env` at `path` on `conn`: existence, ownership
/// mode, and that every key in `required_keys` is present and non-empty.
pub async fn validate_remote_env(
    conn: &Connection,
    path: &str,
    required_keys: &[String],
) -> Result<Vec<ValidationFailure>> {
    let mut failures = Vec::new();
    let host = conn.host().to_string();

    if !conn
        .path_exists(path)
        .await
        .with_context(|| format!("failed to check existence of {} on {}", path, host))?
    {
        failures.push(ValidationFailure::MissingFile {
            host,
            path: path.to_string(),
        });
        return Ok(failures);
    }

    match stat_mode(conn, path).await {
        Ok(Some(mode_line)) => {
            if let Some((mode, _owner)) = mode_line.split_once(' ') {
                if !is_secure_mode(mode) {
                    failures.push(ValidationFailure::InsecurePermissions {
                        host: host.clone(),
                        path: path.to_string(),
                        mode: mode.to_string(),
                    });
                }
            }
        }
        Ok(None) => failures.push(ValidationFailure::Unreadable {
            host: host.clone(),
            path: path.to_string(),
            detail: "no stat variant succeeded".to_string(),
        }),
        Err(err) => failures.push(ValidationFailure::Unreadable {
            host: host.clone(),
            path: path.to_string(),
            detail: err.to_string(),
        }),
    }

    let content = conn
        .exec(&format!("cat {}", quote(path)))
        .await
        .with_context(|| format!("failed to read {} on {}", path, host))?;
    let parsed = crate::secrets::store::parse_dotenv(&content);
    let map: HashMap<String, String> = parsed.into_iter().collect();

    let missing: Vec<String> = required_keys
        .iter()
        .filter(|k| !map.contains_key(*k))
        .cloned()
        .collect();
    if !missing.is_empty() {
        failures.push(ValidationFailure::MissingKeys {
            host: host.clone(),
            keys: missing,
        });
    }

    let empty: Vec<String> = required_keys
        .iter()
        .filter(|k| map.get(*k).is_some_and(|v| v.is_empty()))
        .cloned()
        .collect();
    if !empty.is_empty() {
        failures.push(ValidationFailure::EmptyValues { host, keys: empty });
    }

    Ok(failures)
}

/// Run `validate_remote_env` across every host in parallel, grouping all
/// failures together rather than stopping at the first bad host.
pub async fn validate_all(
    pool: &std::sync::Arc<crate::ssh::Pool>,
    hosts: &[String],
    remote_path: &str,
    required_keys: &[String],
) -> Result<Vec<ValidationFailure>> {
    let remote_path = remote_path.to_string();
    let required_keys = required_keys.to_vec();
    let results = pool
        .for_each_host(hosts, move |conn| {
            let remote_path = remote_path.clone();
            let required_keys = required_keys.clone();
            async move { validate_remote_env(&conn, &remote_path, &required_keys).await }
        })
        .await;

    let mut all_failures = Vec::new();
    for (host, result) in results {
        match result {
            Ok(failures) => all_failures.extend(failures),
            Err(err) => all_failures.push(ValidationFailure::Unreadable {
                host,
                path: remote_path.clone(),
                detail: err.to_string(),
            }),
        }
    }
    Ok(all_failures)
}
