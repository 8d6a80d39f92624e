//! Readiness/liveness probing. Tries to exec an HTTP check tool inside the
//! target container first (curl, then wget, then busybox wget); if none of
//! those exist, falls back to a short-lived helper container on the same
//! network that does have one. A poll loop generalized from Docker's own
//! `docker inspect --format='{{.State.Health.Status}}'` healthcheck state
//! to an azud-driven HTTP probe against an arbitrary path.

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use regex::Regex;
use tracing::debug;

use crate::config::ProxyConfig;
use crate::container::{helper_container_name, ContainerClient};
use crate::quote::quote;
use crate::ssh::Connection;

const PROBE_UNSUPPORTED_EXIT_CODES: [i32; 2] = [126, 127];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    Ready,
    NotReady,
    Unsupported,
}

/// Candidate exec-ladder commands, tried in order until one isn't
/// "command not found" on the target container.
fn ladder(path: &str, port: u16) -> Vec<String> {
    let url = quote(&format!("http://127.0.0.1:{}{}", port, path));
    vec![
        format!("curl -fsS -o /dev/null -w '%{{http_code}}' {}", url),
        format!("wget -q -O /dev/null -S {} 2>&1 | awk '/HTTP/{{print $2}}'", url),
        format!("busybox wget -q -O /dev/null -S {} 2>&1 | awk '/HTTP/{{print $2}}'", url),
    ]
}

fn not_found_pattern() -> Regex {
    Regex::new(r"(?i)not found|no such file|command not found").unwrap()
}

/// Probe `container` for readiness at `path`/`port`, trying the exec ladder
/// then falling back to a helper container on probe_unsupported.
pub async fn probe_once(
    conn: &Connection,
    container: &str,
    proxy: &ProxyConfig,
    path: &str,
) -> Result<ProbeOutcome> {
    let client = ContainerClient::new(conn);
    for cmd in ladder(path, proxy.app_port) {
        let result = client.exec_in(container, &cmd).await;
        match result {
            Ok(r) if PROBE_UNSUPPORTED_EXIT_CODES.contains(&r.exit_code)
                && not_found_pattern().is_match(&r.stderr) =>
            {
                debug!("probe command unsupported in {}: {}", container, cmd);
                continue;
            }
            Ok(r) => {
                let code: u32 = r.stdout.trim().parse().unwrap_or(0);
                return Ok(if (200..400).contains(&code) {
                    ProbeOutcome::Ready
                } else {
                    ProbeOutcome::NotReady
                });
            }
            Err(err) => {
                debug!("probe exec failed on {}: {}", container, err);
                return Ok(ProbeOutcome::NotReady);
            }
        }
    }
    Ok(ProbeOutcome::Unsupported)
}

/// Spin up a short-lived helper container on the target's network and
/// probe through it, used once the exec ladder reports `Unsupported`
/// (distroless / scratch images with no shell utilities at all).
pub async fn probe_via_helper(
    conn: &Connection,
    target_container: &str,
    proxy: &ProxyConfig,
    path: &str,
) -> Result<ProbeOutcome> {
    let helper = helper_container_name(target_container);
    let url = quote(&format!(
        "http://{}:{}{}",
        target_container, proxy.app_port, path
    ));
    let cmd = format!(
        "docker run --rm --name {} --network container:{} --pull={} {} curl -fsS -o /dev/null -w '%{{http_code}}' {}",
        quote(&helper),
        quote(target_container),
        quote(&proxy.helper_pull_policy),
        quote(&proxy.helper_image),
        url
    );
    let result = conn
        .exec_with_timeout(&cmd, Duration::from_secs(proxy.timeout_secs))
        .await
        .with_context(|| format!("helper probe failed for {}", target_container))?;
    let code: u32 = result.stdout.trim().parse().unwrap_or(0);
    Ok(if (200..400).contains(&code) {
        ProbeOutcome::Ready
    } else {
        ProbeOutcome::NotReady
    })
}

/// Poll readiness from `deploy.readiness_delay_secs` after container start
/// until `deploy_timeout`, at `proxy.interval_secs` cadence.
pub async fn wait_for_ready(
    conn: &Connection,
    container: &str,
    proxy: &ProxyConfig,
    readiness_delay: Duration,
    deploy_timeout: Duration,
) -> Result<()> {
    tokio::time::sleep(readiness_delay).await;

    let deadline = Instant::now() + deploy_timeout;
    let interval = Duration::from_secs(proxy.interval_secs.max(1));

    loop {
        let outcome = match probe_once(conn, container, proxy, &proxy.readiness_path).await? {
            ProbeOutcome::Unsupported => {
                probe_via_helper(conn, container, proxy, &proxy.readiness_path).await?
            }
            other => other,
        };

        if outcome == ProbeOutcome::Ready {
            return Ok(());
        }

        if Instant::now() >= deadline {
            anyhow::bail!(
                "readiness probe for {} did not pass within {:?}",
                container,
                deploy_timeout
            );
        }
        tokio::time::sleep(interval).await;
    }
}

/// One-shot liveness check, used by an external supervisor loop (not run
/// internally by the engine, which only cares about readiness during a
/// deploy) — exposed so `azud` callers can wire it into their own cron/
/// systemd timer if they want periodic liveness enforcement.
pub async fn check_liveness(conn: &Connection, container: &str, proxy: &ProxyConfig) -> Result<bool> {
    let Some(path) = &proxy.liveness_path else {
        return Ok(true);
    };
    if let Some(cmd) = &proxy.liveness_command {
        let client = ContainerClient::new(conn);
        let result = client.exec_in(container, cmd).await?;
        return Ok(result.success());
    }
    let outcome = probe_once(conn, container, proxy, path).await?;
    Ok(matches!(outcome, ProbeOutcome::Ready))
}
