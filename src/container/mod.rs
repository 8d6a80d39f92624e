//! Plain-container command builder. Rather than a compose-project model,
//! azud drives bare `docker run`/`rename` so that blue/green can be
//! expressed as renaming one container over another instead of swapping a
//! release directory symlink.

use std::collections::HashMap;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tracing::debug;

use crate::config::{AzudConfig, ProxyConfig, RoleConfig};
use crate::quote::quote;
use crate::ssh::Connection;

/// Name of the helper container spawned for a given target container when
/// the target image has no usable exec shell (see `src/probe`).
pub fn helper_container_name(target: &str) -> String {
    format!("azud-hc-{}", target)
}

/// `docker run --health-*` flags, mapped from `ProxyConfig`'s readiness
/// knobs: retries is fixed at 3 and start-period is the deploy timeout, per
/// the field-mapping rule for healthcheck.
pub struct HealthCheckSpec {
    pub cmd: String,
    pub interval_secs: u64,
    pub timeout_secs: u64,
    pub start_period_secs: u64,
    pub retries: u32,
}

impl HealthCheckSpec {
    pub fn from_proxy(proxy: &ProxyConfig, deploy_timeout_secs: u64) -> Self {
        Self {
            cmd: format!(
                "curl -fsS -o /dev/null http://127.0.0.1:{}{} || exit 1",
                proxy.app_port, proxy.readiness_path
            ),
            interval_secs: proxy.interval_secs,
            timeout_secs: proxy.timeout_secs,
            start_period_secs: deploy_timeout_secs,
            retries: 3,
        }
    }
}

/// Everything `ContainerClient::run` needs to start one container. Grouped
/// into a struct since the argument list (network, healthcheck, env-file,
/// resource caps) outgrew a plain parameter list.
pub struct ContainerSpec<'a> {
    pub name: &'a str,
    pub image: &'a str,
    pub role: &'a RoleConfig,
    pub env: &'a HashMap<String, String>,
    pub env_file: Option<&'a str>,
    pub network: Option<&'a str>,
    pub network_alias: Option<&'a str>,
    pub publish_container_port: Option<u16>,
    pub health: Option<&'a HealthCheckSpec>,
}

/// Container command builder + runner bound to one remote host.
pub struct ContainerClient<'a> {
    conn: &'a Connection,
}

#[derive(Debug, Deserialize)]
struct InspectEntry {
    #[serde(rename = "State")]
    state: InspectState,
    #[serde(rename = "NetworkSettings")]
    network_settings: InspectNetworkSettings,
}

#[derive(Debug, Deserialize)]
struct InspectState {
    #[serde(rename = "Status")]
    status: String,
    #[serde(rename = "Health")]
    health: Option<InspectHealth>,
}

#[derive(Debug, Deserialize)]
struct InspectHealth {
    #[serde(rename = "Status")]
    status: String,
}

#[derive(Debug, Deserialize)]
struct InspectNetworkSettings {
    #[serde(rename = "Ports", default)]
    ports: HashMap<String, Option<Vec<PortBinding>>>,
}

#[derive(Debug, Deserialize)]
struct PortBinding {
    #[serde(rename = "HostPort")]
    host_port: String,
}

impl<'a> ContainerClient<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Build and run `docker run -d --name <name> ...` for `spec` on this
    /// host, returning the new container id.
    pub async fn run(&self, spec: &ContainerSpec<'_>) -> Result<String> {
        let mut cmd = vec!["docker".to_string(), "run".to_string(), "-d".to_string()];
        cmd.push("--name".to_string());
        cmd.push(quote(spec.name));
        cmd.push("--restart".to_string());
        cmd.push("unless-stopped".to_string());

        if let Some(network) = spec.network {
            cmd.push("--network".to_string());
            cmd.push(quote(network));
            if let Some(alias) = spec.network_alias {
                cmd.push("--network-alias".to_string());
                cmd.push(quote(alias));
            }
        }

        if let Some(container_port) = spec.publish_container_port {
            cmd.push("-p".to_string());
            cmd.push(format!("127.0.0.1::{}", container_port));
        }

        if let Some(env_file) = spec.env_file {
            cmd.push("--env-file".to_string());
            cmd.push(quote(env_file));
        }

        for (k, v) in spec.env {
            cmd.push("-e".to_string());
            cmd.push(quote(&format!("{}={}", k, v)));
        }

        for (k, v) in &spec.role.labels {
            cmd.push("--label".to_string());
            cmd.push(quote(&format!("{}={}", k, v)));
        }

        if let Some(health) = spec.health {
            cmd.push("--health-cmd".to_string());
            cmd.push(quote(&health.cmd));
            cmd.push("--health-interval".to_string());
            cmd.push(format!("{}s", health.interval_secs));
            cmd.push("--health-timeout".to_string());
            cmd.push(format!("{}s", health.timeout_secs));
            cmd.push("--health-start-period".to_string());
            cmd.push(format!("{}s", health.start_period_secs));
            cmd.push("--health-retries".to_string());
            cmd.push(health.retries.to_string());
        }

        if let Some(cpus) = spec.role.cpus {
            cmd.push("--cpus".to_string());
            cmd.push(cpus.to_string());
        }
        if let Some(memory) = &spec.role.memory {
            cmd.push("--memory".to_string());
            cmd.push(quote(memory));
        }

        cmd.push(quote(spec.image));

        let command = cmd.join(" ");
        debug!("[{}] {}", self.conn.host(), command);
        let id = self
            .conn
            .exec(&command)
            .await
            .with_context(|| format!("failed to start container {} on {}", spec.name, self.conn.host()))?;
        Ok(id.trim().to_string())
    }

    pub async fn stop(&self, name: &str, timeout_secs: u64) -> Result<()> {
        self.conn
            .exec(&format!(
                "docker stop --time {} {}",
                timeout_secs,
                quote(name)
            ))
            .await
            .with_context(|| format!("failed to stop container {} on {}", name, self.conn.host()))?;
        Ok(())
    }

    pub async fn remove(&self, name: &str) -> Result<()> {
        self.conn
            .exec(&format!("docker rm -f {}", quote(name)))
            .await
            .with_context(|| format!("failed to remove container {} on {}", name, self.conn.host()))?;
        Ok(())
    }

    /// Atomically swap a running container to `new_name`, stopping and
    /// removing whatever previously held that name first. Used for the
    /// final S8 rename-to-final-name step.
    pub async fn rename(&self, current_name: &str, new_name: &str) -> Result<()> {
        let exists = self.exists(new_name).await?;
        if exists {
            let _ = self.stop(new_name, 1).await;
            self.remove(new_name).await?;
        }
        self.conn
            .exec(&format!(
                "docker rename {} {}",
                quote(current_name),
                quote(new_name)
            ))
            .await
            .with_context(|| {
                format!(
                    "failed to rename {} -> {} on {}",
                    current_name,
                    new_name,
                    self.conn.host()
                )
            })?;
        Ok(())
    }

    pub async fn exists(&self, name: &str) -> Result<bool> {
        self.conn
            .exec_ok(&format!(
                "docker inspect {} >/dev/null 2>&1",
                quote(name)
            ))
            .await
    }

    pub async fn is_running(&self, name: &str) -> Result<bool> {
        if !self.exists(name).await? {
            return Ok(false);
        }
        let entry = self.inspect(name).await?;
        Ok(entry.state.status == "running")
    }

    pub async fn health_status(&self, name: &str) -> Result<Option<String>> {
        let entry = self.inspect(name).await?;
        Ok(entry.state.health.map(|h| h.status))
    }

    /// Host port docker published for `container_port/tcp` on `name`, read
    /// back via `docker inspect --format '{{json .NetworkSettings.Ports}}'`
    /// equivalent (the full inspect already carries it). `None` if the
    /// container has no publish for that port (e.g. network-alias mode).
    pub async fn published_port(&self, name: &str, container_port: u16) -> Result<Option<u16>> {
        let entry = self.inspect(name).await?;
        let key = format!("{}/tcp", container_port);
        let Some(Some(bindings)) = entry.network_settings.ports.get(&key) else {
            return Ok(None);
        };
        let Some(binding) = bindings.first() else {
            return Ok(None);
        };
        binding
            .host_port
            .parse::<u16>()
            .map(Some)
            .with_context(|| format!("invalid HostPort in docker inspect output for {}", name))
    }

    async fn inspect(&self, name: &str) -> Result<InspectEntry> {
        let out = self
            .conn
            .exec(&format!("docker inspect {}", quote(name)))
            .await
            .with_context(|| format!("failed to inspect {} on {}", name, self.conn.host()))?;
        let mut entries: Vec<InspectEntry> =
            serde_json::from_str(&out).context("failed to parse docker inspect JSON")?;
        entries
            .pop()
            .with_context(|| format!("docker inspect returned no entries for {}", name))
    }

    pub async fn exec_in(&self, name: &str, cmd: &str) -> Result<crate::ssh::exec::ExecResult> {
        let wrapped = format!("docker exec {} sh -c {}", quote(name), quote(cmd));
        self.conn
            .exec_with_timeout(&wrapped, std::time::Duration::from_secs(10))
            .await
    }

    pub async fn logs(&self, name: &str, tail: usize) -> Result<String> {
        self.conn
            .exec(&format!("docker logs --tail {} {}", tail, quote(name)))
            .await
    }
}

/// Resolve the identifier the proxy should route to for `name`: the
/// container-name:app-port form when a shared docker network/alias is
/// configured, or `127.0.0.1:<published-port>` discovered via inspect
/// otherwise.
pub async fn resolve_upstream_target(
    client: &ContainerClient<'_>,
    name: &str,
    proxy: &ProxyConfig,
) -> Result<String> {
    if proxy.network.is_some() {
        return Ok(format!("{}:{}", name, proxy.app_port));
    }
    let port = client
        .published_port(name, proxy.app_port)
        .await?
        .with_context(|| format!("container {} has no published port {}", name, proxy.app_port))?;
    Ok(format!("127.0.0.1:{}", port))
}

/// Registry login + pull/digest inspection, not bound to one host (runs
/// against every host in a role in parallel via the SSH pool).
pub struct ImageManager;

impl ImageManager {
    pub async fn login(
        conn: &Connection,
        server: &str,
        username: &str,
        password: &str,
    ) -> Result<()> {
        conn.exec(&format!(
            "echo {} | docker login {} -u {} --password-stdin",
            quote(password),
            quote(server),
            quote(username)
        ))
        .await
        .context("docker login failed")?;
        Ok(())
    }

    pub async fn pull(conn: &Connection, image: &str) -> Result<()> {
        conn.exec(&format!("docker pull {}", quote(image)))
            .await
            .with_context(|| format!("failed to pull {} on {}", image, conn.host()))?;
        Ok(())
    }

    /// Pull `image` on every host in `hosts` via `pool`, failing if any
    /// host fails.
    pub async fn pull_all(
        pool: &std::sync::Arc<crate::ssh::Pool>,
        hosts: &[String],
        image: &str,
    ) -> Result<()> {
        let image = image.to_string();
        let results = pool
            .for_each_host(hosts, move |conn| {
                let image = image.clone();
                async move { ImageManager::pull(&conn, &image).await }
            })
            .await;

        let mut failures = Vec::new();
        for (host, result) in results {
            if let Err(err) = result {
                failures.push(format!("{}: {}", host, err));
            }
        }
        if !failures.is_empty() {
            bail!("failed to pull image on host(s):\n{}", failures.join("\n"));
        }
        Ok(())
    }

    /// First RepoDigest reported by `docker inspect`, used to confirm every
    /// host actually pulled the same content before continuing.
    pub async fn get_digest(conn: &Connection, image: &str) -> Result<String> {
        let out = conn
            .exec(&format!(
                "docker inspect --format='{{{{index .RepoDigests 0}}}}' {}",
                quote(image)
            ))
            .await
            .with_context(|| format!("failed to read digest for {} on {}", image, conn.host()))?;
        let digest = out.trim();
        if digest.is_empty() {
            bail!("no RepoDigest found for {} on {}", image, conn.host());
        }
        Ok(digest.to_string())
    }
}

/// Resolve the env map for a role: role-level clear env merged over the
/// service-level clear env, role name excluded — used by the engine when
/// building the `docker run -e` list for a given host.
pub fn resolve_env(config: &AzudConfig, role: &RoleConfig) -> HashMap<String, String> {
    let mut env = config.env.clear.clone();
    for (k, v) in &role.env {
        env.insert(k.clone(), v.clone());
    }
    env
}
