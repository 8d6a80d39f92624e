//! Canary rollout controller: deploy a new version alongside the stable
//! one at a small traffic weight, shift weight up in steps, then either
//! promote (rename canary to stable) or roll back (remove the canary,
//! leaving stable untouched). Built from the engine's boot/ready-gate/
//! proxy primitives in the same step-numbered, `output`-narrated style as
//! the per-host deploy state machine.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::config::AzudConfig;
use crate::container::{
    resolve_env, resolve_upstream_target, ContainerClient, ContainerSpec, HealthCheckSpec,
};
use crate::engine::error::EngineError;
use crate::probe;
use crate::proxy::ProxyClient;
use crate::ssh::Pool;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CanaryStatus {
    None,
    Deploying,
    Running,
    Promoting,
    RollingBack,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanaryState {
    pub status: CanaryStatus,
    pub stable_version: Option<String>,
    pub canary_version: Option<String>,
    pub current_weight: u8,
    pub target_weight: u8,
    pub hosts: Vec<String>,
    pub canary_container: Option<String>,
}

impl Default for CanaryState {
    fn default() -> Self {
        Self {
            status: CanaryStatus::None,
            stable_version: None,
            canary_version: None,
            current_weight: 0,
            target_weight: 0,
            hosts: Vec::new(),
            canary_container: None,
        }
    }
}

impl CanaryState {
    fn path(state_dir: &std::path::Path, service: &str) -> PathBuf {
        state_dir.join(format!("{}.canary.json", service))
    }

    pub fn load(state_dir: &std::path::Path, service: &str) -> Result<Self> {
        let path = Self::path(state_dir, service);
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(&path)
            .with_context(|| format!("failed to read canary state {}", path.display()))?;
        serde_json::from_str(&content).context("failed to parse canary state")
    }

    pub fn save(&self, state_dir: &std::path::Path, service: &str) -> Result<()> {
        let path = Self::path(state_dir, service);
        let tmp = state_dir.join(format!(".{}.canary.json.tmp", service));
        let content = serde_json::to_vec_pretty(self)?;
        fs::write(&tmp, content)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }
}

pub struct CanaryController {
    config: AzudConfig,
    pool: std::sync::Arc<Pool>,
    proxy: ProxyClient,
    state_dir: PathBuf,
}

impl CanaryController {
    pub fn new(
        config: AzudConfig,
        pool: std::sync::Arc<Pool>,
        proxy: ProxyClient,
        state_dir: PathBuf,
    ) -> Self {
        Self {
            config,
            pool,
            proxy,
            state_dir,
        }
    }

    fn state(&self) -> Result<CanaryState> {
        CanaryState::load(&self.state_dir, &self.config.service)
    }

    fn save(&self, state: &CanaryState) -> Result<()> {
        state.save(&self.state_dir, &self.config.service)
    }

    /// Deploy `image`/`version` as a canary at `initial_weight` across
    /// every host in the first configured role. A canary touches one role
    /// at a time by design — fanning a canary across every role at once
    /// defeats the point of a small blast radius.
    pub async fn deploy(&self, image: &str, version: &str, hosts: &[String]) -> Result<()> {
        let mut state = self.state()?;
        if state.status != CanaryStatus::None {
            bail!(
                "a canary is already in progress for {} (status: {:?})",
                self.config.service,
                state.status
            );
        }

        let canary_cfg = &self.config.deploy.canary;
        state.status = CanaryStatus::Deploying;
        state.canary_version = Some(version.to_string());
        state.hosts = hosts.to_vec();
        state.target_weight = canary_cfg.initial_weight;
        self.save(&state)?;

        let container_name = format!("{}-canary", self.config.service);
        state.canary_container = Some(container_name.clone());

        self.proxy
            .register_service(&self.config.service, &self.config.proxy)
            .await
            .map_err(|e| EngineError::proxy("all", e))?;

        for host in hosts {
            let conn = self.pool.get(host).await?;
            let containers = ContainerClient::new(&conn);
            let role_name = self
                .config
                .role_for_host(host)
                .context("host has no owning role")?;
            let role = self.config.servers.get(role_name).unwrap();
            let env = resolve_env(&self.config, role);
            let network = self.config.proxy.network.as_deref();
            let health =
                HealthCheckSpec::from_proxy(&self.config.proxy, self.config.deploy.deploy_timeout_secs);
            let spec = ContainerSpec {
                name: &container_name,
                image,
                role,
                env: &env,
                env_file: None,
                network,
                // The canary can't share the stable container's network
                // alias (both would answer for the same name); it is only
                // addressable by its published port or container name.
                network_alias: None,
                publish_container_port: network.is_none().then_some(self.config.proxy.app_port),
                health: Some(&health),
            };

            containers
                .run(&spec)
                .await
                .map_err(|e| EngineError::boot(host, e))?;

            probe::wait_for_ready(
                &conn,
                &container_name,
                &self.config.proxy,
                Duration::from_secs(self.config.deploy.readiness_delay_secs),
                Duration::from_secs(self.config.deploy.deploy_timeout_secs),
            )
            .await
            .map_err(|e| EngineError::readiness(host, e))?;

            let canary_target = resolve_upstream_target(&containers, &container_name, &self.config.proxy)
                .await
                .map_err(|e| EngineError::proxy(host, e))?;
            self.proxy
                .add_weighted_upstream(
                    &self.config.service,
                    &canary_target,
                    Some(canary_cfg.initial_weight),
                )
                .await
                .map_err(|e| EngineError::proxy(host, e))?;

            // Best-effort: reduce the stable upstream's weight so the two
            // sides of the split sum to 100. A proxy that rejects this
            // (e.g. stable not yet weighted) shouldn't abort the canary.
            if let Ok(stable_target) =
                resolve_upstream_target(&containers, &self.config.service, &self.config.proxy).await
            {
                let _ = self
                    .proxy
                    .set_upstream_weight(
                        &self.config.service,
                        &stable_target,
                        100u8.saturating_sub(canary_cfg.initial_weight),
                    )
                    .await;
            }
        }

        state.status = CanaryStatus::Running;
        state.current_weight = canary_cfg.initial_weight;
        self.save(&state)?;

        crate::output::success(&format!(
            "canary {} running at weight {}",
            version, canary_cfg.initial_weight
        ));
        Ok(())
    }

    /// Shift the canary's traffic weight. On a failure partway through the
    /// host fan-out, hosts already updated are left at the new weight and
    /// the rest at the old one — the operator must either retry
    /// `set_weight` or call `rollback`; there is no automatic fleet-wide
    /// undo (see the open-question decision in SPEC_FULL.md §9).
    pub async fn set_weight(&self, weight: u8) -> Result<()> {
        if weight > 100 {
            bail!("weight {} out of range 0..=100", weight);
        }
        let mut state = self.state()?;
        if state.status != CanaryStatus::Running {
            bail!("no running canary for {}", self.config.service);
        }
        let container_name = state
            .canary_container
            .clone()
            .context("canary state missing container name")?;

        for host in &state.hosts {
            let conn = self.pool.get(host).await?;
            let containers = ContainerClient::new(&conn);
            let canary_target = resolve_upstream_target(&containers, &container_name, &self.config.proxy)
                .await
                .map_err(|e| EngineError::proxy(host, e))?;
            self.proxy
                .set_upstream_weight(&self.config.service, &canary_target, weight)
                .await
                .map_err(|e| EngineError::proxy(host, e))?;

            // Best-effort symmetric adjustment, same rationale as in deploy().
            if let Ok(stable_target) =
                resolve_upstream_target(&containers, &self.config.service, &self.config.proxy).await
            {
                let _ = self
                    .proxy
                    .set_upstream_weight(&self.config.service, &stable_target, 100u8.saturating_sub(weight))
                    .await;
            }
        }

        state.current_weight = weight;
        state.target_weight = weight;
        self.save(&state)?;
        crate::output::success(&format!("canary weight set to {}", weight));
        Ok(())
    }

    /// Promote: rename the canary container to the stable name on every
    /// host, remove the old stable container, and clear canary state.
    pub async fn promote(&self) -> Result<()> {
        let mut state = self.state()?;
        if state.status != CanaryStatus::Running {
            bail!("no running canary for {}", self.config.service);
        }
        state.status = CanaryStatus::Promoting;
        self.save(&state)?;

        let container_name = state
            .canary_container
            .clone()
            .context("canary state missing container name")?;
        let stable_name = self.config.service.clone();

        for host in &state.hosts {
            let conn = self.pool.get(host).await?;
            let containers = ContainerClient::new(&conn);

            if containers.exists(&stable_name).await? {
                if let Ok(old_stable_target) =
                    resolve_upstream_target(&containers, &stable_name, &self.config.proxy).await
                {
                    self.proxy
                        .drain_upstream(
                            &self.config.service,
                            &old_stable_target,
                            Duration::from_secs(self.config.deploy.drain_timeout_secs),
                        )
                        .await
                        .ok();
                    let _ = self
                        .proxy
                        .remove_upstream(&self.config.service, &old_stable_target)
                        .await;
                }
                containers
                    .stop(&stable_name, self.config.deploy.stop_timeout_secs)
                    .await
                    .map_err(|e| EngineError::boot(host, e))?;
                containers
                    .remove(&stable_name)
                    .await
                    .map_err(|e| EngineError::boot(host, e))?;
            }

            if let Ok(canary_target) =
                resolve_upstream_target(&containers, &container_name, &self.config.proxy).await
            {
                let _ = self
                    .proxy
                    .remove_upstream(&self.config.service, &canary_target)
                    .await;
            }

            containers
                .rename(&container_name, &stable_name)
                .await
                .map_err(|e| EngineError::boot(host, e))?;

            let new_stable_target = resolve_upstream_target(&containers, &stable_name, &self.config.proxy)
                .await
                .map_err(|e| EngineError::proxy(host, e))?;
            self.proxy
                .add_upstream(&self.config.service, &new_stable_target)
                .await
                .map_err(|e| EngineError::proxy(host, e))?;
        }

        let promoted_version = state.canary_version.take();
        let mut final_state = CanaryState::default();
        final_state.stable_version = promoted_version;
        self.save(&final_state)?;

        crate::output::success(&format!("canary promoted to stable for {}", self.config.service));
        Ok(())
    }

    /// Roll back: remove the canary from routing and tear it down,
    /// leaving stable fully in place and untouched.
    pub async fn rollback(&self) -> Result<()> {
        let state = self.state()?;
        if state.status == CanaryStatus::None {
            bail!("no canary in progress for {}", self.config.service);
        }
        let container_name = state
            .canary_container
            .clone()
            .context("canary state missing container name")?;

        for host in &state.hosts {
            let conn = self.pool.get(host).await?;
            let containers = ContainerClient::new(&conn);
            if let Ok(canary_target) =
                resolve_upstream_target(&containers, &container_name, &self.config.proxy).await
            {
                let _ = self
                    .proxy
                    .remove_upstream(&self.config.service, &canary_target)
                    .await;
            }
            if containers.exists(&container_name).await.unwrap_or(false) {
                let _ = containers
                    .stop(&container_name, self.config.deploy.stop_timeout_secs)
                    .await;
                let _ = containers.remove(&container_name).await;
            }
        }

        self.save(&CanaryState::default())?;
        crate::output::success(&format!("canary rolled back for {}", self.config.service));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_state_file_loads_as_default() {
        let dir = tempfile::tempdir().unwrap();
        let state = CanaryState::load(dir.path(), "api").unwrap();
        assert_eq!(state.status, CanaryStatus::None);
        assert!(state.canary_version.is_none());
    }

    #[test]
    fn state_round_trips_through_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = CanaryState::default();
        state.status = CanaryStatus::Running;
        state.canary_version = Some("42".to_string());
        state.hosts = vec!["10.0.0.1".to_string()];
        state.current_weight = 25;
        state.save(dir.path(), "api").unwrap();

        let loaded = CanaryState::load(dir.path(), "api").unwrap();
        assert_eq!(loaded.status, CanaryStatus::Running);
        assert_eq!(loaded.canary_version.as_deref(), Some("42"));
        assert_eq!(loaded.hosts, vec!["10.0.0.1".to_string()]);
        assert_eq!(loaded.current_weight, 25);
    }

    #[test]
    fn save_overwrites_previous_state_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = CanaryState::default();
        state.status = CanaryStatus::Deploying;
        state.save(dir.path(), "api").unwrap();

        let mut next = CanaryState::default();
        next.status = CanaryStatus::Promoting;
        next.target_weight = 100;
        next.save(dir.path(), "api").unwrap();

        let loaded = CanaryState::load(dir.path(), "api").unwrap();
        assert_eq!(loaded.status, CanaryStatus::Promoting);
        assert_eq!(loaded.target_weight, 100);
    }
}
