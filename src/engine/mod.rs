pub mod error;
pub mod plan;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::debug;

use crate::config::AzudConfig;
use crate::container::{
    resolve_env, resolve_upstream_target, ContainerClient, ContainerSpec, HealthCheckSpec,
    ImageManager,
};
use crate::history::{generate_id, DeploymentRecord, HistoryStore, RecordStatus};
use crate::hooks::{HookContext, HookKind, HookRunner};
use crate::probe;
use crate::proxy::ProxyClient;
use crate::secrets::{self, validate::validate_all};
use crate::ssh::Pool;

pub use error::EngineError;
pub use plan::{resolve_performer, DeploymentPlan};

const TOTAL_STEPS: usize = 9;

/// Everything the engine needs to drive one deploy: the config it was
/// resolved from, a connection pool, and the ambient services (history,
/// hooks, proxy) it narrates progress through and records outcomes into.
pub struct Engine {
    config: AzudConfig,
    pool: Arc<Pool>,
    history: HistoryStore,
    hooks: HookRunner,
    proxy: ProxyClient,
}

impl Engine {
    pub fn new(config: AzudConfig, state_dir: std::path::PathBuf) -> Result<Self> {
        let pool = Pool::new(&config.ssh);
        let history = HistoryStore::new(
            state_dir.join("history").join(&config.service),
            config.deploy.retain_history,
        )?;
        let hooks = HookRunner::new(&config.hooks.dir, config.hooks.timeout_secs);
        let proxy = ProxyClient::new(format!("http://{}:8081", config.proxy.host))?;
        Ok(Self {
            config,
            pool,
            history,
            hooks,
            proxy,
        })
    }

    pub fn config(&self) -> &AzudConfig {
        &self.config
    }

    /// Full deploy: prelude, per-host S0-S8, postlude. The container-rename
    /// blue/green state machine stands in for a release-directory-and-
    /// symlink model.
    pub async fn deploy(&self, plan: DeploymentPlan) -> Result<()> {
        crate::output::header(&format!(
            "Deploying {} ({}) to {} host(s)",
            plan.service,
            plan.image,
            plan.hosts.len()
        ));

        let _lock = crate::lock::LocalLock::acquire(&format!("deploy-{}", plan.service))
            .context("failed to acquire local deploy lock")?;

        let started_at = Utc::now();
        let id = generate_id(started_at);

        let previous = self.history.get_last_deployment(&plan.service).await?;
        let previous_successful = self.history.get_last_successful(&plan.service).await?;
        let record = self.build_record(
            &plan,
            &id,
            started_at,
            RecordStatus::Pending,
            previous.map(|p| p.version),
            None,
        );
        self.history.record(&record).await?;

        if let Err(err) = self.prelude(&plan).await {
            self.finalize(&plan, &id, started_at, RecordStatus::Failed, Some(err.to_string()))
                .await?;
            return Err(err);
        }

        let mut succeeded = Vec::new();
        let mut failure = None;
        for host in &plan.hosts {
            match self.deploy_to_host(&plan, host).await {
                Ok(()) => succeeded.push(host.clone()),
                Err(err) => {
                    failure = Some((host.clone(), err));
                    break;
                }
            }
        }

        if let Some((failed_host, err)) = failure {
            crate::output::warning(&format!("deploy failed on {}: {}", failed_host, err));
            if self.config.deploy.rollback_on_failure {
                for host in succeeded.iter().rev() {
                    let outcome = self
                        .rollback_host(&plan, host, previous_successful.as_ref())
                        .await;
                    if let Err(rollback_err) = outcome {
                        crate::output::error(&format!(
                            "rollback of {} also failed: {}",
                            host, rollback_err
                        ));
                    }
                }
                let ctx = self.hook_ctx(&plan, "post-rollback", None);
                let _ = self.hooks.run(HookKind::Rollback, &ctx).await;
            }
            self.finalize(&plan, &id, started_at, RecordStatus::Failed, Some(err.to_string()))
                .await?;
            return Err(err);
        }

        self.postlude(&plan, started_at).await?;
        self.finalize(&plan, &id, started_at, RecordStatus::Succeeded, None)
            .await?;

        crate::output::success(&format!("deploy of {} complete", plan.service));
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn build_record(
        &self,
        plan: &DeploymentPlan,
        id: &str,
        started_at: DateTime<Utc>,
        status: RecordStatus,
        previous_version: Option<String>,
        error: Option<String>,
    ) -> DeploymentRecord {
        let completed_at = match status {
            RecordStatus::Pending => None,
            _ => Some(Utc::now()),
        };
        let duration_secs = completed_at.map(|c| (c - started_at).num_seconds());
        DeploymentRecord {
            id: id.to_string(),
            service: plan.service.clone(),
            image: plan.image.clone(),
            version: plan.version.clone(),
            hosts: plan.hosts.clone(),
            destination: self.config.proxy.host.clone(),
            performer: plan.performer.clone(),
            started_at,
            completed_at,
            recorded_at: Utc::now(),
            status,
            previous_version,
            error,
            duration_secs,
            metadata: std::collections::HashMap::new(),
        }
    }

    async fn prelude(&self, plan: &DeploymentPlan) -> Result<()> {
        let ctx = self.hook_ctx(plan, "prelude", None);
        self.hooks
            .run(HookKind::PreDeploy, &ctx)
            .await
            .map_err(|e| EngineError::hook("prelude", e))?;

        if !self.config.env.secret.is_empty() {
            let remote_path = format!("{}/.env", self.remote_service_dir());
            let failures =
                validate_all(&self.pool, &plan.hosts, &remote_path, &self.config.env.secret).await?;
            if !failures.is_empty() {
                let joined = failures
                    .iter()
                    .map(|f| f.to_string())
                    .collect::<Vec<_>>()
                    .join("; ");
                return Err(EngineError::precondition("all", joined).into());
            }
        }

        if let Some(registry) = &self.config.registry {
            let identity = secrets::key::load_identity(&self.config.service)
                .context("failed to load age identity for registry password")?;
            let secrets = secrets::store::read_secrets(
                &std::env::current_dir()?,
                &self.config.service,
                &identity,
            )?;
            let password = secrets
                .get(&registry.password_secret)
                .context("registry.password_secret not found in local secrets store")?
                .clone();
            for host in &plan.hosts {
                let conn = self.pool.get(host).await?;
                ImageManager::login(&conn, &registry.server, &registry.username, &password)
                    .await
                    .map_err(|e| EngineError::auth(host, e))?;
            }
        }

        ImageManager::pull_all(&self.pool, &plan.hosts, &plan.image)
            .await
            .map_err(|e| EngineError::boot("all", e))?;

        for host in &plan.hosts {
            let conn = self.pool.get(host).await?;
            let digest = ImageManager::get_digest(&conn, &plan.image).await?;
            debug!("{}: pulled {} digest {}", host, plan.image, digest);
        }

        if let Some(cmd) = &self.config.deploy.pre_deploy_command {
            let host = plan
                .hosts
                .first()
                .context("no hosts to run pre_deploy_command on")?;
            let conn = self.pool.get(host).await?;
            conn.exec(cmd)
                .await
                .map_err(|e| EngineError::precondition(host, e))?;
        }

        Ok(())
    }

    async fn postlude(&self, plan: &DeploymentPlan, started_at: DateTime<Utc>) -> Result<()> {
        let runtime_secs = (Utc::now() - started_at).num_seconds().max(0) as u64;
        let ctx = self.hook_ctx(plan, "postlude", Some(runtime_secs));
        self.hooks
            .run(HookKind::PostDeploy, &ctx)
            .await
            .map_err(|e| EngineError::hook("postlude", e))?;
        Ok(())
    }

    async fn deploy_to_host(&self, plan: &DeploymentPlan, host: &str) -> Result<()> {
        self.deploy_version_to_host(plan, host, &plan.image, &plan.version)
            .await
    }

    /// S0-S8 for a single host, against an explicit image/version rather
    /// than always `plan`'s — lets rollback-on-failure re-run the same
    /// state machine against the previously-recorded version.
    async fn deploy_version_to_host(
        &self,
        plan: &DeploymentPlan,
        host: &str,
        image: &str,
        version: &str,
    ) -> Result<()> {
        let conn = self.pool.get(host).await?;
        let wait = Duration::from_secs(self.config.deploy.deploy_timeout_secs);
        let remote_dir = self.remote_service_dir();

        conn.with_remote_lock(&remote_dir, &plan.service, wait, || {
            self.deploy_version_to_host_locked(plan, host, image, version, conn.as_ref())
        })
        .await
    }

    /// S0-S8 for a single host, run while `deploy_version_to_host` holds the
    /// remote `<state-dir>/<service>.deploy.lock` flock, so two azud clients
    /// deploying the same service to the same host can't interleave.
    async fn deploy_version_to_host_locked(
        &self,
        plan: &DeploymentPlan,
        host: &str,
        image: &str,
        version: &str,
        conn: &crate::ssh::Connection,
    ) -> Result<()> {
        crate::output::step(1, TOTAL_STEPS, &format!("[{}] S0 init", host));
        let containers = ContainerClient::new(conn);

        let role_name = self
            .config
            .role_for_host(host)
            .context("host has no owning role")?
            .to_string();
        let role = self
            .config
            .servers
            .get(&role_name)
            .context("role disappeared from config")?;

        let new_name = format!("{}-{}", plan.service, version);
        let stable_name = plan.service.clone();

        crate::output::step(2, TOTAL_STEPS, &format!("[{}] S1 pre-app-boot hook", host));
        let ctx = self.hook_ctx_for_host(plan, host, &role_name, "pre-app-boot", None);
        self.hooks
            .run(HookKind::PreAppBoot, &ctx)
            .await
            .map_err(|e| EngineError::hook(host, e))?;

        crate::output::step(3, TOTAL_STEPS, &format!("[{}] S2 boot", host));
        let env = resolve_env(&self.config, role);
        let env_file = (!self.config.env.secret.is_empty())
            .then(|| format!("{}/.env", self.remote_service_dir()));
        let network = self.config.proxy.network.as_deref();
        let health = HealthCheckSpec::from_proxy(&self.config.proxy, self.config.deploy.deploy_timeout_secs);
        let spec = ContainerSpec {
            name: &new_name,
            image,
            role,
            env: &env,
            env_file: env_file.as_deref(),
            network,
            network_alias: network.map(|_| plan.service.as_str()),
            publish_container_port: network.is_none().then_some(self.config.proxy.app_port),
            health: Some(&health),
        };
        containers
            .run(&spec)
            .await
            .map_err(|e| EngineError::boot(host, e))?;

        crate::output::step(4, TOTAL_STEPS, &format!("[{}] S3 ready-gate", host));
        probe::wait_for_ready(
            conn,
            &new_name,
            &self.config.proxy,
            Duration::from_secs(self.config.deploy.readiness_delay_secs),
            Duration::from_secs(self.config.deploy.deploy_timeout_secs),
        )
        .await
        .map_err(|e| EngineError::readiness(host, e))?;

        crate::output::step(5, TOTAL_STEPS, &format!("[{}] S4 post-app-boot hook", host));
        let ctx = self.hook_ctx_for_host(plan, host, &role_name, "post-app-boot", None);
        self.hooks
            .run(HookKind::PostAppBoot, &ctx)
            .await
            .map_err(|e| EngineError::hook(host, e))?;

        crate::output::step(6, TOTAL_STEPS, &format!("[{}] S5 proxy-add", host));
        self.proxy
            .register_service(&plan.service, &self.config.proxy)
            .await
            .map_err(|e| EngineError::proxy(host, e))?;
        let new_target = resolve_upstream_target(&containers, &new_name, &self.config.proxy)
            .await
            .map_err(|e| EngineError::proxy(host, e))?;
        self.proxy
            .add_upstream(&plan.service, &new_target)
            .await
            .map_err(|e| EngineError::proxy(host, e))?;

        let had_previous = containers.exists(&stable_name).await?;
        if had_previous {
            crate::output::step(7, TOTAL_STEPS, &format!("[{}] S6 drain-old", host));
            let stable_target = resolve_upstream_target(&containers, &stable_name, &self.config.proxy)
                .await
                .map_err(|e| EngineError::proxy(host, e))?;
            self.proxy
                .drain_upstream(
                    &plan.service,
                    &stable_target,
                    Duration::from_secs(self.config.deploy.drain_timeout_secs),
                )
                .await
                .map_err(|e| EngineError::proxy(host, e))?;
            self.proxy
                .remove_upstream(&plan.service, &stable_target)
                .await
                .map_err(|e| EngineError::proxy(host, e))?;

            crate::output::step(8, TOTAL_STEPS, &format!("[{}] S7 stop-old", host));
            containers
                .stop(&stable_name, self.config.deploy.stop_timeout_secs)
                .await
                .map_err(|e| EngineError::boot(host, e))?;
            containers
                .remove(&stable_name)
                .await
                .map_err(|e| EngineError::boot(host, e))?;
        } else {
            crate::output::step(7, TOTAL_STEPS, &format!("[{}] S6 no previous container", host));
            crate::output::step(8, TOTAL_STEPS, &format!("[{}] S7 no previous container", host));
        }

        crate::output::step(9, TOTAL_STEPS, &format!("[{}] S8 swap-to-final-name", host));
        containers
            .rename(&new_name, &stable_name)
            .await
            .map_err(|e| EngineError::boot(host, e))?;
        let renamed_target = resolve_upstream_target(&containers, &stable_name, &self.config.proxy)
            .await
            .map_err(|e| EngineError::proxy(host, e))?;
        self.proxy
            .add_upstream(&plan.service, &renamed_target)
            .await
            .map_err(|e| EngineError::proxy(host, e))?;

        crate::output::success(&format!("[{}] deployed {}", host, image));
        Ok(())
    }

    /// Undo a single host's deploy: remove the new container this attempt
    /// introduced, then — if a previously-successful version exists — drive
    /// the full S1..S8 state machine again with that version so the host
    /// ends up exactly where it started (image already cached locally, no
    /// re-pull). With no previous successful version (first deploy to an
    /// empty host), there is nothing to fall back to; the host is just left
    /// without the new container.
    async fn rollback_host(
        &self,
        plan: &DeploymentPlan,
        host: &str,
        previous_successful: Option<&DeploymentRecord>,
    ) -> Result<()> {
        let conn = self.pool.get(host).await?;
        let containers = ContainerClient::new(&conn);
        let new_name = format!("{}-{}", plan.service, plan.version);

        if let Ok(target) = resolve_upstream_target(&containers, &new_name, &self.config.proxy).await {
            let _ = self.proxy.remove_upstream(&plan.service, &target).await;
        }

        if containers.exists(&new_name).await? {
            let _ = containers.stop(&new_name, self.config.deploy.stop_timeout_secs).await;
            let _ = containers.remove(&new_name).await;
        }

        if let Some(previous) = previous_successful {
            self.deploy_version_to_host(plan, host, &previous.image, &previous.version)
                .await
                .map_err(|e| EngineError::boot(host, e))?;
        }

        let ctx = self.hook_ctx_for_host(plan, host, "", "rollback", None);
        let _ = self.hooks.run(HookKind::Rollback, &ctx).await;
        Ok(())
    }

    async fn finalize(
        &self,
        plan: &DeploymentPlan,
        id: &str,
        started_at: DateTime<Utc>,
        status: RecordStatus,
        error: Option<String>,
    ) -> Result<()> {
        let previous_version = self
            .history
            .get(&plan.service, id)
            .await?
            .and_then(|p| p.previous_version);
        let record = self.build_record(plan, id, started_at, status, previous_version, error);
        self.history.record(&record).await
    }

    fn remote_service_dir(&self) -> String {
        format!("/etc/azud/{}", self.config.service)
    }

    fn hook_ctx(&self, plan: &DeploymentPlan, role: &str, runtime_secs: Option<u64>) -> HookContext {
        HookContext {
            service: plan.service.clone(),
            image: plan.image.clone(),
            version: plan.version.clone(),
            hosts: plan.hosts.clone(),
            destination: self.config.proxy.host.clone(),
            performer: plan.performer.clone(),
            role: role.to_string(),
            recorded_at: Utc::now().to_rfc3339(),
            runtime_secs,
        }
    }

    fn hook_ctx_for_host(
        &self,
        plan: &DeploymentPlan,
        host: &str,
        role: &str,
        phase: &str,
        runtime_secs: Option<u64>,
    ) -> HookContext {
        let mut ctx = self.hook_ctx(plan, role, runtime_secs);
        ctx.destination = host.to_string();
        ctx.role = format!("{}:{}", role, phase);
        ctx
    }

    /// Top-level `azud rollback`: redeploy `to_version` (or the last
    /// successful deployment if omitted) across `hosts`, using the same
    /// per-host state machine as a normal deploy. Unlike
    /// `rollback_host` (called mid-deploy, after a partial failure), this
    /// has no "new" container to tear down first — it's just a forward
    /// deploy of an older version.
    pub async fn rollback(
        &self,
        hosts: &[String],
        to_version: Option<&str>,
        performer: &str,
    ) -> Result<()> {
        let _lock = crate::lock::LocalLock::acquire(&format!("deploy-{}", self.config.service))
            .context("failed to acquire local deploy lock")?;

        let target = match to_version {
            Some(v) => self
                .history
                .list(&self.config.service)
                .await?
                .into_iter()
                .find(|r| r.version == v && r.status == RecordStatus::Succeeded)
                .with_context(|| {
                    format!("no successful deployment of version {} found", v)
                })?,
            None => self
                .history
                .get_last_successful(&self.config.service)
                .await?
                .context("no previous successful deployment to roll back to")?,
        };

        crate::output::header(&format!(
            "Rolling back {} to {} on {} host(s)",
            self.config.service,
            target.version,
            hosts.len()
        ));

        let plan = DeploymentPlan {
            service: self.config.service.clone(),
            image: target.image.clone(),
            version: target.version.clone(),
            roles: Vec::new(),
            hosts: hosts.to_vec(),
            performer: performer.to_string(),
        };

        let started_at = Utc::now();
        let id = generate_id(started_at);

        let mut failure = None;
        for host in &plan.hosts {
            if let Err(err) = self.deploy_to_host(&plan, host).await {
                failure = Some((host.clone(), err));
                break;
            }
        }

        let ctx = self.hook_ctx(&plan, "rollback", None);
        let _ = self.hooks.run(HookKind::Rollback, &ctx).await;

        let status = if failure.is_some() {
            RecordStatus::Failed
        } else {
            RecordStatus::RolledBack
        };
        let error = failure.as_ref().map(|(h, e)| format!("{}: {}", h, e));
        let record = self.build_record(&plan, &id, started_at, status, None, error);
        self.history.record(&record).await?;

        if let Some((host, err)) = failure {
            crate::output::error(&format!("rollback failed on {}: {}", host, err));
            return Err(err);
        }

        crate::output::success(&format!(
            "rolled back {} to {}",
            self.config.service, target.version
        ));
        Ok(())
    }

    pub fn history(&self) -> &HistoryStore {
        &self.history
    }

    pub fn pool(&self) -> &Arc<Pool> {
        &self.pool
    }

    pub fn proxy(&self) -> &ProxyClient {
        &self.proxy
    }
}
