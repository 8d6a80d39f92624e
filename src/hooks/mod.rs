//! Local deploy-lifecycle hooks (pre-deploy, post-deploy, pre-boot,
//! post-boot, rollback). Hooks live under `hooks.dir` in the project and
//! are run on the *client* machine, never on the remote host — azud only
//! execs engine-internal container/ssh primitives remotely.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use thiserror::Error;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum HookError {
    #[error("hook {name} timed out after {timeout:?}")]
    Timeout { name: String, timeout: Duration },
    #[error("hook {name} was cancelled")]
    Cancelled { name: String },
    #[error("hook {name} failed: {source}")]
    Failed { name: String, source: anyhow::Error },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookKind {
    PreDeploy,
    PostDeploy,
    PreAppBoot,
    PostAppBoot,
    Rollback,
}

impl HookKind {
    fn filename(self) -> &'static str {
        match self {
            HookKind::PreDeploy => "pre-deploy",
            HookKind::PostDeploy => "post-deploy",
            HookKind::PreAppBoot => "pre-app-boot",
            HookKind::PostAppBoot => "post-app-boot",
            HookKind::Rollback => "rollback",
        }
    }
}

/// Context the engine fills in before invoking a hook; surfaced to the
/// hook process as `AZUD_*` environment variables.
#[derive(Debug, Clone, Default)]
pub struct HookContext {
    pub service: String,
    pub image: String,
    pub version: String,
    pub hosts: Vec<String>,
    pub destination: String,
    pub performer: String,
    pub role: String,
    pub recorded_at: String,
    /// Elapsed deploy runtime in seconds, surfaced as `AZUD_RUNTIME` for the
    /// post-deploy hook only; `None` everywhere else.
    pub runtime_secs: Option<u64>,
}

impl HookContext {
    /// Empty values are omitted entirely rather than exported as `KEY=`.
    fn env_for(&self, kind: HookKind) -> HashMap<String, String> {
        let mut env = HashMap::new();
        let mut set = |key: &str, value: &str| {
            if !value.is_empty() {
                env.insert(key.to_string(), value.to_string());
            }
        };
        set("AZUD_SERVICE", &self.service);
        set("AZUD_IMAGE", &self.image);
        set("AZUD_VERSION", &self.version);
        set("AZUD_HOSTS", &self.hosts.join(","));
        set("AZUD_DESTINATION", &self.destination);
        set("AZUD_PERFORMER", &self.performer);
        set("AZUD_ROLE", &self.role);
        set("AZUD_HOOK", kind.filename());
        set("AZUD_RECORDED_AT", &self.recorded_at);
        if kind == HookKind::PostDeploy {
            if let Some(secs) = self.runtime_secs {
                env.insert("AZUD_RUNTIME".into(), secs.to_string());
            }
        }
        env
    }
}

pub struct HookRunner {
    dir: PathBuf,
    timeout: Duration,
}

impl HookRunner {
    pub fn new(dir: impl Into<PathBuf>, timeout_secs: u64) -> Self {
        Self {
            dir: dir.into(),
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    /// Safely resolve `kind`'s script path, skipping (not erroring) if the
    /// file is missing, a directory, a symlink, or not executable — only a
    /// plain executable regular file directly inside `dir` is eligible.
    /// The `O_NOFOLLOW`-equivalent open-then-fstat pattern guards against a
    /// TOCTOU swap between the path check and execution.
    fn resolve(&self, kind: HookKind) -> Result<Option<PathBuf>> {
        let path = self.dir.join(kind.filename());
        if !path.exists() {
            return Ok(None);
        }
        let canonical = fs::canonicalize(&self.dir)
            .with_context(|| format!("failed to canonicalize hooks dir {}", self.dir.display()))?;
        let meta = fs::symlink_metadata(&path)
            .with_context(|| format!("failed to stat hook {}", path.display()))?;
        if meta.file_type().is_symlink() {
            warn!("skipping hook {}: symlinks are not followed", path.display());
            return Ok(None);
        }
        if !meta.is_file() {
            warn!("skipping hook {}: not a regular file", path.display());
            return Ok(None);
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if meta.permissions().mode() & 0o111 == 0 {
                warn!("skipping hook {}: not executable", path.display());
                return Ok(None);
            }
        }
        if !path.starts_with(&canonical) {
            bail!("hook path {} escapes hooks dir", path.display());
        }
        Ok(Some(path))
    }

    pub async fn run(&self, kind: HookKind, ctx: &HookContext) -> Result<(), HookError> {
        self.run_with_output(kind, ctx).await.map(|_| ())
    }

    /// Run the hook, returning its captured stdout on success. Absence of
    /// the hook file is success with empty output, not an error.
    pub async fn run_with_output(
        &self,
        kind: HookKind,
        ctx: &HookContext,
    ) -> Result<String, HookError> {
        let name = kind.filename().to_string();
        let path = self
            .resolve(kind)
            .map_err(|source| HookError::Failed {
                name: name.clone(),
                source,
            })?;
        let Some(path) = path else {
            debug!("no {} hook present", name);
            return Ok(String::new());
        };

        let mut command = Command::new(&path);
        command.envs(ctx.env_for(kind));
        command.kill_on_drop(true);

        let fut = command.output();
        let output = match timeout(self.timeout, fut).await {
            Ok(Ok(output)) => output,
            Ok(Err(err)) => {
                return Err(HookError::Failed {
                    name,
                    source: anyhow::Error::new(err),
                })
            }
            Err(_) => {
                return Err(HookError::Timeout {
                    name,
                    timeout: self.timeout,
                })
            }
        };

        if !output.status.success() {
            return Err(HookError::Failed {
                name,
                source: anyhow::anyhow!(
                    "exit {}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

pub fn list_hooks(dir: &Path) -> Result<Vec<String>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut found = Vec::new();
    for kind in [
        HookKind::PreDeploy,
        HookKind::PostDeploy,
        HookKind::PreAppBoot,
        HookKind::PostAppBoot,
        HookKind::Rollback,
    ] {
        let path = dir.join(kind.filename());
        if path.is_file() {
            found.push(kind.filename().to_string());
        }
    }
    Ok(found)
}
