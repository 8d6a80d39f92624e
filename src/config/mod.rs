use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

mod validate;

/// Top-level configuration for one service. Immutable for the lifetime of
/// one deployment invocation.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AzudConfig {
    pub service: String,
    pub image: ImageConfig,
    #[serde(default)]
    pub registry: Option<RegistryConfig>,
    pub servers: HashMap<String, RoleConfig>,
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub env: EnvConfig,
    #[serde(default)]
    pub deploy: DeployConfig,
    pub ssh: SshConfig,
    #[serde(default)]
    pub hooks: HooksConfig,
    #[serde(default)]
    pub secrets: SecretsConfig,
}

/// Age recipients (public keys) that `azud secrets push` encrypts to.
/// Matching private keys live client-side under the state dir or in
/// `AZUD_AGE_KEY`, never in this file.
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct SecretsConfig {
    #[serde(default)]
    pub recipients: Vec<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ImageConfig {
    /// `repo[:tag]`, opaque to azud — never parsed beyond splitting the tag.
    pub repository: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RegistryConfig {
    pub server: String,
    pub username: String,
    pub password_secret: String,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct RoleConfig {
    pub hosts: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub cpus: Option<f64>,
    #[serde(default)]
    pub memory: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ProxyConfig {
    pub host: String,
    #[serde(default)]
    pub alternate_hosts: Vec<String>,
    #[serde(default)]
    pub ssl: bool,
    #[serde(default)]
    pub acme_email: Option<String>,
    #[serde(default = "default_app_port")]
    pub app_port: u16,
    #[serde(default = "default_readiness_path")]
    pub readiness_path: String,
    /// `None` disables the liveness probe entirely.
    #[serde(default = "default_liveness_path")]
    pub liveness_path: Option<String>,
    #[serde(default)]
    pub liveness_command: Option<String>,
    #[serde(default = "default_probe_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_probe_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_helper_image")]
    pub helper_image: String,
    #[serde(default = "default_pull_policy")]
    pub helper_pull_policy: String,
    /// Docker network the container joins and is aliased on as the service
    /// name. When set, upstream identifiers are `<container-name>:<app_port>`
    /// and no host port is published. When unset, azud publishes the app
    /// port on an ephemeral `127.0.0.1` port and discovers it via
    /// `docker inspect` instead.
    #[serde(default)]
    pub network: Option<String>,
}

fn default_app_port() -> u16 {
    3000
}
fn default_readiness_path() -> String {
    "/up".to_string()
}
fn default_liveness_path() -> Option<String> {
    Some("/up".to_string())
}
fn default_probe_interval() -> u64 {
    2
}
fn default_probe_timeout() -> u64 {
    5
}
fn default_helper_image() -> String {
    "curlimages/curl:latest".to_string()
}
fn default_pull_policy() -> String {
    "missing".to_string()
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct EnvConfig {
    #[serde(default)]
    pub clear: HashMap<String, String>,
    #[serde(default)]
    pub secret: Vec<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DeployConfig {
    #[serde(default = "default_readiness_delay")]
    pub readiness_delay_secs: u64,
    #[serde(default = "default_deploy_timeout")]
    pub deploy_timeout_secs: u64,
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_secs: u64,
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_secs: u64,
    #[serde(default = "default_retain_containers")]
    pub retain_containers: usize,
    #[serde(default = "default_retain_history")]
    pub retain_history: usize,
    #[serde(default)]
    pub rollback_on_failure: bool,
    #[serde(default)]
    pub pre_deploy_command: Option<String>,
    #[serde(default)]
    pub canary: CanaryConfig,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            readiness_delay_secs: default_readiness_delay(),
            deploy_timeout_secs: default_deploy_timeout(),
            drain_timeout_secs: default_drain_timeout(),
            stop_timeout_secs: default_stop_timeout(),
            retain_containers: default_retain_containers(),
            retain_history: default_retain_history(),
            rollback_on_failure: false,
            pre_deploy_command: None,
            canary: CanaryConfig::default(),
        }
    }
}

fn default_readiness_delay() -> u64 {
    2
}
fn default_deploy_timeout() -> u64 {
    30
}
fn default_drain_timeout() -> u64 {
    30
}
fn default_stop_timeout() -> u64 {
    10
}
fn default_retain_containers() -> usize {
    5
}
fn default_retain_history() -> usize {
    50
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CanaryConfig {
    #[serde(default = "default_canary_initial_weight")]
    pub initial_weight: u8,
    #[serde(default = "default_canary_step_weight")]
    pub step_weight: u8,
    #[serde(default = "default_canary_step_interval")]
    pub step_interval_secs: u64,
    #[serde(default)]
    pub auto_promote: bool,
}

impl Default for CanaryConfig {
    fn default() -> Self {
        Self {
            initial_weight: default_canary_initial_weight(),
            step_weight: default_canary_step_weight(),
            step_interval_secs: default_canary_step_interval(),
            auto_promote: false,
        }
    }
}

fn default_canary_initial_weight() -> u8 {
    10
}
fn default_canary_step_weight() -> u8 {
    10
}
fn default_canary_step_interval() -> u64 {
    60
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct SshConfig {
    #[serde(default = "default_ssh_user")]
    pub user: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub key_paths: Vec<String>,
    #[serde(default)]
    pub bastion: Option<BastionConfig>,
    #[serde(default)]
    pub known_hosts_path: Option<String>,
    #[serde(default)]
    pub require_trusted_fingerprints: bool,
    /// host -> sha256 fingerprint (`SHA256:...`)
    #[serde(default)]
    pub fingerprints: HashMap<String, String>,
}

fn default_ssh_user() -> String {
    "deploy".to_string()
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct BastionConfig {
    pub host: String,
    #[serde(default = "default_ssh_user")]
    pub user: String,
    #[serde(default)]
    pub port: Option<u16>,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct HooksConfig {
    #[serde(default = "default_hooks_dir")]
    pub dir: String,
    #[serde(default = "default_hook_timeout")]
    pub timeout_secs: u64,
}

fn default_hooks_dir() -> String {
    ".azud/hooks".to_string()
}
fn default_hook_timeout() -> u64 {
    300
}

impl AzudConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        validate::validate(&config)?;

        Ok(config)
    }

    /// All hosts referenced by any role, de-duplicated, order preserved by
    /// first appearance.
    pub fn all_hosts(&self) -> Vec<String> {
        let mut seen = std::collections::HashSet::new();
        let mut hosts = Vec::new();
        for role in self.servers.values() {
            for host in &role.hosts {
                if seen.insert(host.clone()) {
                    hosts.push(host.clone());
                }
            }
        }
        hosts
    }

    pub fn hosts_for_roles(&self, roles: &[String]) -> Result<Vec<String>> {
        let mut seen = std::collections::HashSet::new();
        let mut hosts = Vec::new();
        for role_name in roles {
            let role = self
                .servers
                .get(role_name)
                .with_context(|| format!("Role '{}' not found in config", role_name))?;
            for host in &role.hosts {
                if seen.insert(host.clone()) {
                    hosts.push(host.clone());
                }
            }
        }
        Ok(hosts)
    }

    pub fn role_for_host(&self, host: &str) -> Option<&str> {
        self.servers
            .iter()
            .find(|(_, role)| role.hosts.iter().any(|h| h == host))
            .map(|(name, _)| name.as_str())
    }
}
