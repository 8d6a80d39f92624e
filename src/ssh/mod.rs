pub mod exec;
pub mod lock;
pub mod transfer;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use openssh::{KnownHosts, Session, SessionBuilder};
use sha2::{Digest, Sha256};
use tokio::process::Command;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::config::{BastionConfig, SshConfig};

const DEFAULT_MAX_IDLE: Duration = Duration::from_secs(5 * 60);
const KEYSCAN_TIMEOUT_SECS: u64 = 10;

/// A single authenticated connection to one host. `openssh` sessions are
/// natively multiplexed, so concurrent execs over the same `Session` are
/// safe and required — `with_remote_lock` keeps a lock-holding child process
/// alive on one channel while the caller runs ordinary execs on others.
pub struct Connection {
    session: Session,
    host: String,
    last_used: Mutex<Instant>,
}

impl Connection {
    pub fn host(&self) -> &str {
        &self.host
    }

    async fn touch(&self) {
        *self.last_used.lock().await = Instant::now();
    }

    async fn idle_for(&self) -> Duration {
        self.last_used.lock().await.elapsed()
    }
}

/// Pooled SSH fabric over a fixed set of hosts, shared by the deployment
/// engine, probe, and hook runner. Connections are created lazily on first
/// use and reaped by an idle sweeper task.
pub struct Pool {
    user: String,
    port: Option<u16>,
    key_paths: Vec<String>,
    bastion: Option<BastionConfig>,
    known_hosts_path: Option<String>,
    require_trusted_fingerprints: bool,
    fingerprints: HashMap<String, String>,
    max_idle: Duration,
    connections: RwLock<HashMap<String, Arc<Connection>>>,
}

impl Pool {
    pub fn new(ssh: &SshConfig) -> Arc<Self> {
        let pool = Arc::new(Self {
            user: ssh.user.clone(),
            port: ssh.port,
            key_paths: ssh.key_paths.clone(),
            bastion: ssh.bastion.clone(),
            known_hosts_path: ssh.known_hosts_path.clone(),
            require_trusted_fingerprints: ssh.require_trusted_fingerprints,
            fingerprints: ssh.fingerprints.clone(),
            max_idle: DEFAULT_MAX_IDLE,
            connections: RwLock::new(HashMap::new()),
        });
        pool.clone().spawn_idle_sweeper();
        pool
    }

    fn spawn_idle_sweeper(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            loop {
                ticker.tick().await;
                self.sweep_idle().await;
            }
        });
    }

    async fn sweep_idle(&self) {
        let mut stale = Vec::new();
        {
            let conns = self.connections.read().await;
            for (host, conn) in conns.iter() {
                if conn.idle_for().await >= self.max_idle {
                    stale.push(host.clone());
                }
            }
        }
        if stale.is_empty() {
            return;
        }
        let mut conns = self.connections.write().await;
        for host in stale {
            if let Some(conn) = conns.remove(&host) {
                debug!("closing idle ssh connection to {}", host);
                if let Err(err) = conn.session.check().await {
                    warn!("idle connection to {} was already dead: {}", host, err);
                }
            }
        }
    }

    /// Fetch (connecting if necessary) the pooled connection for `host`.
    pub async fn get(&self, host: &str) -> Result<Arc<Connection>> {
        if let Some(conn) = self.connections.read().await.get(host) {
            conn.touch().await;
            return Ok(conn.clone());
        }

        let mut conns = self.connections.write().await;
        if let Some(conn) = conns.get(host) {
            conn.touch().await;
            return Ok(conn.clone());
        }

        let session = self.connect(host).await?;
        let conn = Arc::new(Connection {
            session,
            host: host.to_string(),
            last_used: Mutex::new(Instant::now()),
        });
        conns.insert(host.to_string(), conn.clone());
        Ok(conn)
    }

    async fn connect(&self, host: &str) -> Result<Session> {
        let pinned_known_hosts = if self.require_trusted_fingerprints {
            Some(self.verify_and_pin_host_key(host).await?)
        } else {
            None
        };

        let mut builder = SessionBuilder::default();
        builder.user(self.user.clone());
        if let Some(port) = self.port {
            builder.port(port);
        }
        if let Some(bastion) = &self.bastion {
            let jump = match bastion.port {
                Some(p) => format!("{}@{}:{}", bastion.user, bastion.host, p),
                None => format!("{}@{}", bastion.user, bastion.host),
            };
            builder.jump_hosts([jump]);
        }

        self.configure_known_hosts(&mut builder, pinned_known_hosts.as_deref())?;
        self.configure_auth(&mut builder);

        debug!("connecting to {}@{}", self.user, host);
        builder
            .connect(host)
            .await
            .with_context(|| format!("failed to connect to {}@{}", self.user, host))
    }

    fn configure_known_hosts(
        &self,
        builder: &mut SessionBuilder,
        pinned_known_hosts: Option<&Path>,
    ) -> Result<()> {
        if let Some(known_hosts_path) = pinned_known_hosts {
            let config_path = write_strict_ssh_config(known_hosts_path)?;
            builder.known_hosts_check(KnownHosts::Strict);
            builder.config_file(&config_path);
            return Ok(());
        }
        match &self.known_hosts_path {
            Some(path) => {
                ensure_known_hosts_file(path)?;
                builder.known_hosts_check(KnownHosts::Add);
            }
            None => {
                builder.known_hosts_check(KnownHosts::Accept);
            }
        }
        Ok(())
    }

    fn configure_auth(&self, builder: &mut SessionBuilder) {
        // openssh(1) already walks the agent -> explicit keys -> default
        // identity files chain on its own; we only need to point it at
        // explicit key paths when the config supplies them, in order.
        if !self.key_paths.is_empty() {
            builder.keyfile(&self.key_paths[0]);
        }
    }

    /// Look up `host`'s pinned fingerprint, fetch its live key via
    /// `ssh-keyscan`, and write the single line whose computed fingerprint
    /// matches into a dedicated known_hosts file. `ssh` then enforces the
    /// match itself via `StrictHostKeyChecking`, rather than azud only
    /// checking that a config entry exists.
    async fn verify_and_pin_host_key(&self, host: &str) -> Result<PathBuf> {
        let expected = lookup_key(&self.fingerprints, host, self.port)
            .cloned()
            .with_context(|| {
                format!(
                    "host '{}' has no pinned fingerprint and require_trusted_fingerprints is set",
                    host
                )
            })?;

        let port = self.port.unwrap_or(22);
        let output = timeout_command(
            Command::new("ssh-keyscan")
                .arg("-p")
                .arg(port.to_string())
                .arg("-T")
                .arg("5")
                .arg(host),
            Duration::from_secs(KEYSCAN_TIMEOUT_SECS),
        )
        .await
        .with_context(|| format!("ssh-keyscan failed for {}", host))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut matched_line = None;
        for line in stdout.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut fields = line.split_whitespace();
            let _host_field = fields.next();
            let _key_type = fields.next();
            let Some(key_b64) = fields.next() else {
                continue;
            };
            let Ok(key_bytes) = BASE64.decode(key_b64) else {
                continue;
            };
            if fingerprint_hex(&key_bytes) == expected {
                matched_line = Some(line.to_string());
                break;
            }
        }

        let line = matched_line.with_context(|| {
            format!(
                "no host key presented by {} matches the pinned fingerprint {}",
                host, expected
            )
        })?;

        let pin_dir = crate::lock::state_dir()?.join("ssh-pins");
        std::fs::create_dir_all(&pin_dir)
            .with_context(|| format!("failed to create {}", pin_dir.display()))?;
        let known_hosts_path = pin_dir.join(format!("{}.known_hosts", sanitize_host(host)));
        std::fs::write(&known_hosts_path, format!("{}\n", line))
            .with_context(|| format!("failed to write {}", known_hosts_path.display()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&known_hosts_path, std::fs::Permissions::from_mode(0o600))
                .ok();
        }

        Ok(known_hosts_path)
    }

    /// Run `f` against every host in `hosts` concurrently, returning
    /// results in input order. Errors on individual hosts are collected
    /// rather than short-circuiting the rest of the fan-out.
    pub async fn for_each_host<F, Fut, T>(
        self: &Arc<Self>,
        hosts: &[String],
        f: F,
    ) -> Vec<(String, Result<T>)>
    where
        F: Fn(Arc<Connection>) -> Fut + Clone + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let mut handles = Vec::with_capacity(hosts.len());
        for host in hosts {
            let pool = self.clone();
            let host = host.clone();
            let f = f.clone();
            handles.push(tokio::spawn(async move {
                let result = match pool.get(&host).await {
                    Ok(conn) => f(conn).await,
                    Err(err) => Err(err),
                };
                (host, result)
            }));
        }
        let mut out = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok(pair) => out.push(pair),
                Err(join_err) => out.push(("<unknown>".to_string(), Err(join_err.into()))),
            }
        }
        out
    }

    pub async fn close_all(&self) {
        let mut conns = self.connections.write().await;
        for (host, conn) in conns.drain() {
            if let Err(err) = conn.session.check().await {
                debug!("connection to {} already closed: {}", host, err);
            }
        }
    }
}

async fn timeout_command(command: &mut Command, dur: Duration) -> Result<std::process::Output> {
    tokio::time::timeout(dur, command.output())
        .await
        .context("command timed out")?
        .context("failed to run command")
}

fn lookup_key<'a>(
    fingerprints: &'a HashMap<String, String>,
    host: &str,
    port: Option<u16>,
) -> Option<&'a String> {
    if let Some(port) = port {
        if let Some(v) = fingerprints.get(&format!("[{}]:{}", host, port)) {
            return Some(v);
        }
        if let Some(v) = fingerprints.get(&format!("{}:{}", host, port)) {
            return Some(v);
        }
    }
    fingerprints.get(host)
}

fn sanitize_host(host: &str) -> String {
    host.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
        .collect()
}

/// `Host *` stanza pinning `UserKnownHostsFile`/`StrictHostKeyChecking` at
/// the pre-verified known_hosts file, passed to `SessionBuilder::config_file`
/// so `ssh` itself — not just azud — refuses an unmatched host key.
fn write_strict_ssh_config(known_hosts_path: &Path) -> Result<PathBuf> {
    let config_path = known_hosts_path.with_extension("config");
    let content = format!(
        "Host *\n    UserKnownHostsFile {}\n    StrictHostKeyChecking yes\n",
        known_hosts_path.display()
    );
    std::fs::write(&config_path, content)
        .with_context(|| format!("failed to write {}", config_path.display()))?;
    Ok(config_path)
}

fn ensure_known_hosts_file(path: &str) -> Result<()> {
    use std::fs::OpenOptions;
    #[cfg(unix)]
    use std::os::unix::fs::OpenOptionsExt;

    let p = std::path::Path::new(path);
    if p.exists() {
        return Ok(());
    }
    if let Some(parent) = p.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create known_hosts parent dir {}", parent.display()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o700)).ok();
        }
    }
    let mut opts = OpenOptions::new();
    opts.create(true).write(true).truncate(false);
    #[cfg(unix)]
    opts.mode(0o600);
    opts.open(p)
        .with_context(|| format!("failed to create known_hosts file {}", path))?;
    Ok(())
}

/// `SHA256:<hex>` fingerprint of raw key bytes, compared against a
/// config-supplied fingerprint both when pinning a live `ssh-keyscan` result
/// and during `azud init`'s host key bootstrap flow.
pub fn fingerprint_hex(key_bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key_bytes);
    format!("SHA256:{}", hex::encode(hasher.finalize()))
}
