use std::time::Duration;

use anyhow::{bail, Context, Result};
use openssh::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::time::timeout;
use tracing::debug;

use super::Connection;
use crate::quote::quote;

impl Connection {
    /// Run `body` while holding an exclusive remote `flock` on
    /// `<state_dir>/<name>.deploy.lock`, waiting up to `wait` for the lock
    /// before giving up.
    ///
    /// The lock is held by a long-lived remote child process, not a single
    /// exec: the spawned script takes the flock, prints an ack line, then
    /// blocks reading its stdin until we close it. We read the ack to
    /// confirm acquisition, run `body` (which execs freely on this same
    /// multiplexed session), then shut down the child's stdin so its `cat`
    /// hits EOF and the script exits, dropping the flock. This keeps the
    /// lock held for exactly `body`'s lifetime instead of releasing before
    /// `body` even starts.
    pub async fn with_remote_lock<F, Fut, T>(
        &self,
        state_dir: &str,
        name: &str,
        wait: Duration,
        body: F,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let lock_path = format!("{}/{}.deploy.lock", state_dir, name);
        let acquire_watchdog = wait + Duration::from_secs(5);

        debug!("acquiring remote lock {} on {}", lock_path, self.host());

        let script = format!(
            "mkdir -p {dir} && exec 9>{lock} && flock -x -w {secs} 9 || exit 1; echo AZUD_LOCKED; cat >/dev/null",
            dir = quote(state_dir),
            lock = quote(&lock_path),
            secs = wait.as_secs(),
        );

        let mut child = self
            .session
            .command("bash")
            .arg("-c")
            .arg(&script)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .await
            .with_context(|| format!("failed to spawn remote lock holder on {}", self.host()))?;

        let mut stdout = BufReader::new(
            child
                .stdout()
                .take()
                .context("remote lock holder has no stdout")?,
        );

        let mut ack = String::new();
        let read_result = timeout(acquire_watchdog, stdout.read_line(&mut ack)).await;

        let ack_ok = matches!(read_result, Ok(Ok(n)) if n > 0) && ack.trim() == "AZUD_LOCKED";
        if !ack_ok {
            let _ = child.stdin().take();
            let _ = timeout(Duration::from_secs(5), child.wait()).await;
            match read_result {
                Ok(Ok(0)) | Err(_) => bail!(
                    "timed out waiting for remote lock {} on {}",
                    lock_path,
                    self.host()
                ),
                Ok(Ok(_)) => bail!(
                    "unexpected output acquiring remote lock on {}: {}",
                    self.host(),
                    ack.trim()
                ),
                Ok(Err(err)) => bail!("failed to read remote lock ack on {}: {}", self.host(), err),
            }
        }

        let body_result = body().await;

        if let Some(mut stdin) = child.stdin().take() {
            let _ = stdin.shutdown().await;
        }
        match timeout(Duration::from_secs(10), child.wait()).await {
            Ok(Ok(status)) if !status.success() => {
                debug!(
                    "remote lock holder on {} exited with {:?} after release",
                    self.host(),
                    status
                );
            }
            Ok(Err(err)) => debug!("error waiting on remote lock holder on {}: {}", self.host(), err),
            Err(_) => debug!("timed out waiting for remote lock holder on {} to exit", self.host()),
            _ => {}
        }

        body_result
    }
}
