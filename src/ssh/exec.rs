use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::time::timeout;
use tracing::debug;

use super::Connection;
use crate::quote::quote;

/// Outcome of a bounded remote command: exit code, captured stdout/stderr
/// (never buffered past a few MB — callers that need streaming output use
/// `exec_streaming` instead), and the wall-clock duration.
#[derive(Debug, Clone)]
pub struct ExecResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

impl Connection {
    /// Execute a command and return stdout, failing on non-zero exit.
    pub async fn exec(&self, cmd: &str) -> Result<String> {
        let result = self.exec_raw(cmd, None).await?;
        if !result.success() {
            bail!(
                "command failed on {} (exit {}): {}\nstdout: {}\nstderr: {}",
                self.host(),
                result.exit_code,
                cmd,
                result.stdout.trim(),
                result.stderr.trim()
            );
        }
        Ok(result.stdout)
    }

    /// Execute a command, returning `Ok(true)` only on exit 0.
    pub async fn exec_ok(&self, cmd: &str) -> Result<bool> {
        Ok(self.exec_raw(cmd, None).await?.success())
    }

    /// Execute with a hard timeout; on expiry the remote process is left to
    /// the kernel (ssh closes the channel, which SIGHUPs the remote shell).
    pub async fn exec_with_timeout(&self, cmd: &str, dur: Duration) -> Result<ExecResult> {
        self.exec_raw(cmd, Some(dur)).await
    }

    async fn exec_raw(&self, cmd: &str, dur: Option<Duration>) -> Result<ExecResult> {
        debug!("[{}] exec: {}", self.host(), cmd);
        let started = std::time::Instant::now();

        let fut = self.session.command("bash").arg("-c").arg(cmd).output();

        let output = match dur {
            Some(d) => timeout(d, fut)
                .await
                .with_context(|| format!("command timed out after {:?} on {}: {}", d, self.host(), cmd))?
                .with_context(|| format!("failed to execute command on {}: {}", self.host(), cmd))?,
            None => fut
                .await
                .with_context(|| format!("failed to execute command on {}: {}", self.host(), cmd))?,
        };

        self.touch().await;

        Ok(ExecResult {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            duration: started.elapsed(),
        })
    }

    /// Check if a path exists on the remote.
    pub async fn path_exists(&self, path: &str) -> Result<bool> {
        self.exec_ok(&format!("test -e {}", quote(path))).await
    }

    /// Write content to a file on the remote via a quoted heredoc.
    pub async fn write_file(&self, path: &str, content: &str) -> Result<()> {
        let escaped = content.replace('\'', "'\\''");
        self.exec(&format!(
            "cat > {} << 'AZUD_EOF'\n{}\nAZUD_EOF",
            quote(path),
            escaped
        ))
        .await?;
        Ok(())
    }

    /// Write content to a file with sudo.
    pub async fn sudo_write_file(&self, path: &str, content: &str) -> Result<()> {
        let escaped = content.replace('\'', "'\\''");
        self.exec(&format!(
            "sudo tee {} > /dev/null << 'AZUD_EOF'\n{}\nAZUD_EOF",
            quote(path),
            escaped
        ))
        .await?;
        Ok(())
    }

    /// Create a symlink atomically (create a temp link, then rename over).
    pub async fn atomic_symlink(&self, target: &str, link: &str) -> Result<()> {
        let tmp = format!("{}_tmp", link);
        self.exec(&format!(
            "ln -sfn {} {} && mv -Tf {} {}",
            quote(target),
            quote(&tmp),
            quote(&tmp),
            quote(link)
        ))
        .await?;
        Ok(())
    }

    /// Execute a command with sudo.
    pub async fn sudo_exec(&self, cmd: &str) -> Result<String> {
        self.exec(&format!("sudo bash -c {}", quote(cmd))).await
    }
}
