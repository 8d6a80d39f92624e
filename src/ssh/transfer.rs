use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine};
use tracing::debug;

use super::Connection;
use crate::quote::quote;

impl Connection {
    /// Upload `bytes` to `remote_path`, overwriting it. Transferred as
    /// base64 over the exec channel rather than a raw SCP/SFTP stream —
    /// the payloads azud moves (compose env files, helper scripts,
    /// decrypted secrets) are small text blobs, so this keeps the fabric to
    /// a single code path (`exec` + heredoc) instead of a second transport.
    pub async fn upload_file(&self, remote_path: &str, bytes: &[u8]) -> Result<()> {
        debug!(
            "[{}] uploading {} bytes to {}",
            self.host(),
            bytes.len(),
            remote_path
        );
        let encoded = STANDARD.encode(bytes);
        self.exec(&format!(
            "base64 -d > {} << 'AZUD_B64'\n{}\nAZUD_B64",
            quote(remote_path),
            encoded
        ))
        .await
        .with_context(|| format!("failed to upload {} to {}", remote_path, self.host()))?;
        Ok(())
    }

    /// Download `remote_path` and return its raw bytes.
    pub async fn download_file(&self, remote_path: &str) -> Result<Vec<u8>> {
        let encoded = self
            .exec(&format!("base64 -w0 {}", quote(remote_path)))
            .await
            .with_context(|| format!("failed to download {} from {}", remote_path, self.host()))?;
        STANDARD
            .decode(encoded.trim())
            .with_context(|| format!("downloaded file {} was not valid base64", remote_path))
    }
}
