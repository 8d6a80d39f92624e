//! Append-only deployment history, one JSON file per deployment attempt
//! under the local state directory (named by the attempt's `id`, not by
//! timestamp), so rollback and `azud history` can look arbitrarily far back
//! instead of only at "current" and "previous".

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Pending,
    Succeeded,
    Failed,
    RolledBack,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentRecord {
    /// Unique per deployment attempt; stable across the Pending -> final
    /// status transition, since both writes share the same `id` and thus
    /// the same on-disk file.
    pub id: String,
    pub service: String,
    pub image: String,
    pub version: String,
    pub hosts: Vec<String>,
    /// Primary proxy host this deployment routed traffic through.
    pub destination: String,
    pub performer: String,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    pub recorded_at: DateTime<Utc>,
    pub status: RecordStatus,
    #[serde(default)]
    pub previous_version: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub duration_secs: Option<i64>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl DeploymentRecord {
    fn filename(&self) -> String {
        format!("{}.json", self.id)
    }
}

/// A new, globally-unique-enough id for a deployment attempt: nanosecond
/// timestamp plus this process's pid, which can't collide with another
/// concurrent `azud` invocation writing into the same history directory.
pub fn generate_id(started_at: DateTime<Utc>) -> String {
    format!(
        "{}-{}",
        started_at.format("%Y%m%dT%H%M%S%.9f"),
        std::process::id()
    )
}

pub struct HistoryStore {
    dir: PathBuf,
    retain: usize,
    guard: RwLock<()>,
}

impl HistoryStore {
    pub fn new(dir: impl Into<PathBuf>, retain: usize) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create history dir {}", dir.display()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&dir, fs::Permissions::from_mode(0o755)).ok();
        }
        Ok(Self {
            dir,
            retain,
            guard: RwLock::new(()),
        })
    }

    /// Atomically persist `record`: write to a temp file in the same
    /// directory, then rename over the final name, so a reader never
    /// observes a partially-written record. Writing the same `id` twice
    /// (Pending, then Succeeded/Failed) overwrites in place rather than
    /// appending a second entry.
    pub async fn record(&self, record: &DeploymentRecord) -> Result<()> {
        let _lock = self.guard.write().await;
        let filename = record.filename();
        let final_path = self.dir.join(&filename);
        let tmp_path = self.dir.join(format!(".{}.tmp", filename));

        let content = serde_json::to_vec_pretty(record).context("failed to serialize record")?;
        {
            let mut file = File::create(&tmp_path)
                .with_context(|| format!("failed to create {}", tmp_path.display()))?;
            file.write_all(&content)?;
            file.sync_all()?;
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&tmp_path, fs::Permissions::from_mode(0o644)).ok();
        }
        fs::rename(&tmp_path, &final_path)
            .with_context(|| format!("failed to finalize {}", final_path.display()))?;

        self.prune(&record.service).await?;
        Ok(())
    }

    pub async fn list(&self, service: &str) -> Result<Vec<DeploymentRecord>> {
        let _lock = self.guard.read().await;
        let mut records = self.read_all(service)?;
        records.sort_by_key(|r| r.recorded_at);
        records.reverse();
        Ok(records)
    }

    pub async fn get(&self, service: &str, id: &str) -> Result<Option<DeploymentRecord>> {
        Ok(self
            .list(service)
            .await?
            .into_iter()
            .find(|r| r.id == id))
    }

    pub async fn get_last_deployment(&self, service: &str) -> Result<Option<DeploymentRecord>> {
        Ok(self.list(service).await?.into_iter().next())
    }

    pub async fn get_last_successful(&self, service: &str) -> Result<Option<DeploymentRecord>> {
        Ok(self
            .list(service)
            .await?
            .into_iter()
            .find(|r| r.status == RecordStatus::Succeeded))
    }

    /// `self.dir` is already namespaced per-service (`history/<service>`),
    /// so every record found here belongs to `service`; the parameter is
    /// kept for API clarity at call sites.
    fn read_all(&self, _service: &str) -> Result<Vec<DeploymentRecord>> {
        let mut out = Vec::new();
        for entry in fs::read_dir(&self.dir)
            .with_context(|| format!("failed to read history dir {}", self.dir.display()))?
        {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with('.') || !name.ends_with(".json") {
                continue;
            }
            let content = fs::read_to_string(entry.path())
                .with_context(|| format!("failed to read {}", entry.path().display()))?;
            match serde_json::from_str::<DeploymentRecord>(&content) {
                Ok(record) => out.push(record),
                Err(err) => tracing::warn!(
                    "skipping unreadable history record {}: {}",
                    entry.path().display(),
                    err
                ),
            }
        }
        Ok(out)
    }

    async fn prune(&self, service: &str) -> Result<()> {
        if self.retain == 0 {
            return Ok(());
        }
        let mut records = self.read_all(service)?;
        if records.len() <= self.retain {
            return Ok(());
        }
        records.sort_by_key(|r| r.recorded_at);
        let excess = records.len() - self.retain;
        for record in &records[..excess] {
            let path = self.dir.join(record.filename());
            let _ = fs::remove_file(path);
        }
        Ok(())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(service: &str, when: DateTime<Utc>, status: RecordStatus) -> DeploymentRecord {
        DeploymentRecord {
            id: generate_id(when),
            service: service.to_string(),
            image: "registry/app:1".to_string(),
            version: "1".to_string(),
            hosts: vec!["10.0.0.1".to_string()],
            destination: "app.example.com".to_string(),
            performer: "ci".to_string(),
            started_at: when,
            completed_at: Some(when),
            recorded_at: when,
            status,
            previous_version: None,
            error: None,
            duration_secs: Some(0),
            metadata: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn records_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = HistoryStore::new(dir.path(), 50).unwrap();
        let rec = record("api", Utc::now(), RecordStatus::Succeeded);
        store.record(&rec).await.unwrap();
        let last = store.get_last_successful("api").await.unwrap();
        assert!(last.is_some());
    }

    #[tokio::test]
    async fn get_by_id_finds_the_written_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = HistoryStore::new(dir.path(), 50).unwrap();
        let rec = record("api", Utc::now(), RecordStatus::Succeeded);
        store.record(&rec).await.unwrap();
        let found = store.get("api", &rec.id).await.unwrap();
        assert_eq!(found.unwrap().id, rec.id);
        assert!(store.get("api", "nonexistent").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rewriting_the_same_id_updates_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let store = HistoryStore::new(dir.path(), 50).unwrap();
        let when = Utc::now();
        let mut rec = record("api", when, RecordStatus::Pending);
        store.record(&rec).await.unwrap();
        rec.status = RecordStatus::Succeeded;
        rec.completed_at = Some(when + chrono::Duration::seconds(5));
        store.record(&rec).await.unwrap();

        let all = store.list("api").await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].status, RecordStatus::Succeeded);
    }

    #[tokio::test]
    async fn prunes_beyond_retention() {
        let dir = tempfile::tempdir().unwrap();
        let store = HistoryStore::new(dir.path(), 2).unwrap();
        for i in 0..5 {
            let when = Utc::now() + chrono::Duration::seconds(i);
            store
                .record(&record("api", when, RecordStatus::Succeeded))
                .await
                .unwrap();
        }
        let all = store.list("api").await.unwrap();
        assert_eq!(all.len(), 2);
    }
}
