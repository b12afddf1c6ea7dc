//! 生成文件的备份与恢复
//!
//! 每次备份是 `<bench>/backups/<artifact>/<时间戳>/` 下的一组快照，
//! 附带 `manifest.json` 以便下一个进程找到最近一次备份并回滚

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{info, warn};

const MANIFEST_FILE_NAME: &str = "manifest.json";

/// 单个文件快照
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Snapshot {
    pub original: PathBuf,
    pub snapshot: PathBuf,
    pub taken_at: DateTime<Utc>,
}

/// 一个逻辑产物的一次备份
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BackupSet {
    pub artifact: String,
    pub dir: PathBuf,
    pub snapshots: Vec<Snapshot>,
}

fn invalid_data(e: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e)
}

impl BackupSet {
    /// 在 `<backups_root>/<artifact>/` 下开始一次新的备份
    pub async fn begin(backups_root: &Path, artifact: &str) -> io::Result<Self> {
        let id = uuid::Uuid::new_v4().simple().to_string();
        let name = format!("{}-{}", Utc::now().format("%Y%m%dT%H%M%S%.6f"), &id[..8]);
        let dir = backups_root.join(artifact).join(name);
        fs::create_dir_all(&dir).await?;

        let set = Self {
            artifact: artifact.to_string(),
            dir,
            snapshots: Vec::new(),
        };
        set.write_manifest().await?;
        Ok(set)
    }

    /// 快照一个文件，文件不存在时跳过
    pub async fn snapshot(&mut self, path: &Path) -> io::Result<Option<&Snapshot>> {
        if !path.is_file() {
            return Ok(None);
        }

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "file".to_string());
        let destination = self
            .dir
            .join(format!("{:03}-{}", self.snapshots.len(), file_name));
        fs::copy(path, &destination).await?;

        self.snapshots.push(Snapshot {
            original: path.to_path_buf(),
            snapshot: destination,
            taken_at: Utc::now(),
        });
        self.write_manifest().await?;

        Ok(self.snapshots.last())
    }

    /// 恢复一个快照，目标已存在且未强制时返回 false
    pub async fn restore(&self, snapshot: &Snapshot, force: bool) -> io::Result<bool> {
        if snapshot.original.exists() && !force {
            warn!(path = %snapshot.original.display(), "Restore target exists, skipping");
            return Ok(false);
        }
        if let Some(parent) = snapshot.original.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::copy(&snapshot.snapshot, &snapshot.original).await?;
        Ok(true)
    }

    /// 按从新到旧的顺序恢复全部快照，返回恢复的数量
    pub async fn restore_all(&self, force: bool) -> io::Result<usize> {
        let mut restored = 0;
        for snapshot in self.snapshots.iter().rev() {
            if self.restore(snapshot, force).await? {
                restored += 1;
            }
        }
        info!(artifact = %self.artifact, restored, "Restored backup");
        Ok(restored)
    }

    /// 最近一次备份
    pub async fn latest(backups_root: &Path, artifact: &str) -> io::Result<Option<Self>> {
        let artifact_dir = backups_root.join(artifact);
        if !artifact_dir.is_dir() {
            return Ok(None);
        }

        let mut names = Vec::new();
        let mut entries = fs::read_dir(&artifact_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.path().join(MANIFEST_FILE_NAME).is_file() {
                names.push(entry.file_name());
            }
        }
        names.sort();

        let Some(latest) = names.pop() else {
            return Ok(None);
        };
        let content = fs::read_to_string(artifact_dir.join(latest).join(MANIFEST_FILE_NAME)).await?;
        serde_json::from_str(&content).map(Some).map_err(invalid_data)
    }

    /// 只保留最近的 `keep` 次备份，返回删除的数量
    pub async fn prune(backups_root: &Path, artifact: &str, keep: usize) -> io::Result<usize> {
        let artifact_dir = backups_root.join(artifact);
        if !artifact_dir.is_dir() {
            return Ok(0);
        }

        let mut names = Vec::new();
        let mut entries = fs::read_dir(&artifact_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                names.push(entry.file_name());
            }
        }
        if names.len() <= keep {
            return Ok(0);
        }

        // 目录名以时间戳开头，字典序即时间序
        names.sort();
        let stale = names.len() - keep;
        for name in &names[..stale] {
            fs::remove_dir_all(artifact_dir.join(name)).await?;
        }
        info!(artifact, removed = stale, keep, "Pruned old backups");
        Ok(stale)
    }

    async fn write_manifest(&self) -> io::Result<()> {
        let content = serde_json::to_string_pretty(self).map_err(invalid_data)?;
        fs::write(self.dir.join(MANIFEST_FILE_NAME), content).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_snapshot_and_restore_newest_first() {
        let dir = TempDir::new().unwrap();
        let conf = dir.path().join("supervisor.conf");
        let split = dir.path().join("web.fm.supervisor.conf");
        std::fs::write(&conf, "v1").unwrap();
        std::fs::write(&split, "split-v1").unwrap();

        let backups = dir.path().join("backups");
        let mut set = BackupSet::begin(&backups, "workers").await.unwrap();
        assert!(set.snapshot(&conf).await.unwrap().is_some());
        assert!(set.snapshot(&split).await.unwrap().is_some());
        assert!(set.snapshot(&dir.path().join("missing")).await.unwrap().is_none());

        std::fs::write(&conf, "v2").unwrap();
        std::fs::remove_file(&split).unwrap();

        // 未强制时只恢复不存在的文件
        assert_eq!(set.restore_all(false).await.unwrap(), 1);
        assert_eq!(std::fs::read_to_string(&conf).unwrap(), "v2");
        assert_eq!(std::fs::read_to_string(&split).unwrap(), "split-v1");

        assert_eq!(set.restore_all(true).await.unwrap(), 2);
        assert_eq!(std::fs::read_to_string(&conf).unwrap(), "v1");
    }

    #[tokio::test]
    async fn test_latest_finds_most_recent_set() {
        let dir = TempDir::new().unwrap();
        let backups = dir.path().join("backups");
        assert!(BackupSet::latest(&backups, "workers").await.unwrap().is_none());

        let conf = dir.path().join("supervisor.conf");
        std::fs::write(&conf, "old").unwrap();
        let mut first = BackupSet::begin(&backups, "workers").await.unwrap();
        first.snapshot(&conf).await.unwrap();

        std::fs::write(&conf, "new").unwrap();
        let mut second = BackupSet::begin(&backups, "workers").await.unwrap();
        second.snapshot(&conf).await.unwrap();

        let latest = BackupSet::latest(&backups, "workers").await.unwrap().unwrap();
        assert_eq!(latest.dir, second.dir);
        assert_eq!(latest.snapshots.len(), 1);
        assert_eq!(latest.snapshots[0].original, conf);
    }

    #[tokio::test]
    async fn test_prune_keeps_newest_sets() {
        let dir = TempDir::new().unwrap();
        let backups = dir.path().join("backups");
        assert_eq!(BackupSet::prune(&backups, "workers", 2).await.unwrap(), 0);

        let mut sets = Vec::new();
        for _ in 0..4 {
            sets.push(BackupSet::begin(&backups, "workers").await.unwrap());
        }

        assert_eq!(BackupSet::prune(&backups, "workers", 2).await.unwrap(), 2);
        assert!(!sets[0].dir.exists());
        assert!(!sets[1].dir.exists());
        assert!(sets[2].dir.exists());
        assert!(sets[3].dir.exists());

        let latest = BackupSet::latest(&backups, "workers").await.unwrap().unwrap();
        assert_eq!(latest.dir, sets[3].dir);
        assert_eq!(BackupSet::prune(&backups, "workers", 2).await.unwrap(), 0);
    }
}
