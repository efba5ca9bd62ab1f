use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::fs;

use crate::core::{Partition, PartitionId};
use crate::index::fragment::{FragmentImage, IndexFragment};
use crate::storage::snapshot::SnapshotFile;

const GROUP_STATE: &str = "group.state";

/// group.state 的内容：全部分区记录
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GroupState {
    pub partitions: Vec<Partition>,
    pub saved_at_ms: u64,
}

/// 数据目录：group.state + 每分区一个 frag-<id>.idx
pub struct GroupStore {
    dir: PathBuf,
}

impl GroupStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn state_file(&self) -> SnapshotFile {
        SnapshotFile::new(self.dir.join(GROUP_STATE))
    }

    fn fragment_file(&self, id: PartitionId) -> SnapshotFile {
        SnapshotFile::new(self.dir.join(format!("frag-{}.idx", id.0)))
    }

    pub async fn save_group(&self, partitions: Vec<Partition>) -> anyhow::Result<()> {
        let saved_at_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let state = GroupState {
            partitions,
            saved_at_ms,
        };
        self.state_file().write_atomic(&state).await?;
        Ok(())
    }

    pub async fn load_group(&self) -> anyhow::Result<Option<GroupState>> {
        self.state_file().load_if_valid().await
    }

    pub async fn save_fragment(&self, frag: &IndexFragment) -> anyhow::Result<u64> {
        self.fragment_file(frag.partition())
            .write_atomic(&frag.to_image())
            .await
    }

    /// 缺失或损坏都返回 `None`（该分区从 seq 0 重建）
    pub async fn load_fragment(&self, id: PartitionId) -> anyhow::Result<Option<IndexFragment>> {
        let Some(image) = self
            .fragment_file(id)
            .load_if_valid::<FragmentImage>()
            .await?
        else {
            return Ok(None);
        };
        if image.partition != id {
            tracing::warn!(
                "Fragment file of partition {} holds partition {}, ignoring",
                id,
                image.partition
            );
            return Ok(None);
        }
        match IndexFragment::from_image(image) {
            Ok(f) => Ok(Some(f)),
            Err(e) => {
                tracing::warn!("Fragment of partition {} unreadable: {:#}", id, e);
                Ok(None)
            }
        }
    }

    pub async fn remove_fragment(&self, id: PartitionId) -> anyhow::Result<()> {
        self.fragment_file(id).remove().await
    }

    /// 目录中已有的 fragment 文件
    pub async fn fragment_ids(&self) -> anyhow::Result<Vec<PartitionId>> {
        let mut out = Vec::new();
        let mut rd = match fs::read_dir(&self.dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = rd.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let id = name
                .strip_prefix("frag-")
                .and_then(|s| s.strip_suffix(".idx"))
                .and_then(|s| s.parse::<u16>().ok());
            if let Some(id) = id {
                out.push(PartitionId(id));
            }
        }
        out.sort();
        Ok(out)
    }
}
