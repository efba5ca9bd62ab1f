use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// 分区编号（文档集合的一个不相交分片）
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionId(pub u16);

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u16> for PartitionId {
    fn from(v: u16) -> Self {
        Self(v)
    }
}

/// 分区可见性状态
///
/// - Active：默认可读
/// - Passive：已索引，但默认读不可见（需请求显式 opt-in）
/// - Cleanup：等待释放，任何读都不可见
/// - Missing：不存在（registry 中没有记录）
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionState {
    Active,
    Passive,
    Cleanup,
    Missing,
}

impl PartitionState {
    /// 合法迁移：
    /// Missing→Active, Active⇄Passive, Active/Passive→Cleanup, Cleanup→Missing
    pub fn can_transition_to(self, to: PartitionState) -> bool {
        use PartitionState::*;
        matches!(
            (self, to),
            (Missing, Active)
                | (Active, Passive)
                | (Passive, Active)
                | (Active, Cleanup)
                | (Passive, Cleanup)
                | (Cleanup, Missing)
        )
    }

    /// 是否持有可被读取/构建的数据
    pub fn is_indexable(self) -> bool {
        matches!(self, PartitionState::Active | PartitionState::Passive)
    }
}

impl fmt::Display for PartitionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PartitionState::Active => "active",
            PartitionState::Passive => "passive",
            PartitionState::Cleanup => "cleanup",
            PartitionState::Missing => "missing",
        };
        f.write_str(s)
    }
}

impl FromStr for PartitionState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "active" => Ok(PartitionState::Active),
            "passive" => Ok(PartitionState::Passive),
            "cleanup" => Ok(PartitionState::Cleanup),
            "missing" => Ok(PartitionState::Missing),
            other => Err(format!("unknown partition state: {other}")),
        }
    }
}

/// 分区记录：只由 `PartitionRegistry` 持有与修改，其余组件只读拷贝。
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Partition {
    pub id: PartitionId,
    pub state: PartitionState,
    /// 已索引到的 seq（单调不减）
    pub indexed_seq: u64,
    /// coordinator 队列中仍有未完成的 batch
    #[serde(default)]
    pub pending_update: bool,
    /// 最近一次构建失败原因（成功后清除）
    #[serde(default)]
    pub last_error: Option<String>,
    /// 最近一次状态迁移时间（Cleanup 宽限期从这里起算）
    pub changed_at: std::time::SystemTime,
}

impl Partition {
    pub fn new(id: PartitionId, state: PartitionState) -> Self {
        Self {
            id,
            state,
            indexed_seq: 0,
            pending_update: false,
            last_error: None,
            changed_at: std::time::SystemTime::now(),
        }
    }
}
