use std::collections::BTreeMap;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::key::ViewKey;
use crate::core::partition::PartitionId;

/// map 阶段对一个文档的一次 emit
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Emit {
    pub key: ViewKey,
    #[serde(default)]
    pub value: Value,
}

impl Emit {
    pub fn new(key: impl Into<ViewKey>, value: Value) -> Self {
        Self {
            key: key.into(),
            value,
        }
    }
}

/// 文档变更类型（封闭枚举，builder 中穷尽匹配）
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ChangeOp {
    Insert { emits: Vec<Emit> },
    Update { emits: Vec<Emit> },
    Delete,
}

impl ChangeOp {
    pub fn emits(&self) -> &[Emit] {
        match self {
            ChangeOp::Insert { emits } | ChangeOp::Update { emits } => emits,
            ChangeOp::Delete => &[],
        }
    }
}

/// 变更记录：来自外部存储引擎的 per-partition change feed（有序、无缺口）。
/// 由 IndexBuilder 消费一次后丢弃。
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub partition: PartitionId,
    pub doc_id: String,
    pub seq: u64,
    #[serde(flatten)]
    pub op: ChangeOp,
}

impl ChangeRecord {
    pub fn insert(partition: PartitionId, doc_id: &str, seq: u64, emits: Vec<Emit>) -> Self {
        Self {
            partition,
            doc_id: doc_id.to_string(),
            seq,
            op: ChangeOp::Insert { emits },
        }
    }

    pub fn update(partition: PartitionId, doc_id: &str, seq: u64, emits: Vec<Emit>) -> Self {
        Self {
            partition,
            doc_id: doc_id.to_string(),
            seq,
            op: ChangeOp::Update { emits },
        }
    }

    pub fn delete(partition: PartitionId, doc_id: &str, seq: u64) -> Self {
        Self {
            partition,
            doc_id: doc_id.to_string(),
            seq,
            op: ChangeOp::Delete,
        }
    }
}

/// 单分区的一批变更
#[derive(Clone, Debug)]
pub struct UpdateBatch {
    pub partition: PartitionId,
    pub records: Vec<ChangeRecord>,
    pub submitted_at: SystemTime,
}

impl UpdateBatch {
    pub fn new(partition: PartitionId, records: Vec<ChangeRecord>) -> Self {
        Self {
            partition,
            records,
            submitted_at: SystemTime::now(),
        }
    }

    pub fn last_seq(&self) -> Option<u64> {
        self.records.last().map(|r| r.seq)
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// 按 partition 拆分（保持每个分区内的原始顺序）
    pub fn split_by_partition(
        records: impl IntoIterator<Item = ChangeRecord>,
    ) -> BTreeMap<PartitionId, UpdateBatch> {
        let mut out: BTreeMap<PartitionId, UpdateBatch> = BTreeMap::new();
        for r in records {
            out.entry(r.partition)
                .or_insert_with(|| UpdateBatch::new(r.partition, Vec::new()))
                .records
                .push(r);
        }
        out
    }
}
