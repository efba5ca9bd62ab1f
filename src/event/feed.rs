use std::collections::{BTreeMap, HashMap};

use parking_lot::RwLock;
use serde_json::Value;

use crate::core::{ChangeRecord, PartitionId};

/// 外部文档存储提供的每分区变更流（有序、无空洞）
pub trait ChangeFeed: Send + Sync {
    /// 返回 seq > `since` 的全部变更，按 seq 升序
    fn changes_since(&self, partition: PartitionId, since: u64) -> anyhow::Result<Vec<ChangeRecord>>;
}

/// include_docs 使用的文档查询
pub trait DocumentSource: Send + Sync {
    fn document(&self, partition: PartitionId, doc_id: &str) -> Option<Value>;
}

/// 内存变更流（嵌入方直接推送变更时使用）
#[derive(Default)]
pub struct MemoryFeed {
    log: RwLock<BTreeMap<PartitionId, Vec<ChangeRecord>>>,
}

impl MemoryFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加记录；调用方负责 seq 连续
    pub fn append(&self, records: impl IntoIterator<Item = ChangeRecord>) {
        let mut log = self.log.write();
        for r in records {
            log.entry(r.partition).or_default().push(r);
        }
    }

    pub fn high_seq(&self, partition: PartitionId) -> u64 {
        self.log
            .read()
            .get(&partition)
            .and_then(|v| v.last())
            .map(|r| r.seq)
            .unwrap_or(0)
    }
}

impl ChangeFeed for MemoryFeed {
    fn changes_since(&self, partition: PartitionId, since: u64) -> anyhow::Result<Vec<ChangeRecord>> {
        let log = self.log.read();
        let Some(records) = log.get(&partition) else {
            return Ok(Vec::new());
        };
        let start = records.partition_point(|r| r.seq <= since);
        Ok(records[start..].to_vec())
    }
}

#[derive(Default)]
pub struct MemoryDocs {
    docs: RwLock<HashMap<(PartitionId, String), Value>>,
}

impl MemoryDocs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, partition: PartitionId, doc_id: &str, body: Value) {
        self.docs.write().insert((partition, doc_id.to_string()), body);
    }

    pub fn remove(&self, partition: PartitionId, doc_id: &str) {
        self.docs.write().remove(&(partition, doc_id.to_string()));
    }
}

impl DocumentSource for MemoryDocs {
    fn document(&self, partition: PartitionId, doc_id: &str) -> Option<Value> {
        self.docs
            .read()
            .get(&(partition, doc_id.to_string()))
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn feed_returns_records_after_seq() {
        let feed = MemoryFeed::new();
        let p = PartitionId(2);
        feed.append((1..=5).map(|s| ChangeRecord::delete(p, "d", s)));
        let got: Vec<u64> = feed
            .changes_since(p, 3)
            .unwrap()
            .iter()
            .map(|r| r.seq)
            .collect();
        assert_eq!(got, vec![4, 5]);
        assert_eq!(feed.high_seq(p), 5);
        assert!(feed.changes_since(PartitionId(9), 0).unwrap().is_empty());
    }

    #[test]
    fn docs_lookup() {
        let docs = MemoryDocs::new();
        docs.put(PartitionId(0), "d1", json!({"a": 1}));
        assert_eq!(docs.document(PartitionId(0), "d1"), Some(json!({"a": 1})));
        assert_eq!(docs.document(PartitionId(1), "d1"), None);
        docs.remove(PartitionId(0), "d1");
        assert_eq!(docs.document(PartitionId(0), "d1"), None);
    }
}
