use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Notify;

use crate::core::{
    BuildError, ChangeOp, ChangeRecord, PartitionRegistry, PartitionState, UpdateBatch, ViewKey,
};
use crate::index::fragment::{BackIndexRow, IndexFragment};
use crate::index::slot::Fragments;
use crate::stats::EngineStats;

/// 增量索引构建器。
///
/// 一个分区同一时刻最多一个构建在跑（slot 的 install gate 兜底，coordinator 负责排队）；
/// 不同分区之间完全并行。
pub struct IndexBuilder {
    registry: Arc<PartitionRegistry>,
    fragments: Arc<Fragments>,
    stats: Arc<EngineStats>,
    cleanup_wake: Arc<Notify>,
}

impl IndexBuilder {
    pub fn new(
        registry: Arc<PartitionRegistry>,
        fragments: Arc<Fragments>,
        stats: Arc<EngineStats>,
        cleanup_wake: Arc<Notify>,
    ) -> Self {
        Self {
            registry,
            fragments,
            stats,
            cleanup_wake,
        }
    }

    /// 应用一批变更，返回新的 indexed-through seq。
    ///
    /// 整批先校验后修改：任何一条记录分区不符或 seq 不连续，整批拒绝且不改任何状态。
    pub fn apply_batch(&self, batch: &UpdateBatch) -> Result<u64, BuildError> {
        let p = batch.partition;
        if let Some(r) = batch.records.iter().find(|r| r.partition != p) {
            return Err(BuildError::WrongPartition {
                expected: p,
                got: r.partition,
            });
        }
        if self.registry.state(p) == PartitionState::Missing {
            return Err(BuildError::PartitionMissing(p));
        }

        let slot = self.fragments.get_or_create(p);
        let gate = slot.lock_install();
        if slot.is_disposed() {
            return Err(BuildError::PartitionMissing(p));
        }
        let current_seq = self
            .registry
            .indexed_seq(p)
            .ok_or(BuildError::PartitionMissing(p))?;

        for (i, r) in batch.records.iter().enumerate() {
            let expected = current_seq + 1 + i as u64;
            if r.seq != expected {
                let err = BuildError::OutOfOrderSequence {
                    partition: p,
                    expected,
                    got: r.seq,
                };
                tracing::warn!("Rejecting batch: {}", err);
                self.registry.record_error(p, err.to_string());
                self.stats.build_failures.fetch_add(1, Ordering::Relaxed);
                return Err(err);
            }
        }
        let Some(new_seq) = batch.last_seq() else {
            return Ok(current_seq);
        };

        // 新版本与当前版本共享 base，只有 delta 被复制
        let cur = slot.load();
        let mut next = (*cur).clone();
        for r in &batch.records {
            apply_record(&mut next, r);
        }
        next.maybe_fold();
        next.set_version(cur.version() + 1);
        slot.install(&gate, next);
        slot.buffer_for_compaction(&gate, &batch.records);
        self.registry.advance_seq(p, new_seq);
        drop(gate);

        self.stats.batches_applied.fetch_add(1, Ordering::Relaxed);
        self.stats
            .records_applied
            .fetch_add(batch.len() as u64, Ordering::Relaxed);
        tracing::debug!(
            "Partition {} indexed through {} ({} records)",
            p,
            new_seq,
            batch.len()
        );

        if self.registry.state(p) == PartitionState::Cleanup {
            // 迁移到 Cleanup 时在跑的构建：跑完本批后交给 cleanup 释放
            self.cleanup_wake.notify_one();
        }
        Ok(new_seq)
    }
}

/// 单条记录的增量 diff（builder 提交与 compaction 回放共用）。
///
/// - Delete：墓碑掉该文档上一版本 emit 过的全部 key
/// - Insert/Update：新旧 key 集合做差，旧有新无 → 墓碑；新增或值变化 → upsert
pub(crate) fn apply_record(frag: &mut IndexFragment, rec: &ChangeRecord) {
    let doc = rec.doc_id.as_str();
    let previous: Vec<ViewKey> = frag
        .back_index_row(doc)
        .filter(|r| !r.deleted)
        .map(|r| r.keys.clone())
        .unwrap_or_default();

    match &rec.op {
        ChangeOp::Delete => {
            for k in &previous {
                frag.tombstone(k, doc, rec.seq);
            }
            if frag.back_index_row(doc).is_some() {
                frag.set_back_index(
                    doc,
                    BackIndexRow {
                        keys: Vec::new(),
                        seq: rec.seq,
                        deleted: true,
                    },
                );
            }
        }
        ChangeOp::Insert { emits } | ChangeOp::Update { emits } => {
            let mut grouped: BTreeMap<ViewKey, Vec<Value>> = BTreeMap::new();
            for e in emits {
                grouped.entry(e.key.clone()).or_default().push(e.value.clone());
            }
            for k in &previous {
                if !grouped.contains_key(k) {
                    frag.tombstone(k, doc, rec.seq);
                }
            }
            let keys: Vec<ViewKey> = grouped.keys().cloned().collect();
            for (k, values) in grouped {
                frag.upsert(k, doc, values, rec.seq);
            }
            frag.set_back_index(
                doc,
                BackIndexRow {
                    keys,
                    seq: rec.seq,
                    deleted: false,
                },
            );
        }
    }
    frag.set_indexed_seq(rec.seq);
}
