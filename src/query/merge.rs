use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::iter::Peekable;
use std::sync::atomic::Ordering as AtomicOrdering;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;

use crate::core::{
    PartitionId, PartitionRegistry, ReadError, SelectError, StateChange, StateListener, ViewKey,
};
use crate::event::coordinator::UpdateCoordinator;
use crate::event::feed::DocumentSource;
use crate::index::fragment::IndexFragment;
use crate::index::slot::Fragments;
use crate::query::plan_cache::PlanCache;
use crate::query::range::KeyRange;
use crate::query::reduce::Reducer;
use crate::query::request::{Grouping, MergeRequest, Stale};
use crate::query::selector::{select_partitions, Selection};
use crate::stats::EngineStats;

/// 合并读输出的一行。reduce 结果没有 id / partition。
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ViewRow {
    pub key: ViewKey,
    pub value: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partition: Option<PartitionId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub doc: Option<Value>,
}

/// 视图合并器：分区选择 + stale 策略 + 快照化的 k 路归并
pub struct ViewMerger {
    registry: Arc<PartitionRegistry>,
    fragments: Arc<Fragments>,
    coordinator: Arc<UpdateCoordinator>,
    documents: Option<Arc<dyn DocumentSource>>,
    plans: PlanCache,
    default_timeout: Duration,
    stats: Arc<EngineStats>,
}

impl ViewMerger {
    pub fn new(
        registry: Arc<PartitionRegistry>,
        fragments: Arc<Fragments>,
        coordinator: Arc<UpdateCoordinator>,
        documents: Option<Arc<dyn DocumentSource>>,
        plan_cache_capacity: usize,
        default_timeout: Duration,
        stats: Arc<EngineStats>,
    ) -> Self {
        Self {
            registry,
            fragments,
            coordinator,
            documents,
            plans: PlanCache::with_capacity(plan_cache_capacity),
            default_timeout,
            stats,
        }
    }

    /// 带缓存的分区选择（条目按 registry generation 校验）
    pub fn select(&self, req: &MergeRequest) -> Result<Selection, SelectError> {
        let key = req.selection_key();
        let generation = self.registry.generation();
        if let Some(hit) = self.plans.get(&key, generation) {
            return Ok(hit);
        }
        let selection = select_partitions(&self.registry, req)?;
        self.plans.insert(key, generation, selection.clone());
        Ok(selection)
    }

    pub fn plan_cache_len(&self) -> usize {
        self.plans.len()
    }

    pub async fn merge_read(&self, req: MergeRequest) -> Result<ViewStream, ReadError> {
        let mut selection = self.select(&req)?;

        if req.stale == Stale::UpdateBefore {
            let timeout = req.update_timeout.unwrap_or(self.default_timeout);
            let wait = self.coordinator.update_before(&selection.partitions);
            if tokio::time::timeout(timeout, wait).await.is_err() {
                self.stats
                    .update_before_timeouts
                    .fetch_add(1, AtomicOrdering::Relaxed);
                tracing::warn!(
                    "update-before read timed out after {:?}, serving current data",
                    timeout
                );
            }
            // 等待期间分区状态可能变化
            selection = self.select(&req)?;
        }

        let stream = ViewStream {
            registry: self.registry.clone(),
            fragments: self.fragments.clone(),
            documents: self.documents.clone(),
            snapshot: self.fragments.snapshot(&selection.partitions),
            selection,
            request: req,
        };

        if stream.request.stale == Stale::UpdateAfter {
            self.coordinator.schedule_catch_up(stream.partitions());
        }
        Ok(stream)
    }
}

impl StateListener for ViewMerger {
    fn on_transition(&self, _change: &StateChange) {
        self.plans.clear();
    }
}

/// 合并读结果：持有一组 fragment 快照。
///
/// `rows()` 可反复迭代，每次都基于同一快照；`restart()` 重新选择分区并取新快照。
pub struct ViewStream {
    registry: Arc<PartitionRegistry>,
    fragments: Arc<Fragments>,
    documents: Option<Arc<dyn DocumentSource>>,
    request: MergeRequest,
    selection: Selection,
    snapshot: Vec<Arc<IndexFragment>>,
}

impl ViewStream {
    pub fn partitions(&self) -> &[PartitionId] {
        &self.selection.partitions
    }

    pub fn selection(&self) -> &Selection {
        &self.selection
    }

    /// 快照中各分区的 indexed-through seq
    pub fn snapshot_seqs(&self) -> Vec<(PartitionId, u64)> {
        self.snapshot
            .iter()
            .map(|f| (f.partition(), f.indexed_seq()))
            .collect()
    }

    pub fn restart(&mut self) -> Result<(), SelectError> {
        self.selection = select_partitions(&self.registry, &self.request)?;
        self.snapshot = self.fragments.snapshot(&self.selection.partitions);
        Ok(())
    }

    pub fn rows(&self) -> ViewRows<'_> {
        let req = &self.request;
        let entries = MergeIter::new(&self.snapshot, &req.range, req.descending).flat_map(|e| {
            e.values.iter().map(move |value| Flat {
                key: e.key,
                partition: e.partition,
                doc: e.doc,
                value,
            })
        });

        let docs = if req.include_docs {
            self.documents.as_deref()
        } else {
            None
        };
        let rows: Box<dyn Iterator<Item = ViewRow> + '_> = match &req.reduce {
            None => Box::new(entries.map(move |f| ViewRow {
                key: f.key.clone(),
                value: f.value.clone(),
                id: Some(f.doc.to_string()),
                partition: Some(f.partition),
                doc: docs.and_then(|d| d.document(f.partition, f.doc)),
            })),
            Some(rs) => match rs.grouping {
                Grouping::Exact => Box::new(GroupByKey {
                    inner: entries.peekable(),
                    reducer: rs.reducer.as_ref(),
                }),
                Grouping::All => Box::new(ReduceAll {
                    inner: Some(entries),
                    reducer: rs.reducer.as_ref(),
                }),
            },
        };

        let limit = req.limit.unwrap_or(usize::MAX);
        ViewRows {
            inner: Box::new(rows.skip(req.skip).take(limit)),
        }
    }
}

/// `ViewStream::rows` 的惰性迭代器
pub struct ViewRows<'a> {
    inner: Box<dyn Iterator<Item = ViewRow> + 'a>,
}

impl Iterator for ViewRows<'_> {
    type Item = ViewRow;

    fn next(&mut self) -> Option<ViewRow> {
        self.inner.next()
    }
}

/// 某个分区游标当前指向的 (key, doc) 槽位
#[derive(Clone, Copy)]
struct Entry<'a> {
    frag: &'a IndexFragment,
    key: &'a ViewKey,
    partition: PartitionId,
    doc: &'a str,
    values: &'a [Value],
    descending: bool,
}

impl Entry<'_> {
    fn natural(&self, other: &Self) -> Ordering {
        self.key
            .cmp(other.key)
            .then(self.partition.cmp(&other.partition))
            .then(self.doc.cmp(other.doc))
    }
}

impl PartialEq for Entry<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.natural(other) == Ordering::Equal
    }
}

impl Eq for Entry<'_> {}

impl PartialOrd for Entry<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry<'_> {
    // BinaryHeap 是最大堆：升序时反转
    fn cmp(&self, other: &Self) -> Ordering {
        if self.descending {
            self.natural(other)
        } else {
            self.natural(other).reverse()
        }
    }
}

/// k 路归并：按 (key, partition, doc) 输出
struct MergeIter<'a> {
    heap: BinaryHeap<Entry<'a>>,
    range: &'a KeyRange,
    descending: bool,
}

impl<'a> MergeIter<'a> {
    fn new(frags: &'a [Arc<IndexFragment>], range: &'a KeyRange, descending: bool) -> Self {
        let mut heap = BinaryHeap::with_capacity(frags.len());
        for frag in frags {
            let frag: &'a IndexFragment = frag.as_ref();
            if let Some((key, doc, values)) = frag.next_live(None, range, descending) {
                heap.push(Entry {
                    frag,
                    key,
                    partition: frag.partition(),
                    doc,
                    values,
                    descending,
                });
            }
        }
        Self {
            heap,
            range,
            descending,
        }
    }
}

impl<'a> Iterator for MergeIter<'a> {
    type Item = Entry<'a>;

    fn next(&mut self) -> Option<Entry<'a>> {
        let top = self.heap.pop()?;
        if let Some((key, doc, values)) =
            top.frag
                .next_live(Some((top.key, top.doc)), self.range, self.descending)
        {
            self.heap.push(Entry {
                key,
                doc,
                values,
                ..top
            });
        }
        Some(top)
    }
}

/// 展开后的单个 value
struct Flat<'a> {
    key: &'a ViewKey,
    partition: PartitionId,
    doc: &'a str,
    value: &'a Value,
}

struct GroupByKey<'a, I: Iterator<Item = Flat<'a>>> {
    inner: Peekable<I>,
    reducer: &'a dyn Reducer,
}

impl<'a, I: Iterator<Item = Flat<'a>>> Iterator for GroupByKey<'a, I> {
    type Item = ViewRow;

    fn next(&mut self) -> Option<ViewRow> {
        let first = self.inner.next()?;
        let key = first.key;
        let mut values = vec![first.value.clone()];
        while let Some(next) = self.inner.next_if(|f| f.key == key) {
            values.push(next.value.clone());
        }
        Some(ViewRow {
            key: key.clone(),
            value: self.reducer.reduce(&values),
            id: None,
            partition: None,
            doc: None,
        })
    }
}

struct ReduceAll<'a, I: Iterator<Item = Flat<'a>>> {
    inner: Option<I>,
    reducer: &'a dyn Reducer,
}

impl<'a, I: Iterator<Item = Flat<'a>>> Iterator for ReduceAll<'a, I> {
    type Item = ViewRow;

    fn next(&mut self) -> Option<ViewRow> {
        let values: Vec<Value> = self.inner.take()?.map(|f| f.value.clone()).collect();
        if values.is_empty() {
            return None;
        }
        Some(ViewRow {
            key: ViewKey::null(),
            value: self.reducer.reduce(&values),
            id: None,
            partition: None,
            doc: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ChangeRecord, Emit, PartitionState, UpdateBatch};
    use crate::event::feed::{ChangeFeed, MemoryDocs, MemoryFeed};
    use crate::index::builder::IndexBuilder;
    use crate::index::compactor::{CompactionTarget, Compactor};
    use crate::query::reduce::{Count, Sum};
    use serde_json::json;
    use std::sync::Weak;
    use tokio::sync::Notify;

    struct Fixture {
        registry: Arc<PartitionRegistry>,
        fragments: Arc<Fragments>,
        builder: Arc<IndexBuilder>,
        compactor: Arc<Compactor>,
        coordinator: Arc<UpdateCoordinator>,
        merger: Arc<ViewMerger>,
        feed: Arc<MemoryFeed>,
        docs: Arc<MemoryDocs>,
    }

    fn fixture(partitions: u16) -> Fixture {
        let registry = Arc::new(PartitionRegistry::new());
        for p in 0..partitions {
            registry
                .set_partition_state(PartitionId(p), PartitionState::Active)
                .unwrap();
        }
        let fragments = Arc::new(Fragments::new());
        let stats = Arc::new(EngineStats::default());
        let builder = Arc::new(IndexBuilder::new(
            registry.clone(),
            fragments.clone(),
            stats.clone(),
            Arc::new(Notify::new()),
        ));
        let compactor = Arc::new(Compactor::new(
            registry.clone(),
            fragments.clone(),
            stats.clone(),
        ));
        let feed = Arc::new(MemoryFeed::new());
        let docs = Arc::new(MemoryDocs::new());
        let coordinator = Arc::new(UpdateCoordinator::new(
            builder.clone(),
            registry.clone(),
            Some(feed.clone() as Arc<dyn ChangeFeed>),
            2,
        ));
        let merger = Arc::new(ViewMerger::new(
            registry.clone(),
            fragments.clone(),
            coordinator.clone(),
            Some(docs.clone() as Arc<dyn DocumentSource>),
            16,
            Duration::from_secs(5),
            stats,
        ));
        let weak: Weak<dyn StateListener> =
            Arc::downgrade(&(merger.clone() as Arc<dyn StateListener>));
        registry.subscribe(weak);
        Fixture {
            registry,
            fragments,
            builder,
            compactor,
            coordinator,
            merger,
            feed,
            docs,
        }
    }

    impl Fixture {
        fn apply(&self, records: Vec<ChangeRecord>) {
            for b in UpdateBatch::split_by_partition(records).into_values() {
                self.builder.apply_batch(&b).unwrap();
            }
        }

        async fn read(&self, req: MergeRequest) -> Vec<(String, Value)> {
            let stream = self.merger.merge_read(req).await.unwrap();
            stream
                .rows()
                .map(|r| (r.key.to_string(), r.value))
                .collect()
        }
    }

    fn ins(p: u16, doc: &str, seq: u64, emits: &[(&str, Value)]) -> ChangeRecord {
        ChangeRecord::insert(
            PartitionId(p),
            doc,
            seq,
            emits.iter().map(|(k, v)| Emit::new(*k, v.clone())).collect(),
        )
    }

    #[tokio::test]
    async fn replaced_key_reads_back_sorted() {
        let f = fixture(1);
        f.apply(vec![
            ins(0, "d1", 1, &[("k1", json!("v1"))]),
            ins(0, "d2", 2, &[("k2", json!("v2"))]),
        ]);
        f.apply(vec![ChangeRecord::update(
            PartitionId(0),
            "d1",
            3,
            vec![Emit::new("k3", json!("v1"))],
        )]);

        let rows = f.read(MergeRequest::new()).await;
        assert_eq!(
            rows,
            vec![
                ("\"k2\"".to_string(), json!("v2")),
                ("\"k3\"".to_string(), json!("v1"))
            ]
        );
    }

    #[tokio::test]
    async fn ties_break_by_partition_then_doc() {
        let f = fixture(3);
        f.apply(vec![
            ins(2, "a", 1, &[("k", json!(20))]),
            ins(0, "b", 1, &[("k", json!(1))]),
            ins(0, "a", 2, &[("k", json!(0))]),
            ins(1, "z", 1, &[("j", json!(10)), ("k", json!(11))]),
        ]);
        let stream = f.merger.merge_read(MergeRequest::new()).await.unwrap();
        let order: Vec<(String, u16, String)> = stream
            .rows()
            .map(|r| (r.key.to_string(), r.partition.unwrap().0, r.id.unwrap()))
            .collect();
        assert_eq!(
            order,
            vec![
                ("\"j\"".into(), 1, "z".into()),
                ("\"k\"".into(), 0, "a".into()),
                ("\"k\"".into(), 0, "b".into()),
                ("\"k\"".into(), 1, "z".into()),
                ("\"k\"".into(), 2, "a".into()),
            ]
        );

        // descending 是升序的精确逆序
        let stream = f
            .merger
            .merge_read(MergeRequest::new().descending())
            .await
            .unwrap();
        let rev: Vec<(String, u16, String)> = stream
            .rows()
            .map(|r| (r.key.to_string(), r.partition.unwrap().0, r.id.unwrap()))
            .collect();
        let mut expected = order.clone();
        expected.reverse();
        assert_eq!(rev, expected);
    }

    #[tokio::test]
    async fn range_skip_limit_and_collation() {
        let f = fixture(2);
        f.apply(vec![
            ins(0, "n", 1, &[]),
            ins(1, "a", 1, &[("b", json!(1)), ("d", json!(2))]),
        ]);
        f.apply(vec![ChangeRecord::update(
            PartitionId(0),
            "n",
            2,
            vec![
                Emit::new(json!(10), json!("ten")),
                Emit::new(json!(9), json!("nine")),
                Emit::new(json!(null), json!("null")),
                Emit::new("c", json!(3)),
            ],
        )]);

        let keys: Vec<String> = f
            .read(MergeRequest::new())
            .await
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, vec!["null", "9", "10", "\"b\"", "\"c\"", "\"d\""]);

        let req = MergeRequest::new()
            .key_range(Some(json!(9).into()), Some("c".into()))
            .exclusive_end()
            .skip(1)
            .limit(2);
        let keys: Vec<String> = f.read(req).await.into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["10", "\"b\""]);

        let req = MergeRequest::new()
            .descending()
            .key_range(Some("c".into()), Some(json!(10).into()));
        let keys: Vec<String> = f.read(req).await.into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["\"c\"", "\"b\"", "10"]);
    }

    #[tokio::test]
    async fn reduce_groups_across_partitions() {
        let f = fixture(3);
        f.apply(vec![
            ins(0, "a", 1, &[("x", json!(1)), ("y", json!(5))]),
            ins(1, "b", 1, &[("x", json!(2))]),
            ins(2, "c", 1, &[("x", json!(4)), ("x", json!(8))]),
        ]);

        let rows = f
            .read(MergeRequest::new().reduce(Arc::new(Sum), Grouping::Exact))
            .await;
        assert_eq!(
            rows,
            vec![
                ("\"x\"".to_string(), json!(15)),
                ("\"y\"".to_string(), json!(5))
            ]
        );

        let rows = f
            .read(MergeRequest::new().reduce(Arc::new(Count), Grouping::All))
            .await;
        assert_eq!(rows, vec![("null".to_string(), json!(5))]);

        let empty = f
            .read(
                MergeRequest::new()
                    .key_range(Some("zz".into()), None)
                    .reduce(Arc::new(Count), Grouping::All),
            )
            .await;
        assert!(empty.is_empty());
    }

    #[tokio::test]
    async fn include_docs_attaches_bodies() {
        let f = fixture(1);
        f.docs.put(PartitionId(0), "d1", json!({"title": "one"}));
        f.apply(vec![ins(0, "d1", 1, &[("k", json!(1))])]);

        let stream = f
            .merger
            .merge_read(MergeRequest::new().include_docs())
            .await
            .unwrap();
        let row = stream.rows().next().unwrap();
        assert_eq!(row.doc, Some(json!({"title": "one"})));

        let stream = f.merger.merge_read(MergeRequest::new()).await.unwrap();
        assert_eq!(stream.rows().next().unwrap().doc, None);
    }

    #[tokio::test]
    async fn stream_is_snapshot_isolated_and_restartable() {
        let f = fixture(1);
        f.apply(vec![ins(0, "d1", 1, &[("a", json!(1))])]);
        let mut stream = f.merger.merge_read(MergeRequest::new()).await.unwrap();

        let mut it = stream.rows();
        assert!(it.next().is_some());
        f.apply(vec![ins(0, "d2", 2, &[("b", json!(2))])]);
        assert!(it.next().is_none());
        drop(it);

        assert_eq!(stream.rows().count(), 1);
        assert_eq!(stream.snapshot_seqs(), vec![(PartitionId(0), 1)]);
        stream.restart().unwrap();
        assert_eq!(stream.rows().count(), 2);
    }

    #[tokio::test]
    async fn compaction_does_not_change_merge_output() {
        let f = fixture(2);
        let mut seq = [0u64; 2];
        for round in 0..30u64 {
            for p in 0..2u16 {
                seq[p as usize] += 1;
                let key = format!("k{}", round % 7);
                f.apply(vec![ChangeRecord::update(
                    PartitionId(p),
                    &format!("d{}", round % 4),
                    seq[p as usize],
                    vec![Emit::new(key.as_str(), json!(round))],
                )]);
            }
        }
        f.apply(vec![ChangeRecord::delete(PartitionId(1), "d2", seq[1] + 1)]);

        let before = f.read(MergeRequest::new()).await;
        let h = f.compactor.compact(CompactionTarget::Merged).unwrap();
        let report = h.wait().await.unwrap();
        assert_eq!(report.compacted.len(), 2);
        let after = f.read(MergeRequest::new()).await;
        assert_eq!(before, after);
        assert!(f
            .fragments
            .all()
            .iter()
            .all(|s| s.load().stats().tombstones == 0));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stale_policies() {
        let f = fixture(1);
        let p = PartitionId(0);
        f.coordinator
            .submit(UpdateBatch::new(p, vec![ins(0, "d1", 1, &[("a", json!(1))])]))
            .await
            .unwrap();

        // 构建卡住：ok 立即返回旧数据；update-before 超时退化为 ok
        let slot = f.fragments.get(p).unwrap();
        let gate = slot.lock_install();
        let pending = f
            .coordinator
            .submit(UpdateBatch::new(p, vec![ins(0, "d2", 2, &[("b", json!(2))])]));
        assert_eq!(f.read(MergeRequest::new()).await.len(), 1);
        let stale = f
            .read(
                MergeRequest::new()
                    .stale(Stale::UpdateBefore)
                    .update_timeout(Duration::from_millis(30)),
            )
            .await;
        assert_eq!(stale.len(), 1);
        drop(gate);

        // update-before 观察到调用前提交的全部更新
        let third = f
            .coordinator
            .submit(UpdateBatch::new(p, vec![ins(0, "d3", 3, &[("c", json!(3))])]));
        let fresh = f
            .read(MergeRequest::new().stale(Stale::UpdateBefore))
            .await;
        assert_eq!(fresh.len(), 3);
        assert_eq!(pending.await.unwrap(), 2);
        assert_eq!(third.await.unwrap(), 3);

        // update-before 同时拉取 change feed
        f.feed.append(vec![ins(0, "d4", 4, &[("d", json!(4))])]);
        let fresh = f
            .read(MergeRequest::new().stale(Stale::UpdateBefore))
            .await;
        assert_eq!(fresh.len(), 4);
    }

    #[tokio::test]
    async fn update_after_schedules_catch_up() {
        let f = fixture(1);
        let p = PartitionId(0);
        f.feed.append(vec![ins(0, "d1", 1, &[("a", json!(1))])]);

        let rows = f
            .read(MergeRequest::new().stale(Stale::UpdateAfter))
            .await;
        assert!(rows.is_empty());
        f.coordinator.drain(&[p]).await;
        assert_eq!(f.read(MergeRequest::new()).await.len(), 1);
    }

    #[tokio::test]
    async fn plan_cache_follows_state_changes() {
        let f = fixture(2);
        f.apply(vec![
            ins(0, "a", 1, &[("k", json!(0))]),
            ins(1, "b", 1, &[("k", json!(1))]),
        ]);
        assert_eq!(f.read(MergeRequest::new()).await.len(), 2);
        assert_eq!(f.merger.plan_cache_len(), 1);

        f.registry
            .set_partition_state(PartitionId(1), PartitionState::Passive)
            .unwrap();
        assert_eq!(f.merger.plan_cache_len(), 0);
        assert_eq!(f.read(MergeRequest::new()).await.len(), 1);
        assert_eq!(f.read(MergeRequest::new().with_passive()).await.len(), 2);

        f.registry
            .set_partition_state(PartitionId(1), PartitionState::Cleanup)
            .unwrap();
        let err = f
            .merger
            .merge_read(MergeRequest::new().include([PartitionId(1)]))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ReadError::Select(SelectError::PartitionUnavailable { .. })));
    }
}
