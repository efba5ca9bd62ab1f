use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::core::{PartitionId, ViewKey};
use crate::query::range::KeyRange;
use crate::query::reduce::Reducer;

/// 显式分区过滤：include 与默认集合求交，exclude 再剔除
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct PartitionFilter {
    pub include: Option<BTreeSet<PartitionId>>,
    pub exclude: BTreeSet<PartitionId>,
}

/// include 中点名了 Cleanup/Missing 分区时的处理
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum UnavailablePolicy {
    #[default]
    Fail,
    Skip,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Stale {
    /// 读当前已索引数据，不等待
    #[default]
    Ok,
    /// 先追平（拉 feed + 等排队批次），超时则退化为 Ok
    UpdateBefore,
    /// 读当前数据，后台触发追平
    UpdateAfter,
}

impl FromStr for Stale {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ok" | "true" => Ok(Stale::Ok),
            "update_before" | "false" => Ok(Stale::UpdateBefore),
            "update_after" => Ok(Stale::UpdateAfter),
            other => Err(format!("unknown stale policy: {}", other)),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Grouping {
    /// 相同 key 归并为一行
    #[default]
    Exact,
    /// 整个区间归并为一行
    All,
}

#[derive(Clone)]
pub struct ReduceSpec {
    pub reducer: Arc<dyn Reducer>,
    pub grouping: Grouping,
}

impl fmt::Debug for ReduceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReduceSpec")
            .field("reducer", &self.reducer.name())
            .field("grouping", &self.grouping)
            .finish()
    }
}

/// 一次合并读请求
#[derive(Clone, Debug, Default)]
pub struct MergeRequest {
    pub filter: PartitionFilter,
    pub include_passive: bool,
    pub on_unavailable: UnavailablePolicy,
    pub stale: Stale,
    /// update-before 的等待上限；None 用引擎默认值
    pub update_timeout: Option<Duration>,
    pub reduce: Option<ReduceSpec>,
    pub range: KeyRange,
    pub descending: bool,
    pub skip: usize,
    pub limit: Option<usize>,
    pub include_docs: bool,
}

impl MergeRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn include(mut self, ids: impl IntoIterator<Item = PartitionId>) -> Self {
        self.filter.include = Some(ids.into_iter().collect());
        self
    }

    pub fn exclude(mut self, ids: impl IntoIterator<Item = PartitionId>) -> Self {
        self.filter.exclude.extend(ids);
        self
    }

    pub fn with_passive(mut self) -> Self {
        self.include_passive = true;
        self
    }

    pub fn skip_unavailable(mut self) -> Self {
        self.on_unavailable = UnavailablePolicy::Skip;
        self
    }

    pub fn stale(mut self, stale: Stale) -> Self {
        self.stale = stale;
        self
    }

    pub fn update_timeout(mut self, timeout: Duration) -> Self {
        self.update_timeout = Some(timeout);
        self
    }

    pub fn reduce(mut self, reducer: Arc<dyn Reducer>, grouping: Grouping) -> Self {
        self.reduce = Some(ReduceSpec { reducer, grouping });
        self
    }

    pub fn key_range(mut self, start: Option<ViewKey>, end: Option<ViewKey>) -> Self {
        self.range = KeyRange::new(start, end);
        self
    }

    pub fn exclusive_end(mut self) -> Self {
        self.range.inclusive_end = false;
        self
    }

    pub fn descending(mut self) -> Self {
        self.descending = true;
        self
    }

    pub fn skip(mut self, n: usize) -> Self {
        self.skip = n;
        self
    }

    pub fn limit(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }

    pub fn include_docs(mut self) -> Self {
        self.include_docs = true;
        self
    }

    /// 分区选择相关字段（plan cache 的 key）
    pub(crate) fn selection_key(&self) -> SelectionKey {
        SelectionKey {
            filter: self.filter.clone(),
            include_passive: self.include_passive,
            on_unavailable: self.on_unavailable,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SelectionKey {
    pub filter: PartitionFilter,
    pub include_passive: bool,
    pub on_unavailable: UnavailablePolicy,
}
