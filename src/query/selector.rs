use std::collections::BTreeSet;

use crate::core::{PartitionId, PartitionRegistry, PartitionState, SelectError};
use crate::query::request::{MergeRequest, UnavailablePolicy};

/// 选择结果：参与合并的分区（有序）与被跳过的不可用分区
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Selection {
    pub partitions: Vec<PartitionId>,
    pub skipped: Vec<(PartitionId, PartitionState)>,
}

/// 默认 Active（+ Passive 需显式开启）；include 求交、exclude 剔除。
/// Cleanup / Missing 永远不会被选中。
pub fn select_partitions(
    registry: &PartitionRegistry,
    req: &MergeRequest,
) -> Result<Selection, SelectError> {
    let mut default: BTreeSet<PartitionId> = registry.list_by_state(PartitionState::Active);
    if req.include_passive {
        default.extend(registry.list_by_state(PartitionState::Passive));
    }

    let mut selection = Selection::default();
    let chosen: BTreeSet<PartitionId> = match &req.filter.include {
        None => default,
        Some(include) => {
            let mut out = BTreeSet::new();
            for &id in include {
                if default.contains(&id) {
                    out.insert(id);
                    continue;
                }
                let state = registry.state(id);
                match state {
                    // 存在但未开启 passive：按过滤语义静默排除
                    PartitionState::Passive => {}
                    _ => match req.on_unavailable {
                        UnavailablePolicy::Fail => {
                            return Err(SelectError::PartitionUnavailable {
                                partition: id,
                                state,
                            })
                        }
                        UnavailablePolicy::Skip => selection.skipped.push((id, state)),
                    },
                }
            }
            out
        }
    };

    selection.partitions = chosen
        .into_iter()
        .filter(|id| !req.filter.exclude.contains(id))
        .collect();
    Ok(selection)
}
