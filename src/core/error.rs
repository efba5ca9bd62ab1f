//! 错误分类
//!
//! - `StateError`：非法分区状态迁移（拒绝，不修改任何状态）
//! - `BuildError`：change feed 乱序/缺口等（该分区构建失败，直到外部重新同步）
//! - `SelectError`：读请求显式点名了 Cleanup/Missing 分区
//! - `CompactionError`：compaction 中止（可重试，旧 fragment 仍为权威）
//! - `UpdateError`：coordinator 队列层面的失败

use thiserror::Error;

use crate::core::partition::{PartitionId, PartitionState};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StateError {
    #[error("invalid transition for partition {partition}: {from} -> {to}")]
    InvalidTransition {
        partition: PartitionId,
        from: PartitionState,
        to: PartitionState,
    },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
    #[error("out of order sequence for partition {partition}: expected {expected}, got {got}")]
    OutOfOrderSequence {
        partition: PartitionId,
        expected: u64,
        got: u64,
    },

    #[error("record for partition {got} submitted in a batch for partition {expected}")]
    WrongPartition {
        expected: PartitionId,
        got: PartitionId,
    },

    #[error("partition {0} is missing")]
    PartitionMissing(PartitionId),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SelectError {
    #[error("partition {partition} is unavailable ({state})")]
    PartitionUnavailable {
        partition: PartitionId,
        state: PartitionState,
    },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompactionError {
    #[error("compaction of {target} aborted: {reason}")]
    Aborted { target: String, reason: String },

    #[error("compaction of partition {0} already running")]
    AlreadyRunning(PartitionId),

    #[error("partition {partition} cannot be compacted ({state})")]
    PartitionUnavailable {
        partition: PartitionId,
        state: PartitionState,
    },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UpdateError {
    #[error("build failed: {0}")]
    Build(#[from] BuildError),

    #[error("partition {partition} is unavailable for updates ({state})")]
    PartitionUnavailable {
        partition: PartitionId,
        state: PartitionState,
    },

    #[error("update cancelled before it was applied")]
    Cancelled,

    #[error("update worker stopped before reporting a result")]
    WorkerGone,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReadError {
    #[error(transparent)]
    Select(#[from] SelectError),
}

/// 引擎对外的统一错误
#[derive(Error, Debug)]
pub enum SetViewError {
    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Read(#[from] ReadError),

    #[error(transparent)]
    Compaction(#[from] CompactionError),

    #[error(transparent)]
    Update(#[from] UpdateError),

    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = StateError::InvalidTransition {
            partition: PartitionId(3),
            from: PartitionState::Missing,
            to: PartitionState::Passive,
        };
        assert_eq!(
            err.to_string(),
            "invalid transition for partition 3: missing -> passive"
        );

        let err = BuildError::OutOfOrderSequence {
            partition: PartitionId(1),
            expected: 5,
            got: 7,
        };
        assert_eq!(
            err.to_string(),
            "out of order sequence for partition 1: expected 5, got 7"
        );
    }

    #[test]
    fn update_error_wraps_build_error() {
        let e: UpdateError = BuildError::PartitionMissing(PartitionId(9)).into();
        assert!(matches!(e, UpdateError::Build(BuildError::PartitionMissing(_))));
    }
}
