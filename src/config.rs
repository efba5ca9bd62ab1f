use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// 引擎配置（TOML）。所有字段都有默认值，未知字段直接报错。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    /// 持久化目录：group.state + frag-<id>.idx
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// 并发构建上限；0 = 按 CPU 与负载自适应
    #[serde(default)]
    pub build_parallelism: usize,

    /// Cleanup 分区在被释放前的宽限期（毫秒）
    #[serde(default = "default_cleanup_grace_ms")]
    pub cleanup_grace_ms: u64,

    /// update-before 读的默认等待上限（毫秒）
    #[serde(default = "default_update_before_timeout_ms")]
    pub update_before_timeout_ms: u64,

    /// 后台 checkpoint 间隔（秒）；0 = 只在显式调用时写
    #[serde(default = "default_checkpoint_interval_secs")]
    pub checkpoint_interval_secs: u64,

    /// merge plan 缓存条目上限
    #[serde(default = "default_plan_cache_capacity")]
    pub plan_cache_capacity: usize,

    #[serde(default)]
    pub compaction: CompactionConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CompactionConfig {
    /// 垃圾占比（tombstone + 已删文档行）超过该值触发自动 compaction
    #[serde(default = "default_garbage_ratio")]
    pub garbage_ratio: f64,

    /// fragment 槽位数低于该值时不自动 compaction
    #[serde(default = "default_min_entries")]
    pub min_entries: usize,

    #[serde(default = "default_auto")]
    pub auto: bool,
}

pub fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("set-view")
}

fn default_cleanup_grace_ms() -> u64 {
    500
}

fn default_update_before_timeout_ms() -> u64 {
    5_000
}

fn default_checkpoint_interval_secs() -> u64 {
    300
}

fn default_plan_cache_capacity() -> usize {
    256
}

fn default_garbage_ratio() -> f64 {
    0.3
}

fn default_min_entries() -> usize {
    1024
}

fn default_auto() -> bool {
    true
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            build_parallelism: 0,
            cleanup_grace_ms: default_cleanup_grace_ms(),
            update_before_timeout_ms: default_update_before_timeout_ms(),
            checkpoint_interval_secs: default_checkpoint_interval_secs(),
            plan_cache_capacity: default_plan_cache_capacity(),
            compaction: CompactionConfig::default(),
        }
    }
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            garbage_ratio: default_garbage_ratio(),
            min_entries: default_min_entries(),
            auto: default_auto(),
        }
    }
}

impl EngineConfig {
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    pub fn from_toml_str(s: &str) -> anyhow::Result<Self> {
        toml::from_str(s).context("invalid set-view config")
    }

    pub fn from_toml_file(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        Self::from_toml_str(&text)
    }

    pub fn cleanup_grace(&self) -> Duration {
        Duration::from_millis(self.cleanup_grace_ms)
    }

    pub fn update_before_timeout(&self) -> Duration {
        Duration::from_millis(self.update_before_timeout_ms)
    }

    pub fn checkpoint_interval(&self) -> Option<Duration> {
        (self.checkpoint_interval_secs > 0).then(|| Duration::from_secs(self.checkpoint_interval_secs))
    }
}

impl CompactionConfig {
    /// 自动 compaction 判定
    pub fn should_compact(&self, slots: usize, garbage_ratio: f64) -> bool {
        self.auto && slots >= self.min_entries && garbage_ratio > self.garbage_ratio
    }
}
