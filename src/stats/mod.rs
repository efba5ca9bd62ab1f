use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::core::{PartitionId, PartitionState};

/// 引擎级计数器（全部 Relaxed：只用于观测）
#[derive(Debug, Default)]
pub struct EngineStats {
    pub batches_applied: AtomicU64,
    pub records_applied: AtomicU64,
    pub build_failures: AtomicU64,
    pub compactions: AtomicU64,
    pub compactions_aborted: AtomicU64,
    pub cleanups: AtomicU64,
    pub update_before_timeouts: AtomicU64,
}

impl EngineStats {
    pub fn counters(&self) -> EngineCounters {
        EngineCounters {
            batches_applied: self.batches_applied.load(Ordering::Relaxed),
            records_applied: self.records_applied.load(Ordering::Relaxed),
            build_failures: self.build_failures.load(Ordering::Relaxed),
            compactions: self.compactions.load(Ordering::Relaxed),
            compactions_aborted: self.compactions_aborted.load(Ordering::Relaxed),
            cleanups: self.cleanups.load(Ordering::Relaxed),
            update_before_timeouts: self.update_before_timeouts.load(Ordering::Relaxed),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EngineCounters {
    pub batches_applied: u64,
    pub records_applied: u64,
    pub build_failures: u64,
    pub compactions: u64,
    pub compactions_aborted: u64,
    pub cleanups: u64,
    pub update_before_timeouts: u64,
}

#[derive(Clone, Debug)]
pub struct PartitionInfo {
    pub id: PartitionId,
    pub state: PartitionState,
    pub indexed_seq: u64,
    pub pending_update: bool,
    pub last_error: Option<String>,
    pub version: u64,
    pub live_entries: usize,
    pub tombstones: usize,
    pub back_index_rows: usize,
    pub compacting: bool,
}

/// 组级状态报告
#[derive(Clone, Debug, Default)]
pub struct GroupInfo {
    pub partitions: Vec<PartitionInfo>,
    pub counters: EngineCounters,
    /// 进程级 RSS（从 /proc/self/statm 读取）
    pub process_rss_bytes: u64,
}

impl GroupInfo {
    pub fn partition(&self, id: PartitionId) -> Option<&PartitionInfo> {
        self.partitions.iter().find(|p| p.id == id)
    }

    pub fn total_live_entries(&self) -> usize {
        self.partitions.iter().map(|p| p.live_entries).sum()
    }

    /// 从 /proc/self/statm 读取进程 RSS
    pub fn read_process_rss() -> u64 {
        std::fs::read_to_string("/proc/self/statm")
            .ok()
            .and_then(|s| {
                // statm 格式: size resident shared text lib data dt (单位: 页)
                let parts: Vec<&str> = s.split_whitespace().collect();
                parts.get(1)?.parse::<u64>().ok()
            })
            .map(|pages| pages * 4096) // x86_64 page size
            .unwrap_or(0)
    }
}

fn human_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    const GB: u64 = 1024 * MB;
    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

impl fmt::Display for GroupInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let c = &self.counters;
        writeln!(f, "╔══════════════════════════════════════════════════════════════╗")?;
        writeln!(f, "║                     set-view Group Info                      ║")?;
        writeln!(f, "╠══════════════════════════════════════════════════════════════╣")?;
        writeln!(
            f,
            "║ Process RSS: {:>47} ║",
            human_bytes(self.process_rss_bytes)
        )?;
        writeln!(f, "╠──────────────────────────────────────────────────────────────╣")?;
        writeln!(f, "║  part  state     seq        live   tombs  docs   ver  flags  ║")?;
        for p in &self.partitions {
            let flags = format!(
                "{}{}{}",
                if p.pending_update { "P" } else { "-" },
                if p.compacting { "C" } else { "-" },
                if p.last_error.is_some() { "E" } else { "-" },
            );
            writeln!(
                f,
                "║ {:>5}  {:<8} {:>6} {:>11} {:>7} {:>5} {:>5}  {:<5} ║",
                p.id.0,
                p.state.to_string(),
                p.indexed_seq,
                p.live_entries,
                p.tombstones,
                p.back_index_rows,
                p.version,
                flags
            )?;
        }
        writeln!(f, "╠──────────────────────────────────────────────────────────────╣")?;
        writeln!(
            f,
            "║   batches:      {:>10}   records:      {:>10}         ║",
            c.batches_applied, c.records_applied
        )?;
        writeln!(
            f,
            "║   build errors: {:>10}   ub timeouts:  {:>10}         ║",
            c.build_failures, c.update_before_timeouts
        )?;
        writeln!(
            f,
            "║   compactions:  {:>10}   aborted:      {:>10}         ║",
            c.compactions, c.compactions_aborted
        )?;
        writeln!(
            f,
            "║   cleanups:     {:>10}                                   ║",
            c.cleanups
        )?;
        writeln!(f, "╚══════════════════════════════════════════════════════════════╝")?;
        for p in &self.partitions {
            if let Some(e) = &p.last_error {
                writeln!(f, "partition {} last error: {}", p.id, e)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_snapshot() {
        let s = EngineStats::default();
        s.batches_applied.fetch_add(2, Ordering::Relaxed);
        s.cleanups.fetch_add(1, Ordering::Relaxed);
        let c = s.counters();
        assert_eq!(c.batches_applied, 2);
        assert_eq!(c.cleanups, 1);
        assert_eq!(c.records_applied, 0);
    }

    #[test]
    fn display_lists_partitions_and_errors() {
        let info = GroupInfo {
            partitions: vec![PartitionInfo {
                id: PartitionId(3),
                state: PartitionState::Passive,
                indexed_seq: 42,
                pending_update: true,
                last_error: Some("boom".into()),
                version: 7,
                live_entries: 10,
                tombstones: 2,
                back_index_rows: 5,
                compacting: false,
            }],
            ..Default::default()
        };
        let text = info.to_string();
        assert!(text.contains("passive"));
        assert!(text.contains("P-E"));
        assert!(text.contains("partition 3 last error: boom"));
        assert_eq!(info.total_live_entries(), 10);
    }

    #[test]
    fn human_bytes_units() {
        assert_eq!(human_bytes(512), "512 B");
        assert_eq!(human_bytes(2048), "2.00 KB");
    }
}
