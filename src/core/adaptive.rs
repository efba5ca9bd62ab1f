use std::sync::atomic::{AtomicUsize, Ordering};
use sysinfo::System;

/// 自适应调度器：根据负载与内存压力决定同时在跑的分区构建数
pub struct AdaptiveScheduler {
    target_parallelism: AtomicUsize,
    system: System,
}

impl Default for AdaptiveScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl AdaptiveScheduler {
    pub fn new() -> Self {
        let mut sys = System::new();
        sys.refresh_memory();

        Self {
            target_parallelism: AtomicUsize::new(num_cpus::get()),
            system: sys,
        }
    }

    pub fn target_parallelism(&self) -> usize {
        self.target_parallelism.load(Ordering::Relaxed)
    }

    /// 动态调整并行度
    pub fn adjust_parallelism(&mut self) -> usize {
        self.system.refresh_memory();

        let load = System::load_average().one;
        let cpu_count = num_cpus::get() as f64;
        let mem_free = self.system.available_memory();
        let total_mem = self.system.total_memory().max(1);
        let mem_pressure = 1.0 - (mem_free as f64 / total_mem as f64);

        // 构建是 CPU + 内存双密集（copy-on-write 会复制 fragment），不做超配
        let new_parallelism = if load > cpu_count * 0.8 || mem_pressure > 0.8 {
            // 系统繁忙：保守降级
            (cpu_count * 0.5) as usize
        } else {
            cpu_count as usize
        }
        .max(1);

        let old = self.target_parallelism.swap(new_parallelism, Ordering::Relaxed);

        if old != new_parallelism {
            tracing::info!(
                "Adaptive build parallelism: {} -> {} (load: {:.2}, mem_pressure: {:.2})",
                old,
                new_parallelism,
                load,
                mem_pressure
            );
        }

        new_parallelism
    }

    /// 配置值优先；0 表示交给调度器决定
    pub fn resolve(&mut self, configured: usize) -> usize {
        if configured > 0 {
            return configured;
        }
        self.adjust_parallelism()
    }
}
