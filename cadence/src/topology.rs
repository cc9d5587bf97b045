//! CPU topology detection and worker thread placement.
//!
//! Worker pools can optionally pin their threads to cores so latency-
//! sensitive frame work is not migrated by the OS scheduler mid-frame.
//!
//! # Placement Strategy
//!
//! Workers are uniform, so placement is simple: when every worker can get
//! its own core, assign distinct cores in enumeration order; when the pool
//! is oversubscribed (more workers than cores), pinning would stack workers
//! on shared cores and hurt more than it helps, so all workers stay
//! unpinned.
//!
//! # Detection
//!
//! Uses `num_cpus` for physical/logical core counts and `core_affinity` for
//! pinning. On most systems, core IDs 0..N map to separate physical cores
//! before SMT siblings are enumerated.

use core_affinity::CoreId;

/// CPU topology information detected at runtime.
#[derive(Debug, Clone)]
pub struct CpuTopology {
    /// Total logical cores (including SMT/hyperthreads).
    pub logical_cores: usize,
    /// Total physical cores.
    pub physical_cores: usize,
    /// Whether SMT (hyperthreading) is enabled.
    pub has_smt: bool,
    /// Available core IDs for pinning.
    pub available_cores: Vec<usize>,
}

impl CpuTopology {
    /// Detects the CPU topology of the current system.
    #[must_use]
    pub fn detect() -> Self {
        let logical_cores = num_cpus::get();
        let physical_cores = num_cpus::get_physical();
        let has_smt = logical_cores > physical_cores;

        // Get available core IDs from core_affinity
        let available_cores = core_affinity::get_core_ids()
            .map(|ids| ids.into_iter().map(|id| id.id).collect())
            .unwrap_or_else(|| (0..logical_cores).collect());

        Self {
            logical_cores,
            physical_cores,
            has_smt,
            available_cores,
        }
    }

    /// Selects a placement for `workers` uniform worker threads.
    #[must_use]
    pub fn select_placement(&self, workers: usize) -> WorkerPlacement {
        if workers == 0 || workers > self.available_cores.len() {
            return WorkerPlacement::unpinned(workers);
        }
        WorkerPlacement {
            cores: self
                .available_cores
                .iter()
                .take(workers)
                .map(|&core| Some(core))
                .collect(),
        }
    }
}

/// Core assignments for a pool's workers; `cores[i]` is worker `i`'s core,
/// `None` meaning unpinned.
#[derive(Debug, Clone)]
pub struct WorkerPlacement {
    /// Per-worker core assignment.
    pub cores: Vec<Option<usize>>,
}

impl WorkerPlacement {
    /// Creates a placement with all workers unpinned.
    #[must_use]
    pub fn unpinned(workers: usize) -> Self {
        Self {
            cores: vec![None; workers],
        }
    }
}

/// Configuration for CPU pinning behavior.
#[derive(Debug, Clone, Default)]
pub enum CpuConfig {
    /// Auto-detect topology: distinct cores per worker when they fit,
    /// otherwise unpinned.
    Auto,
    /// User-specified core assignment per worker; missing entries are
    /// unpinned.
    Manual(Vec<Option<usize>>),
    /// Disable CPU pinning entirely.
    #[default]
    Disabled,
}

impl CpuConfig {
    /// Resolves the config to a concrete placement for `workers` threads.
    #[must_use]
    pub fn resolve(&self, workers: usize) -> WorkerPlacement {
        match self {
            Self::Auto => CpuTopology::detect().select_placement(workers),
            Self::Manual(cores) => {
                let mut cores = cores.clone();
                cores.resize(workers, None);
                WorkerPlacement { cores }
            }
            Self::Disabled => WorkerPlacement::unpinned(workers),
        }
    }
}

/// Pins the current thread to the specified core.
///
/// Returns `true` if pinning succeeded, `false` otherwise.
/// Pinning may fail if the core ID is invalid or the OS denies the request.
pub fn pin_to_core(core_id: usize) -> bool {
    let core = CoreId { id: core_id };
    core_affinity::set_for_current(core)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topology_detection_returns_valid_counts() {
        let topo = CpuTopology::detect();

        assert!(topo.logical_cores > 0, "should have at least 1 logical core");
        assert!(topo.physical_cores > 0, "should have at least 1 physical core");
        assert!(
            topo.logical_cores >= topo.physical_cores,
            "logical >= physical"
        );
        assert!(!topo.available_cores.is_empty(), "should have available cores");
    }

    #[test]
    fn placement_assigns_distinct_cores_when_they_fit() {
        let topo = CpuTopology {
            logical_cores: 4,
            physical_cores: 4,
            has_smt: false,
            available_cores: vec![0, 1, 2, 3],
        };
        let placement = topo.select_placement(3);

        assert_eq!(placement.cores, vec![Some(0), Some(1), Some(2)]);
    }

    #[test]
    fn oversubscribed_pool_stays_unpinned() {
        let topo = CpuTopology {
            logical_cores: 2,
            physical_cores: 2,
            has_smt: false,
            available_cores: vec![0, 1],
        };
        let placement = topo.select_placement(5);

        assert_eq!(placement.cores, vec![None; 5]);
    }

    #[test]
    fn cpu_config_disabled_returns_unpinned() {
        let placement = CpuConfig::Disabled.resolve(3);
        assert_eq!(placement.cores, vec![None; 3]);
    }

    #[test]
    fn cpu_config_manual_uses_specified_cores() {
        let placement = CpuConfig::Manual(vec![Some(5), None, Some(7)]).resolve(3);
        assert_eq!(placement.cores, vec![Some(5), None, Some(7)]);
    }

    #[test]
    fn cpu_config_manual_pads_and_truncates_to_worker_count() {
        let placement = CpuConfig::Manual(vec![Some(1)]).resolve(3);
        assert_eq!(placement.cores, vec![Some(1), None, None]);

        let placement = CpuConfig::Manual(vec![Some(1), Some(2), Some(3)]).resolve(2);
        assert_eq!(placement.cores, vec![Some(1), Some(2)]);
    }

    #[test]
    fn cpu_config_auto_resolves_to_worker_count() {
        let placement = CpuConfig::Auto.resolve(2);
        assert_eq!(placement.cores.len(), 2);
    }
}
