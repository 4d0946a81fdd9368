// src/utils/system.rs: System functions

use std::time::Duration;

use sysinfo::{CpuRefreshKind, RefreshKind, System};
use tokio::time::sleep;


/// Determines number of cores that can be used for CPU based tasks
///
/// # Returns
///
/// (usize, f32) physical cores, current cpu usage
pub async fn detect_cores_and_load() -> (usize, f32) {
    let refresh_kind = RefreshKind::nothing().with_cpu(Default::default());
    let mut system = System::new_with_specifics(refresh_kind);
    system.refresh_cpu_all();
    let physical_cores = System::physical_core_count().unwrap_or(1);
    system.refresh_cpu_specifics(CpuRefreshKind::nothing().with_cpu_usage());
    sleep(Duration::from_millis(100)).await;
    let cpu_load = system.global_cpu_usage();
    (physical_cores, cpu_load)
}


/// Number of stage instances allowed to run at once when not set explicitly:
/// each instance gets `threads` cores, at least one instance always runs.
///
/// # Arguments
///
/// * `physical_cores` - Number of real cores on the system
/// * `cpu_load` - Estimate of load on CPU from detect_cores_and_load
/// * `threads` - Threads passed to every tool
pub fn compute_max_parallel(physical_cores: usize, cpu_load: f32, threads: usize) -> usize {
    let usable = if cpu_load > 80.0 {
        physical_cores / 2
    } else {
        physical_cores
    };
    (usable / threads.max(1)).max(1)
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compute_max_parallel() {
        assert_eq!(compute_max_parallel(32, 10.0, 8), 4);
        assert_eq!(compute_max_parallel(32, 95.0, 8), 2);
        assert_eq!(compute_max_parallel(4, 0.0, 8), 1);
        assert_eq!(compute_max_parallel(4, 0.0, 0), 4);
    }
}
