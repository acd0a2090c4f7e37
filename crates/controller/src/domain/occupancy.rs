//! Classification of GPU devices by what is running on them.

use std::collections::HashSet;

use api_types::DeviceMemory;
use api_types::GpuOccupancy;
use api_types::GpuProcess;
use api_types::GpuStatus;

const MIB: u64 = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OccupancyPolicy {
    /// Used memory above which an unmanaged device counts as occupied
    pub threshold_bytes: u64,
    /// Refuse loads onto devices occupied by others
    pub refuse_occupied: bool,
}

impl Default for OccupancyPolicy {
    fn default() -> Self {
        Self {
            threshold_bytes: 30 * MIB,
            refuse_occupied: true,
        }
    }
}

impl OccupancyPolicy {
    pub fn from_mib(threshold_mib: u64, refuse_occupied: bool) -> Self {
        Self {
            threshold_bytes: threshold_mib.saturating_mul(MIB),
            refuse_occupied,
        }
    }
}

/// Telemetry gathered for one device. Empty when telemetry is unavailable.
#[derive(Debug, Clone, Default)]
pub struct DeviceReading {
    pub memory: Option<DeviceMemory>,
    pub processes: Vec<GpuProcess>,
}

/// Managed instance covering a device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    pub gpu_set: String,
    pub model_id: String,
}

/// Occupancy of device `index`.
///
/// A device under a managed instance is `ModelLoaded`. Otherwise it is
/// occupied by others when a compute process outside `tracked` runs on it or
/// when used memory exceeds the policy threshold; the latter covers drivers
/// that hide processes of other pid namespaces.
pub fn classify(
    index: u32,
    placement: Option<Placement>,
    reading: DeviceReading,
    tracked: &HashSet<u32>,
    policy: &OccupancyPolicy,
) -> GpuStatus {
    let own_pid = std::process::id();
    let foreign_processes: Vec<GpuProcess> = reading
        .processes
        .into_iter()
        .filter(|process| process.pid != own_pid && !tracked.contains(&process.pid))
        .collect();
    let over_threshold = reading
        .memory
        .as_ref()
        .is_some_and(|memory| memory.used_bytes > policy.threshold_bytes);

    let occupancy = if placement.is_some() {
        GpuOccupancy::ModelLoaded
    } else if !foreign_processes.is_empty() || over_threshold {
        GpuOccupancy::OccupiedByOthers
    } else {
        GpuOccupancy::Idle
    };

    let (gpu_set, model_id) = placement
        .map(|placement| (placement.gpu_set, placement.model_id))
        .unzip();
    GpuStatus {
        index,
        occupancy,
        gpu_set,
        model_id,
        memory: reading.memory,
        foreign_processes,
        selectable: occupancy != GpuOccupancy::OccupiedByOthers,
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    fn reading(used_bytes: u64, pids: &[u32]) -> DeviceReading {
        DeviceReading {
            memory: Some(DeviceMemory {
                index: 0,
                used_bytes,
                total_bytes: 8 * 1024 * MIB,
            }),
            processes: pids
                .iter()
                .map(|&pid| GpuProcess {
                    pid,
                    used_bytes: None,
                })
                .collect(),
        }
    }

    #[test]
    fn idle_below_threshold() {
        let status = classify(
            0,
            None,
            reading(30 * MIB, &[]),
            &HashSet::new(),
            &OccupancyPolicy::default(),
        );

        assert_eq!(status.occupancy, GpuOccupancy::Idle);
        assert!(status.selectable);
    }

    #[test]
    fn memory_over_threshold_counts_as_occupied() {
        let status = classify(
            0,
            None,
            reading(30 * MIB + 1, &[]),
            &HashSet::new(),
            &OccupancyPolicy::default(),
        );

        assert_eq!(status.occupancy, GpuOccupancy::OccupiedByOthers);
        assert!(!status.selectable);
    }

    #[test]
    fn untracked_compute_process_counts_as_occupied() {
        let tracked = HashSet::from([100]);

        let status = classify(
            2,
            None,
            reading(0, &[100, 200]),
            &tracked,
            &OccupancyPolicy::default(),
        );

        assert_eq!(status.occupancy, GpuOccupancy::OccupiedByOthers);
        let foreign: Vec<u32> = status.foreign_processes.iter().map(|p| p.pid).collect();
        assert_eq!(foreign, vec![200]);
    }

    #[test]
    fn managed_device_is_loaded_whatever_its_memory() {
        let placement = Placement {
            gpu_set: "0,1".to_string(),
            model_id: "qwen".to_string(),
        };

        let status = classify(
            1,
            Some(placement),
            reading(6 * 1024 * MIB, &[]),
            &HashSet::new(),
            &OccupancyPolicy::default(),
        );

        assert_eq!(status.occupancy, GpuOccupancy::ModelLoaded);
        assert_eq!(status.gpu_set.as_deref(), Some("0,1"));
        assert_eq!(status.model_id.as_deref(), Some("qwen"));
        assert!(status.selectable);
    }

    #[test]
    fn no_telemetry_reads_as_idle() {
        let status = classify(
            3,
            None,
            DeviceReading::default(),
            &HashSet::new(),
            &OccupancyPolicy::from_mib(0, true),
        );

        assert_eq!(status.occupancy, GpuOccupancy::Idle);
        assert_eq!(status.memory, None);
    }
}
