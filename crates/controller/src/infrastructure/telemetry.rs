use std::sync::Arc;

use api_types::DeviceMemory;
use api_types::GpuProcess;
use async_trait::async_trait;
use error_stack::Report;
use nvml_wrapper::enums::device::UsedGpuMemory;
use nvml_wrapper::error::NvmlError;
use nvml_wrapper::Nvml;

use crate::domain::traits::GpuTelemetry;
use crate::domain::traits::TelemetryError;

/// Device memory and compute processes read from NVML.
#[derive(Debug)]
pub struct NvmlTelemetry {
    nvml: Arc<Nvml>,
}

// Nvml handles are internally synchronized by the driver library
unsafe impl Send for NvmlTelemetry {}
unsafe impl Sync for NvmlTelemetry {}

impl NvmlTelemetry {
    pub fn new(nvml: Arc<Nvml>) -> Self {
        Self { nvml }
    }
}

#[async_trait]
impl GpuTelemetry for NvmlTelemetry {
    fn device_count(&self) -> Result<u32, Report<TelemetryError>> {
        self.nvml.device_count().map_err(|e| {
            Report::new(TelemetryError::Unavailable {
                message: e.to_string(),
            })
        })
    }

    async fn device_memory(&self, indices: &[u32]) -> Result<Vec<DeviceMemory>, Report<TelemetryError>> {
        let mut memory = Vec::with_capacity(indices.len());
        for &index in indices {
            let device = self
                .nvml
                .device_by_index(index)
                .map_err(|e| device_error(index, e))?;
            let info = device.memory_info().map_err(|e| device_error(index, e))?;
            memory.push(DeviceMemory {
                index,
                used_bytes: info.used,
                total_bytes: info.total,
            });
        }
        Ok(memory)
    }

    async fn compute_processes(&self, index: u32) -> Result<Vec<GpuProcess>, Report<TelemetryError>> {
        let device = self
            .nvml
            .device_by_index(index)
            .map_err(|e| device_error(index, e))?;
        let processes = device
            .running_compute_processes()
            .map_err(|e| device_error(index, e))?;

        Ok(processes
            .iter()
            .map(|process_info| GpuProcess {
                pid: process_info.pid,
                used_bytes: match process_info.used_gpu_memory {
                    UsedGpuMemory::Used(used) => Some(used),
                    UsedGpuMemory::Unavailable => None,
                },
            })
            .collect())
    }
}

fn device_error(index: u32, e: NvmlError) -> Report<TelemetryError> {
    Report::new(TelemetryError::Device {
        index,
        message: e.to_string(),
    })
}
