use std::sync::Arc;

use anyhow::bail;
use anyhow::Result;
use nvml_wrapper::Nvml;

use super::telemetry::NvmlTelemetry;

/// Device layout the controller allocates against
pub struct GpuSystem {
    /// `None` when telemetry is disabled or NVML is unavailable
    pub telemetry: Option<Arc<NvmlTelemetry>>,
    pub device_count: u32,
}

/// Initialize GPU discovery and telemetry.
///
/// An explicit `device_count` wins over the detected one. Without NVML the
/// controller still runs, but then `device_count` must be given.
pub fn initialize_gpu_system(device_count: Option<u32>, disable_telemetry: bool) -> Result<GpuSystem> {
    if disable_telemetry {
        tracing::info!("GPU telemetry disabled by configuration");
        let Some(device_count) = device_count else {
            bail!("--device-count is required when GPU telemetry is disabled");
        };
        return Ok(GpuSystem {
            telemetry: None,
            device_count,
        });
    }

    tracing::info!("Initializing GPU system...");
    let nvml = match init_nvml() {
        Ok(nvml) => Arc::new(nvml),
        Err(e) => {
            tracing::warn!(error = %e, "NVML unavailable, GPU telemetry disabled");
            let Some(device_count) = device_count else {
                bail!("cannot detect GPUs without NVML ({e}); pass --device-count");
            };
            return Ok(GpuSystem {
                telemetry: None,
                device_count,
            });
        }
    };

    let detected = discover_gpu_devices(&nvml)?;
    let device_count = match device_count {
        Some(configured) if configured != detected => {
            tracing::warn!(configured, detected, "Configured device count differs from detected GPUs");
            configured
        }
        Some(configured) => configured,
        None => detected,
    };

    Ok(GpuSystem {
        telemetry: Some(Arc::new(NvmlTelemetry::new(nvml))),
        device_count,
    })
}

fn init_nvml() -> Result<Nvml> {
    match Nvml::init() {
        Ok(nvml) => {
            tracing::info!("NVML initialized successfully");
            Ok(nvml)
        }
        Err(_) => {
            tracing::warn!("Standard NVML init failed, trying with explicit library path");
            let nvml = Nvml::builder()
                .lib_path(std::ffi::OsStr::new("libnvidia-ml.so.1"))
                .init()?;
            tracing::info!("NVML initialized with explicit library path");
            Ok(nvml)
        }
    }
}

fn discover_gpu_devices(nvml: &Nvml) -> Result<u32> {
    let device_count = nvml.device_count()?;
    tracing::info!("Discovered {} GPU device(s)", device_count);

    for i in 0..device_count {
        let device = nvml.device_by_index(i)?;
        let name = device.name()?;
        let memory = device.memory_info()?;
        tracing::info!(
            index = i,
            total_mib = memory.total / (1024 * 1024),
            "Found GPU {}: {}",
            i,
            name
        );
    }

    Ok(device_count)
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn disabled_telemetry_uses_configured_count() {
        let system = initialize_gpu_system(Some(2), true).expect("should not touch NVML");
        assert_eq!(system.device_count, 2);
        assert!(system.telemetry.is_none());
    }

    #[test]
    fn disabled_telemetry_requires_device_count() {
        assert!(initialize_gpu_system(None, true).is_err());
    }
}
