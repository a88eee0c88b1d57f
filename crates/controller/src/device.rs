//! Device adapter: the boundary to the vendor telemetry/control library.
//!
//! The daemon only ever talks to [`DeviceAdapter`]; NVML specifics stay in
//! [`NvmlAdapter`]. Adapter failures are fatal to the single command being
//! dispatched, never to the daemon.

use nvml_wrapper::Nvml;
use thiserror::Error;

/// Milliwatts per watt: clients speak watts, NVML speaks milliwatts.
pub const MILLIWATTS_PER_WATT: u32 = 1000;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("NVML call failed: {0}")]
    Nvml(#[from] nvml_wrapper::error::NvmlError),
}

/// Power cap limits in the device's native unit (milliwatts).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PowerCapRange {
    pub min_mw: u32,
    pub max_mw: u32,
}

pub trait DeviceAdapter: Send {
    /// Number of GPUs on the host, fixed for the adapter's lifetime.
    fn gpu_count(&self) -> u32;

    fn power_cap_range(&self, gpu_index: u32) -> Result<PowerCapRange, DeviceError>;

    /// The cap restored by a reset command, in milliwatts.
    fn default_power_cap(&self, gpu_index: u32) -> Result<u32, DeviceError>;

    fn set_power_cap(&self, gpu_index: u32, cap_mw: u32) -> Result<(), DeviceError>;

    /// Compute units on the GPU, used to bound mask population.
    fn compute_unit_count(&self, gpu_index: u32) -> Result<u32, DeviceError>;

    fn shutdown(&mut self) {}
}

pub struct NvmlAdapter {
    nvml: Nvml,
    device_count: u32,
}

impl NvmlAdapter {
    pub fn init() -> Result<Self, DeviceError> {
        let nvml = match Nvml::init() {
            Ok(nvml) => {
                tracing::info!("NVML initialized");
                nvml
            }
            Err(_) => {
                tracing::warn!("standard NVML init failed, trying explicit library path");
                Nvml::builder()
                    .lib_path(std::ffi::OsStr::new("libnvidia-ml.so.1"))
                    .init()?
            }
        };

        let device_count = nvml.device_count()?;
        tracing::info!(device_count, "discovered GPU devices");

        Ok(Self { nvml, device_count })
    }
}

impl DeviceAdapter for NvmlAdapter {
    fn gpu_count(&self) -> u32 {
        self.device_count
    }

    fn power_cap_range(&self, gpu_index: u32) -> Result<PowerCapRange, DeviceError> {
        let device = self.nvml.device_by_index(gpu_index)?;
        let constraints = device.power_management_limit_constraints()?;
        Ok(PowerCapRange {
            min_mw: constraints.min_limit,
            max_mw: constraints.max_limit,
        })
    }

    fn default_power_cap(&self, gpu_index: u32) -> Result<u32, DeviceError> {
        let device = self.nvml.device_by_index(gpu_index)?;
        Ok(device.power_management_limit_default()?)
    }

    fn set_power_cap(&self, gpu_index: u32, cap_mw: u32) -> Result<(), DeviceError> {
        let mut device = self.nvml.device_by_index(gpu_index)?;
        device.set_power_management_limit(cap_mw)?;
        Ok(())
    }

    fn compute_unit_count(&self, gpu_index: u32) -> Result<u32, DeviceError> {
        let device = self.nvml.device_by_index(gpu_index)?;
        Ok(device.num_cores()?)
    }

    fn shutdown(&mut self) {
        tracing::info!("device adapter shut down");
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use std::sync::Arc;
    use std::sync::Mutex;

    use super::*;

    /// Test double recording every power-cap call.
    pub struct MockAdapter {
        pub gpu_count: u32,
        pub range: PowerCapRange,
        pub default_mw: u32,
        pub cu_count: u32,
        pub set_caps: Arc<Mutex<Vec<(u32, u32)>>>,
    }

    impl MockAdapter {
        pub fn new(gpu_count: u32) -> Self {
            Self {
                gpu_count,
                range: PowerCapRange {
                    min_mw: 1_000,
                    max_mw: 225_000,
                },
                default_mw: 225_000,
                cu_count: 60,
                set_caps: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    impl DeviceAdapter for MockAdapter {
        fn gpu_count(&self) -> u32 {
            self.gpu_count
        }

        fn power_cap_range(&self, _gpu_index: u32) -> Result<PowerCapRange, DeviceError> {
            Ok(self.range)
        }

        fn default_power_cap(&self, _gpu_index: u32) -> Result<u32, DeviceError> {
            Ok(self.default_mw)
        }

        fn set_power_cap(&self, gpu_index: u32, cap_mw: u32) -> Result<(), DeviceError> {
            self.set_caps.lock().unwrap().push((gpu_index, cap_mw));
            Ok(())
        }

        fn compute_unit_count(&self, _gpu_index: u32) -> Result<u32, DeviceError> {
            Ok(self.cu_count)
        }
    }
}
