//! Command validation and routing.
//!
//! The dispatcher owns the device adapter and the shared resource table.
//! Every payload taken off the control channel lands here: decode, check
//! against device limits, then either call into the adapter (power caps)
//! or write a table slot (compute-unit masks). A rejected command is
//! logged and dropped; it never stops the poll loop.

use control_wire::Command;
use control_wire::DecodeError;
use control_wire::WireFormat;
use resource_table::layout;
use resource_table::ResourceTable;
use thiserror::Error;

use crate::device::DeviceAdapter;
use crate::device::DeviceError;
use crate::device::MILLIWATTS_PER_WATT;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("gpu index {gpu_index} out of range, host has {gpu_count} GPUs")]
    UnknownGpu { gpu_index: u32, gpu_count: u32 },

    #[error("requested cap {requested_mw} mW outside device range [{min_mw}, {max_mw}] mW")]
    PowerCapOutOfRange {
        requested_mw: u32,
        min_mw: u32,
        max_mw: u32,
    },

    #[error("requested cap {0} W overflows the device unit")]
    PowerCapOverflow(u32),

    #[error("mask high word {0:08x} has bits beyond the table width")]
    MaskBeyondTable(u32),

    #[error("mask enables {population} compute units, device allows at most {ceiling}")]
    MaskTooWide { population: u32, ceiling: u32 },

    #[error("mask enables no compute units")]
    EmptyMask,

    #[error(transparent)]
    Device(#[from] DeviceError),
}

pub struct Dispatcher {
    adapter: Box<dyn DeviceAdapter>,
    table: ResourceTable,
    format: WireFormat,
}

impl Dispatcher {
    pub fn new(adapter: Box<dyn DeviceAdapter>, table: ResourceTable, format: WireFormat) -> Self {
        Self {
            adapter,
            table,
            format,
        }
    }

    /// Decodes and applies one raw payload. Errors are per-command; the
    /// caller logs them and keeps polling.
    pub fn handle_payload(&mut self, payload: &[u8]) -> Result<Command, DispatchError> {
        let command = self.format.decode(payload)?;
        tracing::info!(%command, "received control command");
        self.apply(&command)?;
        Ok(command)
    }

    pub fn apply(&mut self, command: &Command) -> Result<(), DispatchError> {
        if let Some(gpu_index) = command.gpu_index() {
            let gpu_count = self.adapter.gpu_count();
            if gpu_index >= gpu_count {
                return Err(DispatchError::UnknownGpu {
                    gpu_index,
                    gpu_count,
                });
            }
        }

        match *command {
            Command::NoOp => Ok(()),
            Command::SetPowerCap { gpu_index, watts } => self.set_power_cap(gpu_index, watts),
            Command::ResetPowerCap { gpu_index } => {
                let default_mw = self.adapter.default_power_cap(gpu_index)?;
                self.adapter.set_power_cap(gpu_index, default_mw)?;
                tracing::info!(gpu_index, default_mw, "restored default power cap");
                Ok(())
            }
            Command::SetCuMask {
                gpu_index,
                word0,
                word1,
            } => self.set_cu_mask(gpu_index, word0, word1),
            Command::ResetCuMask { gpu_index } => {
                self.table.reset_mask(gpu_index);
                tracing::info!(gpu_index, "restored default compute-unit mask");
                Ok(())
            }
        }
    }

    fn set_power_cap(&mut self, gpu_index: u32, watts: u32) -> Result<(), DispatchError> {
        let requested_mw = watts
            .checked_mul(MILLIWATTS_PER_WATT)
            .ok_or(DispatchError::PowerCapOverflow(watts))?;
        let range = self.adapter.power_cap_range(gpu_index)?;
        if requested_mw < range.min_mw || requested_mw > range.max_mw {
            return Err(DispatchError::PowerCapOutOfRange {
                requested_mw,
                min_mw: range.min_mw,
                max_mw: range.max_mw,
            });
        }
        self.adapter.set_power_cap(gpu_index, requested_mw)?;
        tracing::info!(gpu_index, requested_mw, "applied power cap");
        Ok(())
    }

    fn set_cu_mask(&mut self, gpu_index: u32, word0: u32, word1: u32) -> Result<(), DispatchError> {
        if word1 & !layout::HIGH_WORD_VALID != 0 {
            return Err(DispatchError::MaskBeyondTable(word1));
        }
        let population = layout::mask_population(word0, word1);
        if population == 0 {
            return Err(DispatchError::EmptyMask);
        }
        let ceiling = self
            .adapter
            .compute_unit_count(gpu_index)?
            .min(layout::MASK_BITS);
        if population > ceiling {
            return Err(DispatchError::MaskTooWide {
                population,
                ceiling,
            });
        }
        self.table.write_mask(gpu_index, word0, word1);
        tracing::info!(gpu_index, word0, word1, population, "published compute-unit mask");
        Ok(())
    }

    pub fn table(&self) -> &ResourceTable {
        &self.table
    }

    /// Tears the dispatcher apart for ordered shutdown: the caller drops
    /// the table before shutting the adapter down.
    pub fn into_parts(self) -> (Box<dyn DeviceAdapter>, ResourceTable) {
        (self.adapter, self.table)
    }
}
