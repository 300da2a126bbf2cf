use crate::{
    address, interleave,
    page::PagePolicy,
    policy::{ArbitrationOrder, SchedulerKind},
};
use color_eyre::eyre::{self, WrapErr};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{name} must be non-zero")]
    Zero { name: &'static str },

    #[error("{name} must be a power of two (got {value})")]
    NotPowerOfTwo { name: &'static str, value: u64 },

    #[error("{name} must be a percentage between 0 and 100 (got {value})")]
    ThresholdOutOfRange { name: &'static str, value: u8 },

    #[error("low write threshold {low}% exceeds the service write threshold {high}%")]
    ThresholdInverted { low: u8, high: u8 },

    #[error("row buffer size {row_buffer_size} is smaller than the line size {line_size}")]
    RowBufferTooSmall { row_buffer_size: u64, line_size: u64 },

    #[error("invalid interleave order {order:?}: {reason}")]
    InvalidInterleaveOrder { order: String, reason: String },

    #[error("memory size {memory_size} is too small: channel, rank, bank and column fields need {required_bits} address bits")]
    RangeTooSmall { memory_size: u64, required_bits: u32 },

    #[error("address range starting at {base:#x} with {memory_size} bytes overflows")]
    RangeOverflow { base: address, memory_size: u64 },

    #[error("channel xor source bits {low}..{high} are invalid or overlap the channel field")]
    InvalidXorBits { low: u32, high: u32 },

    #[error("topology has {have} channels but {want} are configured")]
    TopologyChannels { have: usize, want: usize },

    #[error("channel {channel} has {endpoints} endpoints which does not evenly divide {banks} banks")]
    TopologyEndpoints {
        channel: usize,
        endpoints: usize,
        banks: usize,
    },
}

/// Memory scheduler configuration.
///
/// Immutable once a scheduler has been built from it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Number of independent channels (power of two)
    pub channel_count: usize,
    /// Number of banks per rank in each channel (power of two)
    pub banks_per_channel: usize,
    /// Number of ranks per channel (power of two)
    pub ranks_per_channel: usize,
    /// Read queue capacity per channel
    pub read_buffer_size: usize,
    /// Write queue capacity per channel
    pub write_buffer_size: usize,
    /// Response queue capacity per channel
    pub resp_buffer_size: usize,
    /// Use a single shared read/write queue of `read_buffer_size + write_buffer_size` entries
    pub unified_queue: bool,
    /// Write queue occupancy (percent) at which writes are preferred
    pub service_write_threshold: u8,
    /// Occupancy (percent) below which write draining stops.
    ///
    /// Defaults to `service_write_threshold`.
    pub service_write_low_threshold: Option<u8>,
    pub page_policy: PagePolicy,
    /// Address field permutation from most to least significant, e.g. `RoRaBaCoCh`
    pub address_interleave_order: String,
    /// Bytes per line (burst), power of two
    pub line_size: u64,
    /// Bytes per row buffer, power of two
    pub row_buffer_size: u64,
    /// First address served by the scheduler
    pub base_address: address,
    /// Size of the served address range in bytes
    pub memory_size: u64,
    /// XOR the channel field with the address bits starting at this position
    pub channel_xor_low_bit: Option<u32>,
    /// XOR the bank field with the low row bits
    pub bank_xor: bool,
    pub scheduler: SchedulerKind,
    pub arbitration_order: ArbitrationOrder,
    /// Queue entries of one class a single requester may hold per channel.
    ///
    /// When set, requesters are also served round-robin among equally
    /// ranked candidates.
    pub per_requester_quota: Option<usize>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            channel_count: 1,
            banks_per_channel: 8,
            ranks_per_channel: 1,
            read_buffer_size: 2,
            write_buffer_size: 32,
            resp_buffer_size: 64,
            unified_queue: false,
            service_write_threshold: 60,
            service_write_low_threshold: None,
            page_policy: PagePolicy::Open,
            address_interleave_order: "RoRaBaCoCh".to_string(),
            line_size: 64,
            row_buffer_size: 2048,
            base_address: 0,
            memory_size: 512 * 1024 * 1024,
            channel_xor_low_bit: None,
            bank_xor: false,
            scheduler: SchedulerKind::FrFcfs,
            arbitration_order: ArbitrationOrder::ClassFirst,
            per_requester_quota: None,
        }
    }
}

impl std::fmt::Display for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let size = human_bytes::human_bytes(self.memory_size as f64);
        write!(
            f,
            "{size} @ {:#x} ({} channels x {} ranks x {} banks, {}, {} page, {})",
            self.base_address,
            self.channel_count,
            self.ranks_per_channel,
            self.banks_per_channel,
            self.address_interleave_order,
            self.page_policy,
            self.scheduler,
        )
    }
}

fn check_non_zero(name: &'static str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::Zero { name });
    }
    Ok(())
}

fn check_power_of_two(name: &'static str, value: u64) -> Result<(), ConfigError> {
    if !interleave::is_power_of_two(value) {
        return Err(ConfigError::NotPowerOfTwo { name, value });
    }
    Ok(())
}

impl Config {
    pub fn from_path(path: impl AsRef<Path>) -> eyre::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .wrap_err_with(|| eyre::eyre!("failed to read config {}", path.display()))?;
        let config: Self = match path.extension().and_then(std::ffi::OsStr::to_str) {
            Some("json") => serde_json::from_str(&raw)
                .wrap_err_with(|| eyre::eyre!("bad json config {}", path.display()))?,
            _ => serde_yaml::from_str(&raw)
                .wrap_err_with(|| eyre::eyre!("bad yaml config {}", path.display()))?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Total number of bank states per channel.
    #[must_use]
    pub fn num_banks(&self) -> usize {
        self.banks_per_channel * self.ranks_per_channel
    }

    /// Capacity of the shared queue in unified mode.
    #[must_use]
    pub fn unified_buffer_size(&self) -> usize {
        self.read_buffer_size + self.write_buffer_size
    }

    #[must_use]
    pub fn write_low_threshold(&self) -> u8 {
        self.service_write_low_threshold
            .unwrap_or(self.service_write_threshold)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        check_non_zero("read_buffer_size", self.read_buffer_size as u64)?;
        check_non_zero("write_buffer_size", self.write_buffer_size as u64)?;
        check_non_zero("resp_buffer_size", self.resp_buffer_size as u64)?;
        check_power_of_two("channel_count", self.channel_count as u64)?;
        check_power_of_two("banks_per_channel", self.banks_per_channel as u64)?;
        check_power_of_two("ranks_per_channel", self.ranks_per_channel as u64)?;
        check_power_of_two("line_size", self.line_size)?;
        check_power_of_two("row_buffer_size", self.row_buffer_size)?;
        check_non_zero("memory_size", self.memory_size)?;
        if let Some(quota) = self.per_requester_quota {
            check_non_zero("per_requester_quota", quota as u64)?;
        }

        if self.service_write_threshold > 100 {
            return Err(ConfigError::ThresholdOutOfRange {
                name: "service_write_threshold",
                value: self.service_write_threshold,
            });
        }
        if let Some(low) = self.service_write_low_threshold {
            if low > 100 {
                return Err(ConfigError::ThresholdOutOfRange {
                    name: "service_write_low_threshold",
                    value: low,
                });
            }
            if low > self.service_write_threshold {
                return Err(ConfigError::ThresholdInverted {
                    low,
                    high: self.service_write_threshold,
                });
            }
        }
        if self.row_buffer_size < self.line_size {
            return Err(ConfigError::RowBufferTooSmall {
                row_buffer_size: self.row_buffer_size,
                line_size: self.line_size,
            });
        }
        if self.base_address.checked_add(self.memory_size).is_none() {
            return Err(ConfigError::RangeOverflow {
                base: self.base_address,
                memory_size: self.memory_size,
            });
        }
        if self.unified_queue && self.service_write_low_threshold.is_some() {
            log::warn!(
                "unified queue ignores the write thresholds (service_write_threshold={}%)",
                self.service_write_threshold
            );
        }
        // interleave layout checks (order, widths, xor bits)
        interleave::AddressInterleaver::new(self)?;
        Ok(())
    }
}
