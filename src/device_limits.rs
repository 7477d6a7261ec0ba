//! # Device Limits Configuration
//!
//! Per-model limits applied while planning and framing reads.
//!
//! - **max_block_size**: how many register definitions the planner may merge
//!   into one block. Defaults to 1 (no merging), the safe choice for
//!   transductors whose register maps contain holes the device refuses to read.
//! - **max_read_registers**: registers per wire message (FC03/04, max 125).
//!   Larger blocks are split into several messages.

use crate::constants::MAX_READ_REGISTERS;

/// Default number of definitions merged into one block.
pub const DEFAULT_MAX_BLOCK_SIZE: u16 = 1;

/// Default maximum registers per read operation (Modbus specification).
pub const DEFAULT_MAX_READ_REGISTERS: u16 = MAX_READ_REGISTERS as u16;

/// Device-model specific planning and framing limits.
///
/// # Example
///
/// ```rust
/// use voltage_collector::DeviceLimits;
///
/// let limits = DeviceLimits::new()
///     .with_max_block_size(10)
///     .with_max_read_registers(50);
///
/// assert_eq!(limits.max_block_size, 10);
/// assert_eq!(limits.read_request_count(120), 3);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceLimits {
    /// Maximum register definitions per planned block.
    pub max_block_size: u16,
    /// Maximum registers per read request.
    pub max_read_registers: u16,
}

impl DeviceLimits {
    /// Create new device limits with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set maximum definitions per block. Zero is treated as 1.
    pub fn with_max_block_size(mut self, size: u16) -> Self {
        self.max_block_size = size.max(1);
        self
    }

    /// Set maximum read registers, clamped to `1..=125`.
    pub fn with_max_read_registers(mut self, count: u16) -> Self {
        self.max_read_registers = count.clamp(1, DEFAULT_MAX_READ_REGISTERS);
        self
    }

    /// Calculate the number of read requests needed for a given register count.
    pub fn read_request_count(&self, total_registers: u16) -> u16 {
        if total_registers == 0 {
            return 0;
        }
        total_registers.div_ceil(self.max_read_registers.max(1))
    }
}

impl Default for DeviceLimits {
    fn default() -> Self {
        Self {
            max_block_size: DEFAULT_MAX_BLOCK_SIZE,
            max_read_registers: DEFAULT_MAX_READ_REGISTERS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_limits() {
        let limits = DeviceLimits::default();
        assert_eq!(limits.max_block_size, 1);
        assert_eq!(limits.max_read_registers, 125);
    }

    #[test]
    fn test_builder_clamps() {
        let limits = DeviceLimits::new()
            .with_max_block_size(0)
            .with_max_read_registers(500);
        assert_eq!(limits.max_block_size, 1);
        assert_eq!(limits.max_read_registers, 125);
    }

    #[test]
    fn test_read_request_count() {
        let limits = DeviceLimits::new().with_max_read_registers(50);

        assert_eq!(limits.read_request_count(0), 0);
        assert_eq!(limits.read_request_count(50), 1);
        assert_eq!(limits.read_request_count(51), 2);
        assert_eq!(limits.read_request_count(101), 3);
    }
}
