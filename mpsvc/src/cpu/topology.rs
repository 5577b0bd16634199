// SPDX-License-Identifier: MPL-2.0

//! Processor topology decoding.
//!
//! A hardware processor identifier is a packed bit field: the lowest bits
//! number the logical thread within a core, the next bits number the core
//! within a package, and the remaining bits number the package.

use super::CpuLocation;

/// The widths of the thread and core fields of a hardware identifier.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TopologyShifts {
    /// Bits used to number threads within a core.
    pub thread_bits: u32,
    /// Bits used to number cores within a package.
    pub core_bits: u32,
}

impl TopologyShifts {
    /// One thread per core and one core per package.
    pub const FLAT: Self = Self {
        thread_bits: 0,
        core_bits: 0,
    };
}

/// Splits a hardware identifier into its package, core, and thread numbers.
pub fn decode(processor_id: u64, shifts: TopologyShifts) -> CpuLocation {
    let thread_mask = low_mask(shifts.thread_bits);
    let core_mask = low_mask(shifts.core_bits);
    let package_shift = shifts.thread_bits + shifts.core_bits;

    CpuLocation {
        package: processor_id.checked_shr(package_shift).unwrap_or(0) as u32,
        core: ((processor_id >> shifts.thread_bits.min(63)) & core_mask) as u32,
        thread: (processor_id & thread_mask) as u32,
    }
}

fn low_mask(bits: u32) -> u64 {
    if bits >= u64::BITS {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    }
}

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        mod x86;

        pub use self::x86::current_shifts;
    } else {
        /// Returns the topology field widths of the calling processor.
        ///
        /// Without a way to query the hardware, every processor is assumed
        /// to be its own package.
        pub fn current_shifts() -> TopologyShifts {
            TopologyShifts::FLAT
        }
    }
}
