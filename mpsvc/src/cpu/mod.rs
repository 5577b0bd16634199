// SPDX-License-Identifier: MPL-2.0

//! CPU-related definitions.

mod state;
pub mod topology;

use bitflags::bitflags;

pub use self::state::{AtomicCpuState, CpuState, TransitionError};

/// The index of a processor in the processor registry.
///
/// Indices are stable for the whole boot session. Index 0 is always the boot
/// processor (BSP).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CpuId(u32);

impl CpuId {
    /// Returns the CPU ID of the bootstrap processor (BSP).
    pub const fn bsp() -> Self {
        CpuId(0)
    }

    /// Converts the CPU ID to an `usize`.
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// Returns whether this is the bootstrap processor.
    pub const fn is_bsp(self) -> bool {
        self.0 == 0
    }

    pub(crate) const fn from_index(index: usize) -> Self {
        CpuId(index as u32)
    }
}

impl From<CpuId> for usize {
    fn from(id: CpuId) -> usize {
        id.as_usize()
    }
}

bitflags! {
    /// Flags indicating if the processor is the BSP, if it is enabled, and
    /// if it is healthy.
    pub struct StatusFlag: u32 {
        /// The processor is playing the role of BSP.
        const PROCESSOR_AS_BSP = 1;
        /// The processor is enabled.
        const PROCESSOR_ENABLED = 1 << 1;
        /// The processor is healthy.
        const PROCESSOR_HEALTH_STATUS = 1 << 2;
    }
}

/// The physical location of a processor.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CpuLocation {
    /// Zero-based physical package number.
    pub package: u32,
    /// Zero-based physical core number within the package.
    pub core: u32,
    /// Zero-based logical thread number within the core.
    pub thread: u32,
}

/// A snapshot of one processor descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessorInfo {
    /// The identifier assigned by hardware, e.g., the local APIC ID.
    pub processor_id: u64,
    /// The BSP/enabled/healthy flags.
    pub status: StatusFlag,
    /// Where the processor sits in the package/core/thread hierarchy.
    pub location: CpuLocation,
    /// The lifecycle state at the time of the snapshot.
    pub state: CpuState,
}

impl ProcessorInfo {
    /// Returns `true` if the processor is playing the role of BSP.
    pub const fn is_bsp(&self) -> bool {
        self.status.contains(StatusFlag::PROCESSOR_AS_BSP)
    }

    /// Returns `true` if the processor is enabled.
    pub const fn is_enabled(&self) -> bool {
        self.status.contains(StatusFlag::PROCESSOR_ENABLED)
    }

    /// Returns `true` if the processor is healthy.
    pub const fn is_healthy(&self) -> bool {
        self.status.contains(StatusFlag::PROCESSOR_HEALTH_STATUS)
    }
}

/// The number of processors in the registry.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ProcessorCount {
    /// All processors, the BSP and disabled APs included.
    pub total: usize,
    /// Processors currently enabled, the BSP included.
    pub enabled: usize,
}
