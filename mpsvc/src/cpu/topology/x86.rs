// SPDX-License-Identifier: MPL-2.0

use x86::cpuid::cpuid;

use super::TopologyShifts;

/// The CPUID leaf that enumerates the extended topology.
const EXTENDED_TOPOLOGY_LEAF: u32 = 0xb;

const LEVEL_TYPE_SMT: u32 = 1;
const LEVEL_TYPE_CORE: u32 = 2;

/// Returns the topology field widths of the calling processor.
///
/// The widths are read from the CPUID extended topology leaf. Processors
/// that do not implement the leaf are treated as flat.
pub fn current_shifts() -> TopologyShifts {
    let max_leaf = cpuid!(0).eax;
    if max_leaf < EXTENDED_TOPOLOGY_LEAF {
        return TopologyShifts::FLAT;
    }

    let mut smt_shift = 0;
    let mut core_shift = None;
    for sub_leaf in 0..8u32 {
        let res = cpuid!(EXTENDED_TOPOLOGY_LEAF, sub_leaf);
        // EBX[15:0] is zero for invalid levels.
        if res.ebx & 0xffff == 0 {
            break;
        }
        let level_type = (res.ecx >> 8) & 0xff;
        let shift = res.eax & 0x1f;
        match level_type {
            LEVEL_TYPE_SMT => smt_shift = shift,
            LEVEL_TYPE_CORE => core_shift = Some(shift),
            _ => {}
        }
    }

    let Some(core_shift) = core_shift else {
        return TopologyShifts {
            thread_bits: smt_shift,
            core_bits: 0,
        };
    };
    TopologyShifts {
        thread_bits: smt_shift,
        core_bits: core_shift.saturating_sub(smt_shift),
    }
}
