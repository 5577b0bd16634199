// SPDX-License-Identifier: MPL-2.0

//! The processor descriptor registry.

use alloc::vec;
use core::{
    ffi::c_void,
    sync::atomic::{AtomicUsize, Ordering},
};

use crate::{
    config::MpConfig,
    cpu::{AtomicCpuState, CpuId, CpuLocation, CpuState, ProcessorInfo, StatusFlag},
    prelude::*,
    sync::{SpinLock, SpinLockGuard},
};

/// A procedure that runs on an application processor.
///
/// The argument is opaque to the MP services and is passed through unchanged.
pub type ApProcedure = fn(argument: *mut c_void);

/// A work item assigned to a processor.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Work {
    pub(crate) procedure: ApProcedure,
    pub(crate) argument: *mut c_void,
}

// SAFETY: The argument is only dereferenced by the procedure, whose author
// agrees to hand it to exactly one processor at a time.
unsafe impl Send for Work {}

/// The fields of a descriptor guarded by its lock.
#[derive(Debug)]
pub(crate) struct CpuDataInner {
    pub(crate) status: StatusFlag,
    pub(crate) location: CpuLocation,
    pub(crate) work: Option<Work>,
}

/// The descriptor of one logical processor.
pub(crate) struct CpuData {
    processor_id: u64,
    /// Polled without the lock; every change happens with the lock held.
    pub(crate) state: AtomicCpuState,
    inner: SpinLock<CpuDataInner>,
    /// The private stack the processor moves to after leaving the hand-off
    /// channel. The boot processor already has one.
    stack: Option<Box<[u8]>>,
}

impl CpuData {
    fn new(processor_id: u64, stack: Option<Box<[u8]>>) -> Self {
        Self {
            processor_id,
            state: AtomicCpuState::new(CpuState::Idle),
            inner: SpinLock::new(CpuDataInner {
                status: StatusFlag::PROCESSOR_ENABLED | StatusFlag::PROCESSOR_HEALTH_STATUS,
                location: CpuLocation::default(),
                work: None,
            }),
            stack,
        }
    }

    /// The hardware identifier of the processor.
    pub(crate) fn processor_id(&self) -> u64 {
        self.processor_id
    }

    /// Acquires the descriptor lock.
    pub(crate) fn lock(&self) -> SpinLockGuard<'_, CpuDataInner> {
        self.inner.lock()
    }

    /// The address just past the end of the private stack.
    pub(crate) fn stack_top(&self) -> Option<usize> {
        self.stack
            .as_ref()
            .map(|stack| stack.as_ptr() as usize + stack.len())
    }

    pub(crate) fn snapshot(&self) -> ProcessorInfo {
        let inner = self.lock();
        ProcessorInfo {
            processor_id: self.processor_id,
            status: inner.status,
            location: inner.location,
            state: self.state.load(),
        }
    }
}

/// All processor descriptors, indexed by [`CpuId`].
pub(crate) struct CpuRegistry {
    cpus: Box<[CpuData]>,
    num_enabled: AtomicUsize,
}

impl CpuRegistry {
    /// Creates the registry from the processors the firmware tables describe.
    ///
    /// The boot processor always takes index 0, even if the tables miss it.
    /// The remaining processors keep their table order. Duplicates are
    /// dropped and the total is capped at `config.max_cpus`.
    pub(crate) fn new(processor_ids: &[u64], bsp_processor_id: u64, config: &MpConfig) -> Self {
        let mut ids = Vec::with_capacity(processor_ids.len() + 1);
        ids.push(bsp_processor_id);
        for &id in processor_ids {
            if ids.contains(&id) {
                if id != bsp_processor_id {
                    log::warn!("Firmware bug: processor {:#x} is listed twice", id);
                }
                continue;
            }
            ids.push(id);
        }
        if ids.len() > config.max_cpus {
            log::warn!(
                "Found {} processors, only {} of them are used",
                ids.len(),
                config.max_cpus
            );
            ids.truncate(config.max_cpus.max(1));
        }

        let cpus: Box<[CpuData]> = ids
            .iter()
            .enumerate()
            .map(|(index, &id)| {
                let stack = (index != 0)
                    .then(|| vec![0u8; config.ap_stack_size].into_boxed_slice());
                CpuData::new(id, stack)
            })
            .collect();
        let num_enabled = AtomicUsize::new(cpus.len());

        Self { cpus, num_enabled }
    }

    pub(crate) fn len(&self) -> usize {
        self.cpus.len()
    }

    pub(crate) fn get(&self, index: usize) -> Option<&CpuData> {
        self.cpus.get(index)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (CpuId, &CpuData)> {
        self.cpus
            .iter()
            .enumerate()
            .map(|(index, cpu)| (CpuId::from_index(index), cpu))
    }

    /// Finds the index of the processor with the given hardware identifier.
    pub(crate) fn find(&self, processor_id: u64) -> Option<CpuId> {
        self.cpus
            .iter()
            .position(|cpu| cpu.processor_id == processor_id)
            .map(CpuId::from_index)
    }

    pub(crate) fn num_enabled(&self) -> usize {
        self.num_enabled.load(Ordering::Acquire)
    }

    /// Records that a processor was enabled or disabled.
    ///
    /// Must be called with the descriptor lock of that processor held.
    pub(crate) fn account_enabled(&self, enabled: bool) {
        if enabled {
            self.num_enabled.fetch_add(1, Ordering::AcqRel);
        } else {
            self.num_enabled.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Fills in the descriptor of the calling processor.
    ///
    /// Every processor calls this once for its own slot, so concurrent calls
    /// never touch the same descriptor.
    pub(crate) fn register_self(&self, cpu: CpuId, location: CpuLocation, is_bsp: bool) {
        let Some(data) = self.get(cpu.as_usize()) else {
            return;
        };
        let mut inner = data.lock();
        inner.location = location;
        inner.status.set(StatusFlag::PROCESSOR_AS_BSP, is_bsp);
    }
}
