// SPDX-License-Identifier: MPL-2.0

//! The MP coordination façade.
//!
//! [`MpServices`] owns the processor registry and the hand-off channel for
//! one boot session. Every operation except [`MpServices::who_am_i`] must be
//! called from the boot processor.

mod dispatch;
pub(crate) mod registry;

use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

pub use self::{
    dispatch::{ApResult, DispatchAllReport},
    registry::ApProcedure,
};
use self::registry::CpuRegistry;
use crate::{
    boot::{self, HandoffChannel, HandoffStats},
    config::MpConfig,
    cpu::{CpuId, CpuState, ProcessorCount, ProcessorInfo, StatusFlag},
    platform::Platform,
    prelude::*,
    sync::{SpinWait, Timeout},
};

/// The multiprocessor services of one boot session.
///
/// The value must outlive every application processor, which is why
/// [`MpServices::init`] takes `&'static self`.
pub struct MpServices<P: Platform> {
    platform: P,
    config: MpConfig,
    registry: CpuRegistry,
    handoff: HandoffChannel,
    bsp_processor_id: u64,
    pub(crate) num_started: AtomicUsize,
    pub(crate) num_parked: AtomicUsize,
    pub(crate) parking: AtomicBool,
    initialized: AtomicBool,
}

impl<P: Platform> MpServices<P> {
    /// Creates the MP services, discovering processors through `platform`.
    ///
    /// The calling processor becomes the boot processor. No application
    /// processor is woken until [`MpServices::init`] is called.
    ///
    /// Fails with [`Status::InvalidParameter`] if `config` allows no
    /// processor or gives application processors an empty stack.
    pub fn new(platform: P, config: MpConfig) -> Result<Self> {
        if config.max_cpus == 0 || config.ap_stack_size == 0 {
            return_status_with_message!(
                Status::InvalidParameter,
                "At least one processor and a non-empty AP stack are required"
            );
        }
        let bsp_processor_id = platform.current_processor_id();
        let processor_ids = platform.processor_ids();
        if processor_ids.is_empty() {
            log::warn!("Firmware tables list no processors; assuming the BSP alone");
        }
        let registry = CpuRegistry::new(&processor_ids, bsp_processor_id, &config);
        let handoff = HandoffChannel::new(config.handoff_stack_size);

        Ok(Self {
            platform,
            config,
            registry,
            handoff,
            bsp_processor_id,
            num_started: AtomicUsize::new(0),
            num_parked: AtomicUsize::new(0),
            parking: AtomicBool::new(false),
            initialized: AtomicBool::new(false),
        })
    }

    /// Brings up all application processors.
    ///
    /// Can be called only once; later calls fail with [`Status::Unsupported`].
    pub fn init(&'static self) -> Result<()> {
        self.ensure_bsp()?;
        if self.initialized.swap(true, Ordering::AcqRel) {
            return_status_with_message!(Status::Unsupported, "MP services already initialized");
        }
        boot::bringup_all_aps(self)
    }

    /// The platform the services run on.
    pub fn platform(&self) -> &P {
        &self.platform
    }

    /// The configuration the services were created with.
    pub fn config(&self) -> &MpConfig {
        &self.config
    }

    pub(crate) fn registry(&self) -> &CpuRegistry {
        &self.registry
    }

    pub(crate) fn handoff(&self) -> &HandoffChannel {
        &self.handoff
    }

    pub(crate) fn spin_wait(&self, timeout: Timeout) -> SpinWait<'_, P> {
        SpinWait::new(&self.platform, timeout, self.config.spin_backoff_max)
    }

    /// Returns whether the caller is the boot processor.
    pub fn is_bsp(&self) -> bool {
        self.platform.current_processor_id() == self.bsp_processor_id
    }

    fn ensure_bsp(&self) -> Result<()> {
        if !self.is_bsp() {
            return_status_with_message!(
                Status::DeviceError,
                "MP services may only be called on the BSP"
            );
        }
        Ok(())
    }

    /// Returns the number of processors and how many of them are enabled.
    pub fn enumerate(&self) -> Result<ProcessorCount> {
        self.ensure_bsp()?;
        Ok(ProcessorCount {
            total: self.registry.len(),
            enabled: self.registry.num_enabled(),
        })
    }

    /// Returns a snapshot of the descriptor at `index`.
    pub fn describe(&self, index: usize) -> Result<ProcessorInfo> {
        self.ensure_bsp()?;
        let Some(cpu) = self.registry.get(index) else {
            return_status_with_message!(Status::NotFound, "No processor at this index");
        };
        Ok(cpu.snapshot())
    }

    /// Enables or disables an application processor.
    ///
    /// A disabled processor moves to `Blocked` and receives no more work; an
    /// enabled one moves back to `Ready`. If `health` is given, its
    /// [`StatusFlag::PROCESSOR_HEALTH_STATUS`] bit replaces the health of the
    /// processor. Either everything is applied or nothing is.
    ///
    /// Fails with:
    ///  - [`Status::NotFound`] for an index out of range;
    ///  - [`Status::InvalidParameter`] for the BSP;
    ///  - [`Status::Unsupported`] for a processor that never came up, or when
    ///    enabling a processor that is (or would be) unhealthy;
    ///  - [`Status::NotReady`] while the processor is running work.
    pub fn set_enabled(
        &self,
        index: usize,
        enable: bool,
        health: Option<StatusFlag>,
    ) -> Result<()> {
        self.ensure_bsp()?;
        let Some(cpu) = self.registry.get(index) else {
            return_status_with_message!(Status::NotFound, "No processor at this index");
        };
        if CpuId::from_index(index).is_bsp() {
            return_status_with_message!(Status::InvalidParameter, "The BSP cannot be disabled");
        }

        let mut inner = cpu.lock();
        let healthy = health.map_or(
            inner.status.contains(StatusFlag::PROCESSOR_HEALTH_STATUS),
            |flag| flag.contains(StatusFlag::PROCESSOR_HEALTH_STATUS),
        );

        let current = cpu.state.load();
        let next = match (current, enable) {
            (CpuState::Idle, _) => {
                return_status_with_message!(Status::Unsupported, "The processor never started")
            }
            (CpuState::Busy, _) => {
                return_status_with_message!(Status::NotReady, "The processor is running work")
            }
            (_, true) if !healthy => {
                return_status_with_message!(
                    Status::Unsupported,
                    "An unhealthy processor cannot be enabled"
                )
            }
            (CpuState::Blocked, true) => Some(CpuState::Ready),
            (CpuState::Ready | CpuState::Finished, false) => Some(CpuState::Blocked),
            _ => None,
        };

        if let Some(next) = next {
            cpu.state.transition(current, next)?;
            if next == CpuState::Blocked {
                // A finished result nobody collected is dropped with the work.
                inner.work = None;
            }
        }
        let was_enabled = inner.status.contains(StatusFlag::PROCESSOR_ENABLED);
        if was_enabled != enable {
            self.registry.account_enabled(enable);
        }
        inner.status.set(StatusFlag::PROCESSOR_ENABLED, enable);
        inner.status.set(StatusFlag::PROCESSOR_HEALTH_STATUS, healthy);

        log::debug!(
            "Processor {} is now {}",
            index,
            if enable { "enabled" } else { "disabled" }
        );
        Ok(())
    }

    /// Returns the registry index of the calling processor.
    ///
    /// Unlike the other operations this may be called on any processor. A
    /// processor left out of the registry, such as one beyond `max_cpus`,
    /// gets [`Status::NotFound`].
    pub fn who_am_i(&self) -> Result<CpuId> {
        let processor_id = self.platform.current_processor_id();
        match self.registry.find(processor_id) {
            Some(cpu) => Ok(cpu),
            None => return_status_with_message!(
                Status::NotFound,
                "The calling processor is not in the registry"
            ),
        }
    }

    /// Returns the usage counters of the hand-off channel.
    pub fn handoff_stats(&self) -> HandoffStats {
        self.handoff.stats()
    }

    /// Asks every started application processor to leave its work loop and
    /// waits until they all did.
    ///
    /// Work already running is completed first. No operation that needs an
    /// application processor succeeds afterwards.
    pub fn park_all_aps(&self, timeout: Timeout) -> Result<()> {
        self.ensure_bsp()?;
        self.parking.store(true, Ordering::Release);
        let started = self.num_started.load(Ordering::Acquire);
        self.spin_wait(timeout).wait_until(|| {
            (self.num_parked.load(Ordering::Acquire) >= started).then_some(())
        })?;
        log::info!("{} application processors parked.", started);
        Ok(())
    }
}

impl<P: Platform> core::fmt::Debug for MpServices<P> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MpServices")
            .field("num_cpus", &self.registry.len())
            .field("num_started", &self.num_started.load(Ordering::Relaxed))
            .field("parking", &self.parking.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
