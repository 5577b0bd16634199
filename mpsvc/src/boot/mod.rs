// SPDX-License-Identifier: MPL-2.0

//! Multiprocessor bring-up.
//!
//! The boot processor (BSP) registers itself, sends the wake signal, and
//! waits for the application processors (APs) to check in. Each AP runs
//! [`ap_entry`]:
//!
//!  - enter the hand-off channel and move onto the shared stack it guards;
//!  - find its own descriptor and private stack;
//!  - move onto the private stack, then leave the hand-off channel;
//!  - report its topology into its own descriptor and become `Ready`;
//!  - poll its descriptor for work until it is parked.
//!
//! An AP that never wakes up stays `Idle` for the rest of the boot session.

mod handoff;

use core::sync::atomic::Ordering;

pub use self::handoff::{HandoffChannel, HandoffStats, SharedStack};
use crate::{
    cpu::{CpuId, CpuState},
    mp::{registry::CpuData, MpServices},
    platform::{ApEntry, Platform},
    prelude::*,
};

/// Brings up all application processors.
///
/// Returns after every AP has checked in, or after the bring-up timeout. APs
/// that have not checked in by then are left behind, which is not an error.
pub(crate) fn bringup_all_aps<P: Platform>(mp: &'static MpServices<P>) -> Result<()> {
    let platform = mp.platform();
    let registry = mp.registry();

    registry.register_self(CpuId::bsp(), platform.report_self(), true);
    if let Some(bsp) = registry.get(CpuId::bsp().as_usize()) {
        let _guard = bsp.lock();
        bsp.state.transition(CpuState::Idle, CpuState::Ready)?;
    }

    let num_aps = registry.len() - 1;
    log::info!("Found {} processors.", registry.len());
    if num_aps == 0 {
        log::warn!("No application processor found. Operating with a single processor.");
        return Ok(());
    }

    log::info!("Booting all application processors...");
    platform.wake_all_aps(ApEntry::new(mp))?;

    let started = mp
        .spin_wait(mp.config().ap_init_timeout)
        .wait_until(|| {
            let started = mp.num_started.load(Ordering::Acquire);
            (started == num_aps).then_some(started)
        })
        .unwrap_or_else(|_| mp.num_started.load(Ordering::Acquire));

    if started < num_aps {
        log::warn!(
            "Only {} of {} application processors started in time.",
            started,
            num_aps
        );
    } else {
        log::info!("All application processors started. The BSP continues to run.");
    }
    Ok(())
}

/// The entry of an application processor.
///
/// Returns after the processor is parked, or if it could not be brought up.
pub(crate) fn ap_entry<P: Platform>(mp: &'static MpServices<P>) {
    let platform = mp.platform();
    let processor_id = platform.current_processor_id();

    let shared = match mp.handoff().acquire(
        processor_id,
        platform,
        mp.config().handoff_timeout,
        mp.config().spin_backoff_max,
    ) {
        Ok(shared) => shared,
        Err(err) => {
            log::error!(
                "Processor {:#x} could not enter the hand-off channel: {}",
                processor_id,
                err
            );
            platform.park_ap();
            return;
        }
    };

    let shared_top = shared.top();
    let mut shared = Some(shared);
    platform.run_on_stack(shared_top, &mut || {
        if let Some(shared) = shared.take() {
            enter_private_stack(mp, processor_id, shared);
        }
    });

    platform.park_ap();
}

// Runs on the shared stack. Keep it short: every processor still waiting for
// the channel is held up until `shared` is released.
fn enter_private_stack<P: Platform>(
    mp: &'static MpServices<P>,
    processor_id: u64,
    shared: SharedStack<'_>,
) {
    let Some((cpu_id, cpu)) = mp
        .registry()
        .find(processor_id)
        .and_then(|cpu_id| Some((cpu_id, mp.registry().get(cpu_id.as_usize())?)))
    else {
        log::warn!("Processor {:#x} is not in the registry", processor_id);
        shared.release();
        return;
    };
    let Some(stack_top) = cpu.stack_top() else {
        log::warn!("Processor {:#x} has no private stack", processor_id);
        shared.release();
        return;
    };

    let mut shared = Some(shared);
    mp.platform().run_on_stack(stack_top, &mut || {
        if let Some(shared) = shared.take() {
            shared.release();
        }
        ap_main(mp, cpu_id, cpu);
    });
}

fn ap_main<P: Platform>(mp: &'static MpServices<P>, cpu_id: CpuId, cpu: &CpuData) {
    let platform = mp.platform();

    mp.registry().register_self(cpu_id, platform.report_self(), false);
    {
        let _guard = cpu.lock();
        if let Err(err) = cpu.state.transition(CpuState::Idle, CpuState::Ready) {
            log::error!("Processor {} cannot become ready: {:?}", cpu_id.as_usize(), err);
            return;
        }
    }
    mp.num_started.fetch_add(1, Ordering::AcqRel);
    log::debug!(
        "Processor {} ({:#x}) started. Spinning for work.",
        cpu_id.as_usize(),
        cpu.processor_id()
    );

    while !mp.parking.load(Ordering::Acquire) {
        if cpu.state.load() == CpuState::Busy {
            run_assigned_work(cpu_id, cpu);
        } else {
            platform.relax();
        }
    }

    mp.num_parked.fetch_add(1, Ordering::AcqRel);
    log::debug!("Processor {} parked.", cpu_id.as_usize());
}

fn run_assigned_work(cpu_id: CpuId, cpu: &CpuData) {
    // The Acquire load that observed `Busy` makes the work visible.
    let work = cpu.lock().work;
    if let Some(work) = work {
        log::trace!("Processor {} runs {:p}", cpu_id.as_usize(), work.procedure);
        (work.procedure)(work.argument);
    }

    let mut inner = cpu.lock();
    inner.work = None;
    if let Err(err) = cpu.state.transition(CpuState::Busy, CpuState::Finished) {
        log::warn!(
            "Processor {} finished work but could not report it: {:?}",
            cpu_id.as_usize(),
            err
        );
    }
}
