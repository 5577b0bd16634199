// SPDX-License-Identifier: MPL-2.0

//! Running procedures on application processors.
//!
//! The boot processor assigns work by writing it into the descriptor of the
//! target and moving the target from `Ready` to `Busy`, both under the
//! descriptor lock. The target picks the work up when it observes `Busy`, and
//! reports completion by moving to `Finished`. The boot processor consumes the
//! result by moving the target back to `Ready`.
//!
//! Dispatched work cannot be cancelled. A timeout only stops the waiting; a
//! late completion is consumed by the next dispatch to the same processor.

use core::{ffi::c_void, sync::atomic::Ordering};

use smallvec::SmallVec;

use super::{
    registry::{ApProcedure, CpuData, Work},
    MpServices,
};
use crate::{
    cpu::{CpuId, CpuState},
    platform::Platform,
    prelude::*,
    sync::Timeout,
};

/// The outcome of a dispatch on one processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApResult {
    /// The processor that was targeted.
    pub cpu: CpuId,
    /// `Ok` if the procedure ran to completion in time.
    pub result: Result<()>,
}

/// The outcome of [`MpServices::dispatch_all`], one entry per targeted processor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchAllReport {
    results: Vec<ApResult>,
}

impl DispatchAllReport {
    /// The per-processor outcomes, in registry order.
    pub fn results(&self) -> &[ApResult] {
        &self.results
    }

    /// The number of targeted processors.
    pub fn len(&self) -> usize {
        self.results.len()
    }

    /// Returns `true` if no processor was targeted.
    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// Returns `true` if every targeted processor finished its work.
    pub fn all_finished(&self) -> bool {
        self.results.iter().all(|ap| ap.result.is_ok())
    }

    /// The processors that did not finish, for whatever reason.
    pub fn failed_cpus(&self) -> impl Iterator<Item = CpuId> + '_ {
        self.results
            .iter()
            .filter(|ap| ap.result.is_err())
            .map(|ap| ap.cpu)
    }
}

struct Target<'a> {
    cpu: CpuId,
    data: &'a CpuData,
    armed: bool,
    result: Option<Result<()>>,
}

impl<P: Platform> MpServices<P> {
    /// Runs `procedure(argument)` on the processor at `index` and waits for it
    /// to finish.
    ///
    /// The boot processor is not a valid target.
    pub fn dispatch(
        &self,
        index: usize,
        procedure: ApProcedure,
        argument: *mut c_void,
        timeout: Timeout,
    ) -> Result<()> {
        let cpu = self.target(index)?;
        Self::arm(cpu, Work { procedure, argument })?;
        self.spin_wait(timeout)
            .wait_until(|| match Self::consume_finished(cpu) {
                Ok(true) => Some(Ok(())),
                Ok(false) => None,
                Err(err) => Some(Err(err)),
            })
            .map_err(|err| {
                log::warn!("Processor {} did not finish in time", index);
                err
            })?
    }

    /// Assigns `procedure(argument)` to the processor at `index` without
    /// waiting for it.
    ///
    /// Completion is observed with [`MpServices::check_finished`]. A result of
    /// an earlier dispatch that was never collected is dropped first.
    pub fn start_on(
        &self,
        index: usize,
        procedure: ApProcedure,
        argument: *mut c_void,
    ) -> Result<()> {
        let cpu = self.target(index)?;
        Self::arm(cpu, Work { procedure, argument })?;
        log::trace!("Dispatched work to processor {}", index);
        Ok(())
    }

    /// Checks whether the processor at `index` has finished its work.
    ///
    /// A finished processor becomes `Ready` again, so `true` is returned once
    /// per dispatch. Fails with [`Status::NotReady`] if nothing was
    /// dispatched to the processor.
    pub fn check_finished(&self, index: usize) -> Result<bool> {
        let cpu = self.target(index)?;
        Self::consume_finished(cpu)
    }

    /// Runs `procedure(argument)` on every enabled application processor and
    /// waits until all of them finish or `timeout` passes.
    ///
    /// Each processor is handled on its own: one that is still busy with
    /// earlier work, or that never woke up, does not hold back the others.
    /// Processors that are not done in time are reported with
    /// [`Status::Timeout`].
    pub fn dispatch_all(
        &self,
        procedure: ApProcedure,
        argument: *mut c_void,
        timeout: Timeout,
    ) -> Result<DispatchAllReport> {
        self.ensure_bsp()?;
        self.ensure_not_parked()?;

        let mut targets: SmallVec<[Target<'_>; 16]> = self
            .registry
            .iter()
            .filter(|(id, cpu)| !id.is_bsp() && cpu.snapshot().is_enabled())
            .map(|(cpu, data)| Target {
                cpu,
                data,
                armed: false,
                result: None,
            })
            .collect();
        log::debug!("Dispatching work to {} processors", targets.len());

        let work = Work {
            procedure,
            argument,
        };
        // Timing out is reported per processor below.
        let _ = self.spin_wait(timeout).wait_until(|| {
            let mut pending = 0;
            for target in targets.iter_mut().filter(|t| t.result.is_none()) {
                let cpu = target.data;
                if !target.armed {
                    match Self::arm(cpu, work) {
                        Ok(()) => target.armed = true,
                        // Not woken yet, or still busy with earlier work.
                        Err(err) if err.status() == Status::NotReady => {}
                        Err(err) => target.result = Some(Err(err)),
                    }
                }
                if target.armed {
                    match Self::consume_finished(cpu) {
                        Ok(true) => target.result = Some(Ok(())),
                        Ok(false) => {}
                        Err(err) => target.result = Some(Err(err)),
                    }
                }
                if target.result.is_none() {
                    pending += 1;
                }
            }
            (pending == 0).then_some(())
        });

        let results: Vec<ApResult> = targets
            .into_iter()
            .map(|target| ApResult {
                cpu: target.cpu,
                result: target.result.unwrap_or(Err(Error::with_message(
                    Status::Timeout,
                    "The processor did not finish in time",
                ))),
            })
            .collect();
        let report = DispatchAllReport { results };
        if !report.all_finished() {
            log::warn!(
                "{} of {} processors did not finish their work",
                report.failed_cpus().count(),
                report.len()
            );
        }
        Ok(report)
    }

    fn ensure_not_parked(&self) -> Result<()> {
        if self.parking.load(Ordering::Acquire) {
            return_status_with_message!(Status::NotReady, "Application processors are parked");
        }
        Ok(())
    }

    fn target(&self, index: usize) -> Result<&CpuData> {
        self.ensure_bsp()?;
        self.ensure_not_parked()?;
        let Some(cpu) = self.registry.get(index) else {
            return_status_with_message!(Status::NotFound, "No processor at this index");
        };
        if CpuId::from_index(index).is_bsp() {
            return_status_with_message!(Status::InvalidParameter, "Cannot dispatch to the BSP");
        }
        Ok(cpu)
    }

    fn arm(cpu: &CpuData, work: Work) -> Result<()> {
        let mut inner = cpu.lock();
        let mut state = cpu.state.load();
        if state == CpuState::Finished {
            cpu.state.transition(CpuState::Finished, CpuState::Ready)?;
            state = CpuState::Ready;
        }
        match state {
            CpuState::Ready => {}
            CpuState::Idle => {
                return_status_with_message!(Status::NotReady, "The processor has not started")
            }
            CpuState::Blocked => {
                return_status_with_message!(Status::NotReady, "The processor is disabled")
            }
            CpuState::Busy | CpuState::Finished => {
                return_status_with_message!(Status::NotReady, "The processor is busy")
            }
        }

        inner.work = Some(work);
        // The target reads the work only after it observes `Busy`.
        cpu.state.transition(CpuState::Ready, CpuState::Busy)?;
        Ok(())
    }

    fn consume_finished(cpu: &CpuData) -> Result<bool> {
        match cpu.state.load() {
            CpuState::Busy => Ok(false),
            CpuState::Finished => {
                let _guard = cpu.lock();
                cpu.state.transition(CpuState::Finished, CpuState::Ready)?;
                Ok(true)
            }
            _ => return_status_with_message!(Status::NotReady, "No work is outstanding"),
        }
    }
}

#[cfg(test)]
mod test {
    use std::{
        sync::atomic::{AtomicBool, AtomicUsize},
        thread,
        time::Duration,
    };

    use super::*;
    use crate::{
        config::MpConfig,
        sim::{self, SimPlatform},
    };

    fn noop(_: *mut c_void) {}

    fn bump(argument: *mut c_void) {
        // SAFETY: The tests pass a leaked `AtomicUsize`.
        let counter = unsafe { &*(argument as *const AtomicUsize) };
        counter.fetch_add(1, Ordering::SeqCst);
    }

    fn hold(argument: *mut c_void) {
        // SAFETY: The tests pass a leaked `AtomicBool`.
        let released = unsafe { &*(argument as *const AtomicBool) };
        while !released.load(Ordering::SeqCst) {
            thread::yield_now();
        }
    }

    fn leak<T>(value: T) -> *mut c_void {
        Box::leak(Box::new(value)) as *mut T as *mut c_void
    }

    fn wait_for_state(mp: &MpServices<SimPlatform>, index: usize, state: CpuState) {
        while mp.describe(index).unwrap().state != state {
            thread::yield_now();
        }
    }

    #[test]
    fn dispatch_runs_and_can_repeat() {
        let mp = sim::boot(SimPlatform::new(3), sim::config());
        let counter = leak(AtomicUsize::new(0));

        mp.dispatch(2, bump, counter, Timeout::INFINITE).unwrap();
        assert_eq!(mp.describe(2).unwrap().state, CpuState::Ready);
        mp.dispatch(2, bump, counter, Timeout::after(Duration::from_secs(10)))
            .unwrap();

        // SAFETY: `counter` was leaked above.
        let counter = unsafe { &*(counter as *const AtomicUsize) };
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        sim::shutdown(mp);
    }

    #[test]
    fn invalid_targets() {
        let mp = sim::boot(SimPlatform::new(2), sim::config());
        let err = |res: Result<()>| res.unwrap_err().status();

        assert_eq!(
            err(mp.dispatch(0, noop, core::ptr::null_mut(), Timeout::INFINITE)),
            Status::InvalidParameter
        );
        assert_eq!(
            err(mp.dispatch(2, noop, core::ptr::null_mut(), Timeout::INFINITE)),
            Status::NotFound
        );
        let from_ap = sim::as_processor(1, || {
            mp.dispatch(1, noop, core::ptr::null_mut(), Timeout::INFINITE)
        });
        assert_eq!(err(from_ap), Status::DeviceError);
        sim::shutdown(mp);
    }

    #[test]
    fn disabled_processor_is_not_ready() {
        let mp = sim::boot(SimPlatform::new(3), sim::config());
        mp.set_enabled(1, false, None).unwrap();
        assert_eq!(mp.describe(1).unwrap().state, CpuState::Blocked);

        let res = mp.dispatch(1, noop, core::ptr::null_mut(), Timeout::INFINITE);
        assert_eq!(res.unwrap_err().status(), Status::NotReady);

        mp.set_enabled(1, true, None).unwrap();
        mp.dispatch(1, noop, core::ptr::null_mut(), Timeout::INFINITE)
            .unwrap();
        sim::shutdown(mp);
    }

    #[test]
    fn timed_out_work_is_consumed_later() {
        let mp = sim::boot(SimPlatform::new(2), sim::config());
        let released = leak(AtomicBool::new(false));

        let res = mp.dispatch(1, hold, released, Timeout::after(Duration::from_millis(20)));
        assert_eq!(res.unwrap_err().status(), Status::Timeout);
        assert_eq!(mp.describe(1).unwrap().state, CpuState::Busy);
        assert_eq!(
            mp.start_on(1, noop, core::ptr::null_mut())
                .unwrap_err()
                .status(),
            Status::NotReady
        );

        // SAFETY: `released` was leaked above.
        unsafe { &*(released as *const AtomicBool) }.store(true, Ordering::SeqCst);
        wait_for_state(mp, 1, CpuState::Finished);

        mp.dispatch(1, noop, core::ptr::null_mut(), Timeout::INFINITE)
            .unwrap();
        sim::shutdown(mp);
    }

    #[test]
    fn start_then_poll() {
        let mp = sim::boot(SimPlatform::new(2), sim::config());
        assert_eq!(
            mp.check_finished(1).unwrap_err().status(),
            Status::NotReady
        );

        mp.start_on(1, noop, core::ptr::null_mut()).unwrap();
        while !mp.check_finished(1).unwrap() {
            thread::yield_now();
        }
        assert_eq!(mp.describe(1).unwrap().state, CpuState::Ready);
        sim::shutdown(mp);
    }

    #[test]
    fn busy_processor_cannot_be_disabled() {
        let mp = sim::boot(SimPlatform::new(2), sim::config());
        let released = leak(AtomicBool::new(false));

        mp.start_on(1, hold, released).unwrap();
        assert_eq!(
            mp.set_enabled(1, false, None).unwrap_err().status(),
            Status::NotReady
        );
        assert!(mp.describe(1).unwrap().is_enabled());

        // SAFETY: `released` was leaked above.
        unsafe { &*(released as *const AtomicBool) }.store(true, Ordering::SeqCst);
        while !mp.check_finished(1).unwrap() {
            thread::yield_now();
        }
        mp.set_enabled(1, false, None).unwrap();
        sim::shutdown(mp);
    }

    #[test]
    fn disabling_drops_an_uncollected_result() {
        let mp = sim::boot(SimPlatform::new(2), sim::config());
        mp.start_on(1, noop, core::ptr::null_mut()).unwrap();
        wait_for_state(mp, 1, CpuState::Finished);

        mp.set_enabled(1, false, None).unwrap();
        let info = mp.describe(1).unwrap();
        assert_eq!(info.state, CpuState::Blocked);
        assert!(!info.is_enabled());
        assert_eq!(
            mp.check_finished(1).unwrap_err().status(),
            Status::NotReady
        );

        mp.set_enabled(1, true, None).unwrap();
        assert_eq!(mp.describe(1).unwrap().state, CpuState::Ready);
        mp.dispatch(1, noop, core::ptr::null_mut(), Timeout::INFINITE)
            .unwrap();
        sim::shutdown(mp);
    }

    #[test]
    fn dispatch_all_reports_the_processor_that_never_woke() {
        let config = MpConfig {
            ap_init_timeout: Timeout::after(Duration::from_millis(200)),
            ..sim::config()
        };
        let mp = sim::boot(SimPlatform::new(5).never_wake(3), config);
        let counter = leak(AtomicUsize::new(0));

        let report = mp
            .dispatch_all(bump, counter, Timeout::after(Duration::from_millis(500)))
            .unwrap();
        assert_eq!(report.len(), 4);
        assert!(!report.all_finished());
        let timeouts: Vec<CpuId> = report
            .results()
            .iter()
            .filter(|ap| ap.result.map_err(|e| e.status()) == Err(Status::Timeout))
            .map(|ap| ap.cpu)
            .collect();
        assert_eq!(timeouts, [CpuId::from_index(3)]);
        assert_eq!(report.failed_cpus().collect::<Vec<_>>(), timeouts);

        // SAFETY: `counter` was leaked above.
        let counter = unsafe { &*(counter as *const AtomicUsize) };
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert_eq!(mp.describe(3).unwrap().state, CpuState::Idle);
        sim::shutdown(mp);
    }

    #[test]
    fn dispatch_all_skips_disabled_processors() {
        let mp = sim::boot(SimPlatform::new(4), sim::config());
        mp.set_enabled(2, false, None).unwrap();

        let report = mp
            .dispatch_all(noop, core::ptr::null_mut(), Timeout::INFINITE)
            .unwrap();
        assert!(report.all_finished());
        let cpus: Vec<usize> = report.results().iter().map(|ap| ap.cpu.as_usize()).collect();
        assert_eq!(cpus, [1, 3]);
        sim::shutdown(mp);
    }

    #[test]
    fn parked_processors_take_no_work() {
        let mp = sim::boot(SimPlatform::new(2), sim::config());
        sim::shutdown(mp);
        assert_eq!(
            mp.dispatch(1, noop, core::ptr::null_mut(), Timeout::INFINITE)
                .unwrap_err()
                .status(),
            Status::NotReady
        );
        assert_eq!(mp.describe(1).unwrap().state, CpuState::Ready);
    }
}
