// SPDX-License-Identifier: MPL-2.0

//! The collaborators the MP services rely on.
//!
//! Everything that depends on the physical machine lives behind [`Platform`]:
//! discovering processors from firmware tables, identifying the calling
//! processor, delivering the wake signal, switching stacks, and the clock.

use core::{fmt, time::Duration};

use crate::{
    cpu::{topology, CpuLocation},
    mp::MpServices,
    prelude::*,
};

/// A monotonic clock.
pub trait Clock {
    /// Returns the time elapsed since an arbitrary fixed point.
    fn now(&self) -> Duration;

    /// Hints the processor that it is spinning.
    fn relax(&self) {
        core::hint::spin_loop();
    }
}

/// A character console.
pub trait Console {
    /// Writes a string to the console.
    fn write_str(&self, s: &str);
}

/// The platform services consumed by [`MpServices`].
///
/// A platform value lives as long as the boot session, so it must be `'static`.
/// Its methods may be called from any processor at any time.
pub trait Platform: Clock + Console + Sync + Sized + 'static {
    /// Returns the hardware identifiers of all processors described by the
    /// firmware tables, the boot processor included.
    fn processor_ids(&self) -> Vec<u64>;

    /// Returns the hardware identifier of the calling processor.
    fn current_processor_id(&self) -> u64;

    /// Reports the physical location of the calling processor.
    fn report_self(&self) -> CpuLocation {
        topology::decode(self.current_processor_id(), topology::current_shifts())
    }

    /// Sends the wake signal to all application processors.
    ///
    /// Each woken processor must end up calling [`ApEntry::run`] on itself.
    /// The wake trampoline only needs a scratch stack big enough to enter the
    /// hand-off channel; [`ApEntry::run`] moves onto the shared stack at
    /// [`ApEntry::handoff_stack_top`] as soon as the channel is held.
    fn wake_all_aps(&self, entry: ApEntry<Self>) -> Result<()>;

    /// Moves the calling processor onto the stack whose top is `stack_top`
    /// and runs `f` there.
    ///
    /// Bring-up calls this twice on every application processor: first with
    /// the shared stack, once the hand-off channel is held, then with the
    /// private stack of the processor. The previous stack is no longer used
    /// once `f` starts.
    fn run_on_stack(&self, stack_top: usize, f: &mut dyn FnMut());

    /// Parks the calling application processor after it leaves the MP
    /// services. Hardware implementations never return from here.
    fn park_ap(&self) {}
}

/// The routine application processors run when they wake up.
pub struct ApEntry<P: Platform> {
    mp: &'static MpServices<P>,
}

impl<P: Platform> ApEntry<P> {
    pub(crate) fn new(mp: &'static MpServices<P>) -> Self {
        Self { mp }
    }

    /// The top of the transitional stack shared by waking processors.
    pub fn handoff_stack_top(&self) -> usize {
        self.mp.handoff().stack_top()
    }

    /// Runs the application processor bring-up on the calling processor.
    ///
    /// The call returns only after the processor has been parked.
    pub fn run(self) {
        crate::boot::ap_entry(self.mp);
    }
}

impl<P: Platform> Clone for ApEntry<P> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<P: Platform> Copy for ApEntry<P> {}

impl<P: Platform> fmt::Debug for ApEntry<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApEntry").finish_non_exhaustive()
    }
}
