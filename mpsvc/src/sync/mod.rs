// SPDX-License-Identifier: MPL-2.0

//! Useful synchronization primitives.
//!
//! The firmware phase has no scheduler to cooperate with, so every primitive
//! here spins.

mod spin;
mod wait;

pub use self::{
    spin::{RawSpinLock, SpinLock, SpinLockGuard},
    wait::{SpinWait, Timeout},
};
