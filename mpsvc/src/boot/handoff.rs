// SPDX-License-Identifier: MPL-2.0

//! The bootstrap hand-off channel.
//!
//! Application processors wake up without a stack of their own. They run the
//! first few steps of bring-up on one transitional stack that all of them
//! share, locate their private stack, move onto it, and only then let the
//! next processor in. The channel is the lock that serializes this.
//!
//! The critical section bounds the latency of bringing up every processor,
//! so it must be short and must never wait on anything else.

use alloc::vec;
use core::{
    cell::UnsafeCell,
    mem::size_of,
    sync::atomic::{AtomicUsize, Ordering},
};

use crate::{
    platform::Clock,
    prelude::*,
    sync::{RawSpinLock, SpinWait, Timeout},
};

/// The transitional stack and the lock that guards it.
pub struct HandoffChannel {
    lock: RawSpinLock,
    stack: UnsafeCell<Box<[u8]>>,
    stack_top: usize,
    occupants: AtomicUsize,
    max_occupancy: AtomicUsize,
    acquisitions: AtomicUsize,
    corruptions: AtomicUsize,
}

// SAFETY: The stack is only accessed through `SharedStack`, which exists only
// while `lock` is held.
unsafe impl Sync for HandoffChannel {}

/// Counters describing how the hand-off channel has been used.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HandoffStats {
    /// How many times the channel was entered.
    pub acquisitions: usize,
    /// The most processors ever seen inside the channel at once.
    pub max_occupancy: usize,
    /// How many occupants found the shared stack overwritten by someone else.
    pub corruptions: usize,
}

impl HandoffChannel {
    /// Creates a channel with a shared stack of `stack_size` bytes.
    pub fn new(stack_size: usize) -> Self {
        let mut stack = vec![0u8; stack_size.max(size_of::<u64>())].into_boxed_slice();
        let stack_top = stack.as_mut_ptr() as usize + stack.len();
        Self {
            lock: RawSpinLock::new(),
            stack: UnsafeCell::new(stack),
            stack_top,
            occupants: AtomicUsize::new(0),
            max_occupancy: AtomicUsize::new(0),
            acquisitions: AtomicUsize::new(0),
            corruptions: AtomicUsize::new(0),
        }
    }

    /// Enters the channel on behalf of the processor `owner`.
    ///
    /// Spins until the channel is free. Fails with [`Status::Timeout`] if it
    /// stays occupied past `timeout`.
    ///
    /// The returned [`SharedStack`] does not release the channel when it is
    /// dropped: [`SharedStack::release`] must be called explicitly once the
    /// owner no longer runs on the shared stack.
    pub fn acquire<C: Clock + ?Sized>(
        &self,
        owner: u64,
        clock: &C,
        timeout: Timeout,
        max_backoff: u32,
    ) -> Result<SharedStack<'_>> {
        SpinWait::new(clock, timeout, max_backoff)
            .wait_until(|| self.lock.try_acquire().then_some(()))?;

        let occupants = self.occupants.fetch_add(1, Ordering::AcqRel) + 1;
        self.max_occupancy.fetch_max(occupants, Ordering::AcqRel);
        self.acquisitions.fetch_add(1, Ordering::Relaxed);

        let mut shared = SharedStack {
            channel: self,
            owner,
        };
        shared.stamp();
        Ok(shared)
    }

    /// The address just past the end of the shared stack.
    ///
    /// Only the processor inside the channel may run on it.
    pub fn stack_top(&self) -> usize {
        self.stack_top
    }

    /// Returns whether a processor is inside the channel.
    pub fn is_occupied(&self) -> bool {
        self.lock.is_locked()
    }

    /// Returns the usage counters of the channel.
    pub fn stats(&self) -> HandoffStats {
        HandoffStats {
            acquisitions: self.acquisitions.load(Ordering::Acquire),
            max_occupancy: self.max_occupancy.load(Ordering::Acquire),
            corruptions: self.corruptions.load(Ordering::Acquire),
        }
    }
}

/// Exclusive use of the transitional stack.
#[must_use = "the hand-off channel stays closed until `release` is called"]
pub struct SharedStack<'a> {
    channel: &'a HandoffChannel,
    owner: u64,
}

impl SharedStack<'_> {
    /// The address just past the end of the shared stack.
    pub fn top(&self) -> usize {
        self.channel.stack_top
    }

    /// Returns whether the shared stack still carries the owner's mark.
    pub fn is_intact(&self) -> bool {
        // SAFETY: We hold the channel lock.
        let stack = unsafe { &*self.channel.stack.get() };
        let mark = &stack[stack.len() - size_of::<u64>()..];
        mark == &self.owner.to_ne_bytes()[..]
    }

    /// Leaves the channel so that the next processor can enter.
    ///
    /// Call this only after the owner has moved off the shared stack.
    pub fn release(self) {
        if !self.is_intact() {
            self.channel.corruptions.fetch_add(1, Ordering::AcqRel);
            log::error!(
                "The shared bring-up stack was overwritten while processor {:#x} used it",
                self.owner
            );
        }
        self.channel.occupants.fetch_sub(1, Ordering::AcqRel);
        // SAFETY: `SharedStack` only exists while the lock is held, and it is
        // consumed here.
        unsafe { self.channel.lock.release() };
    }

    // Marks the top of the shared stack with the owner's identifier, so that
    // a second occupant would be detected at release time.
    fn stamp(&mut self) {
        // SAFETY: We hold the channel lock.
        let stack = unsafe { &mut *self.channel.stack.get() };
        let len = stack.len();
        stack[len - size_of::<u64>()..].copy_from_slice(&self.owner.to_ne_bytes());
    }
}
