// SPDX-License-Identifier: MPL-2.0

use core::time::Duration;

use crate::{platform::Clock, prelude::*};

/// An upper bound on how long a spin-wait may last.
///
/// There is no default: every waiting operation takes a `Timeout` from its
/// caller, and waiting forever must be requested with [`Timeout::INFINITE`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeout(Option<Duration>);

impl Timeout {
    /// Waits without a bound.
    pub const INFINITE: Self = Self(None);

    /// Waits for at most `duration`.
    ///
    /// A zero duration checks the condition exactly once.
    pub const fn after(duration: Duration) -> Self {
        Self(Some(duration))
    }

    /// Converts a firmware-style microsecond timeout, where zero means
    /// "wait indefinitely".
    pub const fn from_micros(micros: u64) -> Self {
        if micros == 0 {
            Self::INFINITE
        } else {
            Self(Some(Duration::from_micros(micros)))
        }
    }

    /// Returns whether this timeout never expires.
    pub const fn is_infinite(&self) -> bool {
        self.0.is_none()
    }

    /// Returns the bound, if any.
    pub const fn duration(&self) -> Option<Duration> {
        self.0
    }
}

/// A spin-wait with a deadline and exponential backoff.
///
/// This is the only way this crate waits on another processor. Each round
/// evaluates the condition, checks the deadline, then relaxes the processor
/// for a number of iterations that doubles up to `max_backoff`.
pub struct SpinWait<'a, C: Clock + ?Sized> {
    clock: &'a C,
    deadline: Option<Duration>,
    backoff: u32,
    max_backoff: u32,
}

impl<'a, C: Clock + ?Sized> SpinWait<'a, C> {
    /// Starts a spin-wait bounded by `timeout`, measured on `clock`.
    pub fn new(clock: &'a C, timeout: Timeout, max_backoff: u32) -> Self {
        let deadline = timeout
            .duration()
            .map(|duration| clock.now().saturating_add(duration));
        Self {
            clock,
            deadline,
            backoff: 1,
            max_backoff: max_backoff.max(1),
        }
    }

    /// Spins until `cond` returns `Some(_)`.
    ///
    /// The condition is always evaluated at least once, even if the timeout
    /// is zero. Fails with [`Status::Timeout`] once the deadline passes.
    pub fn wait_until<F, R>(&mut self, mut cond: F) -> Result<R>
    where
        F: FnMut() -> Option<R>,
    {
        loop {
            if let Some(res) = cond() {
                return Ok(res);
            }
            if self.has_expired() {
                return_status_with_message!(Status::Timeout, "spin-wait deadline passed");
            }
            self.spin();
        }
    }

    /// Returns whether the deadline has passed.
    pub fn has_expired(&self) -> bool {
        self.deadline.is_some_and(|deadline| self.clock.now() >= deadline)
    }

    fn spin(&mut self) {
        for _ in 0..self.backoff {
            self.clock.relax();
        }
        self.grow_backoff();
    }

    fn grow_backoff(&mut self) {
        self.backoff = self.backoff.saturating_mul(2).min(self.max_backoff);
    }
}
