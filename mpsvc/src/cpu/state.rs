// SPDX-License-Identifier: MPL-2.0

use core::sync::atomic::{AtomicU8, Ordering};

use crate::prelude::*;

/// The lifecycle state of a processor.
///
/// ```text
///            bring-up          dispatch          work done
///   Idle ───────────► Ready ───────────► Busy ───────────► Finished
///                     ▲  ▲                 │                  │
///             enable  │  └─────────────────┼──── consumed ────┘
///                     │                    │
///                  Blocked ◄── disable ────┴── (from Ready, Busy, Finished)
/// ```
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CpuState {
    /// Not participating yet; the processor has not completed bring-up.
    Idle = 0,
    /// Woken but not eligible for work, e.g., disabled.
    Blocked = 1,
    /// Available with no work assigned.
    Ready = 2,
    /// Executing its assigned work.
    Busy = 3,
    /// Work completed; waiting for the dispatcher to notice.
    Finished = 4,
}

impl CpuState {
    /// Returns whether the state machine allows moving from `self` to `next`.
    pub const fn can_transition_to(self, next: CpuState) -> bool {
        use CpuState::*;

        matches!(
            (self, next),
            (Idle, Ready)
                | (Ready, Busy)
                | (Busy, Finished)
                | (Finished, Ready)
                | (Ready | Busy | Finished, Blocked)
                | (Blocked, Ready)
        )
    }

    const fn from_raw(raw: u8) -> Option<Self> {
        Some(match raw {
            0 => CpuState::Idle,
            1 => CpuState::Blocked,
            2 => CpuState::Ready,
            3 => CpuState::Busy,
            4 => CpuState::Finished,
            _ => return None,
        })
    }
}

/// Why a state transition was not applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionError {
    /// The transition is not in the state machine.
    Forbidden {
        /// The state transitioned from.
        from: CpuState,
        /// The state transitioned to.
        to: CpuState,
    },
    /// The current state is not the expected one.
    Mismatch(CpuState),
}

impl From<TransitionError> for Error {
    fn from(err: TransitionError) -> Self {
        match err {
            TransitionError::Forbidden { .. } => {
                Error::with_message(Status::DeviceError, "Forbidden CPU state transition")
            }
            TransitionError::Mismatch(_) => {
                Error::with_message(Status::NotReady, "CPU state changed concurrently")
            }
        }
    }
}

/// An atomic container of [`CpuState`].
///
/// Stores use `Release` and loads use `Acquire`, so whatever a processor wrote
/// before moving the state forward is visible to whoever observes the new
/// state.
pub struct AtomicCpuState(AtomicU8);

impl AtomicCpuState {
    /// Creates a new atomic state.
    pub const fn new(state: CpuState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    /// Loads the current state.
    pub fn load(&self) -> CpuState {
        let raw = self.0.load(Ordering::Acquire);
        match CpuState::from_raw(raw) {
            Some(state) => state,
            // Only values produced from `CpuState` are ever stored.
            None => unreachable!("corrupted CPU state {}", raw),
        }
    }

    /// Moves the state from `from` to `to`.
    ///
    /// The transition is applied only if it is allowed by the state machine
    /// and the current state is `from`.
    pub fn transition(
        &self,
        from: CpuState,
        to: CpuState,
    ) -> core::result::Result<(), TransitionError> {
        if !from.can_transition_to(to) {
            return Err(TransitionError::Forbidden { from, to });
        }
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|actual| match CpuState::from_raw(actual) {
                Some(state) => TransitionError::Mismatch(state),
                None => unreachable!("corrupted CPU state {}", actual),
            })
    }
}

impl core::fmt::Debug for AtomicCpuState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_tuple("AtomicCpuState").field(&self.load()).finish()
    }
}
