// SPDX-License-Identifier: MPL-2.0

//! Multiprocessor services for the firmware phase of the boot process.
//!
//! The crate brings up every application processor listed by the firmware
//! tables, keeps one descriptor per logical processor, and lets the boot
//! processor run procedures on the others. Everything that touches the
//! physical machine goes through a [`Platform`] implementation.
//!
//! ```ignore
//! let mp = mpsvc::init(MyPlatform::new(), cmdline)?;
//! let count = mp.enumerate()?;
//! let report = mp.dispatch_all(flush_caches, core::ptr::null_mut(), Timeout::INFINITE)?;
//! ```
#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]

extern crate alloc;

pub mod boot;
pub mod config;
pub mod cpu;
mod error;
pub mod logger;
pub mod mp;
pub mod platform;
pub mod prelude;
pub mod protocol;
#[cfg(test)]
mod sim;
pub mod sync;

use alloc::boxed::Box;

pub use self::{
    config::MpConfig,
    cpu::{CpuId, CpuState, ProcessorCount, ProcessorInfo, StatusFlag},
    error::{Error, Status},
    mp::{ApProcedure, DispatchAllReport, MpServices},
    platform::Platform,
    prelude::Result,
    sync::Timeout,
};

/// Initializes the MP services for this boot session.
///
/// The configuration is parsed from the firmware command line, the logger is
/// attached to the platform console, and all application processors are
/// brought up. Must be called on the boot processor.
pub fn init<P: Platform>(platform: P, cmdline: &str) -> Result<&'static MpServices<P>> {
    let config = MpConfig::from(cmdline);
    let log_level = config.log_level;
    let mp: &'static MpServices<P> = Box::leak(Box::new(MpServices::new(platform, config)?));

    if let Err(err) = logger::init(mp.platform(), log_level) {
        log::warn!("Keeping the existing logger: {}", err);
    }
    mp.init()?;
    Ok(mp)
}
