// SPDX-License-Identifier: MPL-2.0

//! The firmware-facing binding of the MP services.
//!
//! Firmware protocol consumers pass output locations that may be absent and
//! expect a status code back. [`MpServicesProtocol`] adapts [`MpServices`] to
//! that shape: absent outputs are rejected with [`Status::InvalidParameter`]
//! before anything else is checked, and timeouts are given in microseconds
//! with zero meaning "wait indefinitely".

use core::ffi::c_void;

use crate::{
    cpu::{ProcessorInfo, StatusFlag},
    mp::{ApProcedure, MpServices},
    platform::Platform,
    prelude::*,
    sync::Timeout,
};

/// The firmware status code of success.
pub const EFI_SUCCESS: usize = 0;

/// Converts the result of a protocol call to a firmware status code.
pub fn efi_status(result: Result<()>) -> usize {
    match result {
        Ok(()) => EFI_SUCCESS,
        Err(err) => err.status().efi_status(),
    }
}

/// The MP services protocol, as installed for other firmware drivers.
#[derive(Debug)]
pub struct MpServicesProtocol<'a, P: Platform> {
    mp: &'a MpServices<P>,
}

impl<'a, P: Platform> MpServicesProtocol<'a, P> {
    /// Wraps the MP services of this boot session.
    pub fn new(mp: &'a MpServices<P>) -> Self {
        Self { mp }
    }

    /// Retrieves the number of logical processors and the number of enabled
    /// ones.
    pub fn get_number_of_processors(
        &self,
        number_of_processors: Option<&mut usize>,
        number_of_enabled_processors: Option<&mut usize>,
    ) -> Result<()> {
        let (Some(total), Some(enabled)) = (number_of_processors, number_of_enabled_processors)
        else {
            return_status!(Status::InvalidParameter);
        };
        let count = self.mp.enumerate()?;
        *total = count.total;
        *enabled = count.enabled;
        Ok(())
    }

    /// Gets detailed information on the requested processor at the instant
    /// this call is made.
    pub fn get_processor_info(
        &self,
        processor_number: usize,
        processor_info_buffer: Option<&mut ProcessorInfo>,
    ) -> Result<()> {
        let Some(buffer) = processor_info_buffer else {
            return_status!(Status::InvalidParameter);
        };
        *buffer = self.mp.describe(processor_number)?;
        Ok(())
    }

    /// Runs `procedure` on one application processor and waits for it.
    ///
    /// If `finished` is given, it tells whether the procedure completed,
    /// including when the call times out.
    pub fn startup_this_ap(
        &self,
        procedure: Option<ApProcedure>,
        processor_number: usize,
        timeout_in_microseconds: u64,
        procedure_argument: *mut c_void,
        finished: Option<&mut bool>,
    ) -> Result<()> {
        let Some(procedure) = procedure else {
            return_status!(Status::InvalidParameter);
        };
        let result = self.mp.dispatch(
            processor_number,
            procedure,
            procedure_argument,
            Timeout::from_micros(timeout_in_microseconds),
        );
        if let Some(finished) = finished {
            *finished = result.is_ok();
        }
        result
    }

    /// Runs `procedure` on all enabled application processors and waits for
    /// them.
    ///
    /// The registry indices of the processors that did not finish are written
    /// to `failed_cpu_list`, if given. Fails with [`Status::Timeout`] if any
    /// processor did not finish.
    pub fn startup_all_aps(
        &self,
        procedure: Option<ApProcedure>,
        timeout_in_microseconds: u64,
        procedure_argument: *mut c_void,
        failed_cpu_list: Option<&mut Vec<usize>>,
    ) -> Result<()> {
        let Some(procedure) = procedure else {
            return_status!(Status::InvalidParameter);
        };
        let report = self.mp.dispatch_all(
            procedure,
            procedure_argument,
            Timeout::from_micros(timeout_in_microseconds),
        )?;
        if let Some(list) = failed_cpu_list {
            list.clear();
            list.extend(report.failed_cpus().map(usize::from));
        }
        if !report.all_finished() {
            return_status_with_message!(Status::Timeout, "Some processors did not finish");
        }
        Ok(())
    }

    /// Enables or disables an application processor.
    ///
    /// Only the [`StatusFlag::PROCESSOR_HEALTH_STATUS`] bit of `health_flag`
    /// is used; the other bits are ignored.
    pub fn enable_disable_ap(
        &self,
        processor_number: usize,
        enable_ap: bool,
        health_flag: Option<&u32>,
    ) -> Result<()> {
        let health = health_flag.map(|&bits| StatusFlag::from_bits_truncate(bits));
        self.mp.set_enabled(processor_number, enable_ap, health)
    }

    /// Gets the registry index of the calling processor.
    pub fn who_am_i(&self, processor_number: Option<&mut usize>) -> Result<()> {
        let Some(number) = processor_number else {
            return_status!(Status::InvalidParameter);
        };
        *number = self.mp.who_am_i()?.as_usize();
        Ok(())
    }
}
