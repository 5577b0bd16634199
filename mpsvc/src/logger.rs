// SPDX-License-Identifier: MPL-2.0

//! Logging support.
//!
//! Currently the logger prints the logs to the platform console.
//!
//! This module guarantees _atomicity_ under concurrency: messages are always
//! printed in their entirety without being mixed with messages generated
//! concurrently on other processors. Application processors log while they
//! come up, so do not print long log messages.

use alloc::format;

use log::{LevelFilter, Metadata, Record};
use spin::Once;

use crate::{
    platform::{Clock, Console},
    prelude::*,
    sync::SpinLock,
};

/// Where log records go: a console plus a clock for the timestamps.
pub trait LogTarget: Clock + Console + Sync {}

impl<T: Clock + Console + Sync> LogTarget for T {}

static LOGGER: Logger = Logger {
    target: Once::new(),
};

struct Logger {
    target: Once<&'static dyn LogTarget>,
}

impl log::Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let Some(target) = self.target.get() else {
            return;
        };

        let timestamp = format!("[{:>10.3}]", target.now().as_secs_f64());
        let level = format!("{:<5}", record.level());
        let line = format!("{} {}: {}\n", timestamp, level, record.args());

        // Use a global lock to prevent interleaving of log messages.
        static RECORD_LOCK: SpinLock<()> = SpinLock::new(());
        let _lock = RECORD_LOCK.lock();

        target.write_str(&line);
    }

    fn flush(&self) {}
}

/// Initializes the logger. Log macros used before this call print nothing.
///
/// Nothing is installed if `level` is [`LevelFilter::Off`]. Fails with
/// [`Status::Unsupported`] if a logger has already been installed.
pub fn init(target: &'static dyn LogTarget, level: LevelFilter) -> Result<()> {
    if level == LevelFilter::Off {
        return Ok(());
    }
    LOGGER.target.call_once(|| target);
    if log::set_logger(&LOGGER).is_err() {
        return_status_with_message!(Status::Unsupported, "A logger is already installed");
    }
    log::set_max_level(level);
    Ok(())
}

#[cfg(test)]
mod test {
    use std::{string::String, sync::Mutex, time::Duration};

    use super::*;

    struct Capture {
        out: Mutex<String>,
    }

    impl Clock for Capture {
        fn now(&self) -> Duration {
            Duration::from_millis(1500)
        }
    }

    impl Console for Capture {
        fn write_str(&self, s: &str) {
            self.out.lock().unwrap().push_str(s);
        }
    }

    #[test]
    fn records_are_timestamped_lines() {
        let capture: &'static Capture = Box::leak(Box::new(Capture {
            out: Mutex::new(String::new()),
        }));
        init(capture, LevelFilter::Info).unwrap();

        // Other tests may log concurrently once the logger is installed.
        log::info!("logger self-check {}", 42);
        log::debug!("logger self-check hidden");

        let out = capture.out.lock().unwrap().clone();
        assert!(out
            .lines()
            .any(|line| line == "[     1.500] INFO : logger self-check 42"));
        assert!(!out.contains("logger self-check hidden"));
        assert_eq!(
            init(capture, LevelFilter::Info).unwrap_err().status(),
            Status::Unsupported
        );
    }
}
