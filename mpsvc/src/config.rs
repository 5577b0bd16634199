// SPDX-License-Identifier: MPL-2.0

//! Tunables of the MP services.
//!
//! The configuration is read from the firmware command line. Only module
//! arguments of the `mp` module are considered, using the same syntax as
//! kernel module parameters:
//!
//! ```text
//! mp.log_level=info mp.ap_init_timeout_us=100000 mp.ap_stack_size=0x8000
//! ```
//!
//! Arguments that cannot be parsed are skipped with a warning.

use core::time::Duration;

use log::LevelFilter;

use crate::sync::Timeout;

/// The module name whose arguments configure the MP services.
const MODULE_NAME: &str = "mp";

/// The smallest shared stack that can hold the occupancy canary.
const MIN_HANDOFF_STACK_SIZE: usize = 64;

/// The configuration of the MP services.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MpConfig {
    /// The maximum level of log records that are printed.
    pub log_level: LevelFilter,
    /// The most processors the registry will hold.
    pub max_cpus: usize,
    /// The size of the private stack given to each application processor.
    pub ap_stack_size: usize,
    /// The size of the transitional stack shared by waking processors.
    pub handoff_stack_size: usize,
    /// How long bring-up waits for the application processors to check in.
    pub ap_init_timeout: Timeout,
    /// How long a waking processor waits to enter the hand-off channel.
    pub handoff_timeout: Timeout,
    /// The cap on relax iterations between two polls of a spin-wait.
    pub spin_backoff_max: u32,
}

impl Default for MpConfig {
    fn default() -> Self {
        Self {
            log_level: LevelFilter::Off,
            max_cpus: 256,
            ap_stack_size: 0x8000,
            handoff_stack_size: 0x1000,
            ap_init_timeout: Timeout::after(Duration::from_millis(50)),
            handoff_timeout: Timeout::after(Duration::from_secs(1)),
            spin_backoff_max: 64,
        }
    }
}

impl MpConfig {
    fn apply(&mut self, key: &str, value: &str) {
        let applied = match key {
            "log_level" => parse_log_level(value).map(|level| self.log_level = level),
            "max_cpus" => parse_usize(value)
                .filter(|&n| n > 0)
                .map(|n| self.max_cpus = n),
            "ap_stack_size" => parse_usize(value)
                .filter(|&n| n > 0)
                .map(|n| self.ap_stack_size = n),
            "handoff_stack_size" => parse_usize(value)
                .filter(|&n| n >= MIN_HANDOFF_STACK_SIZE)
                .map(|n| self.handoff_stack_size = n),
            "ap_init_timeout_us" => parse_u64(value)
                .map(|us| self.ap_init_timeout = Timeout::from_micros(us)),
            "handoff_timeout_us" => parse_u64(value)
                .map(|us| self.handoff_timeout = Timeout::from_micros(us)),
            "spin_backoff_max" => parse_u64(value)
                .and_then(|n| u32::try_from(n).ok())
                .map(|n| self.spin_backoff_max = n),
            _ => {
                log::warn!("[MpConfig] Unknown option {}.{}, skip for now", MODULE_NAME, key);
                return;
            }
        };
        if applied.is_none() {
            log::warn!(
                "[MpConfig] Unable to parse value {} of option {}.{}, skip for now",
                value,
                MODULE_NAME,
                key
            );
        }
    }
}

// Splits the command line string by spaces but preserve
// ones that are protected by double quotes(`"`).
fn split_arg(input: &str) -> impl Iterator<Item = &str> {
    let mut inside_quotes = false;

    input
        .split(move |c: char| {
            if c == '"' {
                inside_quotes = !inside_quotes;
            }

            !inside_quotes && c.is_whitespace()
        })
        .filter(|arg| !arg.is_empty())
}

impl From<&str> for MpConfig {
    fn from(cmdline: &str) -> Self {
        let mut config = MpConfig::default();

        for arg in split_arg(cmdline) {
            // Everything after "--" belongs to whatever is booted next.
            if arg == "--" {
                break;
            }
            // Arg => Module "." Option "=" Value
            let Some((entry, value)) = arg.split_once('=') else {
                continue;
            };
            let Some((module, option)) = entry.split_once('.') else {
                continue;
            };
            if module != MODULE_NAME {
                continue;
            }
            config.apply(option, value.trim_matches('"'));
        }

        config
    }
}

fn parse_log_level(value: &str) -> Option<LevelFilter> {
    Some(match value {
        "off" => LevelFilter::Off,
        "error" => LevelFilter::Error,
        "warn" => LevelFilter::Warn,
        "info" => LevelFilter::Info,
        "debug" => LevelFilter::Debug,
        "trace" => LevelFilter::Trace,
        _ => return None,
    })
}

fn parse_u64(value: &str) -> Option<u64> {
    match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => value.parse().ok(),
    }
}

fn parse_usize(value: &str) -> Option<usize> {
    parse_u64(value).and_then(|n| usize::try_from(n).ok())
}
