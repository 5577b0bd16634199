// SPDX-License-Identifier: MPL-2.0

//! A simulated platform for tests.
//!
//! Each application processor is a host thread that carries its hardware
//! identifier in a thread-local. Threads that never claimed an identifier act
//! as the boot processor of whichever platform they call into.

use std::{
    cell::Cell,
    string::String,
    sync::{Mutex, OnceLock},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crate::{
    boot::HandoffChannel,
    config::MpConfig,
    cpu::{
        topology::{self, TopologyShifts},
        CpuLocation,
    },
    mp::MpServices,
    platform::{ApEntry, Clock, Console, Platform},
    prelude::*,
    sync::Timeout,
};

thread_local! {
    static CURRENT_ID: Cell<Option<u64>> = const { Cell::new(None) };
}

/// Two threads per core and four cores per package.
pub(crate) const SIM_SHIFTS: TopologyShifts = TopologyShifts {
    thread_bits: 1,
    core_bits: 2,
};

/// A stack switch requested by a processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct StackSwitch {
    pub(crate) processor_id: u64,
    pub(crate) stack_top: usize,
    pub(crate) channel_held: bool,
}

pub(crate) struct SimPlatform {
    ids: Vec<u64>,
    bsp_id: u64,
    never_wake: Vec<u64>,
    start: Instant,
    threads: Mutex<Vec<JoinHandle<()>>>,
    console: Mutex<String>,
    channel: OnceLock<&'static HandoffChannel>,
    handoff_stack_top: OnceLock<usize>,
    switches: Mutex<Vec<StackSwitch>>,
}

impl SimPlatform {
    /// A platform with `num_cpus` processors numbered from zero. The first
    /// one is the boot processor.
    pub(crate) fn new(num_cpus: u64) -> Self {
        Self::with_ids((0..num_cpus).collect(), 0)
    }

    pub(crate) fn with_ids(ids: Vec<u64>, bsp_id: u64) -> Self {
        Self {
            ids,
            bsp_id,
            never_wake: Vec::new(),
            start: Instant::now(),
            threads: Mutex::new(Vec::new()),
            console: Mutex::new(String::new()),
            channel: OnceLock::new(),
            handoff_stack_top: OnceLock::new(),
            switches: Mutex::new(Vec::new()),
        }
    }

    /// Makes the processor `id` ignore the wake signal.
    pub(crate) fn never_wake(mut self, id: u64) -> Self {
        self.never_wake.push(id);
        self
    }

    pub(crate) fn bsp_id(&self) -> u64 {
        self.bsp_id
    }

    /// The shared stack announced with the wake signal.
    pub(crate) fn handoff_stack_top(&self) -> Option<usize> {
        self.handoff_stack_top.get().copied()
    }

    /// The stack switches of processor `id`, in order.
    pub(crate) fn switches_of(&self, id: u64) -> Vec<StackSwitch> {
        self.switches
            .lock()
            .unwrap()
            .iter()
            .filter(|switch| switch.processor_id == id)
            .copied()
            .collect()
    }
}

impl Clock for SimPlatform {
    fn now(&self) -> Duration {
        self.start.elapsed()
    }

    fn relax(&self) {
        thread::yield_now();
    }
}

impl Console for SimPlatform {
    fn write_str(&self, s: &str) {
        self.console.lock().unwrap().push_str(s);
    }
}

impl Platform for SimPlatform {
    fn processor_ids(&self) -> Vec<u64> {
        self.ids.clone()
    }

    fn current_processor_id(&self) -> u64 {
        CURRENT_ID.with(Cell::get).unwrap_or(self.bsp_id)
    }

    fn report_self(&self) -> CpuLocation {
        topology::decode(self.current_processor_id(), SIM_SHIFTS)
    }

    fn wake_all_aps(&self, entry: ApEntry<Self>) -> Result<()> {
        let _ = self.handoff_stack_top.set(entry.handoff_stack_top());
        let mut threads = self.threads.lock().unwrap();
        for &id in &self.ids {
            if id == self.bsp_id || self.never_wake.contains(&id) {
                continue;
            }
            threads.push(thread::spawn(move || {
                CURRENT_ID.with(|current| current.set(Some(id)));
                entry.run();
            }));
        }
        Ok(())
    }

    fn run_on_stack(&self, stack_top: usize, f: &mut dyn FnMut()) {
        let channel_held = self
            .channel
            .get()
            .is_some_and(|channel| channel.is_occupied());
        self.switches.lock().unwrap().push(StackSwitch {
            processor_id: self.current_processor_id(),
            stack_top,
            channel_held,
        });
        // Linger inside the hand-off channel to give other processors a
        // chance to break in.
        thread::yield_now();
        f();
    }
}

/// Runs `f` as if it executed on the processor `id`.
pub(crate) fn as_processor<R>(id: u64, f: impl FnOnce() -> R) -> R {
    let saved = CURRENT_ID.with(|current| current.replace(Some(id)));
    let res = f();
    CURRENT_ID.with(|current| current.set(saved));
    res
}

/// A configuration that tolerates slow test machines.
pub(crate) fn config() -> MpConfig {
    MpConfig {
        ap_stack_size: 0x1000,
        ap_init_timeout: Timeout::after(Duration::from_secs(10)),
        handoff_timeout: Timeout::INFINITE,
        spin_backoff_max: 4,
        ..MpConfig::default()
    }
}

/// Creates MP services for the session and brings up the processors.
pub(crate) fn boot(platform: SimPlatform, config: MpConfig) -> &'static MpServices<SimPlatform> {
    let mp: &'static MpServices<SimPlatform> =
        Box::leak(Box::new(MpServices::new(platform, config).unwrap()));
    let _ = mp.platform().channel.set(mp.handoff());
    mp.init().unwrap();
    mp
}

/// Parks the processors of the session and joins their threads.
pub(crate) fn shutdown(mp: &'static MpServices<SimPlatform>) {
    mp.park_all_aps(Timeout::after(Duration::from_secs(10))).unwrap();
    let threads: Vec<_> = mp.platform().threads.lock().unwrap().drain(..).collect();
    for thread in threads {
        thread.join().unwrap();
    }
}
