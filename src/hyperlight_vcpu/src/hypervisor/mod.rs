/*
Copyright 2025 The Hyperlight Authors.

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

    http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

use log::LevelFilter;
use tracing::{instrument, Span};

use crate::correlation::CorrelationId;
use crate::error::HyperlightError::{self, ExecutionCanceledByHost, GuestExecutionFailure};
use crate::mem::memory_region::{GuestMemoryRegion, MemoryRegionFlags};
use crate::metrics::{METRIC_GUEST_CANCELLATION, METRIC_GUEST_EXECUTION_FAILURE};
use crate::{log_then_return, Result};

/// Probing for and constructing a backend
pub mod available;
/// A software vCPU that interprets a small subset of x86-64
pub mod emulated;
/// Handlers for Hypervisor custom logic
pub mod handlers;
#[cfg(kvm)]
/// Functionality to manipulate KVM-based virtual machines
pub(crate) mod kvm;
#[cfg(kvm)]
/// The raw `/dev/kvm` calls made by the KVM backend
pub(crate) mod kvm_sys;
/// Register values shared by every backend
pub mod regs;

use std::fmt::Debug;
use std::str::FromStr;
#[cfg(kvm)]
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
#[cfg(kvm)]
use std::time::Duration;

use crate::mem::ptr::RawPtr;

pub(crate) const CR4_PAE: u64 = 1 << 5;
pub(crate) const CR4_OSFXSR: u64 = 1 << 9;
pub(crate) const CR4_OSXMMEXCPT: u64 = 1 << 10;
pub(crate) const CR0_PE: u64 = 1;
pub(crate) const CR0_MP: u64 = 1 << 1;
pub(crate) const CR0_ET: u64 = 1 << 4;
pub(crate) const CR0_NE: u64 = 1 << 5;
pub(crate) const CR0_WP: u64 = 1 << 16;
pub(crate) const CR0_AM: u64 = 1 << 18;
pub(crate) const CR0_PG: u64 = 1 << 31;
pub(crate) const EFER_LME: u64 = 1 << 8;
pub(crate) const EFER_LMA: u64 = 1 << 10;
pub(crate) const EFER_SCE: u64 = 1;
pub(crate) const EFER_NX: u64 = 1 << 11;

/// These are the generic exit reasons that we can handle from a Hypervisor the Hypervisors run method is responsible for mapping from
/// the hypervisor specific exit reasons to these generic ones
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HyperlightExit {
    /// The vCPU has halted
    Halt(),
    /// The vCPU has issued a write to the given port with the given data
    IoOut(u16, Vec<u8>),
    /// The vCPU has attempted to read or write from an unmapped address
    Mmio(u64),
    /// The vCPU tried to access memory but was missing the required permissions
    AccessViolation(u64, MemoryRegionFlags, MemoryRegionFlags),
    /// The vCPU execution has been cancelled
    Cancelled(),
    /// The vCPU has exited for a reason that is not handled
    Unknown(String),
    /// The operation should be retried, for example this can happen on Linux where a call to run the CPU can return EAGAIN
    Retry(),
}

/// Where a hypervisor instance is in its life.
///
/// ```text
/// Unconfigured --initialise--> Initialised | Faulted
/// Initialised | Halted --execute_until_halt / dispatch_call_from_host--> Running
/// Running --port write--> Trapped --handler ok--> Running
/// Running --halt--> Halted
/// Running | Trapped --anything else--> Faulted
/// any state but Disposed --dispose--> Disposed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HypervisorState {
    /// Constructed, no VM or vCPU exists yet
    Unconfigured,
    /// VM and vCPU exist and registers are programmed, the guest has not run
    Initialised,
    /// The vCPU is executing guest code
    Running,
    /// The guest wrote to a port and the outb handler is running
    Trapped,
    /// The guest executed `hlt`, it can be resumed or dispatched into
    Halted,
    /// A run or setup failed. Only `dispose` is allowed.
    Faulted,
    /// VM and vCPU have been released
    Disposed,
}

/// The lifecycle bookkeeping of a hypervisor instance.
///
/// Every backend keeps one of these and asks it before doing anything, so
/// the rules about which operation is allowed in which state are the same
/// for all backends.
#[derive(Debug)]
pub struct HypervisorLifecycle {
    state: HypervisorState,
}

impl HypervisorLifecycle {
    pub(crate) fn new() -> Self {
        Self {
            state: HypervisorState::Unconfigured,
        }
    }

    /// The current state
    pub fn state(&self) -> HypervisorState {
        self.state
    }

    fn reject(&self, operation: &'static str) -> HyperlightError {
        let err = HyperlightError::UsageError {
            operation,
            state: self.state,
        };
        log::error!("{}", err);
        err
    }

    pub(crate) fn begin_initialise(&mut self) -> Result<()> {
        match self.state {
            HypervisorState::Unconfigured => Ok(()),
            _ => Err(self.reject("initialise")),
        }
    }

    pub(crate) fn finish_initialise(&mut self, result: Result<()>) -> Result<()> {
        self.state = match result {
            Ok(()) => HypervisorState::Initialised,
            Err(_) => HypervisorState::Faulted,
        };
        result
    }

    pub(crate) fn begin_run(&mut self, operation: &'static str) -> Result<()> {
        match self.state {
            HypervisorState::Initialised | HypervisorState::Halted => {
                self.state = HypervisorState::Running;
                Ok(())
            }
            _ => Err(self.reject(operation)),
        }
    }

    pub(crate) fn ensure_running(&self, operation: &'static str) -> Result<()> {
        match self.state {
            HypervisorState::Running => Ok(()),
            _ => Err(self.reject(operation)),
        }
    }

    pub(crate) fn ensure_trapped(&self, operation: &'static str) -> Result<()> {
        match self.state {
            HypervisorState::Trapped => Ok(()),
            _ => Err(self.reject(operation)),
        }
    }

    pub(crate) fn trapped(&mut self) {
        self.state = HypervisorState::Trapped;
    }

    pub(crate) fn resumed(&mut self) {
        self.state = HypervisorState::Running;
    }

    pub(crate) fn finish_run(&mut self, result: Result<()>) -> Result<()> {
        self.state = match result {
            Ok(()) => HypervisorState::Halted,
            Err(_) => HypervisorState::Faulted,
        };
        result
    }

    pub(crate) fn begin_dispose(&mut self) -> Result<()> {
        match self.state {
            HypervisorState::Disposed => Err(self.reject("dispose")),
            _ => {
                self.state = HypervisorState::Disposed;
                Ok(())
            }
        }
    }
}

/// A common set of hypervisor functionality.
///
/// An implementation owns the VM and vCPU of one guest. It is constructed
/// without touching the hypervisor, `initialise` creates everything and
/// `dispose` releases it again.
pub trait Hypervisor: Debug + Send {
    /// Create the VM and vCPU, map guest memory and program the special
    /// and entry registers. Does not run the guest.
    fn initialise(&mut self) -> Result<()>;

    /// Run the vCPU from its current state until it halts. Every port
    /// write traps into `handle_outb` and the guest resumes once the
    /// handler returns.
    fn execute_until_halt(&mut self) -> Result<()>;

    /// Dispatch a call from the host to the guest using the given pointer
    /// to the dispatch function _in the guest's address space_.
    ///
    /// Do this by setting the instruction pointer to `dispatch_func_addr`
    /// and then running the execution loop until a halt instruction.
    ///
    /// Returns `Ok` if the call succeeded, and an `Err` if it failed
    fn dispatch_call_from_host(&mut self, dispatch_func_addr: RawPtr) -> Result<()>;

    /// Forward a guest port write to the outb handler. Only allowed while
    /// the guest is trapped on that write.
    fn handle_outb(&mut self, port: u16, value: u8) -> Result<()>;

    /// Release the VM and vCPU. Calling it a second time is a usage error.
    fn dispose(&mut self) -> Result<()>;

    /// Run the vCPU once, until its next exit
    fn run(&mut self) -> Result<HyperlightExit>;

    /// The current lifecycle state
    fn state(&self) -> HypervisorState {
        self.lifecycle().state()
    }

    /// The lifecycle bookkeeping shared with the trap loop
    fn lifecycle(&self) -> &HypervisorLifecycle;

    /// The lifecycle bookkeeping shared with the trap loop
    fn lifecycle_mut(&mut self) -> &mut HypervisorLifecycle;

    /// Get InterruptHandle to underlying VM
    fn interrupt_handle(&self) -> Arc<dyn InterruptHandle>;

    /// The correlation id attached to this instance's failures and spans
    fn correlation_id(&self) -> &CorrelationId;

    /// Returns a Some(HyperlightExit::AccessViolation(..)) if the given gpa lies
    /// in `region` but the region does not allow `access_info`. Returns None otherwise.
    fn get_memory_access_violation(
        &self,
        gpa: u64,
        region: &GuestMemoryRegion,
        access_info: MemoryRegionFlags,
    ) -> Option<HyperlightExit> {
        if region.contains(gpa) && !region.flags().contains(access_info) {
            return Some(HyperlightExit::AccessViolation(
                gpa,
                access_info,
                region.flags(),
            ));
        }
        None
    }

    /// Get the logging level to pass to the guest entrypoint
    fn get_max_log_level(&self) -> u32 {
        // The guest only produces the logs the host is going to process, so
        // hand it the level RUST_LOG asks for.
        let val = std::env::var("RUST_LOG").unwrap_or_default();
        let level = max_log_level_from(&val);
        log::info!("Determined guest log level: {}", level);
        level as u32
    }

    /// get a mutable trait object from self
    fn as_mut_hypervisor(&mut self) -> &mut dyn Hypervisor;
}

/// Parse a `RUST_LOG` value: the level given for `hyperlight_guest` wins,
/// then the one for `hyperlight_vcpu`, then a bare level. Defaults to `Error`.
pub(crate) fn max_log_level_from(rust_log: &str) -> LevelFilter {
    let directive_for = |target: &str| {
        rust_log
            .split(',')
            .find(|s| s.contains(target))
            .and_then(|s| s.split('=').nth(1))
    };

    let level = directive_for("hyperlight_guest")
        .or_else(|| directive_for("hyperlight_vcpu"))
        .or_else(|| rust_log.split(',').find(|s| !s.contains('=')))
        .unwrap_or("");

    LevelFilter::from_str(level.trim()).unwrap_or(LevelFilter::Error)
}

/// A virtual CPU that can be run until an exit occurs
pub struct VirtualCPU {}

impl VirtualCPU {
    /// Run the given hypervisor until a halt instruction is reached
    #[instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace")]
    pub fn run(hv: &mut dyn Hypervisor) -> Result<()> {
        loop {
            match hv.run() {
                Ok(HyperlightExit::Halt()) => {
                    break;
                }
                Ok(HyperlightExit::IoOut(port, data)) => {
                    // The value handed to the handler is the first byte written
                    let Some(&value) = data.first() else {
                        metrics::counter!(METRIC_GUEST_EXECUTION_FAILURE).increment(1);
                        log_then_return!(GuestExecutionFailure(format!(
                            "no data was given in IO exit on port {:#x}",
                            port
                        )));
                    };
                    hv.lifecycle_mut().trapped();
                    hv.handle_outb(port, value)?;
                    hv.lifecycle_mut().resumed();
                }
                Ok(HyperlightExit::Mmio(addr)) => {
                    metrics::counter!(METRIC_GUEST_EXECUTION_FAILURE).increment(1);
                    log_then_return!(GuestExecutionFailure(format!(
                        "MMIO access address {:#x}",
                        addr
                    )));
                }
                Ok(HyperlightExit::AccessViolation(addr, tried, region_permission)) => {
                    metrics::counter!(METRIC_GUEST_EXECUTION_FAILURE).increment(1);
                    log_then_return!(GuestExecutionFailure(format!(
                        "memory access violation at address {:#x} of type {}, but memory is marked as {}",
                        addr, tried, region_permission
                    )));
                }
                Ok(HyperlightExit::Cancelled()) => {
                    // Cancelled is returned when the host has killed the vCPU
                    metrics::counter!(METRIC_GUEST_CANCELLATION).increment(1);
                    log_then_return!(ExecutionCanceledByHost());
                }
                Ok(HyperlightExit::Unknown(reason)) => {
                    metrics::counter!(METRIC_GUEST_EXECUTION_FAILURE).increment(1);
                    log_then_return!(GuestExecutionFailure(format!(
                        "Unexpected VM Exit {}",
                        reason
                    )));
                }
                Ok(HyperlightExit::Retry()) => continue,
                Err(e) => {
                    return Err(e);
                }
            }
        }

        Ok(())
    }
}

/// A trait for handling interrupts to a hypervisor's vcpu
pub trait InterruptHandle: Debug + Send + Sync {
    /// Interrupt the corresponding vcpu.
    ///
    /// - If this is called while the vcpu is running, then it will interrupt the vcpu and return `true`.
    /// - If this is called while the vcpu is not running, the vcpu will not immediately be interrupted,
    ///   but will be prevented from running **the next time** it's scheduled, and `false` is returned.
    ///
    /// # Note
    /// This function will block for the duration of the time it takes for the vcpu thread to be interrupted.
    fn kill(&self) -> bool;

    /// Returns true iff the corresponding hypervisor has been disposed or dropped
    fn dropped(&self) -> bool;
}

#[cfg(kvm)]
#[derive(Debug)]
pub(crate) struct LinuxInterruptHandle {
    /// Invariant: vcpu is running => most significant bit (63) of `running` is set. (Neither converse nor inverse is true)
    ///
    /// Additionally, bit 0-62 tracks how many times the VCPU has been run. Incremented each time `run()` is called.
    ///
    /// This prevents an ABA problem where:
    /// 1. The VCPU is running (generation N),
    /// 2. It gets cancelled,
    /// 3. Then quickly restarted (generation N+1),
    ///    before the original thread has observed that it was cancelled.
    ///
    /// Without this generation counter, the interrupt logic might assume the VCPU is still
    /// in the *original* run (generation N), see that it's `running`, and re-send the signal.
    running: AtomicU64,
    /// Invariant: vcpu is running => `tid` is the thread on which it is running.
    tid: AtomicU64,
    /// True when an "interruptor" has requested the VM to be cancelled. Set immediately when
    /// `kill()` is called, and cleared when the run that observed it returns `Cancelled`.
    cancel_requested: AtomicBool,
    /// Whether the corresponding vm is disposed or dropped
    dropped: AtomicBool,
    /// Retry delay between signals sent to the vcpu thread
    retry_delay: Duration,
    /// The offset of the SIGRTMIN signal used to interrupt the vcpu thread
    sig_rt_min_offset: u8,
}

#[cfg(kvm)]
impl LinuxInterruptHandle {
    const RUNNING_BIT: u64 = 1 << 63;
    const MAX_GENERATION: u64 = Self::RUNNING_BIT - 1;

    pub(crate) fn new(retry_delay: Duration, sig_rt_min_offset: u8) -> Self {
        Self {
            running: AtomicU64::new(0),
            tid: AtomicU64::new(0),
            cancel_requested: AtomicBool::new(false),
            dropped: AtomicBool::new(false),
            retry_delay,
            sig_rt_min_offset,
        }
    }

    // record the calling thread as the one that runs the vcpu
    pub(crate) fn set_tid(&self) {
        self.tid
            .store(unsafe { libc::pthread_self() as u64 }, Ordering::Relaxed);
    }

    // set running to true and increment the generation. Generation will wrap around at `MAX_GENERATION`.
    pub(crate) fn set_running_and_increment_generation(&self) -> std::result::Result<u64, u64> {
        self.running
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |raw| {
                let generation = raw & !Self::RUNNING_BIT;
                if generation == Self::MAX_GENERATION {
                    // restart generation from 0
                    return Some(Self::RUNNING_BIT);
                }
                Some((generation + 1) | Self::RUNNING_BIT)
            })
    }

    // clear the running bit and return the generation
    pub(crate) fn clear_running_bit(&self) -> u64 {
        self.running
            .fetch_and(!Self::RUNNING_BIT, Ordering::Relaxed)
    }

    fn get_running_and_generation(&self) -> (bool, u64) {
        let raw = self.running.load(Ordering::Relaxed);
        let running = raw & Self::RUNNING_BIT != 0;
        let generation = raw & !Self::RUNNING_BIT;
        (running, generation)
    }

    pub(crate) fn cancel_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::Relaxed)
    }

    pub(crate) fn clear_cancel_requested(&self) {
        self.cancel_requested.store(false, Ordering::Relaxed);
    }

    pub(crate) fn set_dropped(&self) {
        self.dropped.store(true, Ordering::Relaxed);
    }
}

#[cfg(kvm)]
impl InterruptHandle for LinuxInterruptHandle {
    fn kill(&self) -> bool {
        self.cancel_requested.store(true, Ordering::Relaxed);

        let signal_number = libc::SIGRTMIN() + self.sig_rt_min_offset as libc::c_int;
        let mut sent_signal = false;
        let mut target_generation: Option<u64> = None;

        loop {
            let (running, generation) = self.get_running_and_generation();

            if !running {
                break;
            }

            match target_generation {
                None => target_generation = Some(generation),
                // prevent ABA problem
                Some(expected) if expected != generation => break,
                _ => {}
            }

            log::info!("Sending signal to kill vcpu thread...");
            sent_signal = true;
            unsafe {
                libc::pthread_kill(self.tid.load(Ordering::Relaxed) as _, signal_number);
            }
            std::thread::sleep(self.retry_delay);
        }

        sent_signal
    }

    fn dropped(&self) -> bool {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use log::LevelFilter;

    use super::*;

    #[test]
    fn lifecycle_allows_runs_only_after_initialise() {
        let mut lc = HypervisorLifecycle::new();
        assert!(matches!(
            lc.begin_run("execute_until_halt"),
            Err(HyperlightError::UsageError {
                operation: "execute_until_halt",
                state: HypervisorState::Unconfigured
            })
        ));
        assert_eq!(lc.state(), HypervisorState::Unconfigured);

        lc.begin_initialise().unwrap();
        lc.finish_initialise(Ok(())).unwrap();
        assert_eq!(lc.state(), HypervisorState::Initialised);
        assert!(lc.begin_initialise().is_err());

        lc.begin_run("execute_until_halt").unwrap();
        lc.ensure_running("run").unwrap();
        assert!(lc.ensure_trapped("handle_outb").is_err());
        lc.trapped();
        assert_eq!(lc.state(), HypervisorState::Trapped);
        lc.ensure_trapped("handle_outb").unwrap();
        assert!(lc.ensure_running("run").is_err());
        lc.resumed();
        lc.finish_run(Ok(())).unwrap();
        assert_eq!(lc.state(), HypervisorState::Halted);

        lc.begin_run("dispatch_call_from_host").unwrap();
        assert!(lc.begin_run("dispatch_call_from_host").is_err());
    }

    #[test]
    fn faulted_is_terminal_until_disposed() {
        let mut lc = HypervisorLifecycle::new();
        lc.begin_initialise().unwrap();
        lc.finish_initialise(Ok(())).unwrap();
        lc.begin_run("execute_until_halt").unwrap();
        assert!(lc.finish_run(Err(ExecutionCanceledByHost())).is_err());
        assert_eq!(lc.state(), HypervisorState::Faulted);

        assert!(lc.begin_run("execute_until_halt").is_err());
        assert!(lc.begin_run("dispatch_call_from_host").is_err());
        assert!(lc.begin_initialise().is_err());
        assert_eq!(lc.state(), HypervisorState::Faulted);

        lc.begin_dispose().unwrap();
        assert_eq!(lc.state(), HypervisorState::Disposed);
        assert!(matches!(
            lc.begin_dispose(),
            Err(HyperlightError::UsageError {
                operation: "dispose",
                state: HypervisorState::Disposed
            })
        ));
    }

    #[test]
    fn failed_initialise_faults() {
        let mut lc = HypervisorLifecycle::new();
        lc.begin_initialise().unwrap();
        assert!(lc
            .finish_initialise(Err(HyperlightError::HypervisorSetupFailure(
                "no".to_string()
            )))
            .is_err());
        assert_eq!(lc.state(), HypervisorState::Faulted);
    }

    #[test]
    fn guest_log_level_from_rust_log() {
        assert_eq!(max_log_level_from(""), LevelFilter::Error);
        assert_eq!(max_log_level_from("debug"), LevelFilter::Debug);
        assert_eq!(
            max_log_level_from("hyperlight_vcpu=warn,hyperlight_guest=trace"),
            LevelFilter::Trace
        );
        assert_eq!(
            max_log_level_from("info,hyperlight_vcpu=warn"),
            LevelFilter::Warn
        );
        assert_eq!(max_log_level_from("other=debug"), LevelFilter::Error);
        assert_eq!(max_log_level_from("nonsense"), LevelFilter::Error);
    }

    #[cfg(kvm)]
    #[test]
    fn kill_when_not_running_only_requests_cancel() {
        let handle = LinuxInterruptHandle::new(std::time::Duration::from_micros(1), 0);
        assert!(!handle.kill());
        assert!(handle.cancel_requested());
        handle.clear_cancel_requested();
        assert!(!handle.cancel_requested());
        assert!(!handle.dropped());
        handle.set_dropped();
        assert!(handle.dropped());
    }

    #[cfg(kvm)]
    #[test]
    fn generation_advances_each_run() {
        let handle = LinuxInterruptHandle::new(std::time::Duration::from_micros(1), 0);
        handle.set_running_and_increment_generation().unwrap();
        assert_eq!(handle.get_running_and_generation(), (true, 1));
        handle.clear_running_bit();
        assert_eq!(handle.get_running_and_generation(), (false, 1));
        handle.set_running_and_increment_generation().unwrap();
        assert_eq!(handle.get_running_and_generation(), (true, 2));
    }
}
