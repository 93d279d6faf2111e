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

use std::fmt::Debug;
use std::sync::Arc;

use kvm_bindings::{
    kvm_fpu, kvm_regs, kvm_run, kvm_sregs, kvm_userspace_memory_region, KVM_API_VERSION,
    KVM_CAP_USER_MEMORY, KVM_EXIT_FAIL_ENTRY, KVM_EXIT_HLT, KVM_EXIT_INTERNAL_ERROR, KVM_EXIT_IO,
    KVM_EXIT_IO_OUT, KVM_EXIT_MMIO, KVM_EXIT_SHUTDOWN, KVM_MEM_READONLY,
};
use libc::c_int;
use tracing::{instrument, Span};

use super::available::HypervisorParams;
use super::handlers::{call_outb_handler, OutBHandlerWrapper};
use super::kvm_sys::{KvmFd, KvmRunMapping, KvmSys, SystemKvm};
use super::regs::{
    CommonRegisters, FP_CONTROL_WORD_DEFAULT, FP_TAG_WORD_DEFAULT, MXCSR_DEFAULT,
};
use super::{
    HyperlightExit, Hypervisor, HypervisorLifecycle, InterruptHandle, LinuxInterruptHandle,
    VirtualCPU, CR0_AM, CR0_ET, CR0_MP, CR0_NE, CR0_PE, CR0_PG, CR0_WP, CR4_OSFXSR,
    CR4_OSXMMEXCPT, CR4_PAE, EFER_LMA, EFER_LME, EFER_NX, EFER_SCE,
};
use crate::config::HypervisorConfig;
use crate::correlation::CorrelationId;
use crate::error::HyperlightError::HypervisorSetupFailure;
use crate::mem::memory_region::{GuestMemoryRegion, MemoryRegionFlags};
use crate::mem::ptr::RawPtr;
use crate::native_call::{NativeCallVerifier, NativeOutcome};
use crate::{log_then_return, new_error, Result};

/// Check that KVM is usable on this host: `/dev/kvm` opens, speaks API
/// version 12 and supports user memory regions.
#[instrument(skip_all, parent = Span::current(), level = "Trace")]
pub(crate) fn is_hypervisor_present(sys: Arc<dyn KvmSys>) -> bool {
    let verifier = NativeCallVerifier::new(CorrelationId::from("kvm-probe")).without_reporting();
    let probe = || -> Result<()> {
        let kvm = KvmFd::new(
            verifier.verify_non_negative("OpenKVM", || sys.open_kvm())?,
            sys.clone(),
            verifier.clone(),
        );
        verifier.verify(
            "GetAPIVersion",
            || sys.get_api_version(kvm.raw()),
            KVM_API_VERSION as c_int,
        )?;
        verifier.verify_with(
            "CheckExtension",
            || sys.check_extension(kvm.raw(), KVM_CAP_USER_MEMORY),
            |supported| supported > 0,
        )?;
        Ok(())
    };
    match probe() {
        Ok(()) => true,
        Err(e) => {
            log::info!("KVM is not available on this system: {}", e);
            false
        }
    }
}

/// What `initialise` creates, declared in the order it is released
#[derive(Debug)]
struct KvmResources {
    run: KvmRunMapping,
    vcpu: KvmFd,
    _vm: KvmFd,
    _kvm: KvmFd,
}

/// A Hypervisor driver for KVM on Linux
pub(crate) struct KVMDriver {
    sys: Arc<dyn KvmSys>,
    verifier: NativeCallVerifier,
    memory: GuestMemoryRegion,
    entrypoint: u64,
    orig_rsp: u64,
    peb_addr: RawPtr,
    outb_handler: OutBHandlerWrapper,
    config: HypervisorConfig,
    lifecycle: HypervisorLifecycle,
    resources: Option<KvmResources>,
    interrupt_handle: Arc<LinuxInterruptHandle>,
}

impl KVMDriver {
    /// Create a new `KVMDriver`. No call is made to KVM until `initialise`.
    #[instrument(skip_all, parent = Span::current(), level = "Trace")]
    pub(crate) fn new(params: HypervisorParams) -> Self {
        Self::with_sys(params, Arc::new(SystemKvm))
    }

    pub(crate) fn with_sys(params: HypervisorParams, sys: Arc<dyn KvmSys>) -> Self {
        let interrupt_handle = Arc::new(LinuxInterruptHandle::new(
            params.config.get_interrupt_retry_delay(),
            params.config.get_interrupt_vcpu_sigrtmin_offset(),
        ));
        Self {
            sys,
            verifier: NativeCallVerifier::new(params.correlation_id),
            memory: params.memory,
            entrypoint: params.entrypoint,
            orig_rsp: params.rsp,
            peb_addr: params.peb_addr,
            outb_handler: params.outb_handler,
            config: params.config,
            lifecycle: HypervisorLifecycle::new(),
            resources: None,
            interrupt_handle,
        }
    }

    fn vcpu_fd(&self) -> Result<c_int> {
        self.resources
            .as_ref()
            .map(|resources| resources.vcpu.raw())
            .ok_or_else(|| new_error!("KVM vCPU has not been created"))
    }

    fn create_resources(&self) -> Result<KvmResources> {
        crate::signal_handlers::setup_signal_handlers(&self.config)?;

        let page_size = page_size::get();
        if !self.memory.is_page_aligned(page_size) {
            log_then_return!(HypervisorSetupFailure(format!(
                "guest memory at {:p} of size {:#x} is not aligned to the page size {:#x}",
                self.memory.host_base(),
                self.memory.size(),
                page_size
            )));
        }

        let sys = &self.sys;
        let verifier = &self.verifier;
        let owned = |fd: c_int| KvmFd::new(fd, sys.clone(), verifier.clone());

        let kvm = owned(verifier.verify_non_negative("OpenKVM", || sys.open_kvm())?);
        verifier.verify(
            "GetAPIVersion",
            || sys.get_api_version(kvm.raw()),
            KVM_API_VERSION as c_int,
        )?;
        verifier.verify_with(
            "CheckExtension",
            || sys.check_extension(kvm.raw(), KVM_CAP_USER_MEMORY),
            |supported| supported > 0,
        )?;
        let run_size = verifier.verify_with(
            "GetVCPUMMapSize",
            || sys.get_vcpu_mmap_size(kvm.raw()),
            |size| size > 0,
        )?;

        let vm = owned(verifier.verify_non_negative("CreateVM", || sys.create_vm(kvm.raw()))?);
        let region = kvm_userspace_memory_region {
            slot: 0,
            flags: if self.memory.flags().contains(MemoryRegionFlags::WRITE) {
                0
            } else {
                KVM_MEM_READONLY
            },
            guest_phys_addr: self.memory.guest_base(),
            memory_size: u64::try_from(self.memory.size())?,
            userspace_addr: self.memory.host_base() as u64,
        };
        verifier.verify(
            "SetUserMemoryRegion",
            || sys.set_user_memory_region(vm.raw(), &region),
            0,
        )?;

        let vcpu = owned(verifier.verify_non_negative("CreateVCPU", || sys.create_vcpu(vm.raw(), 0))?);
        let run = KvmRunMapping::new(
            &vcpu,
            usize::try_from(run_size)?,
            sys.clone(),
            verifier.clone(),
        )?;

        self.setup_initial_sregs(&vcpu)?;

        let regs: kvm_regs = CommonRegisters::for_entry(
            self.entrypoint,
            self.orig_rsp,
            self.peb_addr.into(),
            self.config.get_seed(),
            self.config.get_page_size(),
            self.get_max_log_level(),
        )
        .into();
        verifier.verify("SetRegs", || sys.set_regs(vcpu.raw(), &regs), 0)?;

        Ok(KvmResources {
            run,
            vcpu,
            _vm: vm,
            _kvm: kvm,
        })
    }

    fn setup_initial_sregs(&self, vcpu: &KvmFd) -> Result<()> {
        // setup paging and IA-32e (64-bit) mode
        let mut sregs = kvm_sregs::default();
        self.verifier
            .verify("GetSRegs", || self.sys.get_sregs(vcpu.raw(), &mut sregs), 0)?;
        sregs.cr3 = self.config.get_pml4_addr();
        sregs.cr4 = CR4_PAE | CR4_OSFXSR | CR4_OSXMMEXCPT;
        sregs.cr0 = CR0_PE | CR0_MP | CR0_ET | CR0_NE | CR0_AM | CR0_PG | CR0_WP;
        sregs.efer = EFER_LME | EFER_LMA | EFER_SCE | EFER_NX;
        sregs.cs.l = 1; // required for 64-bit mode
        self.verifier
            .verify("SetSRegs", || self.sys.set_sregs(vcpu.raw(), &sregs), 0)?;
        Ok(())
    }

    fn get_regs(&self) -> Result<kvm_regs> {
        let vcpu = self.vcpu_fd()?;
        let mut regs = kvm_regs::default();
        self.verifier
            .verify("GetRegs", || self.sys.get_regs(vcpu, &mut regs), 0)?;
        Ok(regs)
    }

    fn set_regs(&self, regs: &kvm_regs) -> Result<()> {
        let vcpu = self.vcpu_fd()?;
        self.verifier
            .verify("SetRegs", || self.sys.set_regs(vcpu, regs), 0)?;
        Ok(())
    }

    fn set_rsp(&self, rsp: u64) -> Result<()> {
        let mut regs = self.get_regs()?;
        regs.rsp = rsp;
        self.set_regs(&regs)
    }

    fn run_and_reset_stack(&mut self) -> Result<()> {
        VirtualCPU::run(self.as_mut_hypervisor())?;
        // reset RSP to what it was before the run
        self.set_rsp(self.orig_rsp)
    }

    fn dispatch(&mut self, dispatch_func_addr: RawPtr) -> Result<()> {
        // Reset general purpose registers except RSP, then set RIP
        let rsp_before = self.get_regs()?.rsp;
        let regs: kvm_regs =
            CommonRegisters::for_dispatch(dispatch_func_addr.into(), rsp_before).into();
        self.set_regs(&regs)?;

        // reset fpu state
        let fpu = kvm_fpu {
            fcw: FP_CONTROL_WORD_DEFAULT,
            ftwx: FP_TAG_WORD_DEFAULT,
            mxcsr: MXCSR_DEFAULT,
            ..Default::default() // zero out the rest
        };
        let vcpu = self.vcpu_fd()?;
        self.verifier
            .verify("SetFPU", || self.sys.set_fpu(vcpu, &fpu), 0)?;

        VirtualCPU::run(self.as_mut_hypervisor())?;

        // reset RSP to what it was before function call
        self.set_rsp(rsp_before)
    }

    /// Translate the exit recorded in `kvm_run` after a successful `KVM_RUN`
    fn decode_exit(&self, run: *mut kvm_run) -> HyperlightExit {
        // SAFETY: `run` is the live mapping owned by `self.resources`
        let run_ref = unsafe { &*run };
        match run_ref.exit_reason {
            KVM_EXIT_HLT => HyperlightExit::Halt(),
            KVM_EXIT_IO => {
                let io = unsafe { run_ref.__bindgen_anon_1.io };
                if u32::from(io.direction) != KVM_EXIT_IO_OUT {
                    return HyperlightExit::Unknown(format!(
                        "port read on port {:#x}",
                        io.port
                    ));
                }
                let len = usize::from(io.size) * io.count as usize;
                // SAFETY: KVM places the data inside the mapping, at data_offset
                let data = unsafe {
                    std::slice::from_raw_parts(
                        run.cast::<u8>().add(io.data_offset as usize),
                        len,
                    )
                };
                HyperlightExit::IoOut(io.port, data.to_vec())
            }
            KVM_EXIT_MMIO => {
                let mmio = unsafe { run_ref.__bindgen_anon_1.mmio };
                let gpa = mmio.phys_addr;
                let access = if mmio.is_write != 0 {
                    MemoryRegionFlags::WRITE
                } else {
                    MemoryRegionFlags::READ
                };
                crate::debug!("KVM MMIO {} at {:#x}", access, gpa);
                self.get_memory_access_violation(gpa, &self.memory, access)
                    .unwrap_or(HyperlightExit::Mmio(gpa))
            }
            KVM_EXIT_SHUTDOWN => HyperlightExit::Unknown("shutdown (triple fault)".to_string()),
            KVM_EXIT_FAIL_ENTRY => {
                let reason = unsafe { run_ref.__bindgen_anon_1.fail_entry }
                    .hardware_entry_failure_reason;
                HyperlightExit::Unknown(format!("failed entry, hardware reason {:#x}", reason))
            }
            KVM_EXIT_INTERNAL_ERROR => {
                let suberror = unsafe { run_ref.__bindgen_anon_1.internal }.suberror;
                HyperlightExit::Unknown(format!("internal error, suberror {}", suberror))
            }
            other => HyperlightExit::Unknown(format!("exit reason {}", other)),
        }
    }
}

impl Debug for KVMDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut f = f.debug_struct("KVM Driver");
        f.field("Correlation Id", self.verifier.correlation_id())
            .field("State", &self.lifecycle.state())
            .field("Memory Region", &self.memory);

        // registers are only available while the vCPU exists
        if let Some(resources) = &self.resources {
            let mut regs = kvm_regs::default();
            if self.sys.get_regs(resources.vcpu.raw(), &mut regs) == 0 {
                f.field("Registers", &CommonRegisters::from(&regs));
            }
        }

        f.finish()
    }
}

impl Hypervisor for KVMDriver {
    #[instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace", fields(correlation_id = %self.verifier.correlation_id()))]
    fn initialise(&mut self) -> Result<()> {
        self.lifecycle.begin_initialise()?;
        #[cfg(feature = "build-metadata")]
        crate::log_build_details();

        // on failure the resources created so far are released by their Drop
        let result = self
            .create_resources()
            .map(|resources| self.resources = Some(resources));
        self.lifecycle.finish_initialise(result)
    }

    #[instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace", fields(correlation_id = %self.verifier.correlation_id()))]
    fn execute_until_halt(&mut self) -> Result<()> {
        self.lifecycle.begin_run("execute_until_halt")?;
        let result = self.run_and_reset_stack();
        self.lifecycle.finish_run(result)
    }

    #[instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace", fields(correlation_id = %self.verifier.correlation_id()))]
    fn dispatch_call_from_host(&mut self, dispatch_func_addr: RawPtr) -> Result<()> {
        self.lifecycle.begin_run("dispatch_call_from_host")?;
        let result = self.dispatch(dispatch_func_addr);
        self.lifecycle.finish_run(result)
    }

    #[instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace")]
    fn handle_outb(&mut self, port: u16, value: u8) -> Result<()> {
        self.lifecycle.ensure_trapped("handle_outb")?;
        call_outb_handler(&self.outb_handler, port, value)
    }

    #[instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace")]
    fn dispose(&mut self) -> Result<()> {
        self.lifecycle.begin_dispose()?;
        // unmaps kvm_run and closes the vCPU, VM and KVM descriptors
        self.resources = None;
        self.interrupt_handle.set_dropped();
        Ok(())
    }

    #[instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace")]
    fn run(&mut self) -> Result<HyperlightExit> {
        self.lifecycle.ensure_running("run")?;
        let (vcpu, run) = match &self.resources {
            Some(resources) => (resources.vcpu.raw(), resources.run.as_ptr()),
            None => return Err(new_error!("KVM vCPU has not been created")),
        };

        self.interrupt_handle.set_tid();
        self.interrupt_handle
            .set_running_and_increment_generation()
            .map_err(|e| new_error!("Error setting running state: {}", e))?;
        // Don't run the vcpu if `cancel_requested` is true
        let outcome = if self.interrupt_handle.cancel_requested() {
            None
        } else {
            Some(self.verifier.verify_interruptible(
                "RunVCPU",
                || self.sys.run(vcpu),
                0,
                &[libc::EINTR, libc::EAGAIN],
            ))
        };
        let cancel_requested = self.interrupt_handle.cancel_requested();
        // Note: if a `kill()` call is made right here, the signal may arrive
        // after KVM_RUN has returned. The handler ignores it and the next
        // run starts a new generation, so the stale signal is harmless.
        self.interrupt_handle.clear_running_bit();

        let exit = match outcome {
            None => {
                self.interrupt_handle.clear_cancel_requested();
                HyperlightExit::Cancelled()
            }
            Some(Ok(NativeOutcome::Completed(_))) => self.decode_exit(run),
            Some(Ok(NativeOutcome::Interrupted { os_error, .. })) => {
                // EINTR is only a cancellation if one was asked for, otherwise
                // some other signal interrupted KVM_RUN and it is resumed
                if os_error == libc::EINTR && cancel_requested {
                    self.interrupt_handle.clear_cancel_requested();
                    HyperlightExit::Cancelled()
                } else {
                    HyperlightExit::Retry()
                }
            }
            Some(Err(e)) => return Err(e),
        };
        Ok(exit)
    }

    fn lifecycle(&self) -> &HypervisorLifecycle {
        &self.lifecycle
    }

    fn lifecycle_mut(&mut self) -> &mut HypervisorLifecycle {
        &mut self.lifecycle
    }

    fn interrupt_handle(&self) -> Arc<dyn InterruptHandle> {
        self.interrupt_handle.clone()
    }

    fn correlation_id(&self) -> &CorrelationId {
        self.verifier.correlation_id()
    }

    #[instrument(skip_all, parent = Span::current(), level = "Trace")]
    fn as_mut_hypervisor(&mut self) -> &mut dyn Hypervisor {
        self as &mut dyn Hypervisor
    }
}

impl Drop for KVMDriver {
    fn drop(&mut self) {
        self.interrupt_handle.set_dropped();
    }
}
