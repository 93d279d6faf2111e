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

//! A backend that needs no hypervisor. It interprets guest code straight
//! out of guest memory, one instruction at a time, with guest physical
//! addresses used as virtual addresses. Only the handful of instructions
//! needed to halt, jump and write to a port are understood:
//!
//! | bytes              | instruction            |
//! |--------------------|------------------------|
//! | `90`               | `nop`                  |
//! | `F4`               | `hlt`                  |
//! | `B0 ib`            | `mov al, imm8`         |
//! | `66 B8 iw`, `B8 id`| `mov ax/eax, imm`      |
//! | `66 BA iw`, `BA id`| `mov dx/edx, imm`      |
//! | `FE C0`, `FE C8`   | `inc al`, `dec al`     |
//! | `E6 ib`            | `out imm8, al`         |
//! | `EE`               | `out dx, al`           |
//! | `EB cb`, `E9 cd`   | `jmp rel8/rel32`       |
//! | `0F 0B`            | `ud2`                  |
//!
//! Anything else stops the guest with an unknown exit.

use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{instrument, Span};

use super::available::HypervisorParams;
use super::handlers::{call_outb_handler, OutBHandlerWrapper};
use super::regs::CommonRegisters;
use super::{HyperlightExit, Hypervisor, HypervisorLifecycle, InterruptHandle, VirtualCPU};
use crate::config::HypervisorConfig;
use crate::correlation::CorrelationId;
use crate::mem::memory_region::{GuestMemoryRegion, MemoryRegionFlags};
use crate::mem::ptr::RawPtr;
use crate::{new_error, Result};

/// Interrupts an emulated vCPU by raising a flag it checks before every instruction
#[derive(Debug, Default)]
pub(crate) struct EmulatedInterruptHandle {
    running: AtomicBool,
    cancel_requested: AtomicBool,
    dropped: AtomicBool,
}

impl EmulatedInterruptHandle {
    // consume a pending cancel request
    fn take_cancel_request(&self) -> bool {
        self.cancel_requested.swap(false, Ordering::Relaxed)
    }
}

impl InterruptHandle for EmulatedInterruptHandle {
    fn kill(&self) -> bool {
        self.cancel_requested.store(true, Ordering::Relaxed);
        self.running.load(Ordering::Relaxed)
    }

    fn dropped(&self) -> bool {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// The address of the byte an instruction fetch could not read
struct FetchFault(u64);

/// Reads instruction bytes sequentially from guest memory
struct Fetcher<'a> {
    memory: &'a GuestMemoryRegion,
    next: u64,
}

impl Fetcher<'_> {
    fn u8(&mut self) -> std::result::Result<u8, FetchFault> {
        let byte = self
            .memory
            .read_u8(self.next)
            .map_err(|_| FetchFault(self.next))?;
        self.next = self.next.wrapping_add(1);
        Ok(byte)
    }

    fn u16(&mut self) -> std::result::Result<u16, FetchFault> {
        Ok(u16::from_le_bytes([self.u8()?, self.u8()?]))
    }

    fn u32(&mut self) -> std::result::Result<u32, FetchFault> {
        Ok(u32::from_le_bytes([
            self.u8()?,
            self.u8()?,
            self.u8()?,
            self.u8()?,
        ]))
    }
}

#[derive(Debug)]
struct EmulatedVcpu {
    regs: CommonRegisters,
}

impl EmulatedVcpu {
    fn al(&self) -> u8 {
        self.regs.rax as u8
    }

    fn set_al(&mut self, al: u8) {
        self.regs.rax = (self.regs.rax & !0xff) | u64::from(al);
    }

    /// Execute the instruction at rip. Returns the exit it caused, if any.
    fn step(&mut self, memory: &GuestMemoryRegion) -> Option<HyperlightExit> {
        let rip = self.regs.rip;
        let mut fetch = Fetcher { memory, next: rip };
        match self.execute(&mut fetch) {
            Ok(exit) => {
                if !matches!(exit, Some(HyperlightExit::Unknown(_))) {
                    self.regs.rip = fetch.next;
                }
                exit
            }
            Err(FetchFault(addr)) => Some(HyperlightExit::Mmio(addr)),
        }
    }

    fn execute(
        &mut self,
        fetch: &mut Fetcher<'_>,
    ) -> std::result::Result<Option<HyperlightExit>, FetchFault> {
        let rip = fetch.next;
        let unsupported = |bytes: &[u8]| {
            Some(HyperlightExit::Unknown(format!(
                "unsupported instruction {:02x?} at rip {:#x}",
                bytes, rip
            )))
        };

        let exit = match fetch.u8()? {
            0x90 => None,
            0xF4 => Some(HyperlightExit::Halt()),
            0xB0 => {
                let imm = fetch.u8()?;
                self.set_al(imm);
                None
            }
            // 32 bit moves zero the upper half of the register
            0xB8 => {
                self.regs.rax = u64::from(fetch.u32()?);
                None
            }
            0xBA => {
                self.regs.rdx = u64::from(fetch.u32()?);
                None
            }
            0x66 => match fetch.u8()? {
                0xB8 => {
                    self.regs.rax = (self.regs.rax & !0xffff) | u64::from(fetch.u16()?);
                    None
                }
                0xBA => {
                    self.regs.rdx = (self.regs.rdx & !0xffff) | u64::from(fetch.u16()?);
                    None
                }
                other => unsupported(&[0x66, other]),
            },
            0xFE => match fetch.u8()? {
                0xC0 => {
                    self.set_al(self.al().wrapping_add(1));
                    None
                }
                0xC8 => {
                    self.set_al(self.al().wrapping_sub(1));
                    None
                }
                other => unsupported(&[0xFE, other]),
            },
            0xE6 => {
                let port = u16::from(fetch.u8()?);
                Some(HyperlightExit::IoOut(port, vec![self.al()]))
            }
            0xEE => Some(HyperlightExit::IoOut(self.regs.rdx as u16, vec![self.al()])),
            0xEB => {
                let rel = fetch.u8()? as i8;
                fetch.next = fetch.next.wrapping_add_signed(i64::from(rel));
                None
            }
            0xE9 => {
                let rel = fetch.u32()? as i32;
                fetch.next = fetch.next.wrapping_add_signed(i64::from(rel));
                None
            }
            0x0F => match fetch.u8()? {
                0x0B => Some(HyperlightExit::Unknown(format!(
                    "invalid opcode (ud2) at rip {:#x}",
                    rip
                ))),
                other => unsupported(&[0x0F, other]),
            },
            other => unsupported(&[other]),
        };
        Ok(exit)
    }
}

/// A hypervisor backend that emulates the vCPU in software.
///
/// It makes no native calls, so it works everywhere and behaves the same
/// everywhere. It is what `new_hypervisor` falls back to when no hypervisor
/// is present.
pub struct EmulatedDriver {
    memory: GuestMemoryRegion,
    entrypoint: u64,
    orig_rsp: u64,
    peb_addr: RawPtr,
    outb_handler: OutBHandlerWrapper,
    config: HypervisorConfig,
    correlation_id: CorrelationId,
    lifecycle: HypervisorLifecycle,
    vcpu: Option<EmulatedVcpu>,
    interrupt_handle: Arc<EmulatedInterruptHandle>,
}

impl EmulatedDriver {
    /// Create a new `EmulatedDriver`. Nothing is set up until `initialise`.
    #[instrument(skip_all, parent = Span::current(), level = "Trace")]
    pub fn new(params: HypervisorParams) -> Self {
        Self {
            memory: params.memory,
            entrypoint: params.entrypoint,
            orig_rsp: params.rsp,
            peb_addr: params.peb_addr,
            outb_handler: params.outb_handler,
            config: params.config,
            correlation_id: params.correlation_id,
            lifecycle: HypervisorLifecycle::new(),
            vcpu: None,
            interrupt_handle: Arc::new(EmulatedInterruptHandle::default()),
        }
    }

    /// The vCPU's registers, `None` before `initialise` and after `dispose`
    pub fn registers(&self) -> Option<CommonRegisters> {
        self.vcpu.as_ref().map(|vcpu| vcpu.regs)
    }

    fn vcpu_mut(&mut self) -> Result<&mut EmulatedVcpu> {
        self.vcpu
            .as_mut()
            .ok_or_else(|| new_error!("emulated vCPU has not been created"))
    }

    fn run_and_reset_stack(&mut self) -> Result<()> {
        VirtualCPU::run(self.as_mut_hypervisor())?;
        // reset RSP to what it was before the run
        let orig_rsp = self.orig_rsp;
        self.vcpu_mut()?.regs.rsp = orig_rsp;
        Ok(())
    }

    fn dispatch(&mut self, dispatch_func_addr: RawPtr) -> Result<()> {
        // Reset general purpose registers except RSP, then set RIP
        let rsp_before = self.vcpu_mut()?.regs.rsp;
        self.vcpu_mut()?.regs = CommonRegisters::for_dispatch(dispatch_func_addr.into(), rsp_before);

        VirtualCPU::run(self.as_mut_hypervisor())?;

        // reset RSP to what it was before function call
        self.vcpu_mut()?.regs.rsp = rsp_before;
        Ok(())
    }
}

impl Debug for EmulatedDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Emulated Driver")
            .field("Correlation Id", &self.correlation_id)
            .field("State", &self.lifecycle.state())
            .field("Memory Region", &self.memory)
            .field("Entrypoint", &format_args!("{:#x}", self.entrypoint))
            .field("Registers", &self.registers())
            .finish()
    }
}

impl Hypervisor for EmulatedDriver {
    #[instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace", fields(correlation_id = %self.correlation_id))]
    fn initialise(&mut self) -> Result<()> {
        self.lifecycle.begin_initialise()?;
        #[cfg(feature = "build-metadata")]
        crate::log_build_details();

        let regs = CommonRegisters::for_entry(
            self.entrypoint,
            self.orig_rsp,
            self.peb_addr.into(),
            self.config.get_seed(),
            self.config.get_page_size(),
            self.get_max_log_level(),
        );
        self.vcpu = Some(EmulatedVcpu { regs });
        self.lifecycle.finish_initialise(Ok(()))
    }

    #[instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace", fields(correlation_id = %self.correlation_id))]
    fn execute_until_halt(&mut self) -> Result<()> {
        self.lifecycle.begin_run("execute_until_halt")?;
        let result = self.run_and_reset_stack();
        self.lifecycle.finish_run(result)
    }

    #[instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace", fields(correlation_id = %self.correlation_id))]
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
        self.vcpu = None;
        self.interrupt_handle.dropped.store(true, Ordering::Relaxed);
        Ok(())
    }

    #[instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace")]
    fn run(&mut self) -> Result<HyperlightExit> {
        self.lifecycle.ensure_running("run")?;
        let memory = self.memory;
        self.interrupt_handle.running.store(true, Ordering::Relaxed);

        let exit = loop {
            if self.interrupt_handle.take_cancel_request() {
                break HyperlightExit::Cancelled();
            }
            let rip = self.vcpu_mut()?.regs.rip;
            if let Some(violation) =
                self.get_memory_access_violation(rip, &memory, MemoryRegionFlags::EXECUTE)
            {
                break violation;
            }
            if let Some(exit) = self.vcpu_mut()?.step(&memory) {
                break exit;
            }
        };

        self.interrupt_handle.running.store(false, Ordering::Relaxed);
        crate::debug!("Emulated vCPU exit: {:?}", exit);
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
        &self.correlation_id
    }

    #[instrument(skip_all, parent = Span::current(), level = "Trace")]
    fn as_mut_hypervisor(&mut self) -> &mut dyn Hypervisor {
        self as &mut dyn Hypervisor
    }
}

impl Drop for EmulatedDriver {
    fn drop(&mut self) {
        self.interrupt_handle.dropped.store(true, Ordering::Relaxed);
    }
}
