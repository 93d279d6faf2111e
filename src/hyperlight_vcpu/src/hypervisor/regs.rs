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

#[cfg(kvm)]
pub(crate) const FP_CONTROL_WORD_DEFAULT: u16 = 0x37f; // mask all fp-exception, set rounding to nearest, set precision to 64-bit
#[cfg(kvm)]
pub(crate) const FP_TAG_WORD_DEFAULT: u8 = 0xff; // each 8 of x87 fpu registers is empty
#[cfg(kvm)]
pub(crate) const MXCSR_DEFAULT: u32 = 0x1f80; // mask simd fp-exceptions, clear exception flags, set rounding to nearest, disable flush-to-zero mode, disable denormals-are-zero mode

/// Reserved bit 1 of RFLAGS, which always reads as set
pub const RFLAGS_RESERVED: u64 = 1 << 1;

/// The general purpose registers every backend programs, at the guest entry
/// point and when dispatching a call from the host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommonRegisters {
    /// Instruction pointer
    pub rip: u64,
    /// Stack pointer
    pub rsp: u64,
    /// Flags
    pub rflags: u64,
    /// Accumulator, `al` is the value of an `out`
    pub rax: u64,
    /// First argument of the entry point: the parameter block address
    pub rcx: u64,
    /// Second argument: the random seed. `dx` is the port of `out dx, al`.
    pub rdx: u64,
    /// Third argument: the page size
    pub r8: u64,
    /// Fourth argument: the guest's max log level
    pub r9: u64,
}

impl CommonRegisters {
    /// The registers the guest entry point is called with, following the
    /// Windows x64 calling convention.
    pub fn for_entry(
        entrypoint: u64,
        rsp: u64,
        peb_addr: u64,
        seed: u64,
        page_size: u32,
        max_log_level: u32,
    ) -> Self {
        Self {
            rip: entrypoint,
            rsp,
            rflags: RFLAGS_RESERVED,
            rcx: peb_addr,
            rdx: seed,
            r8: page_size.into(),
            r9: max_log_level.into(),
            ..Default::default()
        }
    }

    /// The registers a dispatched call starts with: everything reset except
    /// the stack pointer.
    pub fn for_dispatch(dispatch_func_addr: u64, rsp: u64) -> Self {
        Self {
            rip: dispatch_func_addr,
            rsp,
            rflags: RFLAGS_RESERVED,
            ..Default::default()
        }
    }
}

#[cfg(kvm)]
impl From<CommonRegisters> for kvm_bindings::kvm_regs {
    fn from(regs: CommonRegisters) -> Self {
        kvm_bindings::kvm_regs {
            rip: regs.rip,
            rsp: regs.rsp,
            rflags: regs.rflags,
            rax: regs.rax,
            rcx: regs.rcx,
            rdx: regs.rdx,
            r8: regs.r8,
            r9: regs.r9,
            ..Default::default()
        }
    }
}

#[cfg(kvm)]
impl From<&kvm_bindings::kvm_regs> for CommonRegisters {
    fn from(regs: &kvm_bindings::kvm_regs) -> Self {
        Self {
            rip: regs.rip,
            rsp: regs.rsp,
            rflags: regs.rflags,
            rax: regs.rax,
            rcx: regs.rcx,
            rdx: regs.rdx,
            r8: regs.r8,
            r9: regs.r9,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_registers_follow_the_calling_convention() {
        let regs = CommonRegisters::for_entry(0x1000, 0x2000, 0x3000, 42, 4096, 3);
        assert_eq!(regs.rip, 0x1000);
        assert_eq!(regs.rsp, 0x2000);
        assert_eq!(regs.rcx, 0x3000);
        assert_eq!(regs.rdx, 42);
        assert_eq!(regs.r8, 4096);
        assert_eq!(regs.r9, 3);
        assert_eq!(regs.rflags, RFLAGS_RESERVED);
        assert_eq!(regs.rax, 0);
    }

    #[test]
    fn dispatch_registers_keep_only_the_stack() {
        let regs = CommonRegisters::for_dispatch(0x1800, 0x1ff0);
        assert_eq!(
            regs,
            CommonRegisters {
                rip: 0x1800,
                rsp: 0x1ff0,
                rflags: RFLAGS_RESERVED,
                ..Default::default()
            }
        );
    }
}
