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

//! Every call the KVM backend makes into the kernel goes through [`KvmSys`].
//! Methods return the raw status of the underlying syscall, untouched, so
//! that the caller can hand it to a [`NativeCallVerifier`].

use std::fmt::Debug;
use std::os::fd::BorrowedFd;
use std::ptr::NonNull;
use std::sync::Arc;

use kvm_bindings::{
    kvm_fpu, kvm_regs, kvm_run, kvm_sregs, kvm_userspace_memory_region, KVMIO,
};
use libc::{c_int, c_ulong};
use vmm_sys_util::ioctl::{ioctl, ioctl_with_mut_ref, ioctl_with_ref, ioctl_with_val};
use vmm_sys_util::{ioctl_io_nr, ioctl_ior_nr, ioctl_iow_nr};

use crate::native_call::NativeCallVerifier;

ioctl_io_nr!(KVM_GET_API_VERSION, KVMIO, 0x00);
ioctl_io_nr!(KVM_CREATE_VM, KVMIO, 0x01);
ioctl_io_nr!(KVM_CHECK_EXTENSION, KVMIO, 0x03);
ioctl_io_nr!(KVM_GET_VCPU_MMAP_SIZE, KVMIO, 0x04);
ioctl_io_nr!(KVM_CREATE_VCPU, KVMIO, 0x41);
ioctl_iow_nr!(
    KVM_SET_USER_MEMORY_REGION,
    KVMIO,
    0x46,
    kvm_userspace_memory_region
);
ioctl_io_nr!(KVM_RUN, KVMIO, 0x80);
ioctl_ior_nr!(KVM_GET_REGS, KVMIO, 0x81, kvm_regs);
ioctl_iow_nr!(KVM_SET_REGS, KVMIO, 0x82, kvm_regs);
ioctl_ior_nr!(KVM_GET_SREGS, KVMIO, 0x83, kvm_sregs);
ioctl_iow_nr!(KVM_SET_SREGS, KVMIO, 0x84, kvm_sregs);
ioctl_iow_nr!(KVM_SET_FPU, KVMIO, 0x8d, kvm_fpu);

/// The raw interface to `/dev/kvm`.
///
/// Every method returns whatever the syscall returned. Nothing is checked
/// here and nothing is retried.
pub(crate) trait KvmSys: Debug + Send + Sync {
    fn open_kvm(&self) -> c_int;
    fn get_api_version(&self, kvm: c_int) -> c_int;
    fn check_extension(&self, kvm: c_int, capability: u32) -> c_int;
    fn get_vcpu_mmap_size(&self, kvm: c_int) -> c_int;
    fn create_vm(&self, kvm: c_int) -> c_int;
    fn set_user_memory_region(&self, vm: c_int, region: &kvm_userspace_memory_region) -> c_int;
    fn create_vcpu(&self, vm: c_int, id: u64) -> c_int;
    /// Map the vCPU's `kvm_run` structure. Returns the address, or
    /// `MAP_FAILED` as an integer.
    fn map_run(&self, vcpu: c_int, size: usize) -> isize;
    /// # Safety
    /// `run` must have been returned by `map_run` with the same `size` and
    /// must not be used afterwards.
    unsafe fn unmap_run(&self, run: *mut kvm_run, size: usize) -> c_int;
    fn get_regs(&self, vcpu: c_int, regs: &mut kvm_regs) -> c_int;
    fn set_regs(&self, vcpu: c_int, regs: &kvm_regs) -> c_int;
    fn get_sregs(&self, vcpu: c_int, sregs: &mut kvm_sregs) -> c_int;
    fn set_sregs(&self, vcpu: c_int, sregs: &kvm_sregs) -> c_int;
    fn set_fpu(&self, vcpu: c_int, fpu: &kvm_fpu) -> c_int;
    fn run(&self, vcpu: c_int) -> c_int;
    fn close(&self, fd: c_int) -> c_int;
}

/// `KvmSys` backed by the real kernel interface
#[derive(Debug, Default)]
pub(crate) struct SystemKvm;

fn borrow<'a>(fd: c_int) -> BorrowedFd<'a> {
    // SAFETY: callers only pass descriptors returned by a verified open,
    // create_vm or create_vcpu that are still owned by a `KvmFd`
    unsafe { BorrowedFd::borrow_raw(fd) }
}

impl KvmSys for SystemKvm {
    fn open_kvm(&self) -> c_int {
        unsafe { libc::open(c"/dev/kvm".as_ptr(), libc::O_RDWR | libc::O_CLOEXEC) }
    }

    fn get_api_version(&self, kvm: c_int) -> c_int {
        unsafe { ioctl(&borrow(kvm), KVM_GET_API_VERSION()) }
    }

    fn check_extension(&self, kvm: c_int, capability: u32) -> c_int {
        unsafe { ioctl_with_val(&borrow(kvm), KVM_CHECK_EXTENSION(), c_ulong::from(capability)) }
    }

    fn get_vcpu_mmap_size(&self, kvm: c_int) -> c_int {
        unsafe { ioctl(&borrow(kvm), KVM_GET_VCPU_MMAP_SIZE()) }
    }

    fn create_vm(&self, kvm: c_int) -> c_int {
        // machine type 0, the default
        unsafe { ioctl_with_val(&borrow(kvm), KVM_CREATE_VM(), 0) }
    }

    fn set_user_memory_region(&self, vm: c_int, region: &kvm_userspace_memory_region) -> c_int {
        unsafe { ioctl_with_ref(&borrow(vm), KVM_SET_USER_MEMORY_REGION(), region) }
    }

    fn create_vcpu(&self, vm: c_int, id: u64) -> c_int {
        unsafe { ioctl_with_val(&borrow(vm), KVM_CREATE_VCPU(), id as c_ulong) }
    }

    fn map_run(&self, vcpu: c_int, size: usize) -> isize {
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                vcpu,
                0,
            )
        };
        addr as isize
    }

    unsafe fn unmap_run(&self, run: *mut kvm_run, size: usize) -> c_int {
        unsafe { libc::munmap(run.cast(), size) }
    }

    fn get_regs(&self, vcpu: c_int, regs: &mut kvm_regs) -> c_int {
        unsafe { ioctl_with_mut_ref(&borrow(vcpu), KVM_GET_REGS(), regs) }
    }

    fn set_regs(&self, vcpu: c_int, regs: &kvm_regs) -> c_int {
        unsafe { ioctl_with_ref(&borrow(vcpu), KVM_SET_REGS(), regs) }
    }

    fn get_sregs(&self, vcpu: c_int, sregs: &mut kvm_sregs) -> c_int {
        unsafe { ioctl_with_mut_ref(&borrow(vcpu), KVM_GET_SREGS(), sregs) }
    }

    fn set_sregs(&self, vcpu: c_int, sregs: &kvm_sregs) -> c_int {
        unsafe { ioctl_with_ref(&borrow(vcpu), KVM_SET_SREGS(), sregs) }
    }

    fn set_fpu(&self, vcpu: c_int, fpu: &kvm_fpu) -> c_int {
        unsafe { ioctl_with_ref(&borrow(vcpu), KVM_SET_FPU(), fpu) }
    }

    fn run(&self, vcpu: c_int) -> c_int {
        unsafe { ioctl(&borrow(vcpu), KVM_RUN()) }
    }

    fn close(&self, fd: c_int) -> c_int {
        unsafe { libc::close(fd) }
    }
}

/// A KVM file descriptor, closed exactly once when dropped
#[derive(Debug)]
pub(crate) struct KvmFd {
    fd: c_int,
    sys: Arc<dyn KvmSys>,
    verifier: NativeCallVerifier,
}

impl KvmFd {
    /// Take ownership of `fd`, which must be open
    pub(crate) fn new(fd: c_int, sys: Arc<dyn KvmSys>, verifier: NativeCallVerifier) -> Self {
        Self { fd, sys, verifier }
    }

    pub(crate) fn raw(&self) -> c_int {
        self.fd
    }
}

impl Drop for KvmFd {
    fn drop(&mut self) {
        // a failed close is logged and counted by the verifier
        let _ = self.verifier.verify("Close", || self.sys.close(self.fd), 0);
    }
}

/// The mapping of a vCPU's `kvm_run` structure, unmapped when dropped
#[derive(Debug)]
pub(crate) struct KvmRunMapping {
    run: NonNull<kvm_run>,
    size: usize,
    sys: Arc<dyn KvmSys>,
    verifier: NativeCallVerifier,
}

// SAFETY: the mapping is owned by a single driver and only touched by the
// thread that currently drives the vCPU
unsafe impl Send for KvmRunMapping {}

impl KvmRunMapping {
    /// Map the `kvm_run` structure of `vcpu`
    pub(crate) fn new(
        vcpu: &KvmFd,
        size: usize,
        sys: Arc<dyn KvmSys>,
        verifier: NativeCallVerifier,
    ) -> crate::Result<Self> {
        let addr = verifier.verify_with(
            "MapRun",
            || sys.map_run(vcpu.raw(), size),
            |addr| addr != libc::MAP_FAILED as isize && addr != 0,
        )?;
        let run = NonNull::new(addr as *mut kvm_run)
            .ok_or_else(|| crate::new_error!("kvm_run mapping is null"))?;
        Ok(Self {
            run,
            size,
            sys,
            verifier,
        })
    }

    pub(crate) fn as_ptr(&self) -> *mut kvm_run {
        self.run.as_ptr()
    }
}

impl Drop for KvmRunMapping {
    fn drop(&mut self) {
        let _ = self.verifier.verify(
            "UnmapRun",
            // SAFETY: mapped in `new` with this size, nothing uses it after drop
            || unsafe { self.sys.unmap_run(self.run.as_ptr(), self.size) },
            0,
        );
    }
}
