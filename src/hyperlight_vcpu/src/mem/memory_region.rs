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

use std::ops::Range;
use std::ptr::NonNull;

use bitflags::bitflags;

use crate::error::HyperlightError;
use crate::{log_then_return, Result};

bitflags! {
    /// flags representing memory permission for a memory region
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct MemoryRegionFlags: u32 {
        /// no permissions
        const NONE = 0;
        /// allow guest to read
        const READ = 1;
        /// allow guest to write
        const WRITE = 2;
        /// allow guest to execute
        const EXECUTE = 4;
    }
}

impl std::fmt::Display for MemoryRegionFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_empty() {
            return write!(f, "NONE");
        }
        let names: Vec<&str> = [
            (MemoryRegionFlags::READ, "READ"),
            (MemoryRegionFlags::WRITE, "WRITE"),
            (MemoryRegionFlags::EXECUTE, "EXECUTE"),
        ]
        .iter()
        .filter(|(flag, _)| self.contains(*flag))
        .map(|(_, name)| *name)
        .collect();
        write!(f, "{}", names.join(" | "))
    }
}

/// A handle on the host memory that backs the guest's physical address space.
///
/// The handle does not own the memory: the memory layout builder allocates
/// it, writes page tables and guest code into it and frees it after every
/// hypervisor using it has been disposed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GuestMemoryRegion {
    host_base: NonNull<u8>,
    size: usize,
    guest_base: u64,
    flags: MemoryRegionFlags,
}

// SAFETY: the handle is only an address and a length. The contract of
// `GuestMemoryRegion::new` makes the memory valid for as long as any
// hypervisor holds the handle, and only the thread driving the vCPU reads it.
unsafe impl Send for GuestMemoryRegion {}

impl GuestMemoryRegion {
    /// Describe `size` bytes of host memory starting at `host_base` that
    /// appear to the guest at guest physical address `guest_base`.
    ///
    /// # Safety
    ///
    /// `host_base..host_base + size` must be a single allocation that is
    /// valid for reads and writes, and that stays allocated until every
    /// hypervisor constructed with this handle has been disposed or dropped.
    /// The hypervisor never frees it.
    pub unsafe fn new(
        host_base: *mut u8,
        size: usize,
        guest_base: u64,
        flags: MemoryRegionFlags,
    ) -> Result<Self> {
        let Some(host_base) = NonNull::new(host_base) else {
            log_then_return!(HyperlightError::HypervisorSetupFailure(
                "guest memory base address is null".to_string()
            ));
        };
        if size == 0 {
            log_then_return!(HyperlightError::HypervisorSetupFailure(
                "guest memory region is empty".to_string()
            ));
        }
        if guest_base.checked_add(u64::try_from(size)?).is_none() {
            log_then_return!(HyperlightError::HypervisorSetupFailure(format!(
                "guest memory region at {:#x} of size {:#x} overflows the guest address space",
                guest_base, size
            )));
        }
        Ok(Self {
            host_base,
            size,
            guest_base,
            flags,
        })
    }

    /// The host address of the first byte
    pub fn host_base(&self) -> *mut u8 {
        self.host_base.as_ptr()
    }

    /// Size in bytes
    pub fn size(&self) -> usize {
        self.size
    }

    /// The guest physical address of the first byte
    pub fn guest_base(&self) -> u64 {
        self.guest_base
    }

    /// The guest's permissions on the region
    pub fn flags(&self) -> MemoryRegionFlags {
        self.flags
    }

    /// The guest physical addresses covered by the region
    pub fn guest_range(&self) -> Range<u64> {
        // cannot overflow, checked in `new`
        self.guest_base..self.guest_base + self.size as u64
    }

    /// Whether `gpa` falls inside the region
    pub fn contains(&self, gpa: u64) -> bool {
        self.guest_range().contains(&gpa)
    }

    /// Whether both the host base and the size are multiples of `page_size`
    pub fn is_page_aligned(&self, page_size: usize) -> bool {
        page_size != 0
            && (self.host_base.as_ptr() as usize) % page_size == 0
            && self.size % page_size == 0
    }

    /// Read the byte at guest physical address `gpa`
    pub fn read_u8(&self, gpa: u64) -> Result<u8> {
        let mut byte = [0u8; 1];
        self.read_bytes(gpa, &mut byte)?;
        Ok(byte[0])
    }

    /// Fill `buf` with the bytes starting at guest physical address `gpa`.
    /// Fails with `BoundsCheckFailed` if any of them lies outside the region.
    pub fn read_bytes(&self, gpa: u64, buf: &mut [u8]) -> Result<()> {
        let offset = self.offset_of(gpa, buf.len())?;
        // SAFETY: offset..offset + buf.len() lies inside the allocation, see `new`
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.host_base.as_ptr().add(offset),
                buf.as_mut_ptr(),
                buf.len(),
            );
        }
        Ok(())
    }

    fn offset_of(&self, gpa: u64, len: usize) -> Result<usize> {
        let out_of_bounds = || HyperlightError::BoundsCheckFailed(gpa, self.size);
        let offset = gpa
            .checked_sub(self.guest_base)
            .ok_or_else(out_of_bounds)?;
        let offset = usize::try_from(offset).map_err(|_| out_of_bounds())?;
        match offset.checked_add(len) {
            Some(end) if end <= self.size => Ok(offset),
            _ => Err(out_of_bounds()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region_over(buf: &mut [u8], guest_base: u64) -> GuestMemoryRegion {
        unsafe {
            GuestMemoryRegion::new(
                buf.as_mut_ptr(),
                buf.len(),
                guest_base,
                MemoryRegionFlags::READ | MemoryRegionFlags::EXECUTE,
            )
            .unwrap()
        }
    }

    #[test]
    fn reads_are_bounds_checked() {
        let mut buf: Vec<u8> = (0..=255).collect();
        let region = region_over(&mut buf, 0x1000);

        assert_eq!(region.read_u8(0x1000).unwrap(), 0);
        assert_eq!(region.read_u8(0x10ff).unwrap(), 255);
        let mut out = [0u8; 4];
        region.read_bytes(0x1010, &mut out).unwrap();
        assert_eq!(out, [0x10, 0x11, 0x12, 0x13]);

        assert!(matches!(
            region.read_u8(0xfff),
            Err(HyperlightError::BoundsCheckFailed(0xfff, 256))
        ));
        assert!(matches!(
            region.read_u8(0x1100),
            Err(HyperlightError::BoundsCheckFailed(0x1100, 256))
        ));
        let mut straddling = [0u8; 2];
        assert!(region.read_bytes(0x10ff, &mut straddling).is_err());
    }

    #[test]
    fn contains_matches_the_guest_range() {
        let mut buf = vec![0u8; 16];
        let region = region_over(&mut buf, 0x2000);
        assert_eq!(region.guest_range(), 0x2000..0x2010);
        assert!(region.contains(0x2000));
        assert!(region.contains(0x200f));
        assert!(!region.contains(0x2010));
        assert!(!region.is_page_aligned(0x1000));
    }

    #[test]
    fn invalid_regions_are_rejected() {
        let mut buf = vec![0u8; 16];
        let flags = MemoryRegionFlags::READ;
        unsafe {
            assert!(GuestMemoryRegion::new(std::ptr::null_mut(), 16, 0, flags).is_err());
            assert!(GuestMemoryRegion::new(buf.as_mut_ptr(), 0, 0, flags).is_err());
            assert!(GuestMemoryRegion::new(buf.as_mut_ptr(), 16, u64::MAX - 4, flags).is_err());
        }
    }

    #[test]
    fn flags_display() {
        assert_eq!(MemoryRegionFlags::NONE.to_string(), "NONE");
        assert_eq!(
            (MemoryRegionFlags::READ | MemoryRegionFlags::EXECUTE).to_string(),
            "READ | EXECUTE"
        );
    }
}
