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

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ops::Range;
use std::ptr::NonNull;

use anyhow::{anyhow, bail, Result};

const PAGE_PRESENT: u64 = 1;
const PAGE_RW: u64 = 1 << 1;
const PAGE_PS: u64 = 1 << 7;
const HUGE_PAGE_SIZE: u64 = 2 * 1024 * 1024;

/// Zeroed, page-aligned guest memory starting at guest physical address 0,
/// with page tables that identity map the first 1GiB.
///
/// The page tables live at [`TestGuestMemory::PML4_ADDR`] and the two pages
/// after it. Guest code and data can go anywhere else.
#[derive(Debug)]
pub struct TestGuestMemory {
    base: NonNull<u8>,
    layout: Layout,
}

// SAFETY: the allocation is owned exclusively by this value
unsafe impl Send for TestGuestMemory {}

impl TestGuestMemory {
    /// Guest physical address of the PML4, to be loaded into CR3
    pub const PML4_ADDR: u64 = 0x8000;
    const PDPT_ADDR: u64 = Self::PML4_ADDR + 0x1000;
    const PD_ADDR: u64 = Self::PML4_ADDR + 0x2000;
    const PAGE_TABLES_END: u64 = Self::PML4_ADDR + 0x3000;

    /// Allocate at least `size` bytes, rounded up to the host page size
    pub fn new(size: usize) -> Result<Self> {
        let page_size = page_size::get();
        let size = size.div_ceil(page_size) * page_size;
        if (size as u64) < Self::PAGE_TABLES_END {
            bail!(
                "guest memory of {:#x} bytes cannot hold page tables ending at {:#x}",
                size,
                Self::PAGE_TABLES_END
            );
        }
        let layout = Layout::from_size_align(size, page_size)?;
        // SAFETY: layout has a non-zero size
        let base = NonNull::new(unsafe { alloc_zeroed(layout) })
            .ok_or_else(|| anyhow!("failed to allocate {:#x} bytes of guest memory", size))?;

        let mut memory = Self { base, layout };
        memory.write_u64(Self::PML4_ADDR, Self::PDPT_ADDR | PAGE_PRESENT | PAGE_RW)?;
        memory.write_u64(Self::PDPT_ADDR, Self::PD_ADDR | PAGE_PRESENT | PAGE_RW)?;
        for entry in 0..512u64 {
            memory.write_u64(
                Self::PD_ADDR + entry * 8,
                (entry * HUGE_PAGE_SIZE) | PAGE_PRESENT | PAGE_RW | PAGE_PS,
            )?;
        }
        Ok(memory)
    }

    /// The host address backing guest physical address 0
    pub fn host_base(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    /// Size in bytes, a multiple of the host page size
    pub fn size(&self) -> usize {
        self.layout.size()
    }

    /// Copy `bytes` to guest physical address `gpa`
    pub fn write(&mut self, gpa: u64, bytes: &[u8]) -> Result<()> {
        let range = self.range(gpa, bytes.len())?;
        // SAFETY: range is inside the allocation
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.base.as_ptr().add(range.start),
                bytes.len(),
            )
        };
        Ok(())
    }

    /// Read `len` bytes from guest physical address `gpa`
    pub fn read(&self, gpa: u64, len: usize) -> Result<Vec<u8>> {
        let range = self.range(gpa, len)?;
        // SAFETY: range is inside the allocation
        let bytes = unsafe { std::slice::from_raw_parts(self.base.as_ptr().add(range.start), len) };
        Ok(bytes.to_vec())
    }

    pub fn read_u64(&self, gpa: u64) -> Result<u64> {
        let bytes = self.read(gpa, 8)?;
        Ok(u64::from_le_bytes(bytes.as_slice().try_into()?))
    }

    fn write_u64(&mut self, gpa: u64, value: u64) -> Result<()> {
        self.write(gpa, &value.to_le_bytes())
    }

    fn range(&self, gpa: u64, len: usize) -> Result<Range<usize>> {
        let start = usize::try_from(gpa)?;
        match start.checked_add(len) {
            Some(end) if end <= self.size() => Ok(start..end),
            _ => bail!(
                "{:#x} bytes at {:#x} are outside guest memory of {:#x} bytes",
                len,
                gpa,
                self.size()
            ),
        }
    }
}

impl Drop for TestGuestMemory {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with this layout
        unsafe { dealloc(self.base.as_ptr(), self.layout) };
    }
}
