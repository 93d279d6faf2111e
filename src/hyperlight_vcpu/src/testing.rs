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

//! Guests and handlers shared by the unit tests

use std::sync::{Arc, Mutex};

use hyperlight_testing::guest_code::GuestCode;
use hyperlight_testing::guest_memory::TestGuestMemory;

use crate::hypervisor::emulated::EmulatedDriver;
use crate::hypervisor::handlers::{OutBHandler, OutBHandlerFunction, OutBHandlerWrapper};
use crate::{GuestMemoryRegion, HypervisorConfig, HypervisorParams, MemoryRegionFlags};

pub(crate) const ENTRYPOINT: u64 = 0x1000;
pub(crate) const STACK: u64 = 0x2000;
pub(crate) const PEB: u64 = 0x3000;
pub(crate) const SEED: u64 = 0x5eed;
pub(crate) const MEMORY_SIZE: usize = 0x10000;

/// A handler that records every port write it sees
pub(crate) fn recording_handler() -> (OutBHandlerWrapper, Arc<Mutex<Vec<(u16, u8)>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let func: OutBHandlerFunction = Box::new(move |port, value| {
        sink.lock().unwrap().push((port, value));
        Ok(())
    });
    (Arc::new(Mutex::new(OutBHandler::from(func))), seen)
}

/// Guest memory with identity mapped page tables and `code` written at
/// the given guest physical addresses
pub(crate) fn guest_memory(code: &[(u64, GuestCode)]) -> TestGuestMemory {
    let mut memory = TestGuestMemory::new(MEMORY_SIZE).unwrap();
    for (gpa, code) in code {
        memory.write(*gpa, code.as_bytes()).unwrap();
    }
    memory
}

/// A read, write and execute handle on all of `memory`
pub(crate) fn region_of(memory: &TestGuestMemory) -> GuestMemoryRegion {
    // SAFETY: every test keeps `memory` alive for longer than its hypervisor
    unsafe {
        GuestMemoryRegion::new(
            memory.host_base(),
            memory.size(),
            0,
            MemoryRegionFlags::READ | MemoryRegionFlags::WRITE | MemoryRegionFlags::EXECUTE,
        )
        .unwrap()
    }
}

pub(crate) fn params_for(region: GuestMemoryRegion, handler: OutBHandlerWrapper) -> HypervisorParams {
    let mut config = HypervisorConfig::default();
    config.set_pml4_addr(TestGuestMemory::PML4_ADDR);
    config.set_seed(SEED);
    HypervisorParams::new(region, ENTRYPOINT, STACK, handler, PEB.into()).with_config(config)
}

/// An emulated driver over fresh guest memory. Keep the memory alive for as
/// long as the driver.
pub(crate) fn emulated_guest(
    code: &[(u64, GuestCode)],
    handler: OutBHandlerWrapper,
) -> (TestGuestMemory, EmulatedDriver) {
    let memory = guest_memory(code);
    let driver = EmulatedDriver::new(params_for(region_of(&memory), handler));
    (memory, driver)
}
