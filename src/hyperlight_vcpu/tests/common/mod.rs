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
use std::sync::{Arc, Mutex};

use hyperlight_testing::guest_code::GuestCode;
use hyperlight_testing::guest_memory::TestGuestMemory;
use hyperlight_vcpu::hypervisor::handlers::{OutBHandler, OutBHandlerFunction, OutBHandlerWrapper};
use hyperlight_vcpu::{GuestMemoryRegion, HypervisorConfig, HypervisorParams, MemoryRegionFlags};

pub const ENTRYPOINT: u64 = 0x1000;
pub const STACK: u64 = 0x2000;
pub const PEB: u64 = 0x3000;

/// Every byte written to a port, in order
pub type PortWrites = Arc<Mutex<Vec<(u16, u8)>>>;

pub fn recording_handler() -> (OutBHandlerWrapper, PortWrites) {
    let seen: PortWrites = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let func: OutBHandlerFunction = Box::new(move |port, value| {
        sink.lock().unwrap().push((port, value));
        Ok(())
    });
    (Arc::new(Mutex::new(OutBHandler::from(func))), seen)
}

/// A guest with `code` at the entry point. The memory must outlive any
/// hypervisor built from the returned params.
pub fn guest(code: GuestCode, handler: OutBHandlerWrapper) -> (TestGuestMemory, HypervisorParams) {
    guest_with(&[(ENTRYPOINT, code)], handler)
}

pub fn guest_with(
    code: &[(u64, GuestCode)],
    handler: OutBHandlerWrapper,
) -> (TestGuestMemory, HypervisorParams) {
    let mut memory = TestGuestMemory::new(0x10000).unwrap();
    for (gpa, code) in code {
        memory.write(*gpa, code.as_bytes()).unwrap();
    }
    // SAFETY: callers keep `memory` alive for as long as the hypervisor
    let region = unsafe {
        GuestMemoryRegion::new(
            memory.host_base(),
            memory.size(),
            0,
            MemoryRegionFlags::READ | MemoryRegionFlags::WRITE | MemoryRegionFlags::EXECUTE,
        )
        .unwrap()
    };
    let mut config = HypervisorConfig::default();
    config.set_pml4_addr(TestGuestMemory::PML4_ADDR);
    let params =
        HypervisorParams::new(region, ENTRYPOINT, STACK, handler, PEB.into()).with_config(config);
    (memory, params)
}
