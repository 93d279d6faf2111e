#![no_main]

use std::sync::{Arc, Mutex};

use hyperlight_testing::guest_memory::TestGuestMemory;
use hyperlight_vcpu::hypervisor::handlers::{OutBHandler, OutBHandlerFunction};
use hyperlight_vcpu::{
    new_hypervisor_with_type, GuestMemoryRegion, HypervisorParams, HypervisorState,
    HypervisorType, MemoryRegionFlags,
};
use libfuzzer_sys::{fuzz_target, Corpus};

const ENTRYPOINT: u64 = 0x1000;

// Runs arbitrary bytes as guest code on the emulated backend. Whatever the
// guest does, the instance must end up halted or faulted and dispose cleanly.
// Inputs with jumps are skipped since they can spin forever.
fuzz_target!(|code: &[u8]| -> Corpus {
    if code.len() > 0x6000 || code.iter().any(|b| *b == 0xEB || *b == 0xE9) {
        return Corpus::Reject;
    }

    let mut memory = TestGuestMemory::new(0x10000).unwrap();
    memory.write(ENTRYPOINT, code).unwrap();
    let func: OutBHandlerFunction = Box::new(|port, _| match port {
        0xFF => Err("port 0xff is closed".into()),
        _ => Ok(()),
    });
    let handler = Arc::new(Mutex::new(OutBHandler::from(func)));
    // SAFETY: `memory` outlives the hypervisor
    let region = unsafe {
        GuestMemoryRegion::new(
            memory.host_base(),
            memory.size(),
            0,
            MemoryRegionFlags::READ | MemoryRegionFlags::WRITE | MemoryRegionFlags::EXECUTE,
        )
        .unwrap()
    };
    let params = HypervisorParams::new(region, ENTRYPOINT, 0x2000, handler, 0x3000.into());

    let mut hv = new_hypervisor_with_type(HypervisorType::Emulated, params).unwrap();
    hv.initialise().unwrap();
    match hv.execute_until_halt() {
        Ok(()) => assert_eq!(hv.state(), HypervisorState::Halted),
        Err(_) => assert_eq!(hv.state(), HypervisorState::Faulted),
    }
    hv.dispose().unwrap();

    Corpus::Keep
});
