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

use criterion::{criterion_group, criterion_main, Criterion};
use hyperlight_testing::guest_code::GuestCode;
use hyperlight_testing::guest_memory::TestGuestMemory;
use hyperlight_vcpu::hypervisor::handlers::{OutBHandler, OutBHandlerFunction};
use hyperlight_vcpu::{
    new_hypervisor, new_hypervisor_with_type, GuestMemoryRegion, Hypervisor, HypervisorConfig,
    HypervisorParams, HypervisorType, MemoryRegionFlags, RawPtr,
};

const ENTRYPOINT: u64 = 0x1000;
const DISPATCH: u64 = 0x1800;

// A guest that halts on entry, and a dispatch function that writes `traps`
// bytes to a port before halting
fn create_guest(traps: u8) -> TestGuestMemory {
    let mut memory = TestGuestMemory::new(0x10000).unwrap();
    memory
        .write(ENTRYPOINT, GuestCode::new().hlt().as_bytes())
        .unwrap();
    let mut dispatch = GuestCode::new().mov_dx(0x80).mov_al(0);
    for _ in 0..traps {
        dispatch = dispatch.out_dx_al().inc_al();
    }
    memory.write(DISPATCH, dispatch.hlt().as_bytes()).unwrap();
    memory
}

fn create_params(memory: &TestGuestMemory) -> HypervisorParams {
    let func: OutBHandlerFunction = Box::new(|_, _| Ok(()));
    let handler = Arc::new(Mutex::new(OutBHandler::from(func)));
    // SAFETY: every benchmark drops the hypervisor before the memory
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
    HypervisorParams::new(region, ENTRYPOINT, 0x2000, handler, 0x3000.into()).with_config(config)
}

fn create_initialised(
    memory: &TestGuestMemory,
    hv_type: Option<HypervisorType>,
) -> Box<dyn Hypervisor> {
    let params = create_params(memory);
    let mut hv = match hv_type {
        Some(hv_type) => new_hypervisor_with_type(hv_type, params).unwrap(),
        None => new_hypervisor(params).unwrap(),
    };
    hv.initialise().unwrap();
    hv.execute_until_halt().unwrap();
    hv
}

fn dispatch_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("dispatch");

    for traps in [0u8, 1, 16] {
        let memory = create_guest(traps);

        // On the hardware hypervisor when there is one
        group.bench_function(format!("dispatch_{traps}_traps"), |b| {
            let mut hv = create_initialised(&memory, None);
            b.iter(|| hv.dispatch_call_from_host(RawPtr::from(DISPATCH)).unwrap());
        });

        group.bench_function(format!("emulated_dispatch_{traps}_traps"), |b| {
            let mut hv = create_initialised(&memory, Some(HypervisorType::Emulated));
            b.iter(|| hv.dispatch_call_from_host(RawPtr::from(DISPATCH)).unwrap());
        });
    }

    group.finish();
}

fn lifecycle_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("lifecycle");
    let memory = create_guest(0);

    // Construct, initialise, run to the first halt and dispose
    group.bench_function("create_run_dispose", |b| {
        b.iter(|| {
            let mut hv = create_initialised(&memory, None);
            hv.dispose().unwrap();
        });
    });

    group.finish();
}

criterion_group! {
    name = benches;
    config = Criterion::default();
    targets = dispatch_benchmark, lifecycle_benchmark
}

criterion_main!(benches);
