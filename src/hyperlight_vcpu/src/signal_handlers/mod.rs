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

use libc::c_int;

use crate::config::HypervisorConfig;
use crate::error::HyperlightError::HypervisorSetupFailure;
use crate::{log_then_return, Result};

/// Install the handler for the signal that kicks a vCPU thread out of
/// `KVM_RUN` when its run is killed.
pub(crate) fn setup_signal_handlers(config: &HypervisorConfig) -> Result<()> {
    let signal = libc::SIGRTMIN() + c_int::from(config.get_interrupt_vcpu_sigrtmin_offset());
    if signal > libc::SIGRTMAX() {
        log_then_return!(HypervisorSetupFailure(format!(
            "interrupt signal offset {} is past SIGRTMAX",
            config.get_interrupt_vcpu_sigrtmin_offset()
        )));
    }

    // The handler does nothing, which is async-signal-safe.
    vmm_sys_util::signal::register_signal_handler(signal, vm_kill_signal)?;

    // Note: Hyperlight does not chain signal handlers. A handler the embedder
    // installed for this signal is replaced, so pick an offset nobody else uses.
    Ok(())
}

extern "C" fn vm_kill_signal(_: libc::c_int, _: *mut libc::siginfo_t, _: *mut libc::c_void) {
    // Do nothing. The signal only forces a VM exit.
}
