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

use std::fmt::Debug;
use std::sync::OnceLock;

use tracing::{instrument, Span};

use super::emulated::EmulatedDriver;
use super::handlers::OutBHandlerWrapper;
#[cfg(kvm)]
use super::kvm;
use super::Hypervisor;
use crate::config::HypervisorConfig;
use crate::correlation::CorrelationId;
use crate::error::HyperlightError::NoHypervisorFound;
use crate::mem::memory_region::GuestMemoryRegion;
use crate::mem::ptr::RawPtr;
use crate::{log_then_return, Result};

static AVAILABLE_HYPERVISOR: OnceLock<Option<HypervisorType>> = OnceLock::new();

/// Returns which hardware hypervisor is available on this host, if any.
/// The host is probed once, later calls return the cached answer.
pub fn get_available_hypervisor() -> &'static Option<HypervisorType> {
    AVAILABLE_HYPERVISOR.get_or_init(|| {
        cfg_if::cfg_if! {
            if #[cfg(kvm)] {
                if kvm::is_hypervisor_present(std::sync::Arc::new(super::kvm_sys::SystemKvm)) {
                    Some(HypervisorType::Kvm)
                } else {
                    None
                }
            } else {
                None
            }
        }
    })
}

/// Whether a hardware hypervisor can be used on this host
pub fn is_hypervisor_present() -> bool {
    get_available_hypervisor().is_some()
}

/// The hypervisor backends this crate can drive.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HypervisorType {
    /// Linux KVM
    #[cfg(kvm)]
    Kvm,
    /// The software backend, which needs no hypervisor
    Emulated,
}

/// Everything a hypervisor instance is constructed from
pub struct HypervisorParams {
    /// The guest's memory. It must stay allocated until the instance has
    /// been disposed or dropped.
    pub memory: GuestMemoryRegion,
    /// Guest virtual address of the entry point
    pub entrypoint: u64,
    /// Initial stack pointer
    pub rsp: u64,
    /// Called synchronously for every port write the guest makes
    pub outb_handler: OutBHandlerWrapper,
    /// Guest address of the parameter block handed to the entry point
    pub peb_addr: RawPtr,
    /// Instance configuration
    pub config: HypervisorConfig,
    /// Attached to every failure and span of the instance
    pub correlation_id: CorrelationId,
}

impl HypervisorParams {
    /// Parameters with the default configuration and a fresh correlation id
    pub fn new(
        memory: GuestMemoryRegion,
        entrypoint: u64,
        rsp: u64,
        outb_handler: OutBHandlerWrapper,
        peb_addr: RawPtr,
    ) -> Self {
        Self {
            memory,
            entrypoint,
            rsp,
            outb_handler,
            peb_addr,
            config: HypervisorConfig::default(),
            correlation_id: CorrelationId::new(),
        }
    }

    /// Replace the configuration
    pub fn with_config(mut self, config: HypervisorConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the correlation id
    pub fn with_correlation_id(mut self, correlation_id: CorrelationId) -> Self {
        self.correlation_id = correlation_id;
        self
    }
}

impl Debug for HypervisorParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HypervisorParams")
            .field("memory", &self.memory)
            .field("entrypoint", &format_args!("{:#x}", self.entrypoint))
            .field("rsp", &format_args!("{:#x}", self.rsp))
            .field("peb_addr", &self.peb_addr)
            .field("config", &self.config)
            .field("correlation_id", &self.correlation_id)
            .finish_non_exhaustive()
    }
}

/// Construct a hypervisor instance on the hardware hypervisor of this host,
/// or on the emulated backend if there is none and the configuration allows
/// it. Nothing is created until `initialise` is called on the result.
#[instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace")]
pub fn new_hypervisor(params: HypervisorParams) -> Result<Box<dyn Hypervisor>> {
    if let Some(hv_type) = *get_available_hypervisor() {
        return new_hypervisor_with_type(hv_type, params);
    }
    if !params.config.get_allow_emulation() {
        log_then_return!(NoHypervisorFound());
    }
    log::info!("No hypervisor found, using the emulated backend");
    new_hypervisor_with_type(HypervisorType::Emulated, params)
}

/// Construct a hypervisor instance on the given backend
#[instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace")]
pub fn new_hypervisor_with_type(
    hv_type: HypervisorType,
    params: HypervisorParams,
) -> Result<Box<dyn Hypervisor>> {
    let hv: Box<dyn Hypervisor> = match hv_type {
        #[cfg(kvm)]
        HypervisorType::Kvm => Box::new(kvm::KVMDriver::new(params)),
        HypervisorType::Emulated => Box::new(EmulatedDriver::new(params)),
    };
    crate::debug!("Constructed {:?} backend", hv_type);
    Ok(hv)
}

#[cfg(test)]
mod tests {
    use hyperlight_testing::guest_code::GuestCode;

    use super::*;
    use crate::hypervisor::HypervisorState;
    use crate::testing::{guest_memory, params_for, recording_handler, region_of, ENTRYPOINT};
    use crate::HyperlightError;

    #[test]
    fn probing_is_cached() {
        let first: *const Option<HypervisorType> = get_available_hypervisor();
        let second: *const Option<HypervisorType> = get_available_hypervisor();
        assert_eq!(first, second);
        assert_eq!(is_hypervisor_present(), get_available_hypervisor().is_some());
    }

    #[test]
    fn new_hypervisor_follows_the_probe_and_the_config() {
        let (handler, _) = recording_handler();
        let memory = guest_memory(&[(ENTRYPOINT, GuestCode::new().hlt())]);
        let mut config = params_for(region_of(&memory), handler.clone()).config;
        config.set_allow_emulation(false);
        let params = params_for(region_of(&memory), handler).with_config(config);

        match new_hypervisor(params) {
            Ok(hv) => {
                assert!(is_hypervisor_present());
                assert_eq!(hv.state(), HypervisorState::Unconfigured);
            }
            Err(e) => {
                assert!(!is_hypervisor_present());
                assert!(matches!(e, HyperlightError::NoHypervisorFound()));
            }
        }
    }

    #[test]
    fn the_emulated_backend_is_always_available() {
        let (handler, seen) = recording_handler();
        let memory = guest_memory(&[(ENTRYPOINT, GuestCode::new().outb(0x3F8, 0x41).hlt())]);
        let params = params_for(region_of(&memory), handler)
            .with_correlation_id(CorrelationId::from("emulated"));
        let mut hv = new_hypervisor_with_type(HypervisorType::Emulated, params).unwrap();
        assert_eq!(hv.correlation_id().as_str(), "emulated");
        hv.initialise().unwrap();
        hv.execute_until_halt().unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![(0x3F8, 0x41)]);
        hv.dispose().unwrap();
    }
}
