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

use std::cmp::max;
use std::time::Duration;

use tracing::{instrument, Span};

/// The configuration a hypervisor instance needs besides its guest memory,
/// entry point and handlers
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct HypervisorConfig {
    /// Guest physical address of the root page table (PML4) written by the
    /// memory layout builder. Loaded into CR3.
    pml4_addr: u64,
    /// The random seed handed to the guest entry point in `rdx`
    seed: u64,
    /// The page size handed to the guest entry point in `r8`
    page_size: u32,
    /// Interrupting the vCPU is done by repeatedly signalling its thread
    /// until it has left the guest. This is the delay between signals.
    interrupt_retry_delay: Duration,
    /// Offset from `SIGRTMIN` of the signal used to interrupt the vCPU thread
    interrupt_vcpu_sigrtmin_offset: u8,
    /// Whether the emulated backend may be used when no hypervisor is present
    allow_emulation: bool,
}

impl HypervisorConfig {
    /// The default guest physical address of the PML4
    pub const DEFAULT_PML4_ADDR: u64 = 0x0;
    /// The default delay between signals sent to interrupt a vCPU
    pub const DEFAULT_INTERRUPT_RETRY_DELAY: Duration = Duration::from_micros(500);
    /// The minimum delay between signals sent to interrupt a vCPU
    pub const MIN_INTERRUPT_RETRY_DELAY: Duration = Duration::from_micros(1);
    /// The default offset from `SIGRTMIN` of the interrupt signal
    pub const INTERRUPT_VCPU_SIGRTMIN_OFFSET: u8 = 0;

    /// Create a new configuration with the host page size and a random seed
    #[instrument(skip_all, parent = Span::current(), level = "Trace")]
    pub fn new() -> Self {
        Self {
            pml4_addr: Self::DEFAULT_PML4_ADDR,
            seed: rand::random::<u64>(),
            page_size: host_page_size(),
            interrupt_retry_delay: Self::DEFAULT_INTERRUPT_RETRY_DELAY,
            interrupt_vcpu_sigrtmin_offset: Self::INTERRUPT_VCPU_SIGRTMIN_OFFSET,
            allow_emulation: true,
        }
    }

    /// Set the guest physical address of the PML4
    #[instrument(skip_all, parent = Span::current(), level = "Trace")]
    pub fn set_pml4_addr(&mut self, pml4_addr: u64) {
        self.pml4_addr = pml4_addr;
    }

    /// Get the guest physical address of the PML4
    pub fn get_pml4_addr(&self) -> u64 {
        self.pml4_addr
    }

    /// Set the seed handed to the guest
    #[instrument(skip_all, parent = Span::current(), level = "Trace")]
    pub fn set_seed(&mut self, seed: u64) {
        self.seed = seed;
    }

    /// Get the seed handed to the guest
    pub fn get_seed(&self) -> u64 {
        self.seed
    }

    /// Set the page size handed to the guest
    #[instrument(skip_all, parent = Span::current(), level = "Trace")]
    pub fn set_page_size(&mut self, page_size: u32) {
        self.page_size = page_size;
    }

    /// Get the page size handed to the guest
    pub fn get_page_size(&self) -> u32 {
        self.page_size
    }

    /// Set the delay between signals sent to interrupt the vCPU.
    /// The minimum value is MIN_INTERRUPT_RETRY_DELAY
    #[instrument(skip_all, parent = Span::current(), level = "Trace")]
    pub fn set_interrupt_retry_delay(&mut self, delay: Duration) {
        self.interrupt_retry_delay = max(delay, Self::MIN_INTERRUPT_RETRY_DELAY);
    }

    /// Get the delay between signals sent to interrupt the vCPU
    pub fn get_interrupt_retry_delay(&self) -> Duration {
        self.interrupt_retry_delay
    }

    /// Set the offset from `SIGRTMIN` of the signal used to interrupt the vCPU thread.
    ///
    /// `SIGRTMIN + offset` must not exceed `SIGRTMAX`, this is checked when a
    /// KVM backend is initialised.
    #[instrument(skip_all, parent = Span::current(), level = "Trace")]
    pub fn set_interrupt_vcpu_sigrtmin_offset(&mut self, offset: u8) {
        self.interrupt_vcpu_sigrtmin_offset = offset;
    }

    /// Get the offset from `SIGRTMIN` of the interrupt signal
    pub fn get_interrupt_vcpu_sigrtmin_offset(&self) -> u8 {
        self.interrupt_vcpu_sigrtmin_offset
    }

    /// Allow or forbid falling back to the emulated backend
    #[instrument(skip_all, parent = Span::current(), level = "Trace")]
    pub fn set_allow_emulation(&mut self, allow: bool) {
        self.allow_emulation = allow;
    }

    /// Whether falling back to the emulated backend is allowed
    pub fn get_allow_emulation(&self) -> bool {
        self.allow_emulation
    }
}

impl Default for HypervisorConfig {
    #[instrument(skip_all, parent = Span::current(), level = "Trace")]
    fn default() -> Self {
        Self::new()
    }
}

fn host_page_size() -> u32 {
    // page sizes are powers of two well below 4GiB
    u32::try_from(page_size::get()).unwrap_or(0x1000)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::HypervisorConfig;

    #[test]
    fn defaults() {
        let cfg = HypervisorConfig::default();
        assert_eq!(cfg.get_pml4_addr(), HypervisorConfig::DEFAULT_PML4_ADDR);
        assert_eq!(cfg.get_page_size() as usize, page_size::get());
        assert_eq!(
            cfg.get_interrupt_retry_delay(),
            HypervisorConfig::DEFAULT_INTERRUPT_RETRY_DELAY
        );
        assert_eq!(cfg.get_interrupt_vcpu_sigrtmin_offset(), 0);
        assert!(cfg.get_allow_emulation());
    }

    #[test]
    fn seeds_are_random() {
        // two u64 draws colliding would be a broken generator
        assert_ne!(
            HypervisorConfig::default().get_seed(),
            HypervisorConfig::default().get_seed()
        );
    }

    #[test]
    fn retry_delay_is_clamped() {
        let mut cfg = HypervisorConfig::default();
        cfg.set_interrupt_retry_delay(Duration::ZERO);
        assert_eq!(
            cfg.get_interrupt_retry_delay(),
            HypervisorConfig::MIN_INTERRUPT_RETRY_DELAY
        );
    }

    mod proptests {
        use std::time::Duration;

        use proptest::prelude::*;

        use super::HypervisorConfig;

        proptest! {
            #[test]
            fn pml4_addr(addr in any::<u64>()) {
                let mut cfg = HypervisorConfig::default();
                cfg.set_pml4_addr(addr);
                prop_assert_eq!(addr, cfg.get_pml4_addr());
            }

            #[test]
            fn seed(seed in any::<u64>()) {
                let mut cfg = HypervisorConfig::default();
                cfg.set_seed(seed);
                prop_assert_eq!(seed, cfg.get_seed());
            }

            #[test]
            fn interrupt_retry_delay(micros in 1u64..=1_000_000) {
                let mut cfg = HypervisorConfig::default();
                cfg.set_interrupt_retry_delay(Duration::from_micros(micros));
                prop_assert_eq!(Duration::from_micros(micros), cfg.get_interrupt_retry_delay());
            }

            #[test]
            fn interrupt_vcpu_sigrtmin_offset(offset in any::<u8>()) {
                let mut cfg = HypervisorConfig::default();
                cfg.set_interrupt_vcpu_sigrtmin_offset(offset);
                prop_assert_eq!(offset, cfg.get_interrupt_vcpu_sigrtmin_offset());
            }
        }
    }
}
