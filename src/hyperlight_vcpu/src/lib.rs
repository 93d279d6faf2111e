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
#![deny(dead_code, missing_docs, unused_mut)]
//! This crate contains the execution core of a hypervisor-backed sandbox.
//! It creates a single vCPU virtual machine over guest memory prepared by the
//! caller, runs guest code until it halts, forwards guest port writes to a
//! host handler and verifies the result of every native call it makes.

#![cfg_attr(not(any(test, debug_assertions)), warn(clippy::panic))]
#![cfg_attr(not(any(test, debug_assertions)), warn(clippy::expect_used))]
#![cfg_attr(not(any(test, debug_assertions)), warn(clippy::unwrap_used))]
#![cfg_attr(any(test, debug_assertions), allow(clippy::disallowed_macros))]

#[cfg(feature = "build-metadata")]
use std::sync::Once;

#[cfg(feature = "build-metadata")]
/// The `built` crate is used to generate a `built.rs` file that contains
/// information about the build environment.
pub(crate) mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}
/// Configuration of a hypervisor instance
pub mod config;
/// The correlation id carried by every hypervisor instance
pub mod correlation;
/// Dealing with errors
pub mod error;
/// The hypervisor abstraction, its backends and the trap loop
pub mod hypervisor;
/// Handles on guest memory and guest pointers
pub mod mem;
/// Metric definitions
pub mod metrics;
/// Verification of native call results
pub mod native_call;
/// Signal handling for Linux
#[cfg(kvm)]
pub(crate) mod signal_handlers;
#[cfg(test)]
pub(crate) mod testing;

/// The re-export for the `HypervisorConfig` type
pub use config::HypervisorConfig;
/// The re-export for the `CorrelationId` type
pub use correlation::CorrelationId;
/// The re-export for the `HyperlightError` type
pub use error::HyperlightError;
/// The re-export for the hypervisor selection functions
pub use hypervisor::available::{
    get_available_hypervisor, is_hypervisor_present, new_hypervisor, new_hypervisor_with_type,
    HypervisorParams, HypervisorType,
};
/// The re-export for the hypervisor trait and its lifecycle state
pub use hypervisor::{HyperlightExit, Hypervisor, HypervisorState, InterruptHandle};
/// The re-export for the guest memory handle types
pub use mem::memory_region::{GuestMemoryRegion, MemoryRegionFlags};
/// The re-export for the `RawPtr` type
pub use mem::ptr::RawPtr;

/// The universal `Result` type used throughout this crate.
pub type Result<T> = core::result::Result<T, error::HyperlightError>;

/// Logs an error then returns with it, more or less equivalent to the bail! macro in anyhow
/// but for HyperlightError instead of anyhow::Error
#[macro_export]
macro_rules! log_then_return {
    ($msg:literal $(,)?) => {{
        let __args = std::format_args!($msg);
        let __err_msg = match __args.as_str() {
            Some(msg) => String::from(msg),
            None => std::format!($msg),
        };
        let __err = $crate::HyperlightError::Error(__err_msg);
        log::error!("{}", __err);
        return Err(__err);
    }};
    ($err:expr $(,)?) => {
        log::error!("{}", $err);
        return Err($err);
    };
    ($err:stmt $(,)?) => {
        log::error!("{}", $err);
        return Err($err);
    };
    ($fmtstr:expr, $($arg:tt)*) => {
           let __err_msg = std::format!($fmtstr, $($arg)*);
           let __err = $crate::error::HyperlightError::Error(__err_msg);
           log::error!("{}", __err);
           return Err(__err);
    };
}

/// Same as log::debug!, but will additionally print to stdout if the print_debug feature is enabled
#[macro_export]
macro_rules! debug {
    ($($arg:tt)+) =>
    {
        #[cfg(print_debug)]
        println!($($arg)+);
        log::debug!($($arg)+);
    }
}

// LOG_ONCE is used to log information about the crate version once
#[cfg(feature = "build-metadata")]
static LOG_ONCE: Once = Once::new();

#[cfg(feature = "build-metadata")]
pub(crate) fn log_build_details() {
    use log::info;
    LOG_ONCE.call_once(|| {
        info!("Package name: {}", built_info::PKG_NAME);
        info!("Package version: {}", built_info::PKG_VERSION);
        info!("Package features: {:?}", built_info::FEATURES);
        info!("Target triple: {}", built_info::TARGET);
        info!("Profile: {}", built_info::PROFILE);
        info!("Rustc: {}", built_info::RUSTC);
        match built_info::GIT_COMMIT_HASH.unwrap_or("") {
            "" => info!("No git commit hash found"),
            other => info!("Git commit hash: {}", other),
        }
        if built_info::GIT_DIRTY.unwrap_or(false) {
            info!("Repo had uncommitted changes");
        }
    });
}
