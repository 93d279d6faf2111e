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

use std::error::Error;
use std::num::TryFromIntError;
use std::sync::{MutexGuard, PoisonError, TryLockError};

use thiserror::Error;

use crate::correlation::CorrelationId;
use crate::hypervisor::HypervisorState;
use crate::native_call::Expectation;

/// The error type for hypervisor operations
#[derive(Error, Debug)]
pub enum HyperlightError {
    /// Memory access out of bounds
    #[error("Offset: {0} out of bounds, Max is: {1}")]
    BoundsCheckFailed(u64, usize),

    /// A generic error with a message
    #[error("{0}")]
    Error(String),

    /// Guest execution was cancelled by the host
    #[error("Execution was cancelled by the host.")]
    ExecutionCanceledByHost(),

    /// The guest stopped for a reason other than a halt, or the run
    /// loop could not continue. Carries the raw exit reason.
    #[error("Guest execution failed: {0}")]
    GuestExecutionFailure(String),

    /// The VM or vCPU could not be set up
    #[error("Hypervisor setup failed: {0}")]
    HypervisorSetupFailure(String),

    /// Reading Writing or Seeking data failed.
    #[error("Reading Writing or Seeking data failed {0:?}")]
    IOError(#[from] std::io::Error),

    /// Failed to convert to Integer
    #[error("Failed To Convert Size to usize")]
    IntConversionFailure(#[from] TryFromIntError),

    /// An attempt to get a lock from a Mutex failed.
    #[error("Unable to lock resource")]
    LockAttemptFailed(String),

    /// A native OS or hypervisor call returned a value its caller did not accept
    #[error(
        "Native call {operation} returned {actual}, expected {expected} (os error: {os_error:?}, correlation id: {correlation_id})"
    )]
    NativeCallFailure {
        /// The name of the native operation
        operation: &'static str,
        /// The value the call returned
        actual: i128,
        /// What the caller accepted
        expected: Expectation,
        /// The OS error code captured right after the call, if any
        os_error: Option<i32>,
        /// The correlation id of the instance that made the call
        correlation_id: CorrelationId,
    },

    /// No Hypervisor was found and emulation was not allowed
    #[error("No Hypervisor was found")]
    NoHypervisorFound(),

    /// The outb handler failed while handling a guest port write
    #[error("Outb handler failed for port {port:#x} value {value:#x}: {source}")]
    OutBHandlerFailure {
        /// The port the guest wrote to
        port: u16,
        /// The byte the guest wrote
        value: u8,
        /// The error returned by the handler
        #[source]
        source: Box<HyperlightError>,
    },

    /// An operation was requested in a lifecycle state that does not allow it
    #[error("{operation} is not allowed when the hypervisor is {state:?}")]
    UsageError {
        /// The rejected operation
        operation: &'static str,
        /// The state the instance was in
        state: HypervisorState,
    },

    /// vmm sys Error Occurred
    #[error("vmm sys Error {0:?}")]
    #[cfg(target_os = "linux")]
    VmmSysError(#[from] vmm_sys_util::errno::Error),
}

impl From<&str> for HyperlightError {
    fn from(s: &str) -> Self {
        HyperlightError::Error(s.to_string())
    }
}

impl<T: ?Sized> From<PoisonError<MutexGuard<'_, T>>> for HyperlightError {
    // Implemented this way rather than passing the error as a source to LockAttemptFailed as that would require
    // Box<dyn Error + Send + Sync> which is not easy to implement for PoisonError<MutexGuard<'_, T>>
    fn from(e: PoisonError<MutexGuard<'_, T>>) -> Self {
        let source = match e.source() {
            Some(s) => s.to_string(),
            None => e.to_string(),
        };
        HyperlightError::LockAttemptFailed(source)
    }
}

impl<T: ?Sized> From<TryLockError<MutexGuard<'_, T>>> for HyperlightError {
    fn from(e: TryLockError<MutexGuard<'_, T>>) -> Self {
        HyperlightError::LockAttemptFailed(e.to_string())
    }
}

/// Creates a `HyperlightError::Error` from a string literal or format string
#[macro_export]
macro_rules! new_error {
    ($msg:literal $(,)?) => {{
        let __args = std::format_args!($msg);
        let __err_msg = match __args.as_str() {
            Some(msg) => String::from(msg),
            None => std::format!($msg),
        };
        $crate::HyperlightError::Error(__err_msg)
    }};
    ($fmtstr:expr, $($arg:tt)*) => {{
           let __err_msg = std::format!($fmtstr, $($arg)*);
           $crate::error::HyperlightError::Error(__err_msg)
    }};
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    #[test]
    fn try_lock_on_held_mutex_is_lock_attempt_failed() {
        let m = Arc::new(Mutex::new(0));
        let _held = m.lock().unwrap();
        let err: HyperlightError = m.try_lock().unwrap_err().into();
        assert!(matches!(err, HyperlightError::LockAttemptFailed(_)));
    }

    #[test]
    fn outb_failure_keeps_handler_error_as_source() {
        let err = HyperlightError::OutBHandlerFailure {
            port: 0x3f8,
            value: 0x41,
            source: Box::new(new_error!("handler said no")),
        };
        let source = err.source().unwrap();
        assert_eq!(source.to_string(), "handler said no");
        assert!(err.to_string().contains("0x3f8"));
    }

    #[test]
    fn usage_error_names_operation_and_state() {
        let err = HyperlightError::UsageError {
            operation: "execute_until_halt",
            state: HypervisorState::Unconfigured,
        };
        assert_eq!(
            err.to_string(),
            "execute_until_halt is not allowed when the hypervisor is Unconfigured"
        );
    }
}
