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

//! Every call into the OS or the hypervisor API returns a status code that
//! must be checked before anything else happens. [`NativeCallVerifier`] is
//! the single place where that check is made: it runs the call once,
//! snapshots the OS error that goes with it, and turns a rejected result into
//! a [`HyperlightError::NativeCallFailure`] carrying the operation name, the
//! returned value, what was expected and the instance's [`CorrelationId`].

use std::fmt;

use tracing::{instrument, Span};

use crate::correlation::CorrelationId;
use crate::metrics::{METRIC_NATIVE_CALL_FAILURE, METRIC_NATIVE_CALL_FAILURE_LABEL_OPERATION};
use crate::{HyperlightError, Result};

/// An integer status returned by a native call.
///
/// Implemented for every primitive integer type; `widen` converts the value
/// to an `i128` without loss so failures can report it uniformly.
pub trait NativeStatus: Copy + PartialEq + fmt::Debug {
    /// The value as an `i128`
    fn widen(self) -> i128;
}

macro_rules! impl_native_status {
    ($($t:ty),*) => {
        $(
            impl NativeStatus for $t {
                #[inline]
                fn widen(self) -> i128 {
                    // lossless, every implementing type is at most 64 bits wide
                    self as i128
                }
            }
        )*
    };
}

impl_native_status!(i8, i16, i32, i64, isize, u8, u16, u32, u64, usize);

/// What the caller of a native call was prepared to accept
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Expectation {
    /// Exactly this value
    Equal(i128),
    /// Any value greater than or equal to this one
    AtLeast(i128),
    /// Whatever the caller's predicate accepted
    Predicate,
}

impl fmt::Display for Expectation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expectation::Equal(v) => write!(f, "{}", v),
            Expectation::AtLeast(v) => write!(f, ">= {}", v),
            Expectation::Predicate => write!(f, "a value accepted by the caller"),
        }
    }
}

/// The out-of-band error channel of a calling convention
pub trait LastError: fmt::Debug + Send + Sync {
    /// The error code left behind by the most recent native call on this thread,
    /// `None` if there is none.
    fn last_error(&self) -> Option<i32>;

    /// Reset the error code so a call that does not set one is not blamed
    /// for an earlier call's error
    fn clear(&self) {}
}

/// Reads `errno` (or `GetLastError` on Windows)
#[derive(Debug, Clone, Copy, Default)]
pub struct OsLastError;

impl LastError for OsLastError {
    fn last_error(&self) -> Option<i32> {
        std::io::Error::last_os_error()
            .raw_os_error()
            .filter(|&code| code != 0)
    }

    #[cfg(target_os = "linux")]
    fn clear(&self) {
        // SAFETY: errno is a thread local of the calling thread
        unsafe { *libc::__errno_location() = 0 };
    }
}

/// For calls whose convention has no out-of-band error
#[derive(Debug, Clone, Copy, Default)]
pub struct NoLastError;

impl LastError for NoLastError {
    fn last_error(&self) -> Option<i32> {
        None
    }
}

/// The result of a native call that may be interrupted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeOutcome<T> {
    /// The call returned the expected value
    Completed(T),
    /// The call was rejected with one of the OS errors the caller said it
    /// would handle itself
    Interrupted {
        /// The value the call returned
        actual: T,
        /// The OS error that was reported
        os_error: i32,
    },
}

/// Checks native call results and turns rejected ones into
/// [`HyperlightError::NativeCallFailure`].
///
/// A verifier never retries and never swallows a failure.
#[derive(Clone, Debug)]
pub struct NativeCallVerifier {
    correlation_id: CorrelationId,
    last_error: &'static dyn LastError,
    report_failures: bool,
}

impl NativeCallVerifier {
    /// Create a verifier that reads the OS error after each call
    pub fn new(correlation_id: CorrelationId) -> Self {
        Self::with_last_error(correlation_id, &OsLastError)
    }

    /// Create a verifier with a specific last-error source
    pub fn with_last_error(
        correlation_id: CorrelationId,
        last_error: &'static dyn LastError,
    ) -> Self {
        Self {
            correlation_id,
            last_error,
            report_failures: true,
        }
    }

    /// Failures are still returned but neither logged nor counted. For calls
    /// where a rejection is an expected answer, such as checking whether a
    /// hypervisor is available.
    pub fn without_reporting(mut self) -> Self {
        self.report_failures = false;
        self
    }

    /// The correlation id attached to every failure
    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    /// Invoke `call` once and accept only `expected`
    pub fn verify<T, F>(&self, operation: &'static str, call: F, expected: T) -> Result<T>
    where
        T: NativeStatus,
        F: FnOnce() -> T,
    {
        self.check(
            operation,
            call,
            Expectation::Equal(expected.widen()),
            |actual| actual == expected,
        )
    }

    /// Invoke `call` once and accept whatever `predicate` accepts
    pub fn verify_with<T, F, P>(&self, operation: &'static str, call: F, predicate: P) -> Result<T>
    where
        T: NativeStatus,
        F: FnOnce() -> T,
        P: Fn(T) -> bool,
    {
        self.check(operation, call, Expectation::Predicate, predicate)
    }

    /// Invoke `call` once and accept any value `>= 0`, the convention of calls
    /// that return a file descriptor or a size.
    pub fn verify_non_negative<T, F>(&self, operation: &'static str, call: F) -> Result<T>
    where
        T: NativeStatus,
        F: FnOnce() -> T,
    {
        self.check(operation, call, Expectation::AtLeast(0), non_negative)
    }

    /// Invoke `call` once and accept `expected`. A rejected result whose OS
    /// error is in `interruptions` is handed back as
    /// [`NativeOutcome::Interrupted`] for the caller to act on, every other
    /// rejected result is a failure.
    pub fn verify_interruptible<T, F>(
        &self,
        operation: &'static str,
        call: F,
        expected: T,
        interruptions: &[i32],
    ) -> Result<NativeOutcome<T>>
    where
        T: NativeStatus,
        F: FnOnce() -> T,
    {
        self.last_error.clear();
        let actual = call();
        let os_error = self.last_error.last_error();
        if actual == expected {
            return Ok(NativeOutcome::Completed(actual));
        }
        match os_error {
            Some(code) if interruptions.contains(&code) => Ok(NativeOutcome::Interrupted {
                actual,
                os_error: code,
            }),
            _ => Err(self.failure(
                operation,
                actual.widen(),
                Expectation::Equal(expected.widen()),
                os_error,
            )),
        }
    }

    #[inline]
    fn check<T, F, P>(
        &self,
        operation: &'static str,
        call: F,
        expectation: Expectation,
        accept: P,
    ) -> Result<T>
    where
        T: NativeStatus,
        F: FnOnce() -> T,
        P: Fn(T) -> bool,
    {
        self.last_error.clear();
        let actual = call();
        // must be read before anything else can overwrite it
        let os_error = self.last_error.last_error();
        if accept(actual) {
            Ok(actual)
        } else {
            Err(self.failure(operation, actual.widen(), expectation, os_error))
        }
    }

    #[instrument(skip_all, parent = Span::current(), level = "Trace")]
    fn failure(
        &self,
        operation: &'static str,
        actual: i128,
        expected: Expectation,
        os_error: Option<i32>,
    ) -> HyperlightError {
        let err = HyperlightError::NativeCallFailure {
            operation,
            actual,
            expected,
            os_error,
            correlation_id: self.correlation_id.clone(),
        };
        if self.report_failures {
            log::error!("{}", err);
            metrics::counter!(METRIC_NATIVE_CALL_FAILURE, METRIC_NATIVE_CALL_FAILURE_LABEL_OPERATION => operation)
                .increment(1);
        }
        err
    }
}

/// Accepts any value `>= 0`
pub fn non_negative<T: NativeStatus>(value: T) -> bool {
    value.widen() >= 0
}

/// Accepts only `0`
pub fn zero<T: NativeStatus>(value: T) -> bool {
    value.widen() == 0
}
