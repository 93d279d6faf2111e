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

use tracing::{instrument, Span};

use crate::{HyperlightError, Result};

/// The trait representing custom logic to handle the case when
/// a Hypervisor's virtual CPU (vCPU) informs the host the guest
/// has executed an `out` instruction.
pub trait OutBHandlerCaller: Sync + Send {
    /// Function that gets called when an outb operation has occurred.
    fn call(&mut self, port: u16, value: u8) -> Result<()>;
}

/// A convenient type representing a common way `OutBHandler` implementations
/// are passed as parameters to functions
///
/// Note: This needs to be wrapped in a Mutex to be able to grab a mutable
/// reference to the underlying data.
pub type OutBHandlerWrapper = Arc<Mutex<dyn OutBHandlerCaller>>;

/// The closure an `OutBHandler` calls for every port write
pub type OutBHandlerFunction = Box<dyn FnMut(u16, u8) -> Result<()> + Send>;

/// A `OutBHandler` implementation using a `OutBHandlerFunction`
///
/// Note: This handler must live no longer than the hypervisor to which it belongs
pub struct OutBHandler(Arc<Mutex<OutBHandlerFunction>>);

impl From<OutBHandlerFunction> for OutBHandler {
    #[instrument(skip_all, parent = Span::current(), level = "Trace")]
    fn from(func: OutBHandlerFunction) -> Self {
        Self(Arc::new(Mutex::new(func)))
    }
}

impl OutBHandlerCaller for OutBHandler {
    #[instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace")]
    fn call(&mut self, port: u16, value: u8) -> Result<()> {
        let mut func = self.0.try_lock()?;
        func(port, value)
    }
}

/// Call `handler` for a port write and wrap whatever it fails with in
/// `OutBHandlerFailure`. A handler that is already locked, for example
/// because it is being re-entered, fails with `LockAttemptFailed`.
#[instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace")]
pub(crate) fn call_outb_handler(handler: &OutBHandlerWrapper, port: u16, value: u8) -> Result<()> {
    let mut caller = handler.try_lock()?;
    caller
        .call(port, value)
        .map_err(|source| HyperlightError::OutBHandlerFailure {
            port,
            value,
            source: Box::new(source),
        })
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::new_error;

    fn recording() -> (OutBHandlerWrapper, Arc<Mutex<Vec<(u16, u8)>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let func: OutBHandlerFunction = Box::new(move |port, value| {
            sink.lock().unwrap().push((port, value));
            Ok(())
        });
        (Arc::new(Mutex::new(OutBHandler::from(func))), seen)
    }

    #[test]
    fn writes_reach_the_handler_in_order() {
        let (handler, seen) = recording();
        call_outb_handler(&handler, 0x3f8, b'h').unwrap();
        call_outb_handler(&handler, 0x3f8, b'i').unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![(0x3f8, b'h'), (0x3f8, b'i')]);
    }

    #[test]
    fn handler_errors_are_wrapped_with_the_trap() {
        let func: OutBHandlerFunction = Box::new(|_, _| Err(new_error!("bad port")));
        let handler: OutBHandlerWrapper = Arc::new(Mutex::new(OutBHandler::from(func)));
        match call_outb_handler(&handler, 0x99, 7) {
            Err(HyperlightError::OutBHandlerFailure {
                port,
                value,
                source,
            }) => {
                assert_eq!((port, value), (0x99, 7));
                assert!(matches!(*source, HyperlightError::Error(ref m) if m == "bad port"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn a_held_handler_is_not_waited_on() {
        let (handler, seen) = recording();
        let _held = handler.lock().unwrap();
        assert!(matches!(
            call_outb_handler(&handler, 0x3f8, 0),
            Err(HyperlightError::LockAttemptFailed(_))
        ));
        assert!(seen.lock().unwrap().is_empty());
    }
}
