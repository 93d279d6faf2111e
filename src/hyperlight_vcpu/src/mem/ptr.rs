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

use std::fmt;

use tracing::{instrument, Span};

use crate::error::HyperlightError;
use crate::Result;

/// A raw address in the guest's address space, such as the parameter block
/// handed to the entry point or the dispatch function of a host call.
///
/// Use this type to distinguish a guest address from a host pointer or an offset.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct RawPtr(u64);

impl From<u64> for RawPtr {
    #[instrument(skip_all, parent = Span::current(), level = "Trace")]
    fn from(val: u64) -> Self {
        Self(val)
    }
}

impl TryFrom<usize> for RawPtr {
    type Error = HyperlightError;
    #[instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace")]
    fn try_from(val: usize) -> Result<Self> {
        let val_u64 = u64::try_from(val)?;
        Ok(Self::from(val_u64))
    }
}

impl TryFrom<RawPtr> for usize {
    type Error = HyperlightError;
    #[instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace")]
    fn try_from(val: RawPtr) -> Result<usize> {
        Ok(usize::try_from(val.0)?)
    }
}

impl From<RawPtr> for u64 {
    #[instrument(skip_all, parent = Span::current(), level = "Trace")]
    fn from(val: RawPtr) -> u64 {
        val.0
    }
}

impl From<&RawPtr> for u64 {
    #[instrument(skip_all, parent = Span::current(), level = "Trace")]
    fn from(val: &RawPtr) -> u64 {
        val.0
    }
}

impl fmt::LowerHex for RawPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

#[cfg(test)]
mod tests {
    use super::RawPtr;

    #[test]
    fn round_trips_through_integers() {
        let ptr = RawPtr::from(0x230000);
        assert_eq!(u64::from(ptr), 0x230000);
        assert_eq!(u64::from(&ptr), 0x230000);
        assert_eq!(usize::try_from(ptr).unwrap(), 0x230000);
        assert_eq!(RawPtr::try_from(0x1000usize).unwrap(), RawPtr::from(0x1000));
        assert_eq!(format!("{:#x}", ptr), "0x230000");
    }
}
