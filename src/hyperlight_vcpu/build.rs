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

use anyhow::Result;

fn main() -> Result<()> {
    println!("cargo:rerun-if-changed=build.rs");

    // Code is gated on #[cfg(kvm)], never on #[cfg(feature = "kvm")], so the
    // feature is a no-op on hosts without KVM.
    cfg_aliases::cfg_aliases! {
        kvm: { all(feature = "kvm", target_os = "linux") },
        // print_debug is only honoured in debug builds.
        print_debug: { all(feature = "print_debug", debug_assertions) },
    }

    #[cfg(feature = "build-metadata")]
    built::write_built_file()?;

    Ok(())
}
