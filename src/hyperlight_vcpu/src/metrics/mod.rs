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

// Counter metric that counts the number of times a guest run was cancelled by the host
pub(crate) static METRIC_GUEST_CANCELLATION: &str = "guest_cancellations_total";

// Counter metric that counts guest runs that ended in anything other than a halt or a cancellation
pub(crate) static METRIC_GUEST_EXECUTION_FAILURE: &str = "guest_execution_failures_total";

// Counter metric that counts native calls whose result was rejected, labelled by operation
pub(crate) static METRIC_NATIVE_CALL_FAILURE: &str = "native_call_failures_total";
pub(crate) static METRIC_NATIVE_CALL_FAILURE_LABEL_OPERATION: &str = "operation";
