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
use std::thread;
use std::time::Duration;

use hyperlight_testing::guest_code::GuestCode;
use hyperlight_testing::logger::{Logger, LOGGER};
use hyperlight_testing::tracing_subscriber::TracingSubscriber;
use hyperlight_vcpu::hypervisor::handlers::{OutBHandler, OutBHandlerFunction};
use hyperlight_vcpu::{
    is_hypervisor_present, new_hypervisor, new_hypervisor_with_type, CorrelationId,
    HyperlightError, HypervisorState, HypervisorType, RawPtr,
};
use serial_test::serial;
use tracing::Level;

pub mod common;
use common::{guest, guest_with, recording_handler, ENTRYPOINT};

#[test]
fn guest_writes_reach_the_handler_then_the_guest_halts() {
    let (handler, seen) = recording_handler();
    let code = GuestCode::new().outb(0x3F8, b'H').outb(0x3F8, b'i').hlt();
    let (_memory, params) = guest(code, handler);

    let mut hv = new_hypervisor(params).unwrap();
    assert_eq!(hv.state(), HypervisorState::Unconfigured);
    hv.initialise().unwrap();
    assert_eq!(hv.state(), HypervisorState::Initialised);
    hv.execute_until_halt().unwrap();
    assert_eq!(hv.state(), HypervisorState::Halted);
    assert_eq!(*seen.lock().unwrap(), vec![(0x3F8, b'H'), (0x3F8, b'i')]);
    hv.dispose().unwrap();
    assert_eq!(hv.state(), HypervisorState::Disposed);
}

#[test]
fn host_calls_can_be_dispatched_after_the_guest_halts() {
    let (handler, seen) = recording_handler();
    let (_memory, params) = guest_with(
        &[
            (ENTRYPOINT, GuestCode::new().outb(0x80, 1).hlt()),
            (0x1800, GuestCode::new().outb(0x80, 2).hlt()),
        ],
        handler,
    );

    let mut hv = new_hypervisor(params).unwrap();
    hv.initialise().unwrap();
    hv.execute_until_halt().unwrap();
    for _ in 0..3 {
        hv.dispatch_call_from_host(RawPtr::from(0x1800)).unwrap();
    }
    assert_eq!(
        *seen.lock().unwrap(),
        vec![(0x80, 1), (0x80, 2), (0x80, 2), (0x80, 2)]
    );
}

#[test]
fn a_failing_handler_faults_the_instance() {
    let func: OutBHandlerFunction =
        Box::new(|port, _| Err(HyperlightError::Error(format!("port {port:#x} is closed"))));
    let handler = Arc::new(Mutex::new(OutBHandler::from(func)));
    let (_memory, params) = guest(GuestCode::new().outb(0x99, 7).hlt(), handler);

    let mut hv = new_hypervisor_with_type(HypervisorType::Emulated, params).unwrap();
    hv.initialise().unwrap();
    match hv.execute_until_halt().unwrap_err() {
        HyperlightError::OutBHandlerFailure {
            port,
            value,
            source,
        } => {
            assert_eq!((port, value), (0x99, 7));
            assert_eq!(source.to_string(), "port 0x99 is closed");
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(hv.state(), HypervisorState::Faulted);
    assert!(matches!(
        hv.execute_until_halt().unwrap_err(),
        HyperlightError::UsageError {
            operation: "execute_until_halt",
            state: HypervisorState::Faulted
        }
    ));
    hv.dispose().unwrap();
}

#[test]
fn a_spinning_guest_can_be_killed() {
    let (handler, _) = recording_handler();
    let (_memory, params) = guest(GuestCode::new().jmp_self(), handler);

    let mut hv = new_hypervisor(params).unwrap();
    hv.initialise().unwrap();
    let interrupt = hv.interrupt_handle();
    let killer = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        interrupt.kill();
    });
    let err = hv.execute_until_halt().unwrap_err();
    killer.join().unwrap();
    assert!(matches!(err, HyperlightError::ExecutionCanceledByHost()));

    let interrupt = hv.interrupt_handle();
    assert!(!interrupt.dropped());
    hv.dispose().unwrap();
    assert!(interrupt.dropped());
}

#[test]
fn no_hypervisor_without_emulation() {
    let (handler, _) = recording_handler();
    let (_memory, mut params) = guest(GuestCode::new().hlt(), handler);
    params.config.set_allow_emulation(false);

    match new_hypervisor(params) {
        Ok(_) => assert!(is_hypervisor_present()),
        Err(e) => assert!(matches!(e, HyperlightError::NoHypervisorFound())),
    }
}

#[test]
fn spans_carry_the_correlation_id() {
    let (handler, _) = recording_handler();
    let (_memory, params) = guest(GuestCode::new().hlt(), handler);
    let params = params.with_correlation_id(CorrelationId::from("span-test"));

    let subscriber = TracingSubscriber::new(Level::TRACE);
    tracing::subscriber::with_default(subscriber.clone(), || {
        let mut hv = new_hypervisor(params).unwrap();
        hv.initialise().unwrap();
        hv.execute_until_halt().unwrap();
        hv.dispose().unwrap();
    });

    for name in ["initialise", "execute_until_halt"] {
        let spans = subscriber.spans_named(name);
        assert_eq!(spans.len(), 1, "{name}: {spans:?}");
        assert_eq!(spans[0]["correlation_id"], "span-test");
    }
    subscriber.clear();
}

#[test]
#[serial]
fn rejected_operations_are_logged() {
    Logger::initialize_test_logger();
    LOGGER.set_max_level(log::LevelFilter::Error);
    LOGGER.clear_log_calls();

    let (handler, _) = recording_handler();
    let (_memory, params) = guest(GuestCode::new().hlt(), handler);
    let mut hv = new_hypervisor(params).unwrap();
    let err = hv.execute_until_halt().unwrap_err();
    assert!(matches!(
        err,
        HyperlightError::UsageError {
            operation: "execute_until_halt",
            state: HypervisorState::Unconfigured
        }
    ));

    assert!(LOGGER.num_log_calls() >= 1);
    let first = LOGGER.get_log_call(0).unwrap();
    assert_eq!(first.level, log::Level::Error);
    LOGGER.test_log_records(|calls| {
        assert!(calls
            .iter()
            .any(|call| call.args == err.to_string()));
    });
    LOGGER.set_max_level(log::LevelFilter::Off);
}

#[test]
fn kvm_runs_a_real_guest() {
    if !is_hypervisor_present() {
        return;
    }
    let (handler, seen) = recording_handler();
    let (_memory, params) = guest(GuestCode::new().outb(0x3F8, 0x41).hlt(), handler);
    let params = params.with_correlation_id(CorrelationId::from("kvm"));

    let mut hv = new_hypervisor(params).unwrap();
    hv.initialise().unwrap();
    hv.execute_until_halt().unwrap();
    hv.dispatch_call_from_host(RawPtr::from(ENTRYPOINT)).unwrap();
    assert_eq!(*seen.lock().unwrap(), vec![(0x3F8, 0x41), (0x3F8, 0x41)]);
    assert_eq!(hv.correlation_id().as_str(), "kvm");
    hv.dispose().unwrap();
}
