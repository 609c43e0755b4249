// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Session scenarios against a scripted hypervisor.
//!
//! Every test installs a small shell script as the QEMU binary. The script
//! plays the guest: it prints console lines, exits or hangs, and the session
//! has to arrive at the right exit status.
//!
//! * `s00_*`: How a single boot ends (markers, timeout, panic, callbacks)

mod common;

use std::cell::Cell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use vmrunner::{ExitStatus, Vm};

use common::{options, scripted_vm, serialize};

/// A service-exit marker with status 0 ends the boot successfully and runs
/// the success hook exactly once.
#[test]
fn s00_service_exit_success() {
    let _guard = serialize();
    let dir = tempfile::tempdir().unwrap();
    let config = scripted_vm(
        dir.path(),
        "sleep 1\necho 'Booting'\necho 'Service::start() returned with status 0'\nexec sleep 30",
    );

    let exits = Rc::new(Cell::new(0));
    let successes = Rc::new(Cell::new(0));
    let mut vm = Vm::from_config(&config);
    let e = exits.clone();
    vm.on_exit(move |_vm| e.set(e.get() + 1));
    let s = successes.clone();
    vm.on_exit_success(move |_vm| s.set(s.get() + 1));

    let status = vm.boot(&options(20));
    assert_eq!(status, ExitStatus::Success);
    assert_eq!(exits.get(), 1);
    assert_eq!(successes.get(), 1);
}

/// The guest's own status from the marker is passed through.
#[test]
fn s00_service_exit_status() {
    let _guard = serialize();
    let dir = tempfile::tempdir().unwrap();
    let config = scripted_vm(
        dir.path(),
        "sleep 1\necho '     [ Kernel ] service exited with status 3'\nexec sleep 30",
    );

    let successes = Rc::new(Cell::new(0));
    let mut vm = Vm::from_config(&config);
    let s = successes.clone();
    vm.on_exit_success(move |_vm| s.set(s.get() + 1));

    assert_eq!(vm.boot(&options(20)), ExitStatus::Guest(3));
    assert_eq!(successes.get(), 0);
}

/// The built-in success pattern ends the boot.
#[test]
fn s00_success_pattern() {
    let _guard = serialize();
    let dir = tempfile::tempdir().unwrap();
    let config = scripted_vm(dir.path(), "sleep 1\necho 'SUCCESS'\nexec sleep 30");

    let mut vm = Vm::from_config(&config);
    assert_eq!(vm.boot(&options(20)), ExitStatus::Success);
}

/// A guest that never prints anything conclusive times out, the hypervisor
/// is stopped and the timeout hook runs.
#[test]
fn s00_timeout() {
    let _guard = serialize();
    let dir = tempfile::tempdir().unwrap();
    let config = scripted_vm(dir.path(), "echo 'Booting'\nexec sleep 60");

    let timeouts = Rc::new(Cell::new(0));
    let successes = Rc::new(Cell::new(0));
    let mut vm = Vm::from_config(&config);
    let t = timeouts.clone();
    vm.on_timeout(move |_vm| t.set(t.get() + 1));
    let s = successes.clone();
    vm.on_exit_success(move |_vm| s.set(s.get() + 1));

    let start = Instant::now();
    let status = vm.boot(&options(2));
    let elapsed = start.elapsed();

    assert_eq!(status, ExitStatus::Timeout);
    assert_eq!(status.code(), 66);
    assert!(elapsed >= Duration::from_secs(2));
    assert!(elapsed < Duration::from_secs(15));
    assert_eq!(timeouts.get(), 1);
    assert_eq!(successes.get(), 0);
    assert!(vm.control().poll().is_some());
}

/// The panic signature reads the detail line and drains until EOT.
#[test]
fn s00_panic() {
    let _guard = serialize();
    let dir = tempfile::tempdir().unwrap();
    let config = scripted_vm(
        dir.path(),
        "sleep 1\nprintf '\\025\\007\\t**** PANIC ****\\n'\necho 'Heap exhausted'\necho 'frame 0'\nprintf '\\004'\nexec sleep 30",
    );

    let mut vm = Vm::from_config(&config);
    let status = vm.boot(&options(20));
    assert_eq!(status, ExitStatus::VmPanic);
    assert_eq!(status.code(), 67);
    assert_eq!(vm.message(), "Heap exhausted");
}

/// Custom panic handlers run in addition to the default behavior.
#[test]
fn s00_panic_handler_composes() {
    let _guard = serialize();
    let dir = tempfile::tempdir().unwrap();
    let config = scripted_vm(
        dir.path(),
        "sleep 1\nprintf '\\025\\007\\t**** PANIC ****\\n'\necho 'bad'\nprintf '\\004'\nexec sleep 30",
    );

    let seen = Rc::new(Cell::new(0));
    let mut vm = Vm::from_config(&config);
    let s = seen.clone();
    vm.on_panic(move |_vm, _line| s.set(s.get() + 1), true);

    assert_eq!(vm.boot(&options(20)), ExitStatus::VmPanic);
    assert_eq!(seen.get(), 1);
}

/// A callback returning false fails the boot and nothing after that line is
/// looked at.
#[test]
fn s00_callback_failure() {
    let _guard = serialize();
    let dir = tempfile::tempdir().unwrap();
    let config = scripted_vm(
        dir.path(),
        "sleep 1\necho 'Got IP 10.0.0.2'\necho 'SUCCESS'\nexec sleep 30",
    );

    let later = Rc::new(Cell::new(0));
    let mut vm = Vm::from_config(&config);
    vm.on_output("Got IP", |_vm, line| line.contains("10.0.0.45"))
        .unwrap();
    let l = later.clone();
    vm.on_success(move |_vm, _line| l.set(l.get() + 1), true);

    let status = vm.boot(&options(20));
    assert_eq!(status, ExitStatus::CallbackFailed);
    assert_eq!(status.code(), 68);
    assert_eq!(later.get(), 0);
}

/// A panicking callback counts as a failed callback.
#[test]
fn s00_callback_panic() {
    let _guard = serialize();
    let dir = tempfile::tempdir().unwrap();
    let config = scripted_vm(dir.path(), "sleep 1\necho 'boom'\nexec sleep 30");

    let mut vm = Vm::from_config(&config);
    vm.on_output("boom", |_vm, line| {
        if line.contains("boom") {
            panic!("callback exploded");
        }
        true
    })
    .unwrap();

    assert_eq!(vm.boot(&options(20)), ExitStatus::CallbackFailed);
}

/// An EOT line ends the boot, later lines don't fire any rule.
#[test]
fn s00_eot() {
    let _guard = serialize();
    let dir = tempfile::tempdir().unwrap();
    let config = scripted_vm(
        dir.path(),
        "sleep 1\necho 'one'\nprintf '\\004\\n'\necho 'after'\nexec sleep 30",
    );

    let after = Rc::new(Cell::new(0));
    let mut vm = Vm::from_config(&config);
    let a = after.clone();
    vm.on_output("after", move |_vm, _line| a.set(a.get() + 1))
        .unwrap();

    let status = vm.boot(&options(20));
    assert_eq!(status, ExitStatus::VmEot);
    assert_eq!(status.code(), 71);
    assert_eq!(after.get(), 0);
}

/// A hypervisor that dies right away did not boot.
#[test]
fn s00_boot_failure() {
    let _guard = serialize();
    let dir = tempfile::tempdir().unwrap();
    let config = scripted_vm(dir.path(), "echo 'could not open disk'\nexit 3");

    let exits = Rc::new(Cell::new(0));
    let mut vm = Vm::from_config(&config);
    let e = exits.clone();
    vm.on_exit(move |_vm| e.set(e.get() + 1));

    let status = vm.boot(&options(20));
    assert_eq!(status, ExitStatus::BootFailed);
    assert_eq!(status.code(), 72);
    assert!(vm.message().contains("status 3"));
    assert_eq!(exits.get(), 1);
}

/// Without markers the hypervisor's own exit code is the result, including
/// lines that were still buffered when it exited.
#[test]
fn s00_hypervisor_exit_code() {
    let _guard = serialize();
    let dir = tempfile::tempdir().unwrap();
    let config = scripted_vm(dir.path(), "sleep 1\necho 'bye'\nexit 5");
    let mut vm = Vm::from_config(&config);
    assert_eq!(vm.boot(&options(20)), ExitStatus::Guest(5));

    let config = scripted_vm(dir.path(), "sleep 1\nprintf 'returned with status 0'\nexit 9");
    let mut vm = Vm::from_config(&config);
    assert_eq!(vm.boot(&options(20)), ExitStatus::Success);
}

/// A failed assertion wins over the success sentinel on the same line.
#[test]
fn s00_assertion_before_success_on_same_line() {
    let _guard = serialize();
    let dir = tempfile::tempdir().unwrap();
    let config = scripted_vm(
        dir.path(),
        "sleep 1\necho 'Got IP 10.0.0.2 SUCCESS'\nexec sleep 30",
    );

    let successes = Rc::new(Cell::new(0));
    let mut vm = Vm::from_config(&config);
    vm.on_output("Got IP", |_vm, line| line.contains("10.0.0.45"))
        .unwrap();
    let s = successes.clone();
    vm.on_exit_success(move |_vm| s.set(s.get() + 1));

    assert_eq!(vm.boot(&options(20)), ExitStatus::CallbackFailed);
    assert_eq!(successes.get(), 0);
}

/// A hypervisor exiting on its own shortly before the timeout keeps its
/// own status and the timeout hook doesn't run.
#[test]
fn s00_hypervisor_exit_before_timeout() {
    let _guard = serialize();
    let dir = tempfile::tempdir().unwrap();
    let config = scripted_vm(dir.path(), "sleep 1\necho 'bye'\nexit 5");

    let timeouts = Rc::new(Cell::new(0));
    let mut vm = Vm::from_config(&config);
    let t = timeouts.clone();
    vm.on_timeout(move |_vm| t.set(t.get() + 1));

    assert_eq!(vm.boot(&options(3)), ExitStatus::Guest(5));
    assert_eq!(timeouts.get(), 0);
    assert_eq!(vm.control().poll(), Some(5));
}
