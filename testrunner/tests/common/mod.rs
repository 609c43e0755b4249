// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Builds small test trees whose tests are shell scripts.

#![allow(dead_code)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use lazy_static::lazy_static;

use testrunner::{discover, Scheduler, TestDescriptor};

lazy_static! {
    /// Scripts are written and executed by one test at a time, a script
    /// still open for writing in a concurrently forked child can't run.
    static ref TREE_LOCK: Mutex<()> = Mutex::new(());
}

pub fn serialize() -> MutexGuard<'static, ()> {
    let _r = env_logger::try_init();
    match TREE_LOCK.lock() {
        Ok(guard) => guard,
        Err(pe) => pe.into_inner(),
    }
}

pub fn write_script(path: &Path, body: &str) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    fs::set_permissions(path, fs::Permissions::from_mode(0o755)).unwrap();
}

/// Adds `<category>/integration/<leaf>` with `vm_json` and a `test.sh`.
pub fn integration_test(root: &Path, category: &str, leaf: &str, vm_json: &str, body: &str) {
    let dir = root.join(category).join("integration").join(leaf);
    write_script(&dir.join("test.sh"), body);
    fs::write(dir.join("vm.json"), vm_json).unwrap();
}

pub fn tests_in(root: &Path) -> Vec<TestDescriptor> {
    discover(root, &[], &[]).unwrap()
}

pub fn scheduler(max_parallel: usize) -> Scheduler {
    Scheduler::new()
        .max_parallel(max_parallel)
        .poll_interval(Duration::from_millis(50))
}
