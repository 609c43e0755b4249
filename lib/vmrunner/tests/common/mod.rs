// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Helpers for running sessions against a scripted stand-in hypervisor.

#![allow(dead_code)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use lazy_static::lazy_static;
use serde_json::json;

use vmrunner::{BootOptions, VmConfig};

lazy_static! {
    /// Sessions run one at a time, a script that is still open for writing
    /// in a concurrently forked child can't be executed.
    static ref SESSION_LOCK: Mutex<()> = Mutex::new(());
}

pub fn serialize() -> MutexGuard<'static, ()> {
    let _r = env_logger::try_init();
    match SESSION_LOCK.lock() {
        Ok(guard) => guard,
        // Another test failed, the lock guards no state.
        Err(pe) => pe.into_inner(),
    }
}

/// Installs `script` as the QEMU binary of a VM without network devices.
pub fn scripted_vm(dir: &Path, script: &str) -> VmConfig {
    let path = dir.join("fake-qemu");
    fs::write(&path, format!("#!/bin/sh\n{}\n", script)).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();

    let document = json!({
        "image": "ok.img",
        "net": [],
        "qemu": path.display().to_string(),
    });
    VmConfig::from_json(&document.to_string()).unwrap()
}

/// Disk boot, so the stand-in doesn't need a real kernel image.
pub fn options(timeout: u64) -> BootOptions {
    BootOptions::new().multiboot(false).timeout(timeout)
}
