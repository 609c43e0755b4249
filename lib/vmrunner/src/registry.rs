// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Registry of running processes, so an interrupt can clean all of them up.

use std::sync::{Arc, Mutex, MutexGuard};

use log::info;

use crate::color;
use crate::error::VmError;
use crate::process::Terminator;
use crate::ExitStatus;

/// Shared list of live process trees.
///
/// Clones share the same list. A session registers its hypervisor while it
/// runs; the scheduler registers every test it spawns.
#[derive(Debug, Clone, Default)]
pub struct VmRegistry {
    inner: Arc<Mutex<Vec<Terminator>>>,
}

impl VmRegistry {
    pub fn new() -> VmRegistry {
        VmRegistry::default()
    }

    fn entries(&self) -> MutexGuard<'_, Vec<Terminator>> {
        match self.inner.lock() {
            Ok(entries) => entries,
            // The list stays consistent even if a holder panicked.
            Err(pe) => pe.into_inner(),
        }
    }

    pub fn register(&self, terminator: Terminator) {
        let mut entries = self.entries();
        if !entries.contains(&terminator) {
            entries.push(terminator);
        }
    }

    pub fn unregister(&self, terminator: &Terminator) {
        self.entries().retain(|t| t != terminator);
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// Signals every registered process tree and empties the registry.
    pub fn terminate_all(&self) -> usize {
        let entries: Vec<Terminator> = self.entries().drain(..).collect();
        for t in entries.iter() {
            info!("Terminating PID {}", t.pid());
            t.terminate();
        }
        entries.len()
    }

    /// Installs the process-wide Ctrl-C handler.
    ///
    /// On interrupt everything in this registry is terminated and the
    /// process exits with [`ExitStatus::Aborted`]. Can only be installed
    /// once per process.
    pub fn install_interrupt_handler(&self) -> Result<(), VmError> {
        let registry = self.clone();
        ctrlc::set_handler(move || {
            println!("{}", color::warning("Process interrupted, stopping VMs"));
            registry.terminate_all();
            std::process::exit(ExitStatus::Aborted.code());
        })
        .map_err(|e| VmError::Interrupt {
            reason: e.to_string(),
        })
    }
}
