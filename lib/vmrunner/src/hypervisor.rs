// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The closed set of hypervisor backends behind one process-control surface.

use crate::config::VmConfig;
use crate::error::VmError;
use crate::process::{Terminator, VmProcess};
use crate::qemu::Qemu;
use crate::solo5::Solo5;

pub enum Hypervisor {
    Qemu(Qemu),
    Solo5(Solo5),
}

impl Hypervisor {
    pub fn qemu(config: &VmConfig) -> Hypervisor {
        Hypervisor::Qemu(Qemu::new(config))
    }

    pub fn solo5(config: &VmConfig) -> Hypervisor {
        Hypervisor::Solo5(Solo5::new(config))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Hypervisor::Qemu(_) => "Qemu",
            Hypervisor::Solo5(_) => "Solo5",
        }
    }

    /// The executable this backend runs.
    pub fn binary(&self) -> &str {
        match self {
            Hypervisor::Qemu(q) => q.binary(),
            Hypervisor::Solo5(s) => s.binary(),
        }
    }

    /// Is the backend binary installed?
    pub fn available(&self) -> bool {
        which::which(self.binary()).is_ok()
    }

    pub fn config(&self) -> &VmConfig {
        match self {
            Hypervisor::Qemu(q) => q.config(),
            Hypervisor::Solo5(s) => s.config(),
        }
    }

    /// Starts the hypervisor, stopping a previous instance first.
    pub fn boot(
        &mut self,
        multiboot: bool,
        debug: bool,
        kernel_args: &str,
        image: Option<&str>,
    ) -> Result<(), VmError> {
        self.stop();
        match self {
            Hypervisor::Qemu(q) => q.boot(multiboot, debug, kernel_args, image),
            Hypervisor::Solo5(s) => s.boot(multiboot, debug, kernel_args, image),
        }
    }

    fn process_mut(&mut self) -> Option<&mut VmProcess> {
        match self {
            Hypervisor::Qemu(q) => q.process_mut(),
            Hypervisor::Solo5(s) => s.process_mut(),
        }
    }

    fn process(&self) -> Option<&VmProcess> {
        match self {
            Hypervisor::Qemu(q) => q.process(),
            Hypervisor::Solo5(s) => s.process(),
        }
    }

    fn running(&mut self) -> Result<&mut VmProcess, VmError> {
        self.process_mut().ok_or(VmError::ProcessCompleted)
    }

    /// Handle for signaling the running process from another thread.
    pub fn terminator(&self) -> Option<Terminator> {
        self.process().map(|p| p.terminator())
    }

    pub fn stop(&mut self) {
        if let Some(p) = self.process_mut() {
            p.stop();
        }
    }

    pub fn wait(&mut self) -> Option<i32> {
        self.process_mut().and_then(|p| p.wait())
    }

    pub fn poll(&mut self) -> Option<i32> {
        self.process_mut().and_then(|p| p.poll())
    }

    pub fn read_line(&mut self) -> Result<String, VmError> {
        self.running()?.read_line()
    }

    pub fn write_line(&mut self, line: &str) -> Result<(), VmError> {
        self.running()?.write_line(line)
    }

    pub fn read_until(&mut self, sentinel: u8) -> Result<String, VmError> {
        self.running()?.read_until(sentinel)
    }

    /// Output still buffered after the process closed its console.
    pub fn final_output(&mut self) -> String {
        self.process_mut()
            .map(|p| p.final_output())
            .unwrap_or_default()
    }
}
