// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Boots a unikernel image inside a hypervisor, watches its console output
//! and reduces everything that happens to a single exit status.
//!
//! A test program typically looks like this:
//!
//! ```no_run
//! use vmrunner::{BootOptions, Vm};
//!
//! let mut vm = Vm::from_dir(".").expect("no usable vm.json");
//! vm.on_output("Got IP", |_vm, line| line.contains("10.0.0.45"))
//!     .expect("valid pattern");
//! let status = vm.boot(&BootOptions::new().timeout(30));
//! std::process::exit(status.code());
//! ```

use std::fmt::{self, Display, Formatter};

pub mod builder;
pub mod color;
pub mod config;
pub mod error;
pub mod events;
pub mod hypervisor;
pub mod process;
pub mod proctree;
pub mod qemu;
pub mod registry;
pub mod session;
pub mod solo5;

pub use config::VmConfig;
pub use error::VmError;
pub use events::Verdict;
pub use hypervisor::Hypervisor;
pub use registry::VmRegistry;
pub use session::{BootOptions, Vm, VmControl};

/// Different exit status codes a test process (and a VM session) can end with.
///
/// Anything we don't know about is the guest's own status and passed through.
#[derive(Eq, PartialEq, Debug, Clone, Copy)]
pub enum ExitStatus {
    /// Successful exit.
    Success,
    /// The session timer fired before the guest reported anything conclusive.
    Timeout,
    /// Guest printed its panic signature.
    VmPanic,
    /// A registered event callback returned `false` or failed.
    CallbackFailed,
    /// An external build step (make, cmake) failed.
    BuildFailed,
    /// Interrupted by the user (Ctrl-C).
    Aborted,
    /// Guest output ended with an end-of-transmission byte.
    VmEot,
    /// The hypervisor never came up.
    BootFailed,
    /// The VM configuration could not be loaded.
    ConfigError,
    /// The scheduler had nothing to run.
    NoTests,
    /// Status reported by the guest itself.
    Guest(i32),
}

impl ExitStatus {
    pub fn code(&self) -> i32 {
        match self {
            ExitStatus::Success => 0,
            ExitStatus::Timeout => 66,
            ExitStatus::VmPanic => 67,
            ExitStatus::CallbackFailed => 68,
            ExitStatus::BuildFailed => 69,
            ExitStatus::Aborted => 70,
            ExitStatus::VmEot => 71,
            ExitStatus::BootFailed => 72,
            ExitStatus::ConfigError => 73,
            ExitStatus::NoTests => 74,
            ExitStatus::Guest(code) => *code,
        }
    }

    /// Name used for the status in summaries and reports.
    pub fn name(&self) -> &'static str {
        match self {
            ExitStatus::Success => "SUCCESS",
            ExitStatus::Timeout => "TIMEOUT",
            ExitStatus::VmPanic => "VM_PANIC",
            ExitStatus::CallbackFailed => "CALLBACK_FAILED",
            ExitStatus::BuildFailed => "BUILD_FAIL",
            ExitStatus::Aborted => "ABORT",
            ExitStatus::VmEot => "VM_EOT",
            ExitStatus::BootFailed => "BOOT_FAILED",
            ExitStatus::ConfigError => "BAD_CONFIG",
            ExitStatus::NoTests => "NO_TESTS",
            ExitStatus::Guest(_) => "GUEST_STATUS",
        }
    }

    pub fn is_success(&self) -> bool {
        *self == ExitStatus::Success
    }
}

impl From<i32> for ExitStatus {
    fn from(exit_code: i32) -> Self {
        match exit_code {
            0 => ExitStatus::Success,
            66 => ExitStatus::Timeout,
            67 => ExitStatus::VmPanic,
            68 => ExitStatus::CallbackFailed,
            69 => ExitStatus::BuildFailed,
            70 => ExitStatus::Aborted,
            71 => ExitStatus::VmEot,
            72 => ExitStatus::BootFailed,
            73 => ExitStatus::ConfigError,
            74 => ExitStatus::NoTests,
            _ => ExitStatus::Guest(exit_code),
        }
    }
}

impl From<ExitStatus> for i32 {
    fn from(status: ExitStatus) -> i32 {
        status.code()
    }
}

impl Display for ExitStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let desc = match self {
            ExitStatus::Success => "Success!".to_string(),
            ExitStatus::Timeout => "Timeout: VM did not finish in time".to_string(),
            ExitStatus::VmPanic => "VmPanic: Guest printed its panic signature".to_string(),
            ExitStatus::CallbackFailed => {
                "CallbackFailed: An output callback asserted failure".to_string()
            }
            ExitStatus::BuildFailed => "BuildFailed: Building the service failed".to_string(),
            ExitStatus::Aborted => "Aborted: Process interrupted by user".to_string(),
            ExitStatus::VmEot => "VmEot: Guest output ended unexpectedly".to_string(),
            ExitStatus::BootFailed => "BootFailed: Hypervisor failed to start".to_string(),
            ExitStatus::ConfigError => "ConfigError: Could not load VM config".to_string(),
            ExitStatus::NoTests => "NoTests: No tests were selected".to_string(),
            ExitStatus::Guest(code) => format!("Guest exited with status {}", code),
        };

        write!(f, "{} ({})", desc, self.name())
    }
}
