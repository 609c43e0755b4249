// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

use custom_error::custom_error;

use crate::ExitStatus;

custom_error! {
    pub VmError
    Config{path: String, reason: String} = "Invalid VM config {path}: {reason}",
    InvalidConfig{reason: String} = "Configuration not supported by hypervisor: {reason}",
    BootFailure{reason: String} = "Hypervisor failed to boot: {reason}",
    ProcessCompleted = "Hypervisor process already completed",
    BuildFailure{command: String, code: i32} = "Build step `{command}` failed with exit code {code}",
    Expect{reason: String} = "Reading hypervisor output failed: {reason}",
    Pattern{pattern: String, reason: String} = "Invalid event pattern `{pattern}`: {reason}",
    Interrupt{reason: String} = "Can't install interrupt handler: {reason}",
    Io{source: std::io::Error} = "I/O error",
}

impl VmError {
    /// The process exit status this error maps to when it ends a test.
    pub fn exit_status(&self) -> ExitStatus {
        match self {
            VmError::Config { .. } => ExitStatus::ConfigError,
            VmError::BuildFailure { .. } => ExitStatus::BuildFailed,
            VmError::InvalidConfig { .. } | VmError::BootFailure { .. } => {
                ExitStatus::BootFailed
            }
            VmError::Interrupt { .. } => ExitStatus::Aborted,
            VmError::ProcessCompleted
            | VmError::Expect { .. }
            | VmError::Pattern { .. }
            | VmError::Io { .. } => ExitStatus::CallbackFailed,
        }
    }
}

impl From<rexpect::error::Error> for VmError {
    fn from(e: rexpect::error::Error) -> Self {
        VmError::Expect {
            reason: e.to_string(),
        }
    }
}
