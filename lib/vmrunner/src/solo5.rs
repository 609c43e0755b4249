// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The solo5 `hvt` monitor.
//!
//! Much smaller surface than QEMU: one disk, one fixed tap device and the
//! kernel arguments as a single trailing token.

use log::{info, warn};

use crate::config::{DriveFormat, MediaType, VmConfig};
use crate::error::VmError;
use crate::process::{VmProcess, PRIVILEGE_WRAPPER};

pub const SOLO5_HVT: &str = "solo5-hvt";

/// Tap device the monitor attaches its network interface to.
pub const SOLO5_TAP: &str = "tap100";

/// Disk passed when the config has none, hvt always wants one.
pub const DUMMY_DISK: &str = "dummy.disk";

pub struct Solo5 {
    config: VmConfig,
    process: Option<VmProcess>,
}

impl Solo5 {
    pub fn new(config: &VmConfig) -> Solo5 {
        Solo5 {
            config: config.clone(),
            process: None,
        }
    }

    pub fn binary(&self) -> &str {
        SOLO5_HVT
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub(crate) fn process_mut(&mut self) -> Option<&mut VmProcess> {
        self.process.as_mut()
    }

    pub(crate) fn process(&self) -> Option<&VmProcess> {
        self.process.as_ref()
    }

    pub fn boot(
        &mut self,
        multiboot: bool,
        debug: bool,
        kernel_args: &str,
        image: Option<&str>,
    ) -> Result<(), VmError> {
        if multiboot || debug {
            warn!("solo5 ignores the multiboot and debug options");
        }
        let cmd = self.as_cmd(kernel_args, image)?;
        info!("Booting with {}", cmd.join(" "));
        self.process = Some(VmProcess::start(&cmd)?);
        Ok(())
    }

    pub fn as_cmd(&self, kernel_args: &str, image: Option<&str>) -> Result<Vec<String>, VmError> {
        let image = image
            .map(String::from)
            .or_else(|| self.config.image.clone())
            .ok_or_else(|| VmError::InvalidConfig {
                reason: String::from("no image to boot"),
            })?;

        if self.config.drives.len() > 1 {
            return Err(VmError::InvalidConfig {
                reason: format!(
                    "solo5 supports a single drive, {} configured",
                    self.config.drives.len()
                ),
            });
        }

        let disk = match self.config.drives.first() {
            Some(drive) => {
                if drive.format != DriveFormat::Raw {
                    return Err(VmError::InvalidConfig {
                        reason: format!(
                            "solo5 only boots raw drives, {} is {}",
                            drive.file,
                            drive.format.as_str()
                        ),
                    });
                }
                if drive.media != MediaType::Disk {
                    return Err(VmError::InvalidConfig {
                        reason: format!(
                            "solo5 only supports disk media, {} is {}",
                            drive.file,
                            drive.media.as_str()
                        ),
                    });
                }
                drive.file.clone()
            }
            None => String::from(DUMMY_DISK),
        };

        Ok(vec![
            String::from(PRIVILEGE_WRAPPER),
            String::from(SOLO5_HVT),
            format!("--disk={}", disk),
            format!("--net={}", SOLO5_TAP),
            image,
            String::from(kernel_args),
        ])
    }
}
