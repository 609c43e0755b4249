// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Builds QEMU command lines from a [`VmConfig`].

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use log::{info, warn};
use object::FileKind;

use crate::config::{Drive, DriveType, NetBackend, NicModel, VmConfig};
use crate::error::VmError;
use crate::process::VmProcess;

/// QEMU binary used unless the config overrides it.
pub const DEFAULT_QEMU: &str = "qemu-system-x86_64";

/// Host bridge for the `bridge` net backend.
pub const DEFAULT_BRIDGE: &str = "bridge43";

/// First MAC address handed out, incremented per interface.
const BASE_MAC: [u8; 6] = [0xc0, 0x01, 0x0a, 0x00, 0x00, 0x2a];

/// Installation prefix of the vmrunner support files.
pub fn vmrunner_home() -> PathBuf {
    env::var_os("VMRUNNER_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/usr/local"))
}

pub fn chainloader_path() -> PathBuf {
    env::var_os("VMRUNNER_CHAINLOADER")
        .map(PathBuf::from)
        .unwrap_or_else(|| vmrunner_home().join("share/vmrunner/chainloader"))
}

fn script_path(name: &str) -> PathBuf {
    vmrunner_home().join("share/vmrunner/scripts").join(name)
}

/// Does this `/proc/cpuinfo` advertise hardware virtualization?
pub fn kvm_present_in(cpuinfo: &str) -> bool {
    cpuinfo
        .lines()
        .filter(|l| l.starts_with("flags"))
        .any(|l| l.split_whitespace().any(|f| f == "vmx" || f == "svm"))
}

pub fn kvm_present() -> bool {
    fs::read_to_string("/proc/cpuinfo")
        .map(|info| kvm_present_in(&info))
        .unwrap_or(false)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElfClass {
    Elf32,
    Elf64,
}

/// ELF class of the binary at `path`, `None` for anything that is not ELF.
pub fn elf_class(path: &Path) -> Result<Option<ElfClass>, VmError> {
    let data = fs::read(path).map_err(|e| VmError::BootFailure {
        reason: format!("can't read {}: {}", path.display(), e),
    })?;
    Ok(match FileKind::parse(&*data) {
        Ok(FileKind::Elf32) => Some(ElfClass::Elf32),
        Ok(FileKind::Elf64) => Some(ElfClass::Elf64),
        _ => None,
    })
}

pub fn mac_address(index: usize) -> String {
    let mut mac = BASE_MAC;
    mac[5] = mac[5].wrapping_add(index as u8);
    mac.iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<String>>()
        .join(":")
}

fn nic_model(model: NicModel) -> &'static str {
    match model {
        NicModel::Virtio => "virtio-net",
        NicModel::Vmxnet3 => "vmxnet3",
        NicModel::E1000 => "e1000",
        NicModel::Rtl8139 => "rtl8139",
    }
}

/// A QEMU instance for one [`VmConfig`].
pub struct Qemu {
    config: VmConfig,
    binary: String,
    kvm: bool,
    chainloader: PathBuf,
    process: Option<VmProcess>,
}

impl Qemu {
    pub fn new(config: &VmConfig) -> Qemu {
        Qemu {
            binary: config
                .qemu
                .clone()
                .unwrap_or_else(|| String::from(DEFAULT_QEMU)),
            config: config.clone(),
            kvm: kvm_present(),
            chainloader: chainloader_path(),
            process: None,
        }
    }

    /// Overrides the host KVM detection.
    pub fn kvm(mut self, enabled: bool) -> Qemu {
        self.kvm = enabled;
        self
    }

    pub fn chainloader<P: AsRef<Path>>(mut self, path: P) -> Qemu {
        self.chainloader = path.as_ref().to_path_buf();
        self
    }

    pub fn binary(&self) -> &str {
        &self.binary
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
        let cmd = self.as_cmd(multiboot, debug, kernel_args, image)?;
        info!("Booting with {}", cmd.join(" "));
        self.process = Some(VmProcess::start(&cmd)?);
        Ok(())
    }

    /// Command line for booting `image` (or the configured image).
    pub fn as_cmd(
        &self,
        multiboot: bool,
        debug: bool,
        kernel_args: &str,
        image: Option<&str>,
    ) -> Result<Vec<String>, VmError> {
        let image = image
            .map(String::from)
            .or_else(|| self.config.image.clone())
            .ok_or_else(|| VmError::InvalidConfig {
                reason: String::from("no image to boot"),
            })?;

        let mut cmd = vec![self.binary.clone()];

        let mut drives: Vec<Drive> = Vec::new();
        if multiboot {
            cmd.append(&mut self.kernel_args(&image, kernel_args)?);
        } else if !self.config.drives.iter().any(|d| d.file == image) {
            drives.push(Drive::new(&image, DriveType::Ide));
        }
        drives.extend(self.config.drives.iter().cloned());

        for (i, drive) in drives.iter().enumerate() {
            cmd.append(&mut drive_args(i, drive));
        }

        for (i, nic) in self.config.net.iter().enumerate() {
            let id = format!("net{}", i);
            let netdev = match nic.backend {
                NetBackend::Tap => format!(
                    "tap,id={},script={},downscript={}",
                    id,
                    script_path("qemu-ifup").display(),
                    script_path("qemu-ifdown").display()
                ),
                NetBackend::Bridge => format!(
                    "bridge,id={},br={}",
                    id,
                    nic.bridge.as_deref().unwrap_or(DEFAULT_BRIDGE)
                ),
                NetBackend::User => format!("user,id={}", id),
            };
            let mac = nic.mac.clone().unwrap_or_else(|| mac_address(i));
            cmd.push(String::from("-netdev"));
            cmd.push(netdev);
            cmd.push(String::from("-device"));
            cmd.push(format!("{},netdev={},mac={}", nic_model(nic.device), id, mac));
        }

        cmd.push(String::from("-m"));
        cmd.push(format!("{}", self.config.mem));

        if let Some(smp) = self.config.smp {
            cmd.push(String::from("-smp"));
            cmd.push(format!("{}", smp));
        }

        if let Some(cpu) = &self.config.cpu {
            let mut model = cpu.model.clone();
            for feature in cpu.features.iter() {
                model.push_str(&format!(",+{}", feature));
            }
            cmd.push(String::from("-cpu"));
            cmd.push(model);
        }

        if self.kvm {
            cmd.push(String::from("-enable-kvm"));
        }

        if let Some(bios) = &self.config.bios {
            cmd.push(String::from("-bios"));
            cmd.push(bios.clone());
        }

        if let Some(trace) = &self.config.trace {
            cmd.push(String::from("-trace"));
            cmd.push(format!("events={}", trace));
        }

        if let Some(vfio) = &self.config.vfio {
            cmd.push(String::from("-device"));
            cmd.push(format!("vfio-pci,host={}", vfio));
        }

        if debug {
            cmd.push(String::from("-s"));
        }

        cmd.push(String::from("-nographic"));
        Ok(cmd)
    }

    /// `-kernel`, `-append` and `-initrd` arguments for a multiboot boot.
    ///
    /// The direct loader only understands 32-bit images, a 64-bit image is
    /// handed to the chainloader as its first module.
    fn kernel_args(&self, image: &str, kernel_args: &str) -> Result<Vec<String>, VmError> {
        let mut modules: Vec<String> = self
            .config
            .modules
            .iter()
            .map(|m| match &m.args {
                Some(args) => format!("{} {}", m.path, args),
                None => m.path.clone(),
            })
            .collect();

        let mut args = Vec::new();
        if elf_class(Path::new(image))? == Some(ElfClass::Elf64) {
            match elf_class(&self.chainloader) {
                Ok(Some(ElfClass::Elf32)) => {}
                _ => warn!(
                    "Chainloader {} is not a 32-bit ELF binary",
                    self.chainloader.display()
                ),
            }
            info!(
                "{} is 64-bit, booting through {}",
                image,
                self.chainloader.display()
            );
            modules.insert(0, format!("{} {}", image, kernel_args));
            args.push(String::from("-kernel"));
            args.push(self.chainloader.display().to_string());
        } else {
            args.push(String::from("-kernel"));
            args.push(String::from(image));
            args.push(String::from("-append"));
            args.push(String::from(kernel_args));
        }

        if !modules.is_empty() {
            args.push(String::from("-initrd"));
            args.push(modules.join(","));
        }
        Ok(args)
    }
}

fn drive_args(index: usize, drive: &Drive) -> Vec<String> {
    let base = format!(
        "file={},format={},media={}",
        drive.file,
        drive.format.as_str(),
        drive.media.as_str()
    );

    match drive.kind {
        DriveType::Virtio => vec![String::from("-drive"), format!("{},if=virtio", base)],
        DriveType::Ide => vec![String::from("-drive"), format!("{},if=ide", base)],
        DriveType::Nvme => {
            let id = format!("nvme{}", index);
            vec![
                String::from("-drive"),
                format!("{},if=none,id={}", base, id),
                String::from("-device"),
                format!("nvme,drive={},serial={}", id, id),
            ]
        }
        DriveType::Scsi => {
            let id = format!("scsi{}", index);
            vec![
                String::from("-drive"),
                format!("{},if=none,id={}", base, id),
                String::from("-device"),
                format!("virtio-scsi-pci,id={}-ctrl", id),
                String::from("-device"),
                format!("scsi-hd,bus={}-ctrl.0,drive={}", id, id),
            ]
        }
    }
}
