// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Loading and validation of VM configuration documents (`vm.json`).
//!
//! Every document is merged on top of a process-wide default document before
//! it is deserialized: keys the user supplies replace the default keys one
//! level deep, so a test can specify just `{"net": [...]}` and still get the
//! memory default.

use std::fs;
use std::path::{Path, PathBuf};

use lazy_static::lazy_static;
use log::{debug, info, warn};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::VmError;

/// Name of the config document we look for first in a directory.
pub const DEFAULT_CONFIG_NAME: &str = "vm.json";

/// Default guest memory (in MiB).
pub const DEFAULT_MEMORY: u64 = 128;

lazy_static! {
    static ref MAC_ADDRESS: Regex =
        Regex::new(r"^([0-9a-fA-F]{2}:){5}[0-9a-fA-F]{2}$").expect("valid mac regex");
}

/// Document every user supplied config is merged on top of.
pub fn default_document() -> Value {
    json!({
        "description": "Single virtio nic, otherwise hypervisor defaults",
        "net": [{ "device": "virtio", "backend": "tap" }],
        "mem": DEFAULT_MEMORY,
    })
}

/// Description of one bootable VM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmConfig {
    /// Boot image (kernel or disk). Can also be supplied at boot time.
    #[serde(default)]
    pub image: Option<String>,
    /// Informational only.
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub drives: Vec<Drive>,
    #[serde(default)]
    pub net: Vec<NetInterface>,
    /// Memory in MiB.
    #[serde(default = "default_mem")]
    pub mem: u64,
    #[serde(default)]
    pub smp: Option<u32>,
    #[serde(default)]
    pub cpu: Option<Cpu>,
    #[serde(default)]
    pub bios: Option<String>,
    /// Extra boot modules, handed to the guest with the kernel.
    #[serde(default)]
    pub modules: Vec<BootModule>,
    /// QEMU trace events file.
    #[serde(default)]
    pub trace: Option<String>,
    /// Host PCI address of a device to pass through.
    #[serde(default)]
    pub vfio: Option<String>,
    /// Overrides the QEMU binary.
    #[serde(default)]
    pub qemu: Option<String>,
}

fn default_mem() -> u64 {
    DEFAULT_MEMORY
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Drive {
    pub file: String,
    #[serde(rename = "type", default)]
    pub kind: DriveType,
    #[serde(default)]
    pub format: DriveFormat,
    #[serde(default)]
    pub media: MediaType,
}

impl Drive {
    pub fn new(file: &str, kind: DriveType) -> Drive {
        Drive {
            file: String::from(file),
            kind,
            format: DriveFormat::Raw,
            media: MediaType::Disk,
        }
    }
}

/// Logical device a drive is attached through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriveType {
    Virtio,
    Ide,
    Nvme,
    Scsi,
}

impl Default for DriveType {
    fn default() -> Self {
        DriveType::Virtio
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriveFormat {
    Raw,
    Qcow2,
    Vmdk,
}

impl Default for DriveFormat {
    fn default() -> Self {
        DriveFormat::Raw
    }
}

impl DriveFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            DriveFormat::Raw => "raw",
            DriveFormat::Qcow2 => "qcow2",
            DriveFormat::Vmdk => "vmdk",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Disk,
    Cdrom,
}

impl Default for MediaType {
    fn default() -> Self {
        MediaType::Disk
    }
}

impl MediaType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaType::Disk => "disk",
            MediaType::Cdrom => "cdrom",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetInterface {
    #[serde(default)]
    pub backend: NetBackend,
    #[serde(default)]
    pub device: NicModel,
    #[serde(default)]
    pub mac: Option<String>,
    /// Host bridge, only used by the `bridge` backend.
    #[serde(default)]
    pub bridge: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetBackend {
    Tap,
    Bridge,
    User,
}

impl Default for NetBackend {
    fn default() -> Self {
        NetBackend::Tap
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NicModel {
    Virtio,
    Vmxnet3,
    E1000,
    Rtl8139,
}

impl Default for NicModel {
    fn default() -> Self {
        NicModel::Virtio
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cpu {
    pub model: String,
    #[serde(default)]
    pub features: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BootModule {
    pub path: String,
    #[serde(default)]
    pub args: Option<String>,
}

impl Default for VmConfig {
    /// The config described by [`default_document`].
    fn default() -> Self {
        VmConfig {
            image: None,
            description: Some(String::from(
                "Single virtio nic, otherwise hypervisor defaults",
            )),
            drives: Vec::new(),
            net: vec![NetInterface {
                backend: NetBackend::Tap,
                device: NicModel::Virtio,
                mac: None,
                bridge: None,
            }],
            mem: DEFAULT_MEMORY,
            smp: None,
            cpu: None,
            bios: None,
            modules: Vec::new(),
            trace: None,
            vfio: None,
            qemu: None,
        }
    }
}

impl VmConfig {
    /// Loads a config from a file, or the first valid config in a directory.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<VmConfig, VmError> {
        let path = path.as_ref();
        if path.is_file() {
            VmConfig::from_file(path)
        } else if path.is_dir() {
            VmConfig::from_dir(path)
        } else {
            Err(VmError::Config {
                path: path.display().to_string(),
                reason: String::from("neither a file nor a directory"),
            })
        }
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<VmConfig, VmError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| VmError::Config {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let value: Value = serde_json::from_str(&content).map_err(|e| VmError::Config {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        VmConfig::from_value(value, path)
    }

    /// Parses a config from an in-memory document.
    pub fn from_json(document: &str) -> Result<VmConfig, VmError> {
        let origin = Path::new("<inline>");
        let value: Value = serde_json::from_str(document).map_err(|e| VmError::Config {
            path: origin.display().to_string(),
            reason: e.to_string(),
        })?;
        VmConfig::from_value(value, origin)
    }

    /// Returns the first valid config document found in `dir`.
    ///
    /// `vm.json` is tried first, the remaining `*.json` files in name order.
    /// Without any document the default config is used.
    pub fn from_dir<P: AsRef<Path>>(dir: P) -> Result<VmConfig, VmError> {
        let dir = dir.as_ref();
        let candidates = config_documents(dir)?;
        if candidates.is_empty() {
            warn!(
                "No VM config found in {}, using defaults",
                dir.display()
            );
            return Ok(VmConfig::default());
        }

        let mut last_error = None;
        for candidate in candidates {
            match VmConfig::from_file(&candidate) {
                Ok(config) => {
                    info!("Loaded VM config from {}", candidate.display());
                    return Ok(config);
                }
                Err(e) => {
                    debug!("Skipping {}: {}", candidate.display(), e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| VmError::Config {
            path: dir.display().to_string(),
            reason: String::from("no valid config document"),
        }))
    }

    fn from_value(value: Value, origin: &Path) -> Result<VmConfig, VmError> {
        let invalid = |reason: String| VmError::Config {
            path: origin.display().to_string(),
            reason,
        };

        let user = match value {
            Value::Object(map) => map,
            other => {
                return Err(invalid(format!(
                    "expected a JSON object at the top level, found {}",
                    other
                )))
            }
        };

        let merged = merge_with_defaults(user);
        let config: VmConfig =
            serde_json::from_value(Value::Object(merged)).map_err(|e| invalid(e.to_string()))?;
        config.validate().map_err(invalid)?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), String> {
        if self.mem == 0 {
            return Err(String::from("`mem` must be larger than 0"));
        }
        if self.smp == Some(0) {
            return Err(String::from("`smp` must be at least 1"));
        }
        for drive in self.drives.iter() {
            if drive.file.is_empty() {
                return Err(String::from("drive with empty `file`"));
            }
        }
        for nic in self.net.iter() {
            if let Some(mac) = &nic.mac {
                if !MAC_ADDRESS.is_match(mac) {
                    return Err(format!("`{}` is not a valid MAC address", mac));
                }
            }
        }
        for module in self.modules.iter() {
            if module.path.is_empty() {
                return Err(String::from("boot module with empty `path`"));
            }
        }
        Ok(())
    }
}

/// User keys replace default keys, one level deep.
fn merge_with_defaults(user: Map<String, Value>) -> Map<String, Value> {
    let mut merged = match default_document() {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    for (key, value) in user {
        merged.insert(key, value);
    }
    merged
}

/// All JSON documents in `dir`, `vm.json` first.
fn config_documents(dir: &Path) -> Result<Vec<PathBuf>, VmError> {
    let mut documents: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && p.extension().map_or(false, |ext| ext == "json"))
        .collect();

    documents.sort_by_key(|p| {
        let is_default = p.file_name().map_or(false, |n| n == DEFAULT_CONFIG_NAME);
        (!is_default, p.clone())
    });
    Ok(documents)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_in_missing_keys() {
        let config = VmConfig::from_json(r#"{ "image": "ok.img" }"#).unwrap();
        assert_eq!(config.image.as_deref(), Some("ok.img"));
        assert_eq!(config.mem, DEFAULT_MEMORY);
        assert_eq!(config.net.len(), 1);
        assert_eq!(config.net[0].device, NicModel::Virtio);
        assert_eq!(config.net[0].backend, NetBackend::Tap);
        assert!(config.drives.is_empty());
    }

    #[test]
    fn user_keys_replace_default_keys() {
        let config = VmConfig::from_json(
            r#"{ "net": [{ "device": "e1000", "backend": "bridge", "bridge": "br0" }], "mem": 256 }"#,
        )
        .unwrap();
        assert_eq!(config.mem, 256);
        assert_eq!(config.net.len(), 1);
        assert_eq!(config.net[0].device, NicModel::E1000);
        assert_eq!(config.net[0].bridge.as_deref(), Some("br0"));

        let no_net = VmConfig::from_json(r#"{ "net": [] }"#).unwrap();
        assert!(no_net.net.is_empty());
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let config =
            VmConfig::from_json(r#"{ "image": "a.img", "time_sensitive": true, "foo": 1 }"#)
                .unwrap();
        assert_eq!(config.image.as_deref(), Some("a.img"));
    }

    #[test]
    fn schema_violations_fail() {
        assert!(VmConfig::from_json(r#"{ "mem": "lots" }"#).is_err());
        assert!(VmConfig::from_json(r#"{ "mem": 0 }"#).is_err());
        assert!(VmConfig::from_json(r#"{ "smp": 0 }"#).is_err());
        assert!(VmConfig::from_json(r#"{ "drives": [{ "file": "a", "type": "floppy" }] }"#).is_err());
        assert!(VmConfig::from_json(r#"{ "net": [{ "mac": "not-a-mac" }] }"#).is_err());
        assert!(VmConfig::from_json(r#"[1, 2]"#).is_err());
        assert!(VmConfig::from_json(r#"{ "image": "#).is_err());
    }

    #[test]
    fn drive_defaults() {
        let config = VmConfig::from_json(r#"{ "drives": [{ "file": "disk.img" }] }"#).unwrap();
        assert_eq!(config.drives[0], Drive::new("disk.img", DriveType::Virtio));
    }

    #[test]
    fn directory_picks_first_valid_document() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.json"), r#"{ "image": "a.img" }"#).unwrap();
        fs::write(dir.path().join("vm.json"), r#"{ "image": "vm.img" }"#).unwrap();
        let config = VmConfig::load(dir.path()).unwrap();
        assert_eq!(config.image.as_deref(), Some("vm.img"));

        fs::write(dir.path().join("vm.json"), r#"{ "mem": -1 }"#).unwrap();
        let config = VmConfig::load(dir.path()).unwrap();
        assert_eq!(config.image.as_deref(), Some("a.img"));
    }

    #[test]
    fn empty_directory_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = VmConfig::load(dir.path()).unwrap();
        assert_eq!(config, VmConfig::default());
        assert_eq!(config, VmConfig::from_json("{}").unwrap());
    }

    #[test]
    fn missing_path_is_a_config_error() {
        let err = VmConfig::load("/does/not/exist/vm.json").unwrap_err();
        assert!(matches!(err, VmError::Config { .. }));
    }
}
