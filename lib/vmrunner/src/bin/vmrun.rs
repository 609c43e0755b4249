// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Boots the VM of a test directory with the default event rules and exits
//! with the session status. Meant to be called from `test.sh` scripts.

use std::path::PathBuf;
use std::process;

use clap::Parser;
use log::warn;

use vmrunner::color;
use vmrunner::session::{DEFAULT_KERNEL_ARGS, DEFAULT_TIMEOUT};
use vmrunner::{BootOptions, ExitStatus, Hypervisor, Vm, VmConfig, VmRegistry};

/// Boot a unikernel image and report its exit status
#[derive(Parser, Debug)]
#[command(name = "vmrun", version, about = "Boot a unikernel and report its exit status")]
struct Args {
    /// VM config document, or the directory to look for one in
    #[arg(short, long, default_value = ".")]
    config: PathBuf,

    /// Image to boot instead of the configured one
    #[arg(short, long)]
    image: Option<String>,

    /// Seconds until the VM times out, 0 disables the timeout
    #[arg(short, long, default_value_t = DEFAULT_TIMEOUT)]
    timeout: u64,

    /// Boot the image as a disk instead of loading it as a kernel
    #[arg(long)]
    no_multiboot: bool,

    /// Wait for a debugger to attach
    #[arg(short, long)]
    debug: bool,

    /// Arguments passed to the guest kernel
    #[arg(long, default_value = DEFAULT_KERNEL_ARGS)]
    kernel_args: String,

    /// Run in the solo5 hvt monitor instead of QEMU
    #[arg(long)]
    solo5: bool,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let registry = VmRegistry::new();
    if let Err(e) = registry.install_interrupt_handler() {
        warn!("{}", e);
    }

    let config = match VmConfig::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            println!("{}", color::fail(&e.to_string()));
            process::exit(ExitStatus::ConfigError.code());
        }
    };

    let hyper = if args.solo5 {
        Hypervisor::solo5(&config)
    } else {
        Hypervisor::qemu(&config)
    };
    if !hyper.available() {
        println!(
            "{}",
            color::fail(&format!("{} is not installed", hyper.binary()))
        );
        process::exit(ExitStatus::BootFailed.code());
    }

    let mut options = BootOptions::new()
        .timeout(args.timeout)
        .multiboot(!args.no_multiboot)
        .debug(args.debug)
        .kernel_args(&args.kernel_args);
    if let Some(image) = &args.image {
        options = options.image(image);
    }

    let mut vm = Vm::new(hyper).with_registry(registry);
    let status = vm.boot(&options);
    process::exit(status.code());
}
