// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Build steps a test runs before it boots its service (make, cmake).

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::Command;

use log::info;

use crate::error::VmError;

/// Out-of-tree build directory used by [`Build::cmake`].
pub const BUILD_DIR: &str = "build";

/// Runs build tools inside a test directory.
#[derive(Debug, Clone)]
pub struct Build {
    dir: PathBuf,
}

impl Build {
    pub fn new<P: AsRef<Path>>(dir: P) -> Build {
        Build {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn build_dir(&self) -> PathBuf {
        self.dir.join(BUILD_DIR)
    }

    /// Runs `program` in `cwd`, a non-zero exit is a build failure.
    ///
    /// Output is only shown when the step fails.
    pub fn run(&self, cwd: &Path, program: &str, args: &[&str]) -> Result<(), VmError> {
        let command = format!("{} {}", program, args.join(" "));
        info!("Building: {} (in {})", command.trim(), cwd.display());

        let o = Command::new(program).args(args).current_dir(cwd).output()?;
        if !o.status.success() {
            io::stdout().write_all(&o.stdout)?;
            io::stderr().write_all(&o.stderr)?;
            return Err(VmError::BuildFailure {
                command: String::from(command.trim()),
                code: o.status.code().unwrap_or(-1),
            });
        }
        Ok(())
    }

    pub fn make(&self, args: &[&str]) -> Result<(), VmError> {
        self.run(&self.dir, "make", args)
    }

    /// Configures the project in `build/` and runs make there.
    pub fn cmake(&self, args: &[&str]) -> Result<(), VmError> {
        let build_dir = self.build_dir();
        fs::create_dir_all(&build_dir)?;

        let prefix = format!("-DCMAKE_INSTALL_PREFIX={}", self.dir.display());
        let mut cmake_args = vec!["..", prefix.as_str()];
        cmake_args.extend_from_slice(args);
        self.run(&build_dir, "cmake", &cmake_args)?;
        self.run(&build_dir, "make", &[])
    }

    /// Removes the build directory.
    pub fn clean(&self) -> Result<(), VmError> {
        let build_dir = self.build_dir();
        if build_dir.exists() {
            info!("Cleaning {}", build_dir.display());
            fs::remove_dir_all(&build_dir)?;
        }
        Ok(())
    }
}
