// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Selects which of the discovered tests run.

use log::debug;

use crate::discovery::{Properties, TestDescriptor, Validity};

pub const CLI_SKIP_REASON: &str = "marked skip on command line";

/// Outcome of [`filter`].
#[derive(Debug, Default)]
pub struct Selection {
    pub accepted: Vec<TestDescriptor>,
    pub skipped: Vec<TestDescriptor>,
}

impl Selection {
    pub fn is_empty(&self) -> bool {
        self.accepted.is_empty()
    }
}

/// Does `arg` name the test's type, category, leaf path or one of its
/// properties?
pub fn matches(test: &TestDescriptor, arg: &str) -> bool {
    let arg = arg.trim_end_matches('/');
    if arg.is_empty() {
        return false;
    }
    arg == test.kind.as_str()
        || arg == test.category
        || arg == test.name
        || (Properties::is_property(arg) && test.properties.has(arg))
}

/// Splits `all` into tests to run and tests to report as skipped.
///
/// With no `include` arguments every test is a candidate, otherwise only
/// tests matched by at least one of them. Invalid candidates and candidates
/// matched by a `skip` argument end up in `skipped`.
pub fn filter(all: Vec<TestDescriptor>, include: &[String], skip: &[String]) -> Selection {
    let mut selection = Selection::default();

    for mut test in all {
        if !include.is_empty() && !include.iter().any(|arg| matches(&test, arg)) {
            continue;
        }

        if test.validity.is_skip() {
            debug!("Skipping invalid test {}", test.name);
            selection.skipped.push(test);
        } else if skip.iter().any(|arg| matches(&test, arg)) {
            test.validity = Validity::Skip(String::from(CLI_SKIP_REASON));
            selection.skipped.push(test);
        } else {
            selection.accepted.push(test);
        }
    }

    selection
}
