// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

use custom_error::custom_error;

custom_error! {
    pub RunnerError
    SkipList{path: String, reason: String} = "Can't read skip list {path}: {reason}",
    Report{reason: String} = "Can't write test report: {reason}",
    Spawn{test: String, reason: String} = "Can't start test {test}: {reason}",
    Io{source: std::io::Error} = "I/O error",
}

impl From<quick_junit::SerializeError> for RunnerError {
    fn from(e: quick_junit::SerializeError) -> Self {
        RunnerError::Report {
            reason: e.to_string(),
        }
    }
}
