// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Finds VM tests in a test tree, runs them as independent processes and
//! reduces their exit codes to one.

pub mod discovery;
pub mod error;
pub mod filter;
pub mod report;
pub mod scheduler;

pub use discovery::{discover, load_skip_list, TestDescriptor, TestType, Validity};
pub use error::RunnerError;
pub use filter::{filter, Selection};
pub use scheduler::{aggregate, RunSummary, Scheduler, TestResult};
