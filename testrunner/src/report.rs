// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! JUnit XML report of a test run.

use std::fs::File;
use std::path::Path;

use log::info;
use quick_junit::{NonSuccessKind, Report, TestCase, TestCaseStatus, TestSuite};

use vmrunner::ExitStatus;

use crate::discovery::TestDescriptor;
use crate::error::RunnerError;
use crate::scheduler::TestResult;

pub const REPORT_NAME: &str = "testrunner";
pub const SUITE_NAME: &str = "vmtests";

/// One case per executed test and one per skipped test.
pub fn junit_report(results: &[TestResult], skipped: &[TestDescriptor]) -> Report {
    let mut suite = TestSuite::new(SUITE_NAME);

    for result in results {
        let mut case = if result.passed() {
            let mut case = TestCase::new(result.name.as_str(), TestCaseStatus::success());
            case.set_system_out(result.stdout.as_str());
            case.set_system_err(result.stderr.as_str());
            case
        } else {
            let mut status = TestCaseStatus::non_success(NonSuccessKind::Failure);
            status.set_message(format!(
                "{} ({})",
                ExitStatus::from(result.code).name(),
                result.code
            ));
            status.set_description(result.stdout.as_str());
            TestCase::new(result.name.as_str(), status)
        };
        case.set_classname(result.classname.as_str());
        case.set_time(result.duration);
        suite.add_test_case(case);
    }

    for test in skipped {
        let mut status = TestCaseStatus::skipped();
        if let Some(reason) = test.validity.reason() {
            status.set_message(reason);
        }
        let mut case = TestCase::new(test.name.as_str(), status);
        case.set_classname(test.classname());
        suite.add_test_case(case);
    }

    let mut report = Report::new(REPORT_NAME);
    report.add_test_suite(suite);
    report
}

pub fn write_report(
    path: &Path,
    results: &[TestResult],
    skipped: &[TestDescriptor],
) -> Result<(), RunnerError> {
    let file = File::create(path)?;
    junit_report(results, skipped).serialize(file)?;
    info!("Wrote JUnit report to {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::{Properties, TestType, Validity};
    use std::path::PathBuf;
    use std::time::Duration;

    fn result(name: &str, code: i32) -> TestResult {
        TestResult {
            name: String::from(name),
            classname: String::from("integration.net"),
            code,
            stdout: format!("{} stdout", name),
            stderr: String::new(),
            duration: Duration::from_millis(1500),
        }
    }

    #[test]
    fn one_case_per_test() {
        let skipped = vec![TestDescriptor {
            name: String::from("misc/broken"),
            path: PathBuf::from("misc/broken"),
            category: String::from("misc"),
            kind: TestType::Misc,
            command: vec![String::from("./test.sh")],
            validity: Validity::Skip(String::from("needs a bridge")),
            properties: Properties::default(),
        }];
        let results = vec![
            result("net/integration/a", 0),
            result("net/integration/b", 66),
            result("net/integration/c", 0),
        ];

        let xml = junit_report(&results, &skipped).to_string().unwrap();
        assert!(xml.contains("vmtests"));
        assert!(xml.contains("integration.net"));
        assert!(xml.contains("misc.misc"));
        assert_eq!(xml.matches("<failure").count(), 1);
        assert_eq!(xml.matches("<skipped").count(), 1);
        assert!(xml.contains("TIMEOUT (66)"));
        assert!(xml.contains("net/integration/b stdout"));
        assert!(xml.contains("needs a bridge"));
    }

    #[test]
    fn writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.xml");
        write_report(&path, &[result("stress", 0)], &[]).unwrap();
        let xml = std::fs::read_to_string(&path).unwrap();
        assert!(xml.contains("stress"));
        assert!(!xml.contains("<failure"));
    }
}
