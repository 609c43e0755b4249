// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! From a test tree to a report.
//!
//! * `s01_*`: Discovery, skip lists and filters feeding the scheduler

mod common;

use std::fs;

use testrunner::discovery::SKIP_LIST;
use testrunner::filter::CLI_SKIP_REASON;
use testrunner::report::write_report;
use testrunner::{discover, filter, load_skip_list};

use common::{integration_test, scheduler, serialize, write_script};

/// Skip list entries and command line skips never run but are reported.
#[test]
fn s01_skipped_tests_are_reported() {
    let _guard = serialize();
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    integration_test(root, "net", "dhcp", "{}", "exit 0");
    integration_test(root, "net", "tcp", "{}", "exit 0");
    integration_test(root, "posix", "file", "{}", "exit 0");
    integration_test(root, "posix", "intrusive", r#"{ "intrusive": true }"#, "exit 1");
    write_script(&root.join("linux/router/test.sh"), "exit 1");
    fs::write(
        root.join(SKIP_LIST),
        r#"[{ "name": "net/integration/tcp", "reason": "needs a bridge" }]"#,
    )
    .unwrap();

    let skip_list = load_skip_list(&root.join(SKIP_LIST)).unwrap();
    let all = discover(root, &skip_list, &[]).unwrap();
    assert_eq!(all.len(), 5);

    let selection = filter(all, &[], &[String::from("intrusive")]);
    let accepted: Vec<&str> = selection.accepted.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(accepted, vec!["net/integration/dhcp", "posix/integration/file"]);

    let reason = |name: &str| {
        selection
            .skipped
            .iter()
            .find(|t| t.name == name)
            .and_then(|t| t.validity.reason())
            .map(String::from)
            .unwrap()
    };
    assert_eq!(reason("net/integration/tcp"), "needs a bridge");
    assert_eq!(reason("posix/integration/intrusive"), CLI_SKIP_REASON);
    assert_eq!(reason("linux/router"), "Missing required file: CMakeLists.txt");

    let summary = scheduler(2).run(selection.accepted);
    assert_eq!(summary.code, 0);
    assert_eq!(summary.results.len(), 2);

    let report = dir.path().join("junit.xml");
    write_report(&report, &summary.results, &selection.skipped).unwrap();
    let xml = fs::read_to_string(&report).unwrap();
    assert_eq!(xml.matches("<testcase").count(), 5);
    assert_eq!(xml.matches("<skipped").count(), 3);
    assert!(xml.contains("needs a bridge"));
    assert!(!xml.contains("<failure"));
}

/// An include filter narrows the run to one category.
#[test]
fn s01_include_by_category() {
    let _guard = serialize();
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    integration_test(root, "net", "dhcp", "{}", "exit 0");
    integration_test(root, "fs", "fat", "{}", "exit 5");

    let all = discover(root, &[], &[]).unwrap();
    let selection = filter(all, &[String::from("net")], &[]);
    let summary = scheduler(2).run(selection.accepted);
    assert_eq!(summary.code, 0);
    assert_eq!(summary.results.len(), 1);
    assert_eq!(summary.results[0].name, "net/integration/dhcp");
}
