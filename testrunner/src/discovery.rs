// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Finds the tests below a test root.
//!
//! Layout:
//! * `<category>/integration/<leaf>` for integration tests,
//! * `stress` for the stress test,
//! * `misc/<leaf>` and `linux/<leaf>` for flat buckets of script tests.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, warn};
use serde::Deserialize;
use serde_json::Value;

use crate::error::RunnerError;

/// Category directories that contain integration tests.
pub const CATEGORIES: [&str; 10] = [
    "fs",
    "hw",
    "kernel",
    "mod",
    "net",
    "performance",
    "plugin",
    "posix",
    "stl",
    "util",
];

/// Default name of the skip list document in the test root.
pub const SKIP_LIST: &str = "skipped_tests.json";

pub const CONFIG_FILE: &str = "vm.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TestType {
    Integration,
    Stress,
    Misc,
    Linux,
}

impl TestType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TestType::Integration => "integration",
            TestType::Stress => "stress",
            TestType::Misc => "misc",
            TestType::Linux => "linux",
        }
    }

    /// Files a test of this type can't do without.
    fn required_files(&self) -> &'static [&'static str] {
        match self {
            TestType::Integration | TestType::Stress => &[CONFIG_FILE],
            TestType::Linux => &["CMakeLists.txt", "test.sh"],
            TestType::Misc => &["test.sh"],
        }
    }
}

impl fmt::Display for TestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validity {
    Valid,
    Skip(String),
}

impl Validity {
    pub fn is_skip(&self) -> bool {
        matches!(self, Validity::Skip(_))
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Validity::Valid => None,
            Validity::Skip(reason) => Some(reason),
        }
    }
}

/// Properties a test declares in its `vm.json`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Properties {
    /// Depends on wall-clock timing, must not share the CPUs.
    pub time_sensitive: bool,
    /// Changes host state.
    pub intrusive: bool,
}

impl Properties {
    /// Reads the properties from a config document, absent keys are false.
    pub fn from_document(document: &Value) -> Properties {
        let flag = |keys: &[&str]| {
            keys.iter()
                .any(|k| document.get(*k).and_then(Value::as_bool).unwrap_or(false))
        };
        Properties {
            time_sensitive: flag(&["time_sensitive", "time-sensitive"]),
            intrusive: flag(&["intrusive"]),
        }
    }

    /// Does this set have the property named `name`?
    pub fn has(&self, name: &str) -> bool {
        match name {
            "time_sensitive" | "time-sensitive" => self.time_sensitive,
            "intrusive" => self.intrusive,
            _ => false,
        }
    }

    pub fn is_property(name: &str) -> bool {
        matches!(name, "time_sensitive" | "time-sensitive" | "intrusive")
    }
}

/// One entry of the skip list document.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SkipEntry {
    pub name: String,
    pub reason: String,
}

/// Loads a skip list, a missing document is an empty list.
pub fn load_skip_list(path: &Path) -> Result<Vec<SkipEntry>, RunnerError> {
    if !path.exists() {
        debug!("No skip list at {}", path.display());
        return Ok(Vec::new());
    }
    let invalid = |reason: String| RunnerError::SkipList {
        path: path.display().to_string(),
        reason,
    };
    let content = fs::read_to_string(path).map_err(|e| invalid(e.to_string()))?;
    serde_json::from_str(&content).map_err(|e| invalid(e.to_string()))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestDescriptor {
    /// Leaf path relative to the test root, e.g. `net/integration/tcp`.
    pub name: String,
    pub path: PathBuf,
    pub category: String,
    pub kind: TestType,
    pub command: Vec<String>,
    pub validity: Validity,
    pub properties: Properties,
}

impl TestDescriptor {
    fn new(
        root: &Path,
        name: String,
        category: &str,
        kind: TestType,
        skip_list: &[SkipEntry],
        cli_skip: &[String],
    ) -> TestDescriptor {
        let path = root.join(&name);
        let command = entry_point(&path, kind);
        let properties = read_properties(&path);
        let mut test = TestDescriptor {
            name,
            path,
            category: String::from(category),
            kind,
            command,
            validity: Validity::Valid,
            properties,
        };
        test.validity = test.check_valid(skip_list, cli_skip);
        test
    }

    /// Required files, then the skip list, then the command line.
    fn check_valid(&self, skip_list: &[SkipEntry], cli_skip: &[String]) -> Validity {
        for file in self.kind.required_files() {
            if !self.path.join(file).is_file() {
                return Validity::Skip(format!("Missing required file: {}", file));
            }
        }
        if !self.has_entry_point() {
            return Validity::Skip(String::from("Missing required file: test.py or test.sh"));
        }

        if let Some(entry) = skip_list.iter().find(|e| e.name == self.name) {
            return Validity::Skip(entry.reason.clone());
        }

        if cli_skip
            .iter()
            .any(|s| s == &self.name || s == &self.category)
        {
            return Validity::Skip(String::from("Defined by command line argument"));
        }

        Validity::Valid
    }

    fn has_entry_point(&self) -> bool {
        self.path.join("test.py").is_file() || self.path.join("test.sh").is_file()
    }

    /// Runs in the parallel batch (vs. serially afterwards).
    pub fn runs_in_parallel(&self) -> bool {
        self.kind == TestType::Integration && !self.properties.time_sensitive
    }

    /// JUnit class name, `<type>.<category>`.
    pub fn classname(&self) -> String {
        format!("{}.{}", self.kind, self.category)
    }
}

fn entry_point(path: &Path, kind: TestType) -> Vec<String> {
    let python = matches!(kind, TestType::Integration | TestType::Stress)
        && path.join("test.py").is_file();
    if python {
        vec![
            String::from("python3"),
            String::from("-u"),
            String::from("test.py"),
        ]
    } else {
        vec![String::from("./test.sh")]
    }
}

fn read_properties(path: &Path) -> Properties {
    let file = path.join(CONFIG_FILE);
    let content = match fs::read_to_string(&file) {
        Ok(content) => content,
        Err(_) => return Properties::default(),
    };
    match serde_json::from_str::<Value>(&content) {
        Ok(document) => Properties::from_document(&document),
        Err(e) => {
            warn!("Can't read test properties from {}: {}", file.display(), e);
            Properties::default()
        }
    }
}

/// Sorted names of the directories in `dir`.
fn subdirs(dir: &Path) -> Result<Vec<String>, RunnerError> {
    let mut names: Vec<String> = fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_dir())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    Ok(names)
}

/// Returns one descriptor per leaf test below `root`, in name order.
pub fn discover(
    root: &Path,
    skip_list: &[SkipEntry],
    cli_skip: &[String],
) -> Result<Vec<TestDescriptor>, RunnerError> {
    let cli_skip: Vec<String> = cli_skip
        .iter()
        .map(|s| String::from(s.trim_end_matches('/')))
        .collect();
    let mut tests = Vec::new();
    let mut add = |name: String, category: &str, kind: TestType| {
        tests.push(TestDescriptor::new(
            root, name, category, kind, skip_list, &cli_skip,
        ))
    };

    for dir in subdirs(root)? {
        match dir.as_str() {
            "stress" => add(dir.clone(), "stress", TestType::Stress),
            "misc" | "linux" => {
                let kind = if dir == "misc" {
                    TestType::Misc
                } else {
                    TestType::Linux
                };
                for leaf in subdirs(&root.join(&dir))? {
                    add(format!("{}/{}", dir, leaf), &dir, kind);
                }
            }
            category if CATEGORIES.contains(&category) => {
                let integration = root.join(category).join("integration");
                if !integration.is_dir() {
                    continue;
                }
                for leaf in subdirs(&integration)? {
                    add(
                        format!("{}/integration/{}", category, leaf),
                        category,
                        TestType::Integration,
                    );
                }
            }
            other => debug!("Ignoring {} in test root", other),
        }
    }

    Ok(tests)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn touch(root: &Path, file: &str) {
        let path = root.join(file);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, "").unwrap();
    }

    fn tree() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        touch(root, "net/integration/tcp/vm.json");
        touch(root, "net/integration/tcp/test.py");
        touch(root, "net/integration/dns/vm.json");
        touch(root, "net/integration/dns/test.sh");
        touch(root, "fs/integration/fat/test.py");
        touch(root, "fs/unit/ignored.cpp");
        touch(root, "stress/vm.json");
        touch(root, "stress/test.py");
        touch(root, "misc/build_examples/test.sh");
        touch(root, "linux/router/test.sh");
        touch(root, "docs/integration/nope/vm.json");
        fs::write(
            root.join("net/integration/tcp/vm.json"),
            json!({ "time_sensitive": true }).to_string(),
        )
        .unwrap();
        dir
    }

    fn find<'a>(tests: &'a [TestDescriptor], name: &str) -> &'a TestDescriptor {
        tests.iter().find(|t| t.name == name).unwrap()
    }

    #[test]
    fn walks_the_taxonomy() {
        let dir = tree();
        let tests = discover(dir.path(), &[], &[]).unwrap();
        let names: Vec<&str> = tests.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "fs/integration/fat",
                "linux/router",
                "misc/build_examples",
                "net/integration/dns",
                "net/integration/tcp",
                "stress",
            ]
        );

        let tcp = find(&tests, "net/integration/tcp");
        assert_eq!(tcp.kind, TestType::Integration);
        assert_eq!(tcp.category, "net");
        assert_eq!(tcp.command, vec!["python3", "-u", "test.py"]);
        assert_eq!(tcp.classname(), "integration.net");
        assert!(tcp.properties.time_sensitive);
        assert!(!tcp.runs_in_parallel());

        let dns = find(&tests, "net/integration/dns");
        assert_eq!(dns.command, vec!["./test.sh"]);
        assert!(dns.runs_in_parallel());

        let misc = find(&tests, "misc/build_examples");
        assert_eq!(misc.kind, TestType::Misc);
        assert_eq!(misc.category, "misc");
        assert!(!misc.runs_in_parallel());
    }

    #[test]
    fn missing_files_come_first() {
        let dir = tree();
        let skip_list = vec![SkipEntry {
            name: String::from("fs/integration/fat"),
            reason: String::from("flaky"),
        }];
        let tests = discover(dir.path(), &skip_list, &[String::from("fs")]).unwrap();
        assert_eq!(
            find(&tests, "fs/integration/fat").validity,
            Validity::Skip(String::from("Missing required file: vm.json"))
        );
        assert_eq!(
            find(&tests, "linux/router").validity,
            Validity::Skip(String::from("Missing required file: CMakeLists.txt"))
        );
    }

    #[test]
    fn skip_list_before_command_line() {
        let dir = tree();
        let skip_list = vec![SkipEntry {
            name: String::from("net/integration/dns"),
            reason: String::from("needs a bridge"),
        }];
        let tests = discover(
            dir.path(),
            &skip_list,
            &[String::from("net/"), String::from("stress")],
        )
        .unwrap();
        assert_eq!(
            find(&tests, "net/integration/dns").validity.reason(),
            Some("needs a bridge")
        );
        assert_eq!(
            find(&tests, "net/integration/tcp").validity.reason(),
            Some("Defined by command line argument")
        );
        assert!(find(&tests, "stress").validity.is_skip());
        assert_eq!(find(&tests, "misc/build_examples").validity, Validity::Valid);
    }

    #[test]
    fn skip_list_matches_exact_names() {
        let dir = tree();
        let skip_list = vec![SkipEntry {
            name: String::from("net/integration"),
            reason: String::from("prefix only"),
        }];
        let tests = discover(dir.path(), &skip_list, &[]).unwrap();
        assert_eq!(find(&tests, "net/integration/dns").validity, Validity::Valid);
    }

    #[test]
    fn skip_list_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SKIP_LIST);
        assert!(load_skip_list(&path).unwrap().is_empty());

        fs::write(&path, r#"[{ "name": "net/integration/dns", "reason": "bridge" }]"#).unwrap();
        let list = load_skip_list(&path).unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].reason, "bridge");

        fs::write(&path, r#"{ "name": "x" }"#).unwrap();
        assert!(matches!(
            load_skip_list(&path),
            Err(RunnerError::SkipList { .. })
        ));
    }

    #[test]
    fn properties_accept_both_spellings() {
        let p = Properties::from_document(&json!({ "time-sensitive": true, "intrusive": false }));
        assert!(p.time_sensitive);
        assert!(!p.intrusive);
        assert!(p.has("time_sensitive"));
        assert!(p.has("time-sensitive"));
        assert!(!p.has("intrusive"));
        assert!(!Properties::from_document(&json!([])).time_sensitive);
    }
}
