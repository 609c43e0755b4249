// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Runs test processes with bounded parallelism.
//!
//! Every test is an independent child process. Up to `max_parallel` of them
//! run at a time and a free slot is refilled as soon as any test finishes.
//! Tests that can't share the machine run one at a time afterwards.

use std::collections::VecDeque;
use std::fs::{self, File};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::{Child, Command, ExitStatus as ProcessStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};

use vmrunner::builder::Build;
use vmrunner::color;
use vmrunner::process::Terminator;
use vmrunner::{ExitStatus, VmRegistry};

use crate::discovery::{TestDescriptor, TestType};
use crate::error::RunnerError;

/// How often in-flight tests are checked for completion.
pub const POLL_INTERVAL: Duration = Duration::from_millis(250);

pub const STDOUT_LOG: &str = "log_stdout.log";
pub const STDERR_LOG: &str = "log_stderr.log";
pub const SETUP_SCRIPT: &str = "setup.sh";

/// Code recorded for a test whose process could not be started.
pub const SPAWN_FAILED: i32 = 127;

/// Outcome of one test.
#[derive(Debug, Clone)]
pub struct TestResult {
    pub name: String,
    pub classname: String,
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

impl TestResult {
    pub fn passed(&self) -> bool {
        self.code == 0
    }
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub results: Vec<TestResult>,
    /// Aggregate exit code, see [`aggregate`].
    pub code: i32,
    /// Most tests observed running at the same time.
    pub peak_parallel: usize,
}

impl RunSummary {
    pub fn failed(&self) -> usize {
        self.results.iter().filter(|r| !r.passed()).count()
    }
}

/// Reduces test exit codes to one: the maximum, or `NO_TESTS` if there are
/// none.
pub fn aggregate<I: IntoIterator<Item = i32>>(codes: I) -> i32 {
    codes
        .into_iter()
        .max()
        .unwrap_or_else(|| ExitStatus::NoTests.code())
}

/// Exit code of a finished child, `128 + signal` if it was killed.
fn status_code(status: &ProcessStatus) -> i32 {
    match status.code() {
        Some(code) => code,
        None => 128 + status.signal().unwrap_or(0),
    }
}

fn is_executable(path: &Path) -> bool {
    fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Reads a log back, a missing or binary log is not fatal.
fn read_log(path: &Path) -> String {
    match fs::read(path) {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(e) => {
            warn!("Can't read {}: {}", path.display(), e);
            String::new()
        }
    }
}

/// Serial tests run in this order: time-sensitive integration tests first,
/// then stress, misc and linux.
fn serial_rank(test: &TestDescriptor) -> u8 {
    match test.kind {
        TestType::Integration => 0,
        TestType::Stress => 1,
        TestType::Misc => 2,
        TestType::Linux => 3,
    }
}

struct Running {
    test: TestDescriptor,
    child: Child,
    terminator: Terminator,
    started: Instant,
}

pub struct Scheduler {
    max_parallel: usize,
    fail_fast: bool,
    clean: bool,
    poll_interval: Duration,
    registry: VmRegistry,
}

impl Default for Scheduler {
    fn default() -> Self {
        Scheduler {
            max_parallel: num_cpus::get(),
            fail_fast: false,
            clean: false,
            poll_interval: POLL_INTERVAL,
            registry: VmRegistry::new(),
        }
    }
}

impl Scheduler {
    pub fn new() -> Scheduler {
        Default::default()
    }

    /// Upper bound for concurrently running tests, at least 1.
    pub fn max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel.max(1);
        self
    }

    /// Stop starting tests after the first failure.
    pub fn fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    /// Remove each test's build directory before starting it.
    pub fn clean(mut self, clean: bool) -> Self {
        self.clean = clean;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Registry the running tests are entered in, for interrupt cleanup.
    pub fn registry(mut self, registry: VmRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Runs `tests` and returns all results collected.
    ///
    /// With fail-fast set this returns as soon as a test fails. Tests that
    /// are still running at that point are left alone.
    pub fn run(&self, tests: Vec<TestDescriptor>) -> RunSummary {
        let (parallel, mut serial): (Vec<_>, Vec<_>) =
            tests.into_iter().partition(|t| t.runs_in_parallel());
        serial.sort_by_key(serial_rank);

        let mut summary = RunSummary {
            results: Vec::new(),
            code: 0,
            peak_parallel: 0,
        };

        if !parallel.is_empty() {
            info!(
                "Running {} tests, up to {} at a time",
                parallel.len(),
                self.max_parallel
            );
        }
        let mut go_on = self.run_pool(parallel, self.max_parallel, &mut summary);

        if go_on && !serial.is_empty() {
            info!("Running {} tests one at a time", serial.len());
            go_on = self.run_pool(serial, 1, &mut summary);
        }
        if !go_on {
            println!("{}", color::fail("Stopping after first failure"));
        }

        summary.code = aggregate(summary.results.iter().map(|r| r.code));
        summary
    }

    /// Returns false if the run has to stop.
    fn run_pool(
        &self,
        tests: Vec<TestDescriptor>,
        limit: usize,
        summary: &mut RunSummary,
    ) -> bool {
        let mut queue: VecDeque<TestDescriptor> = tests.into();
        let mut running: Vec<Running> = Vec::with_capacity(limit);

        loop {
            while running.len() < limit {
                let test = match queue.pop_front() {
                    Some(test) => test,
                    None => break,
                };
                match self.start(test) {
                    Ok(r) => running.push(r),
                    Err(result) => {
                        let failed = !result.passed();
                        summary.results.push(result);
                        if failed && self.fail_fast {
                            return false;
                        }
                    }
                }
            }
            summary.peak_parallel = summary.peak_parallel.max(running.len());

            if running.is_empty() && queue.is_empty() {
                return true;
            }

            let mut finished = false;
            let mut i = 0;
            while i < running.len() {
                let code = match running[i].child.try_wait() {
                    Ok(Some(status)) => status_code(&status),
                    Ok(None) => {
                        i += 1;
                        continue;
                    }
                    Err(e) => {
                        error!("Can't wait for {}: {}", running[i].test.name, e);
                        running[i].terminator.kill();
                        let _r = running[i].child.wait();
                        ExitStatus::Aborted.code()
                    }
                };

                finished = true;
                let result = self.finish(running.swap_remove(i), code);
                let failed = !result.passed();
                summary.results.push(result);
                if failed && self.fail_fast {
                    return false;
                }
            }

            if !finished {
                thread::sleep(self.poll_interval);
            }
        }
    }

    /// Starts a test, or returns its (failed) result if that's not possible.
    fn start(&self, test: TestDescriptor) -> Result<Running, TestResult> {
        let started = Instant::now();
        debug!("Starting {} in {}", test.name, test.path.display());

        match self.spawn(&test) {
            Ok(child) => {
                let terminator = Terminator::new(child.id() as i32, false);
                self.registry.register(terminator);
                Ok(Running {
                    test,
                    child,
                    terminator,
                    started,
                })
            }
            Err(e) => {
                let result = TestResult {
                    name: test.name.clone(),
                    classname: test.classname(),
                    code: SPAWN_FAILED,
                    stdout: String::new(),
                    stderr: e.to_string(),
                    duration: started.elapsed(),
                };
                report_line(&result);
                println!("{}", color::data(&result.stderr));
                Err(result)
            }
        }
    }

    fn spawn(&self, test: &TestDescriptor) -> Result<Child, RunnerError> {
        let spawn_error = |reason: String| RunnerError::Spawn {
            test: test.name.clone(),
            reason,
        };

        if self.clean {
            Build::new(&test.path)
                .clean()
                .map_err(|e| spawn_error(e.to_string()))?;
        }

        let setup = test.path.join(SETUP_SCRIPT);
        if is_executable(&setup) {
            info!("Running {} for {}", SETUP_SCRIPT, test.name);
            let status = Command::new("./setup.sh")
                .current_dir(&test.path)
                .status()
                .map_err(|e| spawn_error(e.to_string()))?;
            if !status.success() {
                return Err(spawn_error(format!(
                    "{} failed with exit code {}",
                    SETUP_SCRIPT,
                    status_code(&status)
                )));
            }
        }

        let (program, args) = test
            .command
            .split_first()
            .ok_or_else(|| spawn_error(String::from("empty command")))?;
        let stdout = File::create(test.path.join(STDOUT_LOG))?;
        let stderr = File::create(test.path.join(STDERR_LOG))?;

        Command::new(program)
            .args(args)
            .current_dir(&test.path)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .spawn()
            .map_err(|e| spawn_error(e.to_string()))
    }

    fn finish(&self, running: Running, code: i32) -> TestResult {
        self.registry.unregister(&running.terminator);
        let test = running.test;
        let result = TestResult {
            stdout: read_log(&test.path.join(STDOUT_LOG)),
            stderr: read_log(&test.path.join(STDERR_LOG)),
            name: test.name.clone(),
            classname: test.classname(),
            code,
            duration: running.started.elapsed(),
        };

        report_line(&result);
        if !result.passed() {
            println!("{}", color::header(&format!("{} output", result.name)));
            print!("{}", color::data(&result.stdout));
            if !result.stderr.is_empty() {
                println!("{}", color::header(&format!("{} errors", result.name)));
                print!("{}", color::data(&result.stderr));
            }
            println!();
        }
        result
    }
}

fn report_line(result: &TestResult) {
    let tag = if result.passed() {
        color::pass_inline()
    } else {
        color::fail_inline()
    };
    let status = ExitStatus::from(result.code);
    println!(
        "{} {} ({:.1}s){}",
        tag,
        result.name,
        result.duration.as_secs_f64(),
        if result.passed() {
            String::new()
        } else {
            format!(" {} {}", status.name(), result.code)
        }
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn aggregate_is_max() {
        assert_eq!(aggregate(vec![0, 66, 0]), 66);
        assert_eq!(aggregate(vec![0, 0]), 0);
        assert_eq!(aggregate(vec![3, 71, 68]), 71);
        assert_eq!(aggregate(Vec::new()), ExitStatus::NoTests.code());
    }

    proptest! {
        #[test]
        fn aggregate_is_max_of_any_codes(codes in proptest::collection::vec(0i32..256, 1..32)) {
            let max = *codes.iter().max().unwrap();
            prop_assert_eq!(aggregate(codes.iter().cloned()), max);
            prop_assert!(codes.iter().all(|c| *c <= aggregate(codes.clone())));
        }
    }

    #[test]
    fn signaled_children_report_128_plus_signal() {
        let mut child = Command::new("sleep").arg("30").spawn().unwrap();
        Terminator::new(child.id() as i32, false).kill();
        let status = child.wait().unwrap();
        // SIGKILL
        assert_eq!(status_code(&status), 128 + 9);
    }

    #[test]
    fn parallelism_is_at_least_one() {
        let s = Scheduler::new().max_parallel(0);
        assert_eq!(s.max_parallel, 1);
        assert!(Scheduler::new().max_parallel >= 1);
    }
}
