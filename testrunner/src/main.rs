// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::path::PathBuf;
use std::process;
use std::time::Instant;

use clap::{ArgAction, Parser};
use log::{error, warn};

use testrunner::discovery::SKIP_LIST;
use testrunner::report::write_report;
use testrunner::{discover, filter, load_skip_list, Scheduler};
use vmrunner::builder::Build;
use vmrunner::{color, ExitStatus, VmRegistry};

/// Discover and run VM tests
#[derive(Parser, Debug)]
#[command(name = "testrunner", version, about = "Discover and run VM tests")]
struct Args {
    /// Root of the test tree
    #[arg(default_value = ".")]
    root: PathBuf,

    /// Remove build artifacts of each test before running it
    #[arg(short = 'c', long)]
    clean_all: bool,

    /// Remove build artifacts of all tests and exit
    #[arg(short = 'C', long)]
    clean_only: bool,

    /// Skip tests by type, category, name or property (repeatable)
    #[arg(short, long, value_name = "FILTER", action = ArgAction::Append)]
    skip: Vec<String>,

    /// Only run tests matching a type, category, name or property (repeatable)
    #[arg(short, long, value_name = "FILTER", action = ArgAction::Append)]
    tests: Vec<String>,

    /// Stop after the first failing test
    #[arg(short, long)]
    fail_early: bool,

    /// Write a JUnit XML report to FILE
    #[arg(short, long, value_name = "FILE")]
    junit_xml: Option<PathBuf>,

    /// Maximum number of tests running at the same time [default: CPU count]
    #[arg(short, long)]
    parallel_tests: Option<usize>,

    /// Skip list document, relative to the test root
    #[arg(long, default_value = SKIP_LIST)]
    skip_list: PathBuf,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let start = Instant::now();

    let registry = VmRegistry::new();
    if let Err(e) = registry.install_interrupt_handler() {
        warn!("{}", e);
    }

    let skip_list = match load_skip_list(&args.root.join(&args.skip_list)) {
        Ok(list) => list,
        Err(e) => {
            error!("{}", e);
            process::exit(ExitStatus::ConfigError.code());
        }
    };

    let all = match discover(&args.root, &skip_list, &args.skip) {
        Ok(all) => all,
        Err(e) => {
            error!("Can't discover tests in {}: {}", args.root.display(), e);
            process::exit(ExitStatus::ConfigError.code());
        }
    };

    if args.clean_only {
        let mut code = 0;
        for test in all.iter() {
            if let Err(e) = Build::new(&test.path).clean() {
                error!("{}: {}", test.name, e);
                code = e.exit_status().code();
            }
        }
        process::exit(code);
    }

    let selection = filter(all, &args.tests, &args.skip);
    for test in selection.skipped.iter() {
        println!(
            "{} {}: {}",
            color::warning("[ SKIP ]"),
            test.name,
            test.validity.reason().unwrap_or("")
        );
    }

    if selection.is_empty() {
        println!("{}", color::warning("No tests selected"));
        if let Some(path) = &args.junit_xml {
            if let Err(e) = write_report(path, &[], &selection.skipped) {
                error!("{}", e);
            }
        }
        process::exit(ExitStatus::NoTests.code());
    }

    let mut scheduler = Scheduler::new()
        .fail_fast(args.fail_early)
        .clean(args.clean_all)
        .registry(registry);
    if let Some(n) = args.parallel_tests {
        scheduler = scheduler.max_parallel(n);
    }

    let total = selection.accepted.len();
    let summary = scheduler.run(selection.accepted);

    println!(
        "{}",
        color::header(&format!(
            "{} of {} tests run, {} failed, {} skipped, peak parallelism {} ({:.1}s)",
            summary.results.len(),
            total,
            summary.failed(),
            selection.skipped.len(),
            summary.peak_parallel,
            start.elapsed().as_secs_f64()
        ))
    );
    if summary.code == 0 {
        println!("{}", color::success("All tests passed"));
    } else {
        println!(
            "{}",
            color::fail(&format!(
                "Tests failed, exit code {} ({})",
                summary.code,
                ExitStatus::from(summary.code).name()
            ))
        );
    }

    if let Some(path) = &args.junit_xml {
        if let Err(e) = write_report(path, &summary.results, &selection.skipped) {
            error!("{}", e);
        }
    }

    process::exit(summary.code);
}
