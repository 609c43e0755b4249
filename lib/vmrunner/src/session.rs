// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! One VM session: boot the hypervisor, read its console line by line,
//! dispatch events and reduce everything to a single [`ExitStatus`].
//!
//! The exit status is written at most once per boot. Whoever gets there
//! first (a marker line, a callback, the timeout timer) wins, later writers
//! are ignored.

use std::env;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use lazy_static::lazy_static;
use log::{debug, info, warn};
use regex::Regex;

use crate::builder::Build;
use crate::color;
use crate::config::VmConfig;
use crate::error::VmError;
use crate::events::{EventRegistry, Verdict, EOT};
use crate::hypervisor::Hypervisor;
use crate::process::{Terminator, KILL_TIMEOUT};
use crate::registry::VmRegistry;
use crate::ExitStatus;

/// Default session timeout in seconds.
pub const DEFAULT_TIMEOUT: u64 = 60;

pub const DEFAULT_KERNEL_ARGS: &str = "booted with vmrunner";

lazy_static! {
    static ref SERVICE_EXIT: Regex =
        Regex::new(r"(service exited|returned) with status (-?\d+)\s*$").expect("valid marker");
}

/// Exit status the guest reported through a service-exit marker line.
pub fn service_exit_status(line: &str) -> Option<i32> {
    SERVICE_EXIT
        .captures(line)
        .and_then(|c| c.get(2))
        .and_then(|m| m.as_str().parse().ok())
}

/// Is this line the end-of-transmission sentinel?
pub fn is_eot(line: &str) -> bool {
    line.trim() == char::from(EOT).to_string()
}

/// A status that can be set once.
#[derive(Debug)]
pub struct ExitCell {
    code: AtomicI32,
}

const UNSET: i32 = i32::MIN;

impl Default for ExitCell {
    fn default() -> Self {
        ExitCell::new()
    }
}

impl ExitCell {
    pub fn new() -> ExitCell {
        ExitCell {
            code: AtomicI32::new(UNSET),
        }
    }

    /// Sets the status unless it is set already.
    pub fn try_set(&self, code: i32) -> bool {
        self.code
            .compare_exchange(UNSET, code, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Sets the status unconditionally.
    pub fn set(&self, code: i32) {
        self.code.store(code, Ordering::SeqCst);
    }

    pub fn get(&self) -> Option<i32> {
        match self.code.load(Ordering::SeqCst) {
            UNSET => None,
            code => Some(code),
        }
    }

    pub fn reset(&self) {
        self.code.store(UNSET, Ordering::SeqCst);
    }
}

/// Fires once after a delay unless it is cancelled first.
///
/// On firing it claims the exit status with TIMEOUT and terminates the
/// hypervisor, which unblocks the reading session thread.
struct Timer {
    cancel: Option<Sender<()>>,
    handle: Option<JoinHandle<bool>>,
}

impl Timer {
    fn arm(after: Duration, exit: Arc<ExitCell>, terminator: Terminator) -> Timer {
        let (tx, rx) = mpsc::channel::<()>();
        let handle = thread::spawn(move || {
            match rx.recv_timeout(after) {
                Err(RecvTimeoutError::Timeout) => {}
                _ => return false,
            }
            if !exit.try_set(ExitStatus::Timeout.code()) {
                return false;
            }

            warn!("Timeout after {:?}, stopping PID {}", after, terminator.pid());
            terminator.terminate();
            if let Err(RecvTimeoutError::Timeout) = rx.recv_timeout(KILL_TIMEOUT) {
                terminator.kill();
            }
            true
        });

        Timer {
            cancel: Some(tx),
            handle: Some(handle),
        }
    }

    /// Stops the timer, returns whether it fired. Cancelling twice is fine.
    fn cancel(&mut self) -> bool {
        // Dropping the sender wakes the timer thread.
        drop(self.cancel.take());
        match self.handle.take() {
            Some(handle) => handle.join().unwrap_or(false),
            None => false,
        }
    }
}

/// Options for one [`Vm::boot`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootOptions {
    /// Seconds until the session times out, 0 disables the timeout.
    pub timeout: u64,
    pub multiboot: bool,
    /// Let the hypervisor wait for a debugger.
    pub debug: bool,
    pub kernel_args: String,
    /// Boot this image instead of the configured one.
    pub image: Option<String>,
}

impl Default for BootOptions {
    fn default() -> BootOptions {
        BootOptions {
            timeout: DEFAULT_TIMEOUT,
            multiboot: true,
            debug: false,
            kernel_args: String::from(DEFAULT_KERNEL_ARGS),
            image: None,
        }
    }
}

impl BootOptions {
    pub fn new() -> BootOptions {
        BootOptions::default()
    }

    pub fn timeout(mut self, secs: u64) -> BootOptions {
        self.timeout = secs;
        self
    }

    pub fn disable_timeout(mut self) -> BootOptions {
        self.timeout = 0;
        self
    }

    pub fn multiboot(mut self, multiboot: bool) -> BootOptions {
        self.multiboot = multiboot;
        self
    }

    pub fn debug(mut self, debug: bool) -> BootOptions {
        self.debug = debug;
        self
    }

    pub fn kernel_args(mut self, args: &str) -> BootOptions {
        self.kernel_args = String::from(args);
        self
    }

    pub fn image(mut self, image: &str) -> BootOptions {
        self.image = Some(String::from(image));
        self
    }
}

/// What event callbacks and hooks get to work with.
pub struct VmControl {
    hyper: Hypervisor,
    exit: Arc<ExitCell>,
    message: String,
    keep_running: bool,
}

impl VmControl {
    fn new(hyper: Hypervisor) -> VmControl {
        VmControl {
            hyper,
            exit: Arc::new(ExitCell::new()),
            message: String::new(),
            keep_running: false,
        }
    }

    pub fn hypervisor(&self) -> &Hypervisor {
        &self.hyper
    }

    pub fn hypervisor_mut(&mut self) -> &mut Hypervisor {
        &mut self.hyper
    }

    /// Ends the current boot with `status`.
    ///
    /// Returns false (and changes nothing) if the status was already set.
    pub fn exit(&mut self, status: ExitStatus, message: &str) -> bool {
        if self.exit.try_set(status.code()) {
            info!("Exit status {}: {}", status.name(), message);
            self.message = String::from(message);
            true
        } else {
            debug!(
                "Ignoring exit with {}, status is already {:?}",
                status.name(),
                self.exit_status()
            );
            false
        }
    }

    /// Like [`VmControl::exit`], but the session stays usable for another
    /// boot and the exit hooks don't run.
    /// Returns false (and changes nothing) if the status was already set.
    pub fn exit_keep_running(&mut self, status: ExitStatus, message: &str) -> bool {
        let won = self.exit(status, message);
        if won {
            self.keep_running = true;
        }
        won
    }

    pub fn keep_running(&mut self, keep: bool) {
        self.keep_running = keep;
    }

    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.exit.get().map(ExitStatus::from)
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn read_line(&mut self) -> Result<String, VmError> {
        self.hyper.read_line()
    }

    pub fn write_line(&mut self, line: &str) -> Result<(), VmError> {
        self.hyper.write_line(line)
    }

    pub fn read_until(&mut self, sentinel: u8) -> Result<String, VmError> {
        self.hyper.read_until(sentinel)
    }

    pub fn poll(&mut self) -> Option<i32> {
        self.hyper.poll()
    }

    /// Stops the hypervisor. Safe to call any number of times.
    pub fn stop(&mut self) {
        self.hyper.stop();
    }
}

type Hook = Box<dyn FnMut(&mut VmControl)>;

/// A VM together with its event rules and exit hooks.
pub struct Vm {
    ctl: VmControl,
    events: EventRegistry,
    on_timeout: Option<Hook>,
    on_exit: Option<Hook>,
    on_exit_success: Option<Hook>,
    registry: Option<VmRegistry>,
    root: PathBuf,
    /// The exit hooks ran for the current boot.
    exited: bool,
}

impl Vm {
    pub fn new(hyper: Hypervisor) -> Vm {
        Vm {
            ctl: VmControl::new(hyper),
            events: EventRegistry::new(),
            on_timeout: None,
            on_exit: None,
            on_exit_success: None,
            registry: None,
            exited: false,
            root: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }

    /// A QEMU VM for `config`.
    pub fn from_config(config: &VmConfig) -> Vm {
        Vm::new(Hypervisor::qemu(config))
    }

    /// A QEMU VM for the first valid config in `dir`.
    pub fn from_dir<P: AsRef<Path>>(dir: P) -> Result<Vm, VmError> {
        Ok(Vm::from_config(&VmConfig::load(dir)?))
    }

    /// Registers the running hypervisor in `registry` for interrupt cleanup.
    pub fn with_registry(mut self, registry: VmRegistry) -> Vm {
        self.registry = Some(registry);
        self
    }

    pub fn control(&mut self) -> &mut VmControl {
        &mut self.ctl
    }

    pub fn hypervisor(&self) -> &Hypervisor {
        &self.ctl.hyper
    }

    pub fn events(&self) -> &EventRegistry {
        &self.events
    }

    pub fn on_output<F, R>(&mut self, pattern: &str, callback: F) -> Result<(), VmError>
    where
        F: FnMut(&mut VmControl, &str) -> R + 'static,
        R: Into<Verdict>,
    {
        self.events.on(pattern, callback)
    }

    /// Adds `callback` to the success rule. With `also_exit` false the
    /// session keeps running after a success line.
    pub fn on_success<F, R>(&mut self, callback: F, also_exit: bool)
    where
        F: FnMut(&mut VmControl, &str) -> R + 'static,
        R: Into<Verdict>,
    {
        self.events.on_success(callback, also_exit)
    }

    pub fn on_panic<F, R>(&mut self, callback: F, also_exit: bool)
    where
        F: FnMut(&mut VmControl, &str) -> R + 'static,
        R: Into<Verdict>,
    {
        self.events.on_panic(callback, also_exit)
    }

    /// Runs after the hypervisor was stopped because of a timeout.
    pub fn on_timeout<F: FnMut(&mut VmControl) + 'static>(&mut self, hook: F) {
        self.on_timeout = Some(Box::new(hook));
    }

    pub fn on_exit<F: FnMut(&mut VmControl) + 'static>(&mut self, hook: F) {
        self.on_exit = Some(Box::new(hook));
    }

    pub fn on_exit_success<F: FnMut(&mut VmControl) + 'static>(&mut self, hook: F) {
        self.on_exit_success = Some(Box::new(hook));
    }

    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.ctl.exit_status()
    }

    pub fn message(&self) -> &str {
        self.ctl.message()
    }

    pub fn read_line(&mut self) -> Result<String, VmError> {
        self.ctl.read_line()
    }

    pub fn write_line(&mut self, line: &str) -> Result<(), VmError> {
        self.ctl.write_line(line)
    }

    pub fn stop(&mut self) {
        self.ctl.stop();
    }

    /// Boots the VM and runs the session until it has an exit status.
    ///
    /// Can be called again once it returned, e.g. after a callback used
    /// [`VmControl::exit_keep_running`].
    pub fn boot(&mut self, options: &BootOptions) -> ExitStatus {
        self.ctl.exit.reset();
        self.ctl.message.clear();
        self.ctl.keep_running = false;
        self.exited = false;
        let anchor = env::current_dir().ok();
        let start = Instant::now();

        println!(
            "{}",
            color::header(&format!(
                "Booting {} with {}",
                options
                    .image
                    .as_deref()
                    .or(self.ctl.hyper.config().image.as_deref())
                    .unwrap_or("<no image>"),
                self.ctl.hyper.name()
            ))
        );

        let booted = self.ctl.hyper.boot(
            options.multiboot,
            options.debug,
            &options.kernel_args,
            options.image.as_deref(),
        );

        match booted {
            Err(e) => {
                println!("{}", color::fail(&format!("Boot failed: {}", e)));
                self.ctl.exit(e.exit_status(), &e.to_string());
            }
            Ok(()) => self.run(options.timeout),
        }

        if let Some(dir) = anchor {
            if let Err(e) = env::set_current_dir(&dir) {
                warn!("Can't restore working directory {}: {}", dir.display(), e);
            }
        }
        self.finish(start.elapsed())
    }

    /// Event loop of a booted VM, including timer and teardown.
    fn run(&mut self, timeout: u64) {
        let terminator = self.ctl.hyper.terminator();
        if let (Some(registry), Some(t)) = (&self.registry, terminator) {
            registry.register(t);
        }

        let mut timer = match terminator {
            Some(t) if timeout > 0 => Some(Timer::arm(
                Duration::from_secs(timeout),
                self.ctl.exit.clone(),
                t,
            )),
            _ => None,
        };

        self.read_events();

        // The timer must be gone before the hypervisor is reaped, its pid
        // may be reused afterwards.
        let timed_out = timer.as_mut().map_or(false, |t| t.cancel());
        if self.ctl.exit_status().is_none() {
            self.exit_with_hypervisor_status();
        }
        self.ctl.stop();
        if let (Some(registry), Some(t)) = (&self.registry, terminator) {
            registry.unregister(&t);
        }

        if timed_out {
            self.ctl.message = format!("Test timed out after {} seconds", timeout);
            if let Some(hook) = self.on_timeout.as_mut() {
                hook(&mut self.ctl);
            }
        }
    }

    fn read_events(&mut self) {
        while self.ctl.exit_status().is_none() {
            let line = match self.ctl.hyper.read_line() {
                Ok(line) => line,
                Err(e) => {
                    debug!("Stopped reading hypervisor output: {}", e);
                    break;
                }
            };
            self.handle_line(&line);
        }

        if self.ctl.exit_status().is_some() {
            return;
        }

        // The reader may have stopped before consuming all buffered output.
        let rest = self.ctl.hyper.final_output();
        for line in rest.lines() {
            println!("{}", color::data(line));
            if self.scan_line(line) {
                break;
            }
        }
    }

    /// Without any marker the hypervisor's own exit code is the status.
    fn exit_with_hypervisor_status(&mut self) {
        let name = self.ctl.hyper.name();
        match self.ctl.hyper.wait() {
            Some(code) => {
                let message = format!("{} exited with status {}", name, code);
                self.ctl.exit(ExitStatus::from(code), &message);
            }
            None => {
                let message = format!("{} output ended, exit status unknown", name);
                self.ctl.exit(ExitStatus::VmEot, &message);
            }
        }
    }

    /// Checks for the service-exit marker and EOT. True if the line ends the
    /// boot.
    fn scan_line(&mut self, line: &str) -> bool {
        if let Some(code) = service_exit_status(line) {
            let message = format!("Service exited with status {}", code);
            self.ctl.exit(ExitStatus::from(code), &message);
            return true;
        }
        if is_eot(line) {
            self.ctl.exit(ExitStatus::VmEot, "Guest output ended with EOT");
            return true;
        }
        false
    }

    fn handle_line(&mut self, line: &str) {
        println!("{}", color::data(line));
        if self.scan_line(line) {
            return;
        }
        if self.events.dispatch(&mut self.ctl, line) == Verdict::Fail {
            let message = format!("Event callback failed on `{}`", line.trim());
            self.ctl.exit(ExitStatus::CallbackFailed, &message);
        }
    }

    /// Prints the verdict and runs the exit hooks.
    fn finish(&mut self, elapsed: Duration) -> ExitStatus {
        let status = match self.ctl.exit_status() {
            Some(status) => status,
            None => {
                self.ctl.exit(ExitStatus::VmEot, "No exit status");
                ExitStatus::VmEot
            }
        };

        if self.ctl.keep_running {
            info!(
                "Boot ended with {}, keeping the session for another boot",
                status.name()
            );
            return status;
        }

        let secs = elapsed.as_secs_f64();
        if status.is_success() {
            println!(
                "{} {} ({:.1}s)",
                color::success("[ SUCCESS ]"),
                self.ctl.message,
                secs
            );
        } else {
            println!(
                "{} {} ({:.1}s)",
                color::fail(&format!("[ {} ]", status.name())),
                self.ctl.message,
                secs
            );
        }

        self.exited = true;
        if let Some(hook) = self.on_exit.as_mut() {
            hook(&mut self.ctl);
        }
        if status.is_success() {
            if let Some(hook) = self.on_exit_success.as_mut() {
                hook(&mut self.ctl);
            }
        }
        status
    }

    /// Ends the session with `status`, overriding whatever was set before.
    ///
    /// For test programs failing outside of a boot (e.g. in a build step).
    /// The exit hooks run once per boot: if they already ran, only the
    /// status and message change.
    pub fn exit(&mut self, status: ExitStatus, message: &str) -> ExitStatus {
        self.ctl.stop();
        self.ctl.exit.set(status.code());
        self.ctl.message = String::from(message);
        self.ctl.keep_running = false;
        if self.exited {
            info!("Exit status changed to {}: {}", status.name(), message);
            return status;
        }
        self.finish(Duration::from_secs(0))
    }

    fn build(&self) -> Build {
        Build::new(&self.root)
    }

    pub fn make(&self, args: &[&str]) -> Result<(), VmError> {
        self.build().make(args)
    }

    pub fn cmake(&self, args: &[&str]) -> Result<(), VmError> {
        self.build().cmake(args)
    }

    pub fn clean(&self) -> Result<(), VmError> {
        self.build().clean()
    }
}
