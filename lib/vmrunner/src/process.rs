// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The hypervisor child process and the process-control surface shared by
//! all hypervisor backends.

use std::process::Command;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use rexpect::process::wait::WaitStatus;
use rexpect::session::{spawn_command, PtySession};

use crate::error::VmError;
use crate::proctree;

/// A process that exits within this window after spawn did not boot.
pub const STARTUP_GRACE: Duration = Duration::from_millis(500);

/// How long we wait for a SIGTERM to take effect before we use SIGKILL.
pub const KILL_TIMEOUT: Duration = Duration::from_secs(5);

/// First command token that marks a privilege-escalation wrapper.
pub const PRIVILEGE_WRAPPER: &str = "sudo";

/// Converts a wait status into a process exit code.
///
/// Termination by a signal is reported the way shells do: `128 + signal`.
fn exit_code(status: &WaitStatus) -> Option<i32> {
    match status {
        WaitStatus::Exited(_, code) => Some(*code),
        WaitStatus::Signaled(_, signal, _) => Some(128 + *signal as i32),
        _ => None,
    }
}

/// Exit code of `pid` if it has exited, without reaping it.
///
/// The pid stays reserved until [`VmProcess::wait`], so nothing can signal
/// a reused pid in between.
fn peek_exit(pid: i32) -> Option<i32> {
    // Safety: an all-zero siginfo_t is valid and waitid(2) only writes to it.
    let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };
    let flags = libc::WEXITED | libc::WNOHANG | libc::WNOWAIT;
    let r = unsafe { libc::waitid(libc::P_PID, pid as libc::id_t, &mut info, flags) };
    if r != 0 {
        return None;
    }
    // Safety: waitid(2) filled in a SIGCHLD siginfo (or left it zeroed).
    let (child, status) = unsafe { (info.si_pid(), info.si_status()) };
    if child == 0 {
        return None;
    }
    match info.si_code {
        libc::CLD_EXITED => Some(status),
        _ => Some(128 + status),
    }
}

/// Delivers signals to a hypervisor process tree.
///
/// Cheap to clone and `Send`, so the session timer and the interrupt handler
/// can hold one without owning the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Terminator {
    pid: i32,
    privileged: bool,
}

impl Terminator {
    pub fn new(pid: i32, privileged: bool) -> Terminator {
        Terminator { pid, privileged }
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    /// Pids that have to receive the signal.
    ///
    /// Signals to a privilege wrapper are not forwarded to the VM, so the
    /// wrapper's descendants are signaled individually.
    pub fn targets(&self) -> Vec<i32> {
        if self.privileged {
            let children = proctree::descendants(self.pid);
            if children.is_empty() {
                vec![self.pid]
            } else {
                children
            }
        } else {
            vec![self.pid]
        }
    }

    pub fn terminate(&self) {
        self.signal(libc::SIGTERM, "TERM");
    }

    pub fn kill(&self) {
        self.signal(libc::SIGKILL, "KILL");
    }

    fn signal(&self, signal: libc::c_int, name: &str) {
        for pid in self.targets() {
            debug!("Sending SIG{} to {}", name, pid);
            if self.privileged {
                let sent = Command::new(PRIVILEGE_WRAPPER)
                    .args(["kill", &format!("-{}", name), &pid.to_string()])
                    .status();
                if let Err(e) = sent {
                    warn!("Could not signal privileged process {}: {}", pid, e);
                }
            } else {
                // Safety: kill(2) has no memory safety requirements.
                let r = unsafe { libc::kill(pid, signal) };
                if r != 0 {
                    debug!("kill({}, SIG{}) failed, process is gone", pid, name);
                }
            }
        }
    }
}

/// A running hypervisor process with its console attached to a pty.
pub struct VmProcess {
    session: PtySession,
    privileged: bool,
    stopped: bool,
    exit_code: Option<i32>,
}

impl VmProcess {
    /// Starts `command` and gives it [`STARTUP_GRACE`] to come up.
    ///
    /// A process that already failed after the grace period is a boot
    /// failure, its output becomes part of the error.
    pub fn start(command: &[String]) -> Result<VmProcess, VmError> {
        let (program, args) = command.split_first().ok_or_else(|| VmError::BootFailure {
            reason: String::from("empty hypervisor command"),
        })?;

        let privileged = program == PRIVILEGE_WRAPPER;
        let mut cmd = Command::new(program);
        cmd.args(args);
        info!("Invoke hypervisor: {:?}", cmd);

        let session = spawn_command(cmd, None).map_err(|e| VmError::BootFailure {
            reason: e.to_string(),
        })?;

        let mut process = VmProcess {
            session,
            privileged,
            stopped: false,
            exit_code: None,
        };

        thread::sleep(STARTUP_GRACE);
        match process.poll() {
            Some(code) if code != 0 => {
                let output = process.final_output();
                return Err(VmError::BootFailure {
                    reason: format!(
                        "process exited with status {} right after start: {}",
                        code,
                        output.trim()
                    ),
                });
            }
            _ => {}
        }

        info!("Started process PID {}", process.pid());
        Ok(process)
    }

    pub fn pid(&self) -> i32 {
        self.session.process.child_pid.as_raw()
    }

    /// Was the process started through a privilege wrapper?
    pub fn privileged(&self) -> bool {
        self.privileged
    }

    pub fn terminator(&self) -> Terminator {
        Terminator::new(self.pid(), self.privileged)
    }

    /// Exit code of the process, `None` while it is running.
    ///
    /// Doesn't reap the process, only [`VmProcess::wait`] does.
    pub fn poll(&mut self) -> Option<i32> {
        self.exit_code.or_else(|| peek_exit(self.pid()))
    }

    /// Blocks until the process exited and reaps it.
    pub fn wait(&mut self) -> Option<i32> {
        if self.exit_code.is_none() {
            match self.session.process.wait() {
                Ok(status) => self.exit_code = exit_code(&status),
                Err(e) => debug!("wait on {} failed: {}", self.pid(), e),
            }
        }
        self.exit_code
    }

    /// Reads one line of console output (without the line terminator).
    pub fn read_line(&mut self) -> Result<String, VmError> {
        match self.session.read_line() {
            Ok(line) => Ok(line),
            Err(e) => {
                if self.poll().is_some() || self.stopped {
                    Err(VmError::ProcessCompleted)
                } else {
                    Err(e.into())
                }
            }
        }
    }

    /// Sends a line to the console of the guest.
    pub fn write_line(&mut self, line: &str) -> Result<(), VmError> {
        if self.stopped || self.poll().is_some() {
            return Err(VmError::ProcessCompleted);
        }
        self.session.send_line(line)?;
        Ok(())
    }

    /// Reads everything up to (not including) `sentinel`.
    pub fn read_until(&mut self, sentinel: u8) -> Result<String, VmError> {
        let needle = char::from(sentinel).to_string();
        match self.session.exp_string(&needle) {
            Ok(output) => Ok(output),
            Err(e) => {
                if self.poll().is_some() {
                    Err(VmError::ProcessCompleted)
                } else {
                    Err(e.into())
                }
            }
        }
    }

    /// Whatever output is still buffered once the process closed its console.
    pub fn final_output(&mut self) -> String {
        match self.session.exp_eof() {
            Ok(output) => output,
            Err(e) => {
                debug!("No final output from {}: {}", self.pid(), e);
                String::new()
            }
        }
    }

    /// Terminates the process tree and waits for it to be gone.
    ///
    /// Stopping a process twice does nothing the second time.
    pub fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;

        if self.poll().is_none() {
            info!("Stopping PID {}", self.pid());
            let terminator = self.terminator();
            terminator.terminate();

            let start = Instant::now();
            while self.poll().is_none() {
                if start.elapsed() > KILL_TIMEOUT {
                    warn!("PID {} ignored SIGTERM, killing it", self.pid());
                    terminator.kill();
                    break;
                }
                thread::sleep(Duration::from_millis(50));
            }
        }

        // Leaving the process unreaped can corrupt the controlling terminal.
        self.wait();
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }
}
