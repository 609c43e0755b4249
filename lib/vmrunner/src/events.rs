// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Pattern → callback rules evaluated against every line of guest output.
//!
//! Rules are kept in registration order and all rules matching a line fire
//! until one of them fails: user rules in registration order, then the
//! built-in success and panic rules. [`EventRegistry::on_success`] and
//! [`EventRegistry::on_panic`] add handlers to the built-in chains instead
//! of replacing them.

use std::fmt::Display;
use std::panic::{self, AssertUnwindSafe};

use lazy_static::lazy_static;
use log::{error, warn};
use regex::Regex;

use crate::color;
use crate::error::VmError;
use crate::session::VmControl;
use crate::ExitStatus;

/// Pattern of the built-in success rule.
pub const SUCCESS_PATTERN: &str = "SUCCESS";

/// Pattern of the panic signature printed by a crashing guest.
pub const PANIC_PATTERN: &str = r"\x15\x07\t\*\*\*\* PANIC \*\*\*\*";

/// End-of-transmission byte, the guest's output ends abnormally after it.
pub const EOT: u8 = 0x04;

lazy_static! {
    static ref SUCCESS_RE: Regex = Regex::new(SUCCESS_PATTERN).expect("valid success pattern");
    static ref PANIC_RE: Regex = Regex::new(PANIC_PATTERN).expect("valid panic pattern");
}

/// Outcome of an event callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Continue,
    /// The callback asserted that something is wrong.
    Fail,
}

impl From<()> for Verdict {
    fn from(_: ()) -> Self {
        Verdict::Continue
    }
}

impl From<bool> for Verdict {
    fn from(ok: bool) -> Self {
        if ok {
            Verdict::Continue
        } else {
            Verdict::Fail
        }
    }
}

impl<T: Into<Verdict>, E: Display> From<Result<T, E>> for Verdict {
    fn from(r: Result<T, E>) -> Self {
        match r {
            Ok(v) => v.into(),
            Err(e) => {
                error!("Event callback failed: {}", e);
                Verdict::Fail
            }
        }
    }
}

pub type Callback = Box<dyn FnMut(&mut VmControl, &str) -> Verdict>;

/// Handlers composed onto a built-in rule.
pub struct Chain {
    handlers: Vec<Callback>,
    /// Whether the built-in exit behavior runs after the handlers.
    default_exit: bool,
}

impl Chain {
    fn new() -> Chain {
        Chain {
            handlers: Vec::new(),
            default_exit: true,
        }
    }

    fn push(&mut self, handler: Callback, also_exit: bool) {
        self.handlers.push(handler);
        self.default_exit = also_exit;
    }

    fn run(&mut self, vm: &mut VmControl, line: &str) -> Verdict {
        for handler in self.handlers.iter_mut() {
            if invoke(handler, vm, line) == Verdict::Fail {
                return Verdict::Fail;
            }
        }
        Verdict::Continue
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn default_exit(&self) -> bool {
        self.default_exit
    }
}

pub enum Action {
    User(Callback),
    Success(Chain),
    Panic(Chain),
}

pub struct EventRule {
    pattern: String,
    regex: Regex,
    action: Action,
}

impl EventRule {
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn action(&self) -> &Action {
        &self.action
    }

    fn fire(&mut self, vm: &mut VmControl, line: &str) -> Verdict {
        match &mut self.action {
            Action::User(callback) => invoke(callback, vm, line),
            Action::Success(chain) => {
                if chain.run(vm, line) == Verdict::Fail {
                    return Verdict::Fail;
                }
                if chain.default_exit {
                    vm.exit(ExitStatus::Success, "All tests passed");
                }
                Verdict::Continue
            }
            Action::Panic(chain) => {
                let detail = if chain.default_exit {
                    Some(drain_panic(vm, line))
                } else {
                    None
                };
                if chain.run(vm, line) == Verdict::Fail {
                    return Verdict::Fail;
                }
                if let Some(detail) = detail {
                    vm.exit(ExitStatus::VmPanic, &detail);
                }
                Verdict::Continue
            }
        }
    }
}

/// Runs a callback, turning a panic inside it into a failure.
fn invoke(callback: &mut Callback, vm: &mut VmControl, line: &str) -> Verdict {
    match panic::catch_unwind(AssertUnwindSafe(|| callback(vm, line))) {
        Ok(verdict) => verdict,
        Err(cause) => {
            let reason = cause
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| cause.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| String::from("unknown panic"));
            error!("Event callback panicked on `{}`: {}", line, reason);
            Verdict::Fail
        }
    }
}

/// Reads the panic detail line and everything the guest prints until EOT.
///
/// The guest dies right after a panic, waiting for more output would hang.
fn drain_panic(vm: &mut VmControl, line: &str) -> String {
    let detail = vm.read_line().unwrap_or_default();
    let rest = vm.read_until(EOT).unwrap_or_default();
    println!("{}", color::fail(line.trim()));
    println!("{}", color::fail(detail.trim()));
    for l in rest.lines() {
        println!("{}", color::data(l));
    }
    String::from(detail.trim())
}

/// Ordered set of event rules for one VM.
pub struct EventRegistry {
    rules: Vec<EventRule>,
}

impl Default for EventRegistry {
    fn default() -> Self {
        EventRegistry::new()
    }
}

impl EventRegistry {
    /// A registry with the built-in success and panic rules.
    pub fn new() -> EventRegistry {
        EventRegistry {
            rules: vec![
                EventRule {
                    pattern: String::from(SUCCESS_PATTERN),
                    regex: SUCCESS_RE.clone(),
                    action: Action::Success(Chain::new()),
                },
                EventRule {
                    pattern: String::from(PANIC_PATTERN),
                    regex: PANIC_RE.clone(),
                    action: Action::Panic(Chain::new()),
                },
            ],
        }
    }

    /// Registers `callback` for lines matching `pattern`.
    ///
    /// Registering the same pattern again replaces the previous callback
    /// but keeps its position.
    pub fn on<F, R>(&mut self, pattern: &str, mut callback: F) -> Result<(), VmError>
    where
        F: FnMut(&mut VmControl, &str) -> R + 'static,
        R: Into<Verdict>,
    {
        let action = Action::User(Box::new(move |vm: &mut VmControl, line: &str| {
            callback(vm, line).into()
        }));
        if let Some(rule) = self.rules.iter_mut().find(|r| r.pattern == pattern) {
            if !matches!(rule.action, Action::User(_)) {
                warn!("Replacing built-in handler for `{}`", pattern);
            }
            rule.action = action;
            return Ok(());
        }

        let regex = Regex::new(pattern).map_err(|e| VmError::Pattern {
            pattern: String::from(pattern),
            reason: e.to_string(),
        })?;
        self.rules.push(EventRule {
            pattern: String::from(pattern),
            regex,
            action,
        });
        Ok(())
    }

    pub fn on_success<F, R>(&mut self, callback: F, also_exit: bool)
    where
        F: FnMut(&mut VmControl, &str) -> R + 'static,
        R: Into<Verdict>,
    {
        self.compose(|a| matches!(a, Action::Success(_)), callback, also_exit);
    }

    pub fn on_panic<F, R>(&mut self, callback: F, also_exit: bool)
    where
        F: FnMut(&mut VmControl, &str) -> R + 'static,
        R: Into<Verdict>,
    {
        self.compose(|a| matches!(a, Action::Panic(_)), callback, also_exit);
    }

    fn compose<F, R>(&mut self, is_target: fn(&Action) -> bool, mut callback: F, also_exit: bool)
    where
        F: FnMut(&mut VmControl, &str) -> R + 'static,
        R: Into<Verdict>,
    {
        let handler: Callback =
            Box::new(move |vm: &mut VmControl, line: &str| callback(vm, line).into());
        match self.rules.iter_mut().find(|r| is_target(&r.action)) {
            Some(EventRule {
                action: Action::Success(chain),
                ..
            })
            | Some(EventRule {
                action: Action::Panic(chain),
                ..
            }) => chain.push(handler, also_exit),
            _ => warn!("Built-in handler was replaced, callback not registered"),
        }
    }

    pub fn rules(&self) -> &[EventRule] {
        &self.rules
    }

    /// Fires every rule matching `line`, stopping at the first failure.
    ///
    /// User rules fire before the built-in success and panic rules. A
    /// failing assertion on a line that also carries the success sentinel
    /// fails the boot before the sentinel can end it successfully.
    pub fn dispatch(&mut self, vm: &mut VmControl, line: &str) -> Verdict {
        for user_pass in [true, false] {
            for rule in self.rules.iter_mut() {
                let is_user = matches!(rule.action, Action::User(_));
                if is_user != user_pass || !rule.regex.is_match(line) {
                    continue;
                }
                if rule.fire(vm, line) == Verdict::Fail {
                    return Verdict::Fail;
                }
            }
        }
        Verdict::Continue
    }
}
