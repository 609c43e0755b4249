// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! ANSI colored tags for the human readable parts of the output.

const C_HEAD: &str = "\x1b[1;95m";
const C_INFO: &str = "\x1b[1;94m";
const C_OK: &str = "\x1b[1;92m";
const C_WARN: &str = "\x1b[1;93m";
const C_FAIL: &str = "\x1b[1;91m";
const C_GRAY: &str = "\x1b[0;90m";
const C_END: &str = "\x1b[0m";

fn paint(color: &str, s: &str) -> String {
    format!("{}{}{}", color, s, C_END)
}

pub fn header(s: &str) -> String {
    paint(C_HEAD, &format!("\n===== {} =====", s))
}

pub fn info(s: &str) -> String {
    paint(C_INFO, s)
}

pub fn warning(s: &str) -> String {
    paint(C_WARN, s)
}

pub fn fail(s: &str) -> String {
    paint(C_FAIL, s)
}

pub fn success(s: &str) -> String {
    paint(C_OK, s)
}

/// Raw output of a subprocess (guest console, captured logs).
pub fn data(s: &str) -> String {
    paint(C_GRAY, s)
}

pub fn pass_inline() -> String {
    paint(C_OK, "[ PASS ]")
}

pub fn fail_inline() -> String {
    paint(C_FAIL, "[ FAIL ]")
}
