// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Process tree inspection through `/proc`.
//!
//! A hypervisor started through `sudo` is not the VM: signals sent to the
//! wrapper are not forwarded, so we have to find the real children.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

const PROC_ROOT: &str = "/proc";

/// Parses the parent pid out of the contents of `/proc/<pid>/stat`.
///
/// The command name (field 2) is in parentheses and may itself contain
/// spaces or parentheses, so we split after the last `)`.
pub fn parse_ppid(stat: &str) -> Option<i32> {
    let rest = &stat[stat.rfind(')')? + 1..];
    let mut fields = rest.split_whitespace();
    let _state = fields.next()?;
    fields.next()?.parse().ok()
}

/// Maps every pid found below `root` to its parent pid.
fn parent_map(root: &Path) -> HashMap<i32, i32> {
    let mut parents = HashMap::new();
    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(_) => return parents,
    };

    for entry in entries.flatten() {
        let pid: i32 = match entry.file_name().to_string_lossy().parse() {
            Ok(pid) => pid,
            Err(_) => continue,
        };
        // Processes can disappear while we walk the directory.
        if let Ok(stat) = fs::read_to_string(entry.path().join("stat")) {
            if let Some(ppid) = parse_ppid(&stat) {
                parents.insert(pid, ppid);
            }
        }
    }

    parents
}

/// Returns every pid in the `(pid, ppid)` relation that descends from `pid`,
/// closest first. `pid` itself is not included.
pub fn descendants_in(parents: &HashMap<i32, i32>, pid: i32) -> Vec<i32> {
    let mut found = Vec::new();
    let mut frontier = vec![pid];
    while let Some(parent) = frontier.pop() {
        let mut children: Vec<i32> = parents
            .iter()
            .filter(|(child, ppid)| **ppid == parent && !found.contains(*child) && **child != pid)
            .map(|(child, _)| *child)
            .collect();
        children.sort_unstable();
        found.extend(children.iter().copied());
        frontier.extend(children);
    }
    found
}

/// All live descendants of `pid` on this host.
pub fn descendants(pid: i32) -> Vec<i32> {
    descendants_in(&parent_map(Path::new(PROC_ROOT)), pid)
}

/// Direct children of `pid` on this host.
pub fn children(pid: i32) -> Vec<i32> {
    let mut children: Vec<i32> = parent_map(Path::new(PROC_ROOT))
        .into_iter()
        .filter(|(_, ppid)| *ppid == pid)
        .map(|(child, _)| child)
        .collect();
    children.sort_unstable();
    children
}
