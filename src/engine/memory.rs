//! Resident memory sampling for a process group
//!
//! The result is a sampled value: allocations that rise and fall between two
//! samples are never seen. OS rlimits remain the primary ceiling.

#[cfg(target_os = "linux")]
use std::fs;

/// Sum of resident set sizes (KB) of every live process in the group
#[cfg(target_os = "linux")]
pub fn group_rss_kb(pgid: i32) -> u64 {
    let entries = match fs::read_dir("/proc") {
        Ok(entries) => entries,
        Err(_) => return 0,
    };

    entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().to_str()?.parse::<i32>().ok())
        .filter(|pid| process_group_of(*pid) == Some(pgid))
        .filter_map(process_rss_kb)
        .sum()
}

/// Outside Linux only the group leader is sampled, through `ps`
#[cfg(not(target_os = "linux"))]
pub fn group_rss_kb(pgid: i32) -> u64 {
    std::process::Command::new("ps")
        .args(["-o", "rss=", "-p", &pgid.to_string()])
        .output()
        .ok()
        .and_then(|output| {
            String::from_utf8_lossy(&output.stdout)
                .trim()
                .parse::<u64>()
                .ok()
        })
        .unwrap_or(0)
}

/// Process group id from `/proc/<pid>/stat`
#[cfg(target_os = "linux")]
fn process_group_of(pid: i32) -> Option<i32> {
    let stat = fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
    // comm may contain spaces and parentheses; fields resume after the last ')'
    let rest = &stat[stat.rfind(')')? + 1..];
    // state ppid pgrp ...
    rest.split_whitespace().nth(2)?.parse().ok()
}

/// `VmRSS` of one process in KB; None for zombies and kernel threads
#[cfg(target_os = "linux")]
pub fn process_rss_kb(pid: i32) -> Option<u64> {
    let status = fs::read_to_string(format!("/proc/{}/status", pid)).ok()?;
    status
        .lines()
        .find_map(|line| line.strip_prefix("VmRSS:"))
        .and_then(|value| value.split_whitespace().next())
        .and_then(|kb| kb.parse().ok())
}
