// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use std::fs;
use std::path::PathBuf;
use std::process::{Command, Output};

use ticketd::config::TicketRepositoryConfig;

/// Counters printed by the daemon on its last status line.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SoakSummary {
    pub added: usize,
    pub checked: usize,
    pub failed: usize,
    pub abandoned: usize,
    pub released: usize,
}

/// Runs the daemon to completion via cargo and returns its output.
pub fn run_ticketd(args: &[&str]) -> anyhow::Result<Output> {
    println!("Executing ticketd located via cargo run");
    let output = Command::new("cargo")
        .args(["run", "-q", "-p", "ticketd", "--"])
        .args(args)
        .env("RUST_LOG", "info")
        .output()?;
    Ok(output)
}

/// Writes `config` as JSON into the temp directory and returns the path.
pub fn write_config(name: &str, config: &TicketRepositoryConfig) -> anyhow::Result<PathBuf> {
    let path = std::env::temp_dir().join(format!("ticketd-{}-{name}.json", std::process::id()));
    fs::write(&path, serde_json::to_string_pretty(config)?)?;
    Ok(path)
}

/// Picks the counters out of the last `added=..,checked=..` line.
pub fn parse_summary(log: &str) -> Option<SoakSummary> {
    let line = log.lines().rev().find(|line| line.contains("added="))?;
    let counters = &line[line.find("added=")?..];
    let mut summary = SoakSummary::default();
    for pair in counters.split(',') {
        let (name, value) = pair.split_once('=')?;
        let value: usize = value.trim().parse().ok()?;
        match name {
            "added" => summary.added = value,
            "checked" => summary.checked = value,
            "failed" => summary.failed = value,
            "abandoned" => summary.abandoned = value,
            "released" => summary.released = value,
            _ => {}
        }
    }
    Some(summary)
}
