// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 rill developers

//! Program-shell CLI surface.
//!
//! Every compiled pipeline exposes the same arguments; the descriptor
//! tables supply the program-specific parameter and probe names.

use clap::Parser;
use std::path::PathBuf;

/// Command-line arguments accepted by compiled pipeline programs.
#[derive(Parser, Debug)]
#[command(disable_version_flag = true)]
pub struct ShellArgs {
    /// Apply a runtime parameter (repeatable)
    #[arg(long = "param", value_name = "NAME=VALUE")]
    pub params: Vec<String>,

    /// Run duration: `inf`, `<num>`, `<num>s`, or `<num>m`
    #[arg(long, default_value = "inf", value_name = "DURATION")]
    pub duration: String,

    /// Advisory worker-thread count
    #[arg(long, value_name = "N")]
    pub threads: Option<usize>,

    /// Enable a named probe (repeatable)
    #[arg(long = "probe", value_name = "NAME")]
    pub probes: Vec<String>,

    /// Redirect probe output to a file
    #[arg(long = "probe-output", value_name = "PATH")]
    pub probe_output: Option<PathBuf>,

    /// Print per-task and per-buffer statistics on exit
    #[arg(long)]
    pub stats: bool,
}

/// Parse a duration string into seconds. `inf` runs until interrupted.
#[must_use]
pub fn parse_duration(s: &str) -> Option<f64> {
    if s == "inf" {
        return Some(f64::INFINITY);
    }
    let (number, scale) = if let Some(minutes) = s.strip_suffix('m') {
        (minutes, 60.0)
    } else if let Some(seconds) = s.strip_suffix('s') {
        (seconds, 1.0)
    } else {
        (s, 1.0)
    };
    let base: f64 = number.parse().ok()?;
    if !base.is_finite() || base < 0.0 {
        return None;
    }
    Some(base * scale)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_forms() {
        assert_eq!(parse_duration("inf"), Some(f64::INFINITY));
        assert_eq!(parse_duration("2"), Some(2.0));
        assert_eq!(parse_duration("2.5s"), Some(2.5));
        assert_eq!(parse_duration("3m"), Some(180.0));
        assert_eq!(parse_duration("0"), Some(0.0));
    }

    #[test]
    fn duration_rejects_garbage() {
        assert_eq!(parse_duration(""), None);
        assert_eq!(parse_duration("abc"), None);
        assert_eq!(parse_duration("5h"), None);
        assert_eq!(parse_duration("-1"), None);
        assert_eq!(parse_duration("nan"), None);
    }

    #[test]
    fn args_parse_full_surface() {
        let args = ShellArgs::try_parse_from([
            "prog",
            "--param",
            "gain=0.5",
            "--param",
            "freq=440",
            "--duration",
            "10s",
            "--threads",
            "4",
            "--probe",
            "taps",
            "--probe-output",
            "/tmp/probes.txt",
            "--stats",
        ])
        .expect("parse");
        assert_eq!(args.params, vec!["gain=0.5", "freq=440"]);
        assert_eq!(args.duration, "10s");
        assert_eq!(args.threads, Some(4));
        assert_eq!(args.probes, vec!["taps"]);
        assert!(args.stats);
    }

    #[test]
    fn args_reject_unknown_flag() {
        assert!(ShellArgs::try_parse_from(["prog", "--bogus"]).is_err());
    }

    #[test]
    fn args_default_duration_is_inf() {
        let args = ShellArgs::try_parse_from(["prog"]).expect("parse");
        assert_eq!(args.duration, "inf");
        assert!(!args.stats);
    }
}
