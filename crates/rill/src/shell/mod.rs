// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 rill developers

//! Program shell — descriptor-driven orchestration for compiled
//! pipelines.
//!
//! Generated programs do not emit CLI parsing, thread management, or
//! statistics reporting inline. They own their state as statics (stop
//! and exit-code atomics, per-task [`TaskStats`], parameter storage,
//! probe flags), describe it through the descriptor tables below, and
//! call [`shell_main`]. The shell drives the run: parse arguments,
//! install the interrupt handler, launch task threads, wait out the
//! duration, join, report.
//!
//! Exit codes: 0 on clean exit, 2 on argument errors, and whatever the
//! program stored in its exit-code atomic otherwise.

mod args;

pub use args::{parse_duration, ShellArgs};

use crate::tick::TaskStats;
use clap::error::ErrorKind as ClapErrorKind;
use clap::Parser;
use parking_lot::Mutex;
use std::fs::File;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::time::Duration;

/// A named runtime parameter: `apply` parses the CLI value and stores
/// it, returning `false` on a malformed value.
pub struct ParamDesc {
    pub name: &'static str,
    pub apply: fn(&str) -> bool,
}

/// A compiled task: entry function run on its own thread, plus the
/// statistics accumulator it records into.
pub struct TaskDesc {
    pub name: &'static str,
    pub entry: fn(),
    pub stats: &'static TaskStats,
}

/// A shared buffer whose backlog is reported by `--stats`.
pub struct BufferStatsDesc {
    pub name: &'static str,
    pub available: fn() -> usize,
    pub elem_size: usize,
}

/// A compiled-in probe and its enable flag.
pub struct ProbeDesc {
    pub name: &'static str,
    pub enabled: &'static AtomicBool,
}

/// Pointers to the program's shared runtime state.
pub struct RuntimeState {
    /// Set by signal/duration; checked by every task loop.
    pub stop: &'static AtomicBool,
    /// Program exit code, settable by any task.
    pub exit_code: &'static AtomicI32,
    /// Released once all task threads are launched.
    pub start: &'static AtomicBool,
    /// Whether to print the statistics report on exit.
    pub stats: &'static AtomicBool,
    /// Probe output destination; `None` means stderr.
    pub probe_output: &'static Mutex<Option<File>>,
}

/// Everything the shell needs to run one compiled program.
pub struct ProgramDesc {
    pub state: RuntimeState,
    pub params: &'static [ParamDesc],
    pub tasks: &'static [TaskDesc],
    pub buffers: &'static [BufferStatsDesc],
    pub probes: &'static [ProbeDesc],
    /// Overrun policy tag, reported in statistics output only.
    pub overrun_policy: &'static str,
    pub mem_allocated: usize,
    pub mem_used: usize,
}

/// Run a compiled program with arguments from the environment.
/// Returns the process exit code.
#[must_use]
pub fn shell_main(desc: &ProgramDesc) -> i32 {
    shell_main_from(std::env::args(), desc)
}

/// Run a compiled program with explicit arguments (first element is the
/// program name).
pub fn shell_main_from<I>(args: I, desc: &ProgramDesc) -> i32
where
    I: IntoIterator<Item = String>,
{
    let parsed = match ShellArgs::try_parse_from(args) {
        Ok(parsed) => parsed,
        Err(e) if matches!(e.kind(), ClapErrorKind::DisplayHelp | ClapErrorKind::DisplayVersion) => {
            let _ = e.print();
            return 0;
        }
        Err(e) => {
            eprintln!("startup error: {e}");
            return 2;
        }
    };

    // Runtime parameters.
    for arg in &parsed.params {
        let Some((name, value)) = arg.split_once('=') else {
            eprintln!("startup error: --param requires name=value");
            return 2;
        };
        let Some(param) = desc.params.iter().find(|p| p.name == name) else {
            if desc.params.is_empty() {
                eprintln!("startup error: --param is unsupported (no runtime params)");
            } else {
                eprintln!("startup error: unknown param '{name}'");
            }
            return 2;
        };
        if !(param.apply)(value) {
            eprintln!("startup error: invalid value '{value}' for param '{name}'");
            return 2;
        }
    }

    let Some(duration_seconds) = parse_duration(&parsed.duration) else {
        eprintln!(
            "startup error: invalid --duration '{}' (use <sec>, <sec>s, <min>m, or inf)",
            parsed.duration
        );
        return 2;
    };

    if parsed.threads == Some(0) {
        eprintln!("startup error: --threads requires a positive integer");
        return 2;
    }

    // Probes are only validated when the program compiled some in;
    // otherwise the flags are accepted and ignored.
    if !desc.probes.is_empty() {
        for name in &parsed.probes {
            let Some(probe) = desc.probes.iter().find(|p| p.name == name) else {
                eprintln!("startup error: unknown probe '{name}'");
                return 2;
            };
            probe.enabled.store(true, Ordering::Release);
        }
        if let Some(path) = &parsed.probe_output {
            match File::create(path) {
                Ok(file) => *desc.state.probe_output.lock() = Some(file),
                Err(e) => {
                    eprintln!(
                        "startup error: failed to open probe output file '{}': {e}",
                        path.display()
                    );
                    return 2;
                }
            }
        }
    }

    if parsed.stats {
        desc.state.stats.store(true, Ordering::Release);
    }

    // Interrupt translates to a stop request; tasks exit at their next
    // tick. Installation can fail if the program already owns a handler.
    let stop = desc.state.stop;
    if let Err(e) = ctrlc::set_handler(move || stop.store(true, Ordering::Release)) {
        log::warn!("[SHELL] could not install interrupt handler: {e}");
    }

    // Launch task threads, then release the start gate.
    let mut task_threads = Vec::with_capacity(desc.tasks.len());
    for task in desc.tasks {
        let builder = std::thread::Builder::new().name(task.name.to_string());
        match builder.spawn(task.entry) {
            Ok(handle) => task_threads.push(handle),
            Err(e) => {
                eprintln!("startup error: failed to spawn task '{}': {e}", task.name);
                desc.state.stop.store(true, Ordering::Release);
                for handle in task_threads {
                    let _ = handle.join();
                }
                return 2;
            }
        }
    }
    desc.state.start.store(true, Ordering::Release);

    if duration_seconds.is_finite() {
        std::thread::sleep(Duration::from_secs_f64(duration_seconds));
        desc.state.stop.store(true, Ordering::Release);
    } else {
        while !desc.state.stop.load(Ordering::Acquire) {
            std::thread::sleep(Duration::from_millis(100));
        }
    }

    for handle in task_threads {
        let _ = handle.join();
    }

    if let Some(threads) = parsed.threads {
        if threads < desc.tasks.len() {
            eprintln!(
                "startup warning: --threads is advisory (requested={threads}, tasks={})",
                desc.tasks.len()
            );
        }
    }

    if desc.state.stats.load(Ordering::Acquire) {
        report_stats(desc);
    }

    desc.state.exit_code.load(Ordering::Acquire)
}

/// Print the `--stats` report: per-task tick accounting, per-buffer
/// backlog, memory pool totals.
fn report_stats(desc: &ProgramDesc) {
    for task in desc.tasks {
        eprintln!(
            "[stats] task '{}': ticks={}, missed={} ({}), max_latency={}ns, avg_latency={}ns",
            task.name,
            task.stats.ticks(),
            task.stats.missed(),
            desc.overrun_policy,
            task.stats.max_latency_ns(),
            task.stats.avg_latency_ns(),
        );
    }
    for buffer in desc.buffers {
        let available = (buffer.available)();
        eprintln!(
            "[stats] shared buffer '{}': {} tokens ({}B)",
            buffer.name,
            available,
            available * buffer.elem_size
        );
    }
    eprintln!(
        "[stats] memory pool: {}B allocated, {}B used",
        desc.mem_allocated, desc.mem_used
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    // One static program fixture per test to keep runs independent.
    macro_rules! program_state {
        () => {{
            static STOP: AtomicBool = AtomicBool::new(false);
            static EXIT: AtomicI32 = AtomicI32::new(0);
            static START: AtomicBool = AtomicBool::new(false);
            static STATS: AtomicBool = AtomicBool::new(false);
            static PROBE_OUT: Mutex<Option<File>> = Mutex::new(None);
            RuntimeState {
                stop: &STOP,
                exit_code: &EXIT,
                start: &START,
                stats: &STATS,
                probe_output: &PROBE_OUT,
            }
        }};
    }

    fn desc_with_state(state: RuntimeState) -> ProgramDesc {
        ProgramDesc {
            state,
            params: &[],
            tasks: &[],
            buffers: &[],
            probes: &[],
            overrun_policy: "drop",
            mem_allocated: 0,
            mem_used: 0,
        }
    }

    fn argv(args: &[&str]) -> Vec<String> {
        std::iter::once("prog")
            .chain(args.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn empty_program_with_zero_duration_exits_clean() {
        let desc = desc_with_state(program_state!());
        assert_eq!(shell_main_from(argv(&["--duration", "0"]), &desc), 0);
        assert!(desc.state.start.load(Ordering::Acquire));
        assert!(desc.state.stop.load(Ordering::Acquire));
    }

    #[test]
    fn bad_flag_is_exit_2() {
        let desc = desc_with_state(program_state!());
        assert_eq!(shell_main_from(argv(&["--nope"]), &desc), 2);
    }

    #[test]
    fn bad_duration_is_exit_2() {
        let desc = desc_with_state(program_state!());
        assert_eq!(shell_main_from(argv(&["--duration", "5h"]), &desc), 2);
    }

    #[test]
    fn zero_threads_is_exit_2() {
        let desc = desc_with_state(program_state!());
        assert_eq!(shell_main_from(argv(&["--threads", "0"]), &desc), 2);
    }

    #[test]
    fn param_without_table_is_exit_2() {
        let desc = desc_with_state(program_state!());
        assert_eq!(
            shell_main_from(argv(&["--param", "gain=1", "--duration", "0"]), &desc),
            2
        );
    }

    #[test]
    fn malformed_param_is_exit_2() {
        static APPLIED: AtomicBool = AtomicBool::new(false);
        fn apply_gain(_v: &str) -> bool {
            APPLIED.store(true, Ordering::Release);
            true
        }
        let mut desc = desc_with_state(program_state!());
        static PARAMS: &[ParamDesc] = &[ParamDesc {
            name: "gain",
            apply: apply_gain,
        }];
        desc.params = PARAMS;

        assert_eq!(
            shell_main_from(argv(&["--param", "gain", "--duration", "0"]), &desc),
            2
        );
        assert!(!APPLIED.load(Ordering::Acquire));
    }

    #[test]
    fn params_apply_and_unknown_rejects() {
        static VALUE: AtomicU64 = AtomicU64::new(0);
        fn apply_freq(v: &str) -> bool {
            match v.parse::<u64>() {
                Ok(parsed) => {
                    VALUE.store(parsed, Ordering::Release);
                    true
                }
                Err(_) => false,
            }
        }
        static PARAMS: &[ParamDesc] = &[ParamDesc {
            name: "freq",
            apply: apply_freq,
        }];

        let mut desc = desc_with_state(program_state!());
        desc.params = PARAMS;
        assert_eq!(
            shell_main_from(argv(&["--param", "freq=440", "--duration", "0"]), &desc),
            0
        );
        assert_eq!(VALUE.load(Ordering::Acquire), 440);

        assert_eq!(
            shell_main_from(argv(&["--param", "freq=abc", "--duration", "0"]), &desc),
            2
        );
        assert_eq!(
            shell_main_from(argv(&["--param", "nope=1", "--duration", "0"]), &desc),
            2
        );
    }

    #[test]
    fn unknown_probe_is_exit_2_when_probes_compiled_in() {
        static TAPS: AtomicBool = AtomicBool::new(false);
        static PROBES: &[ProbeDesc] = &[ProbeDesc {
            name: "taps",
            enabled: &TAPS,
        }];
        let mut desc = desc_with_state(program_state!());
        desc.probes = PROBES;

        assert_eq!(
            shell_main_from(argv(&["--probe", "bogus", "--duration", "0"]), &desc),
            2
        );
        assert_eq!(
            shell_main_from(argv(&["--probe", "taps", "--duration", "0"]), &desc),
            0
        );
        assert!(TAPS.load(Ordering::Acquire));
    }

    #[test]
    fn probe_flags_ignored_without_probe_table() {
        let desc = desc_with_state(program_state!());
        assert_eq!(
            shell_main_from(argv(&["--probe", "whatever", "--duration", "0"]), &desc),
            0
        );
    }

    #[test]
    fn tasks_run_until_stop_and_exit_code_propagates() {
        static STOP: AtomicBool = AtomicBool::new(false);
        static EXIT: AtomicI32 = AtomicI32::new(0);
        static START: AtomicBool = AtomicBool::new(false);
        static STATS: AtomicBool = AtomicBool::new(false);
        static PROBE_OUT: Mutex<Option<File>> = Mutex::new(None);
        static TASK_STATS: TaskStats = TaskStats::new();
        static FIRINGS: AtomicU64 = AtomicU64::new(0);

        fn worker() {
            while !STOP.load(Ordering::Acquire) {
                FIRINGS.fetch_add(1, Ordering::Relaxed);
                TASK_STATS.record_tick(Duration::from_nanos(100));
                std::thread::sleep(Duration::from_millis(1));
            }
            EXIT.store(7, Ordering::Release);
        }

        static TASKS: &[TaskDesc] = &[TaskDesc {
            name: "worker",
            entry: worker,
            stats: &TASK_STATS,
        }];

        let desc = ProgramDesc {
            state: RuntimeState {
                stop: &STOP,
                exit_code: &EXIT,
                start: &START,
                stats: &STATS,
                probe_output: &PROBE_OUT,
            },
            params: &[],
            tasks: TASKS,
            buffers: &[],
            probes: &[],
            overrun_policy: "slip",
            mem_allocated: 1024,
            mem_used: 512,
        };

        let code = shell_main_from(argv(&["--duration", "0.05s", "--stats"]), &desc);
        assert_eq!(code, 7);
        assert!(FIRINGS.load(Ordering::Relaxed) > 0);
        assert!(TASK_STATS.ticks() > 0);
    }
}
