// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 rill developers

//! rill-scope — headless live-stream monitor.
//!
//! Attaches to running pipelines from outside and periodically reports
//! per-channel integrity statistics plus a short sample preview. Two
//! source kinds, freely mixed:
//!
//!   - `--listen` binds a PPKT datagram endpoint and reassembles frames
//!     for every channel that shows up.
//!   - `--shm NAME` (repeatable) taps a PSHM ring directly.
//!
//! ```text
//! rill-scope --listen 0.0.0.0:9100 --shm rx.iq --interval 2
//! ```

use clap::Parser;
use rill::receiver::{shm_chan_id, ChannelSnapshot, PpktReceiver, ShmReceiver};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Parser, Debug)]
#[command(name = "rill-scope", about = "Headless live-stream monitor for rill pipelines")]
struct Args {
    /// PPKT listen address (`host:port` or `unix:///path`)
    #[arg(long, value_name = "ADDR")]
    listen: Option<String>,

    /// Attach to a PSHM ring by name (repeatable)
    #[arg(long = "shm", value_name = "NAME")]
    shm: Vec<String>,

    /// Seconds between reports
    #[arg(long, default_value_t = 1.0, value_name = "SECS")]
    interval: f64,

    /// Exit after this many seconds (default: run until interrupted)
    #[arg(long, value_name = "SECS")]
    duration: Option<f64>,

    /// Preview sample count per channel
    #[arg(long, default_value_t = 8, value_name = "N")]
    samples: usize,

    /// Per-channel sample store capacity
    #[arg(long, default_value_t = 1_000_000, value_name = "N")]
    capacity: usize,
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    if args.listen.is_none() && args.shm.is_empty() {
        eprintln!("rill-scope: nothing to monitor (pass --listen and/or --shm)");
        std::process::exit(2);
    }

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = Arc::clone(&stop);
        if let Err(e) = ctrlc::set_handler(move || stop.store(true, Ordering::Release)) {
            log::warn!("[SCOPE] could not install interrupt handler: {e}");
        }
    }

    let mut ppkt = None;
    if let Some(addr) = &args.listen {
        let mut receiver = PpktReceiver::with_capacity(args.capacity);
        if let Err(e) = receiver.start(addr) {
            eprintln!("rill-scope: failed to listen on '{addr}': {e}");
            std::process::exit(2);
        }
        log::info!("[SCOPE] listening for PPKT on {addr}");
        ppkt = Some(receiver);
    }

    let mut shm_receivers = Vec::new();
    for (salt, name) in args.shm.iter().enumerate() {
        let mut receiver = ShmReceiver::with_capacity(name, shm_chan_id(name, salt as u16), args.capacity);
        match receiver.start() {
            Ok(()) => {
                log::info!("[SCOPE] attached to shm ring '{name}'");
                shm_receivers.push(receiver);
            }
            Err(e) => {
                eprintln!("rill-scope: failed to attach shm ring '{name}': {e}");
                std::process::exit(2);
            }
        }
    }

    let deadline = args
        .duration
        .map(|secs| Instant::now() + Duration::from_secs_f64(secs.max(0.0)));
    let interval = Duration::from_secs_f64(args.interval.max(0.05));

    let mut snapshots: Vec<ChannelSnapshot> = Vec::new();
    let mut shm_snapshot = ChannelSnapshot::default();

    while !stop.load(Ordering::Acquire) {
        if deadline.is_some_and(|d| Instant::now() >= d) {
            break;
        }
        std::thread::sleep(interval);

        if let Some(receiver) = &ppkt {
            receiver.snapshot_into(&mut snapshots, args.samples);
            let metrics = receiver.metrics();
            for snap in &snapshots {
                report(snap, args.samples);
            }
            log::debug!(
                "[SCOPE] ppkt totals: packets={} bytes={}",
                metrics.recv_packets,
                metrics.recv_bytes
            );
        }
        for receiver in &shm_receivers {
            receiver.snapshot_into(&mut shm_snapshot, args.samples);
            report(&shm_snapshot, args.samples);
        }
    }

    // Orderly teardown so counters flush before exit.
    if let Some(mut receiver) = ppkt {
        receiver.stop();
    }
    for receiver in &mut shm_receivers {
        receiver.stop();
    }
}

fn report(snap: &ChannelSnapshot, max_samples: usize) {
    let label = if snap.label.is_empty() {
        format!("ch {}", snap.chan_id)
    } else {
        snap.label.clone()
    };
    let stats = &snap.stats;
    let preview: Vec<String> = snap
        .samples
        .iter()
        .rev()
        .take(max_samples)
        .rev()
        .map(|v| format!("{v:.4}"))
        .collect();
    println!(
        "{label}: rate={}Hz packets={} frames={} dropped={} (seq={} iter={} boundary={} meta={} gaps={}) tail=[{}]",
        snap.sample_rate_hz,
        snap.packet_count,
        stats.accepted_frames,
        stats.dropped_frames,
        stats.drop_seq_gap,
        stats.drop_iter_gap,
        stats.drop_boundary,
        stats.drop_meta_mismatch,
        stats.inter_frame_gaps,
        preview.join(", ")
    );
}
