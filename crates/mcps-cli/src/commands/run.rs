//! Run command implementation.
//!
//! Builds a threaded runtime from the configuration and pushes synthetic
//! TCP flows through it, one in-sequence stream per flow, arriving
//! round-robin on every CPU.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use clap::Args;
use mcps_core::{
    CountingSink, CpuMask, Engine, EngineSnapshot, FlowSelect, McpsConfig, Packet, Runtime, Verdict,
};
use serde::Serialize;

use super::OutputFormat;

const ETH_HLEN: usize = 14;

/// Arguments for the run command.
#[derive(Args)]
pub struct RunArgs {
    /// Number of concurrent flows
    #[arg(short, long, default_value = "64")]
    pub flows: u16,

    /// Total packets to submit
    #[arg(short, long, default_value = "100000")]
    pub packets: u64,

    /// TCP payload bytes per packet
    #[arg(long, default_value = "512")]
    pub segment: usize,

    /// Aggregate flows steered to the receiving CPU in place
    #[arg(long)]
    pub direct_gro: bool,

    /// Take this CPU offline halfway through
    #[arg(long)]
    pub teardown: Option<usize>,

    /// Move flows halfway through: "<from> <to> <option>", option 0 all,
    /// 1 heaviest, 2 lightest
    #[arg(long = "move", value_name = "REQUEST")]
    pub move_request: Option<String>,

    /// Seconds to wait for the queues to drain
    #[arg(long, default_value = "30")]
    pub timeout: u64,
}

#[derive(Serialize)]
struct RunSummary {
    submitted: u64,
    accepted: u64,
    dropped: u64,
    bypassed: u64,
    delivered_packets: u64,
    delivered_segments: u64,
    elapsed_ms: u128,
    #[serde(skip_serializing_if = "Option::is_none")]
    teardown: Option<mcps_core::HotplugRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    flows_moved: Option<usize>,
    heavy_flows: String,
    light_flows: String,
    snapshot: EngineSnapshot,
}

/// Executes the run command.
pub fn execute(args: RunArgs, mut config: McpsConfig, format: OutputFormat) -> Result<()> {
    if args.flows == 0 {
        bail!("--flows must be at least 1");
    }
    let policies = &config.policies;
    if policies.static_mask.is_none() && policies.dynamic.is_none() && policies.newflow.is_none() {
        let all = CpuMask::first_n(config.nr_cpus).to_hex(config.nr_cpus);
        tracing::info!(mask = %all, "no policy configured, steering across every cpu");
        config.policies.static_mask = Some(all);
    }

    let nr_cpus = config.nr_cpus;
    let sink = Arc::new(CountingSink::new(nr_cpus));
    let runtime = Runtime::start(
        Engine::builder(config)
            .sink(sink.clone())
            .direct_gro(args.direct_gro),
    )?;

    let payload = vec![0xa5u8; args.segment];
    let mut seqs = vec![0u32; usize::from(args.flows)];
    let (mut accepted, mut dropped, mut bypassed) = (0u64, 0u64, 0u64);
    let mut teardown = None;
    let mut flows_moved = None;
    let start = Instant::now();

    for i in 0..args.packets {
        let flow = (i % u64::from(args.flows)) as u16;
        let seq = &mut seqs[usize::from(flow)];
        let frame = tcp_frame(10_000 + flow, 80, *seq, &payload);
        *seq = seq.wrapping_add(payload.len() as u32);

        let local = (i % nr_cpus as u64) as usize;
        match runtime.submit(local, Packet::parse(frame.as_slice(), 0)) {
            Verdict::Dropped(_) => dropped += 1,
            Verdict::Bypassed(_) => bypassed += 1,
            Verdict::Enqueued { .. } | Verdict::Pending => accepted += 1,
        }

        if i == args.packets / 2 {
            if let Some(cpu) = args.teardown {
                teardown = Some(runtime.engine().cpu_teardown(cpu)?);
            }
            if let Some(request) = &args.move_request {
                flows_moved = Some(runtime.engine().move_command(request)?);
            }
        }
    }

    if !runtime.quiesce(Duration::from_secs(args.timeout)) {
        tracing::warn!("queues did not drain within {}s", args.timeout);
    }
    let elapsed = start.elapsed();

    let summary = RunSummary {
        submitted: args.packets,
        accepted,
        dropped,
        bypassed,
        delivered_packets: (0..nr_cpus).map(|cpu| sink.packets(cpu)).sum(),
        delivered_segments: sink.total_segments(),
        elapsed_ms: elapsed.as_millis(),
        teardown,
        flows_moved,
        heavy_flows: runtime.engine().flow_report(FlowSelect::Heaviest).trim_end().to_string(),
        light_flows: runtime.engine().flow_report(FlowSelect::Lightest).trim_end().to_string(),
        snapshot: runtime.engine().snapshot(),
    };
    runtime.shutdown();

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&summary)?),
        OutputFormat::Table => print_table(&summary, &sink),
    }
    Ok(())
}

fn print_table(summary: &RunSummary, sink: &CountingSink) {
    println!(
        "{:<4} {:<10} {:>10} {:>10} {:>8} {:>8} {:>10} {:>10} {:>10} {:>10}",
        "CPU",
        "STATE",
        "ENQUEUED",
        "PROCESSED",
        "DROPPED",
        "IGNORED",
        "GRO",
        "DIST",
        "DELIVERED",
        "SEGMENTS"
    );
    for cpu in &summary.snapshot.cpus {
        let state = match cpu.state {
            mcps_core::CpuState::Online => "online".to_string(),
            mcps_core::CpuState::Draining => "draining".to_string(),
            mcps_core::CpuState::Offline { substitute } => format!("off->{substitute}"),
        };
        let c = &cpu.counters;
        println!(
            "{:<4} {:<10} {:>10} {:>10} {:>8} {:>8} {:>10} {:>10} {:>10} {:>10}",
            cpu.cpu,
            state,
            c.enqueued,
            c.processed,
            c.dropped,
            c.ignored,
            c.gro_processed,
            c.distributed,
            sink.packets(cpu.cpu),
            sink.segments(cpu.cpu),
        );
    }
    println!();
    println!(
        "submitted {} accepted {} dropped {} bypassed {} in {} ms",
        summary.submitted, summary.accepted, summary.dropped, summary.bypassed, summary.elapsed_ms
    );
    println!(
        "delivered {} packets carrying {} segments",
        summary.delivered_packets, summary.delivered_segments
    );
    if let Some(record) = &summary.teardown {
        println!(
            "cpu {} torn down: {} migrated, {} parked to cpu {} ({} parked overall)",
            record.departed,
            record.migrated,
            record.parked,
            record.substitute,
            summary.snapshot.engine.parked
        );
    }
    if let Some(moved) = summary.flows_moved {
        println!("{moved} flows moved");
    }
    println!("heaviest flow per cpu: {}", summary.heavy_flows);
    println!("lightest flow per cpu: {}", summary.light_flows);
}

/// Ethernet/IPv4/TCP frame, ACK set.
fn tcp_frame(src_port: u16, dst_port: u16, seq: u32, payload: &[u8]) -> Vec<u8> {
    let mut frame = vec![0u8; ETH_HLEN + 40];
    frame[0..6].copy_from_slice(&[0x02, 0, 0, 0, 0, 1]);
    frame[6..12].copy_from_slice(&[0x02, 0, 0, 0, 0, 2]);
    frame[12..14].copy_from_slice(&0x0800u16.to_be_bytes());

    let ip = ETH_HLEN;
    frame[ip] = 0x45;
    frame[ip + 9] = 6;
    frame[ip + 12..ip + 16].copy_from_slice(&[192, 168, 0, 1]);
    frame[ip + 16..ip + 20].copy_from_slice(&[192, 168, 0, 2]);

    let tcp = ip + 20;
    frame[tcp..tcp + 2].copy_from_slice(&src_port.to_be_bytes());
    frame[tcp + 2..tcp + 4].copy_from_slice(&dst_port.to_be_bytes());
    frame[tcp + 4..tcp + 8].copy_from_slice(&seq.to_be_bytes());
    frame[tcp + 12] = 5 << 4;
    frame[tcp + 13] = 0x10;
    frame.extend_from_slice(payload);
    frame
}
