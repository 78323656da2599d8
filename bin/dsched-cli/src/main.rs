//! dsched CLI - Disk I/O scheduler command line interface
//!
//! Runs the scheduling framework in-process against in-memory disks: list
//! the registered policies, attach disks and show the policy each one is
//! bound to, switch policies, and push a synthetic workload through a
//! policy to see how it shares a disk between weighted threads.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use dsched_bfq::BfqPolicy;
use dsched_common::{BioStatus, Config, IoOwner, ThreadId};
use dsched_core::{Bio, Disk, DiskBinding, DiskInfo, Dsched, DschedStatsSnapshot, Issuer, QueueDevice};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const SIM_DISK: &str = "sim0";

#[derive(Parser, Debug)]
#[command(name = "dsched-cli")]
#[command(about = "Disk I/O scheduler CLI")]
#[command(version)]
struct Args {
    /// Configuration file (toml)
    #[arg(short, long, env = "DSCHED_CONFIG")]
    config: Option<PathBuf>,

    /// Log level
    #[arg(long, default_value = "warn")]
    log_level: String,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,

    /// Print results as JSON
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List registered policies
    Policies,
    /// Attach disks and show the policy each one is bound to
    Disks {
        /// Disk names to attach
        #[arg(short, long = "disk", default_value = "da0")]
        disks: Vec<String>,
    },
    /// Attach a disk and switch it to another policy
    Switch {
        /// Disk name
        disk: String,
        /// Policy to switch to
        policy: String,
    },
    /// Run a synthetic workload through a policy
    Simulate {
        /// Policy to schedule with
        #[arg(short, long, default_value = "bfq")]
        policy: String,
        /// I/O weight of each simulated thread
        #[arg(short, long, value_delimiter = ',', default_value = "1,2,4")]
        weights: Vec<u32>,
        /// Bios issued per thread
        #[arg(long, default_value_t = 64)]
        ios: u64,
        /// Bio size in bytes
        #[arg(long, default_value_t = 4096)]
        size: u64,
        /// Tag queue depth of the simulated disk
        #[arg(long, default_value_t = 1)]
        depth: u32,
        /// Random offsets instead of sequential streams
        #[arg(long)]
        random: bool,
        /// Seed for random offsets
        #[arg(long, default_value_t = 1)]
        seed: u64,
    },
}

#[derive(Debug)]
struct Workload {
    policy: String,
    weights: Vec<u32>,
    ios: u64,
    size: u64,
    depth: u32,
    random: bool,
    seed: u64,
}

#[derive(Debug, Serialize)]
struct ThreadReport {
    thread: u64,
    weight: u32,
    dispatched: u64,
    /// Dispatches while every thread still had bios queued
    contended: u64,
    /// Share of the contended window in 1/1000
    share_permille: u64,
}

#[derive(Debug, Serialize)]
struct SimReport {
    policy: String,
    bios: u64,
    contended_window: u64,
    elapsed_ms: u128,
    threads: Vec<ThreadReport>,
    counters: BTreeMap<String, u64>,
    stats: DschedStatsSnapshot,
}

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with(args.log_json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!args.log_json).then(tracing_subscriber::fmt::layer))
        .init();

    let config = match &args.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => Config::default(),
    };
    let dsched = build(&config)?;
    debug!(policies = dsched.registry().len(), "framework ready");

    match args.command {
        Commands::Policies => {
            let policies = dsched.policies();
            if args.json {
                return print_json(&policies);
            }
            println!("{:<6} {:<16} {:<6} {:<8}", "ID", "NAME", "REFS", "DISKS");
            println!("{}", "-".repeat(40));
            for policy in policies {
                println!(
                    "{:<6} {:<16} {:<6} {:<8}",
                    policy.id, policy.name, policy.ref_count, policy.bindings
                );
            }
        }
        Commands::Disks { disks } => {
            for name in &disks {
                attach(&dsched, name, None, None)?;
            }
            let disks = dsched.disks();
            if args.json {
                return print_json(&disks);
            }
            print_disks(&disks);
        }
        Commands::Switch { disk, policy } => {
            let (_, binding) = attach(&dsched, &disk, None, None)?;
            let from = binding.policy_name().unwrap_or_default();
            dsched
                .switch(&disk, &policy)
                .with_context(|| format!("switching {disk} to {policy}"))?;
            info!(disk = %disk, from = %from, to = %policy, "switched");
            if args.json {
                return print_json(&dsched.disks());
            }
            println!("{disk}: {from} -> {policy}");
        }
        Commands::Simulate {
            policy,
            weights,
            ios,
            size,
            depth,
            random,
            seed,
        } => {
            let workload = Workload {
                policy,
                weights,
                ios,
                size,
                depth,
                random,
                seed,
            };
            let report = simulate(&dsched, &workload)?;
            if args.json {
                return print_json(&report);
            }
            print_report(&report);
        }
    }

    Ok(())
}

/// Framework with every built-in policy registered
fn build(config: &Config) -> Result<Dsched> {
    let dsched = Dsched::from_config(config)?;
    dsched.register(Arc::new(BfqPolicy::new(config.bfq.clone())))?;
    Ok(dsched)
}

fn attach(
    dsched: &Dsched,
    name: &str,
    policy: Option<&str>,
    depth: Option<u32>,
) -> Result<(Arc<QueueDevice>, Arc<DiskBinding>)> {
    let device = Arc::new(QueueDevice::new());
    let mut disk = Disk::new(name, device.clone());
    if let Some(depth) = depth {
        disk = disk.with_max_tag_queue_depth(depth);
    }
    let binding = dsched
        .disk_create(disk, policy)
        .with_context(|| format!("attaching disk {name}"))?;
    Ok((device, binding))
}

fn simulate(dsched: &Dsched, workload: &Workload) -> Result<SimReport> {
    if workload.weights.is_empty() {
        bail!("at least one thread weight is required");
    }
    let (device, binding) = attach(dsched, SIM_DISK, Some(&workload.policy), Some(workload.depth))?;

    let threads: Vec<(ThreadId, u32)> = (1..)
        .map(ThreadId)
        .zip(workload.weights.iter().copied())
        .collect();
    for &(tid, weight) in &threads {
        dsched.new_thread(tid).set_io_weight(weight)?;
    }

    let start = Instant::now();
    let mut rng = StdRng::seed_from_u64(workload.seed);
    let mut offsets: Vec<u64> = threads.iter().map(|(tid, _)| tid.0 << 32).collect();
    for _ in 0..workload.ios {
        for (&(tid, _), offset) in threads.iter().zip(offsets.iter_mut()) {
            let at = if workload.random {
                rng.gen_range(0..1u64 << 40) & !511
            } else {
                *offset
            };
            *offset += workload.size;

            let mut bio = Bio::read(at, workload.size);
            dsched.new_buf(&mut bio, Issuer::kernel_thread(tid));
            if let Err(rejected) = dsched.queue(SIM_DISK, bio) {
                let (err, bio) = rejected.into_parts();
                bio.cancel();
                return Err(err).context("queueing simulated bio");
            }
        }
    }

    // Anticipation may leave the device idle for a while with bios held
    let deadline = Instant::now() + Duration::from_secs(30);
    loop {
        device.complete_all(BioStatus::Success);
        if binding.queued() == 0 && device.pending() == 0 {
            break;
        }
        if Instant::now() > deadline {
            bail!("simulation stalled with {} bios queued", binding.queued());
        }
        thread::sleep(Duration::from_millis(1));
    }
    let elapsed_ms = start.elapsed().as_millis();

    let counters = binding
        .counters()
        .into_iter()
        .map(|(name, value)| (name.to_string(), value))
        .collect();
    let report = tally(workload, &threads, &device, counters, dsched.stats(), elapsed_ms);
    dsched.disk_destroy(SIM_DISK)?;
    Ok(report)
}

fn tally(
    workload: &Workload,
    threads: &[(ThreadId, u32)],
    device: &QueueDevice,
    counters: BTreeMap<String, u64>,
    stats: DschedStatsSnapshot,
    elapsed_ms: u128,
) -> SimReport {
    let records = device.dispatched();
    let index = |owner: Option<IoOwner>| {
        threads
            .iter()
            .position(|(tid, _)| owner == Some(IoOwner::Thread(*tid)))
    };

    let mut dispatched = vec![0u64; threads.len()];
    let mut contended = vec![0u64; threads.len()];
    let mut window = 0u64;
    let mut open = true;
    for record in &records {
        let Some(i) = index(record.owner) else {
            continue;
        };
        dispatched[i] += 1;
        if open {
            contended[i] += 1;
            window += 1;
            // The window closes once some thread has nothing left to issue
            open = dispatched[i] < workload.ios;
        }
    }

    let threads = threads
        .iter()
        .enumerate()
        .map(|(i, &(tid, weight))| ThreadReport {
            thread: tid.0,
            weight,
            dispatched: dispatched[i],
            contended: contended[i],
            share_permille: if window == 0 { 0 } else { contended[i] * 1000 / window },
        })
        .collect();

    SimReport {
        policy: workload.policy.clone(),
        bios: records.len().try_into().unwrap_or(u64::MAX),
        contended_window: window,
        elapsed_ms,
        threads,
        counters,
        stats,
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_disks(disks: &[DiskInfo]) {
    println!(
        "{:<16} {:<10} {:<6} {:<8} {:<8} {:<16}",
        "DISK", "POLICY", "GEN", "QUEUED", "INFLIGHT", "SERIAL"
    );
    println!("{}", "-".repeat(70));
    for disk in disks {
        println!(
            "{:<16} {:<10} {:<6} {:<8} {:<8} {:<16}",
            disk.name,
            disk.policy.as_deref().unwrap_or("-"),
            disk.generation.map_or_else(|| "-".to_string(), |g| g.to_string()),
            disk.queued,
            disk.in_flight,
            disk.serial.as_deref().unwrap_or("-"),
        );
    }
}

fn print_report(report: &SimReport) {
    println!("Simulation: {} ({} bios, {} ms)", report.policy, report.bios, report.elapsed_ms);
    println!("==========");
    println!(
        "{:<8} {:<8} {:<12} {:<12} {:<8}",
        "THREAD", "WEIGHT", "DISPATCHED", "CONTENDED", "SHARE"
    );
    println!("{}", "-".repeat(52));
    for thread in &report.threads {
        println!(
            "{:<8} {:<8} {:<12} {:<12} {}.{}%",
            thread.thread,
            thread.weight,
            thread.dispatched,
            thread.contended,
            thread.share_permille / 10,
            thread.share_permille % 10,
        );
    }
    println!();
    println!("Contended window: {} dispatches", report.contended_window);
    for (name, value) in &report.counters {
        println!("{name:<20} {value}");
    }
    println!("{:<20} {}", "raw_dispatches", report.stats.raw_dispatches);
    println!("{:<20} {}", "policy_queued", report.stats.policy_queued);
    println!("{:<20} {}", "tdio_allocations", report.stats.tdio_allocations);
}
