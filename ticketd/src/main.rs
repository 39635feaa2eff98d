// SPDX-License-Identifier: MIT
// ticketd: soak daemon for the ticket repository
//
// - Producer threads add tickets, then complete, fail or abandon them.
// - Completed and failed tickets are checked by their producer, abandoned
//   ones are left to the expiry sweep.
// - The repository status is logged periodically until the run ends.
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use clap::{Parser, ValueEnum};
use log::{debug, info, warn};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use ticketd::config::TicketRepositoryConfig;
use ticketd::ticket::{close_with, Ticket, TicketRepository};

const MAX_WORKERS: usize = 1024;

/// What producers do with the tickets they add.
#[derive(Debug, Copy, Clone, PartialEq, Eq, ValueEnum, Default)]
#[clap(rename_all = "kebab-case")]
enum Outcome {
    #[default]
    /// Default: mostly complete, every tenth fails, every tenth is abandoned
    Mixed,
    /// Complete every ticket
    Complete,
    /// Fail every ticket
    Fail,
    /// Never check a ticket; the sweep closes them on timeout
    Abandon,
}

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Ticket repository configuration (JSON)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Number of storage workers, 0 closes expired tickets on the sweep thread
    #[arg(long)]
    workers: Option<usize>,

    /// Pause between two sweeps
    #[arg(long = "delay-ms", value_name = "MS")]
    delay_ms: Option<u64>,

    /// Timeout of tickets that are never completed
    #[arg(long = "timeout-ms", value_name = "MS")]
    timeout_ms: Option<u64>,

    /// Grace period of completed or failed tickets
    #[arg(long = "after-completion-ms", value_name = "MS")]
    after_completion_ms: Option<u64>,

    /// Number of producer threads
    #[arg(long, default_value_t = 4)]
    producers: usize,

    /// Tickets added by each producer
    #[arg(long, default_value_t = 1000)]
    tickets: usize,

    #[arg(long, value_enum, default_value_t)]
    outcome: Outcome,

    /// Stop after this many seconds, even if producers are not done
    #[arg(long = "run-for-secs", default_value_t = 30)]
    run_for_secs: u64,

    #[arg(long = "status-interval-ms", value_name = "MS", default_value_t = 1000)]
    status_interval_ms: u64,
}

fn validate_args(args: &Args) -> Result<(), String> {
    if args.producers == 0 {
        return Err("--producers must be at least 1".into());
    }
    if args.run_for_secs == 0 {
        return Err("--run-for-secs must be at least 1".into());
    }
    if args.status_interval_ms == 0 {
        return Err("--status-interval-ms must be at least 1".into());
    }
    if let Some(workers) = args.workers {
        if workers > MAX_WORKERS {
            return Err(format!("--workers must not exceed {}", MAX_WORKERS));
        }
    }
    Ok(())
}

fn build_config(args: &Args) -> anyhow::Result<TicketRepositoryConfig> {
    let mut config = match &args.config {
        Some(path) => TicketRepositoryConfig::load(path)?,
        None => TicketRepositoryConfig::default(),
    };
    if let Some(workers) = args.workers {
        config.repository.workers = workers;
    }
    if let Some(delay_ms) = args.delay_ms {
        config.repository.delay_ms = delay_ms;
    }
    if let Some(timeout_ms) = args.timeout_ms {
        config.default_timeout_ms = timeout_ms;
    }
    if let Some(after_completion_ms) = args.after_completion_ms {
        config.timeout_after_completion_ms = after_completion_ms;
    }
    Ok(config)
}

#[derive(Debug, Default)]
struct Stats {
    added: AtomicUsize,
    checked: AtomicUsize,
    failed: AtomicUsize,
    abandoned: AtomicUsize,
    released: AtomicUsize,
}

impl Stats {
    fn summary(&self) -> String {
        format!(
            "added={},checked={},failed={},abandoned={},released={}",
            self.added.load(Ordering::SeqCst),
            self.checked.load(Ordering::SeqCst),
            self.failed.load(Ordering::SeqCst),
            self.abandoned.load(Ordering::SeqCst),
            self.released.load(Ordering::SeqCst)
        )
    }
}

fn outcome_of(outcome: Outcome, n: usize) -> Outcome {
    match outcome {
        Outcome::Mixed => match n % 10 {
            0 => Outcome::Fail,
            1 => Outcome::Abandon,
            _ => Outcome::Complete,
        },
        other => other,
    }
}

fn produce(
    producer: usize,
    repo: &TicketRepository,
    stats: &Arc<Stats>,
    stop: &AtomicBool,
    tickets: usize,
    outcome: Outcome,
) {
    for n in 0..tickets {
        if stop.load(Ordering::SeqCst) {
            break;
        }
        let ticket = repo.add(Ticket::described(format!("producer {producer} ticket {n}")));
        stats.added.fetch_add(1, Ordering::SeqCst);
        let id = ticket.id();
        let released = stats.clone();
        ticket.to_close(close_with(format!("buffer of ticket {id}"), move || {
            released.released.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));
        match outcome_of(outcome, n) {
            Outcome::Abandon => {
                stats.abandoned.fetch_add(1, Ordering::SeqCst);
                continue;
            }
            Outcome::Fail => ticket.set_error(format!("producer {producer} gave up on ticket {n}")),
            _ => ticket.completed(),
        }
        match repo.check(id, Duration::from_secs(1)) {
            Ok(_) => {
                stats.checked.fetch_add(1, Ordering::SeqCst);
            }
            Err(e) => {
                debug!("Ticket {} failed: {e}", e.id());
                stats.failed.fetch_add(1, Ordering::SeqCst);
            }
        }
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    if let Err(e) = validate_args(&args) {
        eprintln!("Error: {e}");
        std::process::exit(2);
    }

    let config = build_config(&args)?;
    let repo = Arc::new(TicketRepository::new("tickets", &config));
    repo.start()?;
    info!("Starting ticketd ({} producer(s), {:?})", args.producers, args.outcome);

    let stats = Arc::new(Stats::default());
    let stop = Arc::new(AtomicBool::new(false));
    let mut producers: Vec<JoinHandle<()>> = Vec::with_capacity(args.producers);
    for producer in 0..args.producers {
        let repo = repo.clone();
        let stats = stats.clone();
        let stop = stop.clone();
        let (tickets, outcome) = (args.tickets, args.outcome);
        producers.push(
            thread::Builder::new()
                .name(format!("producer-{producer}"))
                .spawn(move || produce(producer, &repo, &stats, &stop, tickets, outcome))?,
        );
    }

    let started = Instant::now();
    let run_for = Duration::from_secs(args.run_for_secs);
    let interval = Duration::from_millis(args.status_interval_ms);
    while started.elapsed() < run_for {
        thread::sleep(interval.min(run_for.saturating_sub(started.elapsed())));
        info!("{} | {}", repo, stats.summary());
        debug!("{}", repo.storage().monitor_status());
        if producers.iter().all(|p| p.is_finished()) && repo.size() == 0 {
            break;
        }
    }

    info!("Stopping ticketd");
    stop.store(true, Ordering::SeqCst);
    for producer in producers {
        if producer.join().is_err() {
            warn!("A producer terminated with a panic");
        }
    }
    repo.shutdown();
    info!("{} | {}", repo, stats.summary());
    Ok(())
}
