// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use futures::executor::block_on;
use futures::future::join_all;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use ticketd::config::{RepositoryConfig, TicketRepositoryConfig};
use ticketd::repository::{ExpireWhen, Immediately, StorageRepository};
use ticketd::ticket::{close_with, ChannelListener, Ticket, TicketRepository};
use ticketd_tests::harness::{init_logging, tallying_updater, wait_until, Tally};

#[derive(Debug, Clone, PartialEq)]
struct Job {
    id: usize,
    created: Instant,
}

fn job(id: usize) -> Job {
    Job {
        id,
        created: Instant::now(),
    }
}

fn job_key(job: &Job) -> String {
    format!("job-{:05}", job.id)
}

fn fast_config() -> RepositoryConfig {
    RepositoryConfig {
        delay_ms: 20,
        minimum_wait_ms: 1,
        worker_idle_ms: 10,
        put_backoff_ms: 2,
        shutdown_timeout_ms: 5000,
        ..RepositoryConfig::default()
    }
}

#[test]
fn end_to_end_ticket_scenario() {
    init_logging();
    let config = TicketRepositoryConfig {
        repository: RepositoryConfig {
            workers: 2,
            delay_ms: 50,
            ..fast_config()
        },
        default_timeout_ms: 5000,
        timeout_after_completion_ms: 200,
    };
    let repo = TicketRepository::new("e2e", &config);
    repo.start().unwrap();

    // a worker completes the ticket while its owner is waiting in check
    let released = Arc::new(AtomicUsize::new(0));
    let ticket = repo.add(Ticket::described("transfer"));
    let counter = released.clone();
    ticket.to_close(close_with("stream", move || {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }));
    let worker = ticket.clone();
    let handle = thread::spawn(move || {
        thread::sleep(Duration::from_millis(10));
        worker.completed();
    });
    let start = Instant::now();
    let checked = repo.check(ticket.id(), Duration::from_secs(5)).unwrap();
    let elapsed = start.elapsed();
    handle.join().unwrap();
    assert_eq!(checked, Some(ticket.clone()));
    assert!(elapsed >= Duration::from_millis(10), "took {elapsed:?}");
    assert!(elapsed < Duration::from_millis(100), "took {elapsed:?}");
    assert_eq!(released.load(Ordering::SeqCst), 1);

    // the first error is what check raises
    let failing = repo.add(Ticket::described("failing transfer"));
    failing.set_error("boom");
    failing.set_error("not this one");
    let err = repo.check(failing.id(), Duration::from_secs(5)).unwrap_err();
    assert_eq!(err.to_string(), "boom");

    // a completed ticket nobody checks is closed by the sweep after the grace period
    let forgotten = repo.add(Ticket::described("forgotten"));
    forgotten.completed();
    assert!(!forgotten.is_closed());
    assert!(wait_until(Duration::from_secs(3), || forgotten.is_closed()));
    assert_eq!(repo.size(), 0);
    assert_eq!(repo.check(forgotten.id(), Duration::ZERO).unwrap(), None);

    repo.shutdown();
}

#[test]
fn concurrent_producers_respect_capacity_and_never_double_dispatch() {
    init_logging();
    let tally = Tally::new();
    let repo = Arc::new(StorageRepository::new(
        "pool",
        &fast_config().with_workers(4).with_max_authorised_size(16),
        job_key,
        Immediately,
        tallying_updater(tally.clone(), job_key, 1, Duration::from_millis(1)),
    ));
    repo.start().unwrap();

    let producers: Vec<_> = (0..4)
        .map(|p| {
            let repo = repo.clone();
            thread::spawn(move || {
                for i in 0..50 {
                    repo.put(job(p * 1000 + i));
                }
            })
        })
        .collect();
    for producer in producers {
        producer.join().unwrap();
    }

    assert!(wait_until(Duration::from_secs(15), || tally.succeeded() == 200));
    repo.shutdown();

    assert!(!tally.overlapped());
    assert!(tally.each_succeeded_once());
    assert_eq!(tally.total_attempts(), 400);
    assert!(repo.objects().max_recorded_size() <= 16);
    assert_eq!(repo.size(), 0);
    assert_eq!(repo.spool_size(), 0);
}

#[test]
fn put_wakes_an_idle_sweep_within_50ms() {
    init_logging();
    let config = RepositoryConfig {
        // only a wakeup can trigger the sweep in time
        delay_ms: 60 * 60 * 1000,
        idle_interval_ms: 60 * 60 * 1000,
        ..fast_config()
    };
    let tally = Tally::new();
    let repo = StorageRepository::new(
        "wakeup",
        &config,
        job_key,
        Immediately,
        tallying_updater(tally.clone(), job_key, 0, Duration::ZERO),
    );
    repo.start().unwrap();
    assert!(wait_until(Duration::from_secs(1), || repo.scheduler().is_sleeping()));

    for i in 0..3 {
        thread::sleep(Duration::from_millis(20));
        let start = Instant::now();
        repo.put(job(i));
        assert!(wait_until(Duration::from_secs(1), || tally.succeeded() == i + 1));
        let elapsed = start.elapsed();
        assert!(elapsed < Duration::from_millis(50), "sweep took {elapsed:?}");
    }
    repo.shutdown();
}

#[test]
fn failing_update_is_retried_until_the_policy_gives_up() {
    init_logging();
    let tally = Tally::new();
    let repo = StorageRepository::new(
        "retry",
        &fast_config().with_workers(1),
        job_key,
        // retry for 150ms, then leave the job alone
        ExpireWhen::new(|job: &Job| job.created.elapsed() < Duration::from_millis(150)),
        tallying_updater(tally.clone(), job_key, usize::MAX, Duration::ZERO),
    );
    repo.start().unwrap();
    let stuck = job(1);
    let key = job_key(&stuck);
    repo.put(stuck);

    assert!(wait_until(Duration::from_secs(2), || tally.attempts(&key) >= 2));
    thread::sleep(Duration::from_millis(300));
    let settled = tally.attempts(&key);
    thread::sleep(Duration::from_millis(150));
    assert_eq!(tally.attempts(&key), settled);
    assert_eq!(tally.succeeded(), 0);
    // the job stays in the repository once the policy stops expiring it
    assert!(repo.contains_key(&key));
    repo.shutdown();
}

#[test]
fn on_hold_pauses_sweeping() {
    init_logging();
    let tally = Tally::new();
    let repo = StorageRepository::new(
        "hold",
        &fast_config(),
        job_key,
        Immediately,
        tallying_updater(tally.clone(), job_key, 0, Duration::ZERO),
    );
    repo.start().unwrap();
    repo.scheduler().set_on_hold(true);
    assert!(wait_until(Duration::from_secs(1), || repo.monitor_status().starts_with("ONHOLD")));

    repo.put(job(1));
    thread::sleep(Duration::from_millis(100));
    assert_eq!(tally.succeeded(), 0);
    assert_eq!(repo.size(), 1);

    repo.scheduler().set_on_hold(false);
    assert!(wait_until(Duration::from_secs(1), || tally.succeeded() == 1));
    repo.shutdown();
}

#[test]
fn tickets_can_be_awaited_from_an_executor() {
    init_logging();
    let repo = Arc::new(TicketRepository::new("async", &TicketRepositoryConfig::default()));
    let tickets: Vec<_> = (0..5)
        .map(|i| repo.add(Ticket::described(format!("async {i}"))))
        .collect();
    let (listener, abandoned) = ChannelListener::unbounded();
    tickets[4].add_listener(listener);

    let pending = join_all(tickets.iter().map(|t| t.completion()));
    let workers: Vec<_> = tickets[..4]
        .iter()
        .cloned()
        .map(|ticket| {
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(5));
                ticket.completed();
            })
        })
        .collect();
    let owner = {
        let repo = repo.clone();
        let id = tickets[4].id();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(5));
            repo.remove(id);
        })
    };
    block_on(pending);
    for worker in workers {
        worker.join().unwrap();
    }
    owner.join().unwrap();

    assert_eq!(block_on(abandoned.recv()).unwrap(), tickets[4].id());
    assert!(tickets[4].is_closed());
    assert!(tickets[..4].iter().all(|t| t.is_completed()));
    assert_eq!(repo.size(), 4);
}
