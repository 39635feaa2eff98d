use super::*;
use crate::config::RepositoryConfig;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq)]
struct Parcel {
    id: u32,
    label: String,
}

fn parcel(id: u32) -> Parcel {
    Parcel {
        id,
        label: format!("parcel {id}"),
    }
}

fn key(p: &Parcel) -> String {
    format!("{:04}", p.id)
}

fn fast_config() -> RepositoryConfig {
    RepositoryConfig {
        delay_ms: 10,
        minimum_wait_ms: 1,
        worker_idle_ms: 10,
        put_backoff_ms: 5,
        shutdown_timeout_ms: 5000,
        ..RepositoryConfig::default()
    }
}

fn wait_until(timeout: Duration, cond: impl Fn() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    cond()
}

/// Successful updates per parcel id.
fn shared_tally() -> Arc<Mutex<HashMap<u32, usize>>> {
    Arc::new(Mutex::new(HashMap::new()))
}

#[test]
fn keyed_put_get_remove() {
    let repo = KeyedRepository::new("parcels", &fast_config(), key);
    repo.put(parcel(1));
    repo.put(parcel(2));
    assert_eq!(repo.size(), 2);
    assert_eq!(repo.get("0001"), Some(parcel(1)));
    assert!(repo.contains(&parcel(2)));

    // same key replaces
    repo.put(Parcel {
        id: 1,
        label: "relabelled".to_string(),
    });
    assert_eq!(repo.size(), 2);
    assert_eq!(repo.get("0001").unwrap().label, "relabelled");

    assert_eq!(repo.remove(&parcel(2)), Some(parcel(2)));
    assert_eq!(repo.remove_by_key("0002"), None);
    assert!(!repo.contains_key("0002"));

    repo.clear();
    assert!(repo.is_empty());
    assert_eq!(repo.max_recorded_size(), 2);
}

#[test]
fn list_follows_comparator() {
    let repo = KeyedRepository::new("parcels", &fast_config(), key);
    for id in [7, 3, 9, 1] {
        repo.put(parcel(id));
    }
    repo.set_comparator(|a: &Parcel, b: &Parcel| b.id.cmp(&a.id));
    let ids: Vec<u32> = repo.list().iter().map(|p| p.id).collect();
    assert_eq!(ids, vec![9, 7, 3, 1]);

    let ids: Vec<u32> = repo.list_sorted(|a, b| a.id.cmp(&b.id)).iter().map(|p| p.id).collect();
    assert_eq!(ids, vec![1, 3, 7, 9]);
}

#[test]
fn status_renders_one_line_per_object() {
    let repo = KeyedRepository::new("parcels", &fast_config(), key);
    repo.set_comparator(|a: &Parcel, b: &Parcel| a.id.cmp(&b.id));
    repo.put(parcel(2));
    repo.put(parcel(1));
    repo.set_status_renderer(|p: &Parcel| format!(" {} ", p.label));
    assert_eq!(repo.status(), "0001=parcel_1\n0002=parcel_2");
}

#[test]
fn put_blocks_while_at_capacity() {
    let repo = Arc::new(KeyedRepository::new(
        "parcels",
        &fast_config().with_max_authorised_size(2),
        key,
    ));
    repo.put(parcel(1));
    repo.put(parcel(2));

    let done = Arc::new(AtomicBool::new(false));
    let handle = {
        let repo = repo.clone();
        let done = done.clone();
        thread::spawn(move || {
            repo.put(parcel(3));
            done.store(true, Ordering::SeqCst);
        })
    };
    thread::sleep(Duration::from_millis(50));
    assert!(!done.load(Ordering::SeqCst), "put should still be blocked");
    assert_eq!(repo.size(), 2);

    repo.remove_by_key("0001");
    assert!(wait_until(Duration::from_secs(2), || done.load(Ordering::SeqCst)));
    handle.join().unwrap();
    assert!(repo.contains_key("0003"));
    assert!(repo.max_recorded_size() <= 2);
}

#[test]
fn spool_ignores_duplicates() {
    let spool = Spool::new();
    assert!(spool.push_unique(parcel(1)));
    assert!(!spool.push_unique(parcel(1)));
    assert!(spool.push_unique(parcel(2)));
    assert_eq!(spool.len(), 2);
    assert_eq!(spool.pop(), Some(parcel(1)));
    assert_eq!(spool.pop(), Some(parcel(2)));
    assert!(spool.is_empty());
}

#[test]
fn sweep_updates_inline_without_workers() {
    let tally = shared_tally();
    let recorder = tally.clone();
    let repo = StorageRepository::new(
        "inline",
        &fast_config(),
        key,
        Immediately,
        UpdateWith::new(move |p: &Parcel| {
            *recorder.lock().unwrap().entry(p.id).or_default() += 1;
            Ok(())
        }),
    );
    repo.start().unwrap();
    for id in 0..10 {
        repo.put(parcel(id));
    }
    assert!(wait_until(Duration::from_secs(2), || tally.lock().unwrap().len() == 10));
    assert!(wait_until(Duration::from_secs(1), || repo.size() == 0));
    assert_eq!(repo.worker_count(), 0);
    repo.shutdown();
    assert!(tally.lock().unwrap().values().all(|n| *n == 1));
}

#[test]
fn policy_keeps_unexpired_objects() {
    let tally = shared_tally();
    let recorder = tally.clone();
    let repo = StorageRepository::new(
        "selective",
        &fast_config(),
        key,
        ExpireWhen::new(|p: &Parcel| p.id % 2 == 0),
        UpdateWith::new(move |p: &Parcel| {
            *recorder.lock().unwrap().entry(p.id).or_default() += 1;
            Ok(())
        }),
    );
    for id in 0..6 {
        repo.put(parcel(id));
    }
    assert_eq!(repo.sweep_now(), 3);
    let mut left: Vec<u32> = repo.list().iter().map(|p| p.id).collect();
    left.sort();
    assert_eq!(left, vec![1, 3, 5]);
    assert_eq!(tally.lock().unwrap().len(), 3);
}

#[test]
fn failed_update_is_retried_on_a_later_sweep() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = attempts.clone();
    let repo = StorageRepository::new(
        "retry",
        &fast_config(),
        key,
        Immediately,
        UpdateWith::new(move |_p: &Parcel| {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                anyhow::bail!("store unavailable");
            }
            Ok(())
        }),
    );
    repo.start().unwrap();
    repo.put(parcel(1));
    assert!(wait_until(Duration::from_secs(2), || attempts.load(Ordering::SeqCst) >= 3));
    assert!(wait_until(Duration::from_secs(1), || repo.size() == 0));
    repo.shutdown();
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
}

#[test]
fn workers_never_update_the_same_object_twice_at_once() {
    let in_flight = Arc::new(Mutex::new(HashSet::new()));
    let overlap = Arc::new(AtomicBool::new(false));
    let first_try = Arc::new(Mutex::new(HashSet::new()));
    let tally = shared_tally();
    let updater = {
        let in_flight = in_flight.clone();
        let overlap = overlap.clone();
        let first_try = first_try.clone();
        let tally = tally.clone();
        UpdateWith::new(move |p: &Parcel| {
            if !in_flight.lock().unwrap().insert(p.id) {
                overlap.store(true, Ordering::SeqCst);
            }
            thread::sleep(Duration::from_millis(1));
            in_flight.lock().unwrap().remove(&p.id);
            // every parcel fails once so it cycles through the map again
            if first_try.lock().unwrap().insert(p.id) {
                anyhow::bail!("first attempt of {} fails", p.id);
            }
            *tally.lock().unwrap().entry(p.id).or_default() += 1;
            Ok(())
        })
    };
    let repo = StorageRepository::new("pool", &fast_config().with_workers(3), key, Immediately, updater);
    repo.start().unwrap();
    assert_eq!(repo.worker_count(), 3);
    for id in 0..60 {
        repo.put(parcel(id));
    }
    assert!(wait_until(Duration::from_secs(10), || tally.lock().unwrap().len() == 60));
    repo.shutdown();

    assert!(!overlap.load(Ordering::SeqCst));
    assert!(tally.lock().unwrap().values().all(|n| *n == 1));
    assert_eq!(repo.updated(), 60);
    assert_eq!(repo.failed(), 60);
    assert!(repo.worker_status(0).is_some());
    assert!(repo.worker_status(3).is_none());
}

#[test]
fn shutdown_drains_the_spool() {
    let config = RepositoryConfig {
        // the scheduled sweep never runs during this test
        delay_ms: 60 * 60 * 1000,
        wakeup_on_put: false,
        ..fast_config().with_workers(1)
    };
    let tally = shared_tally();
    let recorder = tally.clone();
    let repo = StorageRepository::new(
        "drain",
        &config,
        key,
        Immediately,
        UpdateWith::new(move |p: &Parcel| {
            thread::sleep(Duration::from_millis(5));
            *recorder.lock().unwrap().entry(p.id).or_default() += 1;
            Ok(())
        }),
    );
    repo.start().unwrap();
    for id in 0..20 {
        repo.put(parcel(id));
    }
    assert_eq!(repo.sweep_now(), 20);
    assert_eq!(repo.size(), 0);
    repo.shutdown();

    assert_eq!(repo.spool_size(), 0);
    assert_eq!(tally.lock().unwrap().len(), 20);
}

#[test]
fn flush_updates_one_object_now() {
    let fail = Arc::new(AtomicBool::new(false));
    let tally = shared_tally();
    let repo = {
        let fail = fail.clone();
        let tally = tally.clone();
        StorageRepository::new(
            "flush",
            &fast_config(),
            key,
            ExpireWhen::new(|_p: &Parcel| false),
            UpdateWith::new(move |p: &Parcel| {
                if fail.load(Ordering::SeqCst) {
                    anyhow::bail!("disk full");
                }
                *tally.lock().unwrap().entry(p.id).or_default() += 1;
                Ok(())
            }),
        )
    };
    repo.put(parcel(1));
    repo.put(parcel(2));

    assert!(repo.flush("0001").unwrap());
    assert!(!repo.contains_key("0001"));
    assert!(!repo.flush("0001").unwrap());

    fail.store(true, Ordering::SeqCst);
    let err = repo.flush("0002").unwrap_err();
    assert_eq!(err.to_string(), "disk full");
    assert!(repo.contains_key("0002"));
    assert_eq!(tally.lock().unwrap().len(), 1);
}

#[test]
fn summary_and_monitor_status() {
    let repo = StorageRepository::new(
        "summary",
        &fast_config().with_workers(2),
        key,
        Immediately,
        UpdateWith::new(|_p: &Parcel| Ok(())),
    );
    repo.start().unwrap();
    assert!(repo.start().is_err());
    repo.put(parcel(1));
    assert!(wait_until(Duration::from_secs(2), || repo.updated() == 1));
    let summary = repo.to_string();
    assert!(summary.starts_with("threads=2,duration="), "{summary}");
    assert!(summary.contains(",speed="), "{summary}");
    assert!(repo.monitor_status().starts_with("ONLINE"));
    repo.shutdown();
    assert_eq!(repo.state(), crate::scheduler::SchedulerState::Offline);
}

#[test]
fn remove_if_leaves_a_replaced_object_alone() {
    let repo = KeyedRepository::new("parcels", &fast_config(), key);
    repo.put(parcel(1));
    let seen = repo.list();
    // replaced between the snapshot and the removal
    repo.put(Parcel {
        id: 1,
        label: "fresh".to_string(),
    });
    assert_eq!(repo.remove_if(&key(&seen[0]), |p| p == &seen[0]), None);
    assert_eq!(repo.get("0001").unwrap().label, "fresh");
    assert_eq!(
        repo.remove_if("0001", |p| p.label == "fresh").map(|p| p.label),
        Some("fresh".to_string())
    );
    assert!(repo.is_empty());
}

#[test]
fn inline_retry_does_not_wait_for_capacity() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let tally = shared_tally();
    let repo = {
        let attempts = attempts.clone();
        let tally = tally.clone();
        Arc::new(StorageRepository::new(
            "full",
            &fast_config().with_max_authorised_size(1),
            key,
            Immediately,
            UpdateWith::new(move |p: &Parcel| {
                if p.id == 1 && attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                    thread::sleep(Duration::from_millis(100));
                    anyhow::bail!("first attempt of {} fails", p.id);
                }
                *tally.lock().unwrap().entry(p.id).or_default() += 1;
                Ok(())
            }),
        ))
    };
    repo.start().unwrap();
    repo.put(parcel(1));
    // the sweep took parcel 1, so its slot is free for parcel 2
    assert!(wait_until(Duration::from_secs(2), || attempts.load(Ordering::SeqCst) == 1));
    repo.put(parcel(2));

    assert!(wait_until(Duration::from_secs(2), || tally.lock().unwrap().len() == 2));
    assert!(wait_until(Duration::from_secs(1), || repo.size() == 0));
    let start = Instant::now();
    repo.shutdown();
    assert!(start.elapsed() < Duration::from_secs(1), "shutdown took {:?}", start.elapsed());
    assert!(tally.lock().unwrap().values().all(|n| *n == 1));
}

#[test]
fn put_after_a_long_idle_wait_is_not_reported_as_jammed() {
    let config = RepositoryConfig {
        jammed_threshold_ms: 100,
        idle_interval_ms: 60 * 60 * 1000,
        ..fast_config()
    };
    let tally = shared_tally();
    let recorder = tally.clone();
    let repo = StorageRepository::new(
        "idle",
        &config,
        key,
        Immediately,
        UpdateWith::new(move |p: &Parcel| {
            thread::sleep(Duration::from_millis(80));
            *recorder.lock().unwrap().entry(p.id).or_default() += 1;
            Ok(())
        }),
    );
    repo.start().unwrap();
    assert!(wait_until(Duration::from_secs(1), || repo.scheduler().is_sleeping()));
    thread::sleep(Duration::from_millis(400));

    repo.put(parcel(1));
    thread::sleep(Duration::from_millis(20));
    assert_eq!(repo.state(), crate::scheduler::SchedulerState::Online);
    assert!(repo.scheduler().step_time() < Duration::from_millis(100));
    assert!(wait_until(Duration::from_secs(2), || tally.lock().unwrap().len() == 1));
    repo.shutdown();
}
