use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tilebay_cache::{ManualMemory, PressureLevel, PreviewKey, ResourceLimits, MB};
use tilebay_core::{
    CreationStatus, ManagedObject, ObjectState, ProducerPoolConfig, RuntimeConfig, TileRuntime,
};
use tilebay_scheduler::{Task, TaskPriority, TaskScheduler, TaskStatus};
use tracing_subscriber::EnvFilter;

// Honors RUST_LOG, e.g. `RUST_LOG=tilebay_core=debug`.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[derive(Default)]
struct Tile {
    disposed: AtomicBool,
}

impl ManagedObject for Tile {
    fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
    }

    fn memory_estimate(&self) -> usize {
        64 * 1024
    }
}

fn runtime<T>() -> (TileRuntime<T>, Arc<ManualMemory>) {
    init_tracing();
    let memory = Arc::new(ManualMemory::new());
    memory.set_usage_mb(10);
    let config = RuntimeConfig {
        limits: ResourceLimits::new(0, 100, 2),
        ..RuntimeConfig::default()
    };
    let runtime = TileRuntime::with_memory_source(config, memory.clone()).unwrap();
    (runtime, memory)
}

#[test]
fn bounded_drain_runs_every_task_exactly_once() {
    init_tracing();
    let scheduler = TaskScheduler::new();
    for i in 0..10_000usize {
        scheduler.submit_fn(TaskPriority::Prefetch, move |_| i);
    }

    // Tasks are trivial, so a call overruns the budget by at most one task
    // plus scheduling noise.
    let budget = Duration::from_millis(10);
    let slack = Duration::from_millis(15);

    let mut seen = vec![0u8; 10_000];
    let mut calls = 0;
    while !scheduler.is_idle() {
        let started = Instant::now();
        let batch = scheduler.drain(50, budget);
        let elapsed = started.elapsed();
        assert!(elapsed <= budget + slack, "drain took {elapsed:?}");
        assert!(batch.len() <= 50);
        for done in batch {
            seen[done.into_value().unwrap()] += 1;
        }
        calls += 1;
        assert!(calls <= 10_000, "drain made no progress");
    }

    assert!(seen.iter().all(|count| *count == 1));
    assert!(calls >= 200);
    assert_eq!(scheduler.stats().completed, 10_000);
}

#[test]
fn debounce_runs_once_with_latest_payload() {
    init_tracing();
    let scheduler = TaskScheduler::new();
    let first = scheduler.debounce(
        "x",
        Task::new(TaskPriority::Immediate, |_| "first"),
        Duration::from_millis(30),
    );
    thread::sleep(Duration::from_millis(10));
    let second = scheduler.debounce(
        "x",
        Task::new(TaskPriority::Immediate, |_| "second"),
        Duration::from_millis(30),
    );
    assert_eq!(first.status(), TaskStatus::Superseded);

    // Not due yet.
    assert!(scheduler
        .drain(10, Duration::from_millis(5))
        .iter()
        .all(|done| !done.is_ok()));

    thread::sleep(Duration::from_millis(50));
    let ran: Vec<_> = scheduler
        .drain(10, Duration::from_millis(5))
        .into_iter()
        .filter_map(|done| done.into_value())
        .collect();
    assert_eq!(ran, vec!["second"]);
    assert_eq!(second.status(), TaskStatus::Completed);
    assert!(scheduler.is_idle());
}

#[test]
fn created_tiles_are_reclaimed_under_pressure_once_idle() {
    let (runtime, memory) = runtime::<()>();
    let controller = runtime.creation_controller();

    let created: Vec<_> = controller
        .create_all(0..200u32, |_| Ok::<_, String>(Arc::new(Tile::default())))
        .collect();
    assert_eq!(created.len(), 200);
    assert_eq!(runtime.registry().stats().tracked_bytes, 200 * 64 * 1024);

    // Scrolled out of view.
    for tile in &created[..150] {
        runtime.registry().mark_idle(&tile.handle).unwrap();
    }

    memory.set_usage_mb(95);
    runtime.sample();
    let report = runtime.tick();
    assert!(report.throttled);
    assert_eq!(report.reclaimed, 150);

    for (index, tile) in created.iter().enumerate() {
        let expect_disposed = index < 150;
        assert_eq!(tile.object.disposed.load(Ordering::SeqCst), expect_disposed);
        assert_eq!(
            tile.handle.state() == ObjectState::Disposed,
            expect_disposed
        );
    }
    assert_eq!(runtime.registry().len(), 50);
}

#[test]
fn creation_is_throttled_under_critical_pressure() {
    let (runtime, memory) = runtime::<()>();
    memory.set_usage_mb(99);
    let controller = runtime.creation_controller();
    let mut run = controller.create_all(0..10u32, |_| Ok::<_, String>(Arc::new(Tile::default())));

    assert!(run.next_chunk().unwrap().is_empty());
    assert_eq!(run.status(), CreationStatus::Throttled);
    assert_eq!(runtime.registry().len(), 0);

    memory.set_usage_mb(10);
    let rest: Vec<_> = run.by_ref().collect();
    assert_eq!(rest.len(), 10);
    assert_eq!(run.status(), CreationStatus::Completed);
}

#[test]
fn producers_decode_into_cache_and_tick_delivers_results() {
    let (runtime, _) = runtime::<PreviewKey>();
    let previews = runtime.cache::<PreviewKey, Arc<Vec<u8>>>();
    let pool = runtime
        .spawn_producers(ProducerPoolConfig::new(4).with_poll_interval(Duration::from_millis(5)))
        .unwrap();

    for page in 0..12u32 {
        let previews = previews.clone();
        pool.submit(move |token| {
            let key = PreviewKey::new(format!("scans/page-{page}.cbz"), 256, 256);
            if token.is_cancelled() {
                return None;
            }
            let pixels = Arc::new(vec![0u8; key.decoded_size_bytes()]);
            previews.put(key.clone(), pixels, key.decoded_size_bytes());
            Some(Task::new(TaskPriority::Visible, move |_| key))
        });
    }

    let mut ready = HashMap::new();
    let deadline = Instant::now() + Duration::from_secs(5);
    while ready.len() < 12 && Instant::now() < deadline {
        for done in runtime.tick().tasks {
            if let Some(key) = done.into_value() {
                ready.insert(key.to_string(), key);
            }
        }
        thread::sleep(Duration::from_millis(2));
    }
    pool.shutdown();

    assert_eq!(ready.len(), 12);
    for key in ready.values() {
        assert!(previews.contains(key));
    }
    assert!(previews.bytes_used() <= 100 * MB);
    assert_eq!(runtime.registry().active_workers(), 0);
    assert_eq!(runtime.monitor().pressure(), PressureLevel::Normal);
}
