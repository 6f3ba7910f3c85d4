//! Spawner behavior against a live scheduler.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use csopesy::memory::MemoryManager;
use csopesy::multitasking::spawner::EVALUATION_PROCESS_CAP;
use csopesy::multitasking::{
    Policy, ProcessTable, Scheduler, SchedulerConfig, Spawner, SpawnerConfig,
};

fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(15);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        std::thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn evaluation_mode_stops_after_ten_processes() {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = tempfile::tempdir().unwrap();
    let memory = Arc::new(
        MemoryManager::with_store(65536, 256, dir.path().join("store.txt")).unwrap(),
    );
    let table = Arc::new(ProcessTable::new());
    let scheduler = Arc::new(Scheduler::new(
        SchedulerConfig {
            cores: 2,
            policy: Policy::RoundRobin { quantum: 4 },
            delay_per_exec: Duration::from_millis(1),
            log_dir: PathBuf::from(dir.path()),
        },
        Arc::clone(&memory),
        Arc::clone(&table),
    ));
    scheduler.start();

    let spawner = Spawner::new();
    assert!(spawner.start(
        SpawnerConfig {
            frequency: 1,
            min_ins: 3,
            max_ins: 8,
            min_mem: 256,
            max_mem: 256,
            delay: Duration::from_millis(1),
            evaluation_mode: true,
        },
        Arc::clone(&table),
        Arc::clone(&memory),
        Arc::clone(&scheduler),
    ));

    wait_until("ten spawned processes", || {
        table.len() >= EVALUATION_PROCESS_CAP as usize
    });
    wait_until("spawner to disable itself", || !spawner.is_enabled());
    std::thread::sleep(Duration::from_millis(50));
    // the cap is exact
    assert_eq!(table.len(), EVALUATION_PROCESS_CAP as usize);
    spawner.stop();

    // names are monotonic screen_NN
    let names: Vec<String> = table
        .handles()
        .iter()
        .map(|(_, handle)| handle.lock().unwrap().name().to_owned())
        .collect();
    assert_eq!(names[0], "screen_01");
    assert_eq!(names[9], "screen_10");

    // everything admitted eventually drains (violations included)
    wait_until("all admitted processes to finish", || {
        scheduler.all_processes_finished()
    });
    scheduler.stop();
}

#[test]
fn spawner_stop_is_idempotent() {
    let _ = env_logger::builder().is_test(true).try_init();
    let spawner = Spawner::new();
    assert!(!spawner.stop());
    assert!(!spawner.is_enabled());
}
