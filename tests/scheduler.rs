//! End-to-end scheduler scenarios: real worker/dispatcher threads driving
//! processes through the memory manager.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use csopesy::memory::MemoryManager;
use csopesy::multitasking::program::parse_instruction;
use csopesy::multitasking::{
    Pid, Policy, Process, ProcessTable, Scheduler, SchedulerConfig, Status,
};

struct Fixture {
    dir: tempfile::TempDir,
    memory: Arc<MemoryManager>,
    table: Arc<ProcessTable>,
    scheduler: Arc<Scheduler>,
}

fn fixture(cores: usize, policy: Policy) -> Fixture {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = tempfile::tempdir().unwrap();
    let memory = Arc::new(
        MemoryManager::with_store(4096, 32, dir.path().join("store.txt")).unwrap(),
    );
    let table = Arc::new(ProcessTable::new());
    let scheduler = Arc::new(Scheduler::new(
        SchedulerConfig {
            cores,
            policy,
            delay_per_exec: Duration::from_millis(1),
            log_dir: PathBuf::from(dir.path()),
        },
        Arc::clone(&memory),
        Arc::clone(&table),
    ));
    Fixture {
        dir,
        memory,
        table,
        scheduler,
    }
}

impl Fixture {
    /// Registers a process with `count` PRINT instructions and 64 bytes of
    /// memory, without admitting it yet.
    fn add_prints(&self, name: &str, count: usize) -> Pid {
        let program = (0..count)
            .map(|i| parse_instruction(&format!("PRINT \"tick {}\"", i)))
            .collect();
        self.add_program(name, program)
    }

    fn add_program(
        &self,
        name: &str,
        program: Vec<csopesy::multitasking::program::Instruction>,
    ) -> Pid {
        let pid = self.table.allocate_id();
        let mut process = Process::with_program(pid, name, program);
        self.memory.allocate(name, 64).unwrap();
        process.set_memory_size(64);
        self.table.insert(process);
        pid
    }

    fn wait_for_finished(&self, count: usize) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while self.scheduler.finished_pids().len() < count {
            assert!(
                Instant::now() < deadline,
                "timed out waiting for {} finished processes, have {:?}",
                count,
                self.scheduler.finished_pids()
            );
            std::thread::sleep(Duration::from_millis(5));
        }
    }
}

#[test]
fn fcfs_completion_order_matches_admission_order() {
    let fixture = fixture(1, Policy::Fcfs);
    let a = fixture.add_prints("alpha", 3);
    let b = fixture.add_prints("bravo", 3);
    let c = fixture.add_prints("charlie", 3);
    fixture.scheduler.add_process(a);
    fixture.scheduler.add_process(b);
    fixture.scheduler.add_process(c);

    fixture.scheduler.start();
    fixture.wait_for_finished(3);
    fixture.scheduler.stop();

    assert_eq!(fixture.scheduler.finished_pids(), vec![a, b, c]);
    assert!(fixture.scheduler.all_processes_finished());

    for name in ["alpha", "bravo", "charlie"] {
        let handle = fixture.table.by_name(name).unwrap();
        let process = handle.lock().unwrap();
        assert_eq!(process.status(), Status::Finished);
        assert_eq!(process.current_burst(), 3);

        let text =
            std::fs::read_to_string(fixture.dir.path().join(format!("{}.txt", name))).unwrap();
        assert!(text.contains("Lines of code: 3\n"));
        assert!(text.contains("Finished!\n"));
    }
}

#[test]
fn round_robin_requeues_after_each_quantum() {
    // One core, quantum 2: the long process must yield to the short one,
    // so the short one finishes first. FCFS would finish them in
    // admission order.
    let fixture = fixture(1, Policy::RoundRobin { quantum: 2 });
    let long = fixture.add_prints("long", 8);
    let short = fixture.add_prints("short", 2);
    fixture.scheduler.add_process(long);
    fixture.scheduler.add_process(short);

    fixture.scheduler.start();
    fixture.wait_for_finished(2);
    fixture.scheduler.stop();

    assert_eq!(fixture.scheduler.finished_pids(), vec![short, long]);
    for (name, burst) in [("long", 8), ("short", 2)] {
        let handle = fixture.table.by_name(name).unwrap();
        let process = handle.lock().unwrap();
        assert_eq!(process.current_burst(), burst);
        assert!(process.current_burst() <= process.total_burst());
    }
    // the RR dispatcher drives tick accounting
    let snapshot = fixture.memory.snapshot();
    assert!(snapshot.total_ticks > 0);
    assert_eq!(
        snapshot.total_ticks,
        snapshot.active_ticks + snapshot.idle_ticks
    );
}

#[test]
fn round_robin_completes_loops_and_sleeps() {
    let fixture = fixture(1, Policy::RoundRobin { quantum: 4 });
    let looper = fixture.add_program(
        "looper",
        vec![
            parse_instruction("FOR 3"),
            parse_instruction("PRINT \"x\""),
            parse_instruction("ENDLOOP"),
        ],
    );
    let sleeper = fixture.add_program(
        "sleeper",
        vec![parse_instruction("SLEEP 3"), parse_instruction("PRINT \"y\"")],
    );
    fixture.scheduler.add_process(looper);
    fixture.scheduler.add_process(sleeper);

    fixture.scheduler.start();
    fixture.wait_for_finished(2);
    fixture.scheduler.stop();

    let handle = fixture.table.by_name("looper").unwrap();
    let process = handle.lock().unwrap();
    assert_eq!(process.current_burst(), 5);
    assert_eq!(
        process
            .logs()
            .iter()
            .filter(|entry| entry.message == "PRINT: x")
            .count(),
        3
    );
    drop(process);

    let handle = fixture.table.by_name("sleeper").unwrap();
    let process = handle.lock().unwrap();
    // SLEEP and PRINT count; the three countdown ticks do not
    assert_eq!(process.current_burst(), 2);
    assert!(process.is_finished());
}

#[test]
fn memory_violation_shuts_the_process_down() {
    let fixture = fixture(1, Policy::Fcfs);
    let bad = fixture.add_program(
        "bad",
        vec![
            parse_instruction("WRITE 0x1000 42"),
            parse_instruction("PRINT \"unreachable\""),
        ],
    );
    let good = fixture.add_prints("good", 2);
    fixture.scheduler.add_process(bad);
    fixture.scheduler.add_process(good);

    fixture.scheduler.start();
    fixture.wait_for_finished(2);
    fixture.scheduler.stop();

    let handle = fixture.table.by_name("bad").unwrap();
    let process = handle.lock().unwrap();
    assert_eq!(process.status(), Status::Finished);
    let violation = process.violation().expect("violation must be recorded");
    assert_eq!(violation.address, 0x1000);
    assert!(!violation.timestamp.is_empty());
    assert!(process
        .logs()
        .iter()
        .any(|entry| entry.message.contains("memory access violation at 0x1000")));
    // execution stopped at the violation
    assert!(!process
        .logs()
        .iter()
        .any(|entry| entry.message.contains("unreachable")));
    drop(process);

    // the other process is unaffected
    let handle = fixture.table.by_name("good").unwrap();
    assert!(!handle.lock().unwrap().has_violation());
}

#[test]
fn status_report_lists_finished_processes() {
    let fixture = fixture(2, Policy::Fcfs);
    let a = fixture.add_prints("alpha", 2);
    fixture.scheduler.add_process(a);
    fixture.scheduler.start();
    fixture.wait_for_finished(1);
    fixture.scheduler.stop();

    let report = fixture.scheduler.status_report();
    assert!(report.contains("CPU utilization: 0%"));
    assert!(report.contains("Finished processes:"));
    assert!(report.contains("alpha"));
    assert!(report.contains("Finished  2 / 2"));
}
