//! The multi-core scheduler.
//!
//! One dispatcher thread hands ready processes to idle cores in FIFO order;
//! one worker thread per core steps its assigned process one instruction at
//! a time. The two policies share the ready queue and differ only in the
//! worker's quantum accounting:
//!
//! * [`Policy::Fcfs`] runs a process to completion without preemption.
//! * [`Policy::RoundRobin`] runs at most `quantum` steps, then returns the
//!   process to the back of the ready queue. Its dispatcher also drives the
//!   memory manager's CPU-tick accounting, and every step issues a synthetic
//!   instruction fetch at `4 * current_burst` to keep paging honest.
//!
//! Shutdown is cooperative: flags flip under the state mutex, the condition
//! variable is broadcast, and workers observe the flags between steps.
//! In-flight work is abandoned in place; its logs are still exported.

use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::memory::MemoryManager;

use super::process::Status;
use super::queues::Queues;
use super::table::{ProcessHandle, ProcessTable};
use super::Pid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    Fcfs,
    RoundRobin { quantum: u32 },
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub cores: usize,
    pub policy: Policy,
    /// Sleep between instruction steps and between dispatch passes.
    pub delay_per_exec: Duration,
    /// Where finished-process logs are written on shutdown.
    pub log_dir: PathBuf,
}

#[derive(Debug)]
struct Core {
    busy: bool,
    assigned: Option<Pid>,
}

struct SchedState {
    cores: Vec<Core>,
    queues: Queues,
}

struct Shared {
    config: SchedulerConfig,
    memory: Arc<MemoryManager>,
    table: Arc<ProcessTable>,
    state: Mutex<SchedState>,
    work: Condvar,
    running: AtomicBool,
    core_running: Vec<AtomicBool>,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, SchedState> {
        self.state.lock().expect("scheduler state poisoned")
    }
}

struct Threads {
    dispatcher: JoinHandle<()>,
    workers: Vec<JoinHandle<()>>,
}

pub struct Scheduler {
    shared: Arc<Shared>,
    threads: Mutex<Option<Threads>>,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        memory: Arc<MemoryManager>,
        table: Arc<ProcessTable>,
    ) -> Self {
        assert!(config.cores > 0, "scheduler needs at least one core");
        let cores = config.cores;
        Self {
            shared: Arc::new(Shared {
                config,
                memory,
                table,
                state: Mutex::new(SchedState {
                    cores: (0..cores)
                        .map(|_| Core {
                            busy: false,
                            assigned: None,
                        })
                        .collect(),
                    queues: Queues::new(),
                }),
                work: Condvar::new(),
                running: AtomicBool::new(false),
                core_running: (0..cores).map(|_| AtomicBool::new(false)).collect(),
            }),
            threads: Mutex::new(None),
        }
    }

    /// Spawns one worker per core and the dispatcher.
    pub fn start(&self) {
        let mut threads = self.threads.lock().expect("scheduler threads poisoned");
        if threads.is_some() {
            return;
        }
        self.shared.running.store(true, Ordering::Release);
        for flag in &self.shared.core_running {
            flag.store(true, Ordering::Release);
        }
        let workers = (0..self.shared.config.cores)
            .map(|core| {
                let shared = Arc::clone(&self.shared);
                thread::Builder::new()
                    .name(format!("core-{}", core))
                    .spawn(move || worker_loop(&shared, core))
                    .expect("failed to spawn core worker")
            })
            .collect();
        let shared = Arc::clone(&self.shared);
        let dispatcher = thread::Builder::new()
            .name("dispatcher".to_owned())
            .spawn(move || dispatcher_loop(&shared))
            .expect("failed to spawn dispatcher");
        *threads = Some(Threads {
            dispatcher,
            workers,
        });
        log::info!(
            "scheduler started: {} cores, {:?}",
            self.shared.config.cores,
            self.shared.config.policy
        );
    }

    pub fn is_started(&self) -> bool {
        self.threads
            .lock()
            .expect("scheduler threads poisoned")
            .is_some()
    }

    /// Stops the dispatcher, then the workers, then flushes process logs.
    /// Safe to call twice.
    pub fn stop(&self) {
        let threads = {
            let mut guard = self.threads.lock().expect("scheduler threads poisoned");
            guard.take()
        };
        let Some(threads) = threads else { return };
        {
            let _state = self.shared.state();
            self.shared.running.store(false, Ordering::Release);
        }
        self.shared.work.notify_all();
        let _ = threads.dispatcher.join();
        {
            let _state = self.shared.state();
            for flag in &self.shared.core_running {
                flag.store(false, Ordering::Release);
            }
        }
        self.shared.work.notify_all();
        for worker in threads.workers {
            let _ = worker.join();
        }
        self.flush_logs();
        log::info!("scheduler stopped");
    }

    /// Admits a process: status READY, tail of the ready queue, wake-up.
    pub fn add_process(&self, pid: Pid) {
        let Some(handle) = self.shared.table.get(pid) else {
            log::warn!("add_process: unknown pid {}", pid);
            return;
        };
        handle
            .lock()
            .expect("process poisoned")
            .set_status(Status::Ready);
        let mut st = self.shared.state();
        st.queues.give(pid);
        drop(st);
        self.shared.work.notify_all();
    }

    /// True iff no core is busy and the ready queue is empty.
    pub fn all_processes_finished(&self) -> bool {
        let st = self.shared.state();
        st.cores.iter().all(|core| !core.busy) && st.queues.ready_is_empty()
    }

    /// Completion-ordered pids of finished processes.
    pub fn finished_pids(&self) -> Vec<Pid> {
        self.shared.state().queues.finished().to_vec()
    }

    /// Human-readable snapshot: utilization, per-core running processes,
    /// the ready queue (RR only) and the finished list.
    pub fn status_report(&self) -> String {
        let st = self.shared.state();
        let busy = st.cores.iter().filter(|core| core.busy).count();
        let total = st.cores.len();
        let mut out = String::new();
        let _ = writeln!(out, "CPU utilization: {}%", busy * 100 / total);
        let _ = writeln!(out, "Cores used: {}", busy);
        let _ = writeln!(out, "Cores available: {}", total - busy);
        let _ = writeln!(out, "--------------------------------------");
        let _ = writeln!(out, "\nRunning processes:");
        for (core_id, core) in st.cores.iter().enumerate() {
            let Some(pid) = core.assigned.filter(|_| core.busy) else {
                continue;
            };
            if let Some(handle) = self.shared.table.get(pid) {
                let process = handle.lock().expect("process poisoned");
                let _ = writeln!(
                    out,
                    "{}\t({})\tCore: {}\t{} / {}",
                    process.name(),
                    process.created(),
                    core_id,
                    process.current_burst(),
                    process.total_burst()
                );
            }
        }
        if matches!(self.shared.config.policy, Policy::RoundRobin { .. }) {
            let _ = writeln!(out, "\nReady queue:");
            for pid in st.queues.ready() {
                if let Some(handle) = self.shared.table.get(pid) {
                    let process = handle.lock().expect("process poisoned");
                    let _ = writeln!(
                        out,
                        "{}\t{} / {}",
                        process.name(),
                        process.current_burst(),
                        process.total_burst()
                    );
                }
            }
        }
        let _ = writeln!(out, "\nFinished processes:");
        for &pid in st.queues.finished() {
            if let Some(handle) = self.shared.table.get(pid) {
                let process = handle.lock().expect("process poisoned");
                let _ = writeln!(
                    out,
                    "{}\t({})\tFinished  {} / {}",
                    process.name(),
                    process.created(),
                    process.total_burst(),
                    process.total_burst()
                );
            }
        }
        let _ = writeln!(out, "--------------------------------------");
        out
    }

    /// Exports logs of finished processes, plus any work that was abandoned
    /// on a core by shutdown.
    fn flush_logs(&self) {
        let st = self.shared.state();
        let mut pids: Vec<Pid> = st.queues.finished().to_vec();
        pids.extend(st.cores.iter().filter_map(|core| core.assigned));
        drop(st);
        for pid in pids {
            if let Some(handle) = self.shared.table.get(pid) {
                let process = handle.lock().expect("process poisoned");
                if let Err(err) = process.export_logs(&self.shared.config.log_dir) {
                    log::warn!("failed to export logs of {}: {}", process.name(), err);
                }
            }
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Assigns ready processes to idle cores, lowest core index first, then
/// sleeps one delay. Under RR it also charges one CPU tick per pass, active
/// when any core got or already had work.
fn dispatcher_loop(shared: &Shared) {
    log::debug!("dispatcher running");
    while shared.running.load(Ordering::Acquire) {
        let mut assigned_any = false;
        let mut any_busy = false;
        {
            let mut st = shared.state();
            for core_id in 0..st.cores.len() {
                if st.cores[core_id].busy {
                    any_busy = true;
                    continue;
                }
                let Some(pid) = st.queues.take() else { continue };
                st.cores[core_id].busy = true;
                st.cores[core_id].assigned = Some(pid);
                if let Some(handle) = shared.table.get(pid) {
                    handle
                        .lock()
                        .expect("process poisoned")
                        .set_status(Status::Running);
                }
                log::debug!("dispatch: {} -> core {}", pid, core_id);
                assigned_any = true;
            }
        }
        if assigned_any {
            shared.work.notify_all();
        }
        if matches!(shared.config.policy, Policy::RoundRobin { .. }) {
            shared.memory.tick(assigned_any || any_busy);
        }
        thread::sleep(shared.config.delay_per_exec);
    }
    log::debug!("dispatcher exiting");
}

enum RunOutcome {
    /// Burst exhausted, program finished, or the process violated memory.
    Finished,
    /// Quantum expired with work left (RR only).
    Requeue,
    /// Shutdown observed mid-run; the process is left in place.
    Abandoned,
}

fn worker_loop(shared: &Shared, core: usize) {
    loop {
        let pid = {
            let mut st = shared.state();
            loop {
                if !shared.core_running[core].load(Ordering::Acquire) {
                    return;
                }
                if let Some(pid) = st.cores[core].assigned {
                    break pid;
                }
                st = shared.work.wait(st).expect("scheduler state poisoned");
            }
        };
        let Some(handle) = shared.table.get(pid) else {
            log::warn!("core {}: assigned unknown pid {}", core, pid);
            release_core(shared, core);
            continue;
        };
        let outcome = match shared.config.policy {
            Policy::Fcfs => run_to_completion(shared, core, &handle),
            Policy::RoundRobin { quantum } => run_slice(shared, core, &handle, quantum),
        };
        match outcome {
            RunOutcome::Finished => {
                handle
                    .lock()
                    .expect("process poisoned")
                    .set_status(Status::Finished);
                let mut st = shared.state();
                st.queues.finish(pid);
                st.cores[core].busy = false;
                st.cores[core].assigned = None;
                drop(st);
                shared.work.notify_all();
                log::debug!("core {}: {} finished", core, pid);
            }
            RunOutcome::Requeue => {
                handle
                    .lock()
                    .expect("process poisoned")
                    .set_status(Status::Ready);
                let mut st = shared.state();
                st.queues.give(pid);
                st.cores[core].busy = false;
                st.cores[core].assigned = None;
                drop(st);
                shared.work.notify_all();
            }
            RunOutcome::Abandoned => return,
        }
    }
}

fn release_core(shared: &Shared, core: usize) {
    let mut st = shared.state();
    st.cores[core].busy = false;
    st.cores[core].assigned = None;
    drop(st);
    shared.work.notify_all();
}

/// FCFS: step until the burst budget or the program runs out.
fn run_to_completion(shared: &Shared, core: usize, handle: &ProcessHandle) -> RunOutcome {
    loop {
        if !shared.core_running[core].load(Ordering::Acquire) {
            return RunOutcome::Abandoned;
        }
        {
            let mut process = handle.lock().expect("process poisoned");
            if process.current_burst() >= process.total_burst() || process.is_finished() {
                return RunOutcome::Finished;
            }
            process.execute_instruction(core as i32, &shared.memory);
            if process.has_violation() {
                return RunOutcome::Finished;
            }
        }
        thread::sleep(shared.config.delay_per_exec);
    }
}

/// RR: at most `quantum` steps, each preceded by a synthetic instruction
/// fetch. Sleep ticks consume quantum like any other step.
fn run_slice(shared: &Shared, core: usize, handle: &ProcessHandle, quantum: u32) -> RunOutcome {
    let mut executed = 0;
    while executed < quantum {
        if !shared.core_running[core].load(Ordering::Acquire) {
            return RunOutcome::Abandoned;
        }
        {
            let mut process = handle.lock().expect("process poisoned");
            if process.current_burst() >= process.total_burst() || process.is_finished() {
                return RunOutcome::Finished;
            }
            let fetch = 4 * process.current_burst() as usize;
            let _ = shared.memory.read(process.name(), fetch);
            process.execute_instruction(core as i32, &shared.memory);
            if process.has_violation() {
                return RunOutcome::Finished;
            }
        }
        executed += 1;
        thread::sleep(shared.config.delay_per_exec);
    }
    let process = handle.lock().expect("process poisoned");
    if process.current_burst() >= process.total_burst() || process.is_finished() {
        RunOutcome::Finished
    } else {
        RunOutcome::Requeue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::multitasking::process::Process;
    use crate::multitasking::program::parse_instruction;

    fn fixture(policy: Policy) -> (tempfile::TempDir, Arc<Shared>) {
        let dir = tempfile::tempdir().unwrap();
        let memory = Arc::new(
            MemoryManager::with_store(1024, 32, dir.path().join("store.txt")).unwrap(),
        );
        let table = Arc::new(ProcessTable::new());
        let shared = Arc::new(Shared {
            config: SchedulerConfig {
                cores: 1,
                policy,
                delay_per_exec: Duration::ZERO,
                log_dir: dir.path().to_path_buf(),
            },
            memory,
            table,
            state: Mutex::new(SchedState {
                cores: vec![Core {
                    busy: false,
                    assigned: None,
                }],
                queues: Queues::new(),
            }),
            work: Condvar::new(),
            running: AtomicBool::new(true),
            core_running: vec![AtomicBool::new(true)],
        });
        (dir, shared)
    }

    fn prints(shared: &Shared, name: &str, count: usize) -> ProcessHandle {
        let program = (0..count)
            .map(|i| parse_instruction(&format!("PRINT \"tick {}\"", i)))
            .collect();
        let pid = shared.table.allocate_id();
        let mut process = Process::with_program(pid, name, program);
        shared.memory.allocate(name, 64).unwrap();
        process.set_memory_size(64);
        shared.table.insert(process)
    }

    #[test]
    fn quantum_exactly_bounds_a_slice() {
        let (_dir, shared) = fixture(Policy::RoundRobin { quantum: 2 });
        let handle = prints(&shared, "p", 5);

        assert!(matches!(
            run_slice(&shared, 0, &handle, 2),
            RunOutcome::Requeue
        ));
        assert_eq!(handle.lock().unwrap().current_burst(), 2);

        assert!(matches!(
            run_slice(&shared, 0, &handle, 2),
            RunOutcome::Requeue
        ));
        assert_eq!(handle.lock().unwrap().current_burst(), 4);

        assert!(matches!(
            run_slice(&shared, 0, &handle, 2),
            RunOutcome::Finished
        ));
        assert_eq!(handle.lock().unwrap().current_burst(), 5);
    }

    #[test]
    fn fcfs_runs_to_completion() {
        let (_dir, shared) = fixture(Policy::Fcfs);
        let handle = prints(&shared, "p", 7);
        assert!(matches!(
            run_to_completion(&shared, 0, &handle),
            RunOutcome::Finished
        ));
        let process = handle.lock().unwrap();
        assert_eq!(process.current_burst(), 7);
        assert!(process.is_finished());
    }

    #[test]
    fn violation_finishes_the_slice_early() {
        let (_dir, shared) = fixture(Policy::RoundRobin { quantum: 10 });
        let pid = shared.table.allocate_id();
        let program = vec![
            parse_instruction("WRITE 0x1000 1"),
            parse_instruction("PRINT \"never\""),
        ];
        let mut process = Process::with_program(pid, "bad", program);
        shared.memory.allocate("bad", 16).unwrap();
        process.set_memory_size(16);
        let handle = shared.table.insert(process);

        assert!(matches!(
            run_slice(&shared, 0, &handle, 10),
            RunOutcome::Finished
        ));
        let process = handle.lock().unwrap();
        assert!(process.has_violation());
        assert!(!process
            .logs()
            .iter()
            .any(|entry| entry.message.contains("never")));
    }
}
