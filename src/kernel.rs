//! The kernel value constructed at `initialize`: configuration, memory
//! manager, process table, scheduler and spawner, threaded explicitly to
//! whoever needs them.

use std::fmt;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use crate::config::{SchedulerKind, SystemConfig};
use crate::memory::{AllocError, MemoryManager, MemorySnapshot};
use crate::multitasking::program::{self, MAX_CUSTOM_INSTRUCTIONS};
use crate::multitasking::{
    Policy, Process, ProcessHandle, ProcessTable, Scheduler, SchedulerConfig, Spawner,
    SpawnerConfig, Status,
};

pub const REPORT_FILE: &str = "csopesy_log.txt";

#[derive(Debug)]
pub enum CreateError {
    DuplicateName(String),
    InvalidInstructionCount(usize),
    Alloc(AllocError),
}

impl fmt::Display for CreateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CreateError::DuplicateName(name) => {
                write!(f, "screen '{}' already exists", name)
            }
            CreateError::InvalidInstructionCount(count) => write!(
                f,
                "instruction count must be between 1 and {}, got {}",
                MAX_CUSTOM_INSTRUCTIONS, count
            ),
            CreateError::Alloc(err) => write!(f, "{}", err),
        }
    }
}

pub struct Kernel {
    config: SystemConfig,
    memory: Arc<MemoryManager>,
    table: Arc<ProcessTable>,
    scheduler: Arc<Scheduler>,
    spawner: Spawner,
}

impl Kernel {
    /// Builds the memory manager (truncating the backing store) and the
    /// scheduler for the configured policy. Nothing starts running yet.
    pub fn boot(config: SystemConfig) -> io::Result<Self> {
        let memory = Arc::new(MemoryManager::new(
            config.max_overall_mem,
            config.mem_per_frame,
        )?);
        let table = Arc::new(ProcessTable::new());
        let policy = match config.scheduler {
            SchedulerKind::Fcfs => Policy::Fcfs,
            SchedulerKind::RoundRobin => Policy::RoundRobin {
                quantum: config.quantum_cycles,
            },
        };
        let scheduler = Arc::new(Scheduler::new(
            SchedulerConfig {
                cores: config.num_cpu,
                policy,
                delay_per_exec: Duration::from_millis(config.delay_per_exec),
                log_dir: PathBuf::from("."),
            },
            Arc::clone(&memory),
            Arc::clone(&table),
        ));
        Ok(Self {
            config,
            memory,
            table,
            scheduler,
            spawner: Spawner::new(),
        })
    }

    pub fn config(&self) -> &SystemConfig {
        &self.config
    }

    pub fn memory(&self) -> &Arc<MemoryManager> {
        &self.memory
    }

    pub fn table(&self) -> &Arc<ProcessTable> {
        &self.table
    }

    /// Starts the worker and dispatcher threads. Returns true when the
    /// scheduler was not running before.
    pub fn start_scheduler(&self) -> bool {
        if self.scheduler.is_started() {
            return false;
        }
        self.scheduler.start();
        true
    }

    /// Starts the spawner. Returns true when it was not running before.
    pub fn start_spawner(&self) -> bool {
        self.spawner.start(
            SpawnerConfig {
                frequency: self.config.batch_process_freq,
                min_ins: self.config.min_ins,
                max_ins: self.config.max_ins,
                min_mem: self.config.min_mem_per_proc,
                max_mem: self.config.max_mem_per_proc,
                delay: Duration::from_millis(self.config.delay_per_exec),
                evaluation_mode: self.config.is_evaluation_mode,
            },
            Arc::clone(&self.table),
            Arc::clone(&self.memory),
            Arc::clone(&self.scheduler),
        )
    }

    /// Stops the spawner; the scheduler keeps draining. Returns true when
    /// the spawner was running.
    pub fn stop_spawner(&self) -> bool {
        self.spawner.stop()
    }

    /// The `screen -s` path: a generated program with a random burst in the
    /// configured range. The process is admitted only when its memory
    /// allocation succeeds.
    pub fn create_process(
        &self,
        name: &str,
        memory_size: Option<usize>,
    ) -> Result<ProcessHandle, CreateError> {
        if self.table.contains_name(name) {
            return Err(CreateError::DuplicateName(name.to_owned()));
        }
        let size = memory_size.unwrap_or(self.config.min_mem_per_proc);
        let burst = rand::thread_rng().gen_range(self.config.min_ins..=self.config.max_ins);
        let pid = self.table.allocate_id();
        let mut process = Process::new(pid, name, burst);
        self.memory.allocate(name, size).map_err(CreateError::Alloc)?;
        process.set_memory_size(size);
        process.set_status(Status::Ready);
        let handle = self.table.insert(process);
        self.scheduler.add_process(pid);
        Ok(handle)
    }

    /// The `screen -c` path: an explicit program of 1..=50 textual
    /// instructions.
    pub fn create_custom_process(
        &self,
        name: &str,
        memory_size: usize,
        instructions: &[String],
    ) -> Result<ProcessHandle, CreateError> {
        if instructions.is_empty() || instructions.len() > MAX_CUSTOM_INSTRUCTIONS {
            return Err(CreateError::InvalidInstructionCount(instructions.len()));
        }
        if self.table.contains_name(name) {
            return Err(CreateError::DuplicateName(name.to_owned()));
        }
        let program = instructions
            .iter()
            .map(|text| program::parse_instruction(text))
            .collect();
        let pid = self.table.allocate_id();
        let mut process = Process::with_program(pid, name, program);
        self.memory
            .allocate(name, memory_size)
            .map_err(CreateError::Alloc)?;
        process.set_memory_size(memory_size);
        process.set_status(Status::Ready);
        let handle = self.table.insert(process);
        self.scheduler.add_process(pid);
        Ok(handle)
    }

    pub fn find_process(&self, name: &str) -> Option<ProcessHandle> {
        self.table.by_name(name)
    }

    pub fn scheduler_status(&self) -> String {
        self.scheduler.status_report()
    }

    pub fn memory_snapshot(&self) -> MemorySnapshot {
        self.memory.snapshot()
    }

    /// Dumps the scheduler status to [`REPORT_FILE`] in the working
    /// directory.
    pub fn export_report(&self) -> io::Result<PathBuf> {
        let path = PathBuf::from(REPORT_FILE);
        fs::write(&path, self.scheduler_status())?;
        Ok(path)
    }

    /// Orderly teardown: spawner first, then the scheduler (which flushes
    /// process logs).
    pub fn shutdown(&self) {
        self.spawner.stop();
        self.scheduler.stop();
    }
}

impl Drop for Kernel {
    fn drop(&mut self) {
        self.shutdown();
    }
}
