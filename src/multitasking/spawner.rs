//! The process spawner: a cooperative generator thread that creates a
//! process every `frequency` ticks and admits it to the scheduler when its
//! memory allocation succeeds. In evaluation mode it disables itself after
//! ten processes.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use rand::Rng;

use crate::memory::MemoryManager;

use super::process::{Process, Status};
use super::scheduler::Scheduler;
use super::table::ProcessTable;

/// Evaluation mode stops after this many spawned processes.
pub const EVALUATION_PROCESS_CAP: u32 = 10;

#[derive(Debug, Clone)]
pub struct SpawnerConfig {
    /// One process every `frequency` ticks.
    pub frequency: u64,
    pub min_ins: u32,
    pub max_ins: u32,
    /// Power-of-two bounds for the requested memory size.
    pub min_mem: usize,
    pub max_mem: usize,
    /// Tick length; also the condition-variable wait timeout.
    pub delay: Duration,
    pub evaluation_mode: bool,
}

struct SpawnerShared {
    enabled: Mutex<bool>,
    wake: Condvar,
}

pub struct Spawner {
    shared: Arc<SpawnerShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Spawner {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(SpawnerShared {
                enabled: Mutex::new(false),
                wake: Condvar::new(),
            }),
            thread: Mutex::new(None),
        }
    }

    pub fn is_enabled(&self) -> bool {
        *self.shared.enabled.lock().expect("spawner state poisoned")
    }

    /// Starts the generator thread. Returns false if it was already running.
    pub fn start(
        &self,
        config: SpawnerConfig,
        table: Arc<ProcessTable>,
        memory: Arc<MemoryManager>,
        scheduler: Arc<Scheduler>,
    ) -> bool {
        let mut thread = self.thread.lock().expect("spawner thread poisoned");
        if thread.as_ref().is_some_and(|t| !t.is_finished()) {
            return false;
        }
        *self.shared.enabled.lock().expect("spawner state poisoned") = true;
        let shared = Arc::clone(&self.shared);
        *thread = Some(
            thread::Builder::new()
                .name("spawner".to_owned())
                .spawn(move || spawn_loop(&shared, config, table, memory, scheduler))
                .expect("failed to spawn process generator"),
        );
        true
    }

    /// Disables the generator and joins it. Returns false if it was not
    /// running.
    pub fn stop(&self) -> bool {
        let handle = {
            let mut thread = self.thread.lock().expect("spawner thread poisoned");
            thread.take()
        };
        let Some(handle) = handle else { return false };
        let was_enabled = {
            let mut enabled = self.shared.enabled.lock().expect("spawner state poisoned");
            std::mem::replace(&mut *enabled, false)
        };
        self.shared.wake.notify_all();
        let _ = handle.join();
        was_enabled
    }
}

impl Default for Spawner {
    fn default() -> Self {
        Self::new()
    }
}

fn spawn_loop(
    shared: &SpawnerShared,
    config: SpawnerConfig,
    table: Arc<ProcessTable>,
    memory: Arc<MemoryManager>,
    scheduler: Arc<Scheduler>,
) {
    log::debug!("spawner running (every {} ticks)", config.frequency);
    let mut rng = rand::thread_rng();
    let mut cycle: u64 = 0;
    let mut created: u32 = 0;
    loop {
        {
            let enabled = shared.enabled.lock().expect("spawner state poisoned");
            let (enabled, _) = shared
                .wake
                .wait_timeout_while(enabled, config.delay, |enabled| *enabled)
                .expect("spawner state poisoned");
            if !*enabled {
                break;
            }
        }
        cycle += 1;
        if cycle % config.frequency != 0 {
            continue;
        }

        let pid = table.allocate_id();
        let name = format!("screen_{:02}", pid);
        let burst = rng.gen_range(config.min_ins..=config.max_ins);
        let mut process = Process::new(pid, name.clone(), burst);
        let size = random_process_memory(&mut rng, config.min_mem, config.max_mem);
        match memory.allocate(&name, size) {
            Ok(()) => {
                process.set_memory_size(size);
                process.set_status(Status::Ready);
            }
            Err(err) => {
                log::warn!("spawner: {} not admitted: {}", name, err);
                process.set_status(Status::Waiting);
            }
        }
        let admitted = process.status() == Status::Ready;
        table.insert(process);
        if admitted {
            scheduler.add_process(pid);
        }
        created += 1;
        log::debug!(
            "spawner: created {} (burst {}, {} bytes, {})",
            name,
            burst,
            size,
            if admitted { "admitted" } else { "waiting" }
        );

        if config.evaluation_mode && created >= EVALUATION_PROCESS_CAP {
            *shared.enabled.lock().expect("spawner state poisoned") = false;
            shared.wake.notify_all();
            break;
        }
    }
    log::debug!("spawner stopped after {} processes", created);
}

/// A uniformly random power of two in `[min, max]`, drawn by exponent.
/// The bounds are validated powers of two, so every request is well formed.
fn random_process_memory(rng: &mut impl Rng, min: usize, max: usize) -> usize {
    let low = min.trailing_zeros();
    let high = max.trailing_zeros();
    1usize << rng.gen_range(low..=high)
}
