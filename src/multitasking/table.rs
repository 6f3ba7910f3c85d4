//! The process arena. Owns every process ever created; everything else
//! (queues, cores, the shell) refers to them by [`Pid`] and borrows a slot
//! through its mutex for the duration of one operation.

use std::sync::{Arc, Mutex, MutexGuard};

use hashbrown::HashMap;

use super::process::Process;
use super::Pid;

pub type ProcessHandle = Arc<Mutex<Process>>;

pub struct ProcessTable {
    state: Mutex<TableState>,
}

struct TableState {
    /// Insertion order, for listings.
    processes: Vec<(Pid, ProcessHandle)>,
    by_name: HashMap<String, Pid>,
    next_id: Pid,
}

impl ProcessTable {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TableState {
                processes: Vec::new(),
                by_name: HashMap::new(),
                next_id: Pid::first(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, TableState> {
        self.state.lock().expect("process table poisoned")
    }

    /// Hands out the next monotonic id.
    pub fn allocate_id(&self) -> Pid {
        let mut st = self.state();
        let id = st.next_id;
        st.next_id = id.next();
        id
    }

    /// Registers a process under its own id and name.
    pub fn insert(&self, process: Process) -> ProcessHandle {
        let mut st = self.state();
        let id = process.id();
        let name = process.name().to_owned();
        let handle: ProcessHandle = Arc::new(Mutex::new(process));
        st.processes.push((id, Arc::clone(&handle)));
        st.by_name.insert(name, id);
        handle
    }

    pub fn get(&self, pid: Pid) -> Option<ProcessHandle> {
        let st = self.state();
        st.processes
            .iter()
            .find(|(id, _)| *id == pid)
            .map(|(_, handle)| Arc::clone(handle))
    }

    pub fn by_name(&self, name: &str) -> Option<ProcessHandle> {
        let st = self.state();
        let pid = *st.by_name.get(name)?;
        drop(st);
        self.get(pid)
    }

    pub fn contains_name(&self, name: &str) -> bool {
        self.state().by_name.contains_key(name)
    }

    /// All processes in creation order.
    pub fn handles(&self) -> Vec<(Pid, ProcessHandle)> {
        self.state()
            .processes
            .iter()
            .map(|(id, handle)| (*id, Arc::clone(handle)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.state().processes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_monotonic() {
        let table = ProcessTable::new();
        let a = table.allocate_id();
        let b = table.allocate_id();
        assert_eq!(a, Pid::first());
        assert_eq!(b, a.next());
    }

    #[test]
    fn lookup_by_id_and_name() {
        let table = ProcessTable::new();
        let pid = table.allocate_id();
        table.insert(Process::with_program(pid, "alpha", Vec::new()));
        assert!(table.contains_name("alpha"));
        assert!(!table.contains_name("beta"));
        let by_id = table.get(pid).unwrap();
        assert_eq!(by_id.lock().unwrap().name(), "alpha");
        let by_name = table.by_name("alpha").unwrap();
        assert_eq!(by_name.lock().unwrap().id(), pid);
        assert!(table.get(pid.next()).is_none());
    }
}
