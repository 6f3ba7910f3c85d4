//! Demand-paged memory manager.
//!
//! Every process gets a private virtual address space backed by fixed-size
//! pages. Physical memory is a fixed vector of frames sized
//! `total_memory / frame_size`; a page becomes resident on first access
//! (page fault), and when no frame is free the oldest resident page in FIFO
//! order is evicted to the backing store.
//!
//! One manager-wide mutex serializes every public call, including the fault
//! path. Callers must never hold the scheduler mutex when entering.

mod backing_store;

pub use backing_store::BackingStore;

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

use hashbrown::HashMap;

pub const MIN_PROCESS_MEMORY: usize = 8;
pub const MAX_PROCESS_MEMORY: usize = 65536;

/// Allocation sizes must be powers of two in `[8, 65536]`.
pub fn is_valid_process_memory(size: usize) -> bool {
    (MIN_PROCESS_MEMORY..=MAX_PROCESS_MEMORY).contains(&size) && size.is_power_of_two()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    InvalidSize(usize),
    AlreadyAllocated,
    OutOfMemory { requested: usize, available: usize },
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocError::InvalidSize(size) => write!(
                f,
                "invalid memory size {} (must be a power of 2 in [{}, {}])",
                size, MIN_PROCESS_MEMORY, MAX_PROCESS_MEMORY
            ),
            AllocError::AlreadyAllocated => write!(f, "process already has memory"),
            AllocError::OutOfMemory {
                requested,
                available,
            } => write!(
                f,
                "out of memory: requested {} bytes, {} available",
                requested, available
            ),
        }
    }
}

/// Returned by [`MemoryManager::read`] / [`MemoryManager::write`] for an
/// address outside the process's allocated space. The interpreter turns this
/// into the process's permanent memory-violation flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessViolation {
    pub address: usize,
}

impl fmt::Display for AccessViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid virtual address 0x{:x}", self.address)
    }
}

#[derive(Debug, Clone)]
pub struct MemorySnapshot {
    pub total_memory: usize,
    pub used_memory: usize,
    pub free_memory: usize,
    pub total_frames: usize,
    pub used_frames: usize,
    /// `(process name, allocated bytes)`, sorted by name.
    pub per_process: Vec<(String, usize)>,
    pub pages_in: u64,
    pub pages_out: u64,
    pub page_faults: u64,
    pub idle_ticks: u64,
    pub active_ticks: u64,
    pub total_ticks: u64,
}

#[derive(Debug)]
struct Frame {
    occupied: bool,
    process: String,
    page: usize,
    data: Vec<u16>,
}

impl Frame {
    fn empty(words: usize) -> Self {
        Self {
            occupied: false,
            process: String::new(),
            page: usize::MAX,
            data: vec![0; words],
        }
    }

    fn clear(&mut self) {
        self.occupied = false;
        self.process.clear();
        self.page = usize::MAX;
        self.data.iter_mut().for_each(|word| *word = 0);
    }
}

#[derive(Debug)]
struct Page {
    resident: bool,
    frame: Option<usize>,
    /// Page contents while non-resident. Zeroed after a page-out; the
    /// authoritative copy then lives in the backing store.
    data: Vec<u16>,
    /// Whether this page has ever been written to the backing store. Pages
    /// that never left memory must not pick up stale records from an earlier
    /// same-named process.
    swapped: bool,
}

impl Page {
    fn new(words: usize) -> Self {
        Self {
            resident: false,
            frame: None,
            data: vec![0; words],
            swapped: false,
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    pages_in: u64,
    pages_out: u64,
    page_faults: u64,
    idle_ticks: u64,
    active_ticks: u64,
    total_ticks: u64,
}

#[derive(Debug)]
struct State {
    frames: Vec<Frame>,
    pages: HashMap<String, Vec<Page>>,
    /// Allocated byte counts; the page tables round up to whole pages but
    /// accesses are bounded by the requested size.
    quotas: HashMap<String, usize>,
    /// Resident pages in page-in order; the front is the next victim.
    fifo: VecDeque<(String, usize)>,
    counters: Counters,
}

pub struct MemoryManager {
    total_memory: usize,
    page_size: usize,
    store: BackingStore,
    state: Mutex<State>,
}

impl MemoryManager {
    /// Builds the frame table and truncates the backing store at the default
    /// path. Page size equals frame size.
    pub fn new(total_memory: usize, frame_size: usize) -> io::Result<Self> {
        Self::with_store(
            total_memory,
            frame_size,
            PathBuf::from(backing_store::DEFAULT_PATH),
        )
    }

    pub fn with_store(
        total_memory: usize,
        frame_size: usize,
        store_path: impl Into<PathBuf>,
    ) -> io::Result<Self> {
        assert!(frame_size >= 2, "frame size must hold at least one word");
        let num_frames = total_memory / frame_size;
        let words = frame_size / 2;
        let store = BackingStore::create(store_path)?;
        log::debug!(
            "memory manager: {} bytes, {} frames of {} bytes, store {:?}",
            total_memory,
            num_frames,
            frame_size,
            store.path()
        );
        Ok(Self {
            total_memory,
            page_size: frame_size,
            store,
            state: Mutex::new(State {
                frames: (0..num_frames).map(|_| Frame::empty(words)).collect(),
                pages: HashMap::new(),
                quotas: HashMap::new(),
                fifo: VecDeque::new(),
                counters: Counters::default(),
            }),
        })
    }

    pub fn total_memory(&self) -> usize {
        self.total_memory
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    fn words_per_page(&self) -> usize {
        self.page_size / 2
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().expect("memory manager state poisoned")
    }

    /// Creates the process's page table: `ceil(size / page_size)` zeroed,
    /// non-resident pages. Frames are only claimed on first access, so the
    /// admission check is against frame-backed bytes, allowing demand-paged
    /// overcommit while requests that cannot currently be backed fail to the
    /// caller's WAITING path.
    pub fn allocate(&self, process: &str, size: usize) -> Result<(), AllocError> {
        if !is_valid_process_memory(size) {
            return Err(AllocError::InvalidSize(size));
        }
        let mut st = self.state();
        if st.pages.contains_key(process) {
            return Err(AllocError::AlreadyAllocated);
        }
        let resident = st.frames.iter().filter(|f| f.occupied).count() * self.page_size;
        if resident + size > self.total_memory {
            return Err(AllocError::OutOfMemory {
                requested: size,
                available: self.total_memory - resident,
            });
        }
        let count = (size + self.page_size - 1) / self.page_size;
        let words = self.words_per_page();
        st.pages.insert(
            process.to_owned(),
            (0..count).map(|_| Page::new(words)).collect(),
        );
        st.quotas.insert(process.to_owned(), size);
        log::debug!("allocated {} bytes ({} pages) for {}", size, count, process);
        Ok(())
    }

    /// Pages out every resident page of the process, frees its frames, drops
    /// its FIFO entries (preserving the relative order of the rest) and
    /// removes the page table. No-op for unknown processes.
    pub fn deallocate(&self, process: &str) {
        let mut st = self.state();
        if !st.pages.contains_key(process) {
            return;
        }
        let resident: Vec<usize> = st
            .frames
            .iter()
            .filter(|f| f.occupied && f.process == process)
            .map(|f| f.page)
            .collect();
        for page in resident {
            st.page_out(&self.store, process, page);
        }
        st.fifo.retain(|(name, _)| name != process);
        st.pages.remove(process);
        st.quotas.remove(process);
        log::debug!("deallocated memory of {}", process);
    }

    /// 16-bit word load. Faults the page in if needed; yields 0 when the
    /// fault cannot be serviced.
    pub fn read(&self, process: &str, address: usize) -> Result<u16, AccessViolation> {
        let mut st = self.state();
        let (page_no, offset) = self.resolve(&st, process, address)?;
        if !st.pages[process][page_no].resident {
            log::trace!("page fault: {} read {:#x} (page {})", process, address, page_no);
            if !st.service_fault(&self.store, self.words_per_page(), process, page_no) {
                return Ok(0);
            }
        }
        match st.pages[process][page_no].frame {
            Some(frame) => Ok(st.frames[frame].data[offset]),
            None => Ok(0),
        }
    }

    /// 16-bit word store. The write lands in the frame and in the page's
    /// saved buffer, so a later eviction carries the latest value. Dropped
    /// when the fault cannot be serviced.
    pub fn write(&self, process: &str, address: usize, value: u16) -> Result<(), AccessViolation> {
        let mut st = self.state();
        let (page_no, offset) = self.resolve(&st, process, address)?;
        if !st.pages[process][page_no].resident {
            log::trace!(
                "page fault: {} write {:#x} (page {})",
                process,
                address,
                page_no
            );
            if !st.service_fault(&self.store, self.words_per_page(), process, page_no) {
                return Ok(());
            }
        }
        if let Some(frame) = st.pages[process][page_no].frame {
            st.frames[frame].data[offset] = value;
            if let Some(page) = st.pages.get_mut(process).and_then(|p| p.get_mut(page_no)) {
                page.data[offset] = value;
            }
        }
        Ok(())
    }

    /// CPU-tick accounting, driven by the RR dispatcher on every pass.
    pub fn tick(&self, is_active: bool) {
        let mut st = self.state();
        st.counters.total_ticks += 1;
        if is_active {
            st.counters.active_ticks += 1;
        } else {
            st.counters.idle_ticks += 1;
        }
    }

    pub fn snapshot(&self) -> MemorySnapshot {
        let st = self.state();
        let mut per_process: Vec<(String, usize)> = st
            .pages
            .iter()
            .map(|(name, pages)| (name.clone(), pages.len() * self.page_size))
            .collect();
        per_process.sort();
        let used_memory: usize = per_process.iter().map(|(_, size)| size).sum();
        MemorySnapshot {
            total_memory: self.total_memory,
            used_memory,
            free_memory: self.total_memory.saturating_sub(used_memory),
            total_frames: st.frames.len(),
            used_frames: st.frames.iter().filter(|f| f.occupied).count(),
            per_process,
            pages_in: st.counters.pages_in,
            pages_out: st.counters.pages_out,
            page_faults: st.counters.page_faults,
            idle_ticks: st.counters.idle_ticks,
            active_ticks: st.counters.active_ticks,
            total_ticks: st.counters.total_ticks,
        }
    }

    /// Number of resident pages over all page tables. Always equals the
    /// occupied-frame count and the FIFO queue length.
    pub fn resident_pages(&self) -> usize {
        let st = self.state();
        st.pages
            .values()
            .flat_map(|pages| pages.iter())
            .filter(|page| page.resident)
            .count()
    }

    /// The FIFO victim queue, front first.
    pub fn fifo_queue(&self) -> Vec<(String, usize)> {
        self.state().fifo.iter().cloned().collect()
    }

    /// Maps a virtual address to `(page number, word offset)`, rejecting
    /// addresses outside the process's allocation.
    fn resolve(
        &self,
        st: &State,
        process: &str,
        address: usize,
    ) -> Result<(usize, usize), AccessViolation> {
        let Some(quota) = st.quotas.get(process) else {
            return Err(AccessViolation { address });
        };
        if address >= *quota {
            return Err(AccessViolation { address });
        }
        Ok((address / self.page_size, (address % self.page_size) / 2))
    }
}

impl State {
    /// Brings `(process, page_no)` into a frame, evicting the FIFO victim
    /// when no frame is free. Returns false when the fault cannot be
    /// serviced at all.
    fn service_fault(
        &mut self,
        store: &BackingStore,
        words_per_page: usize,
        process: &str,
        page_no: usize,
    ) -> bool {
        self.counters.page_faults += 1;
        match self.pages.get(process).and_then(|p| p.get(page_no)) {
            Some(page) if page.resident => return true,
            Some(_) => {}
            None => return false,
        }
        let frame = match self.frames.iter().position(|f| !f.occupied) {
            Some(free) => free,
            None => {
                let Some((victim_process, victim_page)) = self.fifo.pop_front() else {
                    return false;
                };
                let Some(frame) = self.frames.iter().position(|f| {
                    f.occupied && f.process == victim_process && f.page == victim_page
                }) else {
                    return false;
                };
                self.page_out(store, &victim_process, victim_page);
                frame
            }
        };
        self.page_in(store, words_per_page, process, page_no, frame);
        true
    }

    /// Writes the page's current frame contents to the backing store, frees
    /// the frame and zeroes the in-memory buffer.
    fn page_out(&mut self, store: &BackingStore, process: &str, page_no: usize) {
        let Some(page) = self.pages.get_mut(process).and_then(|p| p.get_mut(page_no)) else {
            return;
        };
        if !page.resident {
            return;
        }
        if let Some(frame) = page.frame {
            page.data.copy_from_slice(&self.frames[frame].data);
            if let Err(err) = store.append(process, page_no, &page.data) {
                log::warn!("backing store write failed for {}:{}: {}", process, page_no, err);
            }
            self.frames[frame].clear();
        }
        page.resident = false;
        page.frame = None;
        page.swapped = true;
        page.data.iter_mut().for_each(|word| *word = 0);
        self.counters.pages_out += 1;
        log::trace!("paged out {}:{}", process, page_no);
    }

    /// Loads the page from the backing store (last record wins) or zeroes,
    /// copies it into `frame` and appends it to the FIFO queue.
    fn page_in(
        &mut self,
        store: &BackingStore,
        words_per_page: usize,
        process: &str,
        page_no: usize,
        frame: usize,
    ) {
        let Some(page) = self.pages.get_mut(process).and_then(|p| p.get_mut(page_no)) else {
            return;
        };
        if page.swapped {
            match store.lookup(process, page_no, words_per_page) {
                Ok(Some(words)) => page.data = words,
                Ok(None) => {}
                Err(err) => {
                    log::warn!("backing store read failed for {}:{}: {}", process, page_no, err)
                }
            }
        }
        page.resident = true;
        page.frame = Some(frame);
        let data = page.data.clone();
        let slot = &mut self.frames[frame];
        slot.occupied = true;
        slot.process = process.to_owned();
        slot.page = page_no;
        slot.data = data;
        self.fifo.push_back((process.to_owned(), page_no));
        self.counters.pages_in += 1;
        log::trace!("paged in {}:{} -> frame {}", process, page_no, frame);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(total: usize, frame: usize) -> (tempfile::TempDir, MemoryManager) {
        let dir = tempfile::tempdir().unwrap();
        let mm = MemoryManager::with_store(total, frame, dir.path().join("store.txt")).unwrap();
        (dir, mm)
    }

    fn assert_residency_invariant(mm: &MemoryManager) {
        let snapshot = mm.snapshot();
        assert_eq!(mm.resident_pages(), snapshot.used_frames);
        assert_eq!(mm.resident_pages(), mm.fifo_queue().len());
    }

    #[test]
    fn allocate_rejects_invalid_sizes() {
        let (_dir, mm) = manager(1024, 32);
        assert_eq!(mm.allocate("p", 7), Err(AllocError::InvalidSize(7)));
        assert_eq!(mm.allocate("p", 4), Err(AllocError::InvalidSize(4)));
        assert_eq!(mm.allocate("p", 48), Err(AllocError::InvalidSize(48)));
        assert_eq!(
            mm.allocate("p", 131072),
            Err(AllocError::InvalidSize(131072))
        );
        assert!(mm.allocate("p", 64).is_ok());
        assert_eq!(mm.allocate("p", 64), Err(AllocError::AlreadyAllocated));
    }

    #[test]
    fn allocation_is_rejected_under_frame_pressure() {
        let (_dir, mm) = manager(64, 32);
        mm.allocate("p1", 64).unwrap();
        // make both pages resident; every frame is now claimed
        mm.write("p1", 0, 1).unwrap();
        mm.write("p1", 32, 1).unwrap();
        assert!(matches!(
            mm.allocate("p2", 64),
            Err(AllocError::OutOfMemory { .. })
        ));
    }

    #[test]
    fn reads_of_untouched_memory_are_zero() {
        let (_dir, mm) = manager(256, 32);
        mm.allocate("p", 64).unwrap();
        for address in (0..64).step_by(2) {
            assert_eq!(mm.read("p", address).unwrap(), 0);
        }
        assert_residency_invariant(&mm);
    }

    #[test]
    fn write_read_round_trip() {
        let (_dir, mm) = manager(256, 32);
        mm.allocate("p", 64).unwrap();
        mm.write("p", 0, 0x1234).unwrap();
        mm.write("p", 62, 0xbeef).unwrap();
        assert_eq!(mm.read("p", 0).unwrap(), 0x1234);
        assert_eq!(mm.read("p", 62).unwrap(), 0xbeef);
    }

    #[test]
    fn out_of_range_address_is_a_violation() {
        let (_dir, mm) = manager(256, 32);
        mm.allocate("p", 16).unwrap();
        // the boundary is the requested byte count, not the page-rounded size
        assert_eq!(mm.read("p", 16), Err(AccessViolation { address: 16 }));
        assert_eq!(mm.read("p", 14).unwrap(), 0);
        assert_eq!(
            mm.read("p", 0x1000),
            Err(AccessViolation { address: 0x1000 })
        );
        assert_eq!(
            mm.write("p", 0x1000, 42),
            Err(AccessViolation { address: 0x1000 })
        );
        assert_eq!(
            mm.read("unknown", 0),
            Err(AccessViolation { address: 0 })
        );
    }

    #[test]
    fn fifo_eviction_preserves_page_contents() {
        // 2 frames; two 2-page processes compete for them
        let (_dir, mm) = manager(64, 32);
        mm.allocate("p1", 64).unwrap();
        mm.allocate("p2", 64).unwrap();
        for address in (0..64).step_by(2) {
            mm.write("p1", address, 0xaaaa).unwrap();
        }
        for address in (0..64).step_by(2) {
            mm.write("p2", address, 0xbbbb).unwrap();
        }
        assert_residency_invariant(&mm);
        // p1 is fully evicted; reading it back faults through the store
        assert_eq!(mm.read("p1", 0).unwrap(), 0xaaaa);
        let fifo = mm.fifo_queue();
        assert_eq!(fifo.last(), Some(&("p1".to_owned(), 0)));
        assert!(fifo[..fifo.len() - 1].iter().all(|(name, _)| name == "p2"));
        assert_residency_invariant(&mm);
        let snapshot = mm.snapshot();
        assert!(snapshot.page_faults >= 5);
        assert!(snapshot.pages_out >= 3);
        assert!(snapshot.pages_in >= 5);
    }

    #[test]
    fn eviction_round_trips_latest_write() {
        let (_dir, mm) = manager(32, 32);
        mm.allocate("p1", 32).unwrap();
        mm.allocate("p2", 32).unwrap();
        mm.write("p1", 0, 0xaaaa).unwrap();
        mm.write("p2", 0, 1).unwrap(); // evicts p1:0 (first record)
        assert_eq!(mm.read("p1", 0).unwrap(), 0xaaaa); // evicts p2:0
        mm.write("p1", 0, 0xcccc).unwrap();
        mm.write("p2", 0, 2).unwrap(); // evicts p1:0 again (second record)
        // the last record must win; first-match would resurrect 0xaaaa
        assert_eq!(mm.read("p1", 0).unwrap(), 0xcccc);
    }

    #[test]
    fn deallocate_frees_frames_and_filters_fifo() {
        let (_dir, mm) = manager(128, 32);
        mm.allocate("p1", 32).unwrap();
        mm.allocate("p2", 64).unwrap();
        mm.write("p2", 0, 1).unwrap();
        mm.write("p1", 0, 2).unwrap();
        mm.write("p2", 32, 3).unwrap();
        assert_eq!(mm.fifo_queue().len(), 3);
        mm.deallocate("p2");
        // relative order of the survivors is preserved
        assert_eq!(mm.fifo_queue(), vec![("p1".to_owned(), 0)]);
        assert_residency_invariant(&mm);
        let snapshot = mm.snapshot();
        assert_eq!(snapshot.per_process, vec![("p1".to_owned(), 32)]);
        assert_eq!(snapshot.pages_out, 2);
    }

    #[test]
    fn reallocation_sees_zeroed_memory() {
        let (_dir, mm) = manager(64, 32);
        mm.allocate("p", 64).unwrap();
        mm.write("p", 0, 77).unwrap();
        mm.deallocate("p"); // leaves a record for p:0 in the store
        mm.allocate("p", 64).unwrap();
        for address in (0..64).step_by(2) {
            assert_eq!(mm.read("p", address).unwrap(), 0);
        }
    }

    #[test]
    fn tick_accounting_is_monotonic() {
        let (_dir, mm) = manager(64, 32);
        mm.tick(true);
        mm.tick(false);
        mm.tick(true);
        let snapshot = mm.snapshot();
        assert_eq!(snapshot.total_ticks, 3);
        assert_eq!(snapshot.active_ticks, 2);
        assert_eq!(snapshot.idle_ticks, 1);
    }

    #[test]
    fn snapshot_reports_usage() {
        let (_dir, mm) = manager(256, 32);
        mm.allocate("b", 64).unwrap();
        mm.allocate("a", 32).unwrap();
        let snapshot = mm.snapshot();
        assert_eq!(snapshot.total_memory, 256);
        assert_eq!(snapshot.used_memory, 96);
        assert_eq!(snapshot.free_memory, 160);
        assert_eq!(snapshot.total_frames, 8);
        assert_eq!(
            snapshot.per_process,
            vec![("a".to_owned(), 32), ("b".to_owned(), 64)]
        );
    }
}
