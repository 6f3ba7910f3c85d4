//! A user process ("screen"): identity, lifecycle status, its instruction
//! program, the variable table, the loop stack, a sleep countdown, the log
//! buffer and the permanent memory-violation flag.

use std::fmt;
use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::memory::MemoryManager;
use crate::time;

use super::program::{self, Instruction, Operand, PrintTemplate};
use super::Pid;

/// The symbol table fills the first 64 bytes of the address space:
/// 32 two-byte cells.
pub const MAX_VARIABLES: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Created,
    Ready,
    Running,
    Finished,
    Waiting,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Status::Created => "CREATED",
            Status::Ready => "READY",
            Status::Running => "RUNNING",
            Status::Finished => "FINISHED",
            Status::Waiting => "WAITING",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone)]
pub struct LogEntry {
    pub timestamp: String,
    pub core: i32,
    pub message: String,
}

impl LogEntry {
    pub fn render(&self) -> String {
        format!("({})\tCore: {}\t{}", self.timestamp, self.core, self.message)
    }
}

/// Permanent record of an out-of-bounds memory access.
#[derive(Debug, Clone)]
pub struct Violation {
    pub timestamp: String,
    pub address: usize,
}

#[derive(Debug, Clone)]
struct LoopFrame {
    iterations: u32,
    current: u32,
    start: usize,
    depth: usize,
}

#[derive(Debug)]
pub struct Process {
    id: Pid,
    name: String,
    created: String,
    status: Status,
    program: Vec<Instruction>,
    pc: usize,
    current_burst: u32,
    total_burst: u32,
    memory_size: usize,
    variables: Vec<(String, u16)>,
    loops: Vec<LoopFrame>,
    sleep_remaining: u8,
    logs: Vec<LogEntry>,
    violation: Option<Violation>,
}

impl Process {
    /// Creates a process with a freshly generated pseudorandom program of
    /// `total_burst` instructions.
    pub fn new(id: Pid, name: impl Into<String>, total_burst: u32) -> Self {
        let name = name.into();
        let program = program::generate(&name, total_burst, &mut rand::thread_rng());
        // generated programs keep their emitted length as the total burst;
        // loop iterations beyond it are cut off by the scheduler's burst cap
        let total_burst = program.len() as u32;
        Self::build(id, name, program, total_burst)
    }

    /// Creates a process running an explicit program (the `screen -c` path).
    /// Its total burst is the program's unrolled dispatch cost, so it
    /// finishes exactly when the program does.
    pub fn with_program(id: Pid, name: impl Into<String>, program: Vec<Instruction>) -> Self {
        let total_burst = program::dispatch_cost(&program);
        Self::build(id, name.into(), program, total_burst)
    }

    fn build(id: Pid, name: String, program: Vec<Instruction>, total_burst: u32) -> Self {
        Self {
            id,
            name,
            created: time::timestamp(),
            status: Status::Created,
            program,
            pc: 0,
            current_burst: 0,
            total_burst,
            memory_size: 0,
            variables: Vec::new(),
            loops: Vec::new(),
            sleep_remaining: 0,
            logs: Vec::new(),
            violation: None,
        }
    }

    pub fn id(&self) -> Pid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn created(&self) -> &str {
        &self.created
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn set_status(&mut self, status: Status) {
        self.status = status;
    }

    pub fn current_burst(&self) -> u32 {
        self.current_burst
    }

    pub fn total_burst(&self) -> u32 {
        self.total_burst
    }

    pub fn memory_size(&self) -> usize {
        self.memory_size
    }

    pub fn set_memory_size(&mut self, size: usize) {
        self.memory_size = size;
    }

    pub fn logs(&self) -> &[LogEntry] {
        &self.logs
    }

    pub fn violation(&self) -> Option<&Violation> {
        self.violation.as_ref()
    }

    pub fn has_violation(&self) -> bool {
        self.violation.is_some()
    }

    /// Program counter past the end with no pending sleep.
    pub fn is_finished(&self) -> bool {
        self.pc >= self.program.len() && self.sleep_remaining == 0
    }

    pub fn variable(&self, name: &str) -> Option<u16> {
        self.variables
            .iter()
            .find(|(var, _)| var == name)
            .map(|(_, value)| *value)
    }

    /// Executes one scheduling tick on `core`.
    ///
    /// A pending sleep consumes the tick (countdown decrements, no program
    /// counter movement, no burst). Otherwise the instruction under the
    /// program counter runs; every such step appends a log entry and counts
    /// one burst, except loop-back ENDLOOPs.
    pub fn execute_instruction(&mut self, core: i32, memory: &MemoryManager) {
        if self.sleep_remaining > 0 {
            self.sleep_remaining -= 1;
            let message = format!("SLEEP: {} ticks remaining", self.sleep_remaining);
            self.log(core, message);
            return;
        }
        if self.pc >= self.program.len() {
            return;
        }

        let instruction = self.program[self.pc].clone();
        let mut counts = true;
        let message = match instruction {
            Instruction::Print(template) => {
                self.pc += 1;
                format!("PRINT: {}", self.render_template(&template))
            }
            Instruction::Declare { name, value } => {
                self.pc += 1;
                let value = self.eval(&value);
                if self.variable(&name).is_some() {
                    format!("REDECLARE: {}", name)
                } else if self.variables.len() >= MAX_VARIABLES {
                    format!("DECLARE: symbol table full, ignoring {}", name)
                } else {
                    self.variables.push((name.clone(), value));
                    let index = self.variables.len() - 1;
                    self.mirror_symbol(index, value, memory);
                    format!("DECLARE: {} = {}", name, value)
                }
            }
            Instruction::Add { dst, a, b } => {
                self.pc += 1;
                let (a, b) = (self.eval(&a), self.eval(&b));
                if self.bind(&dst, a.wrapping_add(b), memory) {
                    format!("ADD: {} = {} + {}", dst, a, b)
                } else {
                    format!("ADD: symbol table full, ignoring {}", dst)
                }
            }
            Instruction::Subtract { dst, a, b } => {
                self.pc += 1;
                let (a, b) = (self.eval(&a), self.eval(&b));
                if self.bind(&dst, a.saturating_sub(b), memory) {
                    format!("SUBTRACT: {} = {} - {}", dst, a, b)
                } else {
                    format!("SUBTRACT: symbol table full, ignoring {}", dst)
                }
            }
            Instruction::Sleep { ticks } => {
                self.pc += 1;
                self.sleep_remaining = ticks;
                if ticks > 0 {
                    format!("SLEEP: {} ticks started", ticks)
                } else {
                    "SLEEP: Zero ticks - no op".to_owned()
                }
            }
            Instruction::For { iterations } => {
                let depth = self.loops.len() + 1;
                if depth > program::MAX_LOOP_DEPTH {
                    self.pc += 1;
                    "FOR loop skipped (max depth exceeded)".to_owned()
                } else {
                    let start = self.pc + 1;
                    self.loops.push(LoopFrame {
                        iterations,
                        current: 1,
                        start,
                        depth,
                    });
                    self.pc = start;
                    format!("[D{}] FOR started ({} iterations)", depth, iterations)
                }
            }
            Instruction::EndLoop => match self.loops.last_mut() {
                None => {
                    self.pc += 1;
                    "ERROR: ENDLOOP without matching FOR".to_owned()
                }
                Some(frame) => {
                    frame.current += 1;
                    if frame.current <= frame.iterations {
                        self.pc = frame.start;
                        counts = false;
                        format!(
                            "[D{}] Iteration {}/{}",
                            frame.depth, frame.current, frame.iterations
                        )
                    } else {
                        let depth = frame.depth;
                        self.loops.pop();
                        self.pc += 1;
                        format!("[D{}] FOR completed", depth)
                    }
                }
            },
            Instruction::Read { var, address } => {
                self.pc += 1;
                match memory.read(&self.name, address) {
                    Ok(value) => {
                        if self.bind(&var, value, memory) {
                            format!("READ: {} = {} from 0x{:x}", var, value, address)
                        } else {
                            format!("READ: symbol table full, ignoring {}", var)
                        }
                    }
                    Err(_) => {
                        self.raise_violation(address);
                        format!("memory access violation at 0x{:x}", address)
                    }
                }
            }
            Instruction::Write { address, value } => {
                self.pc += 1;
                let value = self.eval(&value);
                match memory.write(&self.name, address, value) {
                    Ok(()) => format!("WRITE: 0x{:x} = {}", address, value),
                    Err(_) => {
                        self.raise_violation(address);
                        format!("memory access violation at 0x{:x}", address)
                    }
                }
            }
        };

        self.log(core, message);
        if counts {
            self.current_burst += 1;
        }
    }

    /// Writes the process log file: header, one rendered line per entry,
    /// and the progress trailer.
    pub fn export_logs(&self, dir: &Path) -> io::Result<PathBuf> {
        let path = dir.join(format!("{}.txt", self.name));
        let mut file = File::create(&path)?;
        write!(file, "{}", self.render_logs())?;
        Ok(path)
    }

    pub fn render_logs(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("Process name: {}\n", self.name));
        out.push_str(&format!("ID: {}\n", self.id));
        out.push_str("Logs:\n");
        for entry in &self.logs {
            out.push_str(&entry.render());
            out.push('\n');
        }
        out.push('\n');
        out.push_str(&format!("Current instruction line: {}\n", self.current_burst));
        out.push_str(&format!("Lines of code: {}\n", self.total_burst));
        if self.current_burst >= self.total_burst {
            out.push_str("Finished!\n");
        }
        out
    }

    fn eval(&self, operand: &Operand) -> u16 {
        match operand {
            Operand::Literal(value) => *value,
            Operand::Var(name) => self.variable(name).unwrap_or(0),
        }
    }

    fn render_template(&self, template: &PrintTemplate) -> String {
        match template {
            PrintTemplate::Literal(text) => text.clone(),
            PrintTemplate::Concat { literal, var } => {
                format!("{}{}", literal, self.variable(var).unwrap_or(0))
            }
        }
    }

    /// Assigns `value` to `dst`, appending a first write at the end of the
    /// table. Returns false (and leaves everything untouched) when the table
    /// is full and `dst` does not exist.
    fn bind(&mut self, dst: &str, value: u16, memory: &MemoryManager) -> bool {
        if let Some(index) = self.variables.iter().position(|(name, _)| name == dst) {
            self.variables[index].1 = value;
            self.mirror_symbol(index, value, memory);
            true
        } else if self.variables.len() >= MAX_VARIABLES {
            false
        } else {
            self.variables.push((dst.to_owned(), value));
            let index = self.variables.len() - 1;
            self.mirror_symbol(index, value, memory);
            true
        }
    }

    /// Writes a symbol-table cell through the memory manager at twice the
    /// variable's index. Out-of-quota results are ignored; only program
    /// READ/WRITE instructions raise violations.
    fn mirror_symbol(&self, index: usize, value: u16, memory: &MemoryManager) {
        let _ = memory.write(&self.name, 2 * index, value);
    }

    fn raise_violation(&mut self, address: usize) {
        if self.violation.is_none() {
            log::warn!("{}: memory access violation at 0x{:x}", self.name, address);
            self.violation = Some(Violation {
                timestamp: time::timestamp(),
                address,
            });
        }
    }

    fn log(&mut self, core: i32, message: String) {
        self.logs.push(LogEntry {
            timestamp: time::timestamp(),
            core,
            message,
        });
    }
}
