//! The interactive command line in front of the kernel.

use std::io::{self, BufRead, Write};
use std::path::Path;

use crate::config::{SystemConfig, DEFAULT_CONFIG_FILE};
use crate::kernel::Kernel;
use crate::memory::{self, MemorySnapshot};
use crate::multitasking::ProcessHandle;

const BANNER: &str = r"
   _____  _____  ____  _____  ______  _______     __
  / ____|/ ____|/ __ \|  __ \|  ____|/ ____\ \   / /
 | |    | (___ | |  | | |__) | |__  | (___  \ \_/ /
 | |     \___ \| |  | |  ___/|  __|  \___ \  \   /
 | |____ ____) | |__| | |    | |____ ____) |  | |
  \_____|_____/ \____/|_|    |______|_____/   |_|
";

#[derive(PartialEq)]
enum Flow {
    Continue,
    Exit,
}

pub struct Shell {
    kernel: Option<Kernel>,
}

impl Shell {
    pub fn new() -> Self {
        Self { kernel: None }
    }

    pub fn run(&mut self) {
        print_banner();
        let stdin = io::stdin();
        let mut line = String::new();
        loop {
            print!("Enter a command: ");
            let _ = io::stdout().flush();
            line.clear();
            match stdin.lock().read_line(&mut line) {
                Ok(0) => break, // EOF
                Ok(_) => {}
                Err(err) => {
                    log::warn!("stdin read failed: {}", err);
                    break;
                }
            }
            if self.dispatch(line.trim()) == Flow::Exit {
                break;
            }
        }
    }

    fn dispatch(&mut self, line: &str) -> Flow {
        let mut tokens = line.split_whitespace();
        let command = tokens.next().unwrap_or("");
        match command {
            "" => {}
            "initialize" => self.initialize(tokens.next()),
            "scheduler-start" => self.scheduler_start(),
            "scheduler-stop" => self.scheduler_stop(),
            "screen" => self.screen(line),
            "process-smi" => match &self.kernel {
                Some(kernel) => print!("{}", render_process_smi(&kernel.memory_snapshot())),
                None => println!("Memory manager not initialized. Run 'initialize' first."),
            },
            "vmstat" => match &self.kernel {
                Some(kernel) => print!("{}", render_vmstat(&kernel.memory_snapshot())),
                None => println!("Memory manager not initialized. Run 'initialize' first."),
            },
            "report-util" => match &self.kernel {
                Some(kernel) => match kernel.export_report() {
                    Ok(path) => println!("Report generated at: {}", path.display()),
                    Err(err) => println!("Error: could not create report file: {}", err),
                },
                None => println!("Scheduler is not running"),
            },
            "clear" => {
                clear_screen();
                print_banner();
            }
            "exit" => {
                if let Some(kernel) = self.kernel.take() {
                    if kernel.stop_spawner() {
                        println!("Automatic process creation stopped");
                    }
                    kernel.shutdown();
                    println!("Scheduler stopped and destroyed");
                }
                return Flow::Exit;
            }
            _ => println!("Unknown command."),
        }
        Flow::Continue
    }

    fn initialize(&mut self, config_file: Option<&str>) {
        if self.kernel.is_some() {
            println!("Already initialized.");
            return;
        }
        let path = config_file.unwrap_or(DEFAULT_CONFIG_FILE);
        let config = match SystemConfig::load(path) {
            Ok(config) => config,
            Err(err) => {
                println!("Error: {}", err);
                return;
            }
        };
        println!("System initialized with configuration:");
        print!("{}", config.describe());
        match Kernel::boot(config) {
            Ok(kernel) => {
                println!("Memory manager initialized");
                println!("{} scheduler initialized", kernel.config().scheduler);
                self.kernel = Some(kernel);
            }
            Err(err) => println!("Error: could not boot: {}", err),
        }
    }

    fn scheduler_start(&mut self) {
        let Some(kernel) = &self.kernel else {
            println!("Error: Scheduler not initialized. Run 'initialize' first.");
            return;
        };
        if kernel.start_scheduler() {
            println!("Scheduler started");
        }
        if kernel.start_spawner() {
            println!("Automatic process creation started");
            if kernel.config().is_evaluation_mode {
                println!("Evaluation mode: Will create 10 processes");
            }
        } else {
            println!("Automatic creation already running");
        }
    }

    fn scheduler_stop(&mut self) {
        let Some(kernel) = &self.kernel else {
            println!("Error: Scheduler not initialized. Run 'initialize' first.");
            return;
        };
        if kernel.stop_spawner() {
            println!("Automatic process creation stopped");
        } else {
            println!("Automatic creation not running");
        }
    }

    fn screen(&mut self, line: &str) {
        let mut tokens = line.split_whitespace();
        let _screen = tokens.next();
        let option = tokens.next().unwrap_or("");
        match option {
            "-s" => {
                let Some(name) = tokens.next() else {
                    return print_screen_usage();
                };
                let memory_size = match tokens.next() {
                    Some(text) => match text.parse::<usize>() {
                        Ok(size) if memory::is_valid_process_memory(size) => Some(size),
                        Ok(_) => {
                            println!(
                                "Invalid memory allocation. Memory size must be a power of 2 \
                                 between 8 and 65536 bytes."
                            );
                            return;
                        }
                        Err(_) => {
                            println!("Invalid memory size format.");
                            return;
                        }
                    },
                    None => None,
                };
                self.create_screen(name, memory_size, None);
            }
            "-c" => {
                let (Some(name), Some(memory_text)) = (tokens.next(), tokens.next()) else {
                    println!(
                        "Invalid command format. Use: screen -c <process_name> <memory_size> \
                         \"<instructions>\""
                    );
                    return;
                };
                let Ok(memory_size) = memory_text.parse::<usize>() else {
                    println!("Invalid memory size format.");
                    return;
                };
                if !memory::is_valid_process_memory(memory_size) {
                    println!(
                        "Invalid memory allocation. Memory size must be a power of 2 between 8 \
                         and 65536 bytes."
                    );
                    return;
                }
                let Some(instructions) = quoted_section(line) else {
                    println!(
                        "Invalid command format. Use: screen -c <process_name> <memory_size> \
                         \"<instructions>\""
                    );
                    return;
                };
                let instructions: Vec<String> = instructions
                    .split(';')
                    .map(str::trim)
                    .filter(|text| !text.is_empty())
                    .map(str::to_owned)
                    .collect();
                if instructions.is_empty() || instructions.len() > 50 {
                    println!("Invalid command. Instruction count must be between 1 and 50.");
                    return;
                }
                self.create_screen(name, Some(memory_size), Some(instructions));
            }
            "-r" => {
                let Some(name) = tokens.next() else {
                    return print_screen_usage();
                };
                self.resume_screen(name);
            }
            "-ls" => match &self.kernel {
                Some(kernel) => print!("{}", kernel.scheduler_status()),
                None => println!("Scheduler is not running"),
            },
            _ => print_screen_usage(),
        }
    }

    fn create_screen(
        &mut self,
        name: &str,
        memory_size: Option<usize>,
        instructions: Option<Vec<String>>,
    ) {
        let Some(kernel) = &self.kernel else {
            println!("Error: Scheduler not initialized. Run 'initialize' first.");
            return;
        };
        let result = match &instructions {
            Some(instructions) => {
                kernel.create_custom_process(name, memory_size.unwrap_or(0), instructions)
            }
            None => kernel.create_process(name, memory_size),
        };
        match result {
            Ok(handle) => {
                let process = handle.lock().expect("process poisoned");
                match &instructions {
                    Some(instructions) => println!(
                        "Process '{}' created with {} bytes of memory and {} custom instructions.",
                        name,
                        process.memory_size(),
                        instructions.len()
                    ),
                    None => println!(
                        "Process '{}' created with {} bytes of memory.",
                        name,
                        process.memory_size()
                    ),
                }
                drop(process);
                if kernel.start_scheduler() {
                    println!("Scheduler started");
                }
            }
            Err(err) => println!("Error: {}", err),
        }
    }

    fn resume_screen(&mut self, name: &str) {
        let Some(kernel) = &self.kernel else {
            println!("Process {} not found.", name);
            return;
        };
        let Some(handle) = kernel.find_process(name) else {
            println!("Process {} not found.", name);
            return;
        };
        let violation = {
            let process = handle.lock().expect("process poisoned");
            process.violation().cloned()
        };
        if let Some(violation) = violation {
            println!(
                "Process {} shut down due to memory access violation error that occurred at {}. \
                 0x{:X} invalid.",
                name, violation.timestamp, violation.address
            );
            return;
        }
        self.enter_screen(&handle);
    }

    /// The per-process sub-shell behind `screen -r`.
    fn enter_screen(&self, handle: &ProcessHandle) {
        draw_screen(handle);
        let stdin = io::stdin();
        let mut line = String::new();
        loop {
            print!(">>");
            let _ = io::stdout().flush();
            line.clear();
            match stdin.lock().read_line(&mut line) {
                Ok(0) => break,
                Ok(_) => {}
                Err(_) => break,
            }
            match line.trim() {
                "exit" => {
                    clear_screen();
                    print_banner();
                    break;
                }
                "process-smi" => {
                    let process = handle.lock().expect("process poisoned");
                    print!("\n{}", process.render_logs());
                }
                "report-util" => {
                    let process = handle.lock().expect("process poisoned");
                    match process.export_logs(Path::new(".")) {
                        Ok(_) => println!("Report generated as: {}.txt", process.name()),
                        Err(err) => println!("Error: could not write report: {}", err),
                    }
                }
                "execute" => {
                    let Some(kernel) = &self.kernel else { continue };
                    let mut process = handle.lock().expect("process poisoned");
                    if process.is_finished() {
                        println!("Process has finished execution");
                    } else {
                        process.execute_instruction(-1, kernel.memory());
                        println!("Executed one instruction");
                    }
                }
                _ => println!("Unknown sub-command."),
            }
        }
    }
}

impl Default for Shell {
    fn default() -> Self {
        Self::new()
    }
}

fn print_banner() {
    println!("{}", BANNER);
    println!("\x1b[1;32mHello, Welcome to CSOPESY commandline!\x1b[0m");
    println!("\x1b[1;33mType 'exit' to quit, 'clear' to clear the screen\x1b[0m");
}

fn clear_screen() {
    print!("\x1b[2J\x1b[H");
    let _ = io::stdout().flush();
}

fn print_screen_usage() {
    println!("Usage:");
    println!("  screen -s <name> [<memory>]                    create screen");
    println!("  screen -c <name> <memory> \"<instructions>\"     create custom screen");
    println!("  screen -r <name>                               resume screen");
    println!("  screen -ls                                     list running/finished processes");
}

fn draw_screen(handle: &ProcessHandle) {
    let process = handle.lock().expect("process poisoned");
    clear_screen();
    println!("==============================\t\tSCREEN\t\t========================\n");
    println!("Process name:\t\t\t{}", process.name());
    println!(
        "Instruction line:\t\t{} / {}",
        process.current_burst(),
        process.total_burst()
    );
    println!("Created at:\t\t\t{}\n", process.created());
    println!("================================================================================");
    println!("Type 'exit' to return to main menu");
    println!("Type 'process-smi' to view logs");
    println!("Type 'report-util' to export detailed report");
    println!("Type 'execute' to single-step one instruction");
}

/// The text between the first and last double quote of the line.
fn quoted_section(line: &str) -> Option<&str> {
    let start = line.find('"')?;
    let end = line.rfind('"')?;
    if start < end {
        Some(&line[start + 1..end])
    } else {
        None
    }
}

fn render_process_smi(snapshot: &MemorySnapshot) -> String {
    let mut out = String::new();
    out.push_str("-------------------------------------------\n");
    out.push_str("| PROCESS-SMI V01.00 Driver Version: 01.00|\n");
    out.push_str("-------------------------------------------\n");
    let cpu_util = if snapshot.total_ticks > 0 {
        snapshot.active_ticks * 100 / snapshot.total_ticks
    } else {
        0
    };
    out.push_str(&format!("CPU-Util: {}%\n", cpu_util));
    out.push_str(&format!(
        "Memory Usage: {} bytes/ {} bytes\n",
        snapshot.used_memory, snapshot.total_memory
    ));
    let memory_util = if snapshot.total_memory > 0 {
        snapshot.used_memory * 100 / snapshot.total_memory
    } else {
        0
    };
    out.push_str(&format!("Memory Util: {}%\n\n", memory_util));
    out.push_str("===========================================\n");
    out.push_str("Running processes and memory usage:\n");
    out.push_str("-------------------------------------------\n");
    for (name, bytes) in &snapshot.per_process {
        out.push_str(&format!("{} {} bytes\n", name, bytes));
    }
    out.push_str("-------------------------------------------\n");
    out
}

fn render_vmstat(snapshot: &MemorySnapshot) -> String {
    let mut out = String::new();
    out.push_str(
        "=========================================================================\n",
    );
    out.push_str("Memory Statistics:\n");
    out.push_str(&format!("Total Memory: {} bytes\n", snapshot.total_memory));
    out.push_str(&format!("Used Memory: {} bytes\n", snapshot.used_memory));
    out.push_str(&format!("Free Memory: {} bytes\n", snapshot.free_memory));
    out.push_str(&format!("Idle CPU Ticks: {}\n", snapshot.idle_ticks));
    out.push_str(&format!("Active CPU Ticks: {}\n", snapshot.active_ticks));
    out.push_str(&format!("Total CPU Ticks: {}\n", snapshot.total_ticks));
    out.push_str(&format!("Num Paged In: {}\n", snapshot.pages_in));
    out.push_str(&format!("Num Paged Out: {}\n", snapshot.pages_out));
    out.push_str(
        "=========================================================================\n",
    );
    out
}
