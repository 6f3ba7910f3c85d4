//! `key=value` configuration for the kernel.
//!
//! Malformed lines and unparsable values are logged and skipped; a missing
//! required key refuses to boot. Cross-field rules (frame size divides total
//! memory, per-process bounds are powers of two) are validated at the end.

use std::fmt;
use std::fs;
use std::io;
use std::path::Path;

use crate::memory;

pub const DEFAULT_CONFIG_FILE: &str = "config.txt";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerKind {
    Fcfs,
    RoundRobin,
}

impl fmt::Display for SchedulerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedulerKind::Fcfs => write!(f, "FCFS"),
            SchedulerKind::RoundRobin => write!(f, "RR"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SystemConfig {
    pub num_cpu: usize,
    pub scheduler: SchedulerKind,
    /// Instructions per dispatch under RR. Unused by FCFS.
    pub quantum_cycles: u32,
    /// Spawner creates one process every this many ticks.
    pub batch_process_freq: u64,
    pub min_ins: u32,
    pub max_ins: u32,
    /// Milliseconds between instruction steps and dispatch passes.
    pub delay_per_exec: u64,
    pub max_overall_mem: usize,
    pub mem_per_frame: usize,
    pub min_mem_per_proc: usize,
    pub max_mem_per_proc: usize,
    pub is_evaluation_mode: bool,
}

#[derive(Debug)]
pub enum ConfigError {
    Io(io::Error),
    MissingKey(&'static str),
    InvalidValue { key: &'static str, reason: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(err) => write!(f, "cannot read config file: {}", err),
            ConfigError::MissingKey(key) => write!(f, "required key '{}' is missing", key),
            ConfigError::InvalidValue { key, reason } => {
                write!(f, "invalid value for '{}': {}", key, reason)
            }
        }
    }
}

impl From<io::Error> for ConfigError {
    fn from(err: io::Error) -> Self {
        ConfigError::Io(err)
    }
}

impl SystemConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let mut builder = Builder::default();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                log::warn!("config: skipping malformed line {:?}", line);
                continue;
            };
            if let Err(err) = builder.apply(key.trim(), value.trim()) {
                log::warn!("config: skipping key: {}", err);
            }
        }
        builder.finish()
    }

    /// One settings line per key, printed by the shell after `initialize`.
    pub fn describe(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("  Number of Cores: {}\n", self.num_cpu));
        out.push_str(&format!("  Scheduling Algorithm: {}\n", self.scheduler));
        if self.scheduler == SchedulerKind::RoundRobin {
            out.push_str(&format!("  Quantum Cycles: {}\n", self.quantum_cycles));
        }
        out.push_str(&format!(
            "  Batch Process Frequency: {}\n",
            self.batch_process_freq
        ));
        out.push_str(&format!("  Minimum Instructions: {}\n", self.min_ins));
        out.push_str(&format!("  Maximum Instructions: {}\n", self.max_ins));
        out.push_str(&format!("  Delays per Execution: {}\n", self.delay_per_exec));
        out.push_str(&format!(
            "  Max Overall Memory: {} bytes\n",
            self.max_overall_mem
        ));
        out.push_str(&format!("  Memory per Frame: {} bytes\n", self.mem_per_frame));
        out.push_str(&format!(
            "  Min Memory per Process: {} bytes\n",
            self.min_mem_per_proc
        ));
        out.push_str(&format!(
            "  Max Memory per Process: {} bytes\n",
            self.max_mem_per_proc
        ));
        out.push_str(&format!(
            "  Evaluation Mode: {}\n",
            self.is_evaluation_mode
        ));
        out
    }
}

#[derive(Debug, Default)]
struct Builder {
    num_cpu: Option<usize>,
    scheduler: Option<SchedulerKind>,
    quantum_cycles: Option<u32>,
    batch_process_freq: Option<u64>,
    min_ins: Option<u32>,
    max_ins: Option<u32>,
    delay_per_exec: Option<u64>,
    max_overall_mem: Option<usize>,
    mem_per_frame: Option<usize>,
    min_mem_per_proc: Option<usize>,
    max_mem_per_proc: Option<usize>,
    is_evaluation_mode: Option<bool>,
}

impl Builder {
    fn apply(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "num-cpu" => self.num_cpu = Some(parse("num-cpu", value)?),
            "scheduler" => {
                self.scheduler = Some(match value {
                    "FCFS" => SchedulerKind::Fcfs,
                    "RR" => SchedulerKind::RoundRobin,
                    other => {
                        return Err(ConfigError::InvalidValue {
                            key: "scheduler",
                            reason: format!("expected FCFS or RR, got {:?}", other),
                        })
                    }
                })
            }
            "quantum-cycles" => self.quantum_cycles = Some(parse("quantum-cycles", value)?),
            "batch-process-freq" => self.batch_process_freq = Some(parse("batch-process-freq", value)?),
            "min-ins" => self.min_ins = Some(parse("min-ins", value)?),
            "max-ins" => self.max_ins = Some(parse("max-ins", value)?),
            "delay-per-exec" => self.delay_per_exec = Some(parse("delay-per-exec", value)?),
            "max-overall-mem" => self.max_overall_mem = Some(parse("max-overall-mem", value)?),
            "mem-per-frame" => self.mem_per_frame = Some(parse("mem-per-frame", value)?),
            "min-mem-per-proc" => self.min_mem_per_proc = Some(parse("min-mem-per-proc", value)?),
            "max-mem-per-proc" => self.max_mem_per_proc = Some(parse("max-mem-per-proc", value)?),
            "is-evaluation-mode" => {
                self.is_evaluation_mode = Some(match value {
                    "true" => true,
                    "false" => false,
                    other => {
                        return Err(ConfigError::InvalidValue {
                            key: "is-evaluation-mode",
                            reason: format!("expected true or false, got {:?}", other),
                        })
                    }
                })
            }
            other => {
                log::warn!("config: unknown key {:?} ignored", other);
            }
        }
        Ok(())
    }

    fn finish(self) -> Result<SystemConfig, ConfigError> {
        let scheduler = self.scheduler.ok_or(ConfigError::MissingKey("scheduler"))?;
        let quantum_cycles = match (scheduler, self.quantum_cycles) {
            (SchedulerKind::RoundRobin, None) => {
                return Err(ConfigError::MissingKey("quantum-cycles"))
            }
            (_, q) => q.unwrap_or(1),
        };
        let config = SystemConfig {
            num_cpu: self.num_cpu.ok_or(ConfigError::MissingKey("num-cpu"))?,
            scheduler,
            quantum_cycles,
            batch_process_freq: self
                .batch_process_freq
                .ok_or(ConfigError::MissingKey("batch-process-freq"))?,
            min_ins: self.min_ins.ok_or(ConfigError::MissingKey("min-ins"))?,
            max_ins: self.max_ins.ok_or(ConfigError::MissingKey("max-ins"))?,
            delay_per_exec: self
                .delay_per_exec
                .ok_or(ConfigError::MissingKey("delay-per-exec"))?,
            max_overall_mem: self
                .max_overall_mem
                .ok_or(ConfigError::MissingKey("max-overall-mem"))?,
            mem_per_frame: self
                .mem_per_frame
                .ok_or(ConfigError::MissingKey("mem-per-frame"))?,
            min_mem_per_proc: self
                .min_mem_per_proc
                .ok_or(ConfigError::MissingKey("min-mem-per-proc"))?,
            max_mem_per_proc: self
                .max_mem_per_proc
                .ok_or(ConfigError::MissingKey("max-mem-per-proc"))?,
            is_evaluation_mode: self.is_evaluation_mode.unwrap_or(false),
        };
        validate(&config)?;
        Ok(config)
    }
}

fn parse<T: std::str::FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError>
where
    T::Err: fmt::Display,
{
    value.parse().map_err(|err| ConfigError::InvalidValue {
        key,
        reason: format!("{:?}: {}", value, err),
    })
}

fn validate(config: &SystemConfig) -> Result<(), ConfigError> {
    if config.num_cpu == 0 {
        return Err(invalid("num-cpu", "must be positive"));
    }
    if config.scheduler == SchedulerKind::RoundRobin && config.quantum_cycles == 0 {
        return Err(invalid("quantum-cycles", "must be positive"));
    }
    if config.batch_process_freq == 0 {
        return Err(invalid("batch-process-freq", "must be positive"));
    }
    if config.min_ins == 0 || config.min_ins > config.max_ins {
        return Err(invalid("min-ins", "must be positive and at most max-ins"));
    }
    if config.mem_per_frame == 0 || config.max_overall_mem <= config.mem_per_frame {
        return Err(invalid("max-overall-mem", "must exceed mem-per-frame"));
    }
    if config.max_overall_mem % config.mem_per_frame != 0 {
        return Err(invalid(
            "mem-per-frame",
            "must divide max-overall-mem evenly",
        ));
    }
    for (key, size) in [
        ("min-mem-per-proc", config.min_mem_per_proc),
        ("max-mem-per-proc", config.max_mem_per_proc),
    ] {
        if !memory::is_valid_process_memory(size) {
            return Err(invalid(key, "must be a power of 2 in [8, 65536]"));
        }
    }
    if config.min_mem_per_proc > config.max_mem_per_proc {
        return Err(invalid(
            "min-mem-per-proc",
            "must be at most max-mem-per-proc",
        ));
    }
    Ok(())
}

fn invalid(key: &'static str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key,
        reason: reason.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GOOD: &str = "\
num-cpu=4
scheduler=RR
quantum-cycles=5
batch-process-freq=1
min-ins=100
max-ins=100
delay-per-exec=10
max-overall-mem=16384
mem-per-frame=256
min-mem-per-proc=1024
max-mem-per-proc=4096
is-evaluation-mode=true
";

    #[test]
    fn parses_complete_config() {
        let config = SystemConfig::parse(GOOD).unwrap();
        assert_eq!(config.num_cpu, 4);
        assert_eq!(config.scheduler, SchedulerKind::RoundRobin);
        assert_eq!(config.quantum_cycles, 5);
        assert_eq!(config.batch_process_freq, 1);
        assert_eq!(config.max_overall_mem, 16384);
        assert!(config.is_evaluation_mode);
    }

    #[test]
    fn missing_required_key_is_refused() {
        let text = GOOD.replace("num-cpu=4\n", "");
        match SystemConfig::parse(&text) {
            Err(ConfigError::MissingKey("num-cpu")) => {}
            other => panic!("expected missing num-cpu, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn bad_value_is_skipped_then_reported_missing() {
        let text = GOOD.replace("num-cpu=4", "num-cpu=lots");
        assert!(matches!(
            SystemConfig::parse(&text),
            Err(ConfigError::MissingKey("num-cpu"))
        ));
    }

    #[test]
    fn rr_requires_quantum() {
        let text = GOOD.replace("quantum-cycles=5\n", "");
        assert!(matches!(
            SystemConfig::parse(&text),
            Err(ConfigError::MissingKey("quantum-cycles"))
        ));
    }

    #[test]
    fn fcfs_does_not_require_quantum() {
        let text = GOOD
            .replace("scheduler=RR", "scheduler=FCFS")
            .replace("quantum-cycles=5\n", "");
        let config = SystemConfig::parse(&text).unwrap();
        assert_eq!(config.scheduler, SchedulerKind::Fcfs);
    }

    #[test]
    fn frame_size_must_divide_total() {
        let text = GOOD.replace("mem-per-frame=256", "mem-per-frame=300");
        assert!(matches!(
            SystemConfig::parse(&text),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn per_process_bounds_must_be_powers_of_two() {
        let text = GOOD.replace("min-mem-per-proc=1024", "min-mem-per-proc=1000");
        assert!(matches!(
            SystemConfig::parse(&text),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let text = format!("{}color-scheme=dark\n", GOOD);
        assert!(SystemConfig::parse(&text).is_ok());
    }
}
