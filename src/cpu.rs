use std::cell::RefCell;
use std::fs::File;
use std::rc::Rc;
use std::thread;
use std::time::Duration;

use log::{debug, info};
use serde::Deserialize;
use thiserror::Error;

use crate::backend::backend::Backend;
use crate::frontend::frontend::Frontend;
use crate::instructions::instructions::{Program, RegisterType, WordType};
use crate::memory_subsystem::memory_subsystem::MemorySubsystem;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct PerfCounters {
    pub cycle_cnt: u64,
    pub dispatch_cnt: u64,
    // cycles in which the head instruction found its pool full
    pub stall_cnt: u64,
    pub rejected_cnt: u64,
    pub completed_cnt: u64,
    // broadcasts that lost the destination register to a newer producer
    pub stale_write_cnt: u64,
    pub branch_cnt: u64,
    pub branch_taken_cnt: u64,
    pub memory_fault_cnt: u64,
}

impl PerfCounters {
    pub fn new() -> Self {
        Self::default()
    }
}

#[derive(Clone, Deserialize, Debug, Default)]
#[serde(default)]
pub(crate) struct Trace {
    pub dispatch: bool,
    pub execute: bool,
    pub broadcast: bool,
    pub redirect: bool,
    pub cycle: bool,
}

#[derive(Clone, Deserialize, Debug)]
#[serde(default)]
pub(crate) struct CPUConfig {
    // the number of architectural registers
    pub(crate) register_count: u16,
    // the size of the memory in machine words
    pub(crate) memory_size: u32,
    // the number of memory words included in a cycle report
    pub(crate) memory_window: u32,
    // the number of reservation stations per pool
    pub(crate) adder_rs_count: u16,
    pub(crate) nand_rs_count: u16,
    pub(crate) load_rs_count: u16,
    pub(crate) store_rs_count: u16,
    pub(crate) branch_rs_count: u16,
    // the number of cycles a station executes once its operands are ready
    pub(crate) add_latency: u8,
    pub(crate) nand_latency: u8,
    pub(crate) load_latency: u8,
    pub(crate) store_latency: u8,
    pub(crate) branch_latency: u8,
    // branch displacements are divided by this to get an instruction count
    pub(crate) instruction_width: WordType,
    // a run that needs more cycles than this is considered deadlocked
    pub(crate) max_cycles: u64,
    // the frequency of the CPU in Hz; 0 disables throttling
    pub(crate) frequency_hz: u64,
    pub(crate) initial_registers: Vec<WordType>,
    pub(crate) initial_memory: Vec<WordType>,
    // if processing of a single instruction should be traced (logged)
    pub(crate) trace: Trace,
}

impl Default for CPUConfig {
    fn default() -> Self {
        CPUConfig {
            register_count: 8,
            memory_size: 128,
            memory_window: 16,
            adder_rs_count: 3,
            nand_rs_count: 2,
            load_rs_count: 2,
            store_rs_count: 2,
            branch_rs_count: 1,
            add_latency: 2,
            nand_latency: 2,
            load_latency: 1,
            store_latency: 1,
            branch_latency: 1,
            instruction_width: 4,
            max_cycles: 100_000,
            frequency_hz: 0,
            initial_registers: Vec::new(),
            initial_memory: Vec::new(),
            trace: Trace::default(),
        }
    }
}

#[derive(Error, Debug)]
pub(crate) enum ConfigError {
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl CPUConfig {
    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if self.register_count == 0 {
            return Err(ConfigError::Invalid("register_count must be positive".to_string()));
        }
        if self.memory_size == 0 {
            return Err(ConfigError::Invalid("memory_size must be positive".to_string()));
        }
        if self.instruction_width <= 0 {
            return Err(ConfigError::Invalid("instruction_width must be positive".to_string()));
        }

        let rs_counts = [
            ("adder_rs_count", self.adder_rs_count),
            ("nand_rs_count", self.nand_rs_count),
            ("load_rs_count", self.load_rs_count),
            ("store_rs_count", self.store_rs_count),
            ("branch_rs_count", self.branch_rs_count),
        ];
        for (name, count) in rs_counts {
            if count == 0 {
                return Err(ConfigError::Invalid(format!("{} must be positive", name)));
            }
        }

        let latencies = [
            ("add_latency", self.add_latency),
            ("nand_latency", self.nand_latency),
            ("load_latency", self.load_latency),
            ("store_latency", self.store_latency),
            ("branch_latency", self.branch_latency),
        ];
        for (name, latency) in latencies {
            if latency == 0 {
                return Err(ConfigError::Invalid(format!("{} must be positive", name)));
            }
        }

        Ok(())
    }
}

pub(crate) fn load_cpu_config(file_path: &str) -> Result<CPUConfig, ConfigError> {
    let file = File::open(file_path)?;
    let config: CPUConfig = serde_yaml::from_reader(file)?;
    config.validate()?;
    Ok(config)
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub(crate) enum CpuError {
    #[error("no progress after {cycles} cycles; the program is deadlocked")]
    Deadlock { cycles: u64 },
}

/// The architectural state after a cycle, for reporting.
#[derive(Clone, Debug)]
pub(crate) struct CycleReport {
    pub(crate) cycle: u64,
    pub(crate) registers: Vec<WordType>,
    pub(crate) memory: Vec<WordType>,
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct RunSummary {
    pub(crate) cycles: u64,
    pub(crate) total_instructions: usize,
    pub(crate) completed_instructions: u64,
    pub(crate) rejected_instructions: u64,
    // not-yet-dispatched instructions discarded by taken branches
    pub(crate) skipped_instructions: u64,
    // Instruction Completion Percent
    pub(crate) icp: f64,
}

pub(crate) fn instruction_completion_percent(completed: u64, total: usize) -> f64 {
    if total == 0 {
        return 100.0;
    }
    completed as f64 / total as f64 * 100.0
}

pub(crate) struct CPU {
    pub(crate) backend: Backend,
    pub(crate) frontend: Rc<RefCell<Frontend>>,
    pub(crate) memory_subsystem: Rc<RefCell<MemorySubsystem>>,
    pub(crate) arch_reg_file: Rc<RefCell<ArgRegFile>>,
    pub(crate) perf_counters: Rc<RefCell<PerfCounters>>,
    cycle_period: Option<Duration>,
    max_cycles: u64,
    memory_window: usize,
    trace: Trace,
}

impl CPU {
    pub(crate) fn new(cpu_config: &CPUConfig) -> CPU {
        let perf_counters = Rc::new(RefCell::new(PerfCounters::new()));

        let memory_subsystem = Rc::new(RefCell::new(
            MemorySubsystem::new(cpu_config)));
        memory_subsystem.borrow_mut().init(&cpu_config.initial_memory);

        let arch_reg_file = Rc::new(RefCell::new(
            ArgRegFile::new(cpu_config.register_count)));
        arch_reg_file.borrow_mut().init(&cpu_config.initial_registers);

        let frontend = Rc::new(RefCell::new(Frontend::new(cpu_config)));

        let backend = Backend::new(
            cpu_config,
            Rc::clone(&frontend),
            Rc::clone(&memory_subsystem),
            Rc::clone(&arch_reg_file),
            Rc::clone(&perf_counters),
        );

        let cycle_period = match cpu_config.frequency_hz {
            0 => None,
            hz => Some(Duration::from_micros(1_000_000 / hz)),
        };

        CPU {
            backend,
            frontend,
            memory_subsystem,
            arch_reg_file,
            perf_counters,
            cycle_period,
            max_cycles: cpu_config.max_cycles,
            memory_window: cpu_config.memory_window as usize,
            trace: cpu_config.trace.clone(),
        }
    }

    fn is_done(&self) -> bool {
        self.frontend.borrow().is_empty() && self.backend.is_idle()
    }

    fn report(&self, cycle: u64) -> CycleReport {
        CycleReport {
            cycle,
            registers: self.arch_reg_file.borrow().values(),
            memory: self.memory_subsystem.borrow().window(self.memory_window).to_vec(),
        }
    }

    /// Runs the program until every instruction has been dispatched (or
    /// discarded) and every reservation station is idle. The observer sees the
    /// architectural state after each cycle.
    pub(crate) fn run<F>(&mut self, program: &Rc<Program>, mut observer: F) -> Result<RunSummary, CpuError>
    where
        F: FnMut(&CycleReport),
    {
        self.frontend.borrow_mut().init(program);
        self.backend.reset();
        *self.perf_counters.borrow_mut() = PerfCounters::new();

        let mut cycle = 0;
        while !self.is_done() {
            if cycle >= self.max_cycles {
                return Err(CpuError::Deadlock { cycles: cycle });
            }

            cycle += 1;
            self.perf_counters.borrow_mut().cycle_cnt = cycle;

            self.backend.do_cycle(cycle);

            if self.trace.cycle {
                let perf_counters = self.perf_counters.borrow();
                info!("[Cycles:{}][Dispatched={}][Stalled={}][Completed={}][Busy RS={}]",
                      perf_counters.cycle_cnt,
                      perf_counters.dispatch_cnt,
                      perf_counters.stall_cnt,
                      perf_counters.completed_cnt,
                      self.backend.busy_count());
            }

            observer(&self.report(cycle));

            if let Some(cycle_period) = self.cycle_period {
                thread::sleep(cycle_period);
            }
        }

        // an idle backend has no producers left
        let register_count = self.arch_reg_file.borrow().values().len();
        debug_assert!((0..register_count).all(|reg| self.backend.rat.is_ready(reg as RegisterType)));

        let perf_counters = self.perf_counters.borrow();
        debug!("Run finished: {:?}", *perf_counters);

        Ok(RunSummary {
            cycles: cycle,
            total_instructions: program.len(),
            completed_instructions: perf_counters.completed_cnt,
            rejected_instructions: perf_counters.rejected_cnt,
            skipped_instructions: self.frontend.borrow().skipped_cnt,
            icp: instruction_completion_percent(perf_counters.completed_cnt, program.len()),
        })
    }
}

struct ArgRegEntry {
    pub(crate) value: WordType,
}

pub struct ArgRegFile {
    entries: Vec<ArgRegEntry>,
}

impl ArgRegFile {
    pub(crate) fn new(register_count: u16) -> ArgRegFile {
        let mut array = Vec::with_capacity(register_count as usize);
        for _ in 0..register_count {
            array.push(ArgRegEntry { value: 0 });
        }

        ArgRegFile { entries: array }
    }

    pub(crate) fn init(&mut self, initial: &[WordType]) {
        for (entry, value) in self.entries.iter_mut().zip(initial) {
            entry.value = *value;
        }
    }

    pub fn get_value(&self, reg: RegisterType) -> WordType {
        self.entries[reg as usize].value
    }

    pub fn set_value(&mut self, reg: RegisterType, value: WordType) {
        self.entries[reg as usize].value = value;
    }

    pub fn values(&self) -> Vec<WordType> {
        self.entries.iter().map(|entry| entry.value).collect()
    }
}
