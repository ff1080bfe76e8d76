use std::path::PathBuf;
use std::process::exit;
use std::rc::Rc;

use log::error;
use structopt::StructOpt;

use crate::cpu::{load_cpu_config, CPUConfig, CycleReport, CPU};
use crate::loader::loader::load;

mod backend;
mod cpu;
mod frontend;
mod instructions;
mod loader;
mod memory_subsystem;


#[derive(StructOpt, Debug)]
#[structopt(name = "Tomasulo Simulator")]
struct Opt {
    /// Path of the program to run
    #[structopt(parse(from_os_str))]
    file: PathBuf,

    /// Sets a custom config file
    #[structopt(short, long, parse(from_os_str))]
    config: Option<PathBuf>,

    /// Only print the final summary
    #[structopt(short, long)]
    quiet: bool,
}

fn print_report(report: &CycleReport) {
    let registers: Vec<String> = report.registers
        .iter()
        .enumerate()
        .map(|(reg, value)| format!("R{}={}", reg, value))
        .collect();
    println!("[Cycle {}] {}", report.cycle, registers.join(" "));
    println!("[Cycle {}] Memory[0..{}]: {:?}", report.cycle, report.memory.len(), report.memory);
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let opt = Opt::from_args();

    let cpu_config = match &opt.config {
        None => CPUConfig::default(),
        Some(path) => {
            let cpu_config_path = path.to_string_lossy();
            match load_cpu_config(&cpu_config_path) {
                Ok(config) => config,
                Err(err) => {
                    error!("Failed to load {}. Cause: {}", cpu_config_path, err);
                    exit(1);
                }
            }
        }
    };

    let path = opt.file.to_string_lossy();
    println!("Loading {}", path);
    let program = match load(&path) {
        Ok(p) => Rc::new(p),
        Err(err) => {
            error!("Loading program '{}' failed.", path);
            eprintln!("{}", err);
            exit(1);
        }
    };

    let mut cpu = CPU::new(&cpu_config);
    let quiet = opt.quiet;
    let summary = match cpu.run(&program, |report| {
        if !quiet {
            print_report(report);
        }
    }) {
        Ok(summary) => summary,
        Err(err) => {
            error!("{}", err);
            exit(1);
        }
    };

    println!("Program complete!");
    println!("Cycles: {}", summary.cycles);
    println!("Instructions: {} total, {} completed, {} rejected, {} skipped by branches",
             summary.total_instructions,
             summary.completed_instructions,
             summary.rejected_instructions,
             summary.skipped_instructions);
    println!("Instruction Completion Percent: {:.2}%", summary.icp);
}
