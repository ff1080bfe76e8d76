use std::cell::RefCell;
use std::rc::Rc;

use log::{info, warn};

use crate::backend::execution_unit::{BranchOutcome, CompletedResult};
use crate::backend::register_alias_table::RAT;
use crate::backend::reservation_station::{PoolKind, RSTable};
use crate::cpu::{ArgRegFile, CPUConfig, PerfCounters, Trace};
use crate::frontend::frontend::Frontend;
use crate::instructions::instructions::{mnemonic, Opcode};
use crate::memory_subsystem::memory_subsystem::MemorySubsystem;

fn new_pools(cpu_config: &CPUConfig) -> Vec<RSTable> {
    PoolKind::ALL
        .iter()
        .map(|&kind| match kind {
            PoolKind::Adder => RSTable::new(kind, cpu_config.adder_rs_count, cpu_config.add_latency),
            PoolKind::Nand => RSTable::new(kind, cpu_config.nand_rs_count, cpu_config.nand_latency),
            PoolKind::Load => RSTable::new(kind, cpu_config.load_rs_count, cpu_config.load_latency),
            PoolKind::Store => RSTable::new(kind, cpu_config.store_rs_count, cpu_config.store_latency),
            PoolKind::Branch => RSTable::new(kind, cpu_config.branch_rs_count, cpu_config.branch_latency),
        })
        .collect()
}

/// Dispatches one instruction per cycle into the reservation stations,
/// executes the stations and broadcasts their results on the common data bus.
pub(crate) struct Backend {
    cpu_config: CPUConfig,
    frontend: Rc<RefCell<Frontend>>,
    arch_reg_file: Rc<RefCell<ArgRegFile>>,
    memory_subsystem: Rc<RefCell<MemorySubsystem>>,
    // indexed by PoolKind, in declaration order
    pools: Vec<RSTable>,
    pub(crate) rat: RAT,
    trace: Trace,
    cdb_broadcast_buffer: Vec<CompletedResult>,
    // sequence number handed to the next dispatched instruction
    dispatch_seq: u64,
    perf_counters: Rc<RefCell<PerfCounters>>,
}

impl Backend {
    pub(crate) fn new(cpu_config: &CPUConfig,
                      frontend: Rc<RefCell<Frontend>>,
                      memory_subsystem: Rc<RefCell<MemorySubsystem>>,
                      arch_reg_file: Rc<RefCell<ArgRegFile>>,
                      perf_counters: Rc<RefCell<PerfCounters>>) -> Backend {
        Backend {
            cpu_config: cpu_config.clone(),
            frontend,
            arch_reg_file,
            memory_subsystem,
            pools: new_pools(cpu_config),
            rat: RAT::new(cpu_config.register_count),
            trace: cpu_config.trace.clone(),
            cdb_broadcast_buffer: Vec::new(),
            dispatch_seq: 0,
            perf_counters,
        }
    }

    /// Returns every reservation station to idle and every register to ready.
    pub(crate) fn reset(&mut self) {
        self.pools = new_pools(&self.cpu_config);
        self.rat = RAT::new(self.cpu_config.register_count);
        self.cdb_broadcast_buffer.clear();
        self.dispatch_seq = 0;
    }

    pub(crate) fn pool(&self, kind: PoolKind) -> &RSTable {
        &self.pools[kind as usize]
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.pools.iter().all(|pool| pool.busy_count() == 0)
    }

    pub(crate) fn busy_count(&self) -> usize {
        self.pools.iter().map(|pool| pool.busy_count()).sum()
    }

    pub(crate) fn do_cycle(&mut self, cycle: u64) {
        debug_assert!(self.cdb_broadcast_buffer.is_empty());
        self.cycle_dispatch(cycle);
        self.cycle_execute(cycle);
        self.cdb_broadcast();
        self.cycle_release();
        self.cycle_redirect();
        debug_assert!(self.cdb_broadcast_buffer.is_empty());
    }

    // Dispatches the instruction at the head of the stream, if its pool has room.
    fn cycle_dispatch(&mut self, cycle: u64) {
        let mut frontend = self.frontend.borrow_mut();
        let mut perf_counters = self.perf_counters.borrow_mut();

        let (pc, instr) = match frontend.peek() {
            Some(head) => head,
            None => return,
        };

        let decoded = match instr.decode(self.cpu_config.register_count) {
            Ok(decoded) => decoded,
            Err(err) => {
                warn!("Rejected [{}]: {}", instr, err);
                frontend.pop();
                perf_counters.rejected_cnt += 1;
                return;
            }
        };

        // memory accesses execute in program order with respect to conflicting accesses
        let older_memory_ops = match decoded.opcode {
            Opcode::LOAD => self.pool(PoolKind::Store).busy_tags(),
            Opcode::STORE => {
                let mut older = self.pool(PoolKind::Load).busy_tags();
                older.extend(self.pool(PoolKind::Store).busy_tags());
                older
            }
            Opcode::ADD | Opcode::SUB | Opcode::NAND | Opcode::BEQ => Vec::new(),
        };

        let pool = &mut self.pools[PoolKind::for_opcode(decoded.opcode) as usize];
        if !pool.is_available() {
            // structural stall; the instruction stays at the head
            perf_counters.stall_cnt += 1;
            return;
        }

        let arch_reg_file = self.arch_reg_file.borrow();
        match pool.allocate(&decoded, pc, self.dispatch_seq, cycle, &mut self.rat, &arch_reg_file) {
            Ok(tag) => {
                self.dispatch_seq += 1;
                pool.wait_for(tag.index, older_memory_ops);
                if self.trace.dispatch {
                    info!("Dispatched [{}] to {}", instr, pool.get(tag.index));
                }
                frontend.pop();
                perf_counters.dispatch_cnt += 1;
            }
            Err(err) => {
                warn!("Stalled [{}]: {}", instr, err);
                perf_counters.stall_cnt += 1;
            }
        }
    }

    // Every pool advances exactly once per cycle, in declaration order.
    fn cycle_execute(&mut self, cycle: u64) {
        let mut memory_subsystem = self.memory_subsystem.borrow_mut();

        for pool in self.pools.iter_mut() {
            let completed = pool.step(cycle, &mut memory_subsystem);
            self.cdb_broadcast_buffer.extend(completed);
        }
    }

    fn cdb_broadcast(&mut self) {
        let mut arch_reg_file = self.arch_reg_file.borrow_mut();
        let mut perf_counters = self.perf_counters.borrow_mut();

        for result in &self.cdb_broadcast_buffer {
            if self.trace.execute {
                info!("Executed {} {}", result.tag, mnemonic(result.opcode));
            }

            if result.memory_fault {
                perf_counters.memory_fault_cnt += 1;
            }

            let value = match result.value {
                Some(value) => value,
                None => continue,
            };

            if let Some(dest) = result.dest {
                // only the most recent producer of the register may write it
                if self.rat.clear(dest, result.tag) {
                    arch_reg_file.set_value(dest, value);
                    if self.trace.broadcast {
                        info!("CDB {} = {} -> R{}", result.tag, value, dest);
                    }
                } else {
                    perf_counters.stale_write_cnt += 1;
                    if self.trace.broadcast {
                        info!("CDB {} = {} (R{} renamed to {:?})", result.tag, value, dest, self.rat.current_tag(dest));
                    }
                }
            }

            for pool in self.pools.iter_mut() {
                pool.wake(result.tag, value);
            }
        }
    }

    fn cycle_release(&mut self) {
        let mut perf_counters = self.perf_counters.borrow_mut();

        for result in &self.cdb_broadcast_buffer {
            self.pools[result.tag.pool as usize].release(result.tag.index);
            if matches!(result.opcode, Opcode::LOAD | Opcode::STORE) {
                for pool in self.pools.iter_mut() {
                    pool.retire(result.tag);
                }
            }
            perf_counters.completed_cnt += 1;
        }
    }

    // A taken branch redirects unless an older taken branch has already
    // redirected since it was dispatched.
    fn cycle_redirect(&mut self) {
        let mut frontend = self.frontend.borrow_mut();
        let mut perf_counters = self.perf_counters.borrow_mut();

        let mut branches: Vec<BranchOutcome> = self.cdb_broadcast_buffer
            .drain(..)
            .filter_map(|result| result.branch)
            .collect();
        branches.sort_by_key(|branch| branch.seq);

        // set once a branch redirects this cycle; every later entry is younger
        let mut redirected = false;
        for branch in branches {
            perf_counters.branch_cnt += 1;
            if !branch.taken {
                continue;
            }
            perf_counters.branch_taken_cnt += 1;

            if branch.squashed || redirected {
                if self.trace.redirect {
                    info!("Ignoring taken branch at {}: an older taken branch already redirected", branch.pc);
                }
                continue;
            }

            frontend.redirect(branch.pc, branch.offset);
            self.pools[PoolKind::Branch as usize].squash_younger(branch.seq);
            redirected = true;
        }
    }

    #[cfg(test)]
    pub(crate) fn busy_tags(&self) -> Vec<crate::backend::reservation_station::Tag> {
        self.pools.iter().flat_map(|pool| pool.busy_tags()).collect()
    }
}
