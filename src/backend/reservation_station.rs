use std::fmt;
use std::fmt::Display;

use thiserror::Error;

use crate::backend::execution_unit::{execute, CompletedResult};
use crate::backend::register_alias_table::RAT;
use crate::cpu::ArgRegFile;
use crate::instructions::instructions::{mnemonic, DecodedInstr, Opcode, Operand, RegisterType, WordType};
use crate::memory_subsystem::memory_subsystem::MemorySubsystem;

/// The functional unit classes. The declaration order is the order in which
/// pools are stepped and their completions broadcast.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash, PartialOrd, Ord)]
pub(crate) enum PoolKind {
    Adder,
    Nand,
    Load,
    Store,
    Branch,
}

impl PoolKind {
    pub(crate) const ALL: [PoolKind; 5] = [PoolKind::Adder, PoolKind::Nand, PoolKind::Load, PoolKind::Store, PoolKind::Branch];

    pub(crate) fn for_opcode(opcode: Opcode) -> PoolKind {
        match opcode {
            Opcode::ADD | Opcode::SUB => PoolKind::Adder,
            Opcode::NAND => PoolKind::Nand,
            Opcode::LOAD => PoolKind::Load,
            Opcode::STORE => PoolKind::Store,
            Opcode::BEQ => PoolKind::Branch,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            PoolKind::Adder => "Add",
            PoolKind::Nand => "Nand",
            PoolKind::Load => "Load",
            PoolKind::Store => "Store",
            PoolKind::Branch => "Beq",
        }
    }
}

/// Identifies the reservation station that will produce a value.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub(crate) struct Tag {
    pub(crate) pool: PoolKind,
    pub(crate) index: u16,
}

impl Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.pool.name(), self.index)
    }
}

/// A source operand of a reservation station: either the value (V) or the
/// tag of the station that will produce it (Q), never both.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum RSOperand {
    Value(WordType),
    Tag(Tag),
    Unused,
}

impl RSOperand {
    pub(crate) fn is_ready(&self) -> bool {
        !matches!(self, RSOperand::Tag(_))
    }

    pub(crate) fn get_value(&self) -> WordType {
        match self {
            RSOperand::Value(value) => *value,
            _ => panic!("Operand is not a value but {:?}", self),
        }
    }

    fn wake(&mut self, tag: Tag, value: WordType) {
        if *self == RSOperand::Tag(tag) {
            *self = RSOperand::Value(value);
        }
    }
}

impl Display for RSOperand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RSOperand::Value(value) => write!(f, "{}", value),
            RSOperand::Tag(tag) => write!(f, "<{}>", tag),
            RSOperand::Unused => write!(f, "_"),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum RSState {
    IDLE,
    BUSY,
    // finished executing; waiting to be released by the broadcast
    COMPLETED,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BackendError {
    #[error("no free reservation station in the {0:?} pool")]
    StationUnavailable(PoolKind),
}

// A single reservation station
#[derive(Debug, Clone)]
pub(crate) struct RS {
    pub(crate) tag: Tag,
    pub(crate) state: RSState,
    pub(crate) opcode: Opcode,
    pub(crate) j: RSOperand,
    pub(crate) k: RSOperand,
    // base register of a LOAD/STORE
    pub(crate) base: RSOperand,
    pub(crate) offset: WordType,
    // the effective address; known once the base is resolved
    pub(crate) address: Option<WordType>,
    pub(crate) dest: Option<RegisterType>,
    // program index of the instruction
    pub(crate) pc: usize,
    // dispatch order; lower is older
    pub(crate) seq: u64,
    // dispatched down the path of an older taken branch that has already redirected
    pub(crate) squashed: bool,
    pub(crate) cycles_left: u8,
    pub(crate) allocated_cycle: u64,
    // older LOAD/STORE stations that must release before this one may execute
    pub(crate) mem_deps: Vec<Tag>,
}

impl RS {
    fn new(tag: Tag) -> Self {
        Self {
            tag,
            state: RSState::IDLE,
            opcode: Opcode::ADD,
            j: RSOperand::Unused,
            k: RSOperand::Unused,
            base: RSOperand::Unused,
            offset: 0,
            address: None,
            dest: None,
            pc: 0,
            seq: 0,
            squashed: false,
            cycles_left: 0,
            allocated_cycle: 0,
            mem_deps: Vec::new(),
        }
    }

    fn reset(&mut self) {
        *self = RS::new(self.tag);
    }

    pub(crate) fn is_busy(&self) -> bool {
        self.state != RSState::IDLE
    }

    /// True when no operand is waiting on a tag and no older memory access
    /// is still in flight.
    pub(crate) fn is_ready(&self) -> bool {
        self.j.is_ready() && self.k.is_ready() && self.base.is_ready() && self.mem_deps.is_empty()
    }

    fn resolve_address(&mut self) {
        if self.address.is_none() {
            if let RSOperand::Value(base) = self.base {
                self.address = Some(self.offset.wrapping_add(base));
            }
        }
    }

    fn wake(&mut self, tag: Tag, value: WordType) {
        self.j.wake(tag, value);
        self.k.wake(tag, value);
        self.base.wake(tag, value);
        self.resolve_address();
    }
}

impl Display for RS {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} j={} k={}", self.tag, mnemonic(self.opcode), self.j, self.k)?;

        if let Some(dest) = self.dest {
            write!(f, " dest=R{}", dest)?;
        }

        match self.address {
            Some(address) => write!(f, " addr={}", address)?,
            None if self.base != RSOperand::Unused => write!(f, " addr={}+{}", self.offset, self.base)?,
            None => {}
        }

        if self.squashed {
            write!(f, " squashed")?;
        }

        if !self.mem_deps.is_empty() {
            let deps: Vec<String> = self.mem_deps.iter().map(|tag| tag.to_string()).collect();
            write!(f, " after={}", deps.join(","))?;
        }

        write!(f, " cycles_left={}", self.cycles_left)
    }
}

fn rename_source(operand: Operand, rat: &RAT, arch_reg_file: &ArgRegFile) -> RSOperand {
    match operand {
        Operand::Register(reg) => match rat.current_tag(reg) {
            Some(tag) => RSOperand::Tag(tag),
            None => RSOperand::Value(arch_reg_file.get_value(reg)),
        },
        Operand::Immediate(value) => RSOperand::Value(value),
        Operand::Memory { .. } | Operand::Unused => RSOperand::Unused,
    }
}

/// A pool of reservation stations for one functional unit class.
pub(crate) struct RSTable {
    pub(crate) kind: PoolKind,
    pub(crate) latency: u8,
    pub(crate) capacity: u16,
    array: Vec<RS>,
}

impl RSTable {
    pub(crate) fn new(kind: PoolKind, capacity: u16, latency: u8) -> Self {
        let mut array = Vec::with_capacity(capacity as usize);
        for index in 0..capacity {
            array.push(RS::new(Tag { pool: kind, index }));
        }

        RSTable { kind, latency, capacity, array }
    }

    pub(crate) fn get(&self, rs_index: u16) -> &RS {
        &self.array[rs_index as usize]
    }

    pub(crate) fn is_available(&self) -> bool {
        self.busy_count() < self.capacity as usize
    }

    pub(crate) fn busy_count(&self) -> usize {
        self.array.iter().filter(|rs| rs.is_busy()).count()
    }

    pub(crate) fn busy_tags(&self) -> Vec<Tag> {
        self.array.iter().filter(|rs| rs.is_busy()).map(|rs| rs.tag).collect()
    }

    /// Places the instruction in the lowest free station. Source registers are
    /// renamed before the destination is claimed, so an instruction reading its
    /// own destination sees the previous producer.
    pub(crate) fn allocate(&mut self,
                           instr: &DecodedInstr,
                           pc: usize,
                           seq: u64,
                           cycle: u64,
                           rat: &mut RAT,
                           arch_reg_file: &ArgRegFile) -> Result<Tag, BackendError> {
        debug_assert_eq!(PoolKind::for_opcode(instr.opcode), self.kind);

        let latency = self.latency;
        let rs = match self.array.iter_mut().find(|rs| !rs.is_busy()) {
            Some(rs) => rs,
            None => return Err(BackendError::StationUnavailable(self.kind)),
        };

        rs.state = RSState::BUSY;
        rs.opcode = instr.opcode;
        rs.j = rename_source(instr.source[0], rat, arch_reg_file);
        rs.k = rename_source(instr.source[1], rat, arch_reg_file);
        rs.base = match instr.base {
            Some(base) => rename_source(Operand::Register(base), rat, arch_reg_file),
            None => RSOperand::Unused,
        };
        rs.offset = instr.offset;
        rs.address = None;
        rs.resolve_address();
        rs.dest = instr.dest;
        rs.pc = pc;
        rs.seq = seq;
        rs.squashed = false;
        rs.cycles_left = latency;
        rs.allocated_cycle = cycle;

        if let Some(dest) = instr.dest {
            rat.mark_pending(dest, rs.tag);
        }

        Ok(rs.tag)
    }

    /// Advances every ready station by one cycle and returns the stations that
    /// finished, in station order. A station does not count down in the cycle
    /// it was allocated, nor while any operand is still waiting on a tag.
    pub(crate) fn step(&mut self, cycle: u64, memory_subsystem: &mut MemorySubsystem) -> Vec<CompletedResult> {
        let mut completed = Vec::new();

        for rs in self.array.iter_mut() {
            if rs.state != RSState::BUSY || rs.allocated_cycle == cycle || !rs.is_ready() {
                continue;
            }

            debug_assert!(rs.cycles_left > 0);
            rs.cycles_left -= 1;
            if rs.cycles_left > 0 {
                continue;
            }

            rs.state = RSState::COMPLETED;
            completed.push(execute(rs, memory_subsystem));
        }

        completed
    }

    /// Forwards a broadcast value to every station waiting on `tag`.
    pub(crate) fn wake(&mut self, tag: Tag, value: WordType) {
        for rs in self.array.iter_mut().filter(|rs| rs.state == RSState::BUSY) {
            rs.wake(tag, value);
        }
    }

    /// Keeps the station from executing until every station in `older` has
    /// been released.
    pub(crate) fn wait_for(&mut self, rs_index: u16, older: Vec<Tag>) {
        let rs = &mut self.array[rs_index as usize];
        debug_assert!(rs.state == RSState::BUSY);
        rs.mem_deps = older;
    }

    /// Drops a released memory access from the stations ordered after it.
    pub(crate) fn retire(&mut self, tag: Tag) {
        for rs in self.array.iter_mut().filter(|rs| rs.state == RSState::BUSY) {
            rs.mem_deps.retain(|dep| *dep != tag);
        }
    }

    /// Marks every busy station dispatched after `seq`. Used on the branch pool
    /// when the branch with sequence number `seq` redirects the stream.
    pub(crate) fn squash_younger(&mut self, seq: u64) {
        for rs in self.array.iter_mut().filter(|rs| rs.is_busy() && rs.seq > seq) {
            rs.squashed = true;
        }
    }

    pub(crate) fn release(&mut self, rs_index: u16) {
        let rs = &mut self.array[rs_index as usize];
        debug_assert!(rs.state == RSState::COMPLETED, "releasing {} which has not completed", rs.tag);
        rs.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::CPUConfig;

    struct Fixture {
        rat: RAT,
        reg_file: ArgRegFile,
        memory: MemorySubsystem,
    }

    impl Fixture {
        fn new() -> Self {
            let cpu_config = CPUConfig::default();
            Fixture {
                rat: RAT::new(cpu_config.register_count),
                reg_file: ArgRegFile::new(cpu_config.register_count),
                memory: MemorySubsystem::new(&cpu_config),
            }
        }
    }

    fn arith(opcode: Opcode, dest: RegisterType, j: RegisterType, k: RegisterType) -> DecodedInstr {
        DecodedInstr {
            opcode,
            dest: Some(dest),
            source: [Operand::Register(j), Operand::Register(k)],
            base: None,
            offset: 0,
        }
    }

    #[test]
    fn test_allocate_until_full() {
        let mut f = Fixture::new();
        let mut table = RSTable::new(PoolKind::Adder, 2, 2);

        assert!(table.is_available());
        let t0 = table.allocate(&arith(Opcode::ADD, 1, 2, 3), 0, 0, 1, &mut f.rat, &f.reg_file).unwrap();
        let t1 = table.allocate(&arith(Opcode::ADD, 4, 2, 3), 1, 0, 2, &mut f.rat, &f.reg_file).unwrap();
        assert_ne!(t0, t1);
        assert!(!table.is_available());
        assert_eq!(table.busy_count(), 2);

        let err = table.allocate(&arith(Opcode::ADD, 5, 2, 3), 2, 0, 3, &mut f.rat, &f.reg_file).unwrap_err();
        assert_eq!(err, BackendError::StationUnavailable(PoolKind::Adder));
    }

    #[test]
    fn test_allocate_renames() {
        let mut f = Fixture::new();
        f.reg_file.set_value(2, 7);
        let mut table = RSTable::new(PoolKind::Adder, 3, 2);

        let t0 = table.allocate(&arith(Opcode::ADD, 1, 2, 2), 0, 0, 1, &mut f.rat, &f.reg_file).unwrap();
        assert_eq!(f.rat.current_tag(1), Some(t0));
        assert_eq!(table.get(t0.index).j, RSOperand::Value(7));

        // reads its own destination: must see the previous producer, not itself
        let t1 = table.allocate(&arith(Opcode::SUB, 1, 1, 2), 1, 0, 2, &mut f.rat, &f.reg_file).unwrap();
        let rs = table.get(t1.index);
        assert_eq!(rs.j, RSOperand::Tag(t0));
        assert_eq!(rs.k, RSOperand::Value(7));
        assert_eq!(f.rat.current_tag(1), Some(t1));
    }

    #[test]
    fn test_step_counts_latency() {
        let mut f = Fixture::new();
        let mut table = RSTable::new(PoolKind::Adder, 1, 2);
        f.reg_file.set_value(2, 5);
        f.reg_file.set_value(3, 4);
        let tag = table.allocate(&arith(Opcode::ADD, 1, 2, 3), 0, 0, 10, &mut f.rat, &f.reg_file).unwrap();

        // no progress in the allocation cycle
        assert!(table.step(10, &mut f.memory).is_empty());
        assert!(table.step(11, &mut f.memory).is_empty());
        let completed = table.step(12, &mut f.memory);
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].tag, tag);
        assert_eq!(completed[0].dest, Some(1));
        assert_eq!(completed[0].value, Some(9));

        // completed stations don't complete twice
        assert!(table.step(13, &mut f.memory).is_empty());
        table.release(tag.index);
        assert!(table.is_available());
        assert_eq!(table.busy_count(), 0);
    }

    #[test]
    fn test_waiting_station_does_not_count_down() {
        let mut f = Fixture::new();
        let mut table = RSTable::new(PoolKind::Nand, 2, 2);
        let producer = Tag { pool: PoolKind::Load, index: 0 };
        f.rat.mark_pending(2, producer);

        let tag = table.allocate(&arith(Opcode::NAND, 1, 2, 3), 0, 0, 1, &mut f.rat, &f.reg_file).unwrap();
        for cycle in 2..6 {
            assert!(table.step(cycle, &mut f.memory).is_empty());
        }
        assert_eq!(table.get(tag.index).cycles_left, 2);

        table.wake(producer, 0b1100);
        assert_eq!(table.get(tag.index).j, RSOperand::Value(0b1100));
        assert!(table.step(6, &mut f.memory).is_empty());
        let completed = table.step(7, &mut f.memory);
        assert_eq!(completed[0].value, Some(!(0b1100 & 0)));
    }

    #[test]
    fn test_memory_order() {
        let mut f = Fixture::new();
        let mut table = RSTable::new(PoolKind::Load, 1, 1);
        let store = Tag { pool: PoolKind::Store, index: 0 };

        let load = DecodedInstr {
            opcode: Opcode::LOAD,
            dest: Some(1),
            source: [Operand::Unused, Operand::Unused],
            base: Some(0),
            offset: 5,
        };
        let tag = table.allocate(&load, 1, 0, 1, &mut f.rat, &f.reg_file).unwrap();
        table.wait_for(tag.index, vec![store]);
        assert!(!table.get(tag.index).is_ready());
        assert!(table.step(2, &mut f.memory).is_empty());

        table.retire(store);
        assert!(table.get(tag.index).is_ready());
        f.memory.store(5, 31).unwrap();
        let completed = table.step(3, &mut f.memory);
        assert_eq!(completed[0].value, Some(31));
    }

    #[test]
    fn test_squash_younger() {
        let mut f = Fixture::new();
        let mut table = RSTable::new(PoolKind::Branch, 3, 1);
        let beq = DecodedInstr {
            opcode: Opcode::BEQ,
            dest: None,
            source: [Operand::Register(1), Operand::Register(2)],
            base: None,
            offset: 4,
        };
        let older = table.allocate(&beq, 1, 4, 1, &mut f.rat, &f.reg_file).unwrap();
        let younger = table.allocate(&beq, 2, 7, 2, &mut f.rat, &f.reg_file).unwrap();

        table.squash_younger(5);
        assert!(!table.get(older.index).squashed);
        assert!(table.get(younger.index).squashed);

        // a station reusing the slot starts out unsquashed
        let completed = table.step(3, &mut f.memory);
        assert_eq!(completed.len(), 2);
        assert_eq!(completed[1].branch.map(|branch| branch.squashed), Some(true));
        table.release(younger.index);
        let reused = table.allocate(&beq, 3, 9, 4, &mut f.rat, &f.reg_file).unwrap();
        assert_eq!(reused, younger);
        assert!(!table.get(reused.index).squashed);
    }

    #[test]
    fn test_wake_resolves_address() {
        let mut f = Fixture::new();
        let mut table = RSTable::new(PoolKind::Load, 1, 1);
        let producer = Tag { pool: PoolKind::Adder, index: 2 };
        f.rat.mark_pending(4, producer);

        let load = DecodedInstr {
            opcode: Opcode::LOAD,
            dest: Some(1),
            source: [Operand::Unused, Operand::Unused],
            base: Some(4),
            offset: 3,
        };
        let tag = table.allocate(&load, 0, 0, 1, &mut f.rat, &f.reg_file).unwrap();
        assert_eq!(table.get(tag.index).address, None);

        table.wake(producer, 10);
        assert_eq!(table.get(tag.index).address, Some(13));
    }
}
