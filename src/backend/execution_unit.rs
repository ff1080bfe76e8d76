use log::warn;

use crate::backend::reservation_station::{Tag, RS};
use crate::instructions::instructions::{Opcode, RegisterType, WordType};
use crate::memory_subsystem::memory_subsystem::MemorySubsystem;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct BranchOutcome {
    pub(crate) taken: bool,
    // program index of the branch
    pub(crate) pc: usize,
    pub(crate) offset: WordType,
    // dispatch order of the branch
    pub(crate) seq: u64,
    // fetched down a path an older taken branch already discarded
    pub(crate) squashed: bool,
}

/// The event a reservation station produces when it finishes executing. It is
/// put on the common data bus by the backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct CompletedResult {
    pub(crate) tag: Tag,
    pub(crate) opcode: Opcode,
    pub(crate) dest: Option<RegisterType>,
    pub(crate) value: Option<WordType>,
    pub(crate) branch: Option<BranchOutcome>,
    pub(crate) memory_fault: bool,
}

fn effective_address(rs: &RS) -> WordType {
    match rs.address {
        Some(address) => address,
        None => panic!("{} executed without an effective address", rs.tag),
    }
}

/// Computes the result of a station whose operands are all resolved. STORE
/// writes memory here; every other result is returned for broadcast.
pub(crate) fn execute(rs: &RS, memory_subsystem: &mut MemorySubsystem) -> CompletedResult {
    let mut result = CompletedResult {
        tag: rs.tag,
        opcode: rs.opcode,
        dest: rs.dest,
        value: None,
        branch: None,
        memory_fault: false,
    };

    match rs.opcode {
        Opcode::ADD => result.value = Some(rs.j.get_value().wrapping_add(rs.k.get_value())),
        Opcode::SUB => result.value = Some(rs.j.get_value().wrapping_sub(rs.k.get_value())),
        Opcode::NAND => result.value = Some(!(rs.j.get_value() & rs.k.get_value())),
        Opcode::LOAD => {
            let address = effective_address(rs);
            let value = match memory_subsystem.load(address) {
                Ok(value) => value,
                Err(err) => {
                    warn!("{}: LOAD fault, {}; broadcasting 0", rs.tag, err);
                    result.memory_fault = true;
                    0
                }
            };
            result.value = Some(value);
        }
        Opcode::STORE => {
            let address = effective_address(rs);
            if let Err(err) = memory_subsystem.store(address, rs.j.get_value()) {
                warn!("{}: STORE fault, {}; store dropped", rs.tag, err);
                result.memory_fault = true;
            }
        }
        Opcode::BEQ => {
            result.branch = Some(BranchOutcome {
                taken: rs.j.get_value() == rs.k.get_value(),
                pc: rs.pc,
                offset: rs.offset,
                seq: rs.seq,
                squashed: rs.squashed,
            });
        }
    }

    result
}
