use std::collections::VecDeque;
use std::rc::Rc;

use log::{info, warn};

use crate::cpu::{CPUConfig, Trace};
use crate::instructions::instructions::{Instr, Program, WordType};

/// Holds the stream of instructions that have not been dispatched yet, as
/// indices into the program, and steers it when a branch is taken.
pub(crate) struct Frontend {
    program_option: Option<Rc<Program>>,
    pending: VecDeque<usize>,
    instruction_width: WordType,
    trace: Trace,
    pub(crate) skipped_cnt: u64,
}

impl Frontend {
    pub(crate) fn new(cpu_config: &CPUConfig) -> Frontend {
        Frontend {
            program_option: None,
            pending: VecDeque::new(),
            instruction_width: cpu_config.instruction_width,
            trace: cpu_config.trace.clone(),
            skipped_cnt: 0,
        }
    }

    pub(crate) fn init(&mut self, program: &Rc<Program>) {
        self.pending = (0..program.len()).collect();
        self.program_option = Some(Rc::clone(program));
        self.skipped_cnt = 0;
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// The instruction at the head of the stream and its program index.
    pub(crate) fn peek(&self) -> Option<(usize, Rc<Instr>)> {
        let program = self.program_option.as_ref()?;
        let pc = *self.pending.front()?;
        Some((pc, program.get_instr(pc)))
    }

    pub(crate) fn pop(&mut self) {
        let _ = self.pending.pop_front();
    }

    /// The program index a taken branch at `pc` with byte displacement `offset`
    /// continues at.
    pub(crate) fn branch_target(&self, pc: usize, offset: WordType) -> WordType {
        pc as WordType + 1 + offset.div_euclid(self.instruction_width)
    }

    /// Discards every instruction not yet dispatched and continues the stream
    /// at the branch target. A target past the end of the program ends the
    /// stream.
    pub(crate) fn redirect(&mut self, pc: usize, offset: WordType) {
        let program_len = match &self.program_option {
            Some(program) => program.len(),
            None => return,
        };

        let target = self.branch_target(pc, offset);
        let in_program = target >= 0 && target as usize <= program_len;

        // instructions at or after the target come back with the new stream
        let resume = if in_program { target as usize } else { usize::MAX };
        self.skipped_cnt += self.pending.iter().filter(|&&pending_pc| pending_pc < resume).count() as u64;
        self.pending.clear();

        if !in_program {
            warn!("Branch at {} jumps to {} outside of the program [0,{}]; stopping fetch", pc, target, program_len);
            return;
        }

        if self.trace.redirect {
            info!("Redirect: branch at {} taken, continuing at {}", pc, target);
        }

        self.pending.extend(target as usize..program_len);
    }
}
