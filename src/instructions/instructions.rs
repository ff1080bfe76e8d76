use std::fmt;
use std::rc::Rc;
use std::sync::OnceLock;

use regex::Regex;
use thiserror::Error;

pub(crate) type RegisterType = u16;
pub(crate) type WordType = i64;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Opcode {
    ADD,
    SUB,
    NAND,
    LOAD,
    STORE,
    BEQ,
}

pub(crate) fn mnemonic(opcode: Opcode) -> &'static str {
    match opcode {
        Opcode::ADD => "ADD",
        Opcode::SUB => "SUB",
        Opcode::NAND => "NAND",
        Opcode::LOAD => "LOAD",
        Opcode::STORE => "STORE",
        Opcode::BEQ => "BEQ",
    }
}

pub(crate) fn get_opcode(mnemonic: &str) -> Option<Opcode> {
    let string = mnemonic.to_uppercase();

    match string.as_str() {
        "ADD" => Some(Opcode::ADD),
        "SUB" => Some(Opcode::SUB),
        "NAND" => Some(Opcode::NAND),
        "LOAD" => Some(Opcode::LOAD),
        "STORE" => Some(Opcode::STORE),
        "BEQ" => Some(Opcode::BEQ),
        _ => None,
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub(crate) enum DecodeError {
    #[error("malformed operand '{token}'")]
    MalformedOperand { token: String },
    #[error("register R{register} is out of range")]
    RegisterOutOfRange { register: u64 },
    #[error("{opcode:?} expects {expected} operands, but {found} are provided")]
    OperandCount { opcode: Opcode, expected: usize, found: usize },
}

/// A single instruction as produced by the loader: the opcode plus the raw
/// operand tokens in source order. Operands are only interpreted when the
/// instruction is dispatched.
#[derive(Debug, Clone)]
pub(crate) struct Instr {
    pub(crate) opcode: Opcode,
    pub(crate) operands: Vec<String>,
    pub(crate) line: usize,
}

impl fmt::Display for Instr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", mnemonic(self.opcode), self.operands.join(","))?;
        if self.line > 0 {
            write!(f, " ; line {}", self.line)?;
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Operand {
    Register(RegisterType),
    // The operand is directly specified in the instruction itself.
    Immediate(WordType),
    // displacement(base)
    Memory { offset: WordType, base: RegisterType },
    Unused,
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Register(reg) => write!(f, "R{}", reg),
            Operand::Immediate(val) => write!(f, "{}", val),
            Operand::Memory { offset, base } => write!(f, "{}(R{})", offset, base),
            Operand::Unused => write!(f, "Unused"),
        }
    }
}

fn register_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(?i)R(\d+)$").expect("invalid register regex"))
}

fn immediate_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^#?([+-]?\d+)$").expect("invalid immediate regex"))
}

fn memory_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^([+-]?\d+)\((?i:R)(\d+)\)$").expect("invalid memory regex"))
}

fn malformed(token: &str) -> DecodeError {
    DecodeError::MalformedOperand { token: token.to_string() }
}

fn check_register(digits: &str, token: &str, register_count: u16) -> Result<RegisterType, DecodeError> {
    let register: u64 = digits.parse().map_err(|_| malformed(token))?;
    if register >= register_count as u64 {
        return Err(DecodeError::RegisterOutOfRange { register });
    }
    Ok(register as RegisterType)
}

pub(crate) fn parse_operand(token: &str, register_count: u16) -> Result<Operand, DecodeError> {
    let token = token.trim();

    if let Some(captures) = register_regex().captures(token) {
        return Ok(Operand::Register(check_register(&captures[1], token, register_count)?));
    }

    if let Some(captures) = immediate_regex().captures(token) {
        let value: WordType = captures[1].parse().map_err(|_| malformed(token))?;
        return Ok(Operand::Immediate(value));
    }

    if let Some(captures) = memory_regex().captures(token) {
        let offset: WordType = captures[1].parse().map_err(|_| malformed(token))?;
        let base = check_register(&captures[2], token, register_count)?;
        return Ok(Operand::Memory { offset, base });
    }

    Err(malformed(token))
}

/// The operands of an instruction in the shape the reservation stations need.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct DecodedInstr {
    pub(crate) opcode: Opcode,
    // the register written by ADD/SUB/NAND/LOAD
    pub(crate) dest: Option<RegisterType>,
    // the value operands (j, k)
    pub(crate) source: [Operand; 2],
    // the base register of a LOAD/STORE
    pub(crate) base: Option<RegisterType>,
    // memory displacement for LOAD/STORE, branch displacement for BEQ
    pub(crate) offset: WordType,
}

impl Instr {
    pub(crate) fn new(opcode: Opcode, operands: Vec<String>, line: usize) -> Self {
        Self { opcode, operands, line }
    }

    pub(crate) fn decode(&self, register_count: u16) -> Result<DecodedInstr, DecodeError> {
        let expected = match self.opcode {
            Opcode::LOAD | Opcode::STORE => 2,
            Opcode::ADD | Opcode::SUB | Opcode::NAND | Opcode::BEQ => 3,
        };
        if self.operands.len() != expected {
            return Err(DecodeError::OperandCount { opcode: self.opcode, expected, found: self.operands.len() });
        }

        let mut operands = Vec::with_capacity(self.operands.len());
        for token in &self.operands {
            operands.push(parse_operand(token, register_count)?);
        }

        let mut decoded = DecodedInstr {
            opcode: self.opcode,
            dest: None,
            source: [Operand::Unused, Operand::Unused],
            base: None,
            offset: 0,
        };

        match self.opcode {
            Opcode::ADD | Opcode::SUB | Opcode::NAND => {
                decoded.dest = Some(self.expect_register(operands[0], 0)?);
                decoded.source[0] = Operand::Register(self.expect_register(operands[1], 1)?);
                decoded.source[1] = self.expect_value(operands[2], 2)?;
            }
            Opcode::LOAD => {
                decoded.dest = Some(self.expect_register(operands[0], 0)?);
                let (offset, base) = self.expect_memory(operands[1], 1)?;
                decoded.offset = offset;
                decoded.base = Some(base);
            }
            Opcode::STORE => {
                decoded.source[0] = Operand::Register(self.expect_register(operands[0], 0)?);
                let (offset, base) = self.expect_memory(operands[1], 1)?;
                decoded.offset = offset;
                decoded.base = Some(base);
            }
            Opcode::BEQ => {
                decoded.source[0] = Operand::Register(self.expect_register(operands[0], 0)?);
                decoded.source[1] = self.expect_value(operands[1], 1)?;
                decoded.offset = match operands[2] {
                    Operand::Immediate(offset) => offset,
                    _ => return Err(malformed(&self.operands[2])),
                };
            }
        }

        Ok(decoded)
    }

    fn expect_register(&self, operand: Operand, index: usize) -> Result<RegisterType, DecodeError> {
        match operand {
            Operand::Register(reg) => Ok(reg),
            _ => Err(malformed(&self.operands[index])),
        }
    }

    fn expect_value(&self, operand: Operand, index: usize) -> Result<Operand, DecodeError> {
        match operand {
            Operand::Register(_) | Operand::Immediate(_) => Ok(operand),
            _ => Err(malformed(&self.operands[index])),
        }
    }

    fn expect_memory(&self, operand: Operand, index: usize) -> Result<(WordType, RegisterType), DecodeError> {
        match operand {
            Operand::Memory { offset, base } => Ok((offset, base)),
            _ => Err(malformed(&self.operands[index])),
        }
    }
}

pub(crate) struct Program {
    pub(crate) code: Vec<Rc<Instr>>,
}

impl Program {
    pub fn new(code: Vec<Instr>) -> Self {
        Self { code: code.into_iter().map(Rc::new).collect() }
    }

    pub fn get_instr(&self, pos: usize) -> Rc<Instr> {
        Rc::clone(&self.code[pos])
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }
}
