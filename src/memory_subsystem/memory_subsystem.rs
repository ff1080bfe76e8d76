use thiserror::Error;

use crate::cpu::CPUConfig;
use crate::instructions::instructions::WordType;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MemoryError {
    #[error("address {addr} is outside memory of {size} words")]
    AddressOutOfRange { addr: WordType, size: usize },
}

/// Flat word addressed memory. Accesses are atomic; a LOAD or STORE touches
/// memory in the cycle its reservation station completes.
pub(crate) struct MemorySubsystem {
    pub(crate) memory: Vec<WordType>,
}

impl MemorySubsystem {
    pub fn new(cpu_config: &CPUConfig) -> MemorySubsystem {
        MemorySubsystem {
            memory: vec![0; cpu_config.memory_size as usize],
        }
    }

    pub(crate) fn init(&mut self, initial: &[WordType]) {
        self.memory.fill(0);

        for (k, value) in initial.iter().take(self.memory.len()).enumerate() {
            self.memory[k] = *value;
        }
    }

    fn to_index(&self, addr: WordType) -> Result<usize, MemoryError> {
        if addr < 0 || addr as u64 >= self.memory.len() as u64 {
            return Err(MemoryError::AddressOutOfRange { addr, size: self.memory.len() });
        }
        Ok(addr as usize)
    }

    pub(crate) fn load(&self, addr: WordType) -> Result<WordType, MemoryError> {
        let index = self.to_index(addr)?;
        Ok(self.memory[index])
    }

    pub(crate) fn store(&mut self, addr: WordType, value: WordType) -> Result<(), MemoryError> {
        let index = self.to_index(addr)?;
        self.memory[index] = value;
        Ok(())
    }

    /// The first `len` words of memory, for reporting.
    pub(crate) fn window(&self, len: usize) -> &[WordType] {
        &self.memory[..len.min(self.memory.len())]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory(size: u32) -> MemorySubsystem {
        let mut cpu_config = CPUConfig::default();
        cpu_config.memory_size = size;
        MemorySubsystem::new(&cpu_config)
    }

    #[test]
    fn test_load_store() {
        let mut memory = memory(16);
        memory.store(3, 42).unwrap();
        assert_eq!(memory.load(3), Ok(42));
        assert_eq!(memory.load(4), Ok(0));
    }

    #[test]
    fn test_out_of_range() {
        let mut memory = memory(16);
        assert_eq!(memory.load(16), Err(MemoryError::AddressOutOfRange { addr: 16, size: 16 }));
        assert_eq!(memory.store(-1, 1), Err(MemoryError::AddressOutOfRange { addr: -1, size: 16 }));
    }

    #[test]
    fn test_init_and_window() {
        let mut memory = memory(4);
        memory.store(3, 9).unwrap();
        memory.init(&[1, 2, 3, 4, 5, 6]);
        assert_eq!(memory.window(8), &[1, 2, 3, 4]);
        assert_eq!(memory.window(2), &[1, 2]);
    }
}
