//! Server-side register storage.
//!
//! Four banks spanning the full 16-bit address space: coils and discrete
//! inputs (one logical bit per address), holding and input registers
//! (signed 16-bit words). Coils and discrete inputs share one lock, the
//! two word banks share the other; the dispatcher holds the respective
//! lock across every compound read-modify-write, so concurrent requests
//! observe consistent bank state.

use std::sync::RwLock;

use crate::error::{ModbusError, ModbusResult};

/// Entries per bank: the full Modbus address space.
pub const BANK_SIZE: usize = 65536;

#[derive(Debug)]
struct BitBanks {
    coils: Vec<bool>,
    discrete_inputs: Vec<bool>,
}

#[derive(Debug)]
struct WordBanks {
    holding: Vec<i16>,
    input: Vec<i16>,
}

/// Thread-safe storage for the four Modbus data banks.
#[derive(Debug)]
pub struct RegisterBank {
    bits: RwLock<BitBanks>,
    words: RwLock<WordBanks>,
}

impl RegisterBank {
    /// Create a bank with every address zeroed.
    pub fn new() -> Self {
        Self {
            bits: RwLock::new(BitBanks {
                coils: vec![false; BANK_SIZE],
                discrete_inputs: vec![false; BANK_SIZE],
            }),
            words: RwLock::new(WordBanks {
                holding: vec![0i16; BANK_SIZE],
                input: vec![0i16; BANK_SIZE],
            }),
        }
    }

    fn range(address: u16, count: usize) -> ModbusResult<std::ops::Range<usize>> {
        let start = address as usize;
        let end = start + count;
        if end > BANK_SIZE {
            return Err(ModbusError::illegal_argument(format!(
                "address range {}..{} exceeds bank size",
                start, end
            )));
        }
        Ok(start..end)
    }

    /// Read a run of coils.
    pub fn read_coils(&self, address: u16, quantity: u16) -> ModbusResult<Vec<bool>> {
        let range = Self::range(address, quantity as usize)?;
        let banks = self.bits.read().unwrap();
        Ok(banks.coils[range].to_vec())
    }

    /// Read a run of discrete inputs.
    pub fn read_discrete_inputs(&self, address: u16, quantity: u16) -> ModbusResult<Vec<bool>> {
        let range = Self::range(address, quantity as usize)?;
        let banks = self.bits.read().unwrap();
        Ok(banks.discrete_inputs[range].to_vec())
    }

    /// Read a run of holding registers.
    pub fn read_holding_registers(&self, address: u16, quantity: u16) -> ModbusResult<Vec<i16>> {
        let range = Self::range(address, quantity as usize)?;
        let banks = self.words.read().unwrap();
        Ok(banks.holding[range].to_vec())
    }

    /// Read a run of input registers.
    pub fn read_input_registers(&self, address: u16, quantity: u16) -> ModbusResult<Vec<i16>> {
        let range = Self::range(address, quantity as usize)?;
        let banks = self.words.read().unwrap();
        Ok(banks.input[range].to_vec())
    }

    /// Write one coil.
    pub fn write_coil(&self, address: u16, value: bool) -> ModbusResult<()> {
        let mut banks = self.bits.write().unwrap();
        banks.coils[address as usize] = value;
        Ok(())
    }

    /// Write a run of coils.
    pub fn write_coils(&self, address: u16, values: &[bool]) -> ModbusResult<()> {
        let range = Self::range(address, values.len())?;
        let mut banks = self.bits.write().unwrap();
        banks.coils[range].copy_from_slice(values);
        Ok(())
    }

    /// Write one holding register.
    pub fn write_holding_register(&self, address: u16, value: i16) -> ModbusResult<()> {
        let mut banks = self.words.write().unwrap();
        banks.holding[address as usize] = value;
        Ok(())
    }

    /// Write a run of holding registers.
    pub fn write_holding_registers(&self, address: u16, values: &[i16]) -> ModbusResult<()> {
        let range = Self::range(address, values.len())?;
        let mut banks = self.words.write().unwrap();
        banks.holding[range].copy_from_slice(values);
        Ok(())
    }

    /// Write then read holding registers inside one critical section
    /// (FC 23 atomicity).
    pub fn read_write_holding_registers(
        &self,
        read_address: u16,
        read_quantity: u16,
        write_address: u16,
        values: &[i16],
    ) -> ModbusResult<Vec<i16>> {
        let write_range = Self::range(write_address, values.len())?;
        let read_range = Self::range(read_address, read_quantity as usize)?;
        let mut banks = self.words.write().unwrap();
        banks.holding[write_range].copy_from_slice(values);
        Ok(banks.holding[read_range].to_vec())
    }

    /// Set one discrete input (simulation / process-image side).
    pub fn set_discrete_input(&self, address: u16, value: bool) -> ModbusResult<()> {
        let mut banks = self.bits.write().unwrap();
        banks.discrete_inputs[address as usize] = value;
        Ok(())
    }

    /// Set a run of discrete inputs.
    pub fn set_discrete_inputs(&self, address: u16, values: &[bool]) -> ModbusResult<()> {
        let range = Self::range(address, values.len())?;
        let mut banks = self.bits.write().unwrap();
        banks.discrete_inputs[range].copy_from_slice(values);
        Ok(())
    }

    /// Set one input register.
    pub fn set_input_register(&self, address: u16, value: i16) -> ModbusResult<()> {
        let mut banks = self.words.write().unwrap();
        banks.input[address as usize] = value;
        Ok(())
    }

    /// Set a run of input registers.
    pub fn set_input_registers(&self, address: u16, values: &[i16]) -> ModbusResult<()> {
        let range = Self::range(address, values.len())?;
        let mut banks = self.words.write().unwrap();
        banks.input[range].copy_from_slice(values);
        Ok(())
    }
}

impl Default for RegisterBank {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coil_read_write() {
        let bank = RegisterBank::new();
        bank.write_coil(10, true).unwrap();
        assert_eq!(bank.read_coils(10, 1).unwrap(), vec![true]);

        bank.write_coils(20, &[true, false, true]).unwrap();
        assert_eq!(bank.read_coils(20, 3).unwrap(), vec![true, false, true]);
    }

    #[test]
    fn register_read_write() {
        let bank = RegisterBank::new();
        bank.write_holding_register(5, -21555).unwrap();
        assert_eq!(bank.read_holding_registers(5, 1).unwrap(), vec![-21555]);

        bank.write_holding_registers(100, &[0x1111, 0x2222, 0x3333])
            .unwrap();
        assert_eq!(
            bank.read_holding_registers(100, 3).unwrap(),
            vec![0x1111, 0x2222, 0x3333]
        );
    }

    #[test]
    fn full_address_space_addressable() {
        let bank = RegisterBank::new();
        bank.write_holding_register(65535, 42).unwrap();
        assert_eq!(bank.read_holding_registers(65535, 1).unwrap(), vec![42]);
        bank.write_coil(65535, true).unwrap();
        assert_eq!(bank.read_coils(65535, 1).unwrap(), vec![true]);
        assert!(bank.read_holding_registers(65535, 2).is_err());
    }

    #[test]
    fn read_only_banks_settable() {
        let bank = RegisterBank::new();
        bank.set_input_register(7, 1234).unwrap();
        bank.set_discrete_input(7, true).unwrap();
        assert_eq!(bank.read_input_registers(7, 1).unwrap(), vec![1234]);
        assert_eq!(bank.read_discrete_inputs(7, 1).unwrap(), vec![true]);
    }

    #[test]
    fn fc23_write_visible_to_same_call() {
        let bank = RegisterBank::new();
        bank.write_holding_registers(0, &[1, 2, 3, 4]).unwrap();
        let read = bank
            .read_write_holding_registers(0, 4, 1, &[9, 9])
            .unwrap();
        assert_eq!(read, vec![1, 9, 9, 4]);
    }
}
