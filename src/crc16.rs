//! CRC-16 (Modbus) checksum.
//!
//! Table-driven implementation over two 256-byte lookup tables holding the
//! high and low CRC bytes per index. The tables are derived at compile time
//! from the reversed-0x8005 (0xA001) seed walk with initial value 0xFFFF,
//! so the output is byte-identical to the conventional Modbus CRC.

/// Build the high/low byte tables from the per-byte seed walk.
const fn crc_tables() -> ([u8; 256], [u8; 256]) {
    let mut hi = [0u8; 256];
    let mut lo = [0u8; 256];
    let mut index = 0usize;
    while index < 256 {
        let mut crc = index as u16;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 0x0001 != 0 {
                (crc >> 1) ^ 0xA001
            } else {
                crc >> 1
            };
            bit += 1;
        }
        lo[index] = (crc & 0x00FF) as u8;
        hi[index] = (crc >> 8) as u8;
        index += 1;
    }
    (hi, lo)
}

const TABLES: ([u8; 256], [u8; 256]) = crc_tables();
const CRC_HI: [u8; 256] = TABLES.0;
const CRC_LO: [u8; 256] = TABLES.1;

/// Compute the Modbus CRC-16 of `data`.
///
/// The low byte of the result is `crc_lo` and goes on the wire first;
/// the high byte is `crc_hi`. Serializing with `to_le_bytes` therefore
/// yields the RTU trailer in wire order.
pub fn checksum(data: &[u8]) -> u16 {
    let mut crc_lo: u8 = 0xFF;
    let mut crc_hi: u8 = 0xFF;
    for &byte in data {
        let index = (crc_lo ^ byte) as usize;
        crc_lo = crc_hi ^ CRC_LO[index];
        crc_hi = CRC_HI[index];
    }
    ((crc_hi as u16) << 8) | crc_lo as u16
}

#[cfg(test)]
mod tests {
    use super::*;
    use crc::{Crc, CRC_16_MODBUS};

    #[test]
    fn known_vectors() {
        // Classic frames; wire order is crc_lo first.
        let cases: &[(&[u8], [u8; 2])] = &[
            (&[0x01, 0x03, 0x00, 0x00, 0x00, 0x02], [0xC4, 0x0B]),
            (&[0x01, 0x04, 0x00, 0x00, 0x00, 0x01], [0x31, 0xCA]),
            (&[0x01, 0x06, 0x00, 0x01, 0x00, 0x03], [0x9A, 0x9B]),
            (&[0x01, 0x01, 0x00, 0x13, 0x00, 0x25], [0x0E, 0x84]),
            (&[0x02, 0x03, 0x00, 0x00, 0x00, 0x01], [0x84, 0xB5]),
            (&[0x11, 0x05, 0x00, 0xAC, 0xFF, 0x00], [0x4E, 0x8B]),
        ];
        for (data, wire) in cases {
            let crc = checksum(data);
            assert_eq!(
                crc.to_le_bytes(),
                *wire,
                "CRC wire bytes for {:02X?}",
                data
            );
        }
    }

    #[test]
    fn matches_reference_implementation() {
        const REFERENCE: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);
        let samples: &[&[u8]] = &[
            b"123456789",
            &[0x00],
            &[0xFF; 32],
            &[0x01, 0x10, 0x00, 0x01, 0x00, 0x02, 0x04, 0x00, 0x0A, 0x01, 0x02],
        ];
        for data in samples {
            assert_eq!(checksum(data), REFERENCE.checksum(data));
        }
    }

    #[test]
    fn order_dependent() {
        assert_ne!(checksum(&[0x01, 0x02]), checksum(&[0x02, 0x01]));
    }

    #[test]
    fn empty_slice_is_initial_value() {
        assert_eq!(checksum(&[]), 0xFFFF);
    }
}
