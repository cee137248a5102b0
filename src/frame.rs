//! Frame codec: ADU composition and parsing.
//!
//! Every request is built once as a single contiguous buffer in the MBAP
//! shape with the RTU CRC trailer already filled:
//!
//! ```text
//! [txid(2) | proto(2)=0 | len(2) | unit(1) | PDU | crc_lo crc_hi]
//! ```
//!
//! Transports pick the slice they transmit: TCP/UDP send everything up to
//! the CRC, RTU sends everything from the unit id on. The CRC is computed
//! over `unit..PDU-end`, so the RTU slice is self-contained.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::crc16;
use crate::error::{ModbusError, ModbusResult};
use crate::words;
use crate::{MAX_BIT_COUNT, MAX_REGISTER_COUNT, MAX_RW_WRITE_COUNT};

/// MBAP header length (transaction id, protocol id, length).
pub const MBAP_HEADER_LEN: usize = 6;

/// Supported Modbus function codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum FunctionCode {
    /// Read Coils (0x01)
    ReadCoils = 0x01,
    /// Read Discrete Inputs (0x02)
    ReadDiscreteInputs = 0x02,
    /// Read Holding Registers (0x03)
    ReadHoldingRegisters = 0x03,
    /// Read Input Registers (0x04)
    ReadInputRegisters = 0x04,
    /// Write Single Coil (0x05)
    WriteSingleCoil = 0x05,
    /// Write Single Register (0x06)
    WriteSingleRegister = 0x06,
    /// Write Multiple Coils (0x0F)
    WriteMultipleCoils = 0x0F,
    /// Write Multiple Registers (0x10)
    WriteMultipleRegisters = 0x10,
    /// Read/Write Multiple Registers (0x17)
    ReadWriteMultipleRegisters = 0x17,
}

impl FunctionCode {
    /// Convert from the wire byte.
    pub fn from_u8(value: u8) -> ModbusResult<Self> {
        match value {
            0x01 => Ok(Self::ReadCoils),
            0x02 => Ok(Self::ReadDiscreteInputs),
            0x03 => Ok(Self::ReadHoldingRegisters),
            0x04 => Ok(Self::ReadInputRegisters),
            0x05 => Ok(Self::WriteSingleCoil),
            0x06 => Ok(Self::WriteSingleRegister),
            0x0F => Ok(Self::WriteMultipleCoils),
            0x10 => Ok(Self::WriteMultipleRegisters),
            0x17 => Ok(Self::ReadWriteMultipleRegisters),
            _ => Err(ModbusError::frame(format!(
                "unsupported function code 0x{:02X}",
                value
            ))),
        }
    }

    /// Convert to the wire byte.
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Whether this is a pure read function.
    pub fn is_read(self) -> bool {
        matches!(
            self,
            Self::ReadCoils
                | Self::ReadDiscreteInputs
                | Self::ReadHoldingRegisters
                | Self::ReadInputRegisters
        )
    }

    /// Whether this function mutates server state.
    pub fn is_write(self) -> bool {
        !self.is_read()
    }
}

impl fmt::Display for FunctionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ReadCoils => "Read Coils",
            Self::ReadDiscreteInputs => "Read Discrete Inputs",
            Self::ReadHoldingRegisters => "Read Holding Registers",
            Self::ReadInputRegisters => "Read Input Registers",
            Self::WriteSingleCoil => "Write Single Coil",
            Self::WriteSingleRegister => "Write Single Register",
            Self::WriteMultipleCoils => "Write Multiple Coils",
            Self::WriteMultipleRegisters => "Write Multiple Registers",
            Self::ReadWriteMultipleRegisters => "Read/Write Multiple Registers",
        };
        write!(f, "{} (0x{:02X})", name, *self as u8)
    }
}

/// A fully assembled Application Data Unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Adu {
    buf: Vec<u8>,
}

impl Adu {
    /// The MBAP framing: header + unit id + PDU, no CRC.
    pub fn tcp_frame(&self) -> &[u8] {
        &self.buf[..self.buf.len() - 2]
    }

    /// The RTU framing: unit id + PDU + CRC.
    pub fn rtu_frame(&self) -> &[u8] {
        &self.buf[MBAP_HEADER_LEN..]
    }

    /// Transaction id from the MBAP header.
    pub fn transaction_id(&self) -> u16 {
        u16::from_be_bytes([self.buf[0], self.buf[1]])
    }

    /// Unit identifier.
    pub fn unit_id(&self) -> u8 {
        self.buf[MBAP_HEADER_LEN]
    }

    /// Function code of the PDU.
    pub fn function_code(&self) -> u8 {
        self.buf[MBAP_HEADER_LEN + 1]
    }
}

/// Assemble MBAP header + PDU + CRC into one buffer.
fn assemble(transaction_id: u16, unit_id: u8, pdu: &[u8]) -> Adu {
    let mut buf = Vec::with_capacity(MBAP_HEADER_LEN + 1 + pdu.len() + 2);
    buf.extend_from_slice(&transaction_id.to_be_bytes());
    buf.extend_from_slice(&0u16.to_be_bytes());
    buf.extend_from_slice(&((1 + pdu.len()) as u16).to_be_bytes());
    buf.push(unit_id);
    buf.extend_from_slice(pdu);
    let crc = crc16::checksum(&buf[MBAP_HEADER_LEN..]);
    buf.extend_from_slice(&crc.to_le_bytes());
    Adu { buf }
}

/// Build a read request (FC 1, 2, 3, or 4).
pub fn read_request(
    transaction_id: u16,
    unit_id: u8,
    function: FunctionCode,
    address: u16,
    quantity: u16,
) -> ModbusResult<Adu> {
    let limit = match function {
        FunctionCode::ReadCoils | FunctionCode::ReadDiscreteInputs => MAX_BIT_COUNT,
        FunctionCode::ReadHoldingRegisters | FunctionCode::ReadInputRegisters => {
            MAX_REGISTER_COUNT
        }
        _ => {
            return Err(ModbusError::illegal_argument(format!(
                "{} is not a read function",
                function
            )))
        }
    };
    if quantity == 0 || quantity > limit {
        return Err(ModbusError::illegal_argument(format!(
            "quantity {} outside 1..={} for {}",
            quantity, limit, function
        )));
    }
    let mut pdu = Vec::with_capacity(5);
    pdu.push(function.to_u8());
    pdu.extend_from_slice(&address.to_be_bytes());
    pdu.extend_from_slice(&quantity.to_be_bytes());
    Ok(assemble(transaction_id, unit_id, &pdu))
}

/// Build a write-single-coil request (FC 5).
pub fn write_single_coil_request(
    transaction_id: u16,
    unit_id: u8,
    address: u16,
    value: bool,
) -> Adu {
    let encoded: u16 = if value { 0xFF00 } else { 0x0000 };
    let mut pdu = Vec::with_capacity(5);
    pdu.push(FunctionCode::WriteSingleCoil.to_u8());
    pdu.extend_from_slice(&address.to_be_bytes());
    pdu.extend_from_slice(&encoded.to_be_bytes());
    assemble(transaction_id, unit_id, &pdu)
}

/// Build a write-single-register request (FC 6).
pub fn write_single_register_request(
    transaction_id: u16,
    unit_id: u8,
    address: u16,
    value: i16,
) -> Adu {
    let mut pdu = Vec::with_capacity(5);
    pdu.push(FunctionCode::WriteSingleRegister.to_u8());
    pdu.extend_from_slice(&address.to_be_bytes());
    pdu.extend_from_slice(&value.to_be_bytes());
    assemble(transaction_id, unit_id, &pdu)
}

/// Build a write-multiple-coils request (FC 15).
pub fn write_multiple_coils_request(
    transaction_id: u16,
    unit_id: u8,
    address: u16,
    values: &[bool],
) -> ModbusResult<Adu> {
    if values.is_empty() || values.len() > MAX_BIT_COUNT as usize {
        return Err(ModbusError::illegal_argument(format!(
            "coil count {} outside 1..={}",
            values.len(),
            MAX_BIT_COUNT
        )));
    }
    let packed = words::pack_bits(values);
    let mut pdu = Vec::with_capacity(6 + packed.len());
    pdu.push(FunctionCode::WriteMultipleCoils.to_u8());
    pdu.extend_from_slice(&address.to_be_bytes());
    pdu.extend_from_slice(&(values.len() as u16).to_be_bytes());
    pdu.push(packed.len() as u8);
    pdu.extend_from_slice(&packed);
    Ok(assemble(transaction_id, unit_id, &pdu))
}

/// Build a write-multiple-registers request (FC 16).
pub fn write_multiple_registers_request(
    transaction_id: u16,
    unit_id: u8,
    address: u16,
    values: &[i16],
) -> ModbusResult<Adu> {
    if values.is_empty() || values.len() > MAX_REGISTER_COUNT as usize {
        return Err(ModbusError::illegal_argument(format!(
            "register count {} outside 1..={}",
            values.len(),
            MAX_REGISTER_COUNT
        )));
    }
    let mut pdu = Vec::with_capacity(6 + values.len() * 2);
    pdu.push(FunctionCode::WriteMultipleRegisters.to_u8());
    pdu.extend_from_slice(&address.to_be_bytes());
    pdu.extend_from_slice(&(values.len() as u16).to_be_bytes());
    pdu.push((values.len() * 2) as u8);
    for &value in values {
        pdu.extend_from_slice(&value.to_be_bytes());
    }
    Ok(assemble(transaction_id, unit_id, &pdu))
}

/// Build a read/write-multiple-registers request (FC 23).
pub fn read_write_registers_request(
    transaction_id: u16,
    unit_id: u8,
    read_address: u16,
    read_quantity: u16,
    write_address: u16,
    values: &[i16],
) -> ModbusResult<Adu> {
    if read_quantity == 0 || read_quantity > MAX_REGISTER_COUNT {
        return Err(ModbusError::illegal_argument(format!(
            "read quantity {} outside 1..={}",
            read_quantity, MAX_REGISTER_COUNT
        )));
    }
    if values.is_empty() || values.len() > MAX_RW_WRITE_COUNT as usize {
        return Err(ModbusError::illegal_argument(format!(
            "write count {} outside 1..={}",
            values.len(),
            MAX_RW_WRITE_COUNT
        )));
    }
    let mut pdu = Vec::with_capacity(10 + values.len() * 2);
    pdu.push(FunctionCode::ReadWriteMultipleRegisters.to_u8());
    pdu.extend_from_slice(&read_address.to_be_bytes());
    pdu.extend_from_slice(&read_quantity.to_be_bytes());
    pdu.extend_from_slice(&write_address.to_be_bytes());
    pdu.extend_from_slice(&(values.len() as u16).to_be_bytes());
    pdu.push((values.len() * 2) as u8);
    for &value in values {
        pdu.extend_from_slice(&value.to_be_bytes());
    }
    Ok(assemble(transaction_id, unit_id, &pdu))
}

/// Parsed MBAP header fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbapHeader {
    pub transaction_id: u16,
    pub protocol_id: u16,
    /// Byte count from the unit id to the end of the PDU.
    pub length: u16,
    pub unit_id: u8,
}

/// Parse the MBAP header and unit id from an inbound frame.
pub fn parse_mbap(frame: &[u8]) -> ModbusResult<MbapHeader> {
    if frame.len() < MBAP_HEADER_LEN + 2 {
        return Err(ModbusError::frame("frame too short for MBAP header"));
    }
    let header = MbapHeader {
        transaction_id: u16::from_be_bytes([frame[0], frame[1]]),
        protocol_id: u16::from_be_bytes([frame[2], frame[3]]),
        length: u16::from_be_bytes([frame[4], frame[5]]),
        unit_id: frame[6],
    };
    if header.protocol_id != 0 {
        return Err(ModbusError::frame(format!(
            "invalid protocol id 0x{:04X}",
            header.protocol_id
        )));
    }
    if header.length < 2 {
        return Err(ModbusError::frame("MBAP length below minimum"));
    }
    if frame.len() < MBAP_HEADER_LEN + header.length as usize {
        return Err(ModbusError::frame("incomplete frame"));
    }
    Ok(header)
}

/// Validate a normalized response (`unit_id + PDU`) against the requested
/// function: surfaces exception responses as typed errors and rejects
/// frames answering a different function.
pub fn check_exception(function: FunctionCode, response: &[u8]) -> ModbusResult<()> {
    if response.len() < 2 {
        return Err(ModbusError::frame("response shorter than unit + function"));
    }
    let server_function = response[1];
    if server_function == function.to_u8() | 0x80 {
        if response.len() < 3 {
            return Err(ModbusError::frame("exception response missing code"));
        }
        return Err(ModbusError::exception(function.to_u8(), response[2]));
    }
    if server_function != function.to_u8() {
        return Err(ModbusError::frame(format!(
            "response function 0x{:02X} does not match request 0x{:02X}",
            server_function,
            function.to_u8()
        )));
    }
    Ok(())
}

/// Parse a bit-read response (`unit_id + PDU`), returning `quantity` bits
/// LSB-first in ascending address order.
pub fn parse_bits(response: &[u8], quantity: u16) -> ModbusResult<Vec<bool>> {
    if response.len() < 3 {
        return Err(ModbusError::frame("bit response too short"));
    }
    let byte_count = response[2] as usize;
    if response.len() < 3 + byte_count {
        return Err(ModbusError::frame("incomplete bit response"));
    }
    if byte_count < (quantity as usize + 7) / 8 {
        return Err(ModbusError::frame("bit response byte count too small"));
    }
    Ok(words::unpack_bits(
        &response[3..3 + byte_count],
        quantity as usize,
    ))
}

/// Parse a register-read response (`unit_id + PDU`) into signed registers.
pub fn parse_registers(response: &[u8]) -> ModbusResult<Vec<i16>> {
    if response.len() < 3 {
        return Err(ModbusError::frame("register response too short"));
    }
    let byte_count = response[2] as usize;
    if byte_count % 2 != 0 {
        return Err(ModbusError::frame("odd register byte count"));
    }
    if response.len() < 3 + byte_count {
        return Err(ModbusError::frame("incomplete register response"));
    }
    Ok(response[3..3 + byte_count]
        .chunks(2)
        .map(|pair| i16::from_be_bytes([pair[0], pair[1]]))
        .collect())
}

/// RTU frame-detection predicate: a buffer holds a complete frame when it
/// is at least 6 bytes, the unit id is in `[1, 247]`, and the trailing two
/// bytes match the CRC of everything before them (`crc_lo` first).
pub fn frame_complete(buf: &[u8]) -> bool {
    if buf.len() < 6 {
        return false;
    }
    if buf[0] < 1 || buf[0] > 247 {
        return false;
    }
    let crc = crc16::checksum(&buf[..buf.len() - 2]);
    buf[buf.len() - 2..] == crc.to_le_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_holding_registers_tcp_bytes() {
        // txid=1, unit=0x11, start=0x006B, qty=3
        let adu =
            read_request(1, 0x11, FunctionCode::ReadHoldingRegisters, 0x006B, 3).unwrap();
        assert_eq!(
            adu.tcp_frame(),
            &[0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x11, 0x03, 0x00, 0x6B, 0x00, 0x03]
        );
        assert_eq!(adu.transaction_id(), 1);
        assert_eq!(adu.unit_id(), 0x11);
        assert_eq!(adu.function_code(), 0x03);
    }

    #[test]
    fn read_holding_registers_response_decodes() {
        // 0x022B, 0x0000, 0x0064 -> [555, 0, 100]
        let response = [0x11, 0x03, 0x06, 0x02, 0x2B, 0x00, 0x00, 0x00, 0x64];
        check_exception(FunctionCode::ReadHoldingRegisters, &response).unwrap();
        assert_eq!(parse_registers(&response).unwrap(), vec![555, 0, 100]);
    }

    #[test]
    fn write_single_coil_rtu_bytes() {
        let adu = write_single_coil_request(0, 0x11, 0x00AC, true);
        assert_eq!(
            adu.rtu_frame(),
            &[0x11, 0x05, 0x00, 0xAC, 0xFF, 0x00, 0x4E, 0x8B]
        );
        assert!(frame_complete(adu.rtu_frame()));
    }

    #[test]
    fn write_multiple_registers_tcp_bytes() {
        let adu = write_multiple_registers_request(2, 1, 1, &[0x000A, 0x0102]).unwrap();
        assert_eq!(
            adu.tcp_frame(),
            &[
                0x00, 0x02, 0x00, 0x00, 0x00, 0x0B, 0x01, 0x10, 0x00, 0x01, 0x00, 0x02,
                0x04, 0x00, 0x0A, 0x01, 0x02
            ]
        );
    }

    #[test]
    fn read_write_registers_pdu_shape() {
        let adu = read_write_registers_request(9, 1, 0x0003, 6, 0x000E, &[0x00FF]).unwrap();
        assert_eq!(
            adu.rtu_frame()[..adu.rtu_frame().len() - 2],
            [0x01, 0x17, 0x00, 0x03, 0x00, 0x06, 0x00, 0x0E, 0x00, 0x01, 0x02, 0x00, 0xFF]
        );
    }

    #[test]
    fn negative_register_values_encode_as_bit_pattern() {
        let adu = write_single_register_request(1, 1, 0, -2);
        assert_eq!(&adu.rtu_frame()[2..6], &[0x00, 0x00, 0xFF, 0xFE]);
    }

    #[test]
    fn quantity_limits_enforced_at_encode_time() {
        assert!(read_request(1, 1, FunctionCode::ReadCoils, 0, 2000).is_ok());
        assert!(read_request(1, 1, FunctionCode::ReadCoils, 0, 2001).is_err());
        assert!(read_request(1, 1, FunctionCode::ReadHoldingRegisters, 0, 126).is_err());
        assert!(read_request(1, 1, FunctionCode::ReadHoldingRegisters, 0, 0).is_err());
        assert!(write_multiple_coils_request(1, 1, 0, &vec![true; 2001]).is_err());
        assert!(write_multiple_registers_request(1, 1, 0, &vec![0; 126]).is_err());
        assert!(read_write_registers_request(1, 1, 0, 126, 0, &[0]).is_err());
        assert!(read_write_registers_request(1, 1, 0, 1, 0, &vec![0; 122]).is_err());
    }

    #[test]
    fn exception_response_maps_to_typed_error() {
        let response = [0x01, 0x83, 0x01];
        let err = check_exception(FunctionCode::ReadHoldingRegisters, &response).unwrap_err();
        assert_eq!(
            err.exception_kind(),
            Some(crate::error::ExceptionKind::FunctionCodeNotSupported)
        );
    }

    #[test]
    fn mismatched_function_rejected() {
        let response = [0x01, 0x04, 0x02, 0x00, 0x00];
        assert!(check_exception(FunctionCode::ReadHoldingRegisters, &response).is_err());
    }

    #[test]
    fn parse_bits_lsb_first() {
        let response = [0x01, 0x01, 0x01, 0b1010_1010];
        let bits = parse_bits(&response, 8).unwrap();
        assert_eq!(
            bits,
            vec![false, true, false, true, false, true, false, true]
        );
    }

    #[test]
    fn frame_predicate() {
        // Valid FC3 request frame.
        let good = [0x01, 0x03, 0x00, 0x00, 0x00, 0x02, 0xC4, 0x0B];
        assert!(frame_complete(&good));

        // Too short.
        assert!(!frame_complete(&good[..5]));

        // Unit id outside [1, 247].
        let mut zero_unit = good;
        zero_unit[0] = 0x00;
        assert!(!frame_complete(&zero_unit));

        // Corrupt CRC.
        let mut corrupt = good;
        corrupt[7] ^= 0x01;
        assert!(!frame_complete(&corrupt));
    }

    #[test]
    fn mbap_parse_rejects_bad_protocol() {
        let mut frame = vec![0x00, 0x01, 0x00, 0x01, 0x00, 0x06, 0x11, 0x03, 0x00, 0x6B, 0x00, 0x03];
        assert!(parse_mbap(&frame).is_err());
        frame[3] = 0x00;
        let header = parse_mbap(&frame).unwrap();
        assert_eq!(header.transaction_id, 1);
        assert_eq!(header.length, 6);
        assert_eq!(header.unit_id, 0x11);
    }
}
