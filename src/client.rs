//! Master (client) transaction engine.
//!
//! `ModbusMaster` implements the application layer once over any
//! transport: the PDU is identical across TCP, UDP, and RTU, so each
//! operation is an encoder, one `transact` round trip, and a decoder.
//! Operations are totally ordered within one master: each call holds
//! `&mut self` until the transaction completes or fails.

use std::net::SocketAddr;
use std::time::Duration;

use log::debug;
use tokio_serial::SerialStream;

use crate::error::ModbusResult;
use crate::events::IoHooks;
use crate::frame::{self, Adu, FunctionCode};
use crate::transport::{
    ModbusTransport, RtuTransport, SerialConfig, TcpTransport, TransportStats, UdpTransport,
};
use crate::DEFAULT_UNIT_ID;

/// Generic Modbus master over any transport.
pub struct ModbusMaster<T: ModbusTransport> {
    transport: T,
    unit_id: u8,
    transaction_id: u16,
}

impl<T: ModbusTransport> ModbusMaster<T> {
    /// Create a master addressing the default unit identifier (1).
    pub fn new(transport: T) -> Self {
        Self::with_unit_id(transport, DEFAULT_UNIT_ID)
    }

    /// Create a master addressing a specific unit identifier.
    pub fn with_unit_id(transport: T, unit_id: u8) -> Self {
        Self {
            transport,
            unit_id,
            transaction_id: 0,
        }
    }

    /// The configured unit identifier.
    pub fn unit_id(&self) -> u8 {
        self.unit_id
    }

    /// Address a different unit identifier (0 = broadcast).
    pub fn set_unit_id(&mut self, unit_id: u8) {
        self.unit_id = unit_id;
    }

    /// Borrow the underlying transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Mutably borrow the underlying transport.
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Whether the transport is ready for I/O.
    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    /// Close the transport; in-flight calls on other handles fail with a
    /// connection error.
    pub async fn close(&mut self) -> ModbusResult<()> {
        self.transport.close().await
    }

    /// Transport counters.
    pub fn stats(&self) -> TransportStats {
        self.transport.stats()
    }

    fn next_transaction_id(&mut self) -> u16 {
        self.transaction_id = self.transaction_id.wrapping_add(1);
        self.transaction_id
    }

    async fn transact(&mut self, adu: Adu, function: FunctionCode) -> ModbusResult<Vec<u8>> {
        debug!(
            "issuing {} txid={} unit={}",
            function,
            adu.transaction_id(),
            adu.unit_id()
        );
        let response = self.transport.transact(&adu).await?;
        frame::check_exception(function, &response)?;
        Ok(response)
    }

    /// Read coils (FC 1).
    pub async fn read_coils(&mut self, address: u16, quantity: u16) -> ModbusResult<Vec<bool>> {
        let txid = self.next_transaction_id();
        let adu = frame::read_request(txid, self.unit_id, FunctionCode::ReadCoils, address, quantity)?;
        let response = self.transact(adu, FunctionCode::ReadCoils).await?;
        frame::parse_bits(&response, quantity)
    }

    /// Read discrete inputs (FC 2).
    pub async fn read_discrete_inputs(
        &mut self,
        address: u16,
        quantity: u16,
    ) -> ModbusResult<Vec<bool>> {
        let txid = self.next_transaction_id();
        let adu = frame::read_request(
            txid,
            self.unit_id,
            FunctionCode::ReadDiscreteInputs,
            address,
            quantity,
        )?;
        let response = self.transact(adu, FunctionCode::ReadDiscreteInputs).await?;
        frame::parse_bits(&response, quantity)
    }

    /// Read holding registers (FC 3). Registers are signed 16-bit.
    pub async fn read_holding_registers(
        &mut self,
        address: u16,
        quantity: u16,
    ) -> ModbusResult<Vec<i16>> {
        let txid = self.next_transaction_id();
        let adu = frame::read_request(
            txid,
            self.unit_id,
            FunctionCode::ReadHoldingRegisters,
            address,
            quantity,
        )?;
        let response = self
            .transact(adu, FunctionCode::ReadHoldingRegisters)
            .await?;
        frame::parse_registers(&response)
    }

    /// Read input registers (FC 4).
    pub async fn read_input_registers(
        &mut self,
        address: u16,
        quantity: u16,
    ) -> ModbusResult<Vec<i16>> {
        let txid = self.next_transaction_id();
        let adu = frame::read_request(
            txid,
            self.unit_id,
            FunctionCode::ReadInputRegisters,
            address,
            quantity,
        )?;
        let response = self.transact(adu, FunctionCode::ReadInputRegisters).await?;
        frame::parse_registers(&response)
    }

    /// Write a single coil (FC 5).
    pub async fn write_single_coil(&mut self, address: u16, value: bool) -> ModbusResult<()> {
        let txid = self.next_transaction_id();
        let adu = frame::write_single_coil_request(txid, self.unit_id, address, value);
        self.transact(adu, FunctionCode::WriteSingleCoil).await?;
        Ok(())
    }

    /// Write a single holding register (FC 6).
    pub async fn write_single_register(&mut self, address: u16, value: i16) -> ModbusResult<()> {
        let txid = self.next_transaction_id();
        let adu = frame::write_single_register_request(txid, self.unit_id, address, value);
        self.transact(adu, FunctionCode::WriteSingleRegister).await?;
        Ok(())
    }

    /// Write multiple coils (FC 15).
    pub async fn write_multiple_coils(
        &mut self,
        address: u16,
        values: &[bool],
    ) -> ModbusResult<()> {
        let txid = self.next_transaction_id();
        let adu = frame::write_multiple_coils_request(txid, self.unit_id, address, values)?;
        self.transact(adu, FunctionCode::WriteMultipleCoils).await?;
        Ok(())
    }

    /// Write multiple holding registers (FC 16).
    pub async fn write_multiple_registers(
        &mut self,
        address: u16,
        values: &[i16],
    ) -> ModbusResult<()> {
        let txid = self.next_transaction_id();
        let adu = frame::write_multiple_registers_request(txid, self.unit_id, address, values)?;
        self.transact(adu, FunctionCode::WriteMultipleRegisters)
            .await?;
        Ok(())
    }

    /// Write then read holding registers in one transaction (FC 23).
    pub async fn read_write_multiple_registers(
        &mut self,
        read_address: u16,
        read_quantity: u16,
        write_address: u16,
        values: &[i16],
    ) -> ModbusResult<Vec<i16>> {
        let txid = self.next_transaction_id();
        let adu = frame::read_write_registers_request(
            txid,
            self.unit_id,
            read_address,
            read_quantity,
            write_address,
            values,
        )?;
        let response = self
            .transact(adu, FunctionCode::ReadWriteMultipleRegisters)
            .await?;
        frame::parse_registers(&response)
    }
}

/// Master over Modbus TCP.
pub type ModbusTcpMaster = ModbusMaster<TcpTransport>;

impl ModbusMaster<TcpTransport> {
    /// Connect to a TCP server.
    pub async fn connect(address: SocketAddr, timeout: Duration) -> ModbusResult<Self> {
        Ok(Self::new(TcpTransport::connect(address, timeout).await?))
    }

    /// Connect with observation hooks installed.
    pub async fn connect_with_hooks(
        address: SocketAddr,
        timeout: Duration,
        hooks: IoHooks,
    ) -> ModbusResult<Self> {
        Ok(Self::new(
            TcpTransport::connect_with_hooks(address, timeout, hooks).await?,
        ))
    }
}

/// Master over Modbus UDP.
pub type ModbusUdpMaster = ModbusMaster<UdpTransport>;

impl ModbusMaster<UdpTransport> {
    /// Bind a local socket directed at a UDP server.
    pub async fn bind(peer: SocketAddr, timeout: Duration) -> ModbusResult<Self> {
        Ok(Self::new(UdpTransport::bind(peer, timeout).await?))
    }

    /// Bind with observation hooks installed.
    pub async fn bind_with_hooks(
        peer: SocketAddr,
        timeout: Duration,
        hooks: IoHooks,
    ) -> ModbusResult<Self> {
        Ok(Self::new(
            UdpTransport::bind_with_hooks(peer, timeout, hooks).await?,
        ))
    }
}

/// Master over Modbus RTU serial.
pub type ModbusRtuMaster = ModbusMaster<RtuTransport>;

impl ModbusMaster<RtuTransport<SerialStream>> {
    /// Open a serial port.
    pub fn open(path: &str, config: &SerialConfig, timeout: Duration) -> ModbusResult<Self> {
        Ok(Self::new(RtuTransport::open(path, config, timeout)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};

    use crate::error::{ExceptionKind, ModbusError};

    /// Transport that records requests and replays scripted responses.
    struct ScriptedTransport {
        requests: Arc<Mutex<Vec<Vec<u8>>>>,
        responses: Vec<Vec<u8>>,
        cursor: usize,
    }

    impl ScriptedTransport {
        fn new(responses: Vec<Vec<u8>>) -> Self {
            Self {
                requests: Arc::new(Mutex::new(Vec::new())),
                responses,
                cursor: 0,
            }
        }
    }

    #[async_trait]
    impl ModbusTransport for ScriptedTransport {
        async fn transact(&mut self, adu: &Adu) -> ModbusResult<Vec<u8>> {
            self.requests.lock().unwrap().push(adu.tcp_frame().to_vec());
            let response = self.responses[self.cursor].clone();
            self.cursor += 1;
            Ok(response)
        }

        fn is_connected(&self) -> bool {
            true
        }

        async fn close(&mut self) -> ModbusResult<()> {
            Ok(())
        }

        fn stats(&self) -> TransportStats {
            TransportStats::default()
        }
    }

    #[tokio::test]
    async fn read_holding_registers_decodes_signed_values() {
        let response = vec![0x11, 0x03, 0x06, 0x02, 0x2B, 0x00, 0x00, 0xFF, 0x9C];
        let transport = ScriptedTransport::new(vec![response]);
        let mut master = ModbusMaster::with_unit_id(transport, 0x11);

        let registers = master.read_holding_registers(0x006B, 3).await.unwrap();
        assert_eq!(registers, vec![555, 0, -100]);

        let requests = master.transport().requests.lock().unwrap().clone();
        assert_eq!(
            requests[0],
            vec![0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x11, 0x03, 0x00, 0x6B, 0x00, 0x03]
        );
    }

    #[tokio::test]
    async fn exception_response_surfaces_typed_error() {
        let transport = ScriptedTransport::new(vec![vec![0x01, 0x83, 0x01]]);
        let mut master = ModbusMaster::new(transport);
        let err = master.read_holding_registers(0, 1).await.unwrap_err();
        assert_eq!(
            err.exception_kind(),
            Some(ExceptionKind::FunctionCodeNotSupported)
        );
    }

    #[tokio::test]
    async fn transaction_ids_increment_per_request() {
        let responses = vec![
            vec![0x01, 0x05, 0x00, 0x00, 0xFF, 0x00],
            vec![0x01, 0x05, 0x00, 0x00, 0x00, 0x00],
        ];
        let transport = ScriptedTransport::new(responses);
        let mut master = ModbusMaster::new(transport);
        master.write_single_coil(0, true).await.unwrap();
        master.write_single_coil(0, false).await.unwrap();

        let requests = master.transport().requests.lock().unwrap().clone();
        assert_eq!(&requests[0][..2], &[0x00, 0x01]);
        assert_eq!(&requests[1][..2], &[0x00, 0x02]);
    }

    #[tokio::test]
    async fn illegal_quantity_fails_before_any_io() {
        let transport = ScriptedTransport::new(vec![]);
        let mut master = ModbusMaster::new(transport);
        let err = master.read_coils(0, 2001).await.unwrap_err();
        assert!(matches!(err, ModbusError::IllegalArgument { .. }));
        assert!(master.transport().requests.lock().unwrap().is_empty());
    }
}
