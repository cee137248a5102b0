//! # Relaybus - Modbus TCP/UDP/RTU Master & Slave Stack
//!
//! A complete Modbus protocol stack in pure Rust: a master (client) and a
//! slave (server) in one library, over three transports — Modbus TCP,
//! Modbus UDP, and Modbus RTU serial.
//!
//! ## Features
//!
//! - **🚀 Async throughout**: built on Tokio; a multi-client TCP slave,
//!   datagram workers for UDP, and non-blocking serial I/O
//! - **🔧 One codec, two framings**: every request is composed once and
//!   sliced for MBAP (TCP/UDP) or CRC-framed RTU transmission
//! - **🛡️ Byte-exact wire format**: table-driven Modbus CRC-16,
//!   big-endian words, LSB-first bit packing
//! - **🔄 RTU resilience**: silent-interval frame delimiting with bounded
//!   retry on timeout and CRC mismatch
//! - **📊 Observable**: send/receive/connect hooks, change notifications,
//!   and a bounded ring of recent request/response pairs on the slave
//!
//! ## Supported Function Codes
//!
//! | Code | Function | Master | Slave |
//! |------|----------|--------|-------|
//! | 0x01 | Read Coils | ✅ | ✅ |
//! | 0x02 | Read Discrete Inputs | ✅ | ✅ |
//! | 0x03 | Read Holding Registers | ✅ | ✅ |
//! | 0x04 | Read Input Registers | ✅ | ✅ |
//! | 0x05 | Write Single Coil | ✅ | ✅ |
//! | 0x06 | Write Single Register | ✅ | ✅ |
//! | 0x0F | Write Multiple Coils | ✅ | ✅ |
//! | 0x10 | Write Multiple Registers | ✅ | ✅ |
//! | 0x17 | Read/Write Multiple Registers | ✅ | ✅ |
//!
//! ## Quick Start
//!
//! ### Master
//!
//! ```rust,no_run
//! use relaybus::{ModbusTcpMaster, ModbusResult};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> ModbusResult<()> {
//!     let addr = "127.0.0.1:502".parse().unwrap();
//!     let mut master = ModbusTcpMaster::connect(addr, Duration::from_secs(1)).await?;
//!
//!     let values = master.read_holding_registers(0x006B, 3).await?;
//!     println!("registers: {:?}", values);
//!
//!     master.write_single_coil(0x00AC, true).await?;
//!     master.close().await?;
//!     Ok(())
//! }
//! ```
//!
//! ### Slave
//!
//! ```rust,no_run
//! use relaybus::{ModbusSlave, ModbusTcpSlave, SlaveConfig, SlaveListener, TcpSlaveConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let slave = ModbusSlave::new(SlaveConfig::default());
//!     let mut listener = ModbusTcpSlave::new(TcpSlaveConfig::default(), slave);
//!     listener.start().await?;
//!     // Listener now serves in the background; mutate the banks via
//!     // listener.slave().register_bank().
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐    ┌─────────────────┐
//! │  ModbusMaster   │    │  ModbusSlave    │
//! │  (transaction   │    │  (dispatcher +  │
//! │   engine)       │    │   banks)        │
//! └─────────────────┘    └─────────────────┘
//!          │                       │
//! ┌─────────────────┐    ┌─────────────────┐
//! │  Frame codec    │    │  Frame codec    │
//! │  (MBAP / RTU)   │    │  (MBAP / RTU)   │
//! └─────────────────┘    └─────────────────┘
//!          │                       │
//! ┌─────────────────┐    ┌─────────────────┐
//! │  Transport      │◄──►│  Listener       │
//! │  (TCP/UDP/RTU)  │    │  (TCP/UDP/RTU)  │
//! └─────────────────┘    └─────────────────┘
//! ```

pub mod client;
pub mod crc16;
pub mod error;
pub mod events;
pub mod frame;
pub mod register_bank;
pub mod server;
pub mod transport;
pub mod words;

pub use client::{ModbusMaster, ModbusRtuMaster, ModbusTcpMaster, ModbusUdpMaster};
pub use error::{ExceptionKind, ModbusError, ModbusResult};
pub use events::{IoHooks, SlaveEvents, TrafficEntry, TrafficLog, TRAFFIC_LOG_CAPACITY};
pub use frame::{Adu, FunctionCode, MbapHeader};
pub use register_bank::{RegisterBank, BANK_SIZE};
pub use server::{
    ModbusRtuSlave, ModbusSlave, ModbusTcpSlave, ModbusUdpSlave, ServerStats, SlaveConfig,
    SlaveListener, TcpSlaveConfig,
};
pub use transport::{
    ModbusTransport, Parity, RtuTransport, SerialConfig, StopBits, TcpTransport, TransportStats,
    UdpTransport,
};
pub use words::WordOrder;

/// Maximum bits per read/write request (FC 1, 2, 15).
pub const MAX_BIT_COUNT: u16 = 2000;

/// Maximum registers per read/write request (FC 3, 4, 16).
pub const MAX_REGISTER_COUNT: u16 = 125;

/// Maximum registers written by a combined read/write request (FC 23).
pub const MAX_RW_WRITE_COUNT: u16 = 121;

/// Maximum MBAP frame size (header + PDU).
pub const MAX_TCP_FRAME_SIZE: usize = 260;

/// Maximum RTU frame size.
pub const MAX_RTU_FRAME_SIZE: usize = 256;

/// RTU accumulation buffer size on the slave.
pub const RTU_BUFFER_SIZE: usize = 2094;

/// Modbus TCP default port.
pub const DEFAULT_TCP_PORT: u16 = 502;

/// Default unit identifier.
pub const DEFAULT_UNIT_ID: u8 = 1;

/// Default master response timeout in milliseconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 1000;

/// Default RTU retry budget.
pub const DEFAULT_RETRIES: u32 = 3;

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
