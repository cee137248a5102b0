//! Transport adapters for TCP, UDP, and RTU serial.
//!
//! All three implement one contract: send a request ADU, return the
//! response normalized to `unit_id + PDU` bytes. TCP and UDP transmit the
//! MBAP slice of the ADU and never retry; the RTU transport transmits the
//! CRC-framed slice and owns the bounded retry loop on timeout and CRC
//! mismatch. The RTU transport (like the RTU listener in the server
//! module) is generic over the underlying stream so tests can drive it
//! with in-memory duplex pipes.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::{timeout, timeout_at, Instant};
use tokio_serial::SerialStream;

use crate::crc16;
use crate::error::{ModbusError, ModbusResult};
use crate::events::IoHooks;
use crate::frame::{self, Adu, MBAP_HEADER_LEN};
use crate::{DEFAULT_RETRIES, MAX_RTU_FRAME_SIZE, MAX_TCP_FRAME_SIZE};

/// Serial parity setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Parity {
    None,
    Odd,
    Even,
    Mark,
    Space,
}

impl Parity {
    fn to_serial(self) -> ModbusResult<tokio_serial::Parity> {
        match self {
            Self::None => Ok(tokio_serial::Parity::None),
            Self::Odd => Ok(tokio_serial::Parity::Odd),
            Self::Even => Ok(tokio_serial::Parity::Even),
            Self::Mark | Self::Space => Err(ModbusError::configuration(
                "mark/space parity is not supported by the serial driver",
            )),
        }
    }
}

/// Serial stop bits setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopBits {
    One,
    OnePointFive,
    Two,
}

impl StopBits {
    fn to_serial(self) -> ModbusResult<tokio_serial::StopBits> {
        match self {
            Self::One => Ok(tokio_serial::StopBits::One),
            Self::Two => Ok(tokio_serial::StopBits::Two),
            Self::OnePointFive => Err(ModbusError::configuration(
                "1.5 stop bits are not supported by the serial driver",
            )),
        }
    }
}

/// RTU serial line configuration. Data bits are fixed at 8.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialConfig {
    pub baud_rate: u32,
    pub parity: Parity,
    pub stop_bits: StopBits,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            baud_rate: 9600,
            parity: Parity::None,
            stop_bits: StopBits::One,
        }
    }
}

pub(crate) fn open_serial_stream(path: &str, config: &SerialConfig) -> ModbusResult<SerialStream> {
    let builder = tokio_serial::new(path, config.baud_rate)
        .data_bits(tokio_serial::DataBits::Eight)
        .parity(config.parity.to_serial()?)
        .stop_bits(config.stop_bits.to_serial()?);
    Ok(SerialStream::open(&builder)?)
}

/// Inter-frame silent interval for a baud rate: 3.5 character times at
/// 11 bits per character, floored at 1750 microseconds above 19200 baud.
pub fn silent_interval(baud_rate: u32) -> Duration {
    let char_time_us = 11_000_000u64 / baud_rate.max(1) as u64;
    let mut gap_us = char_time_us * 35 / 10;
    if baud_rate > 19200 {
        gap_us = gap_us.max(1750);
    }
    Duration::from_micros(gap_us)
}

/// Transport layer counters.
#[derive(Debug, Clone, Default)]
pub struct TransportStats {
    pub requests_sent: u64,
    pub responses_received: u64,
    pub errors: u64,
    pub timeouts: u64,
    pub retries: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// Common send/receive contract for the three transports.
#[async_trait]
pub trait ModbusTransport: Send {
    /// Transmit the request and return the response as `unit_id + PDU`
    /// bytes (MBAP stripped, RTU CRC validated and stripped).
    async fn transact(&mut self, adu: &Adu) -> ModbusResult<Vec<u8>>;

    /// Whether the transport is ready for I/O.
    fn is_connected(&self) -> bool;

    /// Close the transport.
    async fn close(&mut self) -> ModbusResult<()>;

    /// Counters accumulated since creation.
    fn stats(&self) -> TransportStats;
}

async fn io_deadline<T, F>(
    deadline: Instant,
    operation: &str,
    timeout_ms: u64,
    future: F,
) -> ModbusResult<T>
where
    F: std::future::Future<Output = std::io::Result<T>>,
{
    match timeout_at(deadline, future).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(err.into()),
        Err(_) => Err(ModbusError::timeout(operation, timeout_ms)),
    }
}

/// Modbus TCP transport: MBAP framing over a connected stream.
pub struct TcpTransport {
    stream: Option<TcpStream>,
    address: SocketAddr,
    timeout: Duration,
    hooks: IoHooks,
    stats: TransportStats,
}

impl TcpTransport {
    /// Connect to a server with a connection timeout.
    pub async fn connect(address: SocketAddr, timeout_dur: Duration) -> ModbusResult<Self> {
        Self::connect_with_hooks(address, timeout_dur, IoHooks::default()).await
    }

    /// Connect with observation hooks installed.
    pub async fn connect_with_hooks(
        address: SocketAddr,
        timeout_dur: Duration,
        hooks: IoHooks,
    ) -> ModbusResult<Self> {
        let stream = timeout(timeout_dur, TcpStream::connect(address))
            .await
            .map_err(|_| ModbusError::timeout("connect", timeout_dur.as_millis() as u64))?
            .map_err(|e| {
                ModbusError::connection(format!("failed to connect to {}: {}", address, e))
            })?;
        hooks.connected(true);
        Ok(Self {
            stream: Some(stream),
            address,
            timeout: timeout_dur,
            hooks,
            stats: TransportStats::default(),
        })
    }

    /// The configured server address.
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Replace the observation hooks.
    pub fn set_hooks(&mut self, hooks: IoHooks) {
        self.hooks = hooks;
    }

    async fn exchange(&mut self, adu: &Adu) -> ModbusResult<Vec<u8>> {
        let Some(stream) = self.stream.as_mut() else {
            return Err(ModbusError::NotConnected);
        };
        let request = adu.tcp_frame();
        let timeout_ms = self.timeout.as_millis() as u64;
        let deadline = Instant::now() + self.timeout;

        io_deadline(deadline, "send request", timeout_ms, stream.write_all(request)).await?;
        self.hooks.sent(request);
        self.stats.requests_sent += 1;
        self.stats.bytes_sent += request.len() as u64;

        loop {
            let mut header = [0u8; MBAP_HEADER_LEN];
            io_deadline(
                deadline,
                "read response header",
                timeout_ms,
                stream.read_exact(&mut header),
            )
            .await?;

            let protocol_id = u16::from_be_bytes([header[2], header[3]]);
            if protocol_id != 0 {
                return Err(ModbusError::frame(format!(
                    "invalid protocol id 0x{:04X}",
                    protocol_id
                )));
            }
            let length = u16::from_be_bytes([header[4], header[5]]) as usize;
            if length < 2 || MBAP_HEADER_LEN + length > MAX_TCP_FRAME_SIZE {
                return Err(ModbusError::frame(format!("invalid MBAP length {}", length)));
            }

            let mut body = vec![0u8; length];
            io_deadline(
                deadline,
                "read response body",
                timeout_ms,
                stream.read_exact(&mut body),
            )
            .await?;
            self.stats.bytes_received += (MBAP_HEADER_LEN + length) as u64;

            let mut full = Vec::with_capacity(MBAP_HEADER_LEN + length);
            full.extend_from_slice(&header);
            full.extend_from_slice(&body);
            self.hooks.received(&full);

            let transaction_id = u16::from_be_bytes([header[0], header[1]]);
            if transaction_id != adu.transaction_id() {
                debug!(
                    "discarding response with stale transaction id {} (expected {})",
                    transaction_id,
                    adu.transaction_id()
                );
                continue;
            }

            self.stats.responses_received += 1;
            return Ok(body);
        }
    }
}

#[async_trait]
impl ModbusTransport for TcpTransport {
    async fn transact(&mut self, adu: &Adu) -> ModbusResult<Vec<u8>> {
        let result = self.exchange(adu).await;
        if let Err(err) = &result {
            self.stats.errors += 1;
            if matches!(err, ModbusError::Timeout { .. }) {
                self.stats.timeouts += 1;
            }
            if err.is_transport_error() && self.stream.is_some() {
                self.stream = None;
                self.hooks.connected(false);
            }
        }
        result
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    async fn close(&mut self) -> ModbusResult<()> {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
            self.hooks.connected(false);
        }
        Ok(())
    }

    fn stats(&self) -> TransportStats {
        self.stats.clone()
    }
}

/// Modbus UDP transport: one MBAP ADU per datagram.
pub struct UdpTransport {
    socket: Option<UdpSocket>,
    peer: SocketAddr,
    timeout: Duration,
    hooks: IoHooks,
    stats: TransportStats,
}

impl UdpTransport {
    /// Bind an ephemeral local socket directed at `peer`.
    pub async fn bind(peer: SocketAddr, timeout_dur: Duration) -> ModbusResult<Self> {
        Self::bind_with_hooks(peer, timeout_dur, IoHooks::default()).await
    }

    /// Bind with observation hooks installed.
    pub async fn bind_with_hooks(
        peer: SocketAddr,
        timeout_dur: Duration,
        hooks: IoHooks,
    ) -> ModbusResult<Self> {
        let local = match peer {
            SocketAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            SocketAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
        };
        let socket = UdpSocket::bind(local).await?;
        socket
            .connect(peer)
            .await
            .map_err(|e| ModbusError::connection(format!("failed to direct socket: {}", e)))?;
        hooks.connected(true);
        Ok(Self {
            socket: Some(socket),
            peer,
            timeout: timeout_dur,
            hooks,
            stats: TransportStats::default(),
        })
    }

    /// The configured peer address.
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Replace the observation hooks.
    pub fn set_hooks(&mut self, hooks: IoHooks) {
        self.hooks = hooks;
    }

    async fn exchange(&mut self, adu: &Adu) -> ModbusResult<Vec<u8>> {
        let Some(socket) = self.socket.as_ref() else {
            return Err(ModbusError::NotConnected);
        };
        let request = adu.tcp_frame();
        let timeout_ms = self.timeout.as_millis() as u64;
        let deadline = Instant::now() + self.timeout;

        io_deadline(deadline, "send request", timeout_ms, socket.send(request)).await?;
        self.hooks.sent(request);
        self.stats.requests_sent += 1;
        self.stats.bytes_sent += request.len() as u64;

        loop {
            let mut datagram = [0u8; MAX_TCP_FRAME_SIZE];
            let n = io_deadline(
                deadline,
                "receive response",
                timeout_ms,
                socket.recv(&mut datagram),
            )
            .await?;
            let data = &datagram[..n];
            self.stats.bytes_received += n as u64;

            let header = frame::parse_mbap(data)?;
            self.hooks.received(data);

            if header.transaction_id != adu.transaction_id() {
                debug!(
                    "discarding datagram with stale transaction id {} (expected {})",
                    header.transaction_id,
                    adu.transaction_id()
                );
                continue;
            }

            self.stats.responses_received += 1;
            return Ok(
                data[MBAP_HEADER_LEN..MBAP_HEADER_LEN + header.length as usize].to_vec(),
            );
        }
    }
}

#[async_trait]
impl ModbusTransport for UdpTransport {
    async fn transact(&mut self, adu: &Adu) -> ModbusResult<Vec<u8>> {
        let result = self.exchange(adu).await;
        if let Err(err) = &result {
            self.stats.errors += 1;
            if matches!(err, ModbusError::Timeout { .. }) {
                self.stats.timeouts += 1;
            }
        }
        result
    }

    fn is_connected(&self) -> bool {
        self.socket.is_some()
    }

    async fn close(&mut self) -> ModbusResult<()> {
        if self.socket.take().is_some() {
            self.hooks.connected(false);
        }
        Ok(())
    }

    fn stats(&self) -> TransportStats {
        self.stats.clone()
    }
}

/// Modbus RTU transport over a serial stream.
///
/// Frames are delimited by the silent interval; a response is accepted
/// once the frame predicate holds and the unit id matches the request.
/// Timeouts and CRC mismatches re-issue the whole request up to the retry
/// budget.
pub struct RtuTransport<S = SerialStream> {
    port: Option<S>,
    silent_interval: Duration,
    timeout: Duration,
    retries: u32,
    hooks: IoHooks,
    stats: TransportStats,
}

impl RtuTransport<SerialStream> {
    /// Open a serial port with the given line configuration.
    pub fn open(path: &str, config: &SerialConfig, timeout_dur: Duration) -> ModbusResult<Self> {
        let port = open_serial_stream(path, config)?;
        Ok(Self::from_stream(port, config.baud_rate, timeout_dur))
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> RtuTransport<S> {
    /// Wrap an already-open stream; `baud_rate` sets the silent interval.
    pub fn from_stream(stream: S, baud_rate: u32, timeout_dur: Duration) -> Self {
        Self {
            port: Some(stream),
            silent_interval: silent_interval(baud_rate),
            timeout: timeout_dur,
            retries: DEFAULT_RETRIES,
            hooks: IoHooks::default(),
            stats: TransportStats::default(),
        }
    }

    /// Number of re-issues allowed on timeout or CRC mismatch.
    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Set the retry budget.
    pub fn set_retries(&mut self, retries: u32) {
        self.retries = retries;
    }

    /// Replace the observation hooks.
    pub fn set_hooks(&mut self, hooks: IoHooks) {
        self.hooks = hooks;
    }

    async fn attempt(&mut self, adu: &Adu) -> ModbusResult<Vec<u8>> {
        let Some(port) = self.port.as_mut() else {
            return Err(ModbusError::SerialPortNotOpen);
        };
        let request = adu.rtu_frame();
        let timeout_ms = self.timeout.as_millis() as u64;
        let deadline = Instant::now() + self.timeout;

        io_deadline(deadline, "send request", timeout_ms, port.write_all(request)).await?;
        io_deadline(deadline, "flush request", timeout_ms, port.flush()).await?;
        self.hooks.sent(request);
        self.stats.requests_sent += 1;
        self.stats.bytes_sent += request.len() as u64;

        let expected_unit = adu.unit_id();
        let mut buf: Vec<u8> = Vec::with_capacity(MAX_RTU_FRAME_SIZE);
        let mut chunk = [0u8; MAX_RTU_FRAME_SIZE];

        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(ModbusError::timeout("read response", timeout_ms));
            }
            // The first byte may take the whole deadline; after that a
            // silent gap delimits the frame.
            let wait = if buf.is_empty() {
                deadline
            } else {
                (now + self.silent_interval).min(deadline)
            };

            match timeout_at(wait, port.read(&mut chunk)).await {
                Ok(Ok(0)) => return Err(ModbusError::connection("serial stream closed")),
                Ok(Ok(n)) => {
                    buf.extend_from_slice(&chunk[..n]);
                    self.stats.bytes_received += n as u64;
                    if frame::frame_complete(&buf) {
                        if buf[0] != expected_unit {
                            debug!(
                                "discarding frame from unit {} (expected {})",
                                buf[0], expected_unit
                            );
                            buf.clear();
                            continue;
                        }
                        self.hooks.received(&buf);
                        self.stats.responses_received += 1;
                        buf.truncate(buf.len() - 2);
                        return Ok(buf);
                    }
                }
                Ok(Err(err)) => return Err(err.into()),
                Err(_) => {
                    // Silence: whatever was received is the whole frame.
                    if buf.len() >= 6 {
                        if buf[0] != expected_unit {
                            buf.clear();
                            continue;
                        }
                        let expected = crc16::checksum(&buf[..buf.len() - 2]);
                        let actual =
                            u16::from_le_bytes([buf[buf.len() - 2], buf[buf.len() - 1]]);
                        return Err(ModbusError::crc_check_failed(expected, actual));
                    }
                    // Short garbage burst; drop it and keep listening.
                    buf.clear();
                }
            }
        }
    }
}

#[async_trait]
impl<S: AsyncRead + AsyncWrite + Unpin + Send> ModbusTransport for RtuTransport<S> {
    async fn transact(&mut self, adu: &Adu) -> ModbusResult<Vec<u8>> {
        if self.port.is_none() {
            return Err(ModbusError::SerialPortNotOpen);
        }
        let mut failure =
            ModbusError::timeout("read response", self.timeout.as_millis() as u64);
        for attempt in 0..=self.retries {
            if attempt > 0 {
                self.stats.retries += 1;
                debug!(
                    "re-issuing RTU request, attempt {}/{}",
                    attempt + 1,
                    self.retries + 1
                );
            }
            match self.attempt(adu).await {
                Ok(response) => return Ok(response),
                Err(err @ ModbusError::Timeout { .. }) => {
                    self.stats.timeouts += 1;
                    failure = err;
                }
                Err(err @ ModbusError::CrcCheckFailed { .. }) => {
                    self.stats.errors += 1;
                    failure = err;
                }
                Err(err) => {
                    self.stats.errors += 1;
                    return Err(err);
                }
            }
        }
        self.stats.errors += 1;
        Err(failure)
    }

    fn is_connected(&self) -> bool {
        self.port.is_some()
    }

    async fn close(&mut self) -> ModbusResult<()> {
        if self.port.take().is_some() {
            self.hooks.connected(false);
        }
        Ok(())
    }

    fn stats(&self) -> TransportStats {
        self.stats.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn silent_interval_formula() {
        // 9600 baud: 11 bits / 9600 = 1145us per char, * 3.5 = 4007us.
        assert_eq!(silent_interval(9600), Duration::from_micros(4007));
        // 19200: half of that, no floor applied.
        assert_eq!(silent_interval(19200), Duration::from_micros(2002));
        // 115200: floored at 1750us.
        assert_eq!(silent_interval(115_200), Duration::from_micros(1750));
    }

    #[test]
    fn serial_config_rejects_unsupported_line_settings() {
        assert!(Parity::None.to_serial().is_ok());
        assert!(Parity::Odd.to_serial().is_ok());
        assert!(Parity::Even.to_serial().is_ok());
        assert!(Parity::Mark.to_serial().is_err());
        assert!(Parity::Space.to_serial().is_err());
        assert!(StopBits::One.to_serial().is_ok());
        assert!(StopBits::Two.to_serial().is_ok());
        assert!(StopBits::OnePointFive.to_serial().is_err());
    }

    #[test]
    fn serial_config_from_json() {
        let config: SerialConfig = serde_json::from_str(
            r#"{"baud_rate":19200,"parity":"Even","stop_bits":"One"}"#,
        )
        .unwrap();
        assert_eq!(config.baud_rate, 19200);
        assert_eq!(config.parity, Parity::Even);
        assert_eq!(config.stop_bits, StopBits::One);
    }

    #[tokio::test]
    async fn rtu_transact_requires_open_port() {
        let (client, _server) = tokio::io::duplex(256);
        let mut transport = RtuTransport::from_stream(client, 9600, Duration::from_millis(50));
        transport.close().await.unwrap();
        let adu = frame::read_request(1, 1, frame::FunctionCode::ReadCoils, 0, 1).unwrap();
        assert!(matches!(
            transport.transact(&adu).await,
            Err(ModbusError::SerialPortNotOpen)
        ));
    }
}
