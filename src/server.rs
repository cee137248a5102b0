//! Slave (server) dispatcher and listeners.
//!
//! `ModbusSlave` is the transport-independent core: it parses an inbound
//! ADU, validates it, executes against the register banks, and composes
//! the response or exception. Decode and bank mutation happen under one
//! dispatch lock, so concurrent requests from different peers are
//! serialized. The three listeners feed it frames: a TCP accept loop with
//! an idle-client reaper and optional peer allowlist, a UDP receive loop
//! with one worker per datagram, and an RTU serial loop delimiting frames
//! by the silent interval.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::BytesMut;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{broadcast, Notify};
use tokio_serial::SerialStream;

use crate::crc16;
use crate::error::{ModbusError, ModbusResult};
use crate::events::{SlaveEvents, TrafficLog};
use crate::frame::{self, FunctionCode, MBAP_HEADER_LEN};
use crate::register_bank::RegisterBank;
use crate::transport::{self, SerialConfig};
use crate::words;
use crate::{MAX_BIT_COUNT, MAX_REGISTER_COUNT, MAX_RW_WRITE_COUNT, MAX_TCP_FRAME_SIZE, RTU_BUFFER_SIZE};

const EXC_ILLEGAL_FUNCTION: u8 = 0x01;
const EXC_ILLEGAL_DATA_ADDRESS: u8 = 0x02;
const EXC_ILLEGAL_DATA_VALUE: u8 = 0x03;

/// Slave-side configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlaveConfig {
    /// Unit identifier this slave answers to (0 is always accepted as
    /// broadcast).
    pub unit_id: u8,
    /// Function codes answered with exception 1 (illegal function).
    pub disabled_functions: HashSet<FunctionCode>,
}

impl Default for SlaveConfig {
    fn default() -> Self {
        Self {
            unit_id: crate::DEFAULT_UNIT_ID,
            disabled_functions: HashSet::new(),
        }
    }
}

impl SlaveConfig {
    /// Disable a function code.
    pub fn disable_function(&mut self, function: FunctionCode) {
        self.disabled_functions.insert(function);
    }

    /// Re-enable a function code.
    pub fn enable_function(&mut self, function: FunctionCode) {
        self.disabled_functions.remove(&function);
    }

    /// Whether a function code is served.
    pub fn is_enabled(&self, function: FunctionCode) -> bool {
        !self.disabled_functions.contains(&function)
    }
}

/// Listener statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    /// Active TCP connections.
    pub connections: usize,
    pub total_requests: u64,
    pub responses_sent: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
}

/// Transport-independent request dispatcher.
#[derive(Debug)]
pub struct ModbusSlave {
    config: SlaveConfig,
    bank: Arc<RegisterBank>,
    events: SlaveEvents,
    traffic: TrafficLog,
    dispatch_lock: Mutex<()>,
}

impl ModbusSlave {
    /// Create a dispatcher with a fresh register bank.
    pub fn new(config: SlaveConfig) -> Self {
        Self::with_bank(config, Arc::new(RegisterBank::new()))
    }

    /// Create a dispatcher over an existing register bank.
    pub fn with_bank(config: SlaveConfig, bank: Arc<RegisterBank>) -> Self {
        Self {
            config,
            bank,
            events: SlaveEvents::default(),
            traffic: TrafficLog::new(),
            dispatch_lock: Mutex::new(()),
        }
    }

    /// Install state-change hooks.
    pub fn set_events(&mut self, events: SlaveEvents) {
        self.events = events;
    }

    /// The configuration in effect.
    pub fn config(&self) -> &SlaveConfig {
        &self.config
    }

    /// Shared handle to the register banks.
    pub fn register_bank(&self) -> Arc<RegisterBank> {
        self.bank.clone()
    }

    /// The retained request/response ring.
    pub fn traffic(&self) -> &TrafficLog {
        &self.traffic
    }

    pub(crate) fn events(&self) -> &SlaveEvents {
        &self.events
    }

    /// Process one MBAP-framed request. Returns `None` when the frame is
    /// malformed or addressed to another unit.
    pub fn process_mbap_frame(&self, request: &[u8]) -> Option<Vec<u8>> {
        let _guard = self.dispatch_lock.lock().unwrap();
        let header = match frame::parse_mbap(request) {
            Ok(header) => header,
            Err(err) => {
                warn!("dropping malformed frame: {} ({})", err, hex::encode(request));
                return None;
            }
        };
        if header.unit_id != self.config.unit_id && header.unit_id != 0 {
            debug!("ignoring frame for unit {}", header.unit_id);
            return None;
        }
        let pdu = &request[MBAP_HEADER_LEN + 1..MBAP_HEADER_LEN + header.length as usize];
        let out_pdu = self.execute_pdu(pdu);

        let mut response = Vec::with_capacity(MBAP_HEADER_LEN + 1 + out_pdu.len());
        response.extend_from_slice(&header.transaction_id.to_be_bytes());
        response.extend_from_slice(&0u16.to_be_bytes());
        response.extend_from_slice(&((1 + out_pdu.len()) as u16).to_be_bytes());
        response.push(header.unit_id);
        response.extend_from_slice(&out_pdu);

        self.traffic.record(request, &response);
        self.events.log_changed();
        Some(response)
    }

    /// Process one CRC-framed RTU request. Returns `None` when the frame
    /// fails the frame predicate or is addressed to another unit.
    pub fn process_rtu_frame(&self, request: &[u8]) -> Option<Vec<u8>> {
        let _guard = self.dispatch_lock.lock().unwrap();
        if !frame::frame_complete(request) {
            return None;
        }
        let unit_id = request[0];
        if unit_id != self.config.unit_id && unit_id != 0 {
            debug!("ignoring frame for unit {}", unit_id);
            return None;
        }
        let pdu = &request[1..request.len() - 2];
        let out_pdu = self.execute_pdu(pdu);

        let mut response = Vec::with_capacity(1 + out_pdu.len() + 2);
        response.push(unit_id);
        response.extend_from_slice(&out_pdu);
        let crc = crc16::checksum(&response);
        response.extend_from_slice(&crc.to_le_bytes());

        self.traffic.record(request, &response);
        self.events.log_changed();
        Some(response)
    }

    fn execute_pdu(&self, pdu: &[u8]) -> Vec<u8> {
        let Some(&fc_raw) = pdu.first() else {
            return vec![0x80, EXC_ILLEGAL_FUNCTION];
        };
        let data = &pdu[1..];
        let result = match FunctionCode::from_u8(fc_raw) {
            Ok(function) if self.config.is_enabled(function) => {
                self.execute_function(function, data)
            }
            _ => Err(EXC_ILLEGAL_FUNCTION),
        };
        match result {
            Ok(payload) => {
                let mut out = Vec::with_capacity(1 + payload.len());
                out.push(fc_raw);
                out.extend_from_slice(&payload);
                out
            }
            Err(code) => {
                debug!("function 0x{:02X} rejected with exception {}", fc_raw, code);
                vec![fc_raw | 0x80, code]
            }
        }
    }

    fn execute_function(&self, function: FunctionCode, data: &[u8]) -> Result<Vec<u8>, u8> {
        match function {
            FunctionCode::ReadCoils | FunctionCode::ReadDiscreteInputs => {
                self.read_bits(function, data)
            }
            FunctionCode::ReadHoldingRegisters | FunctionCode::ReadInputRegisters => {
                self.read_registers(function, data)
            }
            FunctionCode::WriteSingleCoil => self.write_single_coil(data),
            FunctionCode::WriteSingleRegister => self.write_single_register(data),
            FunctionCode::WriteMultipleCoils => self.write_multiple_coils(data),
            FunctionCode::WriteMultipleRegisters => self.write_multiple_registers(data),
            FunctionCode::ReadWriteMultipleRegisters => self.read_write_registers(data),
        }
    }

    /// Address check shared by every function: the last touched address
    /// must satisfy `start + 1 + quantity <= 65535`.
    fn address_in_range(address: u16, quantity: u16) -> bool {
        address as u32 + 1 + quantity as u32 <= 65535
    }

    fn read_bits(&self, function: FunctionCode, data: &[u8]) -> Result<Vec<u8>, u8> {
        if data.len() < 4 {
            return Err(EXC_ILLEGAL_DATA_VALUE);
        }
        let address = u16::from_be_bytes([data[0], data[1]]);
        let quantity = u16::from_be_bytes([data[2], data[3]]);
        if quantity == 0 || quantity > MAX_BIT_COUNT {
            return Err(EXC_ILLEGAL_DATA_VALUE);
        }
        if !Self::address_in_range(address, quantity) {
            return Err(EXC_ILLEGAL_DATA_ADDRESS);
        }
        let bits = match function {
            FunctionCode::ReadCoils => self.bank.read_coils(address, quantity),
            _ => self.bank.read_discrete_inputs(address, quantity),
        }
        .map_err(|_| EXC_ILLEGAL_DATA_ADDRESS)?;
        let packed = words::pack_bits(&bits);
        let mut payload = Vec::with_capacity(1 + packed.len());
        payload.push(packed.len() as u8);
        payload.extend_from_slice(&packed);
        Ok(payload)
    }

    fn read_registers(&self, function: FunctionCode, data: &[u8]) -> Result<Vec<u8>, u8> {
        if data.len() < 4 {
            return Err(EXC_ILLEGAL_DATA_VALUE);
        }
        let address = u16::from_be_bytes([data[0], data[1]]);
        let quantity = u16::from_be_bytes([data[2], data[3]]);
        if quantity == 0 || quantity > MAX_REGISTER_COUNT {
            return Err(EXC_ILLEGAL_DATA_VALUE);
        }
        if !Self::address_in_range(address, quantity) {
            return Err(EXC_ILLEGAL_DATA_ADDRESS);
        }
        let registers = match function {
            FunctionCode::ReadHoldingRegisters => {
                self.bank.read_holding_registers(address, quantity)
            }
            _ => self.bank.read_input_registers(address, quantity),
        }
        .map_err(|_| EXC_ILLEGAL_DATA_ADDRESS)?;
        let mut payload = Vec::with_capacity(1 + registers.len() * 2);
        payload.push((registers.len() * 2) as u8);
        for register in registers {
            payload.extend_from_slice(&register.to_be_bytes());
        }
        Ok(payload)
    }

    fn write_single_coil(&self, data: &[u8]) -> Result<Vec<u8>, u8> {
        if data.len() < 4 {
            return Err(EXC_ILLEGAL_DATA_VALUE);
        }
        let address = u16::from_be_bytes([data[0], data[1]]);
        let value = u16::from_be_bytes([data[2], data[3]]);
        if !Self::address_in_range(address, 1) {
            return Err(EXC_ILLEGAL_DATA_ADDRESS);
        }
        let state = match value {
            0x0000 => false,
            0xFF00 => true,
            _ => return Err(EXC_ILLEGAL_DATA_VALUE),
        };
        self.bank
            .write_coil(address, state)
            .map_err(|_| EXC_ILLEGAL_DATA_ADDRESS)?;
        self.events.coils_changed(address + 1, 1);
        Ok(data[..4].to_vec())
    }

    fn write_single_register(&self, data: &[u8]) -> Result<Vec<u8>, u8> {
        if data.len() < 4 {
            return Err(EXC_ILLEGAL_DATA_VALUE);
        }
        let address = u16::from_be_bytes([data[0], data[1]]);
        let value = i16::from_be_bytes([data[2], data[3]]);
        if !Self::address_in_range(address, 1) {
            return Err(EXC_ILLEGAL_DATA_ADDRESS);
        }
        self.bank
            .write_holding_register(address, value)
            .map_err(|_| EXC_ILLEGAL_DATA_ADDRESS)?;
        self.events.holding_registers_changed(address + 1, 1);
        Ok(data[..4].to_vec())
    }

    fn write_multiple_coils(&self, data: &[u8]) -> Result<Vec<u8>, u8> {
        if data.len() < 5 {
            return Err(EXC_ILLEGAL_DATA_VALUE);
        }
        let address = u16::from_be_bytes([data[0], data[1]]);
        let quantity = u16::from_be_bytes([data[2], data[3]]);
        if quantity == 0 || quantity > MAX_BIT_COUNT {
            return Err(EXC_ILLEGAL_DATA_VALUE);
        }
        if !Self::address_in_range(address, quantity) {
            return Err(EXC_ILLEGAL_DATA_ADDRESS);
        }
        let byte_count = data[4] as usize;
        if byte_count != (quantity as usize + 7) / 8 || data.len() < 5 + byte_count {
            return Err(EXC_ILLEGAL_DATA_VALUE);
        }
        let values = words::unpack_bits(&data[5..5 + byte_count], quantity as usize);
        self.bank
            .write_coils(address, &values)
            .map_err(|_| EXC_ILLEGAL_DATA_ADDRESS)?;
        self.events.coils_changed(address + 1, quantity);
        Ok(data[..4].to_vec())
    }

    fn write_multiple_registers(&self, data: &[u8]) -> Result<Vec<u8>, u8> {
        if data.len() < 5 {
            return Err(EXC_ILLEGAL_DATA_VALUE);
        }
        let address = u16::from_be_bytes([data[0], data[1]]);
        let quantity = u16::from_be_bytes([data[2], data[3]]);
        if quantity == 0 || quantity > MAX_REGISTER_COUNT {
            return Err(EXC_ILLEGAL_DATA_VALUE);
        }
        if !Self::address_in_range(address, quantity) {
            return Err(EXC_ILLEGAL_DATA_ADDRESS);
        }
        let byte_count = data[4] as usize;
        if byte_count != quantity as usize * 2 || data.len() < 5 + byte_count {
            return Err(EXC_ILLEGAL_DATA_VALUE);
        }
        let values: Vec<i16> = data[5..5 + byte_count]
            .chunks(2)
            .map(|pair| i16::from_be_bytes([pair[0], pair[1]]))
            .collect();
        self.bank
            .write_holding_registers(address, &values)
            .map_err(|_| EXC_ILLEGAL_DATA_ADDRESS)?;
        self.events.holding_registers_changed(address + 1, quantity);
        Ok(data[..4].to_vec())
    }

    fn read_write_registers(&self, data: &[u8]) -> Result<Vec<u8>, u8> {
        if data.len() < 9 {
            return Err(EXC_ILLEGAL_DATA_VALUE);
        }
        let read_address = u16::from_be_bytes([data[0], data[1]]);
        let read_quantity = u16::from_be_bytes([data[2], data[3]]);
        let write_address = u16::from_be_bytes([data[4], data[5]]);
        let write_quantity = u16::from_be_bytes([data[6], data[7]]);
        if read_quantity == 0 || read_quantity > MAX_REGISTER_COUNT {
            return Err(EXC_ILLEGAL_DATA_VALUE);
        }
        if write_quantity == 0 || write_quantity > MAX_RW_WRITE_COUNT {
            return Err(EXC_ILLEGAL_DATA_VALUE);
        }
        if !Self::address_in_range(read_address, read_quantity)
            || !Self::address_in_range(write_address, write_quantity)
        {
            return Err(EXC_ILLEGAL_DATA_ADDRESS);
        }
        let byte_count = data[8] as usize;
        if byte_count != write_quantity as usize * 2 || data.len() < 9 + byte_count {
            return Err(EXC_ILLEGAL_DATA_VALUE);
        }
        let values: Vec<i16> = data[9..9 + byte_count]
            .chunks(2)
            .map(|pair| i16::from_be_bytes([pair[0], pair[1]]))
            .collect();
        // Write first, then read, in one critical section on the bank.
        let registers = self
            .bank
            .read_write_holding_registers(read_address, read_quantity, write_address, &values)
            .map_err(|_| EXC_ILLEGAL_DATA_ADDRESS)?;
        self.events
            .holding_registers_changed(write_address + 1, write_quantity);
        let mut payload = Vec::with_capacity(1 + registers.len() * 2);
        payload.push((registers.len() * 2) as u8);
        for register in registers {
            payload.extend_from_slice(&register.to_be_bytes());
        }
        Ok(payload)
    }
}

/// Lifecycle shared by the three listeners.
#[async_trait]
pub trait SlaveListener: Send {
    /// Bind resources and start serving in the background.
    async fn start(&mut self) -> ModbusResult<()>;

    /// Signal shutdown and release the listening resource.
    async fn stop(&mut self) -> ModbusResult<()>;

    /// Whether the listener loop is alive.
    fn is_running(&self) -> bool;

    /// Counters accumulated since start.
    fn stats(&self) -> ServerStats;
}

/// TCP listener configuration.
#[derive(Debug, Clone)]
pub struct TcpSlaveConfig {
    pub bind_address: SocketAddr,
    /// Connections idle beyond this are reaped; zero disables the reaper.
    pub idle_timeout: Duration,
    /// Accepted peer IPs in string form; `None` admits every peer.
    pub allowed_peers: Option<Vec<String>>,
}

impl Default for TcpSlaveConfig {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from(([127, 0, 0, 1], crate::DEFAULT_TCP_PORT)),
            idle_timeout: Duration::ZERO,
            allowed_peers: None,
        }
    }
}

#[derive(Clone)]
struct ClientRecord {
    id: u64,
    peer: SocketAddr,
    last_activity_ms: Arc<AtomicU64>,
    kick: Arc<Notify>,
}

/// Modbus TCP slave listener.
pub struct ModbusTcpSlave {
    config: TcpSlaveConfig,
    slave: Arc<ModbusSlave>,
    stats: Arc<Mutex<ServerStats>>,
    clients: Arc<Mutex<Vec<ClientRecord>>>,
    shutdown: Option<broadcast::Sender<()>>,
    running: Arc<AtomicBool>,
    local_addr: Option<SocketAddr>,
    epoch: Instant,
}

impl ModbusTcpSlave {
    /// Create a listener over a dispatcher.
    pub fn new(config: TcpSlaveConfig, slave: ModbusSlave) -> Self {
        Self {
            config,
            slave: Arc::new(slave),
            stats: Arc::new(Mutex::new(ServerStats::default())),
            clients: Arc::new(Mutex::new(Vec::new())),
            shutdown: None,
            running: Arc::new(AtomicBool::new(false)),
            local_addr: None,
            epoch: Instant::now(),
        }
    }

    /// Shared handle to the dispatcher.
    pub fn slave(&self) -> Arc<ModbusSlave> {
        self.slave.clone()
    }

    /// The bound address once started (resolves port 0 binds).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    async fn handle_client(
        mut stream: TcpStream,
        peer: SocketAddr,
        slave: Arc<ModbusSlave>,
        stats: Arc<Mutex<ServerStats>>,
        mut shutdown_rx: broadcast::Receiver<()>,
        kick: Arc<Notify>,
        last_activity_ms: Arc<AtomicU64>,
        epoch: Instant,
    ) {
        let mut buf = BytesMut::with_capacity(4096);
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = kick.notified() => {
                    debug!("closing idle client {}", peer);
                    break;
                }
                read = stream.read_buf(&mut buf) => match read {
                    Ok(0) => break,
                    Ok(n) => {
                        last_activity_ms.store(epoch.elapsed().as_millis() as u64, Ordering::SeqCst);
                        stats.lock().unwrap().bytes_received += n as u64;
                        if !Self::pump_frames(&mut stream, &mut buf, &slave, &stats, peer).await {
                            break;
                        }
                    }
                    Err(err) => {
                        warn!("read error from {}: {}", peer, err);
                        break;
                    }
                }
            }
        }
    }

    /// Drain every complete MBAP frame from `buf`; returns false when the
    /// session must be closed.
    async fn pump_frames(
        stream: &mut TcpStream,
        buf: &mut BytesMut,
        slave: &ModbusSlave,
        stats: &Mutex<ServerStats>,
        peer: SocketAddr,
    ) -> bool {
        loop {
            if buf.len() < MBAP_HEADER_LEN {
                return true;
            }
            let length = u16::from_be_bytes([buf[4], buf[5]]) as usize;
            if length < 2 || MBAP_HEADER_LEN + length > MAX_TCP_FRAME_SIZE {
                warn!("closing client {} after malformed MBAP length {}", peer, length);
                return false;
            }
            if buf.len() < MBAP_HEADER_LEN + length {
                return true;
            }
            let request = buf.split_to(MBAP_HEADER_LEN + length);
            stats.lock().unwrap().total_requests += 1;
            if let Some(response) = slave.process_mbap_frame(&request) {
                if let Err(err) = stream.write_all(&response).await {
                    warn!("failed to send response to {}: {}", peer, err);
                    return false;
                }
                let mut stats = stats.lock().unwrap();
                stats.responses_sent += 1;
                stats.bytes_sent += response.len() as u64;
            }
        }
    }
}

#[async_trait]
impl SlaveListener for ModbusTcpSlave {
    async fn start(&mut self) -> ModbusResult<()> {
        if self.running.load(Ordering::SeqCst) {
            return Err(ModbusError::configuration("listener already running"));
        }
        let listener = TcpListener::bind(self.config.bind_address)
            .await
            .map_err(|e| {
                ModbusError::connection(format!(
                    "failed to bind {}: {}",
                    self.config.bind_address, e
                ))
            })?;
        let local_addr = listener.local_addr()?;
        self.local_addr = Some(local_addr);
        info!("modbus TCP slave listening on {}", local_addr);

        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
        self.shutdown = Some(shutdown_tx.clone());
        self.running.store(true, Ordering::SeqCst);

        // Idle-client reaper.
        if !self.config.idle_timeout.is_zero() {
            let idle_ms = self.config.idle_timeout.as_millis() as u64;
            let clients = self.clients.clone();
            let epoch = self.epoch;
            let mut reaper_shutdown = shutdown_tx.subscribe();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = reaper_shutdown.recv() => break,
                        _ = tokio::time::sleep(Duration::from_millis(250)) => {
                            let now_ms = epoch.elapsed().as_millis() as u64;
                            for client in clients.lock().unwrap().iter() {
                                let last = client.last_activity_ms.load(Ordering::SeqCst);
                                if now_ms.saturating_sub(last) > idle_ms {
                                    debug!("reaping idle client {}", client.peer);
                                    client.kick.notify_one();
                                }
                            }
                        }
                    }
                }
            });
        }

        let slave = self.slave.clone();
        let stats = self.stats.clone();
        let clients = self.clients.clone();
        let running = self.running.clone();
        let allowed_peers = self.config.allowed_peers.clone();
        let epoch = self.epoch;

        tokio::spawn(async move {
            let mut next_client_id = 0u64;
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            if let Some(allowed) = &allowed_peers {
                                let ip = peer.ip().to_string();
                                if !allowed.iter().any(|entry| *entry == ip) {
                                    warn!("rejecting connection from {}", peer);
                                    continue;
                                }
                            }
                            next_client_id += 1;
                            let record = ClientRecord {
                                id: next_client_id,
                                peer,
                                last_activity_ms: Arc::new(AtomicU64::new(
                                    epoch.elapsed().as_millis() as u64,
                                )),
                                kick: Arc::new(Notify::new()),
                            };
                            let count = {
                                let mut clients = clients.lock().unwrap();
                                clients.push(record.clone());
                                clients.len()
                            };
                            stats.lock().unwrap().connections = count;
                            slave.events().connection_count_changed(count);
                            info!("client {} connected ({} active)", peer, count);

                            let slave = slave.clone();
                            let stats = stats.clone();
                            let clients = clients.clone();
                            let shutdown_rx = shutdown_tx.subscribe();
                            tokio::spawn(async move {
                                Self::handle_client(
                                    stream,
                                    peer,
                                    slave.clone(),
                                    stats.clone(),
                                    shutdown_rx,
                                    record.kick.clone(),
                                    record.last_activity_ms.clone(),
                                    epoch,
                                )
                                .await;
                                let count = {
                                    let mut clients = clients.lock().unwrap();
                                    clients.retain(|c| c.id != record.id);
                                    clients.len()
                                };
                                stats.lock().unwrap().connections = count;
                                slave.events().connection_count_changed(count);
                                info!("client {} disconnected ({} active)", peer, count);
                            });
                        }
                        Err(err) => error!("accept failed: {}", err),
                    }
                }
            }
            running.store(false, Ordering::SeqCst);
        });

        Ok(())
    }

    async fn stop(&mut self) -> ModbusResult<()> {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        for client in self.clients.lock().unwrap().iter() {
            client.kick.notify_one();
        }
        self.running.store(false, Ordering::SeqCst);
        info!("modbus TCP slave stopped");
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn stats(&self) -> ServerStats {
        self.stats.lock().unwrap().clone()
    }
}

/// Modbus UDP slave listener.
pub struct ModbusUdpSlave {
    bind_address: SocketAddr,
    slave: Arc<ModbusSlave>,
    stats: Arc<Mutex<ServerStats>>,
    shutdown: Option<broadcast::Sender<()>>,
    running: Arc<AtomicBool>,
    local_addr: Option<SocketAddr>,
}

impl ModbusUdpSlave {
    /// Create a listener over a dispatcher.
    pub fn new(bind_address: SocketAddr, slave: ModbusSlave) -> Self {
        Self {
            bind_address,
            slave: Arc::new(slave),
            stats: Arc::new(Mutex::new(ServerStats::default())),
            shutdown: None,
            running: Arc::new(AtomicBool::new(false)),
            local_addr: None,
        }
    }

    /// Shared handle to the dispatcher.
    pub fn slave(&self) -> Arc<ModbusSlave> {
        self.slave.clone()
    }

    /// The bound address once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }
}

#[async_trait]
impl SlaveListener for ModbusUdpSlave {
    async fn start(&mut self) -> ModbusResult<()> {
        if self.running.load(Ordering::SeqCst) {
            return Err(ModbusError::configuration("listener already running"));
        }
        let socket = Arc::new(UdpSocket::bind(self.bind_address).await.map_err(|e| {
            ModbusError::connection(format!("failed to bind {}: {}", self.bind_address, e))
        })?);
        let local_addr = socket.local_addr()?;
        self.local_addr = Some(local_addr);
        info!("modbus UDP slave listening on {}", local_addr);

        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
        self.shutdown = Some(shutdown_tx);
        self.running.store(true, Ordering::SeqCst);

        let slave = self.slave.clone();
        let stats = self.stats.clone();
        let running = self.running.clone();

        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_TCP_FRAME_SIZE];
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    received = socket.recv_from(&mut buf) => match received {
                        Ok((n, peer)) => {
                            {
                                let mut stats = stats.lock().unwrap();
                                stats.total_requests += 1;
                                stats.bytes_received += n as u64;
                            }
                            let request = buf[..n].to_vec();
                            let slave = slave.clone();
                            let socket = socket.clone();
                            let stats = stats.clone();
                            tokio::spawn(async move {
                                if let Some(response) = slave.process_mbap_frame(&request) {
                                    match socket.send_to(&response, peer).await {
                                        Ok(sent) => {
                                            let mut stats = stats.lock().unwrap();
                                            stats.responses_sent += 1;
                                            stats.bytes_sent += sent as u64;
                                        }
                                        Err(err) => {
                                            warn!("failed to answer {}: {}", peer, err)
                                        }
                                    }
                                }
                            });
                        }
                        Err(err) => error!("receive failed: {}", err),
                    }
                }
            }
            running.store(false, Ordering::SeqCst);
        });

        Ok(())
    }

    async fn stop(&mut self) -> ModbusResult<()> {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        self.running.store(false, Ordering::SeqCst);
        info!("modbus UDP slave stopped");
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn stats(&self) -> ServerStats {
        self.stats.lock().unwrap().clone()
    }
}

/// Modbus RTU slave listener over a serial stream.
pub struct ModbusRtuSlave<S = SerialStream> {
    stream: Option<S>,
    silent_interval: Duration,
    slave: Arc<ModbusSlave>,
    stats: Arc<Mutex<ServerStats>>,
    shutdown: Option<broadcast::Sender<()>>,
    running: Arc<AtomicBool>,
}

impl ModbusRtuSlave<SerialStream> {
    /// Open a serial port and wrap it.
    pub fn open(path: &str, config: &SerialConfig, slave: ModbusSlave) -> ModbusResult<Self> {
        let stream = transport::open_serial_stream(path, config)?;
        Ok(Self::from_stream(stream, config.baud_rate, slave))
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send + 'static> ModbusRtuSlave<S> {
    /// Wrap an already-open stream; `baud_rate` sets the silent interval.
    pub fn from_stream(stream: S, baud_rate: u32, slave: ModbusSlave) -> Self {
        Self {
            stream: Some(stream),
            silent_interval: transport::silent_interval(baud_rate),
            slave: Arc::new(slave),
            stats: Arc::new(Mutex::new(ServerStats::default())),
            shutdown: None,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Shared handle to the dispatcher.
    pub fn slave(&self) -> Arc<ModbusSlave> {
        self.slave.clone()
    }
}

#[async_trait]
impl<S: AsyncRead + AsyncWrite + Unpin + Send + 'static> SlaveListener for ModbusRtuSlave<S> {
    async fn start(&mut self) -> ModbusResult<()> {
        if self.running.load(Ordering::SeqCst) {
            return Err(ModbusError::configuration("listener already running"));
        }
        let Some(mut stream) = self.stream.take() else {
            return Err(ModbusError::SerialPortNotOpen);
        };

        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
        self.shutdown = Some(shutdown_tx);
        self.running.store(true, Ordering::SeqCst);
        info!("modbus RTU slave started");

        let slave = self.slave.clone();
        let stats = self.stats.clone();
        let running = self.running.clone();
        let gap = self.silent_interval;

        tokio::spawn(async move {
            let mut buf = vec![0u8; RTU_BUFFER_SIZE];
            let mut offset = 0usize;
            let mut chunk = [0u8; 512];
            let mut last_burst = Instant::now();
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    read = stream.read(&mut chunk) => match read {
                        Ok(0) => {
                            debug!("serial stream closed");
                            break;
                        }
                        Ok(n) => {
                            let now = Instant::now();
                            // A gap longer than the silent interval starts
                            // a new frame.
                            if now.duration_since(last_burst) > gap {
                                offset = 0;
                            }
                            last_burst = now;
                            if offset + n > buf.len() {
                                offset = 0;
                            }
                            buf[offset..offset + n].copy_from_slice(&chunk[..n]);
                            offset += n;
                            stats.lock().unwrap().bytes_received += n as u64;

                            if frame::frame_complete(&buf[..offset]) {
                                stats.lock().unwrap().total_requests += 1;
                                if let Some(response) =
                                    slave.process_rtu_frame(&buf[..offset])
                                {
                                    if let Err(err) = stream.write_all(&response).await {
                                        warn!("failed to send response: {}", err);
                                        break;
                                    }
                                    let mut stats = stats.lock().unwrap();
                                    stats.responses_sent += 1;
                                    stats.bytes_sent += response.len() as u64;
                                }
                                offset = 0;
                            }
                        }
                        Err(err) => {
                            warn!("serial read error: {}", err);
                            break;
                        }
                    }
                }
            }
            running.store(false, Ordering::SeqCst);
        });

        Ok(())
    }

    async fn stop(&mut self) -> ModbusResult<()> {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        self.running.store(false, Ordering::SeqCst);
        info!("modbus RTU slave stopped");
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn stats(&self) -> ServerStats {
        self.stats.lock().unwrap().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn mbap(transaction_id: u16, unit_id: u8, pdu: &[u8]) -> Vec<u8> {
        let mut frame = Vec::with_capacity(MBAP_HEADER_LEN + 1 + pdu.len());
        frame.extend_from_slice(&transaction_id.to_be_bytes());
        frame.extend_from_slice(&0u16.to_be_bytes());
        frame.extend_from_slice(&((1 + pdu.len()) as u16).to_be_bytes());
        frame.push(unit_id);
        frame.extend_from_slice(pdu);
        frame
    }

    #[test]
    fn read_coils_all_clear_yields_zero_byte() {
        let slave = ModbusSlave::new(SlaveConfig::default());
        let request = mbap(1, 1, &[0x01, 0x00, 0x00, 0x00, 0x08]);
        let response = slave.process_mbap_frame(&request).unwrap();
        assert_eq!(&response[7..], &[0x01, 0x01, 0x00]);
    }

    #[test]
    fn disabled_function_answers_illegal_function() {
        let mut config = SlaveConfig::default();
        config.disable_function(FunctionCode::ReadHoldingRegisters);
        let slave = ModbusSlave::new(config);
        let request = [0x00, 0x03, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03, 0x00, 0x00, 0x00, 0x01];
        let response = slave.process_mbap_frame(&request).unwrap();
        assert_eq!(
            response,
            vec![0x00, 0x03, 0x00, 0x00, 0x00, 0x03, 0x01, 0x83, 0x01]
        );
    }

    #[test]
    fn write_multiple_registers_round_trip() {
        let slave = ModbusSlave::new(SlaveConfig::default());
        let request = vec![
            0x00, 0x02, 0x00, 0x00, 0x00, 0x0B, 0x01, 0x10, 0x00, 0x01, 0x00, 0x02, 0x04,
            0x00, 0x0A, 0x01, 0x02,
        ];
        let response = slave.process_mbap_frame(&request).unwrap();
        assert_eq!(
            response,
            vec![0x00, 0x02, 0x00, 0x00, 0x00, 0x06, 0x01, 0x10, 0x00, 0x01, 0x00, 0x02]
        );
        assert_eq!(
            slave.register_bank().read_holding_registers(1, 2).unwrap(),
            vec![0x000A, 0x0102]
        );
    }

    #[test]
    fn unit_filter_drops_foreign_frames_and_accepts_broadcast() {
        let slave = ModbusSlave::new(SlaveConfig::default());
        let foreign = mbap(1, 9, &[0x01, 0x00, 0x00, 0x00, 0x01]);
        assert!(slave.process_mbap_frame(&foreign).is_none());

        let broadcast = mbap(1, 0, &[0x05, 0x00, 0x07, 0xFF, 0x00]);
        assert!(slave.process_mbap_frame(&broadcast).is_some());
        assert_eq!(slave.register_bank().read_coils(7, 1).unwrap(), vec![true]);
    }

    #[test]
    fn invalid_coil_value_answers_illegal_data_value() {
        let slave = ModbusSlave::new(SlaveConfig::default());
        let request = mbap(1, 1, &[0x05, 0x00, 0x00, 0x12, 0x34]);
        let response = slave.process_mbap_frame(&request).unwrap();
        assert_eq!(&response[7..], &[0x85, 0x03]);
    }

    #[test]
    fn address_overflow_answers_illegal_data_address() {
        let slave = ModbusSlave::new(SlaveConfig::default());
        // 65533 + 1 + 2 > 65535
        let request = mbap(1, 1, &[0x03, 0xFF, 0xFD, 0x00, 0x02]);
        let response = slave.process_mbap_frame(&request).unwrap();
        assert_eq!(&response[7..], &[0x83, 0x02]);
    }

    #[test]
    fn oversized_quantity_answers_illegal_data_value() {
        let slave = ModbusSlave::new(SlaveConfig::default());
        let request = mbap(1, 1, &[0x03, 0x00, 0x00, 0x00, 0x7E]);
        let response = slave.process_mbap_frame(&request).unwrap();
        assert_eq!(&response[7..], &[0x83, 0x03]);
    }

    #[test]
    fn fc23_writes_before_reading() {
        let slave = ModbusSlave::new(SlaveConfig::default());
        slave
            .register_bank()
            .write_holding_registers(0, &[1, 2, 3, 4])
            .unwrap();
        // Read 0..4 while writing [9, 9] at address 1.
        let request = mbap(
            1,
            1,
            &[0x17, 0x00, 0x00, 0x00, 0x04, 0x00, 0x01, 0x00, 0x02, 0x04, 0x00, 0x09, 0x00, 0x09],
        );
        let response = slave.process_mbap_frame(&request).unwrap();
        assert_eq!(
            &response[7..],
            &[0x17, 0x08, 0x00, 0x01, 0x00, 0x09, 0x00, 0x09, 0x00, 0x04]
        );
    }

    #[test]
    fn fc23_byte_count_mismatch_rejected() {
        let slave = ModbusSlave::new(SlaveConfig::default());
        let request = mbap(
            1,
            1,
            &[0x17, 0x00, 0x00, 0x00, 0x01, 0x00, 0x01, 0x00, 0x02, 0x03, 0x00, 0x09, 0x00],
        );
        let response = slave.process_mbap_frame(&request).unwrap();
        assert_eq!(&response[7..], &[0x97, 0x03]);
    }

    #[test]
    fn rtu_frame_round_trip() {
        let slave = ModbusSlave::new(SlaveConfig::default());
        slave
            .register_bank()
            .write_holding_registers(0, &[0x000A, 0x000B])
            .unwrap();
        let request = [0x01, 0x03, 0x00, 0x00, 0x00, 0x02, 0xC4, 0x0B];
        let response = slave.process_rtu_frame(&request).unwrap();
        assert!(frame::frame_complete(&response));
        assert_eq!(
            &response[..response.len() - 2],
            &[0x01, 0x03, 0x04, 0x00, 0x0A, 0x00, 0x0B]
        );
    }

    #[test]
    fn rtu_corrupt_frame_dropped() {
        let slave = ModbusSlave::new(SlaveConfig::default());
        let mut request = [0x01, 0x03, 0x00, 0x00, 0x00, 0x02, 0xC4, 0x0B];
        request[3] ^= 0x01;
        assert!(slave.process_rtu_frame(&request).is_none());
    }

    #[test]
    fn change_notifications_are_one_based() {
        let observed = Arc::new(AtomicU32::new(0));
        let seen = observed.clone();
        let mut slave = ModbusSlave::new(SlaveConfig::default());
        slave.set_events(SlaveEvents {
            on_coils_changed: Some(Arc::new(move |first, count| {
                seen.store(((first as u32) << 16) | count as u32, Ordering::SeqCst);
            })),
            ..Default::default()
        });
        let request = mbap(1, 1, &[0x05, 0x00, 0x0A, 0xFF, 0x00]);
        slave.process_mbap_frame(&request).unwrap();
        // Address 10 reported as 11, count 1.
        assert_eq!(observed.load(Ordering::SeqCst), (11 << 16) | 1);
    }

    #[test]
    fn traffic_log_records_pairs() {
        let slave = ModbusSlave::new(SlaveConfig::default());
        let request = mbap(7, 1, &[0x01, 0x00, 0x00, 0x00, 0x01]);
        let response = slave.process_mbap_frame(&request).unwrap();
        let entries = slave.traffic().snapshot();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].request, request);
        assert_eq!(entries[0].response, response);
    }

    #[test]
    fn unknown_function_answers_illegal_function() {
        let slave = ModbusSlave::new(SlaveConfig::default());
        let request = mbap(1, 1, &[0x2B, 0x0E, 0x01, 0x00]);
        let response = slave.process_mbap_frame(&request).unwrap();
        assert_eq!(&response[7..], &[0xAB, 0x01]);
    }
}
