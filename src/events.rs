//! Observation hooks and the slave traffic log.
//!
//! Hooks are optional callbacks registered on an instance; they observe
//! traffic and state changes and are never required for correctness. There
//! is no backpressure: callbacks run inline and should return quickly.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};

/// Callback receiving raw frame bytes.
pub type ByteSink = Arc<dyn Fn(&[u8]) + Send + Sync>;
/// Callback receiving a connected/disconnected flag.
pub type FlagSink = Arc<dyn Fn(bool) + Send + Sync>;
/// Callback receiving a 1-based first address and a count.
pub type AddressSink = Arc<dyn Fn(u16, u16) + Send + Sync>;
/// Callback receiving a connection count.
pub type CountSink = Arc<dyn Fn(usize) + Send + Sync>;
/// Callback receiving no arguments.
pub type NotifySink = Arc<dyn Fn() + Send + Sync>;

/// Master-side I/O observation hooks.
#[derive(Clone, Default)]
pub struct IoHooks {
    /// Fired with the exact bytes handed to the transport.
    pub on_send: Option<ByteSink>,
    /// Fired with each received frame.
    pub on_receive: Option<ByteSink>,
    /// Fired when the transport connects or loses its connection.
    pub on_connected_changed: Option<FlagSink>,
}

impl IoHooks {
    /// Hooks that hex-dump traffic to stdout with timestamps.
    pub fn console() -> Self {
        Self {
            on_send: Some(Arc::new(|bytes| {
                println!("[{}] TX {}", timestamp(), hex_dump(bytes));
            })),
            on_receive: Some(Arc::new(|bytes| {
                println!("[{}] RX {}", timestamp(), hex_dump(bytes));
            })),
            on_connected_changed: Some(Arc::new(|state| {
                println!(
                    "[{}] link {}",
                    timestamp(),
                    if state { "up" } else { "down" }
                );
            })),
        }
    }

    pub(crate) fn sent(&self, bytes: &[u8]) {
        if let Some(sink) = &self.on_send {
            sink(bytes);
        }
    }

    pub(crate) fn received(&self, bytes: &[u8]) {
        if let Some(sink) = &self.on_receive {
            sink(bytes);
        }
    }

    pub(crate) fn connected(&self, state: bool) {
        if let Some(sink) = &self.on_connected_changed {
            sink(state);
        }
    }
}

impl fmt::Debug for IoHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoHooks")
            .field("on_send", &self.on_send.is_some())
            .field("on_receive", &self.on_receive.is_some())
            .field("on_connected_changed", &self.on_connected_changed.is_some())
            .finish()
    }
}

/// Slave-side state change hooks.
#[derive(Clone, Default)]
pub struct SlaveEvents {
    /// Coils mutated: (first 1-based address, count).
    pub on_coils_changed: Option<AddressSink>,
    /// Holding registers mutated: (first 1-based address, count).
    pub on_holding_registers_changed: Option<AddressSink>,
    /// Active TCP connection count changed.
    pub on_connection_count_changed: Option<CountSink>,
    /// A request/response pair was appended to the traffic log.
    pub on_log_changed: Option<NotifySink>,
}

impl SlaveEvents {
    pub(crate) fn coils_changed(&self, first_address: u16, count: u16) {
        if let Some(sink) = &self.on_coils_changed {
            sink(first_address, count);
        }
    }

    pub(crate) fn holding_registers_changed(&self, first_address: u16, count: u16) {
        if let Some(sink) = &self.on_holding_registers_changed {
            sink(first_address, count);
        }
    }

    pub(crate) fn connection_count_changed(&self, count: usize) {
        if let Some(sink) = &self.on_connection_count_changed {
            sink(count);
        }
    }

    pub(crate) fn log_changed(&self) {
        if let Some(sink) = &self.on_log_changed {
            sink();
        }
    }
}

impl fmt::Debug for SlaveEvents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlaveEvents")
            .field("on_coils_changed", &self.on_coils_changed.is_some())
            .field(
                "on_holding_registers_changed",
                &self.on_holding_registers_changed.is_some(),
            )
            .field(
                "on_connection_count_changed",
                &self.on_connection_count_changed.is_some(),
            )
            .field("on_log_changed", &self.on_log_changed.is_some())
            .finish()
    }
}

/// Number of request/response pairs retained by the slave.
pub const TRAFFIC_LOG_CAPACITY: usize = 100;

/// One protocol exchange as seen by the slave.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrafficEntry {
    pub request: Vec<u8>,
    pub response: Vec<u8>,
}

/// Bounded ring of the most recent protocol exchanges.
#[derive(Debug, Default)]
pub struct TrafficLog {
    entries: Mutex<VecDeque<TrafficEntry>>,
}

impl TrafficLog {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(TRAFFIC_LOG_CAPACITY)),
        }
    }

    pub(crate) fn record(&self, request: &[u8], response: &[u8]) {
        let mut entries = self.entries.lock().unwrap();
        if entries.len() == TRAFFIC_LOG_CAPACITY {
            entries.pop_front();
        }
        entries.push_back(TrafficEntry {
            request: request.to_vec(),
            response: response.to_vec(),
        });
    }

    /// Copy of the retained exchanges, oldest first.
    pub fn snapshot(&self) -> Vec<TrafficEntry> {
        self.entries.lock().unwrap().iter().cloned().collect()
    }

    /// Number of retained exchanges.
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    /// Whether no exchange has been recorded yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn timestamp() -> String {
    chrono::Utc::now().format("%Y-%m-%d %H:%M:%S%.3f").to_string()
}

fn hex_dump(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn hooks_fire_when_registered() {
        let counter = Arc::new(AtomicUsize::new(0));
        let observed = counter.clone();
        let hooks = IoHooks {
            on_send: Some(Arc::new(move |bytes| {
                observed.fetch_add(bytes.len(), Ordering::SeqCst);
            })),
            ..Default::default()
        };
        hooks.sent(&[1, 2, 3]);
        hooks.received(&[4, 5]);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn traffic_log_bounded_at_capacity() {
        let log = TrafficLog::new();
        for i in 0..150u16 {
            log.record(&i.to_be_bytes(), &[0]);
        }
        assert_eq!(log.len(), TRAFFIC_LOG_CAPACITY);
        let entries = log.snapshot();
        // Oldest retained entry is number 50.
        assert_eq!(entries[0].request, 50u16.to_be_bytes().to_vec());
        assert_eq!(entries.last().unwrap().request, 149u16.to_be_bytes().to_vec());
    }

    #[test]
    fn hex_dump_format() {
        assert_eq!(hex_dump(&[0x01, 0xAB]), "01 AB");
    }
}
