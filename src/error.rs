//! Error types for the protocol stack.
//!
//! One `ModbusError` enum covers transport failures, protocol violations,
//! argument validation, and well-formed exception responses from the peer.
//! Classification helpers feed the retry logic: timeouts and CRC failures
//! are the kinds the RTU retry loop re-issues requests on.

use thiserror::Error;

/// Result type alias for Modbus operations.
pub type ModbusResult<T> = Result<T, ModbusError>;

/// Typed view of a Modbus exception code. Codes outside the standard set
/// map to `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionKind {
    /// 0x01 — illegal function.
    FunctionCodeNotSupported,
    /// 0x02 — illegal data address.
    StartingAddressInvalid,
    /// 0x03 — illegal data value.
    QuantityInvalid,
    /// 0x04 — slave device failure.
    SlaveDeviceFailure,
    /// 0x05 — acknowledge.
    Acknowledge,
    /// 0x06 — slave device busy.
    SlaveDeviceBusy,
    /// 0x0A — gateway path unavailable.
    GatewayPathUnavailable,
    /// 0x0B — gateway target device failed to respond.
    GatewayTargetFailedToRespond,
    /// Any other exception code.
    Unknown,
}

impl ExceptionKind {
    /// Map a raw exception code to its typed kind.
    pub fn from_code(code: u8) -> Self {
        match code {
            0x01 => Self::FunctionCodeNotSupported,
            0x02 => Self::StartingAddressInvalid,
            0x03 => Self::QuantityInvalid,
            0x04 => Self::SlaveDeviceFailure,
            0x05 => Self::Acknowledge,
            0x06 => Self::SlaveDeviceBusy,
            0x0A => Self::GatewayPathUnavailable,
            0x0B => Self::GatewayTargetFailedToRespond,
            _ => Self::Unknown,
        }
    }

    /// Human-readable description.
    pub fn description(self) -> &'static str {
        match self {
            Self::FunctionCodeNotSupported => "Illegal Function",
            Self::StartingAddressInvalid => "Illegal Data Address",
            Self::QuantityInvalid => "Illegal Data Value",
            Self::SlaveDeviceFailure => "Slave Device Failure",
            Self::Acknowledge => "Acknowledge",
            Self::SlaveDeviceBusy => "Slave Device Busy",
            Self::GatewayPathUnavailable => "Gateway Path Unavailable",
            Self::GatewayTargetFailedToRespond => "Gateway Target Device Failed to Respond",
            Self::Unknown => "Unknown Exception",
        }
    }
}

/// Errors produced by master operations, the slave dispatcher, and the
/// transport layer.
#[derive(Error, Debug, Clone)]
pub enum ModbusError {
    /// The transport is not ready for I/O.
    #[error("transport is not connected")]
    NotConnected,

    /// The RTU serial port is configured but closed.
    #[error("serial port is not open")]
    SerialPortNotOpen,

    /// An argument is outside the Modbus-specified range.
    #[error("illegal argument: {message}")]
    IllegalArgument { message: String },

    /// No matching response arrived within the deadline.
    #[error("timeout after {timeout_ms}ms: {operation}")]
    Timeout { operation: String, timeout_ms: u64 },

    /// RTU response bytes do not match the recomputed CRC.
    #[error("CRC check failed: expected={expected:04X}, actual={actual:04X}")]
    CrcCheckFailed { expected: u16, actual: u16 },

    /// The peer returned a well-formed exception response.
    #[error("modbus exception: function={function:02X}, code={code:02X} ({})", .kind.description())]
    Exception {
        function: u8,
        code: u8,
        kind: ExceptionKind,
    },

    /// Low-level I/O failure (socket or serial).
    #[error("I/O error: {message}")]
    Io { message: String },

    /// Connection establishment or maintenance failure.
    #[error("connection error: {message}")]
    Connection { message: String },

    /// Frame structure violation.
    #[error("frame error: {message}")]
    Frame { message: String },

    /// Invalid configuration.
    #[error("configuration error: {message}")]
    Configuration { message: String },
}

impl ModbusError {
    /// Create an illegal-argument error.
    pub fn illegal_argument<S: Into<String>>(message: S) -> Self {
        Self::IllegalArgument {
            message: message.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout<S: Into<String>>(operation: S, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Create a CRC mismatch error.
    pub fn crc_check_failed(expected: u16, actual: u16) -> Self {
        Self::CrcCheckFailed { expected, actual }
    }

    /// Create a typed exception error from the original function code and
    /// the exception code returned by the peer.
    pub fn exception(function: u8, code: u8) -> Self {
        Self::Exception {
            function,
            code,
            kind: ExceptionKind::from_code(code),
        }
    }

    /// Create an I/O error.
    pub fn io<S: Into<String>>(message: S) -> Self {
        Self::Io {
            message: message.into(),
        }
    }

    /// Create a connection error.
    pub fn connection<S: Into<String>>(message: S) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Create a frame error.
    pub fn frame<S: Into<String>>(message: S) -> Self {
        Self::Frame {
            message: message.into(),
        }
    }

    /// Create a configuration error.
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// The exception kind, when this error is an exception response.
    pub fn exception_kind(&self) -> Option<ExceptionKind> {
        match self {
            Self::Exception { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Whether a retry of the failed operation could succeed.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Io { .. } | Self::Connection { .. } => true,
            Self::Timeout { .. } | Self::CrcCheckFailed { .. } => true,
            Self::Exception { kind, .. } => matches!(
                kind,
                ExceptionKind::Acknowledge | ExceptionKind::SlaveDeviceBusy
            ),
            _ => false,
        }
    }

    /// Whether the error originates in the transport rather than the
    /// protocol.
    pub fn is_transport_error(&self) -> bool {
        matches!(
            self,
            Self::Io { .. }
                | Self::Connection { .. }
                | Self::Timeout { .. }
                | Self::NotConnected
                | Self::SerialPortNotOpen
        )
    }

    /// Whether the error is a Modbus protocol violation or exception.
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            Self::Exception { .. } | Self::Frame { .. } | Self::CrcCheckFailed { .. }
        )
    }
}

impl From<std::io::Error> for ModbusError {
    fn from(err: std::io::Error) -> Self {
        Self::io(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for ModbusError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Self::timeout("operation timeout", 0)
    }
}

impl From<tokio_serial::Error> for ModbusError {
    fn from(err: tokio_serial::Error) -> Self {
        Self::io(err.to_string())
    }
}

impl From<serde_json::Error> for ModbusError {
    fn from(err: serde_json::Error) -> Self {
        Self::configuration(format!("JSON error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exception_mapping() {
        assert_eq!(
            ModbusError::exception(0x03, 0x01).exception_kind(),
            Some(ExceptionKind::FunctionCodeNotSupported)
        );
        assert_eq!(
            ModbusError::exception(0x10, 0x0B).exception_kind(),
            Some(ExceptionKind::GatewayTargetFailedToRespond)
        );
        assert_eq!(
            ModbusError::exception(0x05, 0x63).exception_kind(),
            Some(ExceptionKind::Unknown)
        );
    }

    #[test]
    fn classification() {
        assert!(ModbusError::timeout("read", 1000).is_recoverable());
        assert!(ModbusError::timeout("read", 1000).is_transport_error());
        assert!(ModbusError::crc_check_failed(0x1234, 0x5678).is_recoverable());
        assert!(ModbusError::crc_check_failed(0x1234, 0x5678).is_protocol_error());
        assert!(!ModbusError::exception(0x03, 0x02).is_recoverable());
        assert!(ModbusError::exception(0x03, 0x05).is_recoverable());
        assert!(!ModbusError::illegal_argument("qty").is_transport_error());
        assert!(ModbusError::NotConnected.is_transport_error());
    }

    #[test]
    fn display_includes_context() {
        let message = ModbusError::crc_check_failed(0x0BC4, 0x0BC5).to_string();
        assert!(message.contains("0BC4"));
        assert!(message.contains("0BC5"));

        let message = ModbusError::exception(0x03, 0x02).to_string();
        assert!(message.contains("Illegal Data Address"));
    }
}
