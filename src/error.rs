//! Layered error types for the diagnostic stack.
//!
//! Each component owns a small `thiserror`-derived enum so callers can match on
//! specific failure modes (a security-access lockout is not the same thing as a
//! timeout). [`Error`] unifies them for code that doesn't care which layer failed.

use thiserror::Error;

/// CAN frame port failures (C1).
#[derive(Debug, Error)]
pub enum CanError {
    /// The underlying interface failed to send a frame.
    #[error("CAN send failed: {0}")]
    Send(String),

    /// The underlying interface failed while waiting for a frame.
    #[error("CAN recv failed: {0}")]
    Recv(String),

    /// A frame was rejected for carrying more than 8 data bytes, or an
    /// out-of-range (>0x7FF) identifier. The core never truncates.
    #[error("malformed CAN frame: {0}")]
    Malformed(String),
}

/// VWTP transport failures (C2/C3).
#[derive(Debug, Error)]
pub enum VwtpError {
    /// Channel setup (parameter negotiation or stack-level connect handshake)
    /// did not complete within its retry budget.
    #[error("VWTP setup timed out")]
    SetupTimeout,

    /// The peer's connect response rejected the request, or carried an
    /// invalid tx-address flag.
    #[error("VWTP setup rejected: {0}")]
    SetupRejected(String),

    /// No free rx id in the 0x300..0x30F pool.
    #[error("no free VWTP rx channel")]
    ChannelsExhausted,

    /// An ACK for a sent block was not observed within `ack_timeout` after
    /// 10 break-and-retransmit cycles.
    #[error("VWTP ACK wait exhausted retries")]
    RetryExhausted,

    /// A received frame was shorter than its opcode requires, or a declared
    /// reassembly length didn't parse.
    #[error("malformed VWTP frame: {0}")]
    Malformed(String),

    /// The peer sent 0xA8 (disconnect) while a send was in flight.
    #[error("VWTP peer disconnected")]
    PeerDisconnected,

    /// Auto-reconnect after a peer disconnect failed.
    #[error("VWTP reconnect failed: {0}")]
    ReconnectFailed(String),

    /// The channel is closed and cannot be used.
    #[error("VWTP channel closed")]
    Closed,

    #[error(transparent)]
    Can(#[from] CanError),
}

/// KWP2000 application-layer failures (C6).
#[derive(Debug, Error)]
pub enum KwpError {
    /// No response arrived within the request timeout.
    #[error("KWP request timed out")]
    Timeout,

    /// Negative response 0x11: serviceNotSupported.
    #[error("KWP service not supported")]
    ServiceNotSupported,

    /// Negative response 0x12: subFunctionNotSupported-invalidFormat.
    #[error("KWP invalid argument")]
    InvalidArgument,

    /// Negative response 0x33: securityAccessDenied.
    #[error("KWP permission denied")]
    PermissionDenied,

    /// Negative response 0x35: invalidKey.
    #[error("KWP authentication failure")]
    AuthenticationFailure,

    /// Negative response 0x31: requestOutOfRange.
    #[error("KWP item not found")]
    NotFound,

    /// Negative response 0x36: exceedNumberOfAttempts.
    #[error("KWP security access attempts exceeded")]
    AttemptsExceeded,

    /// Any other negative response code, with its best-effort name.
    #[error("KWP error 0x{code:02x} ({name})")]
    Protocol {
        /// The raw negative-response code (third byte of `0x7F, sid, code`).
        code: u8,
        /// `responses[code]`, a manufacturer override, or `unknown(code)`.
        name: String,
    },

    /// The response's first byte was neither a negative-response marker nor
    /// `service_id + 0x40`.
    #[error("KWP response frame mismatch")]
    FrameMismatch,

    /// The requested symbolic service name is in neither the standard table
    /// nor the session's manufacturer overrides.
    #[error("unknown KWP service: {0}")]
    UnknownService(String),

    #[error(transparent)]
    Vwtp(#[from] VwtpError),
}

/// Security access (C7) failures.
#[derive(Debug, Error)]
pub enum SecurityAccessError {
    /// ECU reported 0x36 (exceedNumberOfAttempts) during the challenge.
    #[error("security access lockout")]
    Lockout,

    /// ECU reported 0x35 (invalidKey): our computed key was wrong.
    #[error("security access invalid key")]
    InvalidKey,

    /// The SA2 bytecode executor is not implemented; see DESIGN.md.
    #[error("SA2 bytecode execution unsupported")]
    BytecodeUnsupported,

    #[error(transparent)]
    Kwp(#[from] KwpError),
}

/// OBD-II client failures (C4/C5).
#[derive(Debug, Error)]
pub enum ObdError {
    /// No ECU responded within the per-query timeout.
    #[error("OBD-II request timed out")]
    Timeout,

    /// The response's service id or PID echo didn't match the request.
    #[error("OBD-II response mismatch: {0}")]
    Mismatch(String),

    /// An ISO-TP frame carried an unexpected frame-type nibble or
    /// out-of-sequence consecutive-frame index.
    #[error("ISO-TP reassembly error: {0}")]
    IsoTp(String),

    #[error(transparent)]
    Can(#[from] CanError),
}

/// Top-level error type unifying every layer.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Can(#[from] CanError),
    #[error(transparent)]
    Vwtp(#[from] VwtpError),
    #[error(transparent)]
    Kwp(#[from] KwpError),
    #[error(transparent)]
    SecurityAccess(#[from] SecurityAccessError),
    #[error(transparent)]
    Obd(#[from] ObdError),
    #[error("{0}")]
    Other(String),
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Other(e.to_string())
    }
}

impl From<std::num::ParseIntError> for Error {
    fn from(e: std::num::ParseIntError) -> Self {
        Error::Other(e.to_string())
    }
}

impl From<socketcan::CANSocketOpenError> for Error {
    fn from(e: socketcan::CANSocketOpenError) -> Self {
        Error::Other(e.to_string())
    }
}

impl From<socketcan::ConstructionError> for Error {
    fn from(e: socketcan::ConstructionError) -> Self {
        Error::Other(e.to_string())
    }
}
