//! Protocol error types

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Data-model validation errors.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("invalid USB bus id: {0:?}")]
    InvalidUsbId(String),

    #[error("invalid port: {0}")]
    InvalidPort(&'static str),

    #[error("port_num {0} is out of range, expected 0-7")]
    InvalidPortNum(u8),

    #[error("description has no parts")]
    EmptyParts,
}

/// Machine-readable tag carried in JSON-RPC `error.data.kind`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed frame or unexpected message, fatal to the channel.
    Protocol,
    /// Rejected by the auth policy.
    Auth,
    /// Reservation request had an empty candidate set.
    NoMatch,
    /// An allocated place's exporter went away.
    AllocationLost,
    /// A local resource (port, VHCI slot) is already in use.
    ResourceBusy,
    /// Retryable I/O or not-yet-present condition.
    Transient,
}

/// The JSON-RPC error object as it crosses the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<ErrorData>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorData {
    pub kind: ErrorKind,
}

pub const CODE_INVALID_REQUEST: i64 = -32600;
pub const CODE_METHOD_NOT_FOUND: i64 = -32601;
pub const CODE_INVALID_PARAMS: i64 = -32602;
pub const CODE_INTERNAL_ERROR: i64 = -32603;
pub const CODE_NO_MATCH: i64 = -32000;
pub const CODE_AUTH: i64 = -32001;
pub const CODE_RESOURCE_BUSY: i64 = -32002;

impl ErrorObject {
    pub fn new(code: i64, message: impl Into<String>, kind: Option<ErrorKind>) -> Self {
        Self {
            code,
            message: message.into(),
            data: kind.map(|kind| ErrorData { kind }),
        }
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(
            CODE_METHOD_NOT_FOUND,
            format!("method not found: {method}"),
            Some(ErrorKind::Protocol),
        )
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(CODE_INVALID_PARAMS, message, Some(ErrorKind::Protocol))
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(CODE_INTERNAL_ERROR, message, None)
    }

    pub fn no_match(message: impl Into<String>) -> Self {
        Self::new(CODE_NO_MATCH, message, Some(ErrorKind::NoMatch))
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(CODE_AUTH, message, Some(ErrorKind::Auth))
    }

    pub fn resource_busy(message: impl Into<String>) -> Self {
        Self::new(CODE_RESOURCE_BUSY, message, Some(ErrorKind::ResourceBusy))
    }

    pub fn kind(&self) -> Option<ErrorKind> {
        self.data.as_ref().map(|d| d.kind)
    }
}

/// Errors surfaced by the JSON-RPC channel.
#[derive(Debug, Error)]
pub enum RpcError {
    /// The remote peer answered a call with an error response.
    #[error("{} ({})", .0.message, .0.code)]
    Remote(ErrorObject),

    /// The channel closed while a call was in flight.
    #[error("channel closed")]
    ChannelClosed,

    /// A frame could not be parsed as JSON-RPC.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl RpcError {
    /// Error kind tag of a remote error, if the peer attached one.
    pub fn remote_kind(&self) -> Option<ErrorKind> {
        match self {
            RpcError::Remote(obj) => obj.kind(),
            _ => None,
        }
    }
}

/// Errors of the USB/IP wire layer.
#[derive(Debug, Error)]
pub enum UsbIpError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unexpected USB/IP protocol version: {0:#06x}")]
    BadVersion(u16),

    #[error("unexpected USB/IP opcode: {0:#06x}")]
    UnexpectedOpcode(u16),

    #[error("unexpected USB/IP command: {0:#010x}")]
    UnexpectedCommand(u32),

    #[error("USB/IP peer reported status {0}")]
    BadStatus(u32),

    #[error("bus id too long: {0:?}")]
    BusIdTooLong(String),

    #[error("device import was rejected")]
    ImportRefused,
}
