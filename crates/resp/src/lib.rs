//! RESP (REdis Serialization Protocol) support library
//!
//! Client-side RESP2 support: the value model, an async parser for replies
//! and an encoder for command arrays.

mod async_parser;
mod encoder;

pub use async_parser::{AsyncRespParser, DEFAULT_MAX_FRAME_SIZE};
pub use encoder::{encode_to_vec, AsyncRespEncoder};

use bytes::Bytes;
use std::io;

/// RESP data type
#[derive(Debug, Clone, PartialEq)]
pub enum RespValue {
    /// Simple string: +OK\r\n
    SimpleString(Bytes),
    /// Error: -ERR message\r\n
    Error(Bytes),
    /// Integer: :123\r\n
    Integer(i64),
    /// Bulk string: $5\r\nhello\r\n
    BulkString(Option<Bytes>),
    /// Array: *2\r\n$3\r\nGET\r\n$3\r\nkey\r\n
    Array(Vec<RespValue>),
    /// Null bulk string or null array: $-1\r\n, *-1\r\n
    Null,
}

impl RespValue {
    /// Build a command array from its arguments
    pub fn from_command<I, B>(args: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        RespValue::Array(
            args.into_iter()
                .map(|a| RespValue::BulkString(Some(a.into())))
                .collect(),
        )
    }

    /// Convert a request array back into its arguments
    pub fn to_command(&self) -> Option<Vec<Bytes>> {
        match self {
            RespValue::Array(items) => items
                .iter()
                .map(|item| match item {
                    RespValue::BulkString(Some(b)) | RespValue::SimpleString(b) => Some(b.clone()),
                    _ => None,
                })
                .collect(),
            _ => None,
        }
    }

    /// Shorthand for a simple string reply
    pub fn simple(s: &str) -> Self {
        RespValue::SimpleString(Bytes::copy_from_slice(s.as_bytes()))
    }

    /// Shorthand for an error reply
    pub fn error(msg: impl Into<String>) -> Self {
        RespValue::Error(Bytes::from(msg.into()))
    }

    /// Shorthand for a bulk string reply
    pub fn bulk(b: impl Into<Bytes>) -> Self {
        RespValue::BulkString(Some(b.into()))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, RespValue::Null | RespValue::BulkString(None))
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            RespValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Borrow the payload of a bulk or simple string
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            RespValue::BulkString(Some(b)) | RespValue::SimpleString(b) => Some(b),
            _ => None,
        }
    }

    pub fn into_array(self) -> Option<Vec<RespValue>> {
        match self {
            RespValue::Array(items) => Some(items),
            _ => None,
        }
    }
}

/// RESP parsing error
#[derive(Debug, thiserror::Error)]
pub enum RespError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Invalid RESP format: {0}")]
    InvalidFormat(String),
    #[error("Unexpected end of input")]
    UnexpectedEof,
    #[error("Integer overflow")]
    IntegerOverflow,
    #[error("Frame too large: {0} bytes (max: {1} bytes)")]
    FrameTooLarge(usize, usize),
    #[error("Invalid RESP type: {0}")]
    InvalidType(u8),
}
