//! RESP protocol async parser

use crate::{RespError, RespValue};
use bytes::Bytes;
use std::future::Future;
use std::pin::Pin;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};

/// Default maximum frame size: 512MB (prevents memory overflow attacks)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 512 * 1024 * 1024;

/// Arrays longer than this are rejected before allocation
const MAX_ARRAY_LEN: usize = 1024 * 1024;

/// RESP protocol async parser
///
/// Reads one complete value per [`parse`](Self::parse) call. The frame size
/// budget applies to each top-level value, so a long-lived connection can
/// read any number of frames.
pub struct AsyncRespParser<R: AsyncRead + Unpin> {
    reader: BufReader<R>,
    max_bytes: usize,
    bytes_read: usize,
}

type ParseFuture<'a> = Pin<Box<dyn Future<Output = Result<RespValue, RespError>> + Send + 'a>>;

impl<R: AsyncRead + Unpin + Send> AsyncRespParser<R> {
    /// Create a new async parser (using default max frame size)
    pub fn new(reader: R) -> Self {
        Self::with_max_bytes(reader, DEFAULT_MAX_FRAME_SIZE)
    }

    /// Create a new async parser with an explicit frame size limit
    pub fn with_max_bytes(reader: R, max_bytes: usize) -> Self {
        Self {
            reader: BufReader::new(reader),
            max_bytes,
            bytes_read: 0,
        }
    }

    fn check_frame_size(&mut self, additional: usize) -> Result<(), RespError> {
        self.bytes_read = self.bytes_read.saturating_add(additional);
        if self.bytes_read > self.max_bytes {
            Err(RespError::FrameTooLarge(self.bytes_read, self.max_bytes))
        } else {
            Ok(())
        }
    }

    /// Parse the next complete RESP value
    ///
    /// Returns `UnexpectedEof` if the stream ends cleanly before a value starts.
    pub async fn parse(&mut self) -> Result<RespValue, RespError> {
        self.bytes_read = 0;
        self.parse_value().await
    }

    /// Read one CRLF-terminated line, without the terminator
    async fn read_line(&mut self) -> Result<Vec<u8>, RespError> {
        let mut line = Vec::new();
        let n = self.reader.read_until(b'\n', &mut line).await?;
        if n == 0 {
            return Err(RespError::UnexpectedEof);
        }
        self.check_frame_size(n)?;

        if !line.ends_with(b"\r\n") {
            return Err(RespError::InvalidFormat(
                "Line not terminated by \\r\\n".to_string(),
            ));
        }
        line.truncate(line.len() - 2);
        Ok(line)
    }

    // Boxed because arrays recurse into it
    fn parse_value(&mut self) -> ParseFuture<'_> {
        Box::pin(async move {
            let line = self.read_line().await?;
            let (&kind, rest) = line
                .split_first()
                .ok_or_else(|| RespError::InvalidFormat("Empty line".to_string()))?;

            match kind {
                b'+' => Ok(RespValue::SimpleString(Bytes::copy_from_slice(rest))),
                b'-' => Ok(RespValue::Error(Bytes::copy_from_slice(rest))),
                b':' => parse_int(rest).map(RespValue::Integer),
                b'$' => self.parse_bulk(rest).await,
                b'*' => self.parse_array(rest).await,
                other => Err(RespError::InvalidType(other)),
            }
        })
    }

    /// Parse bulk string body: $5\r\nhello\r\n
    async fn parse_bulk(&mut self, header: &[u8]) -> Result<RespValue, RespError> {
        let len = parse_int(header)?;
        if len == -1 {
            return Ok(RespValue::Null);
        }
        if len < 0 {
            return Err(RespError::InvalidFormat(format!(
                "Invalid bulk string length: {}",
                len
            )));
        }

        let len = len as usize;
        self.check_frame_size(len + 2)?;

        let mut buffer = vec![0u8; len + 2];
        AsyncReadExt::read_exact(&mut self.reader, &mut buffer).await?;
        if &buffer[len..] != b"\r\n" {
            return Err(RespError::InvalidFormat(
                "Expected \\r\\n after bulk string".to_string(),
            ));
        }
        buffer.truncate(len);
        Ok(RespValue::BulkString(Some(Bytes::from(buffer))))
    }

    /// Parse array body: *2\r\n...
    async fn parse_array(&mut self, header: &[u8]) -> Result<RespValue, RespError> {
        let count = parse_int(header)?;
        if count == -1 {
            return Ok(RespValue::Null);
        }
        if count < 0 {
            return Err(RespError::InvalidFormat(format!(
                "Invalid array length: {}",
                count
            )));
        }

        let count = count as usize;
        if count > MAX_ARRAY_LEN {
            return Err(RespError::InvalidFormat(format!(
                "Array too large: {} elements",
                count
            )));
        }

        let mut array = Vec::with_capacity(count);
        for _ in 0..count {
            array.push(self.parse_value().await?);
        }
        Ok(RespValue::Array(array))
    }
}

fn parse_int(raw: &[u8]) -> Result<i64, RespError> {
    let s = std::str::from_utf8(raw)
        .map_err(|_| RespError::InvalidFormat("Non-UTF8 integer".to_string()))?;
    let num = s
        .parse::<i128>()
        .map_err(|_| RespError::InvalidFormat(format!("Invalid integer: {}", s)))?;
    i64::try_from(num).map_err(|_| RespError::IntegerOverflow)
}
