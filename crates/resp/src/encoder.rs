//! RESP protocol encoder

use crate::RespValue;
use bytes::{BufMut, BytesMut};
use std::io;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Append the wire form of `value` to `buf`
fn encode_into(buf: &mut BytesMut, value: &RespValue) {
    match value {
        RespValue::SimpleString(s) => {
            buf.put_u8(b'+');
            buf.put_slice(s);
            buf.put_slice(b"\r\n");
        }
        RespValue::Error(e) => {
            buf.put_u8(b'-');
            buf.put_slice(e);
            buf.put_slice(b"\r\n");
        }
        RespValue::Integer(i) => {
            buf.put_slice(format!(":{}\r\n", i).as_bytes());
        }
        RespValue::BulkString(Some(bytes)) => {
            buf.put_slice(format!("${}\r\n", bytes.len()).as_bytes());
            buf.put_slice(bytes);
            buf.put_slice(b"\r\n");
        }
        RespValue::BulkString(None) | RespValue::Null => {
            buf.put_slice(b"$-1\r\n");
        }
        RespValue::Array(items) => {
            buf.put_slice(format!("*{}\r\n", items.len()).as_bytes());
            for item in items {
                encode_into(buf, item);
            }
        }
    }
}

/// Encode RESP value and return byte vector
pub fn encode_to_vec(value: &RespValue) -> Vec<u8> {
    let mut buf = BytesMut::new();
    encode_into(&mut buf, value);
    buf.to_vec()
}

/// RESP protocol async encoder
///
/// Each value is serialized into a scratch buffer and written with a single
/// `write_all`, then flushed.
pub struct AsyncRespEncoder<W: AsyncWrite + Unpin> {
    writer: W,
    buf: BytesMut,
}

impl<W: AsyncWrite + Unpin> AsyncRespEncoder<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            buf: BytesMut::with_capacity(256),
        }
    }

    /// Encode RESP value and write it out
    pub async fn encode(&mut self, value: &RespValue) -> io::Result<()> {
        self.buf.clear();
        encode_into(&mut self.buf, value);
        self.writer.write_all(&self.buf).await?;
        self.writer.flush().await
    }

    /// Shut down the write half
    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.writer.shutdown().await
    }
}
