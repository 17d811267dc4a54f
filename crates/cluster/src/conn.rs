//! Single RESP connection to one store node

use std::io;
use std::time::Duration;

use bytes::Bytes;
use resp::{AsyncRespEncoder, AsyncRespParser, RespError, RespValue};
use thiserror::Error;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::debug;

/// Connection level errors
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("protocol error: {0}")]
    Protocol(RespError),
    /// Error reply sent by the server
    #[error("server error: {0}")]
    Server(String),
    #[error("connect to {0} timed out")]
    ConnectTimeout(String),
    #[error("connection closed")]
    Closed,
    #[error("connection pool closed")]
    PoolClosed,
    #[error("unexpected reply to {0}: {1:?}")]
    UnexpectedReply(String, RespValue),
}

impl From<RespError> for ClientError {
    fn from(e: RespError) -> Self {
        match e {
            RespError::Io(io) => ClientError::Io(io),
            RespError::UnexpectedEof => ClientError::Closed,
            other => ClientError::Protocol(other),
        }
    }
}

/// Command argument conversion
pub trait ToArg {
    fn to_arg(self) -> Bytes;
}

impl ToArg for Bytes {
    fn to_arg(self) -> Bytes {
        self
    }
}

impl ToArg for &str {
    fn to_arg(self) -> Bytes {
        Bytes::copy_from_slice(self.as_bytes())
    }
}

impl ToArg for String {
    fn to_arg(self) -> Bytes {
        Bytes::from(self)
    }
}

impl ToArg for &String {
    fn to_arg(self) -> Bytes {
        Bytes::copy_from_slice(self.as_bytes())
    }
}

impl ToArg for &[u8] {
    fn to_arg(self) -> Bytes {
        Bytes::copy_from_slice(self)
    }
}

impl ToArg for Vec<u8> {
    fn to_arg(self) -> Bytes {
        Bytes::from(self)
    }
}

macro_rules! int_to_arg {
    ($($t:ty),*) => {
        $(impl ToArg for $t {
            fn to_arg(self) -> Bytes {
                Bytes::from(self.to_string())
            }
        })*
    };
}

int_to_arg!(i64, u64, u32, usize);

/// Command builder
///
/// ```
/// use cluster::Cmd;
/// let args = Cmd::new("BRPOP").arg("calls:{a}").arg(1u64).into_args();
/// assert_eq!(args.len(), 3);
/// ```
#[derive(Debug, Clone)]
pub struct Cmd {
    args: Vec<Bytes>,
}

impl Cmd {
    pub fn new(name: &str) -> Self {
        Self {
            args: vec![name.to_arg()],
        }
    }

    pub fn arg(mut self, arg: impl ToArg) -> Self {
        self.args.push(arg.to_arg());
        self
    }

    pub fn args<I, A>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: ToArg,
    {
        self.args.extend(args.into_iter().map(ToArg::to_arg));
        self
    }

    /// Command name, for logging
    pub fn name(&self) -> String {
        String::from_utf8_lossy(&self.args[0]).into_owned()
    }

    pub fn into_args(self) -> Vec<Bytes> {
        self.args
    }
}

/// One TCP connection speaking RESP2
///
/// A command interrupted between write and reply (for example when the
/// calling future is dropped) leaves the connection out of sync, so it is
/// flagged as not reusable.
pub struct Connection {
    addr: String,
    parser: AsyncRespParser<OwnedReadHalf>,
    encoder: AsyncRespEncoder<OwnedWriteHalf>,
    in_flight: bool,
    broken: bool,
}

impl Connection {
    /// Dial `addr` (host:port)
    pub async fn connect(addr: &str, timeout: Duration) -> Result<Self, ClientError> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ClientError::ConnectTimeout(addr.to_string()))??;
        stream.set_nodelay(true)?;
        debug!("Connected to {}", addr);

        let (reader, writer) = stream.into_split();
        Ok(Self {
            addr: addr.to_string(),
            parser: AsyncRespParser::new(reader),
            encoder: AsyncRespEncoder::new(writer),
            in_flight: false,
            broken: false,
        })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Whether the connection may be handed to another user
    pub fn is_reusable(&self) -> bool {
        !self.in_flight && !self.broken
    }

    /// Whether an I/O or protocol failure closed the connection
    pub fn is_broken(&self) -> bool {
        self.broken
    }

    /// Send a command and wait for its reply
    ///
    /// Error replies are returned as [`ClientError::Server`].
    pub async fn execute(&mut self, cmd: Cmd) -> Result<RespValue, ClientError> {
        if self.broken {
            return Err(ClientError::Closed);
        }

        self.in_flight = true;
        let request = RespValue::from_command(cmd.into_args());
        if let Err(e) = self.encoder.encode(&request).await {
            self.broken = true;
            return Err(e.into());
        }
        let reply = match self.parser.parse().await {
            Ok(reply) => reply,
            Err(e) => {
                self.broken = true;
                return Err(e.into());
            }
        };
        self.in_flight = false;

        match reply {
            RespValue::Error(msg) => Err(ClientError::Server(
                String::from_utf8_lossy(&msg).into_owned(),
            )),
            other => Ok(other),
        }
    }

    /// Close the write half; pending and later commands fail
    pub async fn shutdown(&mut self) {
        self.broken = true;
        let _ = self.encoder.shutdown().await;
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("addr", &self.addr)
            .field("in_flight", &self.in_flight)
            .field("broken", &self.broken)
            .finish()
    }
}
