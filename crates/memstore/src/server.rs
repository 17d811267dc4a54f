//! RESP protocol server
//!
//! Handles client connections and commands against the shared [`Db`].

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use resp::{AsyncRespEncoder, AsyncRespParser, RespValue};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::db::{Db, WrongType};
use crate::slots::{key_slot, SlotTable};

const WRONGTYPE: &str = "WRONGTYPE Operation against a key holding the wrong kind of value";

/// State shared by all connections of one server
pub(crate) struct Shared {
    pub(crate) addr: String,
    pub(crate) db: Mutex<Db>,
    /// Signalled on every list push
    pub(crate) pushed: Notify,
    pub(crate) slots: RwLock<Option<SlotTable>>,
    pub(crate) blocked: AtomicUsize,
    pub(crate) shutdown: CancellationToken,
    /// Parent of every client's token; swapped to cut current clients only
    pub(crate) clients: Mutex<CancellationToken>,
}

impl Shared {
    pub(crate) fn new(addr: String) -> Self {
        let shutdown = CancellationToken::new();
        Self {
            addr,
            db: Mutex::new(Db::new()),
            pushed: Notify::new(),
            slots: RwLock::new(None),
            blocked: AtomicUsize::new(0),
            clients: Mutex::new(shutdown.child_token()),
            shutdown,
        }
    }
}

/// Decrements the blocked-clients gauge on every exit path
struct BlockedGuard<'a>(&'a AtomicUsize);

impl<'a> BlockedGuard<'a> {
    fn new(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for BlockedGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Accept loop; returns when the server is shut down
pub(crate) async fn serve(listener: TcpListener, shared: Arc<Shared>) {
    loop {
        let accepted = tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer)) => {
                debug!("{}: new client connection from {}", shared.addr, peer);
                let shared = shared.clone();
                tokio::spawn(async move {
                    handle_client(stream, shared).await;
                });
            }
            Err(e) => warn!("{}: failed to accept connection: {}", shared.addr, e),
        }
    }
    debug!("{}: server stopped", shared.addr);
}

/// Per-connection state
#[derive(Default)]
struct ClientState {
    asking: bool,
}

/// Handle client connection
///
/// A reader task feeds parsed frames to the executor and cancels the
/// connection token on EOF, so a blocked BRPOP of a departed client gives up
/// instead of popping a value nobody will read.
async fn handle_client(stream: TcpStream, shared: Arc<Shared>) {
    let (reader, writer) = stream.into_split();
    let mut encoder = AsyncRespEncoder::new(writer);
    let conn_token = shared.clients.lock().child_token();

    let (tx, mut rx) = mpsc::channel::<RespValue>(16);
    let reader_token = conn_token.clone();
    let reader_task = tokio::spawn(async move {
        let mut parser = AsyncRespParser::new(reader);
        while let Ok(frame) = parser.parse().await {
            if tx.send(frame).await.is_err() {
                break;
            }
        }
        reader_token.cancel();
    });

    let mut state = ClientState::default();
    loop {
        let frame = tokio::select! {
            _ = conn_token.cancelled() => break,
            frame = rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        let response = match frame.to_command() {
            Some(args) if !args.is_empty() => {
                execute(&shared, &mut state, args, &conn_token).await
            }
            _ => Some(RespValue::error("ERR Protocol error: expected command array")),
        };
        let response = match response {
            Some(response) => response,
            None => break,
        };
        if encoder.encode(&response).await.is_err() {
            break;
        }
    }

    reader_task.abort();
    let _ = encoder.shutdown().await;
}

/// Run one command; `None` means the connection must be closed without reply
async fn execute(
    shared: &Shared,
    state: &mut ClientState,
    args: Vec<Bytes>,
    conn_token: &CancellationToken,
) -> Option<RespValue> {
    let name = String::from_utf8_lossy(&args[0]).to_ascii_uppercase();
    let asking = std::mem::take(&mut state.asking);

    let reply = match name.as_str() {
        "PING" => RespValue::simple("PONG"),
        "ASKING" => {
            state.asking = true;
            RespValue::simple("OK")
        }
        "CLUSTER" => cluster_command(shared, &args),
        "SET" => with_keys(shared, &args[1..args.len().min(2)], asking, || set(shared, &args)),
        "GET" if args.len() == 2 => with_keys(shared, &args[1..2], asking, || {
            match shared.db.lock().get(&args[1]) {
                Ok(Some(v)) => RespValue::bulk(v),
                Ok(None) => RespValue::Null,
                Err(WrongType) => RespValue::error(WRONGTYPE),
            }
        }),
        "DEL" if args.len() >= 2 => with_keys(shared, &args[1..], asking, || {
            let mut db = shared.db.lock();
            let removed = args[1..].iter().filter(|k| db.del(k)).count();
            RespValue::Integer(removed as i64)
        }),
        "EXISTS" if args.len() >= 2 => with_keys(shared, &args[1..], asking, || {
            let mut db = shared.db.lock();
            let found = args[1..].iter().filter(|k| db.exists(k)).count();
            RespValue::Integer(found as i64)
        }),
        "PTTL" if args.len() == 2 => with_keys(shared, &args[1..2], asking, || {
            RespValue::Integer(shared.db.lock().pttl(&args[1]))
        }),
        "LPUSH" | "RPUSH" if args.len() >= 3 => with_keys(shared, &args[1..2], asking, || {
            let values = args[2..].to_vec();
            let pushed = {
                let mut db = shared.db.lock();
                if name == "LPUSH" {
                    db.lpush(args[1].clone(), values)
                } else {
                    db.rpush(args[1].clone(), values)
                }
            };
            match pushed {
                Ok(len) => {
                    shared.pushed.notify_waiters();
                    RespValue::Integer(len as i64)
                }
                Err(WrongType) => RespValue::error(WRONGTYPE),
            }
        }),
        "LLEN" if args.len() == 2 => with_keys(shared, &args[1..2], asking, || {
            RespValue::Integer(shared.db.lock().llen(&args[1]) as i64)
        }),
        "EVAL" => eval(shared, &args, asking),
        "BRPOP" if args.len() >= 3 => {
            let keys = &args[1..args.len() - 1];
            if let Some(redirect) = check_keys(shared, keys, asking) {
                redirect
            } else {
                match parse_timeout(&args[args.len() - 1]) {
                    Some(timeout) => brpop(shared, keys, timeout, conn_token).await?,
                    None => RespValue::error("ERR timeout is not a float or out of range"),
                }
            }
        }
        "QUIT" => return None,
        "GET" | "DEL" | "EXISTS" | "PTTL" | "LPUSH" | "RPUSH" | "LLEN" | "BRPOP" => {
            RespValue::error(format!(
                "ERR wrong number of arguments for '{}' command",
                name.to_lowercase()
            ))
        }
        _ => RespValue::error(format!("ERR unknown command '{}'", name)),
    };
    Some(reply)
}

/// Run `f` if this node may serve `keys`, otherwise return the redirect
fn with_keys(
    shared: &Shared,
    keys: &[Bytes],
    asking: bool,
    f: impl FnOnce() -> RespValue,
) -> RespValue {
    match check_keys(shared, keys, asking) {
        Some(redirect) => redirect,
        None => f(),
    }
}

/// Cluster ownership check: `None` when the command may proceed here
fn check_keys(shared: &Shared, keys: &[Bytes], asking: bool) -> Option<RespValue> {
    let slots = shared.slots.read();
    let table = slots.as_ref()?;
    let first = keys.first()?;

    let slot = key_slot(first);
    if keys.iter().any(|k| key_slot(k) != slot) {
        return Some(RespValue::error(
            "CROSSSLOT Keys in request don't hash to the same slot",
        ));
    }

    match table.owner_of(slot) {
        Some(owner) if owner == shared.addr => {
            let target = table.migrating.get(&slot)?;
            let mut db = shared.db.lock();
            if keys.iter().any(|k| db.exists(k)) {
                None
            } else {
                Some(RespValue::error(format!("ASK {} {}", slot, target)))
            }
        }
        Some(_) if asking => None,
        Some(owner) => Some(RespValue::error(format!("MOVED {} {}", slot, owner))),
        None => Some(RespValue::error(format!(
            "CLUSTERDOWN Hash slot {} not served",
            slot
        ))),
    }
}

fn set(shared: &Shared, args: &[Bytes]) -> RespValue {
    if args.len() != 3 && args.len() != 5 {
        return RespValue::error("ERR syntax error");
    }
    let ttl = if args.len() == 5 {
        let amount = match std::str::from_utf8(&args[4])
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .filter(|&n| n > 0)
        {
            Some(n) => n,
            None => return RespValue::error("ERR invalid expire time in 'set' command"),
        };
        match String::from_utf8_lossy(&args[3]).to_ascii_uppercase().as_str() {
            "PX" => Some(Duration::from_millis(amount)),
            "EX" => Some(Duration::from_secs(amount)),
            _ => return RespValue::error("ERR syntax error"),
        }
    } else {
        None
    };
    shared
        .db
        .lock()
        .set(args[1].clone(), args[2].clone(), ttl);
    RespValue::simple("OK")
}

/// EVAL limited to the read-PTTL-then-DEL script shape
///
/// Any script mentioning both PTTL and DEL is run as that operation on
/// KEYS[1], atomically under the keyspace lock.
fn eval(shared: &Shared, args: &[Bytes], asking: bool) -> RespValue {
    if args.len() < 3 {
        return RespValue::error("ERR wrong number of arguments for 'eval' command");
    }
    let script = String::from_utf8_lossy(&args[1]).to_ascii_uppercase();
    let numkeys = match std::str::from_utf8(&args[2])
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
    {
        Some(n) if 3 + n <= args.len() => n,
        _ => return RespValue::error("ERR Number of keys can't be greater than number of args"),
    };
    let keys = &args[3..3 + numkeys];

    if !(script.contains("PTTL") && script.contains("DEL")) || keys.is_empty() {
        return RespValue::error("ERR unsupported script");
    }
    with_keys(shared, keys, asking, || {
        let mut db = shared.db.lock();
        let ttl = db.pttl(&keys[0]);
        db.del(&keys[0]);
        RespValue::Integer(ttl)
    })
}

fn parse_timeout(raw: &[u8]) -> Option<Duration> {
    std::str::from_utf8(raw)
        .ok()?
        .parse::<f64>()
        .ok()
        .filter(|t| t.is_finite() && *t >= 0.0)
        .map(Duration::from_secs_f64)
}

/// Blocking pop; a zero timeout blocks until a value or disconnect
async fn brpop(
    shared: &Shared,
    keys: &[Bytes],
    timeout: Duration,
    conn_token: &CancellationToken,
) -> Option<RespValue> {
    let _blocked = BlockedGuard::new(&shared.blocked);
    let deadline = (!timeout.is_zero()).then(|| Instant::now() + timeout);

    loop {
        // Registered before checking so a push in between is not missed
        let pushed = shared.pushed.notified();

        if let Some((key, value)) = shared.db.lock().rpop_first(keys) {
            return Some(RespValue::Array(vec![
                RespValue::bulk(key),
                RespValue::bulk(value),
            ]));
        }

        match deadline {
            Some(deadline) => tokio::select! {
                _ = conn_token.cancelled() => return None,
                _ = tokio::time::sleep_until(deadline) => return Some(RespValue::Null),
                _ = pushed => {}
            },
            None => tokio::select! {
                _ = conn_token.cancelled() => return None,
                _ = pushed => {}
            },
        }
    }
}

fn cluster_command(shared: &Shared, args: &[Bytes]) -> RespValue {
    let sub = args
        .get(1)
        .map(|s| String::from_utf8_lossy(s).to_ascii_uppercase())
        .unwrap_or_default();
    let slots = shared.slots.read();
    let table = match slots.as_ref() {
        Some(table) => table,
        None => return RespValue::error("ERR This instance has cluster support disabled"),
    };

    match sub.as_str() {
        "SLOTS" => RespValue::Array(
            table
                .owners
                .iter()
                .map(|owner| {
                    let (host, port) = owner.addr.rsplit_once(':').unwrap_or(("", "0"));
                    RespValue::Array(vec![
                        RespValue::Integer(owner.start as i64),
                        RespValue::Integer(owner.end as i64),
                        RespValue::Array(vec![
                            RespValue::bulk(host.to_string()),
                            RespValue::Integer(port.parse().unwrap_or(0)),
                            RespValue::bulk(format!("node-{}", port)),
                        ]),
                    ])
                })
                .collect(),
        ),
        "KEYSLOT" if args.len() == 3 => RespValue::Integer(key_slot(&args[2]) as i64),
        _ => RespValue::error(format!("ERR unknown subcommand '{}'", sub)),
    }
}
