//! # TCP Server
//!
//! Accept RESP2 connections, parse commands, and dispatch them to the
//! storage engine. Supports the command subset the telli cache client issues,
//! plus a few introspection commands for manual debugging with `redis-cli`.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, warn};

use telli_cache_common::{decode, encode_value, ProtocolError, RespValue};
use telli_cache_engine::KVEngine;

/// Default `SCAN` page size when no `COUNT` is given.
const DEFAULT_SCAN_COUNT: usize = 10;

/// Open `SCAN` cursors kept before the oldest is forgotten.
const MAX_OPEN_CURSORS: usize = 4096;

/// Resume points of in-flight `SCAN` iterations, shared by all connections.
///
/// A cursor id names the last key a page returned, not a position, so keys
/// deleted between pages never shift a live key out of the iteration.
#[derive(Default)]
pub struct ScanCursors {
    inner: Mutex<CursorTable>,
}

#[derive(Default)]
struct CursorTable {
    next_id: u64,
    resume_after: HashMap<u64, Vec<u8>>,
    order: VecDeque<u64>,
}

impl ScanCursors {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the last key of a page and returns the cursor to resume from.
    fn open(&self, last_key: Vec<u8>) -> u64 {
        let mut table = self.inner.lock();
        // Zero is reserved for "iteration complete".
        table.next_id = table.next_id.wrapping_add(1).max(1);
        let id = table.next_id;

        if table.order.len() >= MAX_OPEN_CURSORS {
            if let Some(oldest) = table.order.pop_front() {
                table.resume_after.remove(&oldest);
            }
        }
        table.order.push_back(id);
        table.resume_after.insert(id, last_key);
        id
    }

    /// Consumes a cursor, returning the key its next page starts after.
    fn take(&self, id: u64) -> Option<Vec<u8>> {
        let mut table = self.inner.lock();
        let last_key = table.resume_after.remove(&id)?;
        table.order.retain(|open| *open != id);
        Some(last_key)
    }
}

/// Accepts connections forever, serving each on its own task.
pub async fn serve<E>(listener: TcpListener, engine: Arc<E>) -> std::io::Result<()>
where
    E: KVEngine + 'static,
{
    let cursors = Arc::new(ScanCursors::new());
    loop {
        let (stream, peer) = listener.accept().await?;
        let engine = Arc::clone(&engine);
        let cursors = Arc::clone(&cursors);
        tokio::spawn(async move {
            if let Err(err) = handle_connection(stream, engine, cursors).await {
                debug!(%peer, error = %err, "connection closed with error");
            }
        });
    }
}

/// Handles a single TCP client connection.
///
/// Pipelined commands are answered in order; replies for one read batch are
/// flushed with a single write.
pub async fn handle_connection<E>(
    stream: TcpStream,
    engine: Arc<E>,
    cursors: Arc<ScanCursors>,
) -> std::io::Result<()>
where
    E: KVEngine + ?Sized,
{
    let mut stream = stream;
    let peer = stream.peer_addr().ok();
    debug!(?peer, "connection accepted");

    let mut buffer = BytesMut::with_capacity(8 * 1024);
    let mut out = Vec::with_capacity(1024);

    loop {
        let bytes = stream.read_buf(&mut buffer).await?;
        if bytes == 0 {
            break;
        }

        out.clear();
        let mut close = false;
        loop {
            match decode(&mut buffer) {
                Ok(Some(frame)) => {
                    let reply = match frame.into_command_args() {
                        Ok(args) => dispatch_command(&args, engine.as_ref(), &cursors),
                        Err(err) => RespValue::error(&err.to_string()),
                    };
                    encode_value(&reply, &mut out);
                }
                Ok(None) => break,
                Err(err) => {
                    warn!(?peer, error = %err, "protocol error, closing connection");
                    encode_value(&protocol_error(&err), &mut out);
                    close = true;
                    break;
                }
            }
        }

        if !out.is_empty() {
            stream.write_all(&out).await?;
        }
        if close {
            break;
        }
    }

    debug!(?peer, "connection closed");
    Ok(())
}

/// Binds a listener on `addr` and returns it with its resolved local address.
pub async fn bind(addr: &str) -> std::io::Result<(TcpListener, SocketAddr)> {
    let listener = TcpListener::bind(addr).await?;
    let local = listener.local_addr()?;
    Ok((listener, local))
}

fn protocol_error(err: &ProtocolError) -> RespValue {
    RespValue::error(&format!("protocol error: {err}"))
}

fn dispatch_command<E: KVEngine + ?Sized>(
    args: &[Vec<u8>],
    engine: &E,
    cursors: &ScanCursors,
) -> RespValue {
    let name = String::from_utf8_lossy(&args[0]).to_ascii_uppercase();
    match name.as_str() {
        "PING" => handle_ping(args),
        "GET" => handle_get(args, engine),
        "SET" => handle_set(args, engine),
        "DEL" => handle_del(args, engine),
        "EXISTS" => handle_exists(args, engine),
        "EXPIRE" => handle_expire(args, engine, "expire", 1000),
        "PEXPIRE" => handle_expire(args, engine, "pexpire", 1),
        "TTL" => handle_ttl(args, engine, false),
        "PTTL" => handle_ttl(args, engine, true),
        "SCAN" => handle_scan(args, engine, cursors),
        "DBSIZE" => RespValue::Integer(engine.len() as i64),
        "SELECT" => handle_select(args),
        "AUTH" => RespValue::error("AUTH called without any password configured"),
        "INFO" => handle_info(engine),
        _ => RespValue::error(&format!("unknown command '{}'", name.to_ascii_lowercase())),
    }
}

fn wrong_arity(name: &str) -> RespValue {
    RespValue::error(&format!("wrong number of arguments for '{name}' command"))
}

fn handle_ping(args: &[Vec<u8>]) -> RespValue {
    match args.len() {
        1 => RespValue::Simple(b"PONG".to_vec()),
        2 => RespValue::bulk(args[1].clone()),
        _ => wrong_arity("ping"),
    }
}

fn handle_get<E: KVEngine + ?Sized>(args: &[Vec<u8>], engine: &E) -> RespValue {
    if args.len() != 2 {
        return wrong_arity("get");
    }
    match engine.get(&args[1]) {
        Some(value) => RespValue::bulk(value.to_vec()),
        None => RespValue::null(),
    }
}

fn handle_set<E: KVEngine + ?Sized>(args: &[Vec<u8>], engine: &E) -> RespValue {
    if args.len() < 3 {
        return wrong_arity("set");
    }

    let ttl = match args.len() {
        3 => None,
        5 => {
            let amount = match parse_u64(&args[4]) {
                Some(amount) => amount,
                None => return RespValue::error("value is not an integer or out of range"),
            };
            let unit_ms = if args[3].eq_ignore_ascii_case(b"EX") {
                1000
            } else if args[3].eq_ignore_ascii_case(b"PX") {
                1
            } else {
                return RespValue::error("syntax error");
            };
            match expire_duration(amount, unit_ms) {
                Some(ttl) if amount > 0 => Some(ttl),
                _ => return RespValue::error("invalid expire time in 'set' command"),
            }
        }
        _ => return RespValue::error("syntax error"),
    };

    engine.set(args[1].clone(), args[2].clone(), ttl);
    RespValue::ok()
}

fn handle_del<E: KVEngine + ?Sized>(args: &[Vec<u8>], engine: &E) -> RespValue {
    if args.len() < 2 {
        return wrong_arity("del");
    }
    let removed = args[1..].iter().filter(|key| engine.delete(key)).count();
    RespValue::Integer(removed as i64)
}

fn handle_exists<E: KVEngine + ?Sized>(args: &[Vec<u8>], engine: &E) -> RespValue {
    if args.len() < 2 {
        return wrong_arity("exists");
    }
    let found = args[1..].iter().filter(|key| engine.exists(key)).count();
    RespValue::Integer(found as i64)
}

fn handle_expire<E: KVEngine + ?Sized>(
    args: &[Vec<u8>],
    engine: &E,
    name: &str,
    unit_ms: u64,
) -> RespValue {
    if args.len() != 3 {
        return wrong_arity(name);
    }
    let amount = match parse_u64(&args[2]) {
        Some(amount) => amount,
        None => return RespValue::error("value is not an integer or out of range"),
    };
    match expire_duration(amount, unit_ms) {
        Some(ttl) => RespValue::Integer(engine.expire(&args[1], ttl) as i64),
        None => RespValue::error(&format!("invalid expire time in '{name}' command")),
    }
}

/// Converts an expiry in `unit_ms` milliseconds to a duration, rejecting
/// values outside the signed millisecond range or past `Instant`'s range.
fn expire_duration(amount: u64, unit_ms: u64) -> Option<Duration> {
    let millis = amount.checked_mul(unit_ms)?;
    if millis > i64::MAX as u64 {
        return None;
    }
    let ttl = Duration::from_millis(millis);
    Instant::now().checked_add(ttl)?;
    Some(ttl)
}

fn handle_ttl<E: KVEngine + ?Sized>(args: &[Vec<u8>], engine: &E, millis: bool) -> RespValue {
    if args.len() != 2 {
        return wrong_arity(if millis { "pttl" } else { "ttl" });
    }
    let status = engine.ttl(&args[1]);
    if millis {
        RespValue::Integer(status.to_millis_reply())
    } else {
        RespValue::Integer(status.to_secs_reply())
    }
}

/// `SCAN cursor [MATCH pattern] [COUNT count]`
///
/// Pages walk the sorted key list; each cursor resumes after the last key
/// returned, so a full iteration visits every key that lives for its whole
/// duration. Every page re-collects and sorts the matching keys, which is
/// quadratic over a full iteration and fine for a development store.
fn handle_scan<E: KVEngine + ?Sized>(
    args: &[Vec<u8>],
    engine: &E,
    cursors: &ScanCursors,
) -> RespValue {
    if args.len() < 2 {
        return wrong_arity("scan");
    }
    let cursor = match parse_u64(&args[1]) {
        Some(cursor) => cursor,
        None => return RespValue::error("invalid cursor"),
    };

    let mut pattern: &[u8] = b"*";
    let mut count = DEFAULT_SCAN_COUNT;
    let mut idx = 2;
    while idx < args.len() {
        let option = &args[idx];
        let value = match args.get(idx + 1) {
            Some(value) => value,
            None => return RespValue::error("syntax error"),
        };
        if option.eq_ignore_ascii_case(b"MATCH") {
            pattern = value.as_slice();
        } else if option.eq_ignore_ascii_case(b"COUNT") {
            count = match parse_u64(value) {
                Some(count) if count > 0 => count as usize,
                _ => return RespValue::error("syntax error"),
            };
        } else {
            return RespValue::error("syntax error");
        }
        idx += 2;
    }

    let keys = engine.keys(pattern);
    let start = if cursor == 0 {
        0
    } else {
        match cursors.take(cursor) {
            Some(last_key) => keys.partition_point(|key| key.as_slice() <= last_key.as_slice()),
            None => return RespValue::error("invalid cursor"),
        }
    };
    let end = start.saturating_add(count).min(keys.len());
    let next = if end >= keys.len() {
        0
    } else {
        cursors.open(keys[end - 1].clone())
    };

    let page = keys[start..end]
        .iter()
        .map(|key| RespValue::bulk(key.clone()))
        .collect();
    RespValue::Array(Some(vec![
        RespValue::bulk(next.to_string()),
        RespValue::Array(Some(page)),
    ]))
}

fn handle_select(args: &[Vec<u8>]) -> RespValue {
    if args.len() != 2 {
        return wrong_arity("select");
    }
    match parse_u64(&args[1]) {
        Some(0) => RespValue::ok(),
        Some(_) => RespValue::error("DB index is out of range"),
        None => RespValue::error("value is not an integer or out of range"),
    }
}

fn handle_info<E: KVEngine + ?Sized>(engine: &E) -> RespValue {
    let info = format!(
        "# Server\r\nrole:master\r\nengine:telli-cache\r\n# Keyspace\r\ndb0:keys={}\r\n",
        engine.len()
    );
    RespValue::bulk(info)
}

fn parse_u64(arg: &[u8]) -> Option<u64> {
    std::str::from_utf8(arg).ok()?.parse().ok()
}
