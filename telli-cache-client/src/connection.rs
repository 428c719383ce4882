//! # Cache Connection
//!
//! One TCP connection to the backing store with reusable buffers. A
//! connection carries at most one command at a time; the pool enforces that by
//! handing each connection to a single caller.

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use telli_cache_common::{decode, encode_command, RespValue};

use crate::config::ConnectionTarget;
use crate::error::{CacheError, CacheResult};

pub(crate) struct Connection {
    stream: TcpStream,
    read_buf: BytesMut,
    write_buf: Vec<u8>,
}

impl Connection {
    /// Connects to `target` and runs the AUTH/SELECT handshake.
    pub(crate) async fn connect(target: &ConnectionTarget) -> CacheResult<Self> {
        let stream = TcpStream::connect((target.host.as_str(), target.port))
            .await
            .map_err(|err| CacheError::Unavailable(format!("connect to {target} failed: {err}")))?;
        // Disable Nagle to keep request latency low for small payloads.
        stream.set_nodelay(true)?;

        let mut conn = Connection {
            stream,
            read_buf: BytesMut::with_capacity(4 * 1024),
            write_buf: Vec::with_capacity(256),
        };
        conn.handshake(target).await?;
        debug!(%target, "cache connection established");
        Ok(conn)
    }

    async fn handshake(&mut self, target: &ConnectionTarget) -> CacheResult<()> {
        if let Some(password) = &target.password {
            let reply = match &target.username {
                Some(user) => {
                    self.exec(&[b"AUTH", user.as_bytes(), password.as_bytes()])
                        .await?
                }
                None => self.exec(&[b"AUTH", password.as_bytes()]).await?,
            };
            expect_ok("AUTH", reply)?;
        }

        if target.database != 0 {
            let db = target.database.to_string();
            let reply = self.exec(&[b"SELECT", db.as_bytes()]).await?;
            expect_ok("SELECT", reply)?;
        }
        Ok(())
    }

    /// Checks, without blocking, that an idle connection can carry a command.
    ///
    /// A parked connection should have nothing to read. End of stream means
    /// the server closed it; stray bytes mean the stream is out of step.
    pub(crate) fn is_open(&self) -> bool {
        let mut probe = [0u8; 1];
        match self.stream.try_read(&mut probe) {
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => true,
            Ok(_) | Err(_) => false,
        }
    }

    /// Writes one command and reads exactly one reply.
    pub(crate) async fn exec(&mut self, args: &[&[u8]]) -> CacheResult<RespValue> {
        self.write_buf.clear();
        encode_command(args, &mut self.write_buf);
        self.stream.write_all(&self.write_buf).await?;

        loop {
            if let Some(reply) = decode(&mut self.read_buf)? {
                if !self.read_buf.is_empty() {
                    // Bytes past the reply mean the stream is out of step.
                    return Err(CacheError::Protocol(
                        "unsolicited data after reply".to_string(),
                    ));
                }
                return Ok(reply);
            }
            let read = self.stream.read_buf(&mut self.read_buf).await?;
            if read == 0 {
                return Err(CacheError::Unavailable(
                    "connection closed by cache server".to_string(),
                ));
            }
        }
    }
}

fn expect_ok(command: &str, reply: RespValue) -> CacheResult<()> {
    match reply {
        RespValue::Simple(_) => Ok(()),
        RespValue::Error(message) => Err(CacheError::Protocol(format!(
            "{command} rejected: {}",
            String::from_utf8_lossy(&message)
        ))),
        other => Err(CacheError::Protocol(format!(
            "unexpected {command} reply: {other:?}"
        ))),
    }
}
