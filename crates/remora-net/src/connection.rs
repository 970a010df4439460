//! A single connection to a cache node.
//!
//! Wraps one TCP stream plus a read buffer, a liveness flag, and a
//! per-connection correlation-id counter. Any I/O error or timeout
//! flips the connection dead; dead connections are destroyed by the
//! pool instead of being reused.

use std::io::ErrorKind;

use bytes::{Buf, Bytes, BytesMut};
use remora_proto::{Request, Response, ResponseHeader, Status, HEADER_LEN};
use remora_types::{AuthProvider, Endpoint};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};
use tracing::warn;

use crate::error::NetError;

/// One live socket to a node.
pub struct Connection {
    stream: TcpStream,
    endpoint: Endpoint,
    /// Buffered bytes for text-mode line reads.
    buf: BytesMut,
    /// False after any I/O error; the pool destroys dead connections.
    alive: bool,
    /// Correlation-id counter. Wrapping is fine: ids only need to be
    /// unique among requests concurrently in flight on this socket.
    opaque: u32,
}

impl Connection {
    /// Open a TCP connection within `connect_timeout` (distinct from
    /// the per-operation receive timeout).
    pub async fn connect(endpoint: &Endpoint, connect_timeout: Duration) -> Result<Self, NetError> {
        let addr = endpoint.to_string();
        let stream = timeout(connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| NetError::ConnectTimeout(endpoint.clone()))??;
        stream.set_nodelay(true)?;
        Ok(Self {
            stream,
            endpoint: endpoint.clone(),
            buf: BytesMut::with_capacity(4096),
            alive: true,
            opaque: 0,
        })
    }

    /// The endpoint this connection talks to.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Whether the connection is still usable.
    pub fn is_alive(&self) -> bool {
        self.alive
    }

    /// Next correlation id for a single request.
    pub fn next_opaque(&mut self) -> u32 {
        self.reserve_opaques(1)
    }

    /// Reserve `count` consecutive correlation ids and return the
    /// first. Pipelines reserve their whole span up front so no other
    /// request on this connection can collide mid-batch.
    pub fn reserve_opaques(&mut self, count: u32) -> u32 {
        let first = self.opaque;
        self.opaque = self.opaque.wrapping_add(count);
        first
    }

    /// Send one request as a scatter/gather write: the codec's header,
    /// extras, key, and value segments go out through one chained
    /// buffer without being copied into a contiguous allocation.
    pub async fn send(&mut self, req: &Request) -> Result<(), NetError> {
        let [header, extras, key, value] = req.segments()?;
        let mut chained = header.chain(extras).chain(key).chain(value);
        if let Err(e) = self.stream.write_all_buf(&mut chained).await {
            self.alive = false;
            return Err(e.into());
        }
        if let Err(e) = self.stream.flush().await {
            self.alive = false;
            return Err(e.into());
        }
        Ok(())
    }

    /// Send a pre-batched buffer (a pipelined multi-get) in one write.
    pub async fn send_bytes(&mut self, mut bytes: Bytes) -> Result<(), NetError> {
        if let Err(e) = self.stream.write_all_buf(&mut bytes).await {
            self.alive = false;
            return Err(e.into());
        }
        if let Err(e) = self.stream.flush().await {
            self.alive = false;
            return Err(e.into());
        }
        Ok(())
    }

    /// Read one binary response: the fixed header, then exactly the
    /// body length it promises.
    pub async fn read_response(&mut self, receive_timeout: Duration) -> Result<Response, NetError> {
        let mut header_raw = [0u8; HEADER_LEN];
        self.read_exact_timed(&mut header_raw, receive_timeout)
            .await?;
        let header = match ResponseHeader::parse(&header_raw) {
            Ok(h) => h,
            Err(e) => {
                // Framing is broken; nothing further on this stream can
                // be trusted.
                self.alive = false;
                return Err(e.into());
            }
        };

        let mut body = vec![0u8; header.total_body];
        self.read_exact_timed(&mut body, receive_timeout).await?;
        Ok(Response::from_parts(header, Bytes::from(body))?)
    }

    /// Send a text-protocol command (already `\r\n`-terminated).
    pub async fn send_line(&mut self, line: Bytes) -> Result<(), NetError> {
        self.send_bytes(line).await
    }

    /// Read one `\r\n`-terminated text-protocol line.
    pub async fn read_line(&mut self, receive_timeout: Duration) -> Result<String, NetError> {
        loop {
            if let Some(pos) = self.buf.windows(2).position(|w| w == b"\r\n") {
                let line = self.buf.split_to(pos);
                self.buf.advance(2);
                return Ok(String::from_utf8_lossy(&line).into_owned());
            }
            let read = timeout(receive_timeout, self.stream.read_buf(&mut self.buf)).await;
            match read {
                Ok(Ok(0)) => {
                    self.alive = false;
                    return Err(NetError::Io(ErrorKind::UnexpectedEof.into()));
                }
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    self.alive = false;
                    return Err(e.into());
                }
                Err(_) => {
                    self.alive = false;
                    return Err(NetError::ReceiveTimeout(self.endpoint.clone()));
                }
            }
        }
    }

    /// Read exactly `len` more bytes after a text `VALUE` line (the
    /// data block plus its trailing `\r\n`).
    pub async fn read_data_block(
        &mut self,
        len: usize,
        receive_timeout: Duration,
    ) -> Result<Bytes, NetError> {
        while self.buf.len() < len + 2 {
            let read = timeout(receive_timeout, self.stream.read_buf(&mut self.buf)).await;
            match read {
                Ok(Ok(0)) => {
                    self.alive = false;
                    return Err(NetError::Io(ErrorKind::UnexpectedEof.into()));
                }
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    self.alive = false;
                    return Err(e.into());
                }
                Err(_) => {
                    self.alive = false;
                    return Err(NetError::ReceiveTimeout(self.endpoint.clone()));
                }
            }
        }
        let data = self.buf.split_to(len).freeze();
        self.buf.advance(2);
        Ok(data)
    }

    /// Drain any bytes unexpectedly left over from a prior operation
    /// before this connection is reused.
    ///
    /// Leftover bytes indicate a framing bug somewhere, so finding any
    /// is logged loudly. The buffered text-mode bytes are cleared too.
    pub fn reset(&mut self) {
        let mut drained = self.buf.len();
        self.buf.clear();

        let mut scratch = [0u8; 1024];
        loop {
            match self.stream.try_read(&mut scratch) {
                Ok(0) => {
                    // Peer closed; nothing more will arrive.
                    self.alive = false;
                    break;
                }
                Ok(n) => drained += n,
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(_) => {
                    self.alive = false;
                    break;
                }
            }
        }

        if drained > 0 {
            warn!(
                endpoint = %self.endpoint,
                drained,
                "connection had leftover bytes before reuse"
            );
        }
    }

    /// Run the SASL handshake with payloads from an auth provider.
    ///
    /// The payload bytes are opaque to this client; it only shuttles
    /// them. `AuthContinue` loops through `respond` until the server
    /// settles on success or failure.
    pub async fn authenticate(
        &mut self,
        provider: &dyn AuthProvider,
        receive_timeout: Duration,
    ) -> Result<(), NetError> {
        let mechanism = Bytes::copy_from_slice(provider.mechanism().as_bytes());
        let initial = Bytes::from(provider.initial().await);
        let opaque = self.next_opaque();
        self.send(&Request::sasl_auth(mechanism.clone(), initial, opaque))
            .await?;

        loop {
            let resp = self.read_response(receive_timeout).await?;
            match resp.status {
                Status::Success => return Ok(()),
                Status::AuthContinue => {
                    let answer = Bytes::from(provider.respond(&resp.value).await);
                    let opaque = self.next_opaque();
                    self.send(&Request::sasl_step(mechanism.clone(), answer, opaque))
                        .await?;
                }
                _ => {
                    self.alive = false;
                    return Err(NetError::Auth(
                        resp.error_message().unwrap_or("rejected").to_string(),
                    ));
                }
            }
        }
    }

    async fn read_exact_timed(
        &mut self,
        out: &mut [u8],
        receive_timeout: Duration,
    ) -> Result<(), NetError> {
        match timeout(receive_timeout, self.stream.read_exact(out)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => {
                self.alive = false;
                Err(e.into())
            }
            Err(_) => {
                self.alive = false;
                Err(NetError::ReceiveTimeout(self.endpoint.clone()))
            }
        }
    }

}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("endpoint", &self.endpoint)
            .field("alive", &self.alive)
            .finish()
    }
}
