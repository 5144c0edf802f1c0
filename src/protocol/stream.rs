/// Buffered packet stream over an async socket
///
/// Owns three buffers: pending inbound bytes, write-side bytes, and a
/// push-back buffer that replays already-consumed bytes ahead of the
/// socket. The push-back is what gives the proxy loop its one-byte
/// lookahead of the next message kind.
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{ProtocolError, ProtocolResult};

const READ_CHUNK: usize = 8192;

pub struct PacketStream<S> {
    io: S,
    inbound: BytesMut,
    outbound: BytesMut,
    pushback: BytesMut,
}

impl<S> PacketStream<S> {
    pub fn new(io: S) -> Self {
        Self {
            io,
            inbound: BytesMut::with_capacity(READ_CHUNK),
            outbound: BytesMut::with_capacity(READ_CHUNK),
            pushback: BytesMut::new(),
        }
    }

    /// True when buffered unread input exists. The proxy loop uses
    /// this to drain everything the peer already sent before blocking
    /// on the other side.
    pub fn pending(&self) -> bool {
        !self.pushback.is_empty() || !self.inbound.is_empty()
    }

    /// Replay bytes so the next reads see them before the socket
    pub fn push_back(&mut self, bytes: &[u8]) {
        let mut replay = BytesMut::with_capacity(bytes.len() + self.pushback.len());
        replay.put_slice(bytes);
        replay.put_slice(&self.pushback);
        self.pushback = replay;
    }

    fn buffered_len(&self) -> usize {
        self.pushback.len() + self.inbound.len()
    }

    fn take_buffered(&mut self, n: usize) -> Bytes {
        debug_assert!(n <= self.buffered_len());
        let mut out = BytesMut::with_capacity(n);
        let from_pushback = n.min(self.pushback.len());
        if from_pushback > 0 {
            out.put_slice(&self.pushback.split_to(from_pushback));
        }
        let rest = n - from_pushback;
        if rest > 0 {
            out.put_slice(&self.inbound.split_to(rest));
        }
        out.freeze()
    }

    /// Take everything currently buffered without touching the socket
    pub fn drain_buffered(&mut self) -> Bytes {
        let n = self.buffered_len();
        self.take_buffered(n)
    }

    /// Give back the underlying socket, dropping any buffered state
    pub fn into_inner(self) -> S {
        self.io
    }

    pub fn get_ref(&self) -> &S {
        &self.io
    }
}

impl<S> PacketStream<S>
where
    S: AsyncRead + Unpin,
{
    /// Fill the inbound buffer with at least one byte from the socket.
    /// Returns StreamClosed on EOF so callers can tell a routine
    /// client quit from a fault.
    async fn fill(&mut self) -> ProtocolResult<()> {
        let mut chunk = [0u8; READ_CHUNK];
        let n = self.io.read(&mut chunk).await?;
        if n == 0 {
            return Err(ProtocolError::StreamClosed);
        }
        self.inbound.put_slice(&chunk[..n]);
        Ok(())
    }

    /// Read exactly `n` bytes
    pub async fn read_exact_bytes(&mut self, n: usize) -> ProtocolResult<Bytes> {
        while self.buffered_len() < n {
            self.fill().await?;
        }
        Ok(self.take_buffered(n))
    }

    pub async fn read_u8(&mut self) -> ProtocolResult<u8> {
        let b = self.read_exact_bytes(1).await?;
        Ok(b[0])
    }

    pub async fn read_i32(&mut self) -> ProtocolResult<i32> {
        let mut b = self.read_exact_bytes(4).await?;
        Ok(b.get_i32())
    }

    /// Look at the next byte without consuming it
    pub async fn peek_byte(&mut self) -> ProtocolResult<u8> {
        if let Some(b) = self.pushback.first() {
            return Ok(*b);
        }
        while self.inbound.is_empty() {
            self.fill().await?;
        }
        Ok(self.inbound[0])
    }

    /// Read up to and including the next NUL, returning bytes without
    /// the terminator
    pub async fn read_until_nul(&mut self) -> ProtocolResult<Bytes> {
        let mut out = BytesMut::new();
        loop {
            let b = self.read_u8().await?;
            if b == 0 {
                return Ok(out.freeze());
            }
            out.put_u8(b);
        }
    }

    /// Probe whether the peer silently went away while the stream sat
    /// idle. Waits at most `window` for readability; any bytes that do
    /// arrive stay buffered for the next read.
    pub async fn probe_closed(&mut self, window: std::time::Duration) -> bool {
        if self.pending() {
            return false;
        }
        match tokio::time::timeout(window, self.fill()).await {
            Ok(Ok(())) => false,
            Ok(Err(_)) => true,
            Err(_) => false,
        }
    }
}

impl<S> PacketStream<S>
where
    S: AsyncWrite + Unpin,
{
    /// Queue bytes for writing; nothing hits the socket until flush
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.outbound.put_slice(bytes);
    }

    pub async fn flush(&mut self) -> ProtocolResult<()> {
        if self.outbound.is_empty() {
            return Ok(());
        }
        let buf = self.outbound.split();
        self.io.write_all(&buf).await?;
        self.io.flush().await?;
        Ok(())
    }

    pub async fn write_and_flush(&mut self, bytes: &[u8]) -> ProtocolResult<()> {
        self.write_bytes(bytes);
        self.flush().await
    }
}
