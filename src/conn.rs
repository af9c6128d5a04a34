//! The asynchronous connection engine.
//!
//! An [`AsyncConn`] owns one byte stream and two background tasks:
//!
//! - the **read loop** decodes inbound frames and pushes them onto a bounded
//!   ring buffer, where [`AsyncConn::read_packet`] pops them;
//! - the **flush loop** waits on a signal channel and flushes the buffered
//!   writer, so many `write_packet` calls coalesce into one flush.
//!
//! ```text
//! bytes ─► read loop ─► RingBuffer ─► read_packet()
//! write_packet() ─► buffered writer ─► flush loop ─► bytes
//! ```
//!
//! The connection is in one of three states. CONNECTED is the only
//! operational one. EOF-class read errors move it to PAUSED, which keeps the
//! underlying stream open so a reconnect layer can resurrect the logical
//! connection. Everything else, and any explicit `close`/`raw`, moves it to
//! CLOSED. All transitions are a compare-and-set on the state word; only the
//! winner runs teardown.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::ClientConfig;

use crate::error::{Error, Result};
use crate::packet::{self, Packet};
use crate::protocol::{Metadata, HEADER_SIZE};
use crate::ringbuffer::{RingBuffer, DEFAULT_CAPACITY};
use crate::transport::{self, BoxedStream, TlsState};

const CONNECTED: u8 = 0;
const CLOSED: u8 = 1;
const PAUSED: u8 = 2;

/// Buffered writer capacity.
const WRITE_BUFFER_SIZE: usize = 64 * 1024;

/// Flush-signal channel capacity. Senders never block: a signal that cannot
/// be enqueued is dropped, which is harmless because a signal already in
/// flight covers the same buffered bytes.
const FLUSH_QUEUE_SIZE: usize = 1024;

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Operational.
    Connected,
    /// Terminal. The stream has been released or shut down.
    Closed,
    /// Non-operational but resurrectable: the peer ended the stream, the
    /// local endpoint is intact.
    Paused,
}

impl State {
    fn from_word(word: u8) -> Self {
        match word {
            CONNECTED => State::Connected,
            PAUSED => State::Paused,
            _ => State::Closed,
        }
    }
}

struct Joins {
    read_done: mpsc::Receiver<()>,
    flush_done: mpsc::Receiver<()>,
}

struct Shared {
    state: AtomicU8,
    last_error: StdMutex<Error>,
    writer: AsyncMutex<Option<BufWriter<WriteHalf<BoxedStream>>>>,
    incoming: RingBuffer<Packet>,
    flush_tx: mpsc::Sender<()>,
    shutdown_tx: watch::Sender<bool>,
    /// Parking spot for the read half; the read loop returns it here on
    /// every exit path so `raw`/`close` can reunite the stream.
    read_half: StdMutex<Option<ReadHalf<BoxedStream>>>,
    joins: StdMutex<Option<Joins>>,
}

impl Shared {
    fn state_word(&self) -> u8 {
        self.state.load(Ordering::Acquire)
    }

    fn last_error(&self) -> Error {
        self.last_error.lock().expect("error slot poisoned").clone()
    }

    fn store_error(&self, err: Error) {
        *self.last_error.lock().expect("error slot poisoned") = err;
    }

    fn transition(&self, from: u8, to: u8) -> bool {
        self.state
            .compare_exchange(from, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Stop both background tasks and wait for them to finish.
    ///
    /// Ordering matters: the ring buffer closes first (unblocks a consumer
    /// stuck in `pop`), then the shutdown signal wakes both loops out of
    /// their blocking awaits, then we join. Each loop drops its completion
    /// sender before it runs any teardown of its own, so a loop triggering
    /// its own connection teardown cannot deadlock here.
    async fn kill_tasks(&self) {
        self.incoming.close();
        let _ = self.shutdown_tx.send(true);
        let joins = self.joins.lock().expect("join slot poisoned").take();
        if let Some(mut joins) = joins {
            let _ = joins.read_done.recv().await;
            let _ = joins.flush_done.recv().await;
        }
    }

    async fn pause(&self) -> Result<()> {
        if self.transition(CONNECTED, PAUSED) {
            self.store_error(Error::ConnectionPaused);
            self.kill_tasks().await;
            Ok(())
        } else if self.state_word() == PAUSED {
            Err(Error::ConnectionPaused)
        } else {
            Err(Error::ConnectionNotInitialized)
        }
    }

    /// Transition to CLOSED. Returns `Err(ConnectionClosed)` when the
    /// connection was already closed, in which case the caller must not
    /// touch the stream. The CONNECTED winner flushes whatever the writer
    /// still buffers; a PAUSED connection has nothing in flight worth
    /// saving.
    async fn close_inner(&self) -> Result<()> {
        if self.transition(CONNECTED, CLOSED) {
            self.store_error(Error::ConnectionClosed);
            self.kill_tasks().await;
            let mut writer = self.writer.lock().await;
            if let Some(writer) = writer.as_mut() {
                if !writer.buffer().is_empty() {
                    let _ = writer.flush().await;
                }
            }
            Ok(())
        } else if self.transition(PAUSED, CLOSED) {
            self.store_error(Error::ConnectionClosed);
            Ok(())
        } else {
            Err(Error::ConnectionClosed)
        }
    }

    /// Reunite the stream halves, consuming both parking slots.
    async fn take_stream(&self) -> Option<BoxedStream> {
        let read_half = self.read_half.lock().expect("read half poisoned").take()?;
        let write_half = self.writer.lock().await.take()?;
        Some(read_half.unsplit(write_half.into_inner()))
    }

    async fn shutdown_stream(&self) {
        if let Some(mut stream) = self.take_stream().await {
            let _ = stream.shutdown().await;
        }
    }

    /// React to a fatal error from a loop or an API call. EOF-class errors
    /// pause; everything else closes, stores the inducing error, and shuts
    /// the stream down. Returns the error the caller should surface.
    async fn close_with_error(&self, err: Error) -> Error {
        if err.is_eof_class() {
            match self.pause().await {
                Ok(()) => {
                    tracing::debug!(error = %err, "stream ended, pausing connection");
                    Error::ConnectionPaused
                }
                Err(Error::ConnectionNotInitialized) => Error::ConnectionNotInitialized,
                Err(_) => Error::ConnectionPaused,
            }
        } else {
            match self.close_inner().await {
                Ok(()) => {
                    tracing::debug!(error = %err, "closing connection with error");
                    self.store_error(err.clone());
                    self.shutdown_stream().await;
                    err
                }
                Err(_) => Error::ConnectionClosed,
            }
        }
    }
}

/// A duplex, packet-oriented connection over a reliable byte stream.
///
/// All methods take `&self`; an `AsyncConn` is typically wrapped in an
/// [`Arc`] and shared between a dispatch loop and whatever else needs to
/// write.
pub struct AsyncConn {
    shared: Arc<Shared>,
    local_addr: Option<SocketAddr>,
    peer_addr: Option<SocketAddr>,
    tls: Option<TlsState>,
}

impl AsyncConn {
    /// Wrap an already-connected stream. Spawns the read and flush loops;
    /// the connection starts CONNECTED.
    pub fn new(stream: BoxedStream) -> Self {
        let local_addr = stream.local_addr();
        let peer_addr = stream.peer_addr();
        let tls = stream.tls_state();

        let (read_half, write_half) = tokio::io::split(stream);
        let (flush_tx, flush_rx) = mpsc::channel(FLUSH_QUEUE_SIZE);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (read_done_tx, read_done) = mpsc::channel(1);
        let (flush_done_tx, flush_done) = mpsc::channel(1);

        let shared = Arc::new(Shared {
            state: AtomicU8::new(CONNECTED),
            last_error: StdMutex::new(Error::ConnectionClosed),
            writer: AsyncMutex::new(Some(BufWriter::with_capacity(
                WRITE_BUFFER_SIZE,
                write_half,
            ))),
            incoming: RingBuffer::new(DEFAULT_CAPACITY),
            flush_tx,
            shutdown_tx,
            read_half: StdMutex::new(None),
            joins: StdMutex::new(Some(Joins {
                read_done,
                flush_done,
            })),
        });

        tokio::spawn(read_loop(
            shared.clone(),
            read_half,
            shutdown_rx.clone(),
            read_done_tx,
        ));
        tokio::spawn(flush_loop(
            shared.clone(),
            flush_rx,
            shutdown_rx,
            flush_done_tx,
        ));

        Self {
            shared,
            local_addr,
            peer_addr,
            tls,
        }
    }

    /// Dial a plain TCP connection and wrap it.
    pub async fn connect(addr: &str, keep_alive: Duration) -> Result<Self> {
        Ok(Self::new(transport::connect(addr, keep_alive).await?))
    }

    /// Dial a TLS connection and wrap it.
    pub async fn connect_tls(
        addr: &str,
        server_name: ServerName<'static>,
        config: Arc<ClientConfig>,
        keep_alive: Duration,
    ) -> Result<Self> {
        Ok(Self::new(
            transport::connect_tls(addr, server_name, config, keep_alive).await?,
        ))
    }

    /// Write a packet to the buffered writer and signal the flush loop.
    ///
    /// The packet is borrowed: the transport only reads its fields, so the
    /// caller may reuse it for the next send. Delivery is not flushed by the
    /// time this returns; callers that need bytes on the wire must call
    /// [`flush`](Self::flush).
    ///
    /// # Errors
    ///
    /// [`Error::InvalidContentLength`] when the declared content length does
    /// not match the content (the stream is not touched). Otherwise, the
    /// stored lifecycle error when the connection is not CONNECTED, or the
    /// error that closed the connection when the underlying write fails.
    pub async fn write_packet(&self, packet: &Packet) -> Result<()> {
        if packet.metadata.content_length as usize != packet.content.len() {
            return Err(Error::InvalidContentLength);
        }
        let encoded = packet.metadata.encode();

        if self.shared.state_word() != CONNECTED {
            return Err(self.shared.last_error());
        }

        let mut writer_guard = self.shared.writer.lock().await;
        let Some(writer) = writer_guard.as_mut() else {
            return Err(self.shared.last_error());
        };

        if let Err(e) = writer.write_all(&encoded).await {
            drop(writer_guard);
            return Err(self.write_failed(e.into()).await);
        }
        if !packet.content.is_empty() {
            if let Err(e) = writer.write_all(&packet.content).await {
                drop(writer_guard);
                return Err(self.write_failed(e.into()).await);
            }
        }
        drop(writer_guard);

        // Non-blocking: a full queue means a signal is already in flight.
        let _ = self.shared.flush_tx.try_send(());

        Ok(())
    }

    async fn write_failed(&self, err: Error) -> Error {
        tracing::error!(error = %err, "write failed");
        if self.shared.state_word() != CONNECTED {
            self.shared.last_error()
        } else {
            self.shared.close_with_error(err).await
        }
    }

    /// Pop the next inbound packet, waiting until one arrives.
    ///
    /// Packets are delivered in wire order, each exactly once. The caller
    /// owns the returned packet and should hand it back to the packet pool
    /// when done.
    pub async fn read_packet(&self) -> Result<Packet> {
        if self.shared.state_word() != CONNECTED {
            return Err(self.shared.last_error());
        }

        match self.shared.incoming.pop().await {
            Ok(packet) => Ok(packet),
            Err(e) => {
                // The pop fails only once the buffer is closed, which is
                // part of teardown; translate through the state.
                if self.shared.state_word() != CONNECTED {
                    Err(self.shared.last_error())
                } else {
                    Err(self.shared.close_with_error(e).await)
                }
            }
        }
    }

    /// Flush any buffered outbound bytes to the stream.
    pub async fn flush(&self) -> Result<()> {
        let mut writer_guard = self.shared.writer.lock().await;
        if let Some(writer) = writer_guard.as_mut() {
            if !writer.buffer().is_empty() {
                if let Err(e) = writer.flush().await {
                    drop(writer_guard);
                    let err = Error::from(e);
                    let _ = self.shared.close_with_error(err.clone()).await;
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    /// Release the underlying stream to the caller.
    ///
    /// The connection transitions to CLOSED, background tasks are torn down
    /// and buffered bytes flushed, but the stream itself is left open and
    /// returned. Every transport operation afterwards fails with
    /// [`Error::ConnectionClosed`].
    pub async fn raw(&self) -> Result<BoxedStream> {
        let _ = self.shared.close_inner().await;
        self.shared
            .take_stream()
            .await
            .ok_or(Error::ConnectionClosed)
    }

    /// Gracefully close the connection: tear down background tasks, flush
    /// buffered bytes, shut the stream down. Idempotent.
    pub async fn close(&self) -> Result<()> {
        if self.shared.close_inner().await.is_ok() {
            self.shared.shutdown_stream().await;
        }
        Ok(())
    }

    /// The last error stored by a state transition.
    pub fn error(&self) -> Error {
        self.shared.last_error()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> State {
        State::from_word(self.shared.state_word())
    }

    /// Local socket address, when the stream has one.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Remote socket address, when the stream has one.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// TLS session state of the underlying stream.
    ///
    /// # Errors
    ///
    /// [`Error::NotTlsConnection`] when the stream is not a TLS stream.
    pub fn tls_state(&self) -> Result<TlsState> {
        self.tls.clone().ok_or(Error::NotTlsConnection)
    }
}

async fn read_loop(
    shared: Arc<Shared>,
    mut reader: ReadHalf<BoxedStream>,
    mut shutdown: watch::Receiver<bool>,
    done: mpsc::Sender<()>,
) {
    let mut header = [0u8; HEADER_SIZE];
    let failure: Option<Error> = loop {
        let read = tokio::select! {
            _ = shutdown.changed() => break None,
            r = reader.read_exact(&mut header) => r,
        };
        if let Err(e) = read {
            break Some(e.into());
        }

        let metadata = match Metadata::decode(&header) {
            Ok(metadata) => metadata,
            Err(e) => break Some(e),
        };

        let mut packet = packet::get();
        packet.metadata = metadata;
        if metadata.content_length > 0 {
            packet.content.resize(metadata.content_length as usize, 0);
            let read = tokio::select! {
                _ = shutdown.changed() => None,
                r = reader.read_exact(&mut packet.content) => Some(r),
            };
            match read {
                None => {
                    packet::put(packet);
                    break None;
                }
                Some(Err(e)) => {
                    packet::put(packet);
                    break Some(e.into());
                }
                Some(Ok(_)) => {}
            }
        }

        if shared.incoming.push(packet).await.is_err() {
            // Buffer closed: teardown is in progress elsewhere.
            break None;
        }
    };

    // Park the read half for raw()/close(), then signal completion BEFORE
    // any teardown of our own so kill_tasks never waits on this task.
    shared
        .read_half
        .lock()
        .expect("read half poisoned")
        .replace(reader);
    drop(done);

    if let Some(err) = failure {
        let _ = shared.close_with_error(err).await;
    }
}

async fn flush_loop(
    shared: Arc<Shared>,
    mut signals: mpsc::Receiver<()>,
    mut shutdown: watch::Receiver<bool>,
    done: mpsc::Sender<()>,
) {
    let failure: Option<Error> = loop {
        let signal = tokio::select! {
            _ = shutdown.changed() => None,
            s = signals.recv() => s,
        };
        if signal.is_none() {
            break None;
        }

        let mut writer_guard = shared.writer.lock().await;
        let Some(writer) = writer_guard.as_mut() else {
            break None;
        };
        if !writer.buffer().is_empty() {
            if let Err(e) = writer.flush().await {
                break Some(e.into());
            }
        }
    };

    drop(done);

    if let Some(err) = failure {
        let _ = shared.close_with_error(err).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    fn pair() -> (AsyncConn, AsyncConn) {
        let (a, b) = duplex(1 << 20);
        (AsyncConn::new(Box::new(a)), AsyncConn::new(Box::new(b)))
    }

    fn ping_packet(id: u16, content: &[u8]) -> Packet {
        let mut packet = packet::get();
        packet.metadata.id = id;
        packet.metadata.operation = crate::protocol::PING;
        packet.set_content(content);
        packet
    }

    #[tokio::test]
    async fn test_write_flush_read_roundtrip() {
        let (a, b) = pair();

        let sent = ping_packet(7, b"hello over the wire");
        a.write_packet(&sent).await.unwrap();
        a.flush().await.unwrap();

        let received = b.read_packet().await.unwrap();
        assert_eq!(received.metadata, sent.metadata);
        assert_eq!(received.content, sent.content);

        packet::put(sent);
        packet::put(received);
        a.close().await.unwrap();
        b.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_flush_loop_delivers_without_explicit_flush() {
        let (a, b) = pair();

        let sent = ping_packet(1, b"coalesced");
        a.write_packet(&sent).await.unwrap();

        // No explicit flush: the background flush loop must get it there.
        let received = b.read_packet().await.unwrap();
        assert_eq!(received.metadata.id, 1);

        packet::put(sent);
        packet::put(received);
    }

    #[tokio::test]
    async fn test_invalid_content_length_rejected_before_stream() {
        let (a, b) = pair();

        let mut bad = ping_packet(1, b"abc");
        bad.metadata.content_length = 99;
        assert!(matches!(
            a.write_packet(&bad).await,
            Err(Error::InvalidContentLength)
        ));

        // Nothing hit the stream: the next valid packet is the first one
        // the peer sees.
        let good = ping_packet(2, b"abc");
        a.write_packet(&good).await.unwrap();
        a.flush().await.unwrap();

        let received = b.read_packet().await.unwrap();
        assert_eq!(received.metadata.id, 2);

        packet::put(bad);
        packet::put(good);
        packet::put(received);
    }

    #[tokio::test]
    async fn test_close_makes_operations_fail() {
        let (a, _b) = pair();
        a.close().await.unwrap();

        assert_eq!(a.state(), State::Closed);
        let p = ping_packet(1, b"");
        assert!(matches!(
            a.write_packet(&p).await,
            Err(Error::ConnectionClosed)
        ));
        assert!(matches!(
            a.read_packet().await,
            Err(Error::ConnectionClosed)
        ));
        packet::put(p);
    }

    #[tokio::test]
    async fn test_close_idempotent() {
        let (a, _b) = pair();
        a.close().await.unwrap();
        a.close().await.unwrap();
        assert_eq!(a.state(), State::Closed);
    }

    #[tokio::test]
    async fn test_eof_pauses_instead_of_closing() {
        let (a, b) = pair();

        // Closing the peer ends the stream without a protocol close.
        b.close().await.unwrap();

        assert!(matches!(
            a.read_packet().await,
            Err(Error::ConnectionPaused)
        ));
        assert_eq!(a.state(), State::Paused);

        // The underlying stream is still held, not released or shut down.
        let stream = a.raw().await;
        assert!(stream.is_ok());
    }

    #[tokio::test]
    async fn test_close_after_pause() {
        let (a, b) = pair();
        b.close().await.unwrap();

        assert!(matches!(
            a.read_packet().await,
            Err(Error::ConnectionPaused)
        ));
        a.close().await.unwrap();
        assert_eq!(a.state(), State::Closed);
        assert!(matches!(
            a.read_packet().await,
            Err(Error::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_raw_hands_back_usable_stream() {
        let (a, b) = pair();

        let mut raw_a = a.raw().await.unwrap();
        let mut raw_b = b.raw().await.unwrap();
        assert_eq!(a.state(), State::Closed);
        assert_eq!(b.state(), State::Closed);

        raw_a.write_all(b"RAW BYTES").await.unwrap();
        raw_a.flush().await.unwrap();

        let mut buf = [0u8; 9];
        raw_b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"RAW BYTES");
    }

    #[tokio::test]
    async fn test_raw_flushes_pending_writes() {
        let (a, b) = pair();

        let p = ping_packet(3, b"buffered");
        a.write_packet(&p).await.unwrap();
        let _raw = a.raw().await.unwrap();

        // Bytes written before raw() must still reach the peer.
        let received = b.read_packet().await.unwrap();
        assert_eq!(received.metadata.id, 3);

        packet::put(p);
        packet::put(received);
    }

    #[tokio::test]
    async fn test_wire_order_preserved() {
        let (a, b) = pair();

        let mut p = ping_packet(0, b"ordered");
        for id in 0..50u16 {
            p.metadata.id = id;
            a.write_packet(&p).await.unwrap();
        }
        a.flush().await.unwrap();

        for id in 0..50u16 {
            let received = b.read_packet().await.unwrap();
            assert_eq!(received.metadata.id, id);
            packet::put(received);
        }
        packet::put(p);
    }

    #[tokio::test]
    async fn test_empty_content_packet() {
        let (a, b) = pair();

        let p = ping_packet(9, b"");
        a.write_packet(&p).await.unwrap();
        a.flush().await.unwrap();

        let received = b.read_packet().await.unwrap();
        assert_eq!(received.metadata.id, 9);
        assert!(received.content.is_empty());

        packet::put(p);
        packet::put(received);
    }

    #[tokio::test]
    async fn test_tls_state_on_plain_stream() {
        let (a, _b) = pair();
        assert!(matches!(a.tls_state(), Err(Error::NotTlsConnection)));
    }

    #[tokio::test]
    async fn test_write_after_peer_eof_eventually_pauses() {
        let (a, b) = pair();
        b.close().await.unwrap();

        // Give the read loop time to observe EOF and pause.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(a.state(), State::Paused);

        let p = ping_packet(1, b"late");
        assert!(matches!(
            a.write_packet(&p).await,
            Err(Error::ConnectionPaused)
        ));
        packet::put(p);
    }
}
