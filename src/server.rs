//! Server: acceptor, per-connection dispatch, graceful shutdown.
//!
//! A [`Server`] owns a listener plus a registry of live connections. Every
//! accepted stream gets its own [`AsyncConn`] and one dispatch task that
//! pulls inbound packets and routes them through the handler table. Handler
//! execution is sequential per connection; separate connections run in
//! parallel.
//!
//! Shutdown closes the acceptor and every registered connection, then waits
//! for all dispatch tasks to drain. Task completion is tracked with the
//! sender-drop idiom: each task holds a clone of a channel sender, and
//! shutdown drops the original and waits for the receiver to report all
//! clones gone.

use std::any::Any;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;

use crate::conn::AsyncConn;
use crate::error::{Error, Result};
use crate::handler::{Action, Context, HandlerTable};
use crate::packet;
use crate::transport::BoxedStream;

type OnOpened = Arc<dyn Fn(&Arc<AsyncConn>) -> Action + Send + Sync>;
type OnClosed = Arc<dyn Fn(&Arc<AsyncConn>, Option<&Error>) + Send + Sync>;
type PreWrite = Arc<dyn Fn() + Send + Sync>;
type ConnContext = Arc<dyn Fn(&Arc<AsyncConn>) -> Option<Arc<dyn Any + Send + Sync>> + Send + Sync>;

/// Fluent configuration for a [`Server`].
pub struct ServerBuilder {
    table: HandlerTable,
    on_opened: Option<OnOpened>,
    on_closed: Option<OnClosed>,
    pre_write: Option<PreWrite>,
    conn_context: Option<ConnContext>,
    tls: Option<Arc<ServerConfig>>,
}

impl ServerBuilder {
    /// Start building a server around a handler table.
    pub fn new(table: HandlerTable) -> Self {
        Self {
            table,
            on_opened: None,
            on_closed: None,
            pre_write: None,
            conn_context: None,
            tls: None,
        }
    }

    /// Hook invoked once per connection before dispatch begins. Returning
    /// [`Action::Close`] closes the connection immediately; returning
    /// [`Action::Shutdown`] begins server shutdown.
    pub fn on_opened<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Arc<AsyncConn>) -> Action + Send + Sync + 'static,
    {
        self.on_opened = Some(Arc::new(hook));
        self
    }

    /// Hook invoked once per connection after its dispatch loop exits, with
    /// the error that ended it (absent for handler-directed closes).
    pub fn on_closed<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Arc<AsyncConn>, Option<&Error>) + Send + Sync + 'static,
    {
        self.on_closed = Some(Arc::new(hook));
        self
    }

    /// Hook invoked immediately before each handler-produced response is
    /// written.
    pub fn pre_write<F>(mut self, hook: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.pre_write = Some(Arc::new(hook));
        self
    }

    /// Hook producing the per-connection user value surfaced through
    /// [`Context::user`].
    pub fn conn_context<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Arc<AsyncConn>) -> Option<Arc<dyn Any + Send + Sync>> + Send + Sync + 'static,
    {
        self.conn_context = Some(Arc::new(hook));
        self
    }

    /// Terminate TLS on accepted connections with this configuration.
    pub fn tls(mut self, config: Arc<ServerConfig>) -> Self {
        self.tls = Some(config);
        self
    }

    /// Build the server.
    pub fn build(self) -> Server {
        let (shutdown_tx, _) = watch::channel(false);
        let (task_done_tx, task_done_rx) = mpsc::channel(1);
        Server {
            shared: Arc::new(ServerShared {
                table: Arc::new(self.table),
                on_opened: self.on_opened,
                on_closed: self.on_closed,
                pre_write: self.pre_write,
                conn_context: self.conn_context,
                tls: self.tls.map(TlsAcceptor::from),
                connections: StdMutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
                shutdown_tx,
                task_done_tx: StdMutex::new(Some(task_done_tx)),
                task_done_rx: StdMutex::new(Some(task_done_rx)),
                shutdown_gate: AsyncMutex::new(false),
            }),
        }
    }
}

/// A packet server over TCP (optionally TLS) or caller-provided streams.
pub struct Server {
    shared: Arc<ServerShared>,
}

struct ServerShared {
    table: Arc<HandlerTable>,
    on_opened: Option<OnOpened>,
    on_closed: Option<OnClosed>,
    pre_write: Option<PreWrite>,
    conn_context: Option<ConnContext>,
    tls: Option<TlsAcceptor>,
    connections: StdMutex<HashMap<u64, Arc<AsyncConn>>>,
    next_id: AtomicU64,
    shutdown_tx: watch::Sender<bool>,
    task_done_tx: StdMutex<Option<mpsc::Sender<()>>>,
    task_done_rx: StdMutex<Option<mpsc::Receiver<()>>>,
    /// Serializes shutdown; holds `true` once teardown has completed so
    /// late callers return immediately.
    shutdown_gate: AsyncMutex<bool>,
}

impl Server {
    /// Shorthand for [`ServerBuilder::new`]`(table).build()`.
    pub fn new(table: HandlerTable) -> Self {
        ServerBuilder::new(table).build()
    }

    /// Start building a server.
    pub fn builder(table: HandlerTable) -> ServerBuilder {
        ServerBuilder::new(table)
    }

    /// Bind a listener and start accepting. Returns the bound address
    /// (useful with a `:0` port); accepting itself runs in a background
    /// task.
    ///
    /// # Errors
    ///
    /// I/O errors from bind, or [`Error::ConnectionClosed`] if the server
    /// has already been shut down.
    pub async fn start(&self, addr: &str) -> Result<SocketAddr> {
        let Some(guard) = self.shared.task_guard() else {
            return Err(Error::ConnectionClosed);
        };
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;

        let shared = self.shared.clone();
        let shutdown_rx = shared.shutdown_tx.subscribe();
        tokio::spawn(accept_loop(shared, listener, shutdown_rx, guard));

        Ok(local_addr)
    }

    /// Serve a caller-provided, already-connected stream. Registers the
    /// connection and spawns its dispatch task; the returned handle can be
    /// used to observe connection state.
    pub fn serve_stream(&self, stream: BoxedStream) -> Arc<AsyncConn> {
        self.shared.serve_stream(stream)
    }

    /// Gracefully shut down: stop accepting, close every live connection,
    /// wait for all dispatch tasks to finish. Safe to call from multiple
    /// tasks; every caller returns once teardown has completed.
    pub async fn shutdown(&self) -> Result<()> {
        self.shared.shutdown().await
    }

    /// Number of currently registered connections.
    pub fn connection_count(&self) -> usize {
        self.shared
            .connections
            .lock()
            .expect("connection registry poisoned")
            .len()
    }
}

impl ServerShared {
    fn task_guard(&self) -> Option<mpsc::Sender<()>> {
        self.task_done_tx
            .lock()
            .expect("task tracker poisoned")
            .clone()
    }

    fn serve_stream(self: &Arc<Self>, stream: BoxedStream) -> Arc<AsyncConn> {
        let conn = Arc::new(AsyncConn::new(stream));
        match self.task_guard() {
            Some(guard) => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                self.connections
                    .lock()
                    .expect("connection registry poisoned")
                    .insert(id, conn.clone());
                let shared = self.clone();
                let dispatch_conn = conn.clone();
                tokio::spawn(async move {
                    shared.dispatch(id, dispatch_conn, guard).await;
                });
            }
            None => {
                // Raced with shutdown: refuse the connection.
                let late = conn.clone();
                tokio::spawn(async move {
                    let _ = late.close().await;
                });
            }
        }
        conn
    }

    async fn dispatch(self: Arc<Self>, id: u64, conn: Arc<AsyncConn>, guard: mpsc::Sender<()>) {
        if let Some(hook) = &self.on_opened {
            match hook(&conn) {
                Action::None => {}
                Action::Close => {
                    let _ = conn.close().await;
                    self.finish_conn(id, &conn, None);
                    drop(guard);
                    return;
                }
                Action::Shutdown => {
                    let _ = conn.close().await;
                    self.finish_conn(id, &conn, None);
                    self.spawn_shutdown();
                    drop(guard);
                    return;
                }
            }
        }

        let user = self.conn_context.as_ref().and_then(|hook| hook(&conn));
        let ctx = Context::new(conn.clone(), user);

        let exit_err: Option<Error> = loop {
            let inbound = match conn.read_packet().await {
                Ok(packet) => packet,
                Err(e) => break Some(e),
            };

            let Some(handler) = self.table.get(inbound.metadata.operation) else {
                packet::put(inbound);
                continue;
            };
            let handler = handler.clone();

            let (outgoing, action) = handler(ctx.clone(), inbound).await;

            if let Some(outgoing) = outgoing {
                if let Some(hook) = &self.pre_write {
                    hook();
                }
                let write = conn.write_packet(&outgoing).await;
                packet::put(outgoing);
                if let Err(e) = write {
                    break Some(e);
                }
            }

            match action {
                Action::None => {}
                Action::Close => {
                    let _ = conn.close().await;
                    break None;
                }
                Action::Shutdown => {
                    let _ = conn.close().await;
                    self.spawn_shutdown();
                    break None;
                }
            }
        };

        let _ = conn.close().await;
        self.finish_conn(id, &conn, exit_err);
        drop(guard);
    }

    fn finish_conn(&self, id: u64, conn: &Arc<AsyncConn>, err: Option<Error>) {
        self.connections
            .lock()
            .expect("connection registry poisoned")
            .remove(&id);
        if let Some(hook) = &self.on_closed {
            hook(conn, err.as_ref());
        }
    }

    /// Kick off shutdown from inside a dispatch task. Must run detached:
    /// shutdown waits for all dispatch tasks, including the caller's.
    fn spawn_shutdown(self: &Arc<Self>) {
        let shared = self.clone();
        tokio::spawn(async move {
            let _ = shared.shutdown().await;
        });
    }

    async fn shutdown(self: &Arc<Self>) -> Result<()> {
        let mut finished = self.shutdown_gate.lock().await;
        if *finished {
            return Ok(());
        }

        let _ = self.shutdown_tx.send(true);

        // Stop tracking new tasks, then close every live connection so
        // their dispatch loops unblock and exit.
        let original_guard = self
            .task_done_tx
            .lock()
            .expect("task tracker poisoned")
            .take();
        let live: Vec<Arc<AsyncConn>> = self
            .connections
            .lock()
            .expect("connection registry poisoned")
            .values()
            .cloned()
            .collect();
        for conn in live {
            let _ = conn.close().await;
        }
        drop(original_guard);

        let receiver = self
            .task_done_rx
            .lock()
            .expect("task tracker poisoned")
            .take();
        if let Some(mut receiver) = receiver {
            while receiver.recv().await.is_some() {}
        }

        *finished = true;
        tracing::debug!("server shutdown complete");
        Ok(())
    }
}

async fn accept_loop(
    shared: Arc<ServerShared>,
    listener: TcpListener,
    mut shutdown: watch::Receiver<bool>,
    guard: mpsc::Sender<()>,
) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => {
                tracing::debug!(%peer, "accepted connection");
                match shared.tls.clone() {
                    None => {
                        shared.serve_stream(Box::new(stream));
                    }
                    Some(acceptor) => {
                        // Handshakes run off the accept path so a slow or
                        // hostile client cannot stall other connections.
                        let shared = shared.clone();
                        tokio::spawn(async move {
                            match acceptor.accept(stream).await {
                                Ok(tls) => {
                                    shared.serve_stream(Box::new(tls));
                                }
                                Err(e) => {
                                    tracing::warn!(error = %e, "TLS handshake failed");
                                }
                            }
                        });
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
    drop(guard);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PING;
    use tokio::io::duplex;

    fn echo_table() -> HandlerTable {
        let mut table = HandlerTable::new();
        table.insert(PING, |_ctx, packet| async move {
            (Some(packet), Action::None)
        });
        table
    }

    #[tokio::test]
    async fn test_serve_stream_echo() {
        let server = Server::new(echo_table());
        let (client_side, server_side) = duplex(1 << 16);
        server.serve_stream(Box::new(server_side));

        let client = AsyncConn::new(Box::new(client_side));
        let mut p = packet::get();
        p.metadata.id = 11;
        p.metadata.operation = PING;
        p.set_content(b"echo me");
        client.write_packet(&p).await.unwrap();
        client.flush().await.unwrap();

        let received = client.read_packet().await.unwrap();
        assert_eq!(received.metadata.id, 11);
        assert_eq!(&received.content[..], b"echo me");

        packet::put(p);
        packet::put(received);
        client.close().await.unwrap();
        server.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_operation_dropped() {
        let server = Server::new(echo_table());
        let (client_side, server_side) = duplex(1 << 16);
        server.serve_stream(Box::new(server_side));

        let client = AsyncConn::new(Box::new(client_side));
        let mut p = packet::get();
        p.metadata.operation = 5; // no handler registered
        p.set_content(b"dropped");
        client.write_packet(&p).await.unwrap();

        p.metadata.id = 77;
        p.metadata.operation = PING;
        client.write_packet(&p).await.unwrap();
        client.flush().await.unwrap();

        // Only the handled packet comes back.
        let received = client.read_packet().await.unwrap();
        assert_eq!(received.metadata.id, 77);

        packet::put(p);
        packet::put(received);
        client.close().await.unwrap();
        server.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_on_opened_close_refuses_connection() {
        let server = Server::builder(echo_table())
            .on_opened(|_conn| Action::Close)
            .build();
        let (client_side, server_side) = duplex(1 << 16);
        server.serve_stream(Box::new(server_side));

        let client = AsyncConn::new(Box::new(client_side));
        // The server closes immediately; the client observes stream end.
        assert!(client.read_packet().await.is_err());

        server.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_closes_live_connections() {
        let server = Server::new(echo_table());
        let (client_side, server_side) = duplex(1 << 16);
        let server_conn = server.serve_stream(Box::new(server_side));
        let _client = AsyncConn::new(Box::new(client_side));

        assert_eq!(server.connection_count(), 1);
        server.shutdown().await.unwrap();

        assert_eq!(server_conn.state(), crate::conn::State::Closed);
        assert_eq!(server.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_start_after_shutdown_fails() {
        let server = Server::new(echo_table());
        server.shutdown().await.unwrap();
        assert!(server.start("127.0.0.1:0").await.is_err());
    }

    #[tokio::test]
    async fn test_start_over_tcp() {
        let server = Server::new(echo_table());
        let addr = server.start("127.0.0.1:0").await.unwrap();

        let client = AsyncConn::connect(&addr.to_string(), Duration::ZERO)
            .await
            .unwrap();
        let mut p = packet::get();
        p.metadata.id = 3;
        p.metadata.operation = PING;
        p.set_content(b"over tcp");
        client.write_packet(&p).await.unwrap();
        client.flush().await.unwrap();

        let received = client.read_packet().await.unwrap();
        assert_eq!(received.metadata.id, 3);
        assert_eq!(&received.content[..], b"over tcp");

        packet::put(p);
        packet::put(received);
        client.close().await.unwrap();
        server.shutdown().await.unwrap();
    }
}
