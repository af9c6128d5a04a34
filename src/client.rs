//! Client: the outbound counterpart.
//!
//! A [`Client`] owns one [`AsyncConn`] plus a dispatch loop for
//! server-originated packets (same handler contract as the server's loop,
//! minus the server-only hooks). Its extra responsibility is reconnecting:
//! when the connection pauses after an EOF, the client re-dials the
//! remembered remote under a [`ReconnectPolicy`] and hot-swaps a fresh
//! connection behind the same handler table. Callers never observe the
//! pause; once attempts are exhausted every operation reports
//! [`Error::ConnectionClosed`].

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::Mutex as AsyncMutex;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::ClientConfig as RustlsClientConfig;

use crate::conn::{AsyncConn, State};
use crate::error::{Error, Result};
use crate::handler::{Action, Context, HandlerTable};
use crate::packet::{self, Packet};
use crate::transport::{self, BoxedStream, DEFAULT_KEEP_ALIVE};

/// How the client retries a paused connection.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Dial attempts before giving up. Zero disables reconnecting.
    pub max_attempts: u32,
    /// Delay before each attempt.
    pub backoff: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff: Duration::from_millis(100),
        }
    }
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// TCP keep-alive for dialed connections.
    pub keep_alive: Duration,
    /// Reconnect behavior on pause.
    pub reconnect: ReconnectPolicy,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            keep_alive: DEFAULT_KEEP_ALIVE,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

/// Where to re-dial when resurrecting a paused connection.
#[derive(Clone)]
enum Target {
    Tcp {
        addr: String,
    },
    Tls {
        addr: String,
        server_name: ServerName<'static>,
        config: Arc<RustlsClientConfig>,
    },
}

impl Target {
    async fn dial(&self, keep_alive: Duration) -> Result<BoxedStream> {
        match self {
            Target::Tcp { addr } => transport::connect(addr, keep_alive).await,
            Target::Tls {
                addr,
                server_name,
                config,
            } => {
                transport::connect_tls(addr, server_name.clone(), config.clone(), keep_alive).await
            }
        }
    }
}

struct ClientShared {
    table: Arc<HandlerTable>,
    options: ClientOptions,
    conn: StdMutex<Option<Arc<AsyncConn>>>,
    target: StdMutex<Option<Target>>,
    /// Serializes reconnect attempts between the dispatch loop and writers.
    reconnect_gate: AsyncMutex<()>,
}

/// A packet client over TCP, TLS, or a caller-provided stream.
pub struct Client {
    shared: Arc<ClientShared>,
}

impl Client {
    /// Create a client with default options.
    pub fn new(table: HandlerTable) -> Self {
        Self::with_options(table, ClientOptions::default())
    }

    /// Create a client with explicit options.
    pub fn with_options(table: HandlerTable, options: ClientOptions) -> Self {
        Self {
            shared: Arc::new(ClientShared {
                table: Arc::new(table),
                options,
                conn: StdMutex::new(None),
                target: StdMutex::new(None),
                reconnect_gate: AsyncMutex::new(()),
            }),
        }
    }

    /// Dial a plain TCP connection and start dispatching. The address is
    /// remembered as the reconnect target.
    pub async fn connect(&self, addr: &str) -> Result<()> {
        let stream = transport::connect(addr, self.shared.options.keep_alive).await?;
        *self.shared.target.lock().expect("target poisoned") = Some(Target::Tcp {
            addr: addr.to_string(),
        });
        self.shared.attach(stream);
        Ok(())
    }

    /// Dial a TLS connection and start dispatching.
    pub async fn connect_tls(
        &self,
        addr: &str,
        server_name: ServerName<'static>,
        config: Arc<RustlsClientConfig>,
    ) -> Result<()> {
        let stream = transport::connect_tls(
            addr,
            server_name.clone(),
            config.clone(),
            self.shared.options.keep_alive,
        )
        .await?;
        *self.shared.target.lock().expect("target poisoned") = Some(Target::Tls {
            addr: addr.to_string(),
            server_name,
            config,
        });
        self.shared.attach(stream);
        Ok(())
    }

    /// Attach a caller-provided, already-connected stream. Such a
    /// connection has no redial target: a pause becomes terminal.
    pub fn from_stream(&self, stream: BoxedStream) -> Result<()> {
        *self.shared.target.lock().expect("target poisoned") = None;
        self.shared.attach(stream);
        Ok(())
    }

    /// Write a packet, transparently reconnecting if the connection paused
    /// underneath the call.
    ///
    /// # Errors
    ///
    /// [`Error::ConnectionNotInitialized`] before any connect/attach;
    /// [`Error::ConnectionClosed`] once reconnect attempts are exhausted.
    pub async fn write_packet(&self, packet: &Packet) -> Result<()> {
        let conn = self.current()?;
        match conn.write_packet(packet).await {
            Err(Error::ConnectionPaused) => {
                let fresh = self.shared.reconnect(&conn).await?;
                fresh.write_packet(packet).await.map_err(|e| match e {
                    Error::ConnectionPaused => Error::ConnectionClosed,
                    other => other,
                })
            }
            other => other,
        }
    }

    /// Flush the current connection's buffered outbound bytes.
    pub async fn flush(&self) -> Result<()> {
        self.current()?.flush().await
    }

    /// Release the current connection's underlying stream to the caller.
    pub async fn raw(&self) -> Result<BoxedStream> {
        self.current()?.raw().await
    }

    /// Close the current connection. A closed client can connect again.
    pub async fn close(&self) -> Result<()> {
        let conn = self.shared.conn.lock().expect("connection slot poisoned").clone();
        match conn {
            Some(conn) => conn.close().await,
            None => Ok(()),
        }
    }

    /// The current connection, if any. Mostly useful for observing state
    /// in tests and hooks.
    pub fn connection(&self) -> Option<Arc<AsyncConn>> {
        self.shared.conn.lock().expect("connection slot poisoned").clone()
    }

    fn current(&self) -> Result<Arc<AsyncConn>> {
        self.shared
            .conn
            .lock()
            .expect("connection slot poisoned")
            .clone()
            .ok_or(Error::ConnectionNotInitialized)
    }
}

impl ClientShared {
    fn attach(self: &Arc<Self>, stream: BoxedStream) -> Arc<AsyncConn> {
        let conn = Arc::new(AsyncConn::new(stream));
        let previous = self
            .conn
            .lock()
            .expect("connection slot poisoned")
            .replace(conn.clone());
        if let Some(previous) = previous {
            tokio::spawn(async move {
                let _ = previous.close().await;
            });
        }

        let shared = self.clone();
        let dispatch_conn = conn.clone();
        tokio::spawn(async move {
            dispatch(shared, dispatch_conn).await;
        });
        conn
    }

    /// Resurrect a paused connection by re-dialing the remembered target.
    ///
    /// Serialized on a gate so the dispatch loop and concurrent writers
    /// cannot race each other into parallel dials; a loser of the race that
    /// finds a live connection already swapped in just uses it.
    async fn reconnect(self: &Arc<Self>, observed: &Arc<AsyncConn>) -> Result<Arc<AsyncConn>> {
        let _gate = self.reconnect_gate.lock().await;

        if let Some(current) = self.conn.lock().expect("connection slot poisoned").clone() {
            if !Arc::ptr_eq(&current, observed) && current.state() == State::Connected {
                return Ok(current);
            }
        }

        let target = self.target.lock().expect("target poisoned").clone();
        let Some(target) = target else {
            let _ = observed.close().await;
            return Err(Error::ConnectionClosed);
        };

        let policy = &self.options.reconnect;
        for attempt in 0..policy.max_attempts {
            tokio::time::sleep(policy.backoff).await;
            match target.dial(self.options.keep_alive).await {
                Ok(stream) => {
                    let _ = observed.close().await;
                    tracing::debug!(attempt, "reconnected");
                    return Ok(self.attach(stream));
                }
                Err(e) => {
                    tracing::debug!(error = %e, attempt, "reconnect attempt failed");
                }
            }
        }

        // Exhausted: retire the paused connection so every caller observes
        // a terminal close rather than a pause.
        let _ = observed.close().await;
        Err(Error::ConnectionClosed)
    }
}

async fn dispatch(shared: Arc<ClientShared>, conn: Arc<AsyncConn>) {
    let ctx = Context::new(conn.clone(), None);

    loop {
        let inbound = match conn.read_packet().await {
            Ok(packet) => packet,
            Err(Error::ConnectionPaused) => {
                // A successful reconnect spawns a fresh dispatch loop for
                // the replacement connection; either way this one is done.
                let _ = shared.reconnect(&conn).await;
                return;
            }
            Err(_) => return,
        };

        let Some(handler) = shared.table.get(inbound.metadata.operation) else {
            packet::put(inbound);
            continue;
        };
        let handler = handler.clone();

        let (outgoing, action) = handler(ctx.clone(), inbound).await;

        if let Some(outgoing) = outgoing {
            let write = conn.write_packet(&outgoing).await;
            packet::put(outgoing);
            if write.is_err() {
                return;
            }
        }

        match action {
            Action::None => {}
            // A client has no server to take down: both directives end
            // this connection.
            Action::Close | Action::Shutdown => {
                let _ = conn.close().await;
                return;
            }
        }
    }
}
