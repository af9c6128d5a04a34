//! Stream abstraction and dialing.
//!
//! The connection engine is written against [`ConnStream`], a byte stream
//! with a small capability set: read, write, shutdown, and optional
//! introspection (socket addresses, TLS session state). Plain TCP, rustls
//! TLS streams, and in-memory duplex pairs all satisfy it, so servers,
//! clients, and tests share one engine.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
use tokio::net::{lookup_host, TcpSocket, TcpStream};
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName};
use tokio_rustls::rustls::{ClientConfig, ProtocolVersion};
use tokio_rustls::TlsConnector;

use crate::error::{Error, Result};

/// Default TCP keep-alive for dialed connections (3 minutes).
pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(180);

/// Snapshot of a TLS session, captured when a connection is constructed.
#[derive(Debug, Clone)]
pub struct TlsState {
    /// Negotiated protocol version.
    pub protocol_version: Option<ProtocolVersion>,
    /// Negotiated ALPN protocol, if any.
    pub alpn_protocol: Option<Vec<u8>>,
    /// The peer's certificate chain (DER), leaf first.
    pub peer_certificates: Vec<CertificateDer<'static>>,
}

/// A byte stream a connection can be built on.
///
/// The probe methods default to "capability absent": a stream that cannot
/// answer simply inherits the `None` implementations. TLS-specific queries
/// on the connection surface this as [`Error::NotTlsConnection`].
pub trait ConnStream: AsyncRead + AsyncWrite + Send + Unpin {
    /// Local socket address, when the stream has one.
    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }

    /// Remote socket address, when the stream has one.
    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }

    /// TLS session state, when the stream is a TLS stream.
    fn tls_state(&self) -> Option<TlsState> {
        None
    }
}

/// An owned, type-erased [`ConnStream`].
pub type BoxedStream = Box<dyn ConnStream>;

impl ConnStream for TcpStream {
    fn local_addr(&self) -> Option<SocketAddr> {
        TcpStream::local_addr(self).ok()
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        TcpStream::peer_addr(self).ok()
    }
}

impl ConnStream for DuplexStream {}

fn snapshot_tls(common: &tokio_rustls::rustls::CommonState) -> TlsState {
    TlsState {
        protocol_version: common.protocol_version(),
        alpn_protocol: common.alpn_protocol().map(|p| p.to_vec()),
        peer_certificates: common
            .peer_certificates()
            .map(|certs| certs.to_vec())
            .unwrap_or_default(),
    }
}

impl ConnStream for tokio_rustls::client::TlsStream<TcpStream> {
    fn local_addr(&self) -> Option<SocketAddr> {
        self.get_ref().0.local_addr().ok()
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.get_ref().0.peer_addr().ok()
    }

    fn tls_state(&self) -> Option<TlsState> {
        Some(snapshot_tls(self.get_ref().1))
    }
}

impl ConnStream for tokio_rustls::server::TlsStream<TcpStream> {
    fn local_addr(&self) -> Option<SocketAddr> {
        self.get_ref().0.local_addr().ok()
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.get_ref().0.peer_addr().ok()
    }

    fn tls_state(&self) -> Option<TlsState> {
        Some(snapshot_tls(self.get_ref().1))
    }
}

async fn dial_tcp(addr: &str, keep_alive: Duration) -> Result<TcpStream> {
    let addr = lookup_host(addr)
        .await?
        .next()
        .ok_or_else(|| Error::from(std::io::Error::other("address resolved to nothing")))?;

    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    // The keep-alive probe interval itself is left to the OS; the duration
    // only decides whether probing is on at all.
    if !keep_alive.is_zero() {
        socket.set_keepalive(true)?;
    }

    Ok(socket.connect(addr).await?)
}

/// Dial a plain TCP connection.
pub async fn connect(addr: &str, keep_alive: Duration) -> Result<BoxedStream> {
    Ok(Box::new(dial_tcp(addr, keep_alive).await?))
}

/// Dial a TCP connection and run a rustls client handshake over it.
pub async fn connect_tls(
    addr: &str,
    server_name: ServerName<'static>,
    config: Arc<ClientConfig>,
    keep_alive: Duration,
) -> Result<BoxedStream> {
    let tcp = dial_tcp(addr, keep_alive).await?;
    let connector = TlsConnector::from(config);
    let stream = connector.connect(server_name, tcp).await?;
    Ok(Box::new(stream))
}
