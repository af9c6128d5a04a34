//! # discus
//!
//! A bring-your-own-protocol messaging framework: a duplex, packet-oriented
//! transport layered on a reliable byte stream (TCP, optionally TLS) that
//! multiplexes short fixed-header packets between peers and dispatches
//! inbound packets to user-supplied handlers.
//!
//! discus is a building block for higher-level RPC systems, not an RPC
//! layer itself: the 16-bit packet id is opaque to the transport, payloads
//! are raw bytes, and what an "operation" means is entirely up to the
//! handlers you register.
//!
//! ## Architecture
//!
//! - **[`AsyncConn`]**: the connection engine. One byte stream, a read loop
//!   feeding a bounded ring buffer, and a flush loop coalescing buffered
//!   writes. Pausable on EOF so a reconnect layer can resurrect it.
//! - **[`Server`]**: accepts connections and runs one handler-dispatch loop
//!   per connection, with lifecycle hooks and graceful shutdown.
//! - **[`Client`]**: the outbound counterpart, with automatic reconnect.
//!
//! ## Example
//!
//! ```ignore
//! use discus::{Action, Client, HandlerTable, Server};
//! use discus::protocol::PING;
//!
//! #[tokio::main]
//! async fn main() -> discus::Result<()> {
//!     let mut table = HandlerTable::new();
//!     table.insert(PING, |_ctx, packet| async move {
//!         // Echo the packet straight back.
//!         (Some(packet), Action::None)
//!     });
//!
//!     let server = Server::new(table);
//!     let addr = server.start("127.0.0.1:0").await?;
//!
//!     let client = Client::new(HandlerTable::new());
//!     client.connect(&addr.to_string()).await?;
//!
//!     let mut packet = discus::packet::get();
//!     packet.metadata.operation = PING;
//!     packet.set_content(b"hello");
//!     client.write_packet(&packet).await?;
//!     client.flush().await?;
//!
//!     client.close().await?;
//!     server.shutdown().await
//! }
//! ```

pub mod client;
pub mod conn;
pub mod error;
pub mod handler;
pub mod packet;
pub mod protocol;
pub mod ringbuffer;
pub mod server;
pub mod transport;

pub use client::{Client, ClientOptions, ReconnectPolicy};
pub use conn::{AsyncConn, State};
pub use error::{Error, Result};
pub use handler::{Action, Context, HandlerTable};
pub use packet::Packet;
pub use server::{Server, ServerBuilder};
