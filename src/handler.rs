//! Handler registration and dispatch context.
//!
//! A handler is user code invoked once per inbound packet. It receives a
//! [`Context`] and the packet by value, and returns an optional outbound
//! packet plus an [`Action`] directing the connection's lifecycle. Returning
//! the inbound packet as the outbound one is a plain move, so echo-style
//! handlers cost nothing extra.
//!
//! The table is fixed before a connection starts serving; dispatch loops
//! read it without locking.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::conn::AsyncConn;
use crate::packet::Packet;

/// Lifecycle directive returned by a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Action {
    /// Keep dispatching.
    #[default]
    None,
    /// Close this connection after sending the outbound packet, if any.
    Close,
    /// Close the whole server and every live connection.
    Shutdown,
}

/// Per-connection context handed to every handler invocation.
///
/// Carries the connection itself (so a handler can, for example, capture the
/// raw stream) and an optional user value installed by the server's
/// `conn_context` hook.
#[derive(Clone)]
pub struct Context {
    conn: Arc<AsyncConn>,
    user: Option<Arc<dyn Any + Send + Sync>>,
}

impl Context {
    pub(crate) fn new(conn: Arc<AsyncConn>, user: Option<Arc<dyn Any + Send + Sync>>) -> Self {
        Self { conn, user }
    }

    /// The connection this packet arrived on.
    pub fn connection(&self) -> &Arc<AsyncConn> {
        &self.conn
    }

    /// Typed access to the value installed by the `conn_context` hook.
    pub fn user<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.user.clone()?.downcast().ok()
    }
}

/// Boxed future returned by a handler.
pub type HandlerFuture = Pin<Box<dyn Future<Output = (Option<Packet>, Action)> + Send>>;

/// A type-erased handler.
pub type Handler = Arc<dyn Fn(Context, Packet) -> HandlerFuture + Send + Sync>;

/// Mapping from operation to handler.
///
/// Operations without an entry are dropped by the dispatch loop (the packet
/// goes back to the pool). Reserved operations may carry handlers like any
/// other; the framework routes them identically.
#[derive(Default)]
pub struct HandlerTable {
    handlers: HashMap<u16, Handler>,
}

impl HandlerTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for an operation, replacing any previous one.
    pub fn insert<F, Fut>(&mut self, operation: u16, handler: F)
    where
        F: Fn(Context, Packet) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = (Option<Packet>, Action)> + Send + 'static,
    {
        self.handlers.insert(
            operation,
            Arc::new(move |ctx, packet| Box::pin(handler(ctx, packet))),
        );
    }

    /// Look up the handler for an operation.
    pub fn get(&self, operation: u16) -> Option<&Handler> {
        self.handlers.get(&operation)
    }

    /// Number of registered operations.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether no handlers are registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
