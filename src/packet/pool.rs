//! Process-wide packet pool.
//!
//! A bounded shelf of reset packets behind a mutex. [`get`] pops a packet
//! (or allocates a fresh one when the shelf is empty) and [`put`] resets and
//! shelves it, dropping the packet outright when the shelf is full so the
//! pool cannot grow without bound.

use std::sync::{LazyLock, Mutex};

use super::Packet;

/// Maximum number of packets the shelf retains.
const POOL_CAPACITY: usize = 1024;

static POOL: LazyLock<Mutex<Vec<Packet>>> =
    LazyLock::new(|| Mutex::new(Vec::with_capacity(POOL_CAPACITY)));

/// Take a packet from the pool, or allocate one if the pool is empty.
///
/// The returned packet has zeroed metadata and an empty (possibly
/// pre-sized) content buffer.
pub fn get() -> Packet {
    POOL.lock()
        .expect("packet pool poisoned")
        .pop()
        .unwrap_or_default()
}

/// Return a packet to the pool.
///
/// The packet is reset before shelving; callers must not hold on to any
/// view of its content. If the shelf is full the packet is dropped.
pub fn put(mut packet: Packet) {
    packet.reset();
    let mut shelf = POOL.lock().expect("packet pool poisoned");
    if shelf.len() < POOL_CAPACITY {
        shelf.push(packet);
    }
}
