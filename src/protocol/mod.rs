//! Wire protocol: fixed-size packet headers and reserved operations.

mod wire;

pub use wire::{
    Metadata, HEADER_SIZE, MAX_CONTENT_LENGTH, PING, PONG, PROBE, RESERVED,
};
