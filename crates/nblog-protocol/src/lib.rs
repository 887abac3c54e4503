//! nblog Protocol - Jupyter kernel client for passive monitoring
//!
//! This crate provides what the daemon needs to listen to a running
//! kernel: connection-file parsing, wire-frame decoding with signature
//! checks, and the channel traits with a ZeroMQ and an in-memory
//! implementation.

pub mod client;
pub mod connection;
pub mod memory;
pub mod wire;
pub mod zmq;

pub use client::{
    ChannelError, ClientError, KernelBundle, KernelChannel, KernelChannels, KernelConnector,
};
pub use connection::{ConnectionError, ConnectionInfo};
pub use memory::{MemoryChannel, MemoryConnector};
pub use wire::{decode_frames, MessageSigner, WireError, DELIMITER};
pub use zmq::ZmqConnector;
