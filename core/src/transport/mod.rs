//! Transport adapters.
//!
//! The connection state machine consumes a small capability set — read one
//! message, read a fixed-size binary blob, write with a text/binary tag,
//! shut down — and two adapters provide it: [`byte`] for newline-framed byte
//! streams (plain TCP) and [`frame`] for message-framed streams (WebSocket).
//! The read and write sides are split so the state machine and the write
//! serializer can run as separate tasks.

pub mod byte;
pub mod frame;

use std::io;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

/// Whether a payload is text or binary. Byte streams ignore the distinction;
/// frame streams tag their frames with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    Text,
    Binary,
}

#[derive(Error, Debug)]
pub enum TransportError {
    /// The peer closed the connection (or it was shut down locally).
    #[error("connection closed")]
    Closed,

    /// An incoming message exceeded the configured per-message size limit.
    #[error("message exceeds the configured size limit")]
    MessageTooLong,

    #[error("transport I/O failure")]
    Io(#[from] io::Error),
}

/// The read half of a connection's transport.
#[async_trait(?Send)]
pub trait MessageReader {
    /// Reads one logical message: a line on byte streams (terminator
    /// stripped), a single frame on frame streams.
    async fn read_message(&mut self) -> Result<String, TransportError>;

    /// Reads exactly `buf.len()` bytes of binary payload into `buf`.
    async fn read_binary(&mut self, buf: &mut [u8]) -> Result<(), TransportError>;

    /// Limits the size of subsequently read messages. 0 lifts the limit.
    fn set_max_message_size(&mut self, limit: usize);
}

/// The write half of a connection's transport.
#[async_trait(?Send)]
pub trait MessageWriter {
    async fn write(&mut self, data: Bytes, mode: WriteMode) -> Result<(), TransportError>;

    /// Flushes pending data as far as the transport allows and closes the
    /// write side.
    async fn shutdown(&mut self);

    /// Reserved: signal the transport to block the remote endpoint.
    fn block_endpoint(&mut self) {}
}
