// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Transport abstraction.
//!
//! The engine is transport independent: serial ports, TCP sockets and UDP
//! sockets all plug in behind the [`IoDevice`] trait. Implementations are
//! event driven; the engine reacts to [`IoEvent`]s and never blocks on I/O.

mod reconnect;

pub use self::reconnect::{ConnectionState, LinkEvent, ReconnectableIoDevice, INFINITE_RETRIES};

use async_trait::async_trait;
use bytes::Bytes;

/// An event emitted by a transport back-end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IoEvent {
    /// The device has been opened.
    Opened,
    /// The device has been closed.
    Closed,
    /// The device failed; the message is surfaced to the application.
    Error(String),
    /// Part of a pending write has been flushed to the wire.
    BytesWritten(usize),
    /// Received bytes are ready to be collected with [`IoDevice::read_all`].
    ReadyRead,
}

/// An abstract byte-stream device.
///
/// All operations are non-blocking requests; their outcome is reported
/// asynchronously through [`IoDevice::next_event`]. Implementations should
/// back `next_event` with a channel so it is cancellation safe (the engine
/// polls it inside a `select!` loop).
#[async_trait]
pub trait IoDevice: Send {
    /// Request the device to open. Emits `Opened` or `Error` + `Closed`.
    fn open(&mut self);

    /// Request the device to close. Emits `Closed`.
    fn close(&mut self);

    /// Queue bytes for transmission. Progress is reported via `BytesWritten`.
    fn write(&mut self, data: &[u8]);

    /// Collect everything received so far.
    fn read_all(&mut self) -> Bytes;

    /// Drop the receive buffer.
    fn clear(&mut self);

    /// A human-readable name of the device, used in log output.
    fn name(&self) -> &str;

    /// Await the next event. `None` means the device is gone for good.
    async fn next_event(&mut self) -> Option<IoEvent>;
}
