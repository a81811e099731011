// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::{collections::VecDeque, time::Duration};

use bytes::Bytes;
use tokio::time::Instant;

use super::{IoDevice, IoEvent};

/// Pass to [`ReconnectableIoDevice::set_open_retry`] for endless reconnection
/// attempts.
pub const INFINITE_RETRIES: i32 = -1;

/// Connection state of a [`ReconnectableIoDevice`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Closed,
    Opening,
    Opened,
    Closing,
}

/// An event emitted by the reconnectable wrapper towards the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Opened,
    /// The device is closed for good; no reconnection will be attempted.
    Closed,
    /// The connection broke but a reconnection attempt has been scheduled.
    ConnectionLostWillReconnect,
    Error(String),
    BytesWritten(usize),
    ReadyRead,
}

/// Wraps a raw byte-stream device and adds automatic reopening.
///
/// A device failure while open first closes the device; on the resulting
/// close, if [`close`](Self::close) was not requested explicitly and retries
/// remain, a reopen is scheduled after the configured delay. The retry budget
/// is restored whenever the device opens successfully.
///
/// `BytesWritten` and `ReadyRead` are forwarded verbatim while the wrapper is
/// `Opened` and swallowed otherwise.
#[derive(Debug)]
pub struct ReconnectableIoDevice<D> {
    device: D,
    state: ConnectionState,
    open_retry_times: i32,
    open_retries_left: i32,
    open_retry_delay: Duration,
    force_close: bool,
    error_string: String,
    reopen_deadline: Option<Instant>,
    pending: VecDeque<LinkEvent>,
}

impl<D: IoDevice> ReconnectableIoDevice<D> {
    pub fn new(device: D) -> Self {
        Self {
            device,
            state: ConnectionState::Closed,
            open_retry_times: 0,
            open_retries_left: 0,
            open_retry_delay: Duration::from_millis(1000),
            force_close: false,
            error_string: String::new(),
            reopen_deadline: None,
            pending: VecDeque::new(),
        }
    }

    /// Configure the reconnection budget. A negative `retry_times` means
    /// reconnect forever.
    pub fn set_open_retry(&mut self, retry_times: i32, delay: Duration) {
        let retry_times = retry_times.max(INFINITE_RETRIES);
        self.open_retry_times = retry_times;
        self.open_retries_left = retry_times;
        self.open_retry_delay = delay;
    }

    pub fn open_retry_times(&self) -> i32 {
        self.open_retry_times
    }

    pub fn open_retry_delay(&self) -> Duration {
        self.open_retry_delay
    }

    pub fn open(&mut self) {
        self.state = ConnectionState::Opening;
        self.device.open();
    }

    /// Close for good: the device will not reconnect afterwards.
    pub fn close(&mut self) {
        self.force_close = true;
        if self.reopen_deadline.take().is_some() {
            // A reconnect was pending; there is nothing to close.
            self.force_close = false;
            self.state = ConnectionState::Closed;
            self.pending.push_back(LinkEvent::Closed);
            return;
        }
        self.close_keeping_force_flag();
    }

    pub fn write(&mut self, data: &[u8]) {
        self.device.write(data);
    }

    pub fn read_all(&mut self) -> Bytes {
        self.device.read_all()
    }

    pub fn clear(&mut self) {
        self.device.clear();
    }

    pub fn name(&self) -> &str {
        self.device.name()
    }

    pub fn is_opened(&self) -> bool {
        self.state == ConnectionState::Opened
    }

    pub fn is_closed(&self) -> bool {
        self.state == ConnectionState::Closed
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn error_string(&self) -> &str {
        &self.error_string
    }

    /// Await the next wrapper event. `None` means the underlying device is
    /// gone for good.
    pub async fn next_event(&mut self) -> Option<LinkEvent> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(event);
            }

            let event = if let Some(deadline) = self.reopen_deadline {
                tokio::select! {
                    () = tokio::time::sleep_until(deadline) => {
                        self.reopen_deadline = None;
                        log::info!("{}: reconnecting", self.device.name());
                        self.open();
                        continue;
                    }
                    event = self.device.next_event() => event?,
                }
            } else {
                self.device.next_event().await?
            };

            match event {
                IoEvent::Opened => {
                    self.state = ConnectionState::Opened;
                    self.open_retries_left = self.open_retry_times;
                    return Some(LinkEvent::Opened);
                }
                IoEvent::Closed => self.on_device_closed(),
                IoEvent::Error(message) => {
                    if message.is_empty() {
                        continue;
                    }
                    log::warn!("{} {}", self.device.name(), message);
                    self.error_string = message;
                    if self.state == ConnectionState::Opened {
                        self.close_keeping_force_flag();
                    } else {
                        self.on_device_closed();
                    }
                }
                IoEvent::BytesWritten(n) => {
                    if self.state == ConnectionState::Opened {
                        return Some(LinkEvent::BytesWritten(n));
                    }
                }
                IoEvent::ReadyRead => {
                    if self.state == ConnectionState::Opened {
                        return Some(LinkEvent::ReadyRead);
                    }
                }
            }
        }
    }

    fn close_keeping_force_flag(&mut self) {
        if self.state != ConnectionState::Opened {
            log::info!(
                "{}: is already closed or closing or opening",
                self.device.name()
            );
            return;
        }
        self.state = ConnectionState::Closing;
        self.device.close();
    }

    fn on_device_closed(&mut self) {
        self.state = ConnectionState::Closed;

        // Explicit close: do not reconnect.
        if self.force_close {
            self.force_close = false;
            self.push_final_close();
            return;
        }

        if self.open_retries_left == 0 {
            self.push_final_close();
            return;
        }

        if self.open_retries_left > 0 {
            self.open_retries_left -= 1;
        }
        log::warn!(
            "{} closed, try reconnect after {:?}",
            self.device.name(),
            self.open_retry_delay
        );
        self.reopen_deadline = Some(Instant::now() + self.open_retry_delay);
        self.pending.push_back(LinkEvent::ConnectionLostWillReconnect);
    }

    fn push_final_close(&mut self) {
        if !self.error_string.is_empty() {
            self.pending
                .push_back(LinkEvent::Error(std::mem::take(&mut self.error_string)));
        }
        self.pending.push_back(LinkEvent::Closed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};
    use tokio::sync::mpsc;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Call {
        Open,
        Close,
    }

    struct FlakyDevice {
        events: mpsc::UnboundedReceiver<IoEvent>,
        feeder: mpsc::UnboundedSender<IoEvent>,
        calls: Arc<Mutex<Vec<Call>>>,
        /// `open()` fails this many times before succeeding.
        failures_left: usize,
    }

    impl FlakyDevice {
        fn new(failures: usize) -> Self {
            let (feeder, events) = mpsc::unbounded_channel();
            Self {
                events,
                feeder,
                calls: Arc::new(Mutex::new(Vec::new())),
                failures_left: failures,
            }
        }
    }

    #[async_trait]
    impl IoDevice for FlakyDevice {
        fn open(&mut self) {
            self.calls.lock().unwrap().push(Call::Open);
            if self.failures_left > 0 {
                self.failures_left -= 1;
                self.feeder
                    .send(IoEvent::Error("no carrier".to_owned()))
                    .unwrap();
            } else {
                self.feeder.send(IoEvent::Opened).unwrap();
            }
        }

        fn close(&mut self) {
            self.calls.lock().unwrap().push(Call::Close);
            self.feeder.send(IoEvent::Closed).unwrap();
        }

        fn write(&mut self, _data: &[u8]) {}

        fn read_all(&mut self) -> Bytes {
            Bytes::new()
        }

        fn clear(&mut self) {}

        fn name(&self) -> &str {
            "flaky"
        }

        async fn next_event(&mut self) -> Option<IoEvent> {
            self.events.recv().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn open_without_retries_surfaces_closed() {
        let mut device = ReconnectableIoDevice::new(FlakyDevice::new(1));
        device.open();
        assert_eq!(
            device.next_event().await,
            Some(LinkEvent::Error("no carrier".to_owned()))
        );
        assert_eq!(device.next_event().await, Some(LinkEvent::Closed));
        assert!(device.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn reconnects_after_failed_open() {
        let inner = FlakyDevice::new(2);
        let calls = inner.calls.clone();
        let mut device = ReconnectableIoDevice::new(inner);
        device.set_open_retry(3, Duration::from_millis(100));
        device.open();

        assert_eq!(
            device.next_event().await,
            Some(LinkEvent::ConnectionLostWillReconnect)
        );
        assert_eq!(
            device.next_event().await,
            Some(LinkEvent::ConnectionLostWillReconnect)
        );
        // third attempt succeeds after two scheduled reopens
        assert_eq!(device.next_event().await, Some(LinkEvent::Opened));
        assert!(device.is_opened());
        assert_eq!(calls.lock().unwrap().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_budget_restored_on_open() {
        let mut device = ReconnectableIoDevice::new(FlakyDevice::new(1));
        device.set_open_retry(1, Duration::from_millis(10));
        device.open();
        assert_eq!(
            device.next_event().await,
            Some(LinkEvent::ConnectionLostWillReconnect)
        );
        assert_eq!(device.next_event().await, Some(LinkEvent::Opened));
        assert_eq!(device.open_retries_left, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn force_close_does_not_reconnect() {
        let mut device = ReconnectableIoDevice::new(FlakyDevice::new(0));
        device.set_open_retry(INFINITE_RETRIES, Duration::from_millis(10));
        device.open();
        assert_eq!(device.next_event().await, Some(LinkEvent::Opened));

        device.close();
        assert_eq!(device.next_event().await, Some(LinkEvent::Closed));
        assert!(device.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn error_while_open_triggers_reconnect() {
        let inner = FlakyDevice::new(0);
        let feeder = inner.feeder.clone();
        let mut device = ReconnectableIoDevice::new(inner);
        device.set_open_retry(INFINITE_RETRIES, Duration::from_millis(10));
        device.open();
        assert_eq!(device.next_event().await, Some(LinkEvent::Opened));

        feeder.send(IoEvent::Error("line broke".to_owned())).unwrap();
        assert_eq!(
            device.next_event().await,
            Some(LinkEvent::ConnectionLostWillReconnect)
        );
        assert_eq!(device.next_event().await, Some(LinkEvent::Opened));
    }

    #[tokio::test(start_paused = true)]
    async fn io_forwarded_only_while_open() {
        let inner = FlakyDevice::new(0);
        let feeder = inner.feeder.clone();
        let mut device = ReconnectableIoDevice::new(inner);

        // not opened yet: swallowed
        feeder.send(IoEvent::ReadyRead).unwrap();
        device.open();
        assert_eq!(device.next_event().await, Some(LinkEvent::Opened));

        feeder.send(IoEvent::BytesWritten(8)).unwrap();
        feeder.send(IoEvent::ReadyRead).unwrap();
        assert_eq!(device.next_event().await, Some(LinkEvent::BytesWritten(8)));
        assert_eq!(device.next_event().await, Some(LinkEvent::ReadyRead));
    }
}
