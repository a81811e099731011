// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Modbus client (master).
//!
//! The client is split into a cheap [`Client`] handle and a session task
//! spawned onto the tokio runtime. The task owns the transport and drives the
//! queue-backed session state machine; the handle turns API calls into
//! commands and exposes completion events through a channel.
//!
//! ```no_run
//! # async fn demo(device: impl modbus_link::io::IoDevice + 'static) {
//! use modbus_link::client::{Client, ClientConfig, ClientEvent};
//!
//! let (client, mut events) = Client::new(device, ClientConfig::default());
//! client.open().unwrap();
//! while let Some(event) = events.recv().await {
//!     match event {
//!         ClientEvent::Opened => {
//!             // requests enqueued while closed are silently dropped
//!             client
//!                 .read_registers(1, modbus_link::frame::READ_HOLDING_REGISTERS, 0, 4)
//!                 .unwrap();
//!         }
//!         ClientEvent::ReadRegistersFinished { values, .. } => {
//!             println!("{values:?}");
//!             break;
//!         }
//!         _ => {}
//!     }
//! }
//! # }
//! ```

mod diagnosis;
mod session;

pub use self::diagnosis::{ErrorRecord, RuntimeDiagnosis, ServerDiagnosis};

use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};

use crate::access::{SingleBitAccess, SixteenBitAccess};
use crate::error::{Error, Result};
use crate::frame::{
    Address, Exception, FunctionCode, Quantity, Request, RequestContext, Response, ServerAddress,
    TransferMode, Word, READ_COILS, READ_DISCRETE_INPUTS, READ_HOLDING_REGISTERS,
    READ_INPUT_REGISTERS, READ_WRITE_MULTIPLE_REGISTERS, WRITE_MULTIPLE_COILS,
    WRITE_MULTIPLE_REGISTERS, WRITE_SINGLE_COIL, WRITE_SINGLE_REGISTER,
};
use crate::io::{ConnectionState, IoDevice};

/// What to do with a response whose server address does not match the
/// outstanding request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ForeignResponsePolicy {
    /// Discard the received bytes and keep waiting for the matching reply.
    /// This permits silent multi-drop traffic on shared buses.
    #[default]
    Discard,
    /// Treat the mismatch as a framing desync and fail the outstanding
    /// request with a storage parity error.
    Fail,
}

/// Runtime-settable client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Selects the frame codec.
    pub transfer_mode: TransferMode,
    /// Per-attempt response deadline.
    pub timeout: Duration,
    /// Additional attempts after the first response timeout.
    pub retry_times: i32,
    /// Quiet gap before writing a frame (`t3.5`). Use zero for sockets.
    pub frame_interval: Duration,
    /// How long a broadcast occupies the line before the next request.
    pub conversion_delay: Duration,
    /// Reconnect attempts of the transport wrapper; `-1` means infinite.
    pub open_retry_times: i32,
    /// Delay between reconnect attempts.
    pub open_retry_delay: Duration,
    /// Collect a [`RuntimeDiagnosis`].
    pub enable_diagnosis: bool,
    /// Log a hex dump of every sent and received frame.
    pub enable_dump: bool,
    /// See [`ForeignResponsePolicy`].
    pub foreign_response_policy: ForeignResponsePolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            transfer_mode: TransferMode::Rtu,
            timeout: Duration::from_millis(1000),
            retry_times: 0,
            frame_interval: Duration::from_millis(60),
            conversion_delay: Duration::from_millis(200),
            open_retry_times: 0,
            open_retry_delay: Duration::from_millis(1000),
            enable_diagnosis: false,
            enable_dump: true,
            foreign_response_policy: ForeignResponsePolicy::default(),
        }
    }
}

/// Completion and connection events delivered by the client.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    Opened,
    Closed,
    ConnectionLostWillReconnect,
    ErrorOccurred(String),
    /// The universal completion event, fired for every finished request.
    RequestFinished {
        request: Request,
        response: Response,
    },
    ReadSingleBitsFinished {
        server_address: ServerAddress,
        function_code: FunctionCode,
        start_address: Address,
        quantity: Quantity,
        values: Vec<bool>,
        error: Option<Exception>,
    },
    WriteSingleCoilFinished {
        server_address: ServerAddress,
        address: Address,
        error: Option<Exception>,
    },
    WriteMultipleCoilsFinished {
        server_address: ServerAddress,
        start_address: Address,
        error: Option<Exception>,
    },
    ReadRegistersFinished {
        server_address: ServerAddress,
        function_code: FunctionCode,
        start_address: Address,
        quantity: Quantity,
        values: Vec<Word>,
        error: Option<Exception>,
    },
    WriteSingleRegisterFinished {
        server_address: ServerAddress,
        address: Address,
        error: Option<Exception>,
    },
    WriteMultipleRegistersFinished {
        server_address: ServerAddress,
        start_address: Address,
        error: Option<Exception>,
    },
    ReadWriteMultipleRegistersFinished {
        server_address: ServerAddress,
        start_address: Address,
        values: Vec<Word>,
        error: Option<Exception>,
    },
}

#[derive(Debug)]
pub(crate) enum Command {
    Open,
    Close,
    Send(Box<Request>),
    SetTimeout(Duration),
    SetRetryTimes(i32),
    SetFrameInterval(Duration),
    SetTransferMode(TransferMode),
    SetOpenRetry { times: i32, delay: Duration },
    EnableDiagnosis(bool),
    EnableDump(bool),
    SetForeignResponsePolicy(ForeignResponsePolicy),
    QueryDiagnosis(oneshot::Sender<RuntimeDiagnosis>),
    QueryPendingRequests(oneshot::Sender<usize>),
    QueryErrorString(oneshot::Sender<String>),
}

/// Connection and session status mirrored out of the session task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Status {
    pub(crate) connection: ConnectionState,
    pub(crate) idle: bool,
}

impl Default for Status {
    fn default() -> Self {
        Self {
            connection: ConnectionState::Closed,
            idle: true,
        }
    }
}

/// Handle to a running Modbus client session.
///
/// Cloning the handle is cheap; all clones drive the same session. The
/// session task stops once every handle has been dropped.
#[derive(Debug, Clone)]
pub struct Client {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<Status>,
}

impl Client {
    /// Spawn a client session on the current tokio runtime.
    ///
    /// Completion and connection events arrive on the returned receiver, in
    /// submission order for requests.
    pub fn new(
        device: impl IoDevice + 'static,
        config: ClientConfig,
    ) -> (Self, mpsc::UnboundedReceiver<ClientEvent>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(Status::default());

        let task = session::SessionTask::new(device, config, command_rx, event_tx, status_tx);
        tokio::spawn(task.run());

        (
            Self {
                commands: command_tx,
                status: status_rx,
            },
            event_rx,
        )
    }

    /// Request the transport to open.
    pub fn open(&self) -> Result<()> {
        self.command(Command::Open)
    }

    /// Close the transport. All pending requests are dropped without
    /// completion events.
    pub fn close(&self) -> Result<()> {
        self.command(Command::Close)
    }

    /// Enqueue a prebuilt request. Discarded silently if the transport is
    /// closed.
    pub fn send_request(&self, request: Request) -> Result<()> {
        self.command(Command::Send(Box::new(request)))
    }

    /// Read coils (0x01) or discrete inputs (0x02).
    pub fn read_single_bits(
        &self,
        server_address: ServerAddress,
        function_code: FunctionCode,
        start_address: Address,
        quantity: Quantity,
    ) -> Result<()> {
        if function_code != READ_COILS && function_code != READ_DISCRETE_INPUTS {
            return Err(Error::InvalidFunctionCode(function_code));
        }
        let access = SingleBitAccess::new(start_address, quantity);
        let request = Request::new(
            server_address,
            function_code,
            access.marshal_read_request(),
            RequestContext::SingleBit(access),
        );
        self.send_request(request)
    }

    /// Write a single coil (0x05).
    pub fn write_single_coil(
        &self,
        server_address: ServerAddress,
        address: Address,
        value: bool,
    ) -> Result<()> {
        let mut access = SingleBitAccess::new(address, 1);
        access.set_value(address, value);
        let request = Request::new(
            server_address,
            WRITE_SINGLE_COIL,
            access.marshal_single_write_request(),
            RequestContext::SingleBit(access),
        );
        self.send_request(request)
    }

    /// Write multiple coils (0x0F).
    pub fn write_multiple_coils(
        &self,
        server_address: ServerAddress,
        start_address: Address,
        values: &[bool],
    ) -> Result<()> {
        #[allow(clippy::cast_possible_truncation)]
        let mut access = SingleBitAccess::new(start_address, values.len() as Quantity);
        for (i, value) in values.iter().enumerate() {
            #[allow(clippy::cast_possible_truncation)]
            access.set_value(start_address.wrapping_add(i as u16), *value);
        }
        let request = Request::new(
            server_address,
            WRITE_MULTIPLE_COILS,
            access.marshal_multiple_write_request(),
            RequestContext::SingleBit(access),
        );
        self.send_request(request)
    }

    /// Read holding registers (0x03) or input registers (0x04).
    pub fn read_registers(
        &self,
        server_address: ServerAddress,
        function_code: FunctionCode,
        start_address: Address,
        quantity: Quantity,
    ) -> Result<()> {
        if function_code != READ_HOLDING_REGISTERS && function_code != READ_INPUT_REGISTERS {
            return Err(Error::InvalidFunctionCode(function_code));
        }
        let access = SixteenBitAccess::new(start_address, quantity);
        let request = Request::new(
            server_address,
            function_code,
            access.marshal_read_request(),
            RequestContext::SixteenBit(access),
        );
        self.send_request(request)
    }

    /// Write a single holding register (0x06).
    pub fn write_single_register(
        &self,
        server_address: ServerAddress,
        address: Address,
        value: Word,
    ) -> Result<()> {
        let mut access = SixteenBitAccess::new(address, 1);
        access.set_value(address, value);
        let request = Request::new(
            server_address,
            WRITE_SINGLE_REGISTER,
            access.marshal_single_write_request(),
            RequestContext::SixteenBit(access),
        );
        self.send_request(request)
    }

    /// Write multiple holding registers (0x10).
    pub fn write_multiple_registers(
        &self,
        server_address: ServerAddress,
        start_address: Address,
        values: &[Word],
    ) -> Result<()> {
        #[allow(clippy::cast_possible_truncation)]
        let mut access = SixteenBitAccess::new(start_address, values.len() as Quantity);
        for (i, value) in values.iter().enumerate() {
            #[allow(clippy::cast_possible_truncation)]
            access.set_value(start_address.wrapping_add(i as u16), *value);
        }
        let request = Request::new(
            server_address,
            WRITE_MULTIPLE_REGISTERS,
            access.marshal_multiple_write_request(),
            RequestContext::SixteenBit(access),
        );
        self.send_request(request)
    }

    /// Read and write multiple registers in one transaction (0x17). The
    /// write is performed by the server before the read.
    pub fn read_write_multiple_registers(
        &self,
        server_address: ServerAddress,
        read_start_address: Address,
        read_quantity: Quantity,
        write_start_address: Address,
        values: &[Word],
    ) -> Result<()> {
        let read = SixteenBitAccess::new(read_start_address, read_quantity);
        #[allow(clippy::cast_possible_truncation)]
        let mut write = SixteenBitAccess::new(write_start_address, values.len() as Quantity);
        for (i, value) in values.iter().enumerate() {
            #[allow(clippy::cast_possible_truncation)]
            write.set_value(write_start_address.wrapping_add(i as u16), *value);
        }

        let mut data = read.marshal_read_request().to_vec();
        data.extend_from_slice(&write.marshal_multiple_write_request());
        let request = Request::new(
            server_address,
            READ_WRITE_MULTIPLE_REGISTERS,
            data,
            RequestContext::ReadWriteRegisters { read, write },
        );
        self.send_request(request)
    }

    pub fn set_timeout(&self, timeout: Duration) -> Result<()> {
        self.command(Command::SetTimeout(timeout))
    }

    pub fn set_retry_times(&self, retry_times: i32) -> Result<()> {
        self.command(Command::SetRetryTimes(retry_times.max(0)))
    }

    pub fn set_frame_interval(&self, frame_interval: Duration) -> Result<()> {
        self.command(Command::SetFrameInterval(frame_interval))
    }

    /// Select the frame codec. Only effective while no request is in flight.
    pub fn set_transfer_mode(&self, transfer_mode: TransferMode) -> Result<()> {
        self.command(Command::SetTransferMode(transfer_mode))
    }

    /// Configure the reconnection budget of the transport wrapper;
    /// `times == -1` reconnects forever.
    pub fn set_open_retry(&self, times: i32, delay: Duration) -> Result<()> {
        self.command(Command::SetOpenRetry { times, delay })
    }

    pub fn enable_diagnosis(&self, enable: bool) -> Result<()> {
        self.command(Command::EnableDiagnosis(enable))
    }

    pub fn enable_dump(&self, enable: bool) -> Result<()> {
        self.command(Command::EnableDump(enable))
    }

    pub fn set_foreign_response_policy(&self, policy: ForeignResponsePolicy) -> Result<()> {
        self.command(Command::SetForeignResponsePolicy(policy))
    }

    #[must_use]
    pub fn is_opened(&self) -> bool {
        self.status.borrow().connection == ConnectionState::Opened
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.status.borrow().connection == ConnectionState::Closed
    }

    /// Whether the session currently has no request in flight.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.status.borrow().idle
    }

    /// A snapshot of the collected [`RuntimeDiagnosis`].
    pub async fn runtime_diagnosis(&self) -> Result<RuntimeDiagnosis> {
        self.query(Command::QueryDiagnosis).await
    }

    /// Number of queued requests, including the one in flight.
    pub async fn pending_request_size(&self) -> Result<usize> {
        self.query(Command::QueryPendingRequests).await
    }

    /// The most recent transport error message.
    pub async fn error_string(&self) -> Result<String> {
        self.query(Command::QueryErrorString).await
    }

    fn command(&self, command: Command) -> Result<()> {
        self.commands.send(command).map_err(|_| Error::ClientGone)
    }

    async fn query<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.command(make(tx))?;
        rx.await.map_err(|_| Error::ClientGone)
    }
}
