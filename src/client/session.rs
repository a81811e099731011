// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The queue-backed client session state machine.
//!
//! One task owns the transport and serializes all progress: at most one
//! request is on the wire at any instant, and completion events fire in
//! submission order. The session suspends at four points only: the quiet
//! interval before a write, the drain of outbound bytes, the response
//! deadline, and the reconnect delay of the transport wrapper. Each is a
//! timer or channel await; nothing blocks.

use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};
use tokio::sync::{mpsc, watch};
use tokio::time::{Duration, Instant};
use tokio_util::codec::{Decoder, Encoder};

use crate::codec::{hex_dump, FrameCodec};
use crate::frame::{
    Exception, Request, RequestContext, Response, TransferMode, READ_COILS, READ_DISCRETE_INPUTS,
    READ_HOLDING_REGISTERS, READ_INPUT_REGISTERS, READ_WRITE_MULTIPLE_REGISTERS,
    WRITE_MULTIPLE_COILS, WRITE_MULTIPLE_REGISTERS, WRITE_SINGLE_COIL, WRITE_SINGLE_REGISTER,
};
use crate::io::{IoDevice, LinkEvent, ReconnectableIoDevice};

use super::{ClientConfig, ClientEvent, Command, ForeignResponsePolicy, RuntimeDiagnosis, Status};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Idle,
    SendingRequest,
    WaitingResponse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerKind {
    /// Fires when the quiet gap before a write has elapsed.
    Send,
    /// Fires when the outstanding request has not been answered in time.
    ResponseTimeout,
}

/// One pending or in-flight request.
#[derive(Debug)]
struct Element {
    request: Request,
    encoded: Bytes,
    bytes_written: usize,
    retries_left: i32,
    recv_buffer: BytesMut,
}

pub(super) struct SessionTask<D> {
    device: ReconnectableIoDevice<D>,
    config: ClientConfig,
    state: SessionState,
    queue: VecDeque<Element>,
    codec: FrameCodec,
    diagnosis: RuntimeDiagnosis,
    error_string: String,
    next_transaction_id: u16,
    timer: Option<(TimerKind, Instant)>,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<ClientEvent>,
    status: watch::Sender<Status>,
}

impl<D: IoDevice> SessionTask<D> {
    pub(super) fn new(
        device: D,
        config: ClientConfig,
        commands: mpsc::UnboundedReceiver<Command>,
        events: mpsc::UnboundedSender<ClientEvent>,
        status: watch::Sender<Status>,
    ) -> Self {
        let mut device = ReconnectableIoDevice::new(device);
        device.set_open_retry(config.open_retry_times, config.open_retry_delay);
        let codec = FrameCodec::client(config.transfer_mode);
        Self {
            device,
            config,
            state: SessionState::Idle,
            queue: VecDeque::new(),
            codec,
            diagnosis: RuntimeDiagnosis::default(),
            error_string: String::new(),
            next_transaction_id: 0,
            timer: None,
            commands,
            events,
            status,
        }
    }

    pub(super) async fn run(mut self) {
        loop {
            let deadline = self.timer.map(|(_, at)| at);
            tokio::select! {
                biased;

                command = self.commands.recv() => {
                    let Some(command) = command else {
                        // Every handle is gone; release the transport.
                        break;
                    };
                    self.on_command(command);
                }
                event = self.device.next_event() => {
                    let Some(event) = event else {
                        log::error!("{}: device is gone", self.device.name());
                        self.flush_pending_requests();
                        self.emit(ClientEvent::Closed);
                        break;
                    };
                    self.on_link_event(event);
                }
                () = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)),
                    if deadline.is_some() =>
                {
                    self.on_timer();
                }
            }
        }
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Open => self.device.open(),
            Command::Close => self.device.close(),
            Command::Send(request) => self.enqueue_request(*request),
            Command::SetTimeout(timeout) => self.config.timeout = timeout,
            Command::SetRetryTimes(retry_times) => self.config.retry_times = retry_times,
            Command::SetFrameInterval(frame_interval) => {
                self.config.frame_interval = frame_interval;
            }
            Command::SetTransferMode(transfer_mode) => {
                self.config.transfer_mode = transfer_mode;
                self.codec = FrameCodec::client(transfer_mode);
            }
            Command::SetOpenRetry { times, delay } => self.device.set_open_retry(times, delay),
            Command::EnableDiagnosis(enable) => self.config.enable_diagnosis = enable,
            Command::EnableDump(enable) => self.config.enable_dump = enable,
            Command::SetForeignResponsePolicy(policy) => {
                self.config.foreign_response_policy = policy;
            }
            Command::QueryDiagnosis(reply) => {
                let _ = reply.send(self.diagnosis.clone());
            }
            Command::QueryPendingRequests(reply) => {
                let _ = reply.send(self.queue.len());
            }
            Command::QueryErrorString(reply) => {
                let _ = reply.send(self.error_string.clone());
            }
        }
    }

    fn enqueue_request(&mut self, mut request: Request) {
        if !self.device.is_opened() {
            log::warn!("{} closed, discard request", self.device.name());
            return;
        }

        self.next_transaction_id = self.next_transaction_id.wrapping_add(1);
        request.adu.set_transaction_id(self.next_transaction_id);

        self.queue.push_back(Element {
            request,
            encoded: Bytes::new(),
            bytes_written: 0,
            retries_left: self.config.retry_times,
            recv_buffer: BytesMut::new(),
        });
        self.schedule_next_request(self.config.frame_interval);
    }

    /// Arm the send timer for the queue head; only an idle session with a
    /// non-empty queue starts sending.
    fn schedule_next_request(&mut self, delay: Duration) {
        if self.state != SessionState::Idle {
            return;
        }
        if self.queue.is_empty() {
            return;
        }
        self.set_state(SessionState::SendingRequest);
        self.timer = Some((TimerKind::Send, Instant::now() + delay));
    }

    fn on_timer(&mut self) {
        let Some((kind, _)) = self.timer.take() else {
            return;
        };
        match kind {
            TimerKind::Send => self.send_head_request(),
            TimerKind::ResponseTimeout => self.on_response_timeout(),
        }
    }

    fn send_head_request(&mut self) {
        if self.queue.is_empty() {
            self.set_state(SessionState::Idle);
            return;
        }
        debug_assert_eq!(self.state, SessionState::SendingRequest);

        let mut buf = BytesMut::new();
        let encoded_ok = {
            let head = self.queue.front().expect("queue head");
            self.codec.encode(&head.request.adu, &mut buf).is_ok()
        };
        if !encoded_ok {
            // Only possible with a malformed user request; drop it.
            log::error!("{}: failed to encode request", self.device.name());
            self.queue.pop_front();
            self.set_state(SessionState::Idle);
            self.schedule_next_request(self.config.frame_interval);
            return;
        }

        let head = self.queue.front_mut().expect("queue head");
        head.encoded = buf.freeze();
        head.bytes_written = 0;
        let data = head.encoded.clone();
        if self.config.enable_dump {
            log::debug!(
                "{} will send: {}",
                self.device.name(),
                dump(self.config.transfer_mode, &data)
            );
        }
        self.device.write(&data);
    }

    fn on_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Opened => {
                self.update_connection_status();
                self.emit(ClientEvent::Opened);
            }
            LinkEvent::Closed => {
                self.flush_pending_requests();
                self.update_connection_status();
                self.emit(ClientEvent::Closed);
            }
            LinkEvent::ConnectionLostWillReconnect => {
                self.flush_pending_requests();
                self.update_connection_status();
                self.emit(ClientEvent::ConnectionLostWillReconnect);
            }
            LinkEvent::Error(message) => {
                self.error_string = message.clone();
                self.flush_pending_requests();
                self.update_connection_status();
                self.emit(ClientEvent::ErrorOccurred(message));
            }
            LinkEvent::BytesWritten(n) => self.on_bytes_written(n),
            LinkEvent::ReadyRead => self.on_ready_read(),
        }
    }

    fn on_bytes_written(&mut self, n: usize) {
        if self.state != SessionState::SendingRequest {
            log::warn!(
                "{}: unexpected write progress while not sending",
                self.device.name()
            );
            return;
        }
        let Some(head) = self.queue.front_mut() else {
            return;
        };
        head.bytes_written += n;
        if head.bytes_written < head.encoded.len() {
            return;
        }

        if head.request.adu.is_broadcast() {
            // A broadcast is never answered; hold the line for the
            // conversion delay, then move on.
            self.queue.pop_front();
            self.set_state(SessionState::Idle);
            self.schedule_next_request(self.config.conversion_delay);
            log::warn!(
                "{} broadcast request, turn into idle status",
                self.device.name()
            );
            return;
        }

        self.set_state(SessionState::WaitingResponse);
        self.timer = Some((
            TimerKind::ResponseTimeout,
            Instant::now() + self.config.timeout,
        ));
    }

    fn on_ready_read(&mut self) {
        let data = self.device.read_all();

        // Data outside the waiting window is stale, e.g. a reply arriving
        // after its timeout already fired.
        if self.state != SessionState::WaitingResponse {
            log::warn!(
                "{} got unexpected data, discard them.[{}]",
                self.device.name(),
                dump(self.config.transfer_mode, &data)
            );
            self.device.clear();
            return;
        }

        let Some(head) = self.queue.front_mut() else {
            return;
        };
        head.recv_buffer.extend_from_slice(&data);

        let frame = match self.codec.decode(&mut head.recv_buffer) {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                log::debug!(
                    "{}: need more data.[{}]",
                    self.device.name(),
                    dump(self.config.transfer_mode, &head.recv_buffer)
                );
                return;
            }
            Err(err) => {
                log::warn!("{}: failed to decode response: {err}", self.device.name());
                head.recv_buffer.clear();
                self.codec.reset();
                return;
            }
        };

        let response = Response {
            adu: frame.adu,
            error: frame.error,
        };

        if response.adu.server_address() != head.request.adu.server_address() {
            match self.config.foreign_response_policy {
                ForeignResponsePolicy::Discard => {
                    // Keep the timeout running; the matching reply may still
                    // arrive on a multi-drop line.
                    log::warn!(
                        "{}: got response, unexpected server address, discard it",
                        self.device.name()
                    );
                    head.recv_buffer.clear();
                    self.codec.reset();
                    return;
                }
                ForeignResponsePolicy::Fail => {
                    self.timer = None;
                    self.set_state(SessionState::Idle);
                    let element = self.queue.pop_front().expect("queue head");
                    let mut response = response;
                    response.error = Some(Exception::StorageParity);
                    self.finish_request(element.request, response);
                    self.schedule_next_request(self.config.frame_interval);
                    return;
                }
            }
        }

        self.timer = None;
        self.set_state(SessionState::Idle);
        if self.config.enable_dump {
            log::debug!(
                "{} received {}",
                self.device.name(),
                dump(self.config.transfer_mode, &data)
            );
        }

        let element = self.queue.pop_front().expect("queue head");
        self.finish_request(element.request, response);
        self.schedule_next_request(self.config.frame_interval);
    }

    fn on_response_timeout(&mut self) {
        debug_assert_eq!(self.state, SessionState::WaitingResponse);
        if self.queue.is_empty() {
            return;
        }

        // The counter decrements past zero: the total number of attempts is
        // exactly one plus the configured retries.
        let retries_left = {
            let head = self.queue.front_mut().expect("queue head");
            head.bytes_written = 0;
            head.recv_buffer.clear();
            let retries_left = head.retries_left;
            head.retries_left -= 1;
            retries_left
        };
        self.codec.reset();
        self.set_state(SessionState::Idle);

        if retries_left > 0 {
            log::warn!(
                "{} waiting response timeout, retry it, retry times {}",
                self.device.name(),
                retries_left - 1
            );
            let request = self.queue.front().expect("queue head").request.clone();
            let response = timeout_response(&request);
            self.process_diagnosis(&request, &response);
        } else {
            log::warn!("{}: waiting response timeout", self.device.name());
            let element = self.queue.pop_front().expect("queue head");
            let response = timeout_response(&element.request);
            self.finish_request(element.request, response);
        }
        self.schedule_next_request(self.config.frame_interval);
    }

    fn finish_request(&mut self, request: Request, response: Response) {
        self.process_diagnosis(&request, &response);
        self.emit(ClientEvent::RequestFinished {
            request: request.clone(),
            response: response.clone(),
        });
        self.process_function_code(request, response);
    }

    /// Fire the per-function-code completion event by reparsing the response
    /// with the access object the request was built from.
    fn process_function_code(&mut self, request: Request, response: Response) {
        let server_address = request.adu.server_address();
        let function_code = request.adu.function_code();
        let error = response.error;

        match (function_code, request.context) {
            (READ_COILS | READ_DISCRETE_INPUTS, RequestContext::SingleBit(mut access)) => {
                if response.is_ok() && !access.unmarshal_read_response(response.adu.data()) {
                    log::warn!("{}: malformed read response payload", self.device.name());
                }
                self.emit(ClientEvent::ReadSingleBitsFinished {
                    server_address,
                    function_code,
                    start_address: access.start_address(),
                    quantity: access.quantity(),
                    values: access.values(),
                    error,
                });
            }
            (WRITE_SINGLE_COIL, RequestContext::SingleBit(access)) => {
                self.emit(ClientEvent::WriteSingleCoilFinished {
                    server_address,
                    address: access.start_address(),
                    error,
                });
            }
            (WRITE_MULTIPLE_COILS, RequestContext::SingleBit(access)) => {
                self.emit(ClientEvent::WriteMultipleCoilsFinished {
                    server_address,
                    start_address: access.start_address(),
                    error,
                });
            }
            (
                READ_HOLDING_REGISTERS | READ_INPUT_REGISTERS,
                RequestContext::SixteenBit(mut access),
            ) => {
                if response.is_ok() && !access.unmarshal_read_response(response.adu.data()) {
                    log::warn!("{}: malformed read response payload", self.device.name());
                }
                self.emit(ClientEvent::ReadRegistersFinished {
                    server_address,
                    function_code,
                    start_address: access.start_address(),
                    quantity: access.quantity(),
                    values: access.values(),
                    error,
                });
            }
            (WRITE_SINGLE_REGISTER, RequestContext::SixteenBit(access)) => {
                self.emit(ClientEvent::WriteSingleRegisterFinished {
                    server_address,
                    address: access.start_address(),
                    error,
                });
            }
            (WRITE_MULTIPLE_REGISTERS, RequestContext::SixteenBit(access)) => {
                self.emit(ClientEvent::WriteMultipleRegistersFinished {
                    server_address,
                    start_address: access.start_address(),
                    error,
                });
            }
            (
                READ_WRITE_MULTIPLE_REGISTERS,
                RequestContext::ReadWriteRegisters { mut read, write: _ },
            ) => {
                if response.is_ok() && !read.unmarshal_read_response(response.adu.data()) {
                    log::warn!("{}: malformed read response payload", self.device.name());
                }
                self.emit(ClientEvent::ReadWriteMultipleRegistersFinished {
                    server_address,
                    start_address: read.start_address(),
                    values: read.values(),
                    error,
                });
            }
            _ => {}
        }
    }

    fn process_diagnosis(&mut self, request: &Request, response: &Response) {
        if !self.config.enable_diagnosis {
            return;
        }
        match response.error {
            None => self.diagnosis.increment_total_frame_numbers(),
            Some(error) => self.diagnosis.insert_error_record(
                request.adu.server_address(),
                request.adu.function_code(),
                error,
                request.adu.data(),
            ),
        }
    }

    /// Drop every queued request without firing completion events and return
    /// to idle. Callers observing `Closed` must assume their work is forfeit.
    fn flush_pending_requests(&mut self) {
        self.queue.clear();
        self.timer = None;
        self.codec.reset();
        self.set_state(SessionState::Idle);
    }

    fn set_state(&mut self, state: SessionState) {
        self.state = state;
        self.status.send_modify(|status| {
            status.idle = state == SessionState::Idle;
        });
    }

    fn update_connection_status(&mut self) {
        let connection = self.device.state();
        self.status.send_modify(|status| {
            status.connection = connection;
        });
    }

    fn emit(&self, event: ClientEvent) {
        // Nobody listening is fine; completions are fire-and-forget.
        let _ = self.events.send(event);
    }
}

fn timeout_response(request: &Request) -> Response {
    let mut response = Response::default();
    response
        .adu
        .set_server_address(request.adu.server_address());
    response.adu.set_function_code(request.adu.function_code());
    response.error = Some(Exception::Timeout);
    response
}

fn dump(mode: TransferMode, data: &[u8]) -> String {
    if mode == TransferMode::Ascii {
        String::from_utf8_lossy(data).into_owned()
    } else {
        hex_dump(data)
    }
}
