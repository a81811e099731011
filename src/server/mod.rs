// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Modbus server (slave) dispatch engine.
//!
//! The server owns four register files: coils (read/write), discrete inputs
//! (read only), holding registers (read/write) and input registers (read
//! only). Each is configured once as a contiguous region; requests touching
//! addresses outside the configured region answer with
//! `IllegalDataAddress`.
//!
//! The engine is transport independent: connection handling lives outside.
//! Feed received bytes into [`Server::feed`] and write the returned frames
//! back to the peer.

use std::collections::HashMap;

use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc;
use tokio_util::codec::{Decoder, Encoder};

use crate::access::{SingleBitAccess, SixteenBitAccess};
use crate::codec::{hex_dump, DecodedFrame, FrameCodec};
use crate::frame::{
    Address, Adu, Exception, FunctionCode, Quantity, ServerAddress, TransferMode, Word, READ_COILS,
    READ_DISCRETE_INPUTS, READ_HOLDING_REGISTERS, READ_INPUT_REGISTERS,
    READ_WRITE_MULTIPLE_REGISTERS, WRITE_MULTIPLE_COILS, WRITE_MULTIPLE_REGISTERS,
    WRITE_SINGLE_COIL, WRITE_SINGLE_REGISTER,
};

/// Change notifications emitted when stored values are mutated, either by a
/// wire request or through the direct accessors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    CoilsValueChanged {
        address: Address,
        value: bool,
    },
    InputDiscreteValueChanged {
        address: Address,
        value: bool,
    },
    /// One event covers the full written span, even if only part of it
    /// changed.
    HoldingRegisterValueChanged {
        start_address: Address,
        values: Vec<Word>,
    },
    InputRegisterValueChanged {
        start_address: Address,
        values: Vec<Word>,
    },
}

/// Write guard for coil values. Returning an exception aborts the write and
/// the server answers with that code.
pub type SingleBitWriteGuard = Box<dyn Fn(Address, bool) -> Option<Exception> + Send>;

/// Write guard for register values.
pub type SixteenBitWriteGuard = Box<dyn Fn(Address, Word) -> Option<Exception> + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StorageKind {
    Coils,
    InputDiscrete,
    HoldingRegisters,
    InputRegisters,
}

/// The server dispatch engine.
pub struct Server {
    server_address: ServerAddress,
    transfer_mode: TransferMode,
    codec: FrameCodec,
    buffer: BytesMut,
    coils: SingleBitAccess,
    input_discrete: SingleBitAccess,
    holding_registers: SixteenBitAccess,
    input_registers: SixteenBitAccess,
    router: HashMap<FunctionCode, StorageKind>,
    can_write_single_bit: Option<SingleBitWriteGuard>,
    can_write_sixteen_bit: Option<SixteenBitWriteGuard>,
    events: Option<mpsc::UnboundedSender<ServerEvent>>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("server_address", &self.server_address)
            .field("transfer_mode", &self.transfer_mode)
            .field("router", &self.router)
            .finish_non_exhaustive()
    }
}

impl Server {
    #[must_use]
    pub fn new(server_address: ServerAddress, transfer_mode: TransferMode) -> Self {
        Self {
            server_address,
            transfer_mode,
            codec: FrameCodec::server(transfer_mode),
            buffer: BytesMut::new(),
            coils: SingleBitAccess::default(),
            input_discrete: SingleBitAccess::default(),
            holding_registers: SixteenBitAccess::default(),
            input_registers: SixteenBitAccess::default(),
            router: HashMap::new(),
            can_write_single_bit: None,
            can_write_sixteen_bit: None,
            events: None,
        }
    }

    #[must_use]
    pub fn server_address(&self) -> ServerAddress {
        self.server_address
    }

    #[must_use]
    pub fn transfer_mode(&self) -> TransferMode {
        self.transfer_mode
    }

    /// Subscribe to change events. Only the most recent subscription
    /// receives events.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<ServerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.events = Some(tx);
        rx
    }

    /// Configure the read/write coil region and register its function codes.
    pub fn handle_coils(&mut self, start_address: Address, quantity: Quantity) {
        self.coils.set_start_address(start_address);
        self.coils.set_quantity(quantity);
        self.add_route(READ_COILS, StorageKind::Coils);
        self.add_route(WRITE_SINGLE_COIL, StorageKind::Coils);
        self.add_route(WRITE_MULTIPLE_COILS, StorageKind::Coils);
    }

    /// Configure the read-only discrete input region.
    pub fn handle_discrete_inputs(&mut self, start_address: Address, quantity: Quantity) {
        self.input_discrete.set_start_address(start_address);
        self.input_discrete.set_quantity(quantity);
        self.add_route(READ_DISCRETE_INPUTS, StorageKind::InputDiscrete);
    }

    /// Configure the read/write holding register region and register its
    /// function codes.
    pub fn handle_holding_registers(&mut self, start_address: Address, quantity: Quantity) {
        self.holding_registers.set_start_address(start_address);
        self.holding_registers.set_quantity(quantity);
        self.add_route(READ_HOLDING_REGISTERS, StorageKind::HoldingRegisters);
        self.add_route(WRITE_SINGLE_REGISTER, StorageKind::HoldingRegisters);
        self.add_route(WRITE_MULTIPLE_REGISTERS, StorageKind::HoldingRegisters);
        self.add_route(READ_WRITE_MULTIPLE_REGISTERS, StorageKind::HoldingRegisters);
    }

    /// Configure the read-only input register region.
    pub fn handle_input_registers(&mut self, start_address: Address, quantity: Quantity) {
        self.input_registers.set_start_address(start_address);
        self.input_registers.set_quantity(quantity);
        self.add_route(READ_INPUT_REGISTERS, StorageKind::InputRegisters);
    }

    fn add_route(&mut self, function_code: FunctionCode, kind: StorageKind) {
        self.router.insert(function_code, kind);
        log::info!("route add function[0x{function_code:02X}] -> {kind:?}");
    }

    /// Install a guard consulted before every coil write.
    pub fn set_can_write_single_bit(&mut self, guard: SingleBitWriteGuard) {
        self.can_write_single_bit = Some(guard);
    }

    /// Install a guard consulted before every register write.
    pub fn set_can_write_sixteen_bit(&mut self, guard: SixteenBitWriteGuard) {
        self.can_write_sixteen_bit = Some(guard);
    }

    /// Read a coil value.
    #[must_use]
    pub fn coil(&self, address: Address) -> Option<bool> {
        self.coils.value(address)
    }

    /// Read a discrete input value.
    #[must_use]
    pub fn discrete_input(&self, address: Address) -> Option<bool> {
        self.input_discrete.value(address)
    }

    /// Read a holding register value.
    #[must_use]
    pub fn holding_register(&self, address: Address) -> Option<Word> {
        self.holding_registers.value(address)
    }

    /// Read an input register value.
    #[must_use]
    pub fn input_register(&self, address: Address) -> Option<Word> {
        self.input_registers.value(address)
    }

    /// Write a coil locally through the guard and change-event path.
    pub fn set_coil(&mut self, address: Address, value: bool) -> Result<(), Exception> {
        let mut access = SingleBitAccess::new(address, 1);
        access.set_value(address, value);
        match self.write_bits(StorageKind::Coils, &access) {
            None => Ok(()),
            Some(error) => Err(error),
        }
    }

    /// Write a discrete input locally (they are read-only on the wire).
    pub fn set_discrete_input(&mut self, address: Address, value: bool) -> Result<(), Exception> {
        let mut access = SingleBitAccess::new(address, 1);
        access.set_value(address, value);
        match self.write_bits(StorageKind::InputDiscrete, &access) {
            None => Ok(()),
            Some(error) => Err(error),
        }
    }

    /// Write a holding register locally through the guard and change-event
    /// path.
    pub fn set_holding_register(&mut self, address: Address, value: Word) -> Result<(), Exception> {
        let mut access = SixteenBitAccess::new(address, 1);
        access.set_value(address, value);
        match self.write_registers(StorageKind::HoldingRegisters, &access) {
            None => Ok(()),
            Some(error) => Err(error),
        }
    }

    /// Write an input register locally (they are read-only on the wire).
    pub fn set_input_register(&mut self, address: Address, value: Word) -> Result<(), Exception> {
        let mut access = SixteenBitAccess::new(address, 1);
        access.set_value(address, value);
        match self.write_registers(StorageKind::InputRegisters, &access) {
            None => Ok(()),
            Some(error) => Err(error),
        }
    }

    /// Feed received bytes into the engine, returning the encoded response
    /// frames to write back to the peer.
    pub fn feed(&mut self, data: &[u8]) -> Vec<Bytes> {
        self.buffer.extend_from_slice(data);
        log::debug!("R[{}]", hex_dump(data));

        let mut responses = Vec::new();
        loop {
            let frame = match self.codec.decode(&mut self.buffer) {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(err) => {
                    log::warn!("failed to decode request frame: {err}");
                    self.buffer.clear();
                    self.codec.reset();
                    break;
                }
            };
            if let Some(response) = self.process_frame(frame) {
                let mut buf = BytesMut::new();
                if self.codec.encode(&response, &mut buf).is_ok() {
                    let encoded = buf.freeze();
                    log::debug!("S[{}]", hex_dump(&encoded));
                    responses.push(encoded);
                }
            }
        }
        responses
    }

    /// Run one decoded request through the dispatch rules of the engine.
    fn process_frame(&mut self, frame: DecodedFrame) -> Option<Adu> {
        let request = frame.adu;

        // A request for some other server on the line is none of our
        // business; drop it together with any queued input.
        if request.server_address() != self.server_address && !request.is_broadcast() {
            log::warn!(
                "unexpected server address {}, my address {}",
                request.server_address(),
                self.server_address
            );
            self.buffer.clear();
            self.codec.reset();
            return None;
        }

        let function_code = request.function_code();
        if frame.error == Some(Exception::IllegalFunction)
            || !self.router.contains_key(&function_code)
        {
            log::warn!("unsupported function code 0x{function_code:02X}");
            self.buffer.clear();
            self.codec.reset();
            return Some(self.exception_response(&request, Exception::IllegalFunction));
        }

        // A frame that failed its integrity check is answered with the
        // storage parity exception. Many real slaves do this over RTU; over
        // MBAP a CRC cannot fail and this branch stays unreachable.
        if frame.error == Some(Exception::StorageParity) {
            log::warn!("invalid request frame (integrity check failed)");
            self.buffer.clear();
            self.codec.reset();
            return Some(self.exception_response(&request, Exception::StorageParity));
        }

        if request.is_broadcast() {
            self.process_broadcast_request(&request);
            return None;
        }

        let response = match function_code {
            READ_COILS | READ_DISCRETE_INPUTS => self.process_read_bits(&request),
            WRITE_SINGLE_COIL => self.process_write_single_coil(&request),
            WRITE_MULTIPLE_COILS => self.process_write_multiple_coils(&request),
            READ_HOLDING_REGISTERS | READ_INPUT_REGISTERS => self.process_read_registers(&request),
            WRITE_SINGLE_REGISTER => self.process_write_single_register(&request),
            WRITE_MULTIPLE_REGISTERS => self.process_write_multiple_registers(&request),
            READ_WRITE_MULTIPLE_REGISTERS => self.process_read_write_registers(&request),
            _ => self.exception_response(&request, Exception::IllegalFunction),
        };
        Some(response)
    }

    /// Broadcast requests are consumed without a reply and without touching
    /// the register files.
    fn process_broadcast_request(&mut self, request: &Adu) {
        log::debug!(
            "broadcast request, function code 0x{:02X}",
            request.function_code()
        );
    }

    fn process_read_bits(&mut self, request: &Adu) -> Adu {
        let mut access = SingleBitAccess::default();
        if !access.unmarshal_read_request(request.data()) {
            log::error!("invalid read request payload");
            return self.exception_response(request, Exception::StorageParity);
        }

        let storage = match request.function_code() {
            READ_COILS => &self.coils,
            _ => &self.input_discrete,
        };
        if let Some(error) = validate_range(
            access.start_address(),
            access.quantity(),
            storage.start_address(),
            storage.quantity(),
        ) {
            return self.exception_response(request, error);
        }

        let mut response_access = SingleBitAccess::new(access.start_address(), access.quantity());
        for i in 0..access.quantity() {
            let address = access.start_address().wrapping_add(i);
            response_access.set_value(address, storage.value(address).unwrap_or_default());
        }
        self.data_response(request, response_access.marshal_read_response())
    }

    fn process_write_single_coil(&mut self, request: &Adu) -> Adu {
        let mut access = SingleBitAccess::default();
        if request.data().len() < 4 {
            log::error!("invalid write request payload");
            return self.exception_response(request, Exception::StorageParity);
        }
        if !access.unmarshal_single_write_request(request.data()) {
            // Any value word other than 0xFF00/0x0000 is malformed.
            return self.exception_response(request, Exception::IllegalDataValue);
        }

        if let Some(error) = self.write_bits(StorageKind::Coils, &access) {
            return self.exception_response(request, error);
        }
        // The response echoes the request payload.
        self.data_response(request, Bytes::copy_from_slice(request.data()))
    }

    fn process_write_multiple_coils(&mut self, request: &Adu) -> Adu {
        let mut access = SingleBitAccess::default();
        if !access.unmarshal_multiple_write_request(request.data()) {
            log::error!("invalid write request payload");
            return self.exception_response(request, Exception::StorageParity);
        }

        if let Some(error) = self.write_bits(StorageKind::Coils, &access) {
            return self.exception_response(request, error);
        }
        self.data_response(request, access.marshal_address_quantity())
    }

    fn process_read_registers(&mut self, request: &Adu) -> Adu {
        let mut access = SixteenBitAccess::default();
        if !access.unmarshal_address_quantity(request.data()) {
            log::error!("invalid read request payload");
            return self.exception_response(request, Exception::StorageParity);
        }

        let storage = match request.function_code() {
            READ_HOLDING_REGISTERS => &self.holding_registers,
            _ => &self.input_registers,
        };
        if let Some(error) = validate_range(
            access.start_address(),
            access.quantity(),
            storage.start_address(),
            storage.quantity(),
        ) {
            return self.exception_response(request, error);
        }

        let mut response_access = SixteenBitAccess::new(access.start_address(), access.quantity());
        for i in 0..access.quantity() {
            let address = access.start_address().wrapping_add(i);
            response_access.set_value(address, storage.value(address).unwrap_or_default());
        }
        self.data_response(request, response_access.marshal_read_response())
    }

    fn process_write_single_register(&mut self, request: &Adu) -> Adu {
        let mut access = SixteenBitAccess::default();
        if !access.unmarshal_single_write_request(request.data()) {
            log::error!("invalid write request payload");
            return self.exception_response(request, Exception::StorageParity);
        }

        if let Some(error) = self.write_registers(StorageKind::HoldingRegisters, &access) {
            return self.exception_response(request, error);
        }
        self.data_response(request, Bytes::copy_from_slice(request.data()))
    }

    fn process_write_multiple_registers(&mut self, request: &Adu) -> Adu {
        let mut access = SixteenBitAccess::default();
        if !access.unmarshal_multiple_write_request(request.data()) {
            log::error!("invalid write request payload");
            return self.exception_response(request, Exception::StorageParity);
        }

        if let Some(error) = self.write_registers(StorageKind::HoldingRegisters, &access) {
            return self.exception_response(request, error);
        }
        self.data_response(request, access.marshal_read_request())
    }

    /// Read/write multiple registers (0x17): the write is performed first,
    /// then the read response is produced from the updated storage.
    fn process_read_write_registers(&mut self, request: &Adu) -> Adu {
        let data = request.data();
        let mut read_access = SixteenBitAccess::default();
        let mut write_access = SixteenBitAccess::default();
        if data.len() < 9
            || !read_access.unmarshal_address_quantity(&data[..4])
            || !write_access.unmarshal_multiple_write_request(&data[4..])
        {
            log::error!("invalid read/write request payload");
            return self.exception_response(request, Exception::StorageParity);
        }

        if let Some(error) = validate_range(
            read_access.start_address(),
            read_access.quantity(),
            self.holding_registers.start_address(),
            self.holding_registers.quantity(),
        ) {
            return self.exception_response(request, error);
        }

        if let Some(error) = self.write_registers(StorageKind::HoldingRegisters, &write_access) {
            return self.exception_response(request, error);
        }

        let mut response_access =
            SixteenBitAccess::new(read_access.start_address(), read_access.quantity());
        for i in 0..read_access.quantity() {
            let address = read_access.start_address().wrapping_add(i);
            response_access.set_value(
                address,
                self.holding_registers.value(address).unwrap_or_default(),
            );
        }
        self.data_response(request, response_access.marshal_read_response())
    }

    /// Validate, guard-check and apply a single-bit write, emitting one
    /// change event per changed address.
    fn write_bits(&mut self, kind: StorageKind, access: &SingleBitAccess) -> Option<Exception> {
        let storage = match kind {
            StorageKind::Coils => &self.coils,
            _ => &self.input_discrete,
        };
        if let Some(error) = validate_range(
            access.start_address(),
            access.quantity(),
            storage.start_address(),
            storage.quantity(),
        ) {
            return Some(error);
        }

        for i in 0..access.quantity() {
            let address = access.start_address().wrapping_add(i);
            let Some(value) = access.value(address) else {
                return Some(Exception::IllegalDataValue);
            };
            if let Some(guard) = &self.can_write_single_bit {
                if let Some(error) = guard(address, value) {
                    return Some(error);
                }
            }
        }

        for i in 0..access.quantity() {
            let address = access.start_address().wrapping_add(i);
            let Some(value) = access.value(address) else {
                continue;
            };
            let storage = match kind {
                StorageKind::Coils => &mut self.coils,
                _ => &mut self.input_discrete,
            };
            if storage.value(address) != Some(value) {
                storage.set_value(address, value);
                self.emit(match kind {
                    StorageKind::Coils => ServerEvent::CoilsValueChanged { address, value },
                    _ => ServerEvent::InputDiscreteValueChanged { address, value },
                });
            }
        }
        None
    }

    /// Validate, guard-check and apply a register write, emitting a single
    /// change event covering the written span if anything changed.
    fn write_registers(&mut self, kind: StorageKind, access: &SixteenBitAccess) -> Option<Exception> {
        let storage = match kind {
            StorageKind::HoldingRegisters => &self.holding_registers,
            _ => &self.input_registers,
        };
        if let Some(error) = validate_range(
            access.start_address(),
            access.quantity(),
            storage.start_address(),
            storage.quantity(),
        ) {
            return Some(error);
        }

        for i in 0..access.quantity() {
            let address = access.start_address().wrapping_add(i);
            let value = access.value(address).unwrap_or_default();
            if let Some(guard) = &self.can_write_sixteen_bit {
                if let Some(error) = guard(address, value) {
                    return Some(error);
                }
            }
        }

        let mut changed = false;
        let mut new_values = Vec::with_capacity(usize::from(access.quantity()));
        for i in 0..access.quantity() {
            let address = access.start_address().wrapping_add(i);
            let value = access.value(address).unwrap_or_default();
            let storage = match kind {
                StorageKind::HoldingRegisters => &mut self.holding_registers,
                _ => &mut self.input_registers,
            };
            if storage.value(address) != Some(value) {
                changed = true;
            }
            storage.set_value(address, value);
            new_values.push(value);
        }

        if changed {
            self.emit(match kind {
                StorageKind::HoldingRegisters => ServerEvent::HoldingRegisterValueChanged {
                    start_address: access.start_address(),
                    values: new_values,
                },
                _ => ServerEvent::InputRegisterValueChanged {
                    start_address: access.start_address(),
                    values: new_values,
                },
            });
        }
        None
    }

    fn exception_response(&self, request: &Adu, error: Exception) -> Adu {
        debug_assert!(error != Exception::Timeout);
        let mut response = Adu::new(self.server_address, request.function_code());
        response.set_exception();
        #[allow(clippy::cast_possible_truncation)]
        response.set_data(vec![error.code() as u8]);
        response.set_transaction_id(request.transaction_id());
        response
    }

    fn data_response(&self, request: &Adu, data: Bytes) -> Adu {
        let mut response = Adu::new(self.server_address, request.function_code());
        response.set_data(data);
        response.set_transaction_id(request.transaction_id());
        response
    }

    fn emit(&self, event: ServerEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }
}

/// `[req_start, req_start + req_quantity)` must be contained in
/// `[start, start + quantity)`.
fn validate_range(
    req_start: Address,
    req_quantity: Quantity,
    start: Address,
    quantity: Quantity,
) -> Option<Exception> {
    let req_end = u32::from(req_start) + u32::from(req_quantity);
    let end = u32::from(start) + u32::from(quantity);
    if req_start < start || req_end > end {
        return Some(Exception::IllegalDataAddress);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::calc_crc;

    fn rtu_frame(adu: &[u8]) -> Vec<u8> {
        let mut frame = adu.to_vec();
        let crc = calc_crc(adu);
        frame.push((crc & 0xFF) as u8);
        frame.push((crc >> 8) as u8);
        frame
    }

    fn rtu_server() -> Server {
        Server::new(1, TransferMode::Rtu)
    }

    #[test]
    fn read_coils_success() {
        let mut server = rtu_server();
        server.handle_coils(0, 16);
        server.set_coil(10, true).unwrap();
        server.set_coil(11, false).unwrap();
        server.set_coil(12, true).unwrap();

        let responses = server.feed(&rtu_frame(&[0x01, 0x01, 0x00, 0x0A, 0x00, 0x03]));
        assert_eq!(responses.len(), 1);
        assert_eq!(&responses[0][..], &rtu_frame(&[0x01, 0x01, 0x01, 0x05])[..]);
    }

    #[test]
    fn read_holding_registers_success() {
        let mut server = rtu_server();
        server.handle_holding_registers(0, 4);
        for (address, value) in [(0, 1u16), (1, 2), (2, 3), (3, 4)] {
            server.set_holding_register(address, value).unwrap();
        }

        let responses = server.feed(&rtu_frame(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x04]));
        assert_eq!(responses.len(), 1);
        assert_eq!(
            &responses[0][..],
            &rtu_frame(&[0x01, 0x03, 0x08, 0x00, 0x01, 0x00, 0x02, 0x00, 0x03, 0x00, 0x04])[..]
        );
    }

    #[test]
    fn write_guard_denial_answers_exception() {
        let mut server = rtu_server();
        server.handle_coils(1, 10);
        server.set_can_write_single_bit(Box::new(|address, _value| {
            (address == 1).then_some(Exception::ServerDeviceBusy)
        }));

        let responses = server.feed(&rtu_frame(&[0x01, 0x05, 0x00, 0x01, 0x00, 0x00]));
        assert_eq!(responses.len(), 1);
        assert_eq!(&responses[0][..], &rtu_frame(&[0x01, 0x85, 0x06])[..]);
    }

    #[test]
    fn out_of_region_read_answers_illegal_data_address() {
        let mut server = rtu_server();
        server.handle_coils(0, 16);

        // [10, 10 + 8) sticks out of [0, 16)
        let responses = server.feed(&rtu_frame(&[0x01, 0x01, 0x00, 0x0A, 0x00, 0x08]));
        assert_eq!(responses.len(), 1);
        assert_eq!(&responses[0][..], &rtu_frame(&[0x01, 0x81, 0x02])[..]);
    }

    #[test]
    fn unsupported_function_code_answers_illegal_function() {
        let mut server = rtu_server();
        server.handle_coils(0, 16);

        // 0x03 decodes fine (server oracle) but has no registered handler
        let responses = server.feed(&rtu_frame(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x01]));
        assert_eq!(responses.len(), 1);
        assert_eq!(&responses[0][..], &rtu_frame(&[0x01, 0x83, 0x01])[..]);
    }

    #[test]
    fn corrupted_request_answers_storage_parity() {
        let mut server = rtu_server();
        server.handle_coils(0, 16);

        let mut frame = rtu_frame(&[0x01, 0x01, 0x00, 0x00, 0x00, 0x01]);
        *frame.last_mut().unwrap() ^= 0xFF;
        let responses = server.feed(&frame);
        assert_eq!(responses.len(), 1);
        assert_eq!(&responses[0][..], &rtu_frame(&[0x01, 0x81, 0x08])[..]);
    }

    #[test]
    fn foreign_server_address_is_ignored() {
        let mut server = rtu_server();
        server.handle_coils(0, 16);

        let responses = server.feed(&rtu_frame(&[0x22, 0x01, 0x00, 0x00, 0x00, 0x01]));
        assert!(responses.is_empty());
    }

    #[test]
    fn broadcast_is_consumed_without_reply() {
        let mut server = rtu_server();
        server.handle_coils(0, 16);

        let responses = server.feed(&rtu_frame(&[0x00, 0x05, 0x00, 0x01, 0xFF, 0x00]));
        assert!(responses.is_empty());
        // broadcast writes are not applied
        assert_eq!(server.coil(1), None);
    }

    #[test]
    fn write_single_coil_updates_and_echoes() {
        let mut server = rtu_server();
        server.handle_coils(0, 16);
        let mut events = server.subscribe();

        let request = rtu_frame(&[0x01, 0x05, 0x00, 0x03, 0xFF, 0x00]);
        let responses = server.feed(&request);
        assert_eq!(responses.len(), 1);
        assert_eq!(&responses[0][..], &request[..]);
        assert_eq!(server.coil(3), Some(true));
        assert_eq!(
            events.try_recv().unwrap(),
            ServerEvent::CoilsValueChanged {
                address: 3,
                value: true
            }
        );
    }

    #[test]
    fn write_single_coil_bad_value_answers_illegal_data_value() {
        let mut server = rtu_server();
        server.handle_coils(0, 16);

        let responses = server.feed(&rtu_frame(&[0x01, 0x05, 0x00, 0x03, 0x12, 0x34]));
        assert_eq!(responses.len(), 1);
        assert_eq!(&responses[0][..], &rtu_frame(&[0x01, 0x85, 0x03])[..]);
    }

    #[test]
    fn write_multiple_coils_emits_event_per_changed_bit() {
        let mut server = rtu_server();
        server.handle_coils(0, 16);
        server.set_coil(0, true).unwrap();
        let mut events = server.subscribe();

        // write [true, true, false, true] at 0; bit 0 is unchanged
        let responses = server.feed(&rtu_frame(&[
            0x01,
            0x0F,
            0x00,
            0x00,
            0x00,
            0x04,
            0x01,
            0b_0000_1011,
        ]));
        assert_eq!(responses.len(), 1);
        assert_eq!(
            &responses[0][..],
            &rtu_frame(&[0x01, 0x0F, 0x00, 0x00, 0x00, 0x04])[..]
        );

        let mut changed = Vec::new();
        while let Ok(event) = events.try_recv() {
            changed.push(event);
        }
        // bit 0 was already On; bits 1..=3 had no stored value before
        assert_eq!(
            changed,
            vec![
                ServerEvent::CoilsValueChanged {
                    address: 1,
                    value: true
                },
                ServerEvent::CoilsValueChanged {
                    address: 2,
                    value: false
                },
                ServerEvent::CoilsValueChanged {
                    address: 3,
                    value: true
                },
            ]
        );
    }

    #[test]
    fn write_multiple_registers_emits_single_span_event() {
        let mut server = rtu_server();
        server.handle_holding_registers(0, 8);
        let mut events = server.subscribe();

        let responses = server.feed(&rtu_frame(&[
            0x01, 0x10, 0x00, 0x02, 0x00, 0x02, 0x04, 0xAB, 0xCD, 0xEF, 0x12,
        ]));
        assert_eq!(responses.len(), 1);
        assert_eq!(
            &responses[0][..],
            &rtu_frame(&[0x01, 0x10, 0x00, 0x02, 0x00, 0x02])[..]
        );
        assert_eq!(server.holding_register(2), Some(0xABCD));
        assert_eq!(server.holding_register(3), Some(0xEF12));
        assert_eq!(
            events.try_recv().unwrap(),
            ServerEvent::HoldingRegisterValueChanged {
                start_address: 2,
                values: vec![0xABCD, 0xEF12],
            }
        );
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn write_single_register_guard_denial() {
        let mut server = rtu_server();
        server.handle_holding_registers(0, 8);
        server.set_can_write_sixteen_bit(Box::new(|_, value| {
            (value == 0xDEAD).then_some(Exception::IllegalDataValue)
        }));

        let responses = server.feed(&rtu_frame(&[0x01, 0x06, 0x00, 0x01, 0xDE, 0xAD]));
        assert_eq!(&responses[0][..], &rtu_frame(&[0x01, 0x86, 0x03])[..]);

        let request = rtu_frame(&[0x01, 0x06, 0x00, 0x01, 0x00, 0x2A]);
        let responses = server.feed(&request);
        assert_eq!(&responses[0][..], &request[..]);
        assert_eq!(server.holding_register(1), Some(0x002A));
    }

    #[test]
    fn read_write_multiple_registers_writes_before_reading() {
        let mut server = rtu_server();
        server.handle_holding_registers(0, 8);
        server.set_holding_register(0, 0x1111).unwrap();

        // read 2 registers at 0, write [0x00 0x07] to register 0
        let responses = server.feed(&rtu_frame(&[
            0x01, 0x17, 0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00, 0x01, 0x02, 0x00, 0x07,
        ]));
        assert_eq!(responses.len(), 1);
        // the read sees the freshly written value
        assert_eq!(
            &responses[0][..],
            &rtu_frame(&[0x01, 0x17, 0x04, 0x00, 0x07, 0x00, 0x00])[..]
        );
    }

    #[test]
    fn partial_frames_are_resumable() {
        let mut server = rtu_server();
        server.handle_coils(0, 16);

        let frame = rtu_frame(&[0x01, 0x01, 0x00, 0x00, 0x00, 0x08]);
        let (first, second) = frame.split_at(3);
        assert!(server.feed(first).is_empty());
        let responses = server.feed(second);
        assert_eq!(responses.len(), 1);
    }

    #[test]
    fn mbap_transaction_id_is_preserved() {
        let mut server = Server::new(1, TransferMode::Mbap);
        server.handle_holding_registers(0, 4);
        server.set_holding_register(0, 0x0007).unwrap();

        let responses = server.feed(&[
            0x12, 0x34, // transaction id
            0x00, 0x00, // protocol id
            0x00, 0x06, // length
            0x01, // unit id
            0x03, 0x00, 0x00, 0x00, 0x01,
        ]);
        assert_eq!(responses.len(), 1);
        assert_eq!(
            &responses[0][..],
            &[0x12, 0x34, 0x00, 0x00, 0x00, 0x05, 0x01, 0x03, 0x02, 0x00, 0x07]
        );
    }

    #[test]
    fn local_write_guard_applies_to_direct_accessors() {
        let mut server = rtu_server();
        server.handle_holding_registers(0, 4);
        server.set_can_write_sixteen_bit(Box::new(|_, _| Some(Exception::ServerDeviceBusy)));
        assert_eq!(
            server.set_holding_register(0, 1),
            Err(Exception::ServerDeviceBusy)
        );
    }
}
