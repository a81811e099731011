// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Transport-neutral Modbus frame model.

use std::{error, fmt};

use bytes::Bytes;

use crate::access::{SingleBitAccess, SixteenBitAccess};

/// A Modbus function code is represented by an unsigned 8 bit integer.
pub type FunctionCode = u8;

/// A Modbus protocol address is represented by 16 bit from `0` to `65535`.
///
/// This *protocol address* uses 0-based indexing, while the *coil address* or
/// *register address* is often specified as a number with 1-based indexing.
/// Please consult the specification of your devices if 1-based coil/register
/// addresses need to be converted to 0-based protocol addresses by subtracting 1.
pub type Address = u16;

/// Modbus uses 16 bit for its data items (big-endian representation).
pub type Word = u16;

/// Number of items to process (`0` - `65535`).
pub type Quantity = u16;

/// A single byte addressing a Modbus server (slave) device.
///
/// `0` is the broadcast address: such a request is sent to all connected
/// devices at once and is never answered.
pub type ServerAddress = u8;

/// Transaction identifier of the MBAP header (TCP only).
pub type TransactionId = u16;

/// The broadcast server address.
pub const BROADCAST_ADDRESS: ServerAddress = 0;

/// Marker bit of an exception response function code.
pub const EXCEPTION_BIT: u8 = 0x80;

/// Maximum payload length of a PDU (256 bytes minus server address,
/// function code and RTU CRC).
pub const MAX_PAYLOAD_LEN: usize = 253;

pub const READ_COILS: FunctionCode = 0x01;
pub const READ_DISCRETE_INPUTS: FunctionCode = 0x02;
pub const READ_HOLDING_REGISTERS: FunctionCode = 0x03;
pub const READ_INPUT_REGISTERS: FunctionCode = 0x04;
pub const WRITE_SINGLE_COIL: FunctionCode = 0x05;
pub const WRITE_SINGLE_REGISTER: FunctionCode = 0x06;
pub const WRITE_MULTIPLE_COILS: FunctionCode = 0x0F;
pub const WRITE_MULTIPLE_REGISTERS: FunctionCode = 0x10;
pub const READ_WRITE_MULTIPLE_REGISTERS: FunctionCode = 0x17;

/// Selects the wire encoding of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransferMode {
    /// Binary encoding with a trailing CRC-16 (serial lines).
    #[default]
    Rtu,
    /// `':' <hex> CRLF` encoding with a trailing LRC (serial lines).
    Ascii,
    /// MBAP header framing (TCP/UDP).
    Mbap,
}

/// A server (slave) exception code, extended by locally synthesized
/// error conditions.
///
/// Values `0x01`-`0x0B` travel on the wire as the single payload byte of an
/// exception response. `Timeout` never appears on the wire; it is produced
/// by the client after the configured retries are exhausted.
/// `StorageParity` doubles as the local marker for a failed CRC/LRC check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exception {
    IllegalFunction,
    IllegalDataAddress,
    IllegalDataValue,
    ServerDeviceFailure,
    Acknowledge,
    ServerDeviceBusy,
    StorageParity,
    GatewayPathUnavailable,
    GatewayTargetDevice,
    /// No response within the configured deadline (user code 0x1000).
    Timeout,
}

impl Exception {
    /// The numeric error code; fits a single byte except for `Timeout`.
    #[must_use]
    pub fn code(self) -> u16 {
        use Exception::*;
        match self {
            IllegalFunction => 0x01,
            IllegalDataAddress => 0x02,
            IllegalDataValue => 0x03,
            ServerDeviceFailure => 0x04,
            Acknowledge => 0x05,
            ServerDeviceBusy => 0x06,
            StorageParity => 0x08,
            GatewayPathUnavailable => 0x0A,
            GatewayTargetDevice => 0x0B,
            Timeout => 0x1000,
        }
    }

    /// Look up the exception for a wire code.
    #[must_use]
    pub fn from_code(code: u8) -> Option<Self> {
        use Exception::*;
        let ex = match code {
            0x01 => IllegalFunction,
            0x02 => IllegalDataAddress,
            0x03 => IllegalDataValue,
            0x04 => ServerDeviceFailure,
            0x05 => Acknowledge,
            0x06 => ServerDeviceBusy,
            0x08 => StorageParity,
            0x0A => GatewayPathUnavailable,
            0x0B => GatewayTargetDevice,
            _ => return None,
        };
        Some(ex)
    }

    pub(crate) fn description(&self) -> &str {
        use Exception::*;
        match *self {
            IllegalFunction => "Illegal function",
            IllegalDataAddress => "Illegal data address",
            IllegalDataValue => "Illegal data value",
            ServerDeviceFailure => "Server device failure",
            Acknowledge => "Acknowledge",
            ServerDeviceBusy => "Server device busy",
            StorageParity => "Storage parity error",
            GatewayPathUnavailable => "Gateway path unavailable",
            GatewayTargetDevice => "Gateway target device failed to respond",
            Timeout => "Timeout",
        }
    }
}

impl fmt::Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

impl error::Error for Exception {}

/// Application data unit: server address, function code and payload as
/// carried on the wire, minus the integrity field.
///
/// The raw function byte may have the exception bit set; [`Adu::function_code`]
/// always masks it out and the bit is re-applied at encode time only.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Adu {
    server_address: ServerAddress,
    function: u8,
    data: Bytes,
    transaction_id: TransactionId,
}

impl Adu {
    #[must_use]
    pub fn new(server_address: ServerAddress, function_code: FunctionCode) -> Self {
        Self {
            server_address,
            function: function_code,
            data: Bytes::new(),
            transaction_id: 0,
        }
    }

    #[must_use]
    pub fn server_address(&self) -> ServerAddress {
        self.server_address
    }

    pub fn set_server_address(&mut self, server_address: ServerAddress) {
        self.server_address = server_address;
    }

    #[must_use]
    pub fn is_broadcast(&self) -> bool {
        self.server_address == BROADCAST_ADDRESS
    }

    /// The function code with the exception bit masked out.
    #[must_use]
    pub fn function_code(&self) -> FunctionCode {
        self.function & !EXCEPTION_BIT
    }

    pub fn set_function_code(&mut self, function_code: FunctionCode) {
        self.function = function_code;
    }

    #[must_use]
    pub fn is_exception(&self) -> bool {
        self.function & EXCEPTION_BIT != 0
    }

    /// Flag this ADU as an exception response.
    pub fn set_exception(&mut self) {
        self.function |= EXCEPTION_BIT;
    }

    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn set_data(&mut self, data: impl Into<Bytes>) {
        self.data = data.into();
        debug_assert!(self.data.len() <= MAX_PAYLOAD_LEN);
    }

    /// The exception carried by this ADU, if any.
    #[must_use]
    pub fn exception(&self) -> Option<Exception> {
        if !self.is_exception() {
            return None;
        }
        self.data.first().copied().and_then(Exception::from_code)
    }

    #[must_use]
    pub fn transaction_id(&self) -> TransactionId {
        self.transaction_id
    }

    pub fn set_transaction_id(&mut self, transaction_id: TransactionId) {
        self.transaction_id = transaction_id;
    }

    /// Encoded size of server address + function code + payload.
    #[must_use]
    pub fn pdu_len(&self) -> usize {
        2 + self.data.len()
    }
}

/// The typed payload context attached to an outbound request so the
/// completion path can reparse the matching response.
#[derive(Debug, Clone, Default)]
pub enum RequestContext {
    #[default]
    None,
    SingleBit(SingleBitAccess),
    SixteenBit(SixteenBitAccess),
    ReadWriteRegisters {
        read: SixteenBitAccess,
        write: SixteenBitAccess,
    },
}

/// An outbound message plus whatever the caller needs on completion.
#[derive(Debug, Clone, Default)]
pub struct Request {
    pub adu: Adu,
    pub context: RequestContext,
}

impl Request {
    #[must_use]
    pub fn new(
        server_address: ServerAddress,
        function_code: FunctionCode,
        data: impl Into<Bytes>,
        context: RequestContext,
    ) -> Self {
        let mut adu = Adu::new(server_address, function_code);
        adu.set_data(data.into());
        Self { adu, context }
    }
}

/// An inbound message plus the locally detected terminal error, if any.
#[derive(Debug, Clone, Default)]
pub struct Response {
    pub adu: Adu,
    pub error: Option<Exception>,
}

impl Response {
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}
