// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Frame codecs for the three transfer encodings.
//!
//! Each decoder consumes an append-only [`BytesMut`] buffer and is resumable:
//! partial input yields `Ok(None)` and leaves the internal state intact so a
//! later call continues where the previous one stopped. A completed frame is
//! returned as a [`DecodedFrame`] together with the terminal error detected
//! while decoding (CRC/LRC mismatch, unknown function code, or the exception
//! carried by the peer).

pub(crate) mod ascii;
pub(crate) mod mbap;
pub(crate) mod rtu;

use std::io;

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use crate::frame::{Adu, Exception, FunctionCode, TransferMode};

/// Maximum size of an encoded RTU frame.
pub(crate) const MAX_FRAME_LEN: usize = 256;

/// A fully decoded ADU plus the terminal error detected by the decoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DecodedFrame {
    pub(crate) adu: Adu,
    pub(crate) error: Option<Exception>,
}

/// Payload-size oracle: decides from the already received payload bytes how
/// many payload bytes the frame carries in total.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PayloadSize {
    /// The payload is exactly `n` bytes.
    Fixed(usize),
    /// The byte at payload offset `index` is a count; the total payload is
    /// `index + 1 + count` bytes.
    LengthPrefixed { index: usize },
}

impl PayloadSize {
    pub(crate) fn check(self, buf: &[u8]) -> Option<usize> {
        match self {
            Self::Fixed(n) => (buf.len() >= n).then_some(n),
            Self::LengthPrefixed { index } => {
                let count = *buf.get(index)?;
                let total = index + 1 + usize::from(count);
                (buf.len() >= total).then_some(total)
            }
        }
    }
}

/// 256-entry table mapping a function code to its payload-size oracle.
///
/// Client and server use different tables because the payload lengths differ
/// by direction (e.g. a `ReadCoils` request is 4 fixed bytes while its
/// response is length-prefixed at index 0).
#[derive(Debug, Clone, Copy)]
pub(crate) struct OracleTable([Option<PayloadSize>; 256]);

impl OracleTable {
    /// Payload sizes of *responses*, as decoded by the client.
    pub(crate) const fn client() -> Self {
        let mut table = [None; 256];
        table[0x01] = Some(PayloadSize::LengthPrefixed { index: 0 }); // read coils
        table[0x02] = Some(PayloadSize::LengthPrefixed { index: 0 }); // read discrete inputs
        table[0x03] = Some(PayloadSize::LengthPrefixed { index: 0 }); // read holding registers
        table[0x04] = Some(PayloadSize::LengthPrefixed { index: 0 }); // read input registers
        table[0x05] = Some(PayloadSize::Fixed(4)); // write single coil
        table[0x06] = Some(PayloadSize::Fixed(4)); // write single register
        table[0x0F] = Some(PayloadSize::Fixed(4)); // write multiple coils
        table[0x10] = Some(PayloadSize::Fixed(4)); // write multiple registers
        table[0x17] = Some(PayloadSize::LengthPrefixed { index: 0 }); // read/write multiple registers
        Self(table)
    }

    /// Payload sizes of *requests*, as decoded by the server.
    pub(crate) const fn server() -> Self {
        let mut table = [None; 256];
        table[0x01] = Some(PayloadSize::Fixed(4));
        table[0x02] = Some(PayloadSize::Fixed(4));
        table[0x03] = Some(PayloadSize::Fixed(4));
        table[0x04] = Some(PayloadSize::Fixed(4));
        table[0x05] = Some(PayloadSize::Fixed(4));
        table[0x06] = Some(PayloadSize::Fixed(4));
        table[0x0F] = Some(PayloadSize::LengthPrefixed { index: 4 });
        table[0x10] = Some(PayloadSize::LengthPrefixed { index: 4 });
        // read/write multiple: rstart(2) rqty(2) wstart(2) wqty(2) wcount(1)
        table[0x17] = Some(PayloadSize::LengthPrefixed { index: 8 });
        Self(table)
    }

    pub(crate) fn lookup(&self, function_code: FunctionCode) -> Option<PayloadSize> {
        self.0[usize::from(function_code)]
    }
}

pub(crate) static CLIENT_ORACLES: OracleTable = OracleTable::client();
pub(crate) static SERVER_ORACLES: OracleTable = OracleTable::server();

/// Exception responses always carry a single payload byte: the code.
pub(crate) const EXCEPTION_PAYLOAD: PayloadSize = PayloadSize::Fixed(1);

/// Incrementally updatable Modbus CRC-16 (poly 0x8005, init 0xFFFF,
/// reflected input and output).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CrcContext(u16);

impl Default for CrcContext {
    fn default() -> Self {
        Self(0xFFFF)
    }
}

impl CrcContext {
    pub(crate) fn update(&mut self, data: &[u8]) {
        let mut crc = self.0;
        for x in data {
            crc ^= u16::from(*x);
            for _ in 0..8 {
                let crc_odd = (crc & 0x0001) != 0;
                crc >>= 1;
                if crc_odd {
                    crc ^= 0xA001;
                }
            }
        }
        self.0 = crc;
    }

    /// The CRC value; the low byte is transmitted first.
    pub(crate) fn finish(self) -> u16 {
        self.0
    }
}

pub(crate) fn calc_crc(data: &[u8]) -> u16 {
    let mut ctx = CrcContext::default();
    ctx.update(data);
    ctx.finish()
}

/// LRC: two's complement of the unsigned 8 bit sum of the raw bytes.
pub(crate) fn calc_lrc(data: &[u8]) -> u8 {
    data.iter()
        .fold(0u8, |acc, x| acc.wrapping_add(*x))
        .wrapping_neg()
}

/// Space-separated lowercase hex of a byte sequence, for frame dump logging.
pub(crate) fn hex_dump(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() * 3);
    for byte in data {
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Runtime-selected frame codec, decoding in one direction.
#[derive(Debug)]
pub(crate) enum FrameCodec {
    Rtu(rtu::RtuCodec),
    Ascii(ascii::AsciiCodec),
    Mbap(mbap::MbapCodec),
}

impl FrameCodec {
    /// Codec decoding responses (client side).
    pub(crate) fn client(mode: TransferMode) -> Self {
        Self::new(mode, &CLIENT_ORACLES)
    }

    /// Codec decoding requests (server side).
    pub(crate) fn server(mode: TransferMode) -> Self {
        Self::new(mode, &SERVER_ORACLES)
    }

    fn new(mode: TransferMode, table: &'static OracleTable) -> Self {
        match mode {
            TransferMode::Rtu => Self::Rtu(rtu::RtuCodec::new(table)),
            TransferMode::Ascii => Self::Ascii(ascii::AsciiCodec::new(table)),
            TransferMode::Mbap => Self::Mbap(mbap::MbapCodec::new(table)),
        }
    }

    /// Drop any partially decoded frame state.
    pub(crate) fn reset(&mut self) {
        match self {
            Self::Rtu(codec) => codec.reset(),
            Self::Ascii(codec) => codec.reset(),
            Self::Mbap(codec) => codec.reset(),
        }
    }
}

impl Decoder for FrameCodec {
    type Item = DecodedFrame;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> io::Result<Option<DecodedFrame>> {
        match self {
            Self::Rtu(codec) => codec.decode(buf),
            Self::Ascii(codec) => codec.decode(buf),
            Self::Mbap(codec) => codec.decode(buf),
        }
    }
}

impl Encoder<&Adu> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, adu: &Adu, buf: &mut BytesMut) -> io::Result<()> {
        match self {
            Self::Rtu(codec) => codec.encode(adu, buf),
            Self::Ascii(codec) => codec.encode(adu, buf),
            Self::Mbap(codec) => codec.encode(adu, buf),
        }
    }
}

/// Append the raw function byte at encode time: the exception bit is applied
/// here and nowhere else.
pub(crate) fn raw_function_byte(adu: &Adu) -> u8 {
    if adu.is_exception() {
        adu.function_code() | crate::frame::EXCEPTION_BIT
    } else {
        adu.function_code()
    }
}
