// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::io;

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::frame::{Adu, Exception};

use super::{raw_function_byte, CrcContext, DecodedFrame, OracleTable, PayloadSize};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    ServerAddress,
    FunctionCode,
    Data,
    CrcLow,
    CrcHigh,
    End,
}

/// Resumable RTU frame codec.
///
/// Decoding runs the state machine `ServerAddress -> FunctionCode -> Data ->
/// CrcLow -> CrcHigh -> End`, feeding every consumed byte into an incremental
/// CRC. A frame whose CRC check fails is still delivered, flagged with
/// [`Exception::StorageParity`].
#[derive(Debug)]
pub(crate) struct RtuCodec {
    table: &'static OracleTable,
    state: DecodeState,
    adu: Adu,
    crc: CrcContext,
    crc_low: u8,
    oracle: PayloadSize,
    error: Option<Exception>,
}

impl RtuCodec {
    pub(crate) fn new(table: &'static OracleTable) -> Self {
        Self {
            table,
            state: DecodeState::ServerAddress,
            adu: Adu::default(),
            crc: CrcContext::default(),
            crc_low: 0,
            oracle: super::EXCEPTION_PAYLOAD,
            error: None,
        }
    }

    pub(crate) fn reset(&mut self) {
        self.state = DecodeState::ServerAddress;
        self.adu = Adu::default();
        self.crc = CrcContext::default();
        self.crc_low = 0;
        self.error = None;
    }

    fn finish_frame(&mut self) -> DecodedFrame {
        let frame = DecodedFrame {
            adu: std::mem::take(&mut self.adu),
            error: self.error.take(),
        };
        self.reset();
        frame
    }
}

impl Decoder for RtuCodec {
    type Item = DecodedFrame;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> io::Result<Option<DecodedFrame>> {
        while !buf.is_empty() || self.state == DecodeState::End {
            match self.state {
                DecodeState::ServerAddress => {
                    let server_address = buf.get_u8();
                    self.adu.set_server_address(server_address);
                    self.crc.update(&[server_address]);
                    self.state = DecodeState::FunctionCode;
                }
                DecodeState::FunctionCode => {
                    let function = buf.get_u8();
                    self.adu.set_function_code(function);
                    self.crc.update(&[function]);
                    self.state = DecodeState::Data;

                    let oracle = if self.adu.is_exception() {
                        Some(super::EXCEPTION_PAYLOAD)
                    } else {
                        self.table.lookup(self.adu.function_code())
                    };
                    match oracle {
                        Some(oracle) => self.oracle = oracle,
                        None => {
                            self.error = Some(Exception::IllegalFunction);
                            self.state = DecodeState::End;
                        }
                    }
                }
                DecodeState::Data => {
                    let Some(size) = self.oracle.check(buf) else {
                        return Ok(None);
                    };
                    let data = buf.split_to(size).freeze();
                    self.crc.update(&data);
                    self.adu.set_data(data);
                    self.state = DecodeState::CrcLow;
                }
                DecodeState::CrcLow => {
                    self.crc_low = buf.get_u8();
                    self.state = DecodeState::CrcHigh;
                }
                DecodeState::CrcHigh => {
                    let crc_high = buf.get_u8();
                    let crc = self.crc.finish();
                    if self.crc_low != (crc & 0xFF) as u8 || crc_high != (crc >> 8) as u8 {
                        self.error = Some(Exception::StorageParity);
                    } else if self.adu.is_exception() {
                        self.error = self.adu.exception();
                    }
                    self.state = DecodeState::End;
                }
                DecodeState::End => {
                    return Ok(Some(self.finish_frame()));
                }
            }
        }
        Ok(None)
    }
}

impl Encoder<&Adu> for RtuCodec {
    type Error = io::Error;

    fn encode(&mut self, adu: &Adu, buf: &mut BytesMut) -> io::Result<()> {
        buf.reserve(adu.pdu_len() + 2);
        let start = buf.len();
        buf.put_u8(adu.server_address());
        buf.put_u8(raw_function_byte(adu));
        buf.put_slice(adu.data());
        let crc = super::calc_crc(&buf[start..]);
        buf.put_u8((crc & 0xFF) as u8);
        buf.put_u8((crc >> 8) as u8);
        Ok(())
    }
}
