// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::io;

use byteorder::{BigEndian, ByteOrder};
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::frame::{Adu, Exception};

use super::{raw_function_byte, DecodedFrame, OracleTable, PayloadSize};

const MBAP_HEADER_LEN: usize = 6;

const PROTOCOL_ID: u16 = 0x0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    Mbap,
    ServerAddress,
    FunctionCode,
    Data,
    End,
}

/// Resumable MBAP (Modbus TCP) frame codec.
///
/// Same field sequence as RTU but preceded by the 6 byte MBAP header and
/// without a CRC. The transaction id of a decoded frame is preserved on the
/// ADU so a server can copy it verbatim into its response.
#[derive(Debug)]
pub(crate) struct MbapCodec {
    table: &'static OracleTable,
    state: DecodeState,
    adu: Adu,
    body_len: usize,
    oracle: PayloadSize,
    error: Option<Exception>,
}

impl MbapCodec {
    pub(crate) fn new(table: &'static OracleTable) -> Self {
        Self {
            table,
            state: DecodeState::Mbap,
            adu: Adu::default(),
            body_len: 0,
            oracle: super::EXCEPTION_PAYLOAD,
            error: None,
        }
    }

    pub(crate) fn reset(&mut self) {
        self.state = DecodeState::Mbap;
        self.adu = Adu::default();
        self.body_len = 0;
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

impl Decoder for MbapCodec {
    type Item = DecodedFrame;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> io::Result<Option<DecodedFrame>> {
        while !buf.is_empty() || self.state == DecodeState::End {
            match self.state {
                DecodeState::Mbap => {
                    if buf.len() < MBAP_HEADER_LEN {
                        return Ok(None);
                    }
                    let header = buf.split_to(MBAP_HEADER_LEN);
                    self.adu
                        .set_transaction_id(BigEndian::read_u16(&header[0..2]));
                    let protocol_id = BigEndian::read_u16(&header[2..4]);
                    if protocol_id != PROTOCOL_ID {
                        // Not a Modbus frame; consume it per its declared
                        // length but flag the integrity failure.
                        log::warn!("Invalid MBAP protocol identifier: {protocol_id}");
                        self.error = Some(Exception::StorageParity);
                    }
                    self.body_len = usize::from(BigEndian::read_u16(&header[4..6]));
                    self.state = DecodeState::ServerAddress;
                }
                DecodeState::ServerAddress => {
                    if buf.len() < self.body_len {
                        return Ok(None);
                    }
                    let server_address = buf.get_u8();
                    self.adu.set_server_address(server_address);
                    self.state = DecodeState::FunctionCode;
                }
                DecodeState::FunctionCode => {
                    let function = buf.get_u8();
                    self.adu.set_function_code(function);
                    self.state = DecodeState::Data;

                    let oracle = if self.adu.is_exception() {
                        Some(super::EXCEPTION_PAYLOAD)
                    } else {
                        self.table.lookup(self.adu.function_code())
                    };
                    match oracle {
                        Some(oracle) => self.oracle = oracle,
                        None => {
                            if self.error.is_none() {
                                self.error = Some(Exception::IllegalFunction);
                            }
                            self.state = DecodeState::End;
                        }
                    }
                }
                DecodeState::Data => {
                    let Some(size) = self.oracle.check(buf) else {
                        return Ok(None);
                    };
                    let data = buf.split_to(size).freeze();
                    self.adu.set_data(data);
                    if self.error.is_none() && self.adu.is_exception() {
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

impl Encoder<&Adu> for MbapCodec {
    type Error = io::Error;

    #[allow(clippy::cast_possible_truncation)]
    fn encode(&mut self, adu: &Adu, buf: &mut BytesMut) -> io::Result<()> {
        buf.reserve(adu.pdu_len() + MBAP_HEADER_LEN);
        buf.put_u16(adu.transaction_id());
        buf.put_u16(PROTOCOL_ID);
        buf.put_u16((adu.data().len() + 2) as u16);
        buf.put_u8(adu.server_address());
        buf.put_u8(raw_function_byte(adu));
        buf.put_slice(adu.data());
        Ok(())
    }
}
