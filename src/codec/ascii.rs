// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! ASCII transfer mode.
//!
//! Frame shape: `':' <uppercase hex of (server || function || payload || LRC)> CR LF`.
//! A frame is only consumed once its CRLF terminator has been received, so
//! partial input never destroys decoder state.

use std::io;

use bytes::{BufMut, BytesMut};
use smallvec::SmallVec;
use tokio_util::codec::{Decoder, Encoder};

use crate::frame::{Adu, Exception};

use super::{calc_lrc, raw_function_byte, DecodedFrame, OracleTable, MAX_FRAME_LEN};

/// `':'` + two hex chars per binary byte + CRLF.
const MAX_ASCII_FRAME_LEN: usize = 1 + 2 * (MAX_FRAME_LEN + 1) + 2;

type Scratch = SmallVec<[u8; MAX_FRAME_LEN]>;

#[derive(Debug)]
pub(crate) struct AsciiCodec {
    table: &'static OracleTable,
}

impl AsciiCodec {
    pub(crate) fn new(table: &'static OracleTable) -> Self {
        Self { table }
    }

    pub(crate) fn reset(&mut self) {
        // All state lives in the caller's buffer until CRLF arrives.
    }

    fn parse_frame(&self, interior: &[u8]) -> DecodedFrame {
        let corrupt = |adu: Adu| DecodedFrame {
            adu,
            error: Some(Exception::StorageParity),
        };

        if interior.first() != Some(&b':') {
            return corrupt(Adu::default());
        }
        let Some(binary) = decode_hex(&interior[1..]) else {
            return corrupt(Adu::default());
        };
        // server address + function code + LRC at minimum
        if binary.len() < 3 {
            return corrupt(Adu::default());
        }

        let (body, lrc) = binary.split_at(binary.len() - 1);
        let mut adu = Adu::new(body[0], body[1]);
        let payload = &body[2..];

        if calc_lrc(body) != lrc[0] {
            adu.set_data(payload.to_vec());
            return corrupt(adu);
        }

        let oracle = if adu.is_exception() {
            Some(super::EXCEPTION_PAYLOAD)
        } else {
            self.table.lookup(adu.function_code())
        };
        let Some(oracle) = oracle else {
            return DecodedFrame {
                adu,
                error: Some(Exception::IllegalFunction),
            };
        };
        if oracle.check(payload) != Some(payload.len()) {
            adu.set_data(payload.to_vec());
            return corrupt(adu);
        }

        adu.set_data(payload.to_vec());
        let error = adu.exception();
        DecodedFrame { adu, error }
    }
}

impl Decoder for AsciiCodec {
    type Item = DecodedFrame;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> io::Result<Option<DecodedFrame>> {
        let Some(end) = find_crlf(buf) else {
            if buf.len() > MAX_ASCII_FRAME_LEN {
                // No terminator within the longest legal frame; the line is
                // desynchronized. Drop the garbage and report it.
                log::warn!(
                    "Dropping {} bytes of unterminated ASCII input",
                    buf.len()
                );
                buf.clear();
                return Ok(Some(DecodedFrame {
                    adu: Adu::default(),
                    error: Some(Exception::StorageParity),
                }));
            }
            return Ok(None);
        };

        let frame_bytes = buf.split_to(end + 2);
        let interior = &frame_bytes[..end];
        Ok(Some(self.parse_frame(interior)))
    }
}

impl Encoder<&Adu> for AsciiCodec {
    type Error = io::Error;

    fn encode(&mut self, adu: &Adu, buf: &mut BytesMut) -> io::Result<()> {
        let mut binary = Scratch::new();
        binary.push(adu.server_address());
        binary.push(raw_function_byte(adu));
        binary.extend_from_slice(adu.data());
        binary.push(calc_lrc(&binary));

        buf.reserve(1 + 2 * binary.len() + 2);
        buf.put_u8(b':');
        for byte in &binary {
            buf.put_u8(HEX_UPPER[usize::from(byte >> 4)]);
            buf.put_u8(HEX_UPPER[usize::from(byte & 0x0F)]);
        }
        buf.put_slice(b"\r\n");
        Ok(())
    }
}

const HEX_UPPER: &[u8; 16] = b"0123456789ABCDEF";

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|pair| pair == b"\r\n")
}

fn decode_hex(chars: &[u8]) -> Option<Scratch> {
    if chars.len() % 2 != 0 {
        return None;
    }
    let mut out = Scratch::new();
    for pair in chars.chunks_exact(2) {
        let hi = hex_value(pair[0])?;
        let lo = hex_value(pair[1])?;
        out.push(hi << 4 | lo);
    }
    Some(out)
}

fn hex_value(ch: u8) -> Option<u8> {
    match ch {
        b'0'..=b'9' => Some(ch - b'0'),
        b'A'..=b'F' => Some(ch - b'A' + 10),
        b'a'..=b'f' => Some(ch - b'a' + 10),
        _ => None,
    }
}
