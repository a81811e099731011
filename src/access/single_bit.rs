// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::collections::HashMap;

use bytes::{BufMut, Bytes, BytesMut};

use super::{pack_bits, packed_bits_len, unpack_bits};
use crate::frame::{Address, Quantity};

/// Maximum quantity of a single-bit read request.
pub const MAX_READ_BITS: Quantity = 2000;

/// Maximum quantity of a multiple-coil write request.
pub const MAX_WRITE_BITS: Quantity = 1968;

/// A view of a contiguous region of single-bit values (coils or discrete
/// inputs): a start address, a quantity and a sparse value map.
///
/// An address without an entry in the map reads as "absent"; marshalled
/// responses encode absent bits as `Off`.
#[derive(Debug, Clone, Default)]
pub struct SingleBitAccess {
    start_address: Address,
    quantity: Quantity,
    values: HashMap<Address, bool>,
}

impl SingleBitAccess {
    #[must_use]
    pub fn new(start_address: Address, quantity: Quantity) -> Self {
        Self {
            start_address,
            quantity,
            values: HashMap::new(),
        }
    }

    #[must_use]
    pub fn start_address(&self) -> Address {
        self.start_address
    }

    pub fn set_start_address(&mut self, start_address: Address) {
        self.start_address = start_address;
    }

    #[must_use]
    pub fn quantity(&self) -> Quantity {
        self.quantity
    }

    pub fn set_quantity(&mut self, quantity: Quantity) {
        self.quantity = quantity;
    }

    pub fn set_value(&mut self, address: Address, value: bool) {
        self.values.insert(address, value);
    }

    /// The stored bit, or `None` if no value has been set for the address.
    #[must_use]
    pub fn value(&self, address: Address) -> Option<bool> {
        self.values.get(&address).copied()
    }

    /// The values of the configured range, in address order, skipping
    /// addresses without a stored value.
    #[must_use]
    pub fn values(&self) -> Vec<bool> {
        (0..self.quantity)
            .filter_map(|i| self.value(self.start_address.wrapping_add(i)))
            .collect()
    }

    /// Request payload of `ReadCoils`/`ReadDiscreteInputs` (0x01/0x02).
    #[must_use]
    pub fn marshal_read_request(&self) -> Bytes {
        self.marshal_address_quantity()
    }

    /// `start(2), quantity(2)`, big-endian. Also the response payload of
    /// `WriteMultipleCoils`.
    #[must_use]
    pub fn marshal_address_quantity(&self) -> Bytes {
        let mut data = BytesMut::with_capacity(4);
        data.put_u16(self.start_address);
        data.put_u16(self.quantity);
        data.freeze()
    }

    /// Request payload of `WriteSingleCoil` (0x05): `addr(2), 0xFF00/0x0000`.
    #[must_use]
    pub fn marshal_single_write_request(&self) -> Bytes {
        let value = self.value(self.start_address);
        debug_assert!(value.is_some(), "no value set for the start address");
        let mut data = BytesMut::with_capacity(4);
        data.put_u16(self.start_address);
        data.put_u16(if value.unwrap_or_default() {
            0xFF00
        } else {
            0x0000
        });
        data.freeze()
    }

    /// Request payload of `WriteMultipleCoils` (0x0F):
    /// `start(2), quantity(2), count(1), packed bits`.
    #[must_use]
    pub fn marshal_multiple_write_request(&self) -> Bytes {
        debug_assert!((1..=MAX_WRITE_BITS).contains(&self.quantity));
        let mut data = BytesMut::with_capacity(5 + packed_bits_len(usize::from(self.quantity)));
        data.put_u16(self.start_address);
        data.put_u16(self.quantity);
        #[allow(clippy::cast_possible_truncation)]
        data.put_u8(packed_bits_len(usize::from(self.quantity)) as u8);
        let mut packed = Vec::with_capacity(packed_bits_len(usize::from(self.quantity)));
        pack_bits(
            (0..self.quantity)
                .map(|i| self.value(self.start_address.wrapping_add(i)).unwrap_or_default()),
            &mut packed,
        );
        data.put_slice(&packed);
        data.freeze()
    }

    /// Response payload of `ReadCoils`/`ReadDiscreteInputs`:
    /// `count(1), packed bits`. Absent bits encode as `Off`.
    #[must_use]
    pub fn marshal_read_response(&self) -> Bytes {
        let packed_len = packed_bits_len(usize::from(self.quantity));
        let mut data = BytesMut::with_capacity(1 + packed_len);
        #[allow(clippy::cast_possible_truncation)]
        data.put_u8(packed_len as u8);
        let mut packed = Vec::with_capacity(packed_len);
        pack_bits(
            (0..self.quantity)
                .map(|i| self.value(self.start_address.wrapping_add(i)).unwrap_or_default()),
            &mut packed,
        );
        data.put_slice(&packed);
        data.freeze()
    }

    /// Parse a read request payload into this access.
    pub fn unmarshal_read_request(&mut self, data: &[u8]) -> bool {
        if data.len() < 4 {
            return false;
        }
        let quantity = u16::from_be_bytes([data[2], data[3]]);
        if !(1..=MAX_READ_BITS).contains(&quantity) {
            return false;
        }
        self.start_address = u16::from_be_bytes([data[0], data[1]]);
        self.quantity = quantity;
        true
    }

    /// Parse a single-coil write request payload into this access.
    pub fn unmarshal_single_write_request(&mut self, data: &[u8]) -> bool {
        if data.len() < 4 {
            return false;
        }
        self.start_address = u16::from_be_bytes([data[0], data[1]]);
        self.quantity = 1;
        let value = match (data[2], data[3]) {
            (0xFF, 0x00) => true,
            (0x00, 0x00) => false,
            _ => return false,
        };
        self.set_value(self.start_address, value);
        true
    }

    /// Parse a multiple-coil write request payload into this access.
    pub fn unmarshal_multiple_write_request(&mut self, data: &[u8]) -> bool {
        if data.len() < 5 {
            return false;
        }
        let quantity = u16::from_be_bytes([data[2], data[3]]);
        if !(1..=MAX_WRITE_BITS).contains(&quantity) {
            return false;
        }
        let count = usize::from(data[4]);
        if count != packed_bits_len(usize::from(quantity)) || data.len() < 5 + count {
            return false;
        }
        self.start_address = u16::from_be_bytes([data[0], data[1]]);
        self.quantity = quantity;
        for (i, bit) in unpack_bits(&data[5..5 + count], usize::from(quantity))
            .into_iter()
            .enumerate()
        {
            #[allow(clippy::cast_possible_truncation)]
            self.set_value(self.start_address.wrapping_add(i as u16), bit);
        }
        true
    }

    /// Parse a read response payload into this access. The start address and
    /// quantity must have been set beforehand (they are not on the wire).
    pub fn unmarshal_read_response(&mut self, data: &[u8]) -> bool {
        if data.is_empty() {
            return false;
        }
        let count = usize::from(data[0]);
        if count != packed_bits_len(usize::from(self.quantity)) || data.len() < 1 + count {
            return false;
        }
        for (i, bit) in unpack_bits(&data[1..1 + count], usize::from(self.quantity))
            .into_iter()
            .enumerate()
        {
            #[allow(clippy::cast_possible_truncation)]
            self.set_value(self.start_address.wrapping_add(i as u16), bit);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marshal_read_request() {
        let access = SingleBitAccess::new(0x000A, 3);
        assert_eq!(&access.marshal_read_request()[..], &[0x00, 0x0A, 0x00, 0x03]);
    }

    #[test]
    fn marshal_single_write_request() {
        let mut access = SingleBitAccess::new(0x1234, 1);
        access.set_value(0x1234, true);
        assert_eq!(
            &access.marshal_single_write_request()[..],
            &[0x12, 0x34, 0xFF, 0x00]
        );

        access.set_value(0x1234, false);
        assert_eq!(
            &access.marshal_single_write_request()[..],
            &[0x12, 0x34, 0x00, 0x00]
        );
    }

    #[test]
    fn marshal_multiple_write_request() {
        let mut access = SingleBitAccess::new(0x3311, 4);
        for (i, value) in [true, false, true, true].into_iter().enumerate() {
            access.set_value(0x3311 + i as u16, value);
        }
        assert_eq!(
            &access.marshal_multiple_write_request()[..],
            &[0x33, 0x11, 0x00, 0x04, 0x01, 0b_0000_1101]
        );
    }

    #[test]
    fn marshal_read_response() {
        let mut access = SingleBitAccess::new(0x000A, 3);
        access.set_value(0x000A, true);
        access.set_value(0x000B, false);
        access.set_value(0x000C, true);
        assert_eq!(&access.marshal_read_response()[..], &[0x01, 0x05]);
    }

    #[test]
    fn marshal_read_response_absent_bits_are_off() {
        let access = SingleBitAccess::new(0, 9);
        assert_eq!(&access.marshal_read_response()[..], &[0x02, 0x00, 0x00]);
    }

    #[test]
    fn unmarshal_read_request() {
        let mut access = SingleBitAccess::default();
        assert!(access.unmarshal_read_request(&[0x00, 0x0A, 0x00, 0x03]));
        assert_eq!(access.start_address(), 0x000A);
        assert_eq!(access.quantity(), 3);

        assert!(!access.unmarshal_read_request(&[0x00, 0x0A, 0x00]));
        // zero and oversize quantities are rejected
        assert!(!access.unmarshal_read_request(&[0x00, 0x00, 0x00, 0x00]));
        assert!(!access.unmarshal_read_request(&[0x00, 0x00, 0x07, 0xD1]));
        assert!(access.unmarshal_read_request(&[0x00, 0x00, 0x07, 0xD0]));
    }

    #[test]
    fn unmarshal_single_write_request() {
        let mut access = SingleBitAccess::default();
        assert!(access.unmarshal_single_write_request(&[0x00, 0x01, 0xFF, 0x00]));
        assert_eq!(access.start_address(), 1);
        assert_eq!(access.quantity(), 1);
        assert_eq!(access.value(1), Some(true));

        assert!(access.unmarshal_single_write_request(&[0x00, 0x02, 0x00, 0x00]));
        assert_eq!(access.value(2), Some(false));

        // any other value word is malformed
        assert!(!access.unmarshal_single_write_request(&[0x00, 0x01, 0xFF, 0x01]));
        assert!(!access.unmarshal_single_write_request(&[0x00, 0x01, 0x12, 0x34]));
    }

    #[test]
    fn unmarshal_multiple_write_request() {
        let mut access = SingleBitAccess::default();
        assert!(access.unmarshal_multiple_write_request(&[
            0x33,
            0x11,
            0x00,
            0x04,
            0x01,
            0b_0000_1101
        ]));
        assert_eq!(access.start_address(), 0x3311);
        assert_eq!(access.quantity(), 4);
        assert_eq!(access.values(), &[true, false, true, true]);

        // byte count must match the quantity
        assert!(!access.unmarshal_multiple_write_request(&[
            0x33,
            0x11,
            0x00,
            0x04,
            0x02,
            0b_0000_1101
        ]));
        // truncated bitmap
        assert!(!access.unmarshal_multiple_write_request(&[0x33, 0x11, 0x00, 0x09, 0x02, 0xFF]));
    }

    #[test]
    fn unmarshal_read_response() {
        let mut access = SingleBitAccess::new(0x000A, 3);
        assert!(access.unmarshal_read_response(&[0x01, 0x05]));
        assert_eq!(access.value(0x000A), Some(true));
        assert_eq!(access.value(0x000B), Some(false));
        assert_eq!(access.value(0x000C), Some(true));
        assert_eq!(access.values(), &[true, false, true]);

        assert!(!access.unmarshal_read_response(&[]));
        assert!(!access.unmarshal_read_response(&[0x02, 0x05]));
        assert!(!access.unmarshal_read_response(&[0x01]));
    }
}
