// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::collections::HashMap;

use bytes::{BufMut, Bytes, BytesMut};

use crate::frame::{Address, Quantity, Word};

/// Maximum quantity of a register read request.
pub const MAX_READ_REGISTERS: Quantity = 125;

/// Maximum quantity of a multiple-register write request.
pub const MAX_WRITE_REGISTERS: Quantity = 123;

/// A view of a contiguous region of sixteen-bit values (holding or input
/// registers): a start address, a quantity and a sparse value map.
///
/// Register values are stored in host order; the big-endian wire
/// representation is applied exclusively by the marshalling methods.
#[derive(Debug, Clone, Default)]
pub struct SixteenBitAccess {
    start_address: Address,
    quantity: Quantity,
    values: HashMap<Address, Word>,
}

impl SixteenBitAccess {
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

    pub fn set_value(&mut self, address: Address, value: Word) {
        self.values.insert(address, value);
    }

    /// The stored register, or `None` if no value has been set.
    #[must_use]
    pub fn value(&self, address: Address) -> Option<Word> {
        self.values.get(&address).copied()
    }

    /// The values of the configured range, in address order, skipping
    /// addresses without a stored value.
    #[must_use]
    pub fn values(&self) -> Vec<Word> {
        (0..self.quantity)
            .filter_map(|i| self.value(self.start_address.wrapping_add(i)))
            .collect()
    }

    /// Request payload of `ReadHoldingRegisters`/`ReadInputRegisters`
    /// (0x03/0x04): `start(2), quantity(2)`. Also the response payload of
    /// `WriteMultipleRegisters`.
    #[must_use]
    pub fn marshal_read_request(&self) -> Bytes {
        let mut data = BytesMut::with_capacity(4);
        data.put_u16(self.start_address);
        data.put_u16(self.quantity);
        data.freeze()
    }

    /// Request payload of `WriteSingleRegister` (0x06): `addr(2), value(2)`.
    #[must_use]
    pub fn marshal_single_write_request(&self) -> Bytes {
        let value = self.value(self.start_address);
        debug_assert!(value.is_some(), "no value set for the start address");
        let mut data = BytesMut::with_capacity(4);
        data.put_u16(self.start_address);
        data.put_u16(value.unwrap_or_default());
        data.freeze()
    }

    /// Request payload of `WriteMultipleRegisters` (0x10):
    /// `start(2), quantity(2), count(1), values`, where `count = quantity * 2`.
    #[must_use]
    pub fn marshal_multiple_write_request(&self) -> Bytes {
        debug_assert!((1..=MAX_WRITE_REGISTERS).contains(&self.quantity));
        let mut data = BytesMut::with_capacity(5 + usize::from(self.quantity) * 2);
        data.put_u16(self.start_address);
        data.put_u16(self.quantity);
        #[allow(clippy::cast_possible_truncation)]
        data.put_u8((self.quantity * 2) as u8);
        for i in 0..self.quantity {
            let address = self.start_address.wrapping_add(i);
            data.put_u16(self.value(address).unwrap_or_default());
        }
        data.freeze()
    }

    /// Response payload of a register read: `count(1), values`, where
    /// `count = quantity * 2`. Absent registers encode as zero.
    #[must_use]
    pub fn marshal_read_response(&self) -> Bytes {
        let mut data = BytesMut::with_capacity(1 + usize::from(self.quantity) * 2);
        #[allow(clippy::cast_possible_truncation)]
        data.put_u8((self.quantity * 2) as u8);
        for i in 0..self.quantity {
            let address = self.start_address.wrapping_add(i);
            data.put_u16(self.value(address).unwrap_or_default());
        }
        data.freeze()
    }

    /// Parse a read request payload (`start, quantity`) into this access.
    pub fn unmarshal_address_quantity(&mut self, data: &[u8]) -> bool {
        if data.len() < 4 {
            return false;
        }
        let quantity = u16::from_be_bytes([data[2], data[3]]);
        if !(1..=MAX_READ_REGISTERS).contains(&quantity) {
            return false;
        }
        self.start_address = u16::from_be_bytes([data[0], data[1]]);
        self.quantity = quantity;
        true
    }

    /// Parse a single-register write request payload into this access.
    pub fn unmarshal_single_write_request(&mut self, data: &[u8]) -> bool {
        if data.len() < 4 {
            return false;
        }
        self.start_address = u16::from_be_bytes([data[0], data[1]]);
        self.quantity = 1;
        self.set_value(self.start_address, u16::from_be_bytes([data[2], data[3]]));
        true
    }

    /// Parse a multiple-register write request payload into this access.
    pub fn unmarshal_multiple_write_request(&mut self, data: &[u8]) -> bool {
        if data.len() < 5 {
            return false;
        }
        let quantity = u16::from_be_bytes([data[2], data[3]]);
        if !(1..=MAX_WRITE_REGISTERS).contains(&quantity) {
            return false;
        }
        let count = usize::from(data[4]);
        if count % 2 != 0 || count != usize::from(quantity) * 2 || data.len() < 5 + count {
            return false;
        }
        self.start_address = u16::from_be_bytes([data[0], data[1]]);
        self.quantity = quantity;
        for i in 0..quantity {
            let offset = 5 + usize::from(i) * 2;
            let value = u16::from_be_bytes([data[offset], data[offset + 1]]);
            self.set_value(self.start_address.wrapping_add(i), value);
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
        if count % 2 != 0 || count != usize::from(self.quantity) * 2 || data.len() < 1 + count {
            return false;
        }
        for i in 0..self.quantity {
            let offset = 1 + usize::from(i) * 2;
            let value = u16::from_be_bytes([data[offset], data[offset + 1]]);
            self.set_value(self.start_address.wrapping_add(i), value);
        }
        true
    }
}
