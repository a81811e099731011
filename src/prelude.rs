// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Common types, re-exported in one place.

pub use crate::access::{SingleBitAccess, SixteenBitAccess};

pub use crate::client::{Client, ClientConfig, ClientEvent, RuntimeDiagnosis};

pub use crate::error::{Error, Result};

pub use crate::frame::{
    Address, Adu, Exception, FunctionCode, Quantity, Request, RequestContext, Response,
    ServerAddress, TransferMode, Word,
};

pub use crate::io::{IoDevice, IoEvent, ReconnectableIoDevice};

pub use crate::server::{Server, ServerEvent};
