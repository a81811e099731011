// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Library Error type

use thiserror::Error;

use crate::frame::{Exception, FunctionCode};

/// A specialized [`Result`](std::result::Result) type for this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Engine-surface errors.
#[derive(Debug, Error)]
pub enum Error {
    /// A Modbus exception, either received from the peer or synthesized
    /// locally (timeout, integrity failure).
    #[error("Modbus exception: {0}")]
    Exception(#[from] Exception),

    /// A convenience API was called with a function code it does not cover.
    #[error("invalid function code: 0x{0:0>2X}")]
    InvalidFunctionCode(FunctionCode),

    /// The client session task is no longer running.
    #[error("client session has terminated")]
    ClientGone,

    /// General I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
