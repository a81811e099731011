// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Optional per-client runtime observability.

use std::collections::BTreeMap;

use bytes::Bytes;

use crate::frame::{Exception, FunctionCode, ServerAddress};

/// One distinct failure, keyed by (function code, error, request frame).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorRecord {
    function_code: FunctionCode,
    error: Exception,
    request_frame: Bytes,
    occurrence_count: usize,
}

impl ErrorRecord {
    #[must_use]
    pub fn function_code(&self) -> FunctionCode {
        self.function_code
    }

    #[must_use]
    pub fn error(&self) -> Exception {
        self.error
    }

    #[must_use]
    pub fn request_frame(&self) -> &[u8] {
        &self.request_frame
    }

    #[must_use]
    pub fn occurrence_count(&self) -> usize {
        self.occurrence_count
    }

    fn matches(&self, function_code: FunctionCode, error: Exception, request_frame: &[u8]) -> bool {
        self.function_code == function_code
            && self.error == error
            && self.request_frame == request_frame
    }
}

/// The error records accumulated for one server address.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerDiagnosis {
    error_records: Vec<ErrorRecord>,
}

impl ServerDiagnosis {
    #[must_use]
    pub fn error_records(&self) -> &[ErrorRecord] {
        &self.error_records
    }

    fn insert(&mut self, function_code: FunctionCode, error: Exception, request_frame: &[u8]) {
        if let Some(record) = self
            .error_records
            .iter_mut()
            .find(|record| record.matches(function_code, error, request_frame))
        {
            record.occurrence_count += 1;
            return;
        }
        self.error_records.push(ErrorRecord {
            function_code,
            error,
            request_frame: Bytes::copy_from_slice(request_frame),
            occurrence_count: 1,
        });
    }
}

/// Counts of total/failed frames plus per-server error records. Append only;
/// bounded by the cardinality of distinct (function code, error, frame)
/// tuples per server.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeDiagnosis {
    total_frame_numbers: usize,
    servers: BTreeMap<ServerAddress, ServerDiagnosis>,
}

impl RuntimeDiagnosis {
    #[must_use]
    pub fn total_frame_numbers(&self) -> usize {
        self.total_frame_numbers
    }

    #[must_use]
    pub fn failed_frame_numbers(&self) -> usize {
        self.servers
            .values()
            .flat_map(|server| server.error_records())
            .map(ErrorRecord::occurrence_count)
            .sum()
    }

    #[must_use]
    pub fn successful_frame_numbers(&self) -> usize {
        self.total_frame_numbers() - self.failed_frame_numbers()
    }

    #[must_use]
    pub fn servers(&self) -> &BTreeMap<ServerAddress, ServerDiagnosis> {
        &self.servers
    }

    pub(crate) fn increment_total_frame_numbers(&mut self) {
        self.total_frame_numbers += 1;
    }

    pub(crate) fn insert_error_record(
        &mut self,
        server_address: ServerAddress,
        function_code: FunctionCode,
        error: Exception,
        request_frame: &[u8],
    ) {
        self.increment_total_frame_numbers();
        self.servers
            .entry(server_address)
            .or_default()
            .insert(function_code, error, request_frame);
    }
}
