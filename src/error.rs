// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Library error types

use thiserror::Error;

use crate::{frame::Exception, transport::DisconnectCause};

/// A specialized [`Result`](std::result::Result) type for Modbus operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The single error surface of a Modbus call.
///
/// Every failure mode of a request is reported as a value through the
/// awaited call, never as a panic and never out-of-band.
#[derive(Debug, Error)]
pub enum Error {
    /// An address, quantity or value constraint was violated before
    /// anything was sent.
    #[error("invalid request argument: {0}")]
    InvalidArgument(&'static str),

    /// The deadline elapsed before a matching response arrived.
    #[error("request timed out")]
    Timeout,

    /// The transport disconnected while the request was outstanding.
    #[error("connection lost: {0}")]
    ConnectionLost(DisconnectCause),

    /// The server answered with a Modbus exception.
    #[error("Modbus exception: {0}")]
    Exception(Exception),

    /// The response (or frame) could not be decoded.
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// All 65536 transaction identifiers are bound to in-flight requests.
    #[error("transaction identifier space exhausted")]
    TooManyOutstanding,

    /// The caller abandoned the request before it completed.
    #[error("request cancelled")]
    Cancelled,
}

/// Why a PDU or frame failed to decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// The input ended before the PDU was complete.
    #[error("truncated protocol data unit")]
    Truncated,

    /// A quantity field lies outside the range the function code allows.
    #[error("quantity out of range")]
    QuantityOutOfRange,

    /// A byte-count field disagrees with the accompanying payload.
    #[error("byte count mismatch")]
    ByteCountMismatch,

    /// The function code is not part of the supported catalogue.
    #[error("unsupported function code 0x{0:02X}")]
    UnsupportedFunction(u8),

    /// A single-coil value was neither `0x0000` nor `0xFF00`.
    #[error("invalid coil value 0x{0:04X}")]
    InvalidCoilValue(u16),

    /// An RTU frame failed its CRC check.
    #[error("CRC mismatch: expected 0x{expected:04X}, actual 0x{actual:04X}")]
    CrcMismatch {
        /// CRC carried by the frame.
        expected: u16,
        /// CRC computed over the received bytes.
        actual: u16,
    },

    /// A frame claims a length the protocol does not permit; the byte
    /// stream is considered desynchronized.
    #[error("oversized frame")]
    OversizedFrame,

    /// The response carries a different function code than the request.
    #[error("unexpected function code: expected 0x{expected:02X}, actual 0x{actual:02X}")]
    FunctionCodeMismatch {
        /// Function code of the originating request.
        expected: u8,
        /// Function code found in the response.
        actual: u8,
    },

    /// The response is well-formed but does not correspond to the request.
    #[error("response does not match the request")]
    UnexpectedResponse,
}
