// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Bit-exact encoding and decoding of protocol data units.
//!
//! Encodings for the same function code differ by direction, so requests
//! and responses are decoded by separate entry points. Frame-level
//! concerns (MBAP headers, CRC trailers) live in the transport-specific
//! submodules.

#[cfg(feature = "rtu")]
pub(crate) mod rtu;

#[cfg(feature = "tcp")]
pub(crate) mod tcp;

use std::io::Cursor;

use byteorder::{BigEndian, ReadBytesExt};
use bytes::{BufMut, Bytes, BytesMut};

use crate::{
    error::DecodeError,
    frame::{Coil, Exception, ExceptionResponse, Request, RequestPdu, Response, ResponsePdu},
};

/// Quantity limits per the Modbus application protocol v1.1b3.
pub(crate) const MAX_READ_BITS: u16 = 2000;
pub(crate) const MAX_READ_WORDS: u16 = 125;
pub(crate) const MAX_WRITE_BITS: u16 = 1968;
pub(crate) const MAX_WRITE_WORDS: u16 = 123;
pub(crate) const MAX_RW_WRITE_WORDS: u16 = 121;

impl From<Request> for Bytes {
    fn from(req: Request) -> Bytes {
        use crate::frame::Request::*;
        let cnt = request_byte_count(&req);
        let mut data = BytesMut::with_capacity(cnt);
        data.put_u8(req.function_code().value());
        match req {
            ReadCoils(address, quantity)
            | ReadDiscreteInputs(address, quantity)
            | ReadInputRegisters(address, quantity)
            | ReadHoldingRegisters(address, quantity) => {
                data.put_u16(address);
                data.put_u16(quantity);
            }
            WriteSingleCoil(address, state) => {
                data.put_u16(address);
                data.put_u16(bool_to_coil(state));
            }
            WriteMultipleCoils(address, coils) => {
                data.put_u16(address);
                data.put_u16(u16_len(coils.len()));
                let packed_coils = pack_coils(&coils);
                data.put_u8(u8_len(packed_coils.len()));
                for b in packed_coils {
                    data.put_u8(b);
                }
            }
            WriteSingleRegister(address, word) => {
                data.put_u16(address);
                data.put_u16(word);
            }
            WriteMultipleRegisters(address, words) => {
                data.put_u16(address);
                data.put_u16(u16_len(words.len()));
                data.put_u8(u8_len(words.len() * 2));
                for w in words {
                    data.put_u16(w);
                }
            }
            MaskWriteRegister(address, and_mask, or_mask) => {
                data.put_u16(address);
                data.put_u16(and_mask);
                data.put_u16(or_mask);
            }
            ReadWriteMultipleRegisters(read_address, quantity, write_address, words) => {
                data.put_u16(read_address);
                data.put_u16(quantity);
                data.put_u16(write_address);
                data.put_u16(u16_len(words.len()));
                data.put_u8(u8_len(words.len() * 2));
                for w in words {
                    data.put_u16(w);
                }
            }
        }
        data.freeze()
    }
}

impl From<RequestPdu> for Bytes {
    fn from(pdu: RequestPdu) -> Bytes {
        pdu.0.into()
    }
}

impl From<Response> for Bytes {
    fn from(rsp: Response) -> Bytes {
        use crate::frame::Response::*;
        let cnt = response_byte_count(&rsp);
        let mut data = BytesMut::with_capacity(cnt);
        data.put_u8(rsp.function_code().value());
        match rsp {
            ReadCoils(coils) | ReadDiscreteInputs(coils) => {
                let packed_coils = pack_coils(&coils);
                data.put_u8(u8_len(packed_coils.len()));
                for b in packed_coils {
                    data.put_u8(b);
                }
            }
            ReadInputRegisters(registers)
            | ReadHoldingRegisters(registers)
            | ReadWriteMultipleRegisters(registers) => {
                data.put_u8(u8_len(registers.len() * 2));
                for r in registers {
                    data.put_u16(r);
                }
            }
            WriteSingleCoil(address, state) => {
                data.put_u16(address);
                data.put_u16(bool_to_coil(state));
            }
            WriteMultipleCoils(address, quantity) | WriteMultipleRegisters(address, quantity) => {
                data.put_u16(address);
                data.put_u16(quantity);
            }
            WriteSingleRegister(address, word) => {
                data.put_u16(address);
                data.put_u16(word);
            }
            MaskWriteRegister(address, and_mask, or_mask) => {
                data.put_u16(address);
                data.put_u16(and_mask);
                data.put_u16(or_mask);
            }
        }
        data.freeze()
    }
}

impl From<ExceptionResponse> for Bytes {
    fn from(ex: ExceptionResponse) -> Bytes {
        let mut data = BytesMut::with_capacity(2);
        debug_assert!(ex.function < 0x80);
        data.put_u8(ex.function | 0x80);
        data.put_u8(ex.exception.code());
        data.freeze()
    }
}

impl From<ResponsePdu> for Bytes {
    fn from(pdu: ResponsePdu) -> Bytes {
        pdu.0.map_or_else(Into::into, Into::into)
    }
}

impl TryFrom<Bytes> for Request {
    type Error = DecodeError;

    fn try_from(bytes: Bytes) -> Result<Self, DecodeError> {
        use crate::frame::Request::*;
        let mut rdr = Cursor::new(&bytes[..]);
        let fn_code = read_u8(&mut rdr)?;
        let req = match fn_code {
            0x01 => {
                let address = read_u16(&mut rdr)?;
                let quantity = read_u16(&mut rdr)?;
                check_quantity(quantity, MAX_READ_BITS)?;
                ReadCoils(address, quantity)
            }
            0x02 => {
                let address = read_u16(&mut rdr)?;
                let quantity = read_u16(&mut rdr)?;
                check_quantity(quantity, MAX_READ_BITS)?;
                ReadDiscreteInputs(address, quantity)
            }
            0x03 => {
                let address = read_u16(&mut rdr)?;
                let quantity = read_u16(&mut rdr)?;
                check_quantity(quantity, MAX_READ_WORDS)?;
                ReadHoldingRegisters(address, quantity)
            }
            0x04 => {
                let address = read_u16(&mut rdr)?;
                let quantity = read_u16(&mut rdr)?;
                check_quantity(quantity, MAX_READ_WORDS)?;
                ReadInputRegisters(address, quantity)
            }
            0x05 => {
                let address = read_u16(&mut rdr)?;
                let state = coil_to_bool(read_u16(&mut rdr)?)?;
                WriteSingleCoil(address, state)
            }
            0x06 => WriteSingleRegister(read_u16(&mut rdr)?, read_u16(&mut rdr)?),
            0x0F => {
                let address = read_u16(&mut rdr)?;
                let quantity = read_u16(&mut rdr)?;
                check_quantity(quantity, MAX_WRITE_BITS)?;
                let byte_count = read_u8(&mut rdr)?;
                if usize::from(byte_count) != packed_coils_len(usize::from(quantity)) {
                    return Err(DecodeError::ByteCountMismatch);
                }
                let packed = read_slice(&bytes, &mut rdr, usize::from(byte_count))?;
                WriteMultipleCoils(address, unpack_coils(packed, quantity))
            }
            0x10 => {
                let address = read_u16(&mut rdr)?;
                let quantity = read_u16(&mut rdr)?;
                check_quantity(quantity, MAX_WRITE_WORDS)?;
                let byte_count = read_u8(&mut rdr)?;
                if usize::from(byte_count) != usize::from(quantity) * 2 {
                    return Err(DecodeError::ByteCountMismatch);
                }
                let words = read_words(&mut rdr, quantity)?;
                WriteMultipleRegisters(address, words)
            }
            0x16 => MaskWriteRegister(
                read_u16(&mut rdr)?,
                read_u16(&mut rdr)?,
                read_u16(&mut rdr)?,
            ),
            0x17 => {
                let read_address = read_u16(&mut rdr)?;
                let read_quantity = read_u16(&mut rdr)?;
                check_quantity(read_quantity, MAX_READ_WORDS)?;
                let write_address = read_u16(&mut rdr)?;
                let write_quantity = read_u16(&mut rdr)?;
                check_quantity(write_quantity, MAX_RW_WRITE_WORDS)?;
                let byte_count = read_u8(&mut rdr)?;
                if usize::from(byte_count) != usize::from(write_quantity) * 2 {
                    return Err(DecodeError::ByteCountMismatch);
                }
                let words = read_words(&mut rdr, write_quantity)?;
                ReadWriteMultipleRegisters(read_address, read_quantity, write_address, words)
            }
            fn_code => return Err(DecodeError::UnsupportedFunction(fn_code)),
        };
        check_consumed(&bytes, &rdr)?;
        Ok(req)
    }
}

impl TryFrom<Bytes> for RequestPdu {
    type Error = DecodeError;

    fn try_from(bytes: Bytes) -> Result<Self, DecodeError> {
        let pdu = Request::try_from(bytes)?.into();
        Ok(pdu)
    }
}

impl TryFrom<Bytes> for Response {
    type Error = DecodeError;

    fn try_from(bytes: Bytes) -> Result<Self, DecodeError> {
        use crate::frame::Response::*;
        let mut rdr = Cursor::new(&bytes[..]);
        let fn_code = read_u8(&mut rdr)?;
        let rsp = match fn_code {
            0x01 | 0x02 => {
                let byte_count = read_u8(&mut rdr)?;
                let packed = read_slice(&bytes, &mut rdr, usize::from(byte_count))?;
                // The requested quantity is unknown at this layer, so
                // all bits of every received byte are unpacked. The
                // caller truncates to the quantity it asked for.
                let quantity = u16::from(byte_count) * 8;
                let coils = unpack_coils(packed, quantity);
                if fn_code == 0x01 {
                    ReadCoils(coils)
                } else {
                    ReadDiscreteInputs(coils)
                }
            }
            0x03 | 0x04 | 0x17 => {
                let byte_count = read_u8(&mut rdr)?;
                if byte_count % 2 != 0 {
                    return Err(DecodeError::ByteCountMismatch);
                }
                let words = read_words(&mut rdr, u16::from(byte_count) / 2)?;
                match fn_code {
                    0x03 => ReadHoldingRegisters(words),
                    0x04 => ReadInputRegisters(words),
                    _ => ReadWriteMultipleRegisters(words),
                }
            }
            0x05 => {
                let address = read_u16(&mut rdr)?;
                let state = coil_to_bool(read_u16(&mut rdr)?)?;
                WriteSingleCoil(address, state)
            }
            0x06 => WriteSingleRegister(read_u16(&mut rdr)?, read_u16(&mut rdr)?),
            0x0F => WriteMultipleCoils(read_u16(&mut rdr)?, read_u16(&mut rdr)?),
            0x10 => WriteMultipleRegisters(read_u16(&mut rdr)?, read_u16(&mut rdr)?),
            0x16 => MaskWriteRegister(
                read_u16(&mut rdr)?,
                read_u16(&mut rdr)?,
                read_u16(&mut rdr)?,
            ),
            fn_code => return Err(DecodeError::UnsupportedFunction(fn_code)),
        };
        check_consumed(&bytes, &rdr)?;
        Ok(rsp)
    }
}

impl TryFrom<Bytes> for ExceptionResponse {
    type Error = DecodeError;

    fn try_from(bytes: Bytes) -> Result<Self, DecodeError> {
        let mut rdr = Cursor::new(&bytes[..]);
        let fn_err_code = read_u8(&mut rdr)?;
        if fn_err_code < 0x80 {
            return Err(DecodeError::UnsupportedFunction(fn_err_code));
        }
        let exception = Exception::from_code(read_u8(&mut rdr)?);
        check_consumed(&bytes, &rdr)?;
        Ok(ExceptionResponse {
            function: fn_err_code - 0x80,
            exception,
        })
    }
}

impl TryFrom<Bytes> for ResponsePdu {
    type Error = DecodeError;

    fn try_from(bytes: Bytes) -> Result<Self, DecodeError> {
        let fn_code = *bytes.first().ok_or(DecodeError::Truncated)?;
        let pdu = if fn_code < 0x80 {
            Response::try_from(bytes)?.into()
        } else {
            ExceptionResponse::try_from(bytes)?.into()
        };
        Ok(pdu)
    }
}

fn read_u8(rdr: &mut Cursor<&[u8]>) -> Result<u8, DecodeError> {
    rdr.read_u8().map_err(|_| DecodeError::Truncated)
}

fn read_u16(rdr: &mut Cursor<&[u8]>) -> Result<u16, DecodeError> {
    rdr.read_u16::<BigEndian>()
        .map_err(|_| DecodeError::Truncated)
}

fn read_words(rdr: &mut Cursor<&[u8]>, quantity: u16) -> Result<Vec<u16>, DecodeError> {
    let mut words = Vec::with_capacity(usize::from(quantity));
    for _ in 0..quantity {
        words.push(read_u16(rdr)?);
    }
    Ok(words)
}

/// Borrow `len` bytes at the cursor position and advance past them.
fn read_slice<'a>(
    bytes: &'a Bytes,
    rdr: &mut Cursor<&[u8]>,
    len: usize,
) -> Result<&'a [u8], DecodeError> {
    #[allow(clippy::cast_possible_truncation)]
    let start = rdr.position() as usize;
    let slice = bytes
        .get(start..start + len)
        .ok_or(DecodeError::Truncated)?;
    rdr.set_position((start + len) as u64);
    Ok(slice)
}

/// Reject trailing bytes after a fully decoded PDU.
fn check_consumed(bytes: &Bytes, rdr: &Cursor<&[u8]>) -> Result<(), DecodeError> {
    if rdr.position() != bytes.len() as u64 {
        return Err(DecodeError::ByteCountMismatch);
    }
    Ok(())
}

fn check_quantity(quantity: u16, max: u16) -> Result<(), DecodeError> {
    if quantity == 0 || quantity > max {
        return Err(DecodeError::QuantityOutOfRange);
    }
    Ok(())
}

fn bool_to_coil(state: bool) -> u16 {
    if state {
        0xFF00
    } else {
        0x0000
    }
}

fn coil_to_bool(coil: u16) -> Result<bool, DecodeError> {
    match coil {
        0xFF00 => Ok(true),
        0x0000 => Ok(false),
        coil => Err(DecodeError::InvalidCoilValue(coil)),
    }
}

pub(crate) fn packed_coils_len(bitcount: usize) -> usize {
    (bitcount + 7) / 8
}

/// Pack bits LSB-first; unused high bits of the last byte stay zero.
pub(crate) fn pack_coils(coils: &[Coil]) -> Vec<u8> {
    let mut res = vec![0; packed_coils_len(coils.len())];
    for (i, b) in coils.iter().enumerate() {
        let v = u8::from(*b);
        res[i / 8] |= v << (i % 8);
    }
    res
}

pub(crate) fn unpack_coils(bytes: &[u8], count: u16) -> Vec<Coil> {
    let mut res = Vec::with_capacity(usize::from(count));
    for i in 0..usize::from(count) {
        res.push((bytes[i / 8] >> (i % 8)) & 0b1 > 0);
    }
    res
}

fn request_byte_count(req: &Request) -> usize {
    use crate::frame::Request::*;
    1 + match *req {
        ReadCoils(_, _)
        | ReadDiscreteInputs(_, _)
        | ReadInputRegisters(_, _)
        | ReadHoldingRegisters(_, _)
        | WriteSingleRegister(_, _)
        | WriteSingleCoil(_, _) => 4,
        WriteMultipleCoils(_, ref coils) => 5 + packed_coils_len(coils.len()),
        WriteMultipleRegisters(_, ref words) => 5 + words.len() * 2,
        MaskWriteRegister(_, _, _) => 6,
        ReadWriteMultipleRegisters(_, _, _, ref words) => 9 + words.len() * 2,
    }
}

fn response_byte_count(rsp: &Response) -> usize {
    use crate::frame::Response::*;
    1 + match *rsp {
        ReadCoils(ref coils) | ReadDiscreteInputs(ref coils) => 1 + packed_coils_len(coils.len()),
        ReadInputRegisters(ref words)
        | ReadHoldingRegisters(ref words)
        | ReadWriteMultipleRegisters(ref words) => 1 + words.len() * 2,
        WriteSingleCoil(_, _)
        | WriteMultipleCoils(_, _)
        | WriteMultipleRegisters(_, _)
        | WriteSingleRegister(_, _) => 4,
        MaskWriteRegister(_, _, _) => 6,
    }
}

#[allow(clippy::cast_possible_truncation)]
fn u8_len(len: usize) -> u8 {
    debug_assert!(len <= usize::from(u8::MAX));
    len as u8
}

#[allow(clippy::cast_possible_truncation)]
fn u16_len(len: usize) -> u16 {
    debug_assert!(len <= usize::from(u16::MAX));
    len as u16
}
