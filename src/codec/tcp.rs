// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! MBAP framing for Modbus/TCP.

use std::io::{Error, ErrorKind, Result};

use byteorder::{BigEndian, ByteOrder};
use bytes::{BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{error::DecodeError, frame::tcp::*};

const HEADER_LEN: usize = 7;

const PROTOCOL_ID: u16 = 0x0000; // TCP

// The length field counts the unit id byte plus 1..=253 bytes of PDU.
const MAX_LEN: usize = 254;

/// Streaming MBAP codec.
///
/// Decoding is resumable over arbitrary splits of the byte stream: the
/// codec buffers until the 7-byte header and the announced body are
/// complete and only then yields a frame. It owns no state beyond the
/// caller-provided buffer.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct ClientCodec;

impl Decoder for ClientCodec {
    type Item = (Header, Bytes);
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<(Header, Bytes)>> {
        if buf.len() < HEADER_LEN {
            return Ok(None);
        }

        let len = usize::from(BigEndian::read_u16(&buf[4..6]));
        if len == 0 {
            // Too short to even hold the unit id; the stream is
            // considered desynchronized beyond recovery.
            return Err(Error::new(ErrorKind::InvalidData, DecodeError::Truncated));
        }
        if len > MAX_LEN {
            // The peer cannot legally announce such a frame; the stream
            // is considered desynchronized beyond recovery.
            return Err(Error::new(ErrorKind::InvalidData, DecodeError::OversizedFrame));
        }
        if buf.len() < HEADER_LEN - 1 + len {
            return Ok(None);
        }

        let header_data = buf.split_to(HEADER_LEN);

        let protocol_id = BigEndian::read_u16(&header_data[2..4]);
        if protocol_id != PROTOCOL_ID {
            // Suspect frame. It is still passed upward: a client only
            // acts on transaction ids it has outstanding, so unknown
            // traffic is dropped there.
            log::warn!("Suspect frame with protocol identifier {protocol_id} != {PROTOCOL_ID}");
        }

        let transaction_id = BigEndian::read_u16(&header_data[0..2]);
        let unit_id = header_data[6];

        let header = Header {
            transaction_id,
            unit_id,
        };

        let pdu_data = buf.split_to(len - 1).freeze();

        Ok(Some((header, pdu_data)))
    }
}

impl Encoder<RequestAdu> for ClientCodec {
    type Error = Error;

    fn encode(&mut self, adu: RequestAdu, buf: &mut BytesMut) -> Result<()> {
        let RequestAdu { hdr, pdu } = adu;
        let pdu_data: Bytes = pdu.into();
        debug_assert!(!pdu_data.is_empty() && pdu_data.len() + 1 <= MAX_LEN);
        buf.reserve(pdu_data.len() + HEADER_LEN);
        buf.put_u16(hdr.transaction_id);
        buf.put_u16(PROTOCOL_ID);
        buf.put_u16(u16_len(pdu_data.len() + 1));
        buf.put_u8(hdr.unit_id);
        buf.put_slice(&pdu_data);
        Ok(())
    }
}

#[allow(clippy::cast_possible_truncation)]
fn u16_len(len: usize) -> u16 {
    debug_assert!(len <= usize::from(u16::MAX));
    len as u16
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Request;

    fn encode_frame(transaction_id: u16, unit_id: u8, req: Request) -> BytesMut {
        let mut codec = ClientCodec;
        let mut buf = BytesMut::new();
        let adu = RequestAdu {
            hdr: Header {
                transaction_id,
                unit_id,
            },
            pdu: req.into(),
        };
        codec.encode(adu, &mut buf).unwrap();
        buf
    }

    #[test]
    fn encode_read_request() {
        let buf = encode_frame(0x0001, 0x01, Request::ReadHoldingRegisters(0x0000, 10));
        assert_eq!(
            &buf[..],
            &[0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03, 0x00, 0x00, 0x00, 0x0A]
        );
    }

    #[test]
    fn decode_header_fragment() {
        let mut codec = ClientCodec;
        let mut buf = BytesMut::from(&[0x00, 0x11, 0x00, 0x00, 0x00, 0x03][..]);
        let res = codec.decode(&mut buf).unwrap();
        assert!(res.is_none());
        assert_eq!(buf.len(), 6);
    }

    #[test]
    fn decode_partly_received_message() {
        let mut codec = ClientCodec;
        let mut buf = BytesMut::from(
            &[
                0x10, // transaction id HI
                0x01, // transaction id LO
                0x00, // protocol id HI
                0x00, // protocol id LO
                0x00, // length HI
                0x03, // length LO
                0xFE, // unit id
                0x02, // function code
            ][..],
        );
        let res = codec.decode(&mut buf).unwrap();
        assert!(res.is_none());
        assert_eq!(buf.len(), 8);
    }

    #[test]
    fn decode_exception_message() {
        let mut codec = ClientCodec;
        let mut buf = BytesMut::from(
            &[
                0x10, 0x01, // transaction id
                0x00, 0x00, // protocol id
                0x00, 0x03, // length
                0xFE, // unit id
                0x82, 0x03, // exception PDU
                0x00, // trailing byte of the next frame
            ][..],
        );

        let (hdr, pdu_data) = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(hdr.transaction_id, 0x1001);
        assert_eq!(hdr.unit_id, 0xFE);
        assert_eq!(&pdu_data[..], &[0x82, 0x03]);
        assert_eq!(buf.len(), 1);
    }

    #[test]
    fn decode_with_suspect_protocol_id() {
        let mut codec = ClientCodec;
        let mut buf = BytesMut::from(
            &[
                0x10, 0x01, // transaction id
                0x33, 0x12, // protocol id (suspect)
                0x00, 0x03, // length
                0x66, // unit id
                0x82, 0x03, // exception PDU
            ][..],
        );
        // Suspect frames are emitted anyway; the dispatcher drops them
        // if the transaction id is unknown.
        let (hdr, pdu_data) = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(hdr.transaction_id, 0x1001);
        assert_eq!(&pdu_data[..], &[0x82, 0x03]);
    }

    #[test]
    fn decode_oversized_length() {
        let mut codec = ClientCodec;
        // length = 255 > 254
        let mut buf = BytesMut::from(&[0x00, 0x01, 0x00, 0x00, 0x00, 0xFF, 0x01][..]);
        let err = codec.decode(&mut buf).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
        let inner = err.get_ref().unwrap().downcast_ref::<DecodeError>();
        assert_eq!(inner, Some(&DecodeError::OversizedFrame));
    }

    #[test]
    fn decode_zero_length() {
        let mut codec = ClientCodec;
        let mut buf = BytesMut::from(&[0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x01][..]);
        let err = codec.decode(&mut buf).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
        let inner = err.get_ref().unwrap().downcast_ref::<DecodeError>();
        assert_eq!(inner, Some(&DecodeError::Truncated));
    }

    #[test]
    fn decode_is_split_insensitive() {
        // Two concatenated frames, fed in one shot and then again one
        // byte at a time, must yield identical results.
        let mut stream = Vec::new();
        stream.extend_from_slice(&encode_frame(
            0x0001,
            0x01,
            Request::ReadHoldingRegisters(0x0000, 10),
        ));
        stream.extend_from_slice(&encode_frame(0x0002, 0x11, Request::ReadCoils(0x0013, 19)));

        let mut codec = ClientCodec;
        let mut buf = BytesMut::from(&stream[..]);
        let mut one_shot = Vec::new();
        while let Some(frame) = codec.decode(&mut buf).unwrap() {
            one_shot.push(frame);
        }
        assert!(buf.is_empty());
        assert_eq!(one_shot.len(), 2);

        let mut codec = ClientCodec;
        let mut buf = BytesMut::new();
        let mut dribbled = Vec::new();
        for byte in stream {
            buf.put_u8(byte);
            while let Some(frame) = codec.decode(&mut buf).unwrap() {
                dribbled.push(frame);
            }
        }
        assert_eq!(one_shot, dribbled);
    }
}
